//! Query engine: the seven structured queries over the index artifacts.
//!
//! Results are plain JSON values plus a `meta` block with scan counters and
//! timings. A process-local TTL cache is keyed on the canonical hash of
//! `(query, params, options, apiIndexHash, depsHash)`, so any artifact drift
//! naturally misses; expired entries are swept lazily on access.

use crate::config::{MindConfig, PathMode};
use crate::embed::{GenerateOptions, LlmClient};
use crate::error::{MindError, Result};
use crate::hash::{estimate_tokens, hash_value, sha256_hex};
use crate::storage::FsStorage;
use crate::types::*;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Impact,
    Scope,
    Exports,
    Externals,
    Chain,
    Meta,
    Docs,
}

impl QueryKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "impact" => Some(Self::Impact),
            "scope" => Some(Self::Scope),
            "exports" => Some(Self::Exports),
            "externals" => Some(Self::Externals),
            "chain" => Some(Self::Chain),
            "meta" => Some(Self::Meta),
            "docs" => Some(Self::Docs),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Impact => "impact",
            Self::Scope => "scope",
            Self::Exports => "exports",
            Self::Externals => "externals",
            Self::Chain => "chain",
            Self::Meta => "meta",
            Self::Docs => "docs",
        }
    }
}

/// Per-query parameters; which ones are required depends on the query.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Local,
    /// CI runs disable the cache entirely.
    Ci,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit: usize,
    pub depth: usize,
    pub cache_ttl_secs: u64,
    pub cache_mode: CacheMode,
    pub no_cache: bool,
    pub path_mode: PathMode,
    pub ai_mode: bool,
}

impl QueryOptions {
    pub fn from_config(config: &MindConfig) -> Self {
        Self {
            limit: config.query.limit,
            depth: config.query.depth,
            cache_ttl_secs: config.query.cache_ttl_secs,
            cache_mode: CacheMode::Local,
            no_cache: false,
            path_mode: config.query.path_mode,
            ai_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMs {
    pub load: u64,
    pub filter: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub cwd: String,
    pub query_id: String,
    pub tokens_estimate: usize,
    pub cached: bool,
    pub files_scanned: usize,
    pub edges_touched: usize,
    pub deps_hash: String,
    pub api_hash: String,
    pub timing_ms: TimingMs,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub result: Value,
    pub meta: QueryMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggest_next_queries: Option<Vec<String>>,
}

struct CacheEntry {
    result: Value,
    files_scanned: usize,
    edges_touched: usize,
    at: Instant,
    ttl_secs: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct QueryEngine {
    root: PathBuf,
    storage: FsStorage,
    cache: DashMap<String, CacheEntry>,
    llm: Option<Box<dyn LlmClient>>,
}

impl QueryEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let storage = FsStorage::new(&root);
        Self { root, storage, cache: DashMap::new(), llm: None }
    }

    /// Attach an optional text-generation capability for AI mode.
    pub fn with_llm(mut self, llm: Box<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn execute(
        &self,
        kind: QueryKind,
        params: &QueryParams,
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        let total_start = Instant::now();
        require_params(kind, params)?;

        // Manifest hashes drive both cache keys and staleness.
        let manifest: MindIndex = read_artifact(&self.storage, INDEX_FILE)?;
        let api_hash = manifest.api_index_hash.clone();
        let deps_hash = manifest.deps_hash.clone();

        let use_cache = !options.no_cache && options.cache_mode == CacheMode::Local;
        let cache_key = cache_fingerprint(kind, params, options, &api_hash, &deps_hash);

        // Lazy sweep: expired entries go on access, whoever touches them.
        self.cache.retain(|_, entry| entry.at.elapsed().as_secs() <= entry.ttl_secs);

        if use_cache {
            if let Some(entry) = self.cache.get(&cache_key) {
                let result = entry.result.clone();
                let meta = self.build_meta(
                    &result,
                    true,
                    entry.files_scanned,
                    entry.edges_touched,
                    &api_hash,
                    &deps_hash,
                    0,
                    total_start,
                );
                let (summary, suggest) = self.enrich(kind, params, &result, options);
                return Ok(QueryResponse { result, meta, summary, suggest_next_queries: suggest });
            }
        }

        let load_start = Instant::now();
        let artifacts = self.load_artifacts(kind)?;
        let load_ms = load_start.elapsed().as_millis() as u64;

        let mut counters = Counters::default();
        let result = self.run_query(kind, params, options, &artifacts, &mut counters)?;

        if use_cache {
            self.cache.insert(
                cache_key,
                CacheEntry {
                    result: result.clone(),
                    files_scanned: counters.files_scanned,
                    edges_touched: counters.edges_touched,
                    at: Instant::now(),
                    ttl_secs: options.cache_ttl_secs,
                },
            );
        }

        let meta = self.build_meta(
            &result,
            false,
            counters.files_scanned,
            counters.edges_touched,
            &api_hash,
            &deps_hash,
            load_ms,
            total_start,
        );
        let (summary, suggest) = self.enrich(kind, params, &result, options);
        Ok(QueryResponse { result, meta, summary, suggest_next_queries: suggest })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_meta(
        &self,
        result: &Value,
        cached: bool,
        files_scanned: usize,
        edges_touched: usize,
        api_hash: &str,
        deps_hash: &str,
        load_ms: u64,
        total_start: Instant,
    ) -> QueryMeta {
        let total = total_start.elapsed().as_millis() as u64;
        QueryMeta {
            cwd: self.root.to_string_lossy().into_owned(),
            query_id: Uuid::new_v4().to_string(),
            tokens_estimate: estimate_tokens(&result.to_string()),
            cached,
            files_scanned,
            edges_touched,
            deps_hash: deps_hash.to_string(),
            api_hash: api_hash.to_string(),
            timing_ms: TimingMs { load: load_ms, filter: total.saturating_sub(load_ms), total },
        }
    }

    fn load_artifacts(&self, kind: QueryKind) -> Result<Artifacts> {
        let api = matches!(kind, QueryKind::Impact | QueryKind::Scope | QueryKind::Exports)
            .then(|| read_artifact::<ApiIndex>(&self.storage, API_INDEX_FILE))
            .transpose()?;
        let deps = matches!(
            kind,
            QueryKind::Impact | QueryKind::Externals | QueryKind::Chain | QueryKind::Meta
        )
        .then(|| read_artifact::<DepsGraph>(&self.storage, DEPS_FILE))
        .transpose()?;
        let docs = matches!(kind, QueryKind::Scope | QueryKind::Docs)
            .then(|| read_artifact::<DocsIndex>(&self.storage, DOCS_FILE))
            .transpose()?;
        let meta = matches!(kind, QueryKind::Meta)
            .then(|| read_artifact::<ProjectMeta>(&self.storage, META_FILE))
            .transpose()?;
        Ok(Artifacts { api, deps, docs, meta })
    }

    fn run_query(
        &self,
        kind: QueryKind,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        match kind {
            QueryKind::Impact => self.query_impact(params, options, artifacts, counters),
            QueryKind::Scope => self.query_scope(params, options, artifacts, counters),
            QueryKind::Exports => self.query_exports(params, artifacts, counters),
            QueryKind::Externals => self.query_externals(params, options, artifacts, counters),
            QueryKind::Chain => self.query_chain(params, options, artifacts, counters),
            QueryKind::Meta => self.query_meta(params, artifacts),
            QueryKind::Docs => self.query_docs(params, options, artifacts, counters),
        }
    }

    // -----------------------------------------------------------------------
    // Individual queries
    // -----------------------------------------------------------------------

    /// Importers of `file`, with the symbols each one imports.
    fn query_impact(
        &self,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let file = params.file.as_deref().unwrap();
        let deps = artifacts.deps.as_ref().unwrap();
        counters.edges_touched = deps.edges.len();

        let mut importers: Vec<Value> = Vec::new();
        for edge in deps.edges.iter().filter(|e| e.to == file) {
            importers.push(json!({
                "file": self.render_path(&edge.from, options.path_mode),
                "symbols": edge.symbols,
            }));
            if importers.len() >= options.limit {
                break;
            }
        }
        counters.files_scanned = importers.len();
        Ok(json!({
            "file": file,
            "importers": importers,
            "count": importers.len(),
        }))
    }

    /// Files under an internal path prefix.
    fn query_scope(
        &self,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let prefix = params.path.as_deref().unwrap().trim_end_matches('/');
        let api = artifacts.api.as_ref().unwrap();
        let docs = artifacts.docs.as_ref().unwrap();

        let mut files: Vec<&String> = api
            .files
            .keys()
            .chain(docs.docs.iter().map(|d| &d.path))
            .filter(|p| p.as_str() == prefix || p.starts_with(&format!("{prefix}/")))
            .collect();
        files.sort();
        files.dedup();
        counters.files_scanned = api.files.len() + docs.docs.len();

        let listed: Vec<String> = files
            .iter()
            .take(options.limit)
            .map(|p| self.render_path(p, options.path_mode))
            .collect();
        Ok(json!({
            "path": prefix,
            "files": listed,
            "count": files.len(),
        }))
    }

    /// Export list for one file.
    fn query_exports(
        &self,
        params: &QueryParams,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let file = params.file.as_deref().unwrap();
        let api = artifacts.api.as_ref().unwrap();
        counters.files_scanned = 1;
        let Some(api_file) = api.files.get(file) else {
            return Err(MindError::Query { detail: format!("{file} is not in the API index") });
        };
        Ok(json!({
            "file": file,
            "exports": serde_json::to_value(&api_file.exports).unwrap_or_default(),
            "sha256": api_file.sha256,
            "count": api_file.exports.len(),
        }))
    }

    /// External package → referencing files, optionally scoped to a path
    /// prefix.
    fn query_externals(
        &self,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let deps = artifacts.deps.as_ref().unwrap();
        counters.edges_touched = deps.edges.len();
        let scope = params.scope.as_deref().map(|s| s.trim_end_matches('/'));

        let mut by_package: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in &deps.edges {
            if edge.target != TargetKind::External {
                continue;
            }
            if let Some(prefix) = scope {
                if !(edge.from.starts_with(&format!("{prefix}/")) || edge.from == prefix) {
                    continue;
                }
            }
            let files = by_package.entry(edge.to.clone()).or_default();
            if !files.contains(&edge.from) {
                files.push(edge.from.clone());
            }
        }
        for files in by_package.values_mut() {
            files.sort();
            for f in files.iter_mut() {
                *f = self.render_path(f, options.path_mode);
            }
        }
        counters.files_scanned = by_package.values().map(Vec::len).sum();
        Ok(json!({
            "externals": by_package,
            "count": by_package.len(),
        }))
    }

    /// Transitive forward dependency chain from `file`.
    fn query_chain(
        &self,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let file = params.file.as_deref().unwrap();
        let deps = artifacts.deps.as_ref().unwrap();
        counters.edges_touched = deps.edges.len();

        // Forward adjacency over internal edges only.
        let mut forward: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &deps.edges {
            if edge.target == TargetKind::Internal {
                forward.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            }
        }

        let mut visited: BTreeMap<&str, usize> = BTreeMap::new();
        let mut frontier: Vec<&str> = vec![file];
        for depth in 1..=options.depth {
            let mut next = Vec::new();
            for node in frontier.drain(..) {
                for target in forward.get(node).into_iter().flatten() {
                    if *target != file && !visited.contains_key(*target) {
                        visited.insert(target, depth);
                        next.push(*target);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut chain: Vec<(usize, &str)> =
            visited.iter().map(|(path, depth)| (*depth, *path)).collect();
        chain.sort();
        chain.truncate(options.limit);
        counters.files_scanned = chain.len();
        let rendered: Vec<Value> = chain
            .iter()
            .map(|(depth, path)| {
                json!({ "file": self.render_path(path, options.path_mode), "depth": depth })
            })
            .collect();
        Ok(json!({
            "file": file,
            "depth": options.depth,
            "chain": rendered,
            "count": rendered.len(),
        }))
    }

    /// Package summary.
    fn query_meta(&self, params: &QueryParams, artifacts: &Artifacts) -> Result<Value> {
        let meta = artifacts.meta.as_ref().unwrap();
        let deps = artifacts.deps.as_ref().unwrap();
        if let Some(product) = params.product.as_deref() {
            if !meta.name.is_empty() && meta.name != product {
                return Ok(json!({ "packages": [] }));
            }
        }
        Ok(json!({
            "packages": [{
                "name": meta.name,
                "modules": meta.modules,
                "exportsCount": meta.exports_count,
                "lastActivity": meta.last_activity,
                "externalDeps": deps.summary.external_deps,
            }],
        }))
    }

    /// Filtered docs listing.
    fn query_docs(
        &self,
        params: &QueryParams,
        options: &QueryOptions,
        artifacts: &Artifacts,
        counters: &mut Counters,
    ) -> Result<Value> {
        let docs = artifacts.docs.as_ref().unwrap();
        counters.files_scanned = docs.docs.len();
        let needle = params.search.as_deref().map(|s| s.to_lowercase());
        let listed: Vec<Value> = docs
            .docs
            .iter()
            .filter(|d| params.tag.as_deref().is_none_or(|t| d.tag == t))
            .filter(|d| params.doc_type.as_deref().is_none_or(|t| d.doc_type == t))
            .filter(|d| {
                needle.as_deref().is_none_or(|n| {
                    d.title.to_lowercase().contains(n) || d.path.to_lowercase().contains(n)
                })
            })
            .take(options.limit)
            .map(|d| {
                json!({
                    "path": self.render_path(&d.path, options.path_mode),
                    "tag": d.tag,
                    "type": d.doc_type,
                    "title": d.title,
                })
            })
            .collect();
        Ok(json!({ "docs": listed, "count": listed.len() }))
    }

    // -----------------------------------------------------------------------
    // AI-mode enrichment
    // -----------------------------------------------------------------------

    /// Optional enrichment: a short LLM summary plus deterministic follow-up
    /// suggestions. Without a configured client both fields stay absent.
    fn enrich(
        &self,
        kind: QueryKind,
        params: &QueryParams,
        result: &Value,
        options: &QueryOptions,
    ) -> (Option<String>, Option<Vec<String>>) {
        if !options.ai_mode {
            return (None, None);
        }
        let Some(llm) = &self.llm else {
            return (None, None);
        };
        let prompt = format!(
            "Summarize this {} query result in one sentence:\n{}",
            kind.name(),
            result
        );
        let summary = llm
            .generate(
                &prompt,
                &GenerateOptions { max_tokens: 80, temperature: 0.0, stop: None },
            )
            .ok()
            .map(|r| r.text);
        (summary, Some(suggest_next(kind, params)))
    }

    fn render_path(&self, path: &str, mode: PathMode) -> String {
        match mode {
            PathMode::Id => path.to_string(),
            PathMode::Absolute => self.root.join(path).to_string_lossy().into_owned(),
        }
    }
}

/// Deterministic follow-up suggestions derived from the query shape.
fn suggest_next(kind: QueryKind, params: &QueryParams) -> Vec<String> {
    let file = params.file.as_deref().unwrap_or("<file>");
    match kind {
        QueryKind::Impact => {
            vec![format!("chain --file {file}"), format!("exports --file {file}")]
        }
        QueryKind::Chain => {
            vec![format!("impact --file {file}"), "externals".to_string()]
        }
        QueryKind::Exports => vec![format!("impact --file {file}")],
        QueryKind::Scope => vec!["meta".to_string(), "docs".to_string()],
        QueryKind::Externals => vec!["meta".to_string()],
        QueryKind::Meta => vec!["externals".to_string(), "docs".to_string()],
        QueryKind::Docs => vec!["scope --path docs".to_string()],
    }
}

// ---------------------------------------------------------------------------
// Validation and cache fingerprint
// ---------------------------------------------------------------------------

struct Artifacts {
    api: Option<ApiIndex>,
    deps: Option<DepsGraph>,
    docs: Option<DocsIndex>,
    meta: Option<ProjectMeta>,
}

#[derive(Default)]
struct Counters {
    files_scanned: usize,
    edges_touched: usize,
}

fn require_params(kind: QueryKind, params: &QueryParams) -> Result<()> {
    let missing = |flag: &str| {
        Err(MindError::InvalidFlag {
            flag: flag.to_string(),
            detail: format!("required by the {} query", kind.name()),
        })
    };
    match kind {
        QueryKind::Impact | QueryKind::Exports | QueryKind::Chain => {
            if params.file.as_deref().unwrap_or("").is_empty() {
                return missing("file");
            }
        }
        QueryKind::Scope => {
            if params.path.as_deref().unwrap_or("").is_empty() {
                return missing("path");
            }
        }
        QueryKind::Externals | QueryKind::Meta | QueryKind::Docs => {}
    }
    Ok(())
}

fn cache_fingerprint(
    kind: QueryKind,
    params: &QueryParams,
    options: &QueryOptions,
    api_hash: &str,
    deps_hash: &str,
) -> String {
    let fingerprint = json!({
        "query": kind.name(),
        "params": serde_json::to_value(params).unwrap_or_default(),
        "options": {
            "limit": options.limit,
            "depth": options.depth,
            "pathMode": match options.path_mode {
                PathMode::Id => "id",
                PathMode::Absolute => "absolute",
            },
            "aiMode": options.ai_mode,
        },
        "apiIndexHash": api_hash,
        "depsHash": deps_hash,
    });
    sha256_hex(hash_value(&fingerprint).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_query_name_is_rejected() {
        assert!(QueryKind::parse("impact").is_some());
        assert!(QueryKind::parse("imploding").is_none());
    }

    #[test]
    fn missing_required_param_is_an_invalid_flag() {
        let err = require_params(QueryKind::Impact, &QueryParams::default()).unwrap_err();
        assert_eq!(err.kind(), "MIND_INVALID_FLAG");
        assert!(require_params(QueryKind::Externals, &QueryParams::default()).is_ok());
    }

    #[test]
    fn fingerprint_changes_with_hashes_and_params() {
        let params = QueryParams { file: Some("src/a.ts".into()), ..Default::default() };
        let options = QueryOptions {
            limit: 500,
            depth: 5,
            cache_ttl_secs: 60,
            cache_mode: CacheMode::Local,
            no_cache: false,
            path_mode: PathMode::Id,
            ai_mode: false,
        };
        let a = cache_fingerprint(QueryKind::Impact, &params, &options, "h1", "h2");
        let b = cache_fingerprint(QueryKind::Impact, &params, &options, "h1", "h3");
        let c = cache_fingerprint(QueryKind::Chain, &params, &options, "h1", "h2");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Cache-control options do not affect the key.
        let mut no_cache = options.clone();
        no_cache.no_cache = true;
        no_cache.cache_ttl_secs = 1;
        let d = cache_fingerprint(QueryKind::Impact, &params, &no_cache, "h1", "h2");
        assert_eq!(a, d);
    }
}
