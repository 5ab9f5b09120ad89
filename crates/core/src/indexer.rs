//! Index build and incremental update orchestration.
//!
//! `init` seeds empty artifacts; `update` walks a candidate file set in
//! sorted order under a wall-clock budget, splicing per-file results into
//! the API index, dependency graph, and docs index, then rewrites every
//! artifact atomically with fresh integrity hashes. Per-file failures land
//! in the report; only artifact-write failures abort.

use crate::chunker::{self, ChunkOptions};
use crate::config::MindConfig;
use crate::deps::{self, DependencyResolver};
use crate::embed::EmbeddingClient;
use crate::error::{MindError, Result};
use crate::exports::extract_exports;
use crate::git::ChangeSource;
use crate::hash::{format_iso8601, hash_value, now_millis, sha256_file, sha256_hex};
use crate::storage::{validate_rel_path, FsStorage, Storage};
use crate::types::*;
use crate::vectors::{FileStamp, StoredMindChunk, VectorStore, META_FILE_HASH, META_MTIME};
use ignore::WalkBuilder;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub const DEFAULT_UPDATE_BUDGET_MS: u64 = 5000;

/// Optional wiring that keeps a vector scope in sync with the index: changed
/// files are chunked and embedded during `update`.
pub struct VectorSync<'a> {
    pub store: &'a VectorStore,
    pub embedder: &'a dyn EmbeddingClient,
    pub scope_id: &'a str,
}

pub struct UpdateOptions<'a> {
    /// Change-source reference to diff against (requires `change_source`).
    pub since: Option<String>,
    /// Explicit changed-file list; takes precedence over `since`.
    pub changed: Option<Vec<String>>,
    pub time_budget_ms: u64,
    /// Re-process files even when their content hash is unchanged.
    pub no_cache: bool,
    pub change_source: Option<&'a dyn ChangeSource>,
    pub vector_sync: Option<VectorSync<'a>>,
}

impl Default for UpdateOptions<'_> {
    fn default() -> Self {
        Self {
            since: None,
            changed: None,
            time_budget_ms: DEFAULT_UPDATE_BUDGET_MS,
            no_cache: false,
            change_source: None,
            vector_sync: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

pub struct Indexer {
    root: PathBuf,
    storage: FsStorage,
    config: MindConfig,
}

fn is_api_lang(ext: &str) -> bool {
    matches!(ext, "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs")
}

impl Indexer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let storage = FsStorage::new(&root);
        let config = MindConfig::load(&root);
        Self { root, storage, config }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MindConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    /// Create `.kb/mind/` with empty artifacts. Refuses to overwrite an
    /// existing index unless `force`; with `force` the operation is
    /// idempotent.
    pub fn init(&self, force: bool) -> Result<String> {
        if self.storage.exists(INDEX_FILE) && !force {
            return Err(MindError::InvalidFlag {
                flag: "force".to_string(),
                detail: format!("{MIND_DIR} already contains an index; pass force to overwrite"),
            });
        }
        self.storage.mkdir(MIND_DIR)?;
        let api = ApiIndex::empty();
        let deps = DepsGraph::empty();
        let diff = RecentDiff::empty();
        let meta = ProjectMeta::empty();
        let docs = DocsIndex::empty();
        self.write_all(&api, &deps, &diff, &meta, &docs)?;
        Ok(MIND_DIR.to_string())
    }

    // -----------------------------------------------------------------------
    // update
    // -----------------------------------------------------------------------

    pub fn update(&self, opts: &UpdateOptions) -> Result<UpdateReport> {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(opts.time_budget_ms);

        if !self.storage.exists(INDEX_FILE) {
            return Err(MindError::NoIndex { path: MIND_DIR.to_string() });
        }
        let mut api: ApiIndex = read_artifact(&self.storage, API_INDEX_FILE)?;
        let mut deps_graph: DepsGraph = read_artifact(&self.storage, DEPS_FILE)?;
        let mut docs: DocsIndex = read_artifact(&self.storage, DOCS_FILE)?;
        let mut recent_diff: RecentDiff = read_artifact(&self.storage, RECENT_DIFF_FILE)?;

        let mut report = UpdateReport {
            budget: BudgetReport { used_ms: 0, limit_ms: opts.time_budget_ms },
            ..UpdateReport::default()
        };

        // 1. Candidate set, in deterministic path order.
        let vector_langs = opts.vector_sync.is_some();
        let candidates: Vec<String> = if let Some(changed) = &opts.changed {
            let mut list: Vec<String> = Vec::with_capacity(changed.len());
            for path in changed {
                list.push(validate_rel_path(path)?);
            }
            list.sort();
            list.dedup();
            list
        } else if let (Some(since), Some(source)) = (&opts.since, opts.change_source) {
            let mut files = source.diff_since(&self.root, since)?;
            files.sort_by(|a, b| a.path.cmp(&b.path));
            report.diff = Some(DiffCounts { files: files.len() });
            let list = files.iter().map(|f| f.path.clone()).collect();
            recent_diff = RecentDiff {
                schema_version: SCHEMA_VERSION.to_string(),
                generator: GENERATOR.to_string(),
                since: Some(since.clone()),
                files,
            };
            list
        } else {
            // Full walk, plus currently-indexed paths so deletions are seen.
            let mut set: BTreeSet<String> = self.walk_workspace(vector_langs).into_iter().collect();
            set.extend(api.files.keys().cloned());
            set.extend(docs.docs.iter().map(|d| d.path.clone()));
            set.into_iter().collect()
        };

        // 2. Per-file processing with an elapsed-time check before each file.
        let resolver = DependencyResolver::new(&self.root);
        let (_, packages) = deps::load_packages(&self.root);
        let mut sync_chunks: Vec<StoredMindChunk> = Vec::new();
        let mut changed_stamps: BTreeMap<String, FileStamp> = BTreeMap::new();
        let mut removed_paths: BTreeSet<String> = BTreeSet::new();

        for path in &candidates {
            if Instant::now() >= deadline {
                report.partial = true;
                warn!(processed = report.api.added + report.api.updated, "time budget exhausted");
                break;
            }
            if let Err(e) = self.process_file(
                path,
                opts,
                &resolver,
                &packages,
                &mut api,
                &mut deps_graph,
                &mut docs,
                &mut report,
                &mut sync_chunks,
                &mut changed_stamps,
                &mut removed_paths,
            ) {
                report.errors.push(FileError { path: path.clone(), message: e.to_string() });
            }
        }

        // 3. Summaries.
        deps_graph.packages = packages;
        deps::recompute_summary(&mut deps_graph);
        docs.docs.sort_by(|a, b| a.path.cmp(&b.path));
        docs.docs.dedup_by(|a, b| a.path == b.path);
        let meta = self.compute_meta(&api);

        // 4. Atomic artifact rewrite with fresh hashes.
        self.write_all(&api, &deps_graph, &recent_diff, &meta, &docs)?;

        // 5. Vector scope sync for the changed set.
        if let Some(sync) = &opts.vector_sync {
            let mut file_meta = sync.store.scope_stamps(sync.scope_id)?;
            for path in &removed_paths {
                file_meta.remove(path);
            }
            for (path, stamp) in &changed_stamps {
                file_meta.insert(path.clone(), stamp.clone());
            }
            sync.store.update_scope(sync.scope_id, sync_chunks, &file_meta)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report.budget.used_ms = report.duration_ms;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_file(
        &self,
        path: &str,
        opts: &UpdateOptions,
        resolver: &DependencyResolver,
        packages: &[PackageDep],
        api: &mut ApiIndex,
        deps_graph: &mut DepsGraph,
        docs: &mut DocsIndex,
        report: &mut UpdateReport,
        sync_chunks: &mut Vec<StoredMindChunk>,
        changed_stamps: &mut BTreeMap<String, FileStamp>,
        removed_paths: &mut BTreeSet<String>,
    ) -> Result<()> {
        let abs = self.root.join(path);
        if !abs.is_file() {
            self.remove_file(path, resolver, packages, api, deps_graph, docs, report);
            removed_paths.insert(path.to_string());
            return Ok(());
        }

        let size = std::fs::metadata(&abs)
            .map_err(|e| MindError::Io { path: path.to_string(), source: e })?
            .len();
        if size > self.config.indexer.max_file_size_bytes {
            debug!(path, size, "skipping oversized file");
            return Ok(());
        }

        let ext = chunker::file_ext(path);

        if is_api_lang(ext) {
            // Export extraction and import resolution need the source text,
            // so API-language files are read whole (they sit under the size
            // cap checked above).
            let bytes = self.storage.read(path)?;
            let sha = sha256_hex(&bytes);
            let unchanged =
                api.files.get(path).map(|f| f.sha256 == sha).unwrap_or(false) && !opts.no_cache;
            if unchanged {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&bytes);
            let exports = extract_exports(&text);
            let existed = api
                .files
                .insert(path.to_string(), ApiFile { exports, size, sha256: sha.clone() })
                .is_some();
            if existed {
                report.api.updated += 1;
            } else {
                report.api.added += 1;
            }

            // Replace this file's outgoing edges.
            let before = deps_graph.edges.len();
            deps_graph.edges.retain(|e| e.from != path);
            report.deps.edges_removed += before - deps_graph.edges.len();
            let new_edges = deps::resolve_file_edges(resolver, path, &text, packages);
            report.deps.edges_added += new_edges.len();
            deps_graph.edges.extend(new_edges);

            self.collect_sync_chunks(path, &sha, &abs, opts, sync_chunks, changed_stamps, report);
        } else if chunker::is_markdown(path) {
            // Docs only need the leading heading; hash and chunks are both
            // produced through bounded reads.
            let sha = sha256_file(&abs)
                .map_err(|e| MindError::Io { path: path.to_string(), source: e })?;
            docs.docs.retain(|d| d.path != path);
            docs.docs.push(doc_entry_from_file(&abs, path));
            self.collect_sync_chunks(path, &sha, &abs, opts, sync_chunks, changed_stamps, report);
        } else if opts.vector_sync.is_some() && chunker::is_recognized_lang(ext) {
            let sha = sha256_file(&abs)
                .map_err(|e| MindError::Io { path: path.to_string(), source: e })?;
            self.collect_sync_chunks(path, &sha, &abs, opts, sync_chunks, changed_stamps, report);
        }
        Ok(())
    }

    /// Chunk and embed one changed file for the synced vector scope. The
    /// chunker reads the file itself, streaming it when the selection policy
    /// says so.
    #[allow(clippy::too_many_arguments)]
    fn collect_sync_chunks(
        &self,
        path: &str,
        sha: &str,
        abs: &Path,
        opts: &UpdateOptions,
        sync_chunks: &mut Vec<StoredMindChunk>,
        changed_stamps: &mut BTreeMap<String, FileStamp>,
        report: &mut UpdateReport,
    ) {
        let Some(sync) = &opts.vector_sync else {
            return;
        };
        let mtime_ms = std::fs::metadata(abs)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let chunks = match chunker::chunk_file(abs, path, &ChunkOptions::for_path(path)) {
            Ok(chunks) => chunks,
            Err(e) => {
                report.errors.push(FileError { path: path.to_string(), message: e.to_string() });
                return;
            }
        };
        for (i, mut chunk) in chunks.into_iter().enumerate() {
            chunk.metadata.insert(META_FILE_HASH.to_string(), sha.into());
            chunk.metadata.insert(META_MTIME.to_string(), mtime_ms.into());
            let embedding = match sync.embedder.embed(&chunk.text) {
                Ok(v) => v,
                Err(e) => {
                    report
                        .errors
                        .push(FileError { path: path.to_string(), message: e.to_string() });
                    return;
                }
            };
            sync_chunks.push(StoredMindChunk {
                chunk_id: format!("{path}#{i}"),
                scope_id: sync.scope_id.to_string(),
                source_id: path.to_string(),
                path: path.to_string(),
                embedding,
                chunk,
            });
        }
        changed_stamps.insert(path.to_string(), FileStamp { mtime_ms, hash: sha.to_string() });
    }

    /// Drop a deleted file from every index; importers of the deleted file
    /// are re-resolved so their dangling edges disappear.
    #[allow(clippy::too_many_arguments)]
    fn remove_file(
        &self,
        path: &str,
        resolver: &DependencyResolver,
        packages: &[PackageDep],
        api: &mut ApiIndex,
        deps_graph: &mut DepsGraph,
        docs: &mut DocsIndex,
        report: &mut UpdateReport,
    ) {
        if api.files.remove(path).is_some() {
            report.api.removed += 1;
        }
        docs.docs.retain(|d| d.path != path);

        let importers: BTreeSet<String> = deps_graph
            .edges
            .iter()
            .filter(|e| e.to == path && e.from != path)
            .map(|e| e.from.clone())
            .collect();

        let before = deps_graph.edges.len();
        deps_graph.edges.retain(|e| e.from != path && e.to != path);
        report.deps.edges_removed += before - deps_graph.edges.len();

        for importer in importers {
            let abs = self.root.join(&importer);
            let Ok(text) = std::fs::read_to_string(&abs) else {
                continue;
            };
            let before = deps_graph.edges.len();
            deps_graph.edges.retain(|e| e.from != importer);
            report.deps.edges_removed += before - deps_graph.edges.len();
            let new_edges = deps::resolve_file_edges(resolver, &importer, &text, packages);
            report.deps.edges_added += new_edges.len();
            deps_graph.edges.extend(new_edges);
        }
    }

    // -----------------------------------------------------------------------
    // Artifact writes and helpers
    // -----------------------------------------------------------------------

    fn compute_meta(&self, api: &ApiIndex) -> ProjectMeta {
        let (name, _) = deps::load_packages(&self.root);
        let exports_count = api.files.values().map(|f| f.exports.len()).sum();
        let last_activity = api
            .files
            .keys()
            .filter_map(|path| {
                std::fs::metadata(self.root.join(path))
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            })
            .map(|d| d.as_millis() as u64)
            .max()
            .map(format_iso8601);
        ProjectMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            name: name.unwrap_or_else(|| {
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            }),
            modules: api.files.len(),
            exports_count,
            last_activity,
        }
    }

    /// Composite checksum over the canonical JSON of all payload artifacts.
    pub(crate) fn composite_checksum(
        api: &ApiIndex,
        deps_graph: &DepsGraph,
        diff: &RecentDiff,
        meta: &ProjectMeta,
        docs: &DocsIndex,
    ) -> Result<String> {
        let composite = json!({
            "apiIndex": serde_json::to_value(api).map_err(to_ser_err)?,
            "deps": serde_json::to_value(deps_graph).map_err(to_ser_err)?,
            "recentDiff": serde_json::to_value(diff).map_err(to_ser_err)?,
            "meta": serde_json::to_value(meta).map_err(to_ser_err)?,
            "docs": serde_json::to_value(docs).map_err(to_ser_err)?,
        });
        Ok(hash_value(&composite))
    }

    fn write_all(
        &self,
        api: &ApiIndex,
        deps_graph: &DepsGraph,
        diff: &RecentDiff,
        meta: &ProjectMeta,
        docs: &DocsIndex,
    ) -> Result<()> {
        write_artifact(&self.storage, API_INDEX_FILE, api)?;
        write_artifact(&self.storage, DEPS_FILE, deps_graph)?;
        write_artifact(&self.storage, RECENT_DIFF_FILE, diff)?;
        write_artifact(&self.storage, META_FILE, meta)?;
        write_artifact(&self.storage, DOCS_FILE, docs)?;

        let manifest = MindIndex {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            updated_at: format_iso8601(now_millis()),
            api_index_hash: artifact_hash(api)?,
            deps_hash: artifact_hash(deps_graph)?,
            recent_diff_hash: artifact_hash(diff)?,
            index_checksum: Self::composite_checksum(api, deps_graph, diff, meta, docs)?,
        };
        write_artifact(&self.storage, INDEX_FILE, &manifest)
    }

    /// Indexable files under the workspace, sorted, `.kb/` excluded.
    fn walk_workspace(&self, include_vector_langs: bool) -> Vec<String> {
        let mut paths = Vec::new();
        let walker = WalkBuilder::new(&self.root).hidden(true).build();
        for entry in walker.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if rel.starts_with(".kb/") {
                continue;
            }
            let ext = chunker::file_ext(&rel);
            let indexable = is_api_lang(ext)
                || chunker::is_markdown(&rel)
                || (include_vector_langs && chunker::is_recognized_lang(ext));
            if indexable {
                paths.push(rel);
            }
        }
        paths.sort();
        paths
    }
}

fn to_ser_err(e: serde_json::Error) -> MindError {
    MindError::Query { detail: format!("artifact serialization failed: {e}") }
}

/// Cap on how much of a document is read when scanning for its title.
const DOC_TITLE_SCAN_BYTES: u64 = 8 * 1024;

/// Docs-index entry built from a bounded head read of the file; the title
/// scan never pulls a whole document into memory.
fn doc_entry_from_file(abs: &Path, path: &str) -> DocEntry {
    use std::io::Read;

    let mut head = Vec::new();
    if let Ok(file) = std::fs::File::open(abs) {
        let _ = file.take(DOC_TITLE_SCAN_BYTES).read_to_end(&mut head);
    }
    doc_entry(path, &String::from_utf8_lossy(&head))
}

/// Docs-index entry for a Markdown file: title from the first ATX heading,
/// tag from the top-level directory, `readme` type for README files.
fn doc_entry(path: &str, text: &str) -> DocEntry {
    let stem = path
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(path);
    let title = text
        .lines()
        .find(|l| l.trim_start().starts_with('#'))
        .map(|l| l.trim_start().trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| stem.to_string());
    let tag = match path.split_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => "root".to_string(),
    };
    let doc_type =
        if stem.eq_ignore_ascii_case("readme") { "readme".to_string() } else { "guide".to_string() };
    DocEntry { path: path.to_string(), tag, doc_type, title }
}
