//! Context-pack assembly under a token budget.
//!
//! Section builders run in a fixed order, each reading one artifact and
//! producing a Markdown block. Blocks over their (preset-weighted) cap are
//! truncated with the configured strategy; if the assembled pack still
//! exceeds the total budget, trailing sections are dropped before the
//! mandatory intent section is itself truncated. Equal inputs produce
//! byte-identical output.

use crate::config::{MindConfig, PackCaps, PackPreset, Truncation};
use crate::error::{MindError, Result};
use crate::indexer::{Indexer, UpdateOptions};
use crate::storage::{FsStorage, Storage};
use crate::tokenizer::{EstimateCounter, TokenCounter};
use crate::types::*;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TRUNCATION_MARKER: &str = "// ... truncated";

/// Section names, in build order. The first entry is mandatory.
const SECTION_ORDER: [&str; 8] = [
    "intent_summary",
    "product_overview",
    "project_meta",
    "api_signatures",
    "recent_diffs",
    "docs_overview",
    "impl_snippets",
    "configs_profiles",
];

// ---------------------------------------------------------------------------
// Request / output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PackBudget {
    pub total_tokens: usize,
    pub caps: PackCaps,
    pub truncation: Truncation,
}

impl PackBudget {
    pub fn from_config(config: &MindConfig) -> Self {
        Self {
            total_tokens: config.pack.total_tokens,
            caps: config.pack.caps.clone(),
            truncation: config.pack.truncation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackRequest {
    pub intent: String,
    pub product: Option<String>,
    /// Budget override; workspace config otherwise.
    pub budget: Option<PackBudget>,
    /// Preset weight override; workspace config otherwise.
    pub preset: Option<PackPreset>,
    /// Embed the assembled Markdown into the JSON output.
    pub with_bundle: bool,
    /// Recorded verbatim in the output for reproducibility bookkeeping.
    pub seed: Option<u64>,
    /// Workspace-relative output path for the pack JSON.
    pub out: Option<String>,
}

impl PackRequest {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            product: None,
            budget: None,
            preset: None,
            with_bundle: false,
            seed: None,
            out: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackOutput {
    pub json: Value,
    pub markdown: String,
    pub tokens_estimate: usize,
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

pub struct PackAssembler {
    root: PathBuf,
    storage: FsStorage,
    config: MindConfig,
    tokenizer: Arc<dyn TokenCounter>,
}

impl PackAssembler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let storage = FsStorage::new(&root);
        let config = MindConfig::load(&root);
        Self { root, storage, config, tokenizer: Arc::new(EstimateCounter) }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenCounter>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn assemble(&self, request: &PackRequest) -> Result<PackOutput> {
        if !self.storage.exists(INDEX_FILE) {
            return Err(MindError::NoIndex { path: MIND_DIR.to_string() });
        }
        let api: ApiIndex = read_artifact(&self.storage, API_INDEX_FILE)?;
        let deps: DepsGraph = read_artifact(&self.storage, DEPS_FILE)?;
        let diff: RecentDiff = read_artifact(&self.storage, RECENT_DIFF_FILE)?;
        let meta: ProjectMeta = read_artifact(&self.storage, META_FILE)?;
        let docs: DocsIndex = read_artifact(&self.storage, DOCS_FILE)?;

        let budget =
            request.budget.clone().unwrap_or_else(|| PackBudget::from_config(&self.config));
        let preset = request.preset.clone().unwrap_or_else(|| self.config.pack.preset.clone());
        let caps = weighted_caps(&budget.caps, &preset);

        // Build every section in the fixed order, applying per-section caps.
        let mut sections: Vec<(&'static str, String, usize)> = Vec::new();
        for name in SECTION_ORDER {
            let content = match name {
                "intent_summary" => self.build_intent(request),
                "product_overview" => build_overview(&meta, &deps),
                "project_meta" => build_project_meta(&meta),
                "api_signatures" => build_api_signatures(&api),
                "recent_diffs" => build_recent_diffs(&diff),
                "docs_overview" => build_docs_overview(&docs),
                "impl_snippets" => self.build_snippets(&api, &diff),
                "configs_profiles" => self.build_configs(),
                _ => unreachable!(),
            };
            if content.trim().is_empty() {
                continue;
            }
            let cap = cap_for(&caps, name);
            let mut text = content;
            let mut tokens = self.tokenizer.count(&text);
            if let Some(cap) = cap {
                if tokens > cap {
                    text = truncate_to_tokens(&text, cap, budget.truncation);
                    tokens = self.tokenizer.count(&text);
                }
            }
            sections.push((name, text, tokens));
        }

        // Total-budget pass: drop trailing sections, then squeeze the intent.
        let mut total: usize = sections.iter().map(|(_, _, t)| *t).sum();
        while total > budget.total_tokens && sections.len() > 1 {
            let (_, _, tokens) = sections.pop().unwrap();
            total -= tokens;
        }
        if total > budget.total_tokens {
            let (_, text, _) = sections.pop().unwrap();
            let squeezed = truncate_to_tokens(&text, budget.total_tokens, budget.truncation);
            let tokens = self.tokenizer.count(&squeezed);
            if tokens > budget.total_tokens || squeezed.trim().is_empty() {
                return Err(MindError::PackBudgetExceeded {
                    section: "intent_summary",
                    needed: tokens,
                    cap: budget.total_tokens,
                });
            }
            sections.push(("intent_summary", squeezed, tokens));
            total = tokens;
        }

        let markdown = sections
            .iter()
            .map(|(_, text, _)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut section_map = serde_json::Map::new();
        let mut usage_map = serde_json::Map::new();
        for (name, text, tokens) in &sections {
            section_map.insert((*name).to_string(), Value::String(text.clone()));
            usage_map.insert((*name).to_string(), Value::from(*tokens));
        }
        let mut json_out = json!({
            "schemaVersion": SCHEMA_VERSION,
            "generator": GENERATOR,
            "intent": request.intent,
            "sections": Value::Object(section_map),
            "sectionUsage": Value::Object(usage_map),
            "budgetApplied": {
                "totalTokens": budget.total_tokens,
                "caps": {
                    "intent_summary": caps.intent_summary,
                    "product_overview": caps.product_overview,
                    "api_signatures": caps.api_signatures,
                    "recent_diffs": caps.recent_diffs,
                    "impl_snippets": caps.impl_snippets,
                    "configs_profiles": caps.configs_profiles,
                },
                "truncation": match budget.truncation {
                    Truncation::Start => "start",
                    Truncation::Middle => "middle",
                    Truncation::End => "end",
                },
            },
            "deterministic": true,
        });
        if let Some(product) = &request.product {
            json_out["product"] = Value::String(product.clone());
        }
        if let Some(seed) = request.seed {
            json_out["seed"] = Value::from(seed);
        }
        if request.with_bundle {
            json_out["bundle"] = Value::String(markdown.clone());
        }

        if let Some(out) = &request.out {
            self.storage.write(out, &artifact_bytes(&json_out)?)?;
        }

        Ok(PackOutput { json: json_out, markdown, tokens_estimate: total })
    }

    // -----------------------------------------------------------------------
    // Section builders
    // -----------------------------------------------------------------------

    fn build_intent(&self, request: &PackRequest) -> String {
        let mut out = format!("# Context Pack\n\n**Intent:** {}", request.intent);
        if let Some(product) = &request.product {
            out.push_str(&format!("\n**Product:** {product}"));
        }
        out
    }

    fn build_snippets(&self, api: &ApiIndex, diff: &RecentDiff) -> String {
        // Changed files first, then index order, capped at a handful.
        let mut picked: Vec<String> = diff
            .files
            .iter()
            .filter(|f| !matches!(f.status, DiffStatus::D))
            .map(|f| f.path.clone())
            .filter(|p| api.files.contains_key(p))
            .collect();
        for path in api.files.keys() {
            if picked.len() >= 5 {
                break;
            }
            if !picked.contains(path) {
                picked.push(path.clone());
            }
        }
        picked.truncate(5);

        let max_lines = self.config.indexer.max_snippet_lines;
        let mut out = String::from("## Snippets");
        let mut wrote = false;
        for path in picked {
            let Ok(text) = self.storage.read_to_string(&path) else {
                continue;
            };
            let snippet: Vec<&str> = text.lines().take(max_lines).collect();
            if snippet.is_empty() {
                continue;
            }
            wrote = true;
            out.push_str(&format!(
                "\n\n### {path}\n```{}\n{}\n```",
                fence_lang(&path),
                snippet.join("\n")
            ));
        }
        if wrote {
            out
        } else {
            String::new()
        }
    }

    fn build_configs(&self) -> String {
        let mut out = String::from("## Configs");
        let mut wrote = false;
        for name in ["package.json", "tsconfig.json"] {
            let Ok(text) = self.storage.read_to_string(name) else {
                continue;
            };
            let trimmed: Vec<&str> = text.lines().take(40).collect();
            wrote = true;
            out.push_str(&format!("\n\n### {name}\n```json\n{}\n```", trimmed.join("\n")));
        }
        if wrote {
            out
        } else {
            String::new()
        }
    }
}

fn build_overview(meta: &ProjectMeta, deps: &DepsGraph) -> String {
    let mut out = format!(
        "## Overview\n\n{}: {} modules, {} exports, {} external dependencies.",
        if meta.name.is_empty() { "workspace" } else { &meta.name },
        meta.modules,
        meta.exports_count,
        deps.summary.external_count,
    );
    if !deps.summary.external_deps.is_empty() {
        let shown: Vec<&str> =
            deps.summary.external_deps.iter().take(10).map(String::as_str).collect();
        out.push_str(&format!("\nExternals: {}", shown.join(", ")));
    }
    out
}

fn build_project_meta(meta: &ProjectMeta) -> String {
    let mut out = format!(
        "## Project\n\n- name: {}\n- modules: {}\n- exports: {}",
        meta.name, meta.modules, meta.exports_count
    );
    if let Some(last) = &meta.last_activity {
        out.push_str(&format!("\n- lastActivity: {last}"));
    }
    out
}

fn build_api_signatures(api: &ApiIndex) -> String {
    if api.files.is_empty() {
        return String::new();
    }
    let mut out = String::from("## API");
    for (path, file) in &api.files {
        if file.exports.is_empty() {
            continue;
        }
        out.push_str(&format!("\n\n### {path}"));
        for export in &file.exports {
            let kind = serde_json::to_value(export.kind)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            out.push_str(&format!("\n- `{}` ({kind}): `{}`", export.name, export.signature));
            if let Some(doc) = &export.jsdoc {
                out.push_str(&format!(" — {doc}"));
            }
        }
    }
    out
}

fn build_recent_diffs(diff: &RecentDiff) -> String {
    if diff.files.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Recent changes");
    if let Some(since) = &diff.since {
        out.push_str(&format!("\n\nSince `{since}`:"));
    }
    for file in &diff.files {
        let status = match file.status {
            DiffStatus::A => "A",
            DiffStatus::M => "M",
            DiffStatus::D => "D",
            DiffStatus::R => "R",
        };
        out.push_str(&format!("\n- [{status}] {}", file.path));
    }
    out
}

fn build_docs_overview(docs: &DocsIndex) -> String {
    if docs.docs.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Docs");
    for doc in docs.docs.iter().take(30) {
        out.push_str(&format!("\n- {} — {} ({})", doc.title, doc.path, doc.doc_type));
    }
    out
}

fn fence_lang(path: &str) -> &'static str {
    match crate::chunker::file_ext(path) {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" | "pyi" => "python",
        "go" => "go",
        "rs" => "rust",
        "cs" => "csharp",
        "md" | "mdx" | "markdown" => "markdown",
        "json" => "json",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// Cap weighting
// ---------------------------------------------------------------------------

fn weighted_caps(caps: &PackCaps, preset: &PackPreset) -> PackCaps {
    let scale = |cap: usize, weight: f64| -> usize { (cap as f64 * weight).round() as usize };
    PackCaps {
        intent_summary: caps.intent_summary,
        product_overview: scale(caps.product_overview, preset.overview),
        api_signatures: scale(caps.api_signatures, preset.api),
        recent_diffs: scale(caps.recent_diffs, preset.diffs),
        impl_snippets: scale(caps.impl_snippets, preset.snippets),
        configs_profiles: scale(caps.configs_profiles, preset.configs),
    }
}

fn cap_for(caps: &PackCaps, name: &str) -> Option<usize> {
    match name {
        "intent_summary" => Some(caps.intent_summary),
        "product_overview" => Some(caps.product_overview),
        "api_signatures" => Some(caps.api_signatures),
        "recent_diffs" => Some(caps.recent_diffs),
        "impl_snippets" => Some(caps.impl_snippets),
        "configs_profiles" => Some(caps.configs_profiles),
        // project_meta and docs_overview are small by construction.
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Truncation
// ---------------------------------------------------------------------------

/// Cut `text` down to at most `max_tokens` (bytes/4) with the given
/// strategy. Break points are chosen in preference order: blank line,
/// closing brace, newline, sentence end, comma, space, hard cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize, strategy: Truncation) -> String {
    let target_bytes = max_tokens.saturating_mul(4);
    if text.len() <= target_bytes {
        return text.to_string();
    }
    if target_bytes == 0 {
        return String::new();
    }
    match strategy {
        Truncation::End => {
            let cut = break_before(text, target_bytes);
            text[..cut].trim_end().to_string()
        }
        Truncation::Start => {
            let min_start = text.len() - target_bytes;
            let cut = break_after(text, min_start);
            text[cut..].trim_start().to_string()
        }
        Truncation::Middle => {
            let overhead = TRUNCATION_MARKER.len() + 2; // surrounding newlines
            let budget = target_bytes.saturating_sub(overhead);
            if budget < 2 {
                let cut = break_before(text, target_bytes);
                return text[..cut].trim_end().to_string();
            }
            let head_budget = budget / 2;
            let tail_budget = budget - head_budget;
            let head_cut = break_before(text, head_budget);
            let tail_cut = break_after(text, text.len() - tail_budget);
            format!(
                "{}\n{TRUNCATION_MARKER}\n{}",
                text[..head_cut].trim_end(),
                text[tail_cut..].trim_start()
            )
        }
    }
}

const BREAK_PATTERNS: [&str; 6] = ["\n\n", "}", "\n", ". ", ",", " "];

/// Best cut position at or before `limit`, preferring the highest-priority
/// pattern found in the trailing half of the allowed range.
fn break_before(text: &str, limit: usize) -> usize {
    let limit = floor_boundary(text, limit.min(text.len()));
    let window_start = floor_boundary(text, limit / 2);
    let slice = &text[window_start..limit];
    for pattern in BREAK_PATTERNS {
        if let Some(pos) = slice.rfind(pattern) {
            return window_start + pos + pattern.len();
        }
    }
    limit
}

/// Best cut position at or after `min_start`, preferring the
/// highest-priority pattern found in the leading half of the allowed range.
fn break_after(text: &str, min_start: usize) -> usize {
    let min_start = ceil_boundary(text, min_start.min(text.len()));
    let window_end = ceil_boundary(text, min_start + (text.len() - min_start) / 2);
    let slice = &text[min_start..window_end];
    for pattern in BREAK_PATTERNS {
        if let Some(pos) = slice.find(pattern) {
            return min_start + pos + pattern.len();
        }
    }
    min_start
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ---------------------------------------------------------------------------
// feed — update + pack in one call
// ---------------------------------------------------------------------------

pub struct FeedOptions<'a> {
    pub no_update: bool,
    /// Update options; defaults use the indexer-stage time budget.
    pub update: Option<UpdateOptions<'a>>,
    pub pack: PackRequest,
}

pub struct FeedOutcome {
    pub update: Option<UpdateReport>,
    pub pack: PackOutput,
}

/// Run an incremental update (unless skipped) and assemble a pack from the
/// fresh artifacts.
pub fn feed(root: &Path, options: FeedOptions) -> Result<FeedOutcome> {
    let indexer = Indexer::new(root);
    let update = if options.no_update {
        None
    } else {
        let stage_budget = indexer.config().indexer.time_budget_ms;
        let update_options = options.update.unwrap_or_else(|| UpdateOptions {
            time_budget_ms: stage_budget,
            ..UpdateOptions::default()
        });
        Some(indexer.update(&update_options)?)
    };
    let assembler = PackAssembler::new(root);
    let pack = assembler.assemble(&options.pack)?;
    Ok(FeedOutcome { update, pack })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_end_and_start_respect_budget() {
        let text: String = (1..=100).map(|i| format!("line number {i}\n")).collect();
        for strategy in [Truncation::End, Truncation::Start, Truncation::Middle] {
            let out = truncate_to_tokens(&text, 50, strategy);
            assert!(crate::hash::estimate_tokens(&out) <= 50, "{strategy:?} overflowed");
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn truncate_middle_keeps_both_ends() {
        let text: String = (1..=200).map(|i| format!("row {i}\n")).collect();
        let out = truncate_to_tokens(&text, 60, Truncation::Middle);
        assert!(out.contains(TRUNCATION_MARKER));
        assert!(out.starts_with("row 1"));
        assert!(out.trim_end().ends_with("row 200"));
    }

    #[test]
    fn truncation_is_a_noop_within_budget() {
        let text = "short block";
        assert_eq!(truncate_to_tokens(text, 100, Truncation::Middle), text);
    }

    #[test]
    fn weighted_caps_apply_preset_multipliers() {
        let caps = PackCaps::default();
        let preset = PackPreset::default();
        let weighted = weighted_caps(&caps, &preset);
        assert_eq!(weighted.intent_summary, 300);
        assert_eq!(weighted.api_signatures, 2640); // 2200 * 1.2
        assert_eq!(weighted.impl_snippets, 4200); // 3000 * 1.4
        assert_eq!(weighted.configs_profiles, 420); // 700 * 0.6
    }
}
