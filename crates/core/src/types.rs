//! Artifact data model.
//!
//! Every entity persisted under `.kb/mind/` lives here, together with the
//! artifact read/write helpers. Serialization is camelCase to match the wire
//! schema; writes always go through `write_artifact` so key order (and thus
//! the canonical hash input) is deterministic regardless of how a struct was
//! built.

use crate::error::{MindError, Result};
use crate::hash;
use crate::storage::Storage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Schema constants and artifact locations
// ---------------------------------------------------------------------------

pub const SCHEMA_VERSION: &str = "1.0";
pub const GENERATOR: &str = "kb-labs-mind@0.1.0";

pub const MIND_DIR: &str = ".kb/mind";
pub const INDEX_FILE: &str = ".kb/mind/index.json";
pub const API_INDEX_FILE: &str = ".kb/mind/api-index.json";
pub const DEPS_FILE: &str = ".kb/mind/deps.json";
pub const RECENT_DIFF_FILE: &str = ".kb/mind/recent-diff.json";
pub const META_FILE: &str = ".kb/mind/meta.json";
pub const DOCS_FILE: &str = ".kb/mind/docs.json";
pub const VECTORS_DIR: &str = ".kb/mind/vectors";
pub const SYNC_REGISTRY_FILE: &str = ".kb/mind/sync/registry.json";
pub const HISTORY_DIR: &str = ".kb/mind/learning/history";
pub const FEEDBACK_DIR: &str = ".kb/mind/learning/feedback";

// ---------------------------------------------------------------------------
// Top-level manifest
// ---------------------------------------------------------------------------

/// `index.json` — the manifest tying all artifacts together. The checksum
/// covers the canonical JSON of the composite `{apiIndex, deps, recentDiff,
/// meta, docs}` value; the per-artifact hashes let the verifier point at the
/// exact file that drifted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindIndex {
    pub schema_version: String,
    pub generator: String,
    pub updated_at: String,
    pub api_index_hash: String,
    pub deps_hash: String,
    pub recent_diff_hash: String,
    pub index_checksum: String,
}

// ---------------------------------------------------------------------------
// API index
// ---------------------------------------------------------------------------

/// `api-index.json` — exported API surface per file. `BTreeMap` keeps the
/// path keys ordered on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIndex {
    pub schema_version: String,
    pub generator: String,
    pub files: BTreeMap<String, ApiFile>,
}

impl ApiIndex {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            files: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFile {
    pub exports: Vec<ApiExport>,
    /// Size in bytes of the file that produced this record.
    pub size: u64,
    /// SHA-256 of the file bytes; the incremental skip key.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiExport {
    pub name: String,
    pub kind: ExportKind,
    /// One-line, whitespace-collapsed declaration profile.
    pub signature: String,
    /// Leading doc comment (first one or two lines), when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsdoc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Function,
    Class,
    Type,
    Const,
    Enum,
    Interface,
}

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

/// `deps.json` — declared packages, resolved import edges, and the externals
/// summary. Edges are kept sorted by `(from, to, type)` at all times.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsGraph {
    pub schema_version: String,
    pub generator: String,
    pub packages: Vec<PackageDep>,
    pub edges: Vec<DepEdge>,
    pub summary: DepsSummary,
}

impl DepsGraph {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            packages: Vec::new(),
            edges: Vec::new(),
            summary: DepsSummary::default(),
        }
    }
}

/// A dependency declared by the workspace package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDep {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub dep_type: EdgeType,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepEdge {
    /// Internal POSIX path of the importing file.
    pub from: String,
    /// Internal POSIX path or external package name.
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    /// What `to` is, as decided at resolution time. Persisted so consumers
    /// never have to re-derive it from the target string.
    pub target: TargetKind,
    /// Symbols named in the import clause (`default` and `*` included).
    pub symbols: Vec<String>,
}

/// Resolution-time classification of an edge target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A file inside the workspace.
    Internal,
    /// An external package name.
    External,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Runtime,
    Dev,
    Peer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsSummary {
    /// Every referenced external package, sorted, exactly once.
    pub external_deps: Vec<String>,
    pub internal_files: usize,
    pub external_count: usize,
    pub edge_count: usize,
}

// ---------------------------------------------------------------------------
// Recent diff
// ---------------------------------------------------------------------------

/// `recent-diff.json` — change-source output stored as-is, files sorted by
/// path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentDiff {
    pub schema_version: String,
    pub generator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    pub files: Vec<DiffFile>,
}

impl RecentDiff {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            since: None,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffFile {
    pub path: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffStatus {
    A,
    M,
    D,
    R,
}

// ---------------------------------------------------------------------------
// Project meta and docs
// ---------------------------------------------------------------------------

/// `meta.json` — package-level summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub schema_version: String,
    pub generator: String,
    pub name: String,
    pub modules: usize,
    pub exports_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

impl ProjectMeta {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            name: String::new(),
            modules: 0,
            exports_count: 0,
            last_activity: None,
        }
    }
}

/// `docs.json` — discovered documents, paths unique and sorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsIndex {
    pub schema_version: String,
    pub generator: String,
    pub docs: Vec<DocEntry>,
}

impl DocsIndex {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            docs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocEntry {
    pub path: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Update report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub api: ApiCounts,
    pub deps: EdgeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffCounts>,
    pub partial: bool,
    pub budget: BudgetReport,
    pub duration_ms: u64,
    /// Per-file failures; they never abort the run.
    pub errors: Vec<FileError>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCounts {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCounts {
    pub edges_added: usize,
    pub edges_removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffCounts {
    pub files: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub used_ms: u64,
    pub limit_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileError {
    pub path: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Artifact I/O
// ---------------------------------------------------------------------------

/// Rebuild a JSON value with every object's keys in sorted order, so the
/// pretty-printed artifact bytes are deterministic even when a map type
/// preserves insertion order.
pub fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_value(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Serialize an artifact to its deterministic on-disk form.
pub fn artifact_bytes<T: Serialize>(artifact: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(artifact).map_err(|e| MindError::Query {
        detail: format!("artifact serialization failed: {e}"),
    })?;
    let sorted = sort_value(value);
    let mut bytes = serde_json::to_vec_pretty(&sorted).map_err(|e| MindError::Query {
        detail: format!("artifact serialization failed: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Canonical hash of an artifact (independent of on-disk formatting).
pub fn artifact_hash<T: Serialize>(artifact: &T) -> Result<String> {
    let value = serde_json::to_value(artifact).map_err(|e| MindError::Query {
        detail: format!("artifact serialization failed: {e}"),
    })?;
    Ok(hash::hash_value(&value))
}

/// Atomically persist an artifact.
pub fn write_artifact<T: Serialize>(storage: &dyn Storage, path: &str, artifact: &T) -> Result<()> {
    storage.write(path, &artifact_bytes(artifact)?)
}

/// Load an artifact; a missing file maps to `MIND_NO_INDEX`.
pub fn read_artifact<T: DeserializeOwned>(storage: &dyn Storage, path: &str) -> Result<T> {
    if !storage.exists(path) {
        return Err(MindError::NoIndex { path: path.to_string() });
    }
    let text = storage.read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| MindError::IndexInconsistent {
        detail: format!("{path} is not a valid artifact: {e}"),
    })
}
