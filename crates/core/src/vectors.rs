//! Per-scope vector store.
//!
//! One JSON file per scope under `.kb/mind/vectors/`, holding stored chunks
//! with their embeddings. A process-local cache keeps the last-loaded chunk
//! array per scope and is evicted whenever the scope file is rewritten.
//! Search is brute-force cosine over the scope, parallelized and then fully
//! sorted, so results are deterministic.

use crate::chunker::Chunk;
use crate::error::{MindError, Result};
use crate::hash::{cosine_similarity, format_iso8601, now_millis};
use crate::storage::{FsStorage, Storage};
use crate::types::{artifact_bytes, VECTORS_DIR};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// Declared metadata keys used for file-granularity diffing.
pub const META_FILE_HASH: &str = "fileHash";
pub const META_MTIME: &str = "mtime";

/// Fraction of stored files that may change before an update falls back to a
/// full scope replace.
const UPDATE_REPLACE_RATIO: f64 = 0.8;

// ---------------------------------------------------------------------------
// Stored types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMindChunk {
    pub chunk_id: String,
    pub scope_id: String,
    /// Owning document id (`source:id:scope` for synced documents, the file
    /// path for workspace chunks).
    pub source_id: String,
    pub path: String,
    pub embedding: Vec<f32>,
    #[serde(flatten)]
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeFile {
    scope_id: String,
    generated_at: String,
    chunks: Vec<StoredMindChunk>,
}

/// One search hit: similarity score plus the stored chunk.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub score: f32,
    pub chunk: StoredMindChunk,
}

/// Optional search filters.
#[derive(Default)]
pub struct SearchFilters<'a> {
    /// When set, only chunks whose `source_id` is in the set are returned.
    pub source_ids: Option<&'a HashSet<String>>,
    /// When set, only chunks whose path satisfies the predicate are returned.
    pub path_predicate: Option<&'a (dyn Fn(&str) -> bool + Sync)>,
}

/// Per-file stamp used by `update_scope` to detect changed paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime_ms: u64,
    pub hash: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct VectorStore {
    storage: FsStorage,
    cache: DashMap<String, Arc<Vec<StoredMindChunk>>>,
}

impl VectorStore {
    pub fn new(storage: FsStorage) -> Self {
        Self { storage, cache: DashMap::new() }
    }

    fn scope_path(scope_id: &str) -> Result<String> {
        let valid = !scope_id.is_empty()
            && scope_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MindError::InvalidFlag {
                flag: "scope".to_string(),
                detail: format!("invalid scope id '{scope_id}'"),
            });
        }
        Ok(format!("{VECTORS_DIR}/{scope_id}.json"))
    }

    pub fn scope_exists(&self, scope_id: &str) -> bool {
        Self::scope_path(scope_id).map(|p| self.storage.exists(&p)).unwrap_or(false)
    }

    fn load(&self, scope_id: &str) -> Result<Arc<Vec<StoredMindChunk>>> {
        if let Some(cached) = self.cache.get(scope_id) {
            return Ok(cached.clone());
        }
        let path = Self::scope_path(scope_id)?;
        if !self.storage.exists(&path) {
            return Ok(Arc::new(Vec::new()));
        }
        let text = self.storage.read_to_string(&path)?;
        let file: ScopeFile = serde_json::from_str(&text).map_err(|e| MindError::Parse {
            path,
            detail: format!("scope file is not valid JSON: {e}"),
        })?;
        let chunks = Arc::new(file.chunks);
        self.cache.insert(scope_id.to_string(), chunks.clone());
        Ok(chunks)
    }

    fn persist(&self, scope_id: &str, chunks: Vec<StoredMindChunk>) -> Result<()> {
        let path = Self::scope_path(scope_id)?;
        let file = ScopeFile {
            scope_id: scope_id.to_string(),
            generated_at: format_iso8601(now_millis()),
            chunks,
        };
        self.storage.write(&path, &artifact_bytes(&file)?)?;
        // Evict so the next read observes exactly what was written.
        self.cache.remove(scope_id);
        Ok(())
    }

    /// Full overwrite of a scope.
    pub fn replace_scope(&self, scope_id: &str, chunks: Vec<StoredMindChunk>) -> Result<()> {
        debug!(scope = scope_id, chunks = chunks.len(), "replacing scope");
        self.persist(scope_id, chunks)
    }

    /// File-granularity diff update. Chunks from unchanged paths survive;
    /// deleted and changed paths are dropped and `new_chunks` spliced in.
    /// Falls back to a full replace when more than 80% of the stored file
    /// set changed.
    pub fn update_scope(
        &self,
        scope_id: &str,
        new_chunks: Vec<StoredMindChunk>,
        file_meta: &BTreeMap<String, FileStamp>,
    ) -> Result<()> {
        let stored = self.load(scope_id)?;
        if stored.is_empty() {
            return self.replace_scope(scope_id, new_chunks);
        }

        // Current per-path stamps as recorded at index time.
        let mut stored_stamps: BTreeMap<&str, FileStamp> = BTreeMap::new();
        for chunk in stored.iter() {
            stored_stamps.entry(&chunk.path).or_insert_with(|| FileStamp {
                mtime_ms: chunk
                    .chunk
                    .metadata
                    .get(META_MTIME)
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                hash: chunk
                    .chunk
                    .metadata
                    .get(META_FILE_HASH)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            });
        }

        let mut stale: HashSet<&str> = HashSet::new();
        for (path, stamp) in &stored_stamps {
            match file_meta.get(*path) {
                None => {
                    stale.insert(*path); // deleted
                }
                Some(current) if current != stamp => {
                    stale.insert(*path); // changed
                }
                Some(_) => {}
            }
        }

        let ratio = stale.len() as f64 / stored_stamps.len() as f64;
        if ratio > UPDATE_REPLACE_RATIO {
            debug!(scope = scope_id, ratio, "diff exceeds threshold, replacing scope");
            return self.replace_scope(scope_id, new_chunks);
        }

        let new_paths: HashSet<&str> = new_chunks.iter().map(|c| c.path.as_str()).collect();
        let mut merged: Vec<StoredMindChunk> = stored
            .iter()
            .filter(|c| !stale.contains(c.path.as_str()) && !new_paths.contains(c.path.as_str()))
            .cloned()
            .collect();
        merged.extend(new_chunks);
        self.persist(scope_id, merged)
    }

    /// Cosine top-k over a scope. Non-finite scores are dropped; ordering is
    /// score descending with `(path, startLine)` tie-break. A dimension
    /// mismatch scores 0, never errors.
    pub fn search(
        &self,
        scope_id: &str,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchMatch>> {
        let chunks = self.load(scope_id)?;
        let mut matches: Vec<SearchMatch> = chunks
            .par_iter()
            .filter(|c| {
                if let Some(allowed) = filters.source_ids {
                    if !allowed.contains(&c.source_id) {
                        return false;
                    }
                }
                if let Some(pred) = filters.path_predicate {
                    if !pred(&c.path) {
                        return false;
                    }
                }
                true
            })
            .filter_map(|c| {
                let score = cosine_similarity(query, &c.embedding);
                if score.is_finite() {
                    Some(SearchMatch { score, chunk: c.clone() })
                } else {
                    None
                }
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.path.cmp(&b.chunk.path))
                .then_with(|| a.chunk.chunk.span.start_line.cmp(&b.chunk.chunk.span.start_line))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Per-path stamps recorded at index time, for callers assembling an
    /// incremental `update_scope` metadata map.
    pub fn scope_stamps(&self, scope_id: &str) -> Result<BTreeMap<String, FileStamp>> {
        let stored = self.load(scope_id)?;
        let mut stamps = BTreeMap::new();
        for chunk in stored.iter() {
            stamps.entry(chunk.path.clone()).or_insert_with(|| FileStamp {
                mtime_ms: chunk
                    .chunk
                    .metadata
                    .get(META_MTIME)
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                hash: chunk
                    .chunk
                    .metadata
                    .get(META_FILE_HASH)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            });
        }
        Ok(stamps)
    }

    /// Remove every chunk belonging to a source id (physical delete, used by
    /// registry cleanup).
    pub fn remove_source(&self, scope_id: &str, source_id: &str) -> Result<usize> {
        let stored = self.load(scope_id)?;
        let kept: Vec<StoredMindChunk> =
            stored.iter().filter(|c| c.source_id != source_id).cloned().collect();
        let removed = stored.len() - kept.len();
        if removed > 0 {
            self.persist(scope_id, kept)?;
        }
        Ok(removed)
    }

    /// Replace all chunks of one source id within a scope.
    pub fn replace_source(
        &self,
        scope_id: &str,
        source_id: &str,
        new_chunks: Vec<StoredMindChunk>,
    ) -> Result<()> {
        let stored = self.load(scope_id)?;
        let mut merged: Vec<StoredMindChunk> =
            stored.iter().filter(|c| c.source_id != source_id).cloned().collect();
        merged.extend(new_chunks);
        self.persist(scope_id, merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkType, Span};

    fn chunk(path: &str, start: usize, embedding: Vec<f32>) -> StoredMindChunk {
        StoredMindChunk {
            chunk_id: format!("{path}:{start}"),
            scope_id: "s".into(),
            source_id: path.to_string(),
            path: path.to_string(),
            embedding,
            chunk: Chunk {
                text: format!("{path} chunk at {start}"),
                span: Span { start_line: start, end_line: start + 5 },
                chunk_type: ChunkType::Lines,
                name: None,
                metadata: BTreeMap::new(),
            },
        }
    }

    fn store() -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(FsStorage::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn replace_and_search_orders_deterministically() {
        let (_dir, store) = store();
        store
            .replace_scope(
                "s",
                vec![
                    chunk("src/b.ts", 10, vec![1.0, 0.0]),
                    chunk("src/a.ts", 10, vec![1.0, 0.0]),
                    chunk("src/a.ts", 1, vec![1.0, 0.0]),
                    chunk("src/c.ts", 1, vec![0.0, 1.0]),
                ],
            )
            .unwrap();
        let matches = store.search("s", &[1.0, 0.0], 10, &SearchFilters::default()).unwrap();
        assert_eq!(matches.len(), 4);
        // Equal scores tie-break by (path, startLine).
        assert_eq!(matches[0].chunk.path, "src/a.ts");
        assert_eq!(matches[0].chunk.chunk.span.start_line, 1);
        assert_eq!(matches[1].chunk.path, "src/a.ts");
        assert_eq!(matches[1].chunk.chunk.span.start_line, 10);
        assert_eq!(matches[2].chunk.path, "src/b.ts");
        // Orthogonal vector scores last.
        assert_eq!(matches[3].chunk.path, "src/c.ts");

        let top = store.search("s", &[1.0, 0.0], 2, &SearchFilters::default()).unwrap();
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn dimension_mismatch_scores_zero() {
        let (_dir, store) = store();
        store.replace_scope("s", vec![chunk("src/a.ts", 1, vec![1.0, 0.0, 0.0])]).unwrap();
        let matches = store.search("s", &[1.0, 0.0], 10, &SearchFilters::default()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].score, 0.0);
    }

    #[test]
    fn update_scope_keeps_unchanged_paths() {
        let (_dir, store) = store();
        let mut a = chunk("src/a.ts", 1, vec![1.0, 0.0]);
        a.chunk.metadata.insert(META_FILE_HASH.into(), Value::String("h-a".into()));
        a.chunk.metadata.insert(META_MTIME.into(), Value::from(100u64));
        let mut b = chunk("src/b.ts", 1, vec![1.0, 0.0]);
        b.chunk.metadata.insert(META_FILE_HASH.into(), Value::String("h-b".into()));
        b.chunk.metadata.insert(META_MTIME.into(), Value::from(100u64));
        store.replace_scope("s", vec![a.clone(), b]).unwrap();

        // b changed, a unchanged; file_meta covers both.
        let mut meta = BTreeMap::new();
        meta.insert("src/a.ts".to_string(), FileStamp { mtime_ms: 100, hash: "h-a".into() });
        meta.insert("src/b.ts".to_string(), FileStamp { mtime_ms: 200, hash: "h-b2".into() });
        let mut b2 = chunk("src/b.ts", 1, vec![0.0, 1.0]);
        b2.chunk.metadata.insert(META_FILE_HASH.into(), Value::String("h-b2".into()));
        b2.chunk.metadata.insert(META_MTIME.into(), Value::from(200u64));
        store.update_scope("s", vec![b2], &meta).unwrap();

        let matches = store.search("s", &[0.0, 1.0], 10, &SearchFilters::default()).unwrap();
        let b_hit = matches.iter().find(|m| m.chunk.path == "src/b.ts").unwrap();
        assert!(b_hit.score > 0.9);
        assert!(matches.iter().any(|m| m.chunk.path == "src/a.ts"));
    }

    #[test]
    fn update_scope_drops_deleted_paths() {
        let (_dir, store) = store();
        let mut a = chunk("src/a.ts", 1, vec![1.0, 0.0]);
        a.chunk.metadata.insert(META_FILE_HASH.into(), Value::String("h-a".into()));
        let mut b = chunk("src/b.ts", 1, vec![1.0, 0.0]);
        b.chunk.metadata.insert(META_FILE_HASH.into(), Value::String("h-b".into()));
        store.replace_scope("s", vec![a, b]).unwrap();

        // Only a remains; ratio 1/2 ≤ 0.8 so the merge path runs.
        let mut meta = BTreeMap::new();
        meta.insert("src/a.ts".to_string(), FileStamp { mtime_ms: 0, hash: "h-a".into() });
        store.update_scope("s", Vec::new(), &meta).unwrap();

        let matches = store.search("s", &[1.0, 0.0], 10, &SearchFilters::default()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk.path, "src/a.ts");
    }

    #[test]
    fn source_filter_hides_chunks() {
        let (_dir, store) = store();
        store
            .replace_scope(
                "s",
                vec![chunk("docs/a.md", 1, vec![1.0, 0.0]), chunk("docs/b.md", 1, vec![1.0, 0.0])],
            )
            .unwrap();
        let allowed: HashSet<String> = ["docs/a.md".to_string()].into();
        let filters = SearchFilters { source_ids: Some(&allowed), path_predicate: None };
        let matches = store.search("s", &[1.0, 0.0], 10, &filters).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk.path, "docs/a.md");
    }

    #[test]
    fn invalid_scope_id_is_rejected() {
        let (_dir, store) = store();
        let err = store.replace_scope("../evil", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), "MIND_INVALID_FLAG");
    }
}
