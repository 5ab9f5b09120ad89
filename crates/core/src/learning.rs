//! Append-only JSONL segment stores for query history and chunk feedback.
//!
//! Both stores share the same rotation scheme: a segment takes records until
//! `max_records_per_file`, then a new timestamped segment starts; segments
//! beyond `max_files` age out oldest-first. Append failures are logged and
//! swallowed — telemetry never breaks the retrieval loop.

use crate::hash::{cosine_similarity, now_millis};
use crate::storage::{FsStorage, Storage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Minimum similarity for `HistoryStore::similar` recall.
pub const SIMILARITY_THRESHOLD: f32 = 0.7;

// ---------------------------------------------------------------------------
// Generic JSONL segment store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub base_path: String,
    pub file_prefix: String,
    pub max_records_per_file: usize,
    pub max_files: usize,
}

impl JsonlConfig {
    pub fn new(base_path: impl Into<String>, file_prefix: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            file_prefix: file_prefix.into(),
            max_records_per_file: 1000,
            max_files: 30,
        }
    }
}

/// Envelope written per line: `{"v":1,"record":{...}}`.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    v: u32,
    record: T,
}

pub struct JsonlStore {
    storage: FsStorage,
    config: JsonlConfig,
}

impl JsonlStore {
    pub fn new(storage: FsStorage, config: JsonlConfig) -> Self {
        Self { storage, config }
    }

    fn segments(&self) -> Vec<String> {
        // Sorted listing + timestamped names = chronological order.
        self.storage
            .list(&self.config.base_path)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                p.rsplit('/')
                    .next()
                    .map(|name| {
                        name.starts_with(self.config.file_prefix.as_str())
                            && name.ends_with(".jsonl")
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    fn active_segment(&self) -> String {
        let segments = self.segments();
        if let Some(last) = segments.last() {
            let records = self
                .storage
                .read_to_string(last)
                .map(|text| text.lines().count())
                .unwrap_or(usize::MAX);
            if records < self.config.max_records_per_file {
                return last.clone();
            }
        }
        // The segment ordinal keeps names unique within one millisecond
        // while preserving lexicographic order.
        format!(
            "{}/{}-{:013}-{:04}.jsonl",
            self.config.base_path,
            self.config.file_prefix,
            now_millis(),
            segments.len()
        )
    }

    /// Append one record. Write failures are logged, never propagated.
    pub fn append<T: Serialize>(&self, record: &T) {
        let line = match serde_json::to_string(&Envelope { v: 1, record }) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize telemetry record");
                return;
            }
        };
        let segment = self.active_segment();
        let mut content = match self.storage.read_to_string(&segment) {
            Ok(existing) => existing,
            Err(_) => String::new(),
        };
        content.push_str(&line);
        content.push('\n');
        if let Err(e) = self.storage.write(&segment, content.as_bytes()) {
            warn!(segment, error = %e, "failed to append telemetry record");
            return;
        }
        self.prune();
    }

    fn prune(&self) {
        let segments = self.segments();
        if segments.len() <= self.config.max_files {
            return;
        }
        for stale in &segments[..segments.len() - self.config.max_files] {
            if let Err(e) = self.storage.delete(stale) {
                warn!(segment = stale.as_str(), error = %e, "failed to prune segment");
            }
        }
    }

    /// Read records oldest-first, filtered, stopping at `limit`.
    pub fn read<T: DeserializeOwned>(
        &self,
        limit: usize,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Vec<T> {
        let mut out = Vec::new();
        for segment in self.segments() {
            let Ok(text) = self.storage.read_to_string(&segment) else {
                continue;
            };
            for line in text.lines() {
                if out.len() >= limit {
                    return out;
                }
                match serde_json::from_str::<Envelope<T>>(line) {
                    Ok(envelope) if predicate(&envelope.record) => out.push(envelope.record),
                    _ => {}
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// History store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub query_id: String,
    pub scope_id: String,
    pub query: String,
    pub query_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_vector: Option<Vec<f32>>,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub result_summary: String,
}

pub struct HistoryStore {
    inner: JsonlStore,
}

impl HistoryStore {
    pub fn new(storage: FsStorage, base_path: &str) -> Self {
        Self { inner: JsonlStore::new(storage, JsonlConfig::new(base_path, "history")) }
    }

    pub fn with_config(storage: FsStorage, config: JsonlConfig) -> Self {
        Self { inner: JsonlStore::new(storage, config) }
    }

    pub fn append(&self, record: &HistoryRecord) {
        self.inner.append(record);
    }

    pub fn recent(&self, scope: Option<&str>, limit: usize) -> Vec<HistoryRecord> {
        self.inner
            .read(limit, |r: &HistoryRecord| scope.is_none_or(|s| r.scope_id == s))
    }

    /// Prior queries whose stored vector is cosine-similar to `query_vector`
    /// above the recall threshold, most similar first.
    pub fn similar(&self, query_vector: &[f32], limit: usize) -> Vec<(f32, HistoryRecord)> {
        let mut scored: Vec<(f32, HistoryRecord)> = self
            .inner
            .read(usize::MAX, |r: &HistoryRecord| r.query_vector.is_some())
            .into_iter()
            .filter_map(|r| {
                let score = cosine_similarity(query_vector, r.query_vector.as_deref()?);
                if score > SIMILARITY_THRESHOLD {
                    Some((score, r))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.query_id.cmp(&b.1.query_id))
        });
        scored.truncate(limit);
        scored
    }
}

// ---------------------------------------------------------------------------
// Feedback store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Implicit,
    Explicit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub feedback_id: String,
    pub query_id: String,
    pub chunk_id: String,
    pub scope_id: String,
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    /// Clamped to [0, 1] on append.
    pub score: f64,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Aggregate per-chunk feedback used by adaptive ranking.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFeedback {
    pub avg_score: f64,
    pub count: usize,
}

pub struct FeedbackStore {
    inner: JsonlStore,
}

impl FeedbackStore {
    pub fn new(storage: FsStorage, base_path: &str) -> Self {
        Self { inner: JsonlStore::new(storage, JsonlConfig::new(base_path, "feedback")) }
    }

    pub fn with_config(storage: FsStorage, config: JsonlConfig) -> Self {
        Self { inner: JsonlStore::new(storage, config) }
    }

    pub fn append(&self, entry: &FeedbackEntry) {
        let mut entry = entry.clone();
        entry.score = entry.score.clamp(0.0, 1.0);
        self.inner.append(&entry);
    }

    /// Per-chunk average score and usage count, optionally scoped.
    pub fn chunk_stats(&self, scope: Option<&str>) -> BTreeMap<String, ChunkFeedback> {
        let entries = self
            .inner
            .read(usize::MAX, |e: &FeedbackEntry| scope.is_none_or(|s| e.scope_id == s));
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for entry in entries {
            let slot = sums.entry(entry.chunk_id).or_insert((0.0, 0));
            slot.0 += entry.score;
            slot.1 += 1;
        }
        sums.into_iter()
            .map(|(chunk_id, (sum, count))| {
                (chunk_id, ChunkFeedback { avg_score: sum / count as f64, count })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_store(max_records: usize, max_files: usize) -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let config = JsonlConfig {
            base_path: ".kb/mind/learning/history".into(),
            file_prefix: "history".into(),
            max_records_per_file: max_records,
            max_files,
        };
        (dir, HistoryStore::with_config(storage, config))
    }

    fn record(id: &str, vector: Option<Vec<f32>>) -> HistoryRecord {
        HistoryRecord {
            query_id: id.to_string(),
            scope_id: "kb".to_string(),
            query: format!("query {id}"),
            query_hash: format!("hash-{id}"),
            query_vector: vector,
            timestamp: now_millis(),
            result_summary: "ok".to_string(),
        }
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (_dir, store) = history_store(1000, 30);
        store.append(&record("1", None));
        store.append(&record("2", None));
        let all = store.recent(Some("kb"), 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].query_id, "1");
        assert_eq!(store.recent(Some("other"), 10).len(), 0);
    }

    #[test]
    fn segments_rotate_at_record_cap() {
        let (dir, store) = history_store(2, 30);
        for i in 0..5 {
            store.append(&record(&i.to_string(), None));
        }
        let storage = FsStorage::new(dir.path());
        let segments = storage.list(".kb/mind/learning/history").unwrap();
        assert!(segments.len() >= 2, "expected rotation, got {segments:?}");
        assert_eq!(store.recent(None, 100).len(), 5);
    }

    #[test]
    fn similar_applies_cosine_threshold() {
        let (_dir, store) = history_store(1000, 30);
        store.append(&record("close", Some(vec![1.0, 0.05])));
        store.append(&record("far", Some(vec![0.0, 1.0])));
        store.append(&record("none", None));
        let hits = store.similar(&[1.0, 0.0], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.query_id, "close");
    }

    #[test]
    fn feedback_scores_clamp_and_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeedbackStore::new(FsStorage::new(dir.path()), ".kb/mind/learning/feedback");
        let entry = |chunk: &str, score: f64| FeedbackEntry {
            feedback_id: uuid::Uuid::new_v4().to_string(),
            query_id: "q".into(),
            chunk_id: chunk.into(),
            scope_id: "kb".into(),
            feedback_type: FeedbackType::Implicit,
            score,
            timestamp: now_millis(),
            metadata: BTreeMap::new(),
        };
        store.append(&entry("c1", 0.5));
        store.append(&entry("c1", 2.0)); // clamped to 1.0
        store.append(&entry("c2", 0.25));
        let stats = store.chunk_stats(Some("kb"));
        assert_eq!(stats["c1"].count, 2);
        assert!((stats["c1"].avg_score - 0.75).abs() < 1e-9);
        assert_eq!(stats["c2"].count, 1);
    }
}
