//! Registry of externally-ingested documents.
//!
//! Documents are keyed by `(source, id, scope)` and persisted in a single
//! JSON registry file. Add/update delegate to the chunker and vector store
//! so the document is searchable; delete is a soft flag that hides chunks
//! from retrieval via the source-id filter, and `cleanup` physically removes
//! expired records together with their chunks.

use crate::chunker::{self, ChunkOptions};
use crate::config::{MindConfig, SyncConfig};
use crate::embed::EmbeddingClient;
use crate::error::{MindError, Result};
use crate::hash::now_millis;
use crate::storage::{FsStorage, Storage};
use crate::types::{artifact_bytes, GENERATOR, SCHEMA_VERSION};
use crate::vectors::{StoredMindChunk, VectorStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::debug;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocument {
    pub source: String,
    pub id: String,
    pub scope_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub deleted: bool,
    /// Epoch milliseconds; set exactly when `deleted` is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SyncDocument {
    /// `source:id:scope` — the primary key and the vector-store source id.
    pub fn source_id(&self) -> String {
        sync_source_id(&self.source, &self.id, &self.scope_id)
    }
}

pub fn sync_source_id(source: &str, id: &str, scope: &str) -> String {
    format!("{source}:{id}:{scope}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    schema_version: String,
    generator: String,
    documents: BTreeMap<String, SyncDocument>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncFilter {
    pub source: Option<String>,
    pub scope: Option<String>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub total: usize,
    pub active: usize,
    pub deleted: usize,
}

/// One operation in a batch.
#[derive(Debug, Clone)]
pub enum SyncOp {
    Add { source: String, id: String, scope: String, content: String, metadata: BTreeMap<String, Value> },
    Update { source: String, id: String, scope: String, content: Option<String>, metadata: Option<BTreeMap<String, Value>> },
    Delete { source: String, id: String, scope: String },
    Restore { source: String, id: String, scope: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct SyncRegistry<'a> {
    storage: FsStorage,
    config: SyncConfig,
    vectors: &'a VectorStore,
    embedder: &'a dyn EmbeddingClient,
}

impl<'a> SyncRegistry<'a> {
    pub fn new(root: &Path, vectors: &'a VectorStore, embedder: &'a dyn EmbeddingClient) -> Self {
        let config = MindConfig::load(root).sync;
        Self { storage: FsStorage::new(root), config, vectors, embedder }
    }

    fn load(&self) -> Result<RegistryFile> {
        if !self.storage.exists(&self.config.path) {
            return Ok(RegistryFile {
                schema_version: SCHEMA_VERSION.to_string(),
                generator: GENERATOR.to_string(),
                documents: BTreeMap::new(),
            });
        }
        let text = self.storage.read_to_string(&self.config.path)?;
        serde_json::from_str(&text).map_err(|e| MindError::Parse {
            path: self.config.path.clone(),
            detail: format!("registry is not valid JSON: {e}"),
        })
    }

    fn persist(&self, registry: &RegistryFile) -> Result<()> {
        self.storage.write(&self.config.path, &artifact_bytes(registry)?)
    }

    /// Chunk + embed a document and replace its chunks in the vector store.
    fn ingest(&self, doc: &SyncDocument) -> Result<()> {
        // A `path` metadata hint drives chunk-strategy selection; the
        // document id works when it carries an extension.
        let path = doc
            .metadata
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(&doc.id)
            .to_string();
        let chunks = chunker::chunk_source(&doc.content, &path, &ChunkOptions::for_path(&path))?;
        let source_id = doc.source_id();
        let mut stored = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let embedding = self.embedder.embed(&chunk.text)?;
            stored.push(StoredMindChunk {
                chunk_id: format!("{source_id}#{i}"),
                scope_id: doc.scope_id.clone(),
                source_id: source_id.clone(),
                path: path.clone(),
                embedding,
                chunk,
            });
        }
        self.vectors.replace_source(&doc.scope_id, &source_id, stored)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn add(
        &self,
        source: &str,
        id: &str,
        scope: &str,
        content: &str,
        metadata: BTreeMap<String, Value>,
    ) -> Result<SyncDocument> {
        let mut registry = self.load()?;
        let key = sync_source_id(source, id, scope);
        if registry.documents.get(&key).is_some_and(|d| !d.deleted) {
            return Err(MindError::InvalidFlag {
                flag: "id".to_string(),
                detail: format!("document {key} already exists; use update"),
            });
        }
        let now = now_millis();
        let doc = SyncDocument {
            source: source.to_string(),
            id: id.to_string(),
            scope_id: scope.to_string(),
            content: content.to_string(),
            metadata,
            deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.ingest(&doc)?;
        registry.documents.insert(key, doc.clone());
        self.persist(&registry)?;
        Ok(doc)
    }

    /// Partial update: `content` and `metadata` replace only when provided.
    pub fn update(
        &self,
        source: &str,
        id: &str,
        scope: &str,
        content: Option<&str>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<SyncDocument> {
        if !self.config.partial_updates && (content.is_none() || metadata.is_none()) {
            return Err(MindError::InvalidFlag {
                flag: "content".to_string(),
                detail: "partial updates are disabled; provide both content and metadata"
                    .to_string(),
            });
        }
        let mut registry = self.load()?;
        let key = sync_source_id(source, id, scope);
        let Some(doc) = registry.documents.get_mut(&key) else {
            return Err(MindError::InvalidFlag {
                flag: "id".to_string(),
                detail: format!("document {key} does not exist; use add"),
            });
        };
        if let Some(content) = content {
            doc.content = content.to_string();
        }
        if let Some(metadata) = metadata {
            doc.metadata = metadata;
        }
        doc.updated_at = now_millis();
        let snapshot = doc.clone();
        self.ingest(&snapshot)?;
        self.persist(&registry)?;
        Ok(snapshot)
    }

    /// Soft delete: the record stays until cleanup, its chunks are hidden
    /// from retrieval by the source-id filter.
    pub fn delete(&self, source: &str, id: &str, scope: &str) -> Result<()> {
        let mut registry = self.load()?;
        let key = sync_source_id(source, id, scope);
        let Some(doc) = registry.documents.get_mut(&key) else {
            return Err(MindError::InvalidFlag {
                flag: "id".to_string(),
                detail: format!("document {key} does not exist"),
            });
        };
        if self.config.soft_delete.enabled {
            doc.deleted = true;
            doc.deleted_at = Some(now_millis());
        } else {
            self.vectors.remove_source(scope, &key)?;
            registry.documents.remove(&key);
        }
        self.persist(&registry)
    }

    pub fn restore(&self, source: &str, id: &str, scope: &str) -> Result<SyncDocument> {
        let mut registry = self.load()?;
        let key = sync_source_id(source, id, scope);
        let Some(doc) = registry.documents.get_mut(&key) else {
            return Err(MindError::InvalidFlag {
                flag: "id".to_string(),
                detail: format!("document {key} does not exist"),
            });
        };
        doc.deleted = false;
        doc.deleted_at = None;
        doc.updated_at = now_millis();
        let snapshot = doc.clone();
        self.persist(&registry)?;
        Ok(snapshot)
    }

    pub fn list(&self, filter: &SyncFilter) -> Result<Vec<SyncDocument>> {
        let registry = self.load()?;
        Ok(registry
            .documents
            .into_values()
            .filter(|d| filter.include_deleted || !d.deleted)
            .filter(|d| filter.source.as_deref().is_none_or(|s| d.source == s))
            .filter(|d| filter.scope.as_deref().is_none_or(|s| d.scope_id == s))
            .collect())
    }

    pub fn status(&self, filter: &SyncFilter) -> Result<SyncStatus> {
        let all = self.list(&SyncFilter {
            source: filter.source.clone(),
            scope: filter.scope.clone(),
            include_deleted: true,
        })?;
        let deleted = all.iter().filter(|d| d.deleted).count();
        Ok(SyncStatus { total: all.len(), active: all.len() - deleted, deleted })
    }

    /// Process operations in order, reporting per-operation success. Refuses
    /// to start when the batch exceeds `max_size`.
    pub fn batch(&self, ops: Vec<SyncOp>, max_size: Option<usize>) -> Result<Vec<BatchResult>> {
        let max = max_size.unwrap_or(self.config.batch_max_size);
        if ops.len() > max {
            return Err(MindError::InvalidFlag {
                flag: "batch".to_string(),
                detail: format!("{} operations exceed the batch limit of {max}", ops.len()),
            });
        }
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match op {
                SyncOp::Add { source, id, scope, content, metadata } => {
                    self.add(&source, &id, &scope, &content, metadata).map(|_| ())
                }
                SyncOp::Update { source, id, scope, content, metadata } => {
                    self.update(&source, &id, &scope, content.as_deref(), metadata).map(|_| ())
                }
                SyncOp::Delete { source, id, scope } => self.delete(&source, &id, &scope),
                SyncOp::Restore { source, id, scope } => {
                    self.restore(&source, &id, &scope).map(|_| ())
                }
            };
            results.push(match outcome {
                Ok(()) => BatchResult { ok: true, error: None },
                Err(e) => BatchResult { ok: false, error: Some(e.to_string()) },
            });
        }
        Ok(results)
    }

    /// Physically remove soft-deleted records older than the TTL (and, when
    /// `deleted_only` is off, every record matching the filter), together
    /// with their vector chunks.
    pub fn cleanup(
        &self,
        filter: &SyncFilter,
        deleted_only: bool,
        ttl_days: Option<u64>,
    ) -> Result<usize> {
        let ttl_days = ttl_days.unwrap_or(self.config.soft_delete.ttl_days);
        let cutoff = now_millis().saturating_sub(ttl_days * 86_400_000);
        let mut registry = self.load()?;
        let mut removed_keys = Vec::new();
        for (key, doc) in &registry.documents {
            if let Some(source) = filter.source.as_deref() {
                if doc.source != source {
                    continue;
                }
            }
            if let Some(scope) = filter.scope.as_deref() {
                if doc.scope_id != scope {
                    continue;
                }
            }
            let expired = doc.deleted && doc.deleted_at.is_some_and(|at| at <= cutoff);
            if expired || !deleted_only {
                removed_keys.push((key.clone(), doc.scope_id.clone()));
            }
        }
        for (key, scope) in &removed_keys {
            self.vectors.remove_source(scope, key)?;
            registry.documents.remove(key);
        }
        debug!(removed = removed_keys.len(), "sync cleanup");
        self.persist(&registry)?;
        Ok(removed_keys.len())
    }

    /// Source ids visible to retrieval: every non-deleted document in the
    /// scope. Feed this into the vector search filter.
    pub fn active_source_ids(&self, scope: &str) -> Result<HashSet<String>> {
        let registry = self.load()?;
        Ok(registry
            .documents
            .values()
            .filter(|d| !d.deleted && d.scope_id == scope)
            .map(SyncDocument::source_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::vectors::SearchFilters;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        vectors: VectorStore,
        embedder: HashEmbedder,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let vectors = VectorStore::new(FsStorage::new(&root));
            Self { _dir: dir, root, vectors, embedder: HashEmbedder::default() }
        }

        fn registry(&self) -> SyncRegistry<'_> {
            SyncRegistry::new(&self.root, &self.vectors, &self.embedder)
        }
    }

    #[test]
    fn add_list_delete_restore_lifecycle() {
        let fx = Fixture::new();
        let registry = fx.registry();
        registry
            .add("confluence", "page-1", "kb", "# Page\n\nSome body text.\n", BTreeMap::new())
            .unwrap();

        let listed = registry.list(&SyncFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);

        registry.delete("confluence", "page-1", "kb").unwrap();
        assert!(registry.list(&SyncFilter::default()).unwrap().is_empty());
        let with_deleted =
            registry.list(&SyncFilter { include_deleted: true, ..Default::default() }).unwrap();
        assert_eq!(with_deleted.len(), 1);
        assert!(with_deleted[0].deleted);
        assert!(with_deleted[0].deleted_at.is_some());

        registry.restore("confluence", "page-1", "kb").unwrap();
        let listed = registry.list(&SyncFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].deleted);
        assert!(listed[0].deleted_at.is_none());
    }

    #[test]
    fn soft_deleted_documents_are_filtered_from_search() {
        let fx = Fixture::new();
        let registry = fx.registry();
        registry
            .add("wiki", "a", "kb", "alpha document about parsing\n", BTreeMap::new())
            .unwrap();
        registry
            .add("wiki", "b", "kb", "beta document about rendering\n", BTreeMap::new())
            .unwrap();
        registry.delete("wiki", "b", "kb").unwrap();

        let allowed = registry.active_source_ids("kb").unwrap();
        assert_eq!(allowed.len(), 1);
        let query = fx.embedder.embed("document").unwrap();
        let filters = SearchFilters { source_ids: Some(&allowed), path_predicate: None };
        let matches = fx.vectors.search("kb", &query, 10, &filters).unwrap();
        assert!(!matches.is_empty());
        assert!(matches.iter().all(|m| m.chunk.source_id == "wiki:a:kb"));
    }

    #[test]
    fn cleanup_with_zero_ttl_purges_soft_deleted() {
        let fx = Fixture::new();
        let registry = fx.registry();
        registry.add("wiki", "a", "kb", "to be removed\n", BTreeMap::new()).unwrap();
        registry.delete("wiki", "a", "kb").unwrap();

        let removed = registry.cleanup(&SyncFilter::default(), true, Some(0)).unwrap();
        assert_eq!(removed, 1);
        let all =
            registry.list(&SyncFilter { include_deleted: true, ..Default::default() }).unwrap();
        assert!(all.is_empty());
        // Chunks are physically gone.
        let query = fx.embedder.embed("removed").unwrap();
        let matches = fx.vectors.search("kb", &query, 10, &SearchFilters::default()).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn batch_refuses_oversized_and_reports_per_op() {
        let fx = Fixture::new();
        let registry = fx.registry();
        let op = |id: &str| SyncOp::Add {
            source: "s".into(),
            id: id.into(),
            scope: "kb".into(),
            content: "text\n".into(),
            metadata: BTreeMap::new(),
        };
        let err = registry.batch(vec![op("1"), op("2")], Some(1)).unwrap_err();
        assert_eq!(err.kind(), "MIND_INVALID_FLAG");

        let results = registry
            .batch(
                vec![
                    op("1"),
                    op("1"), // duplicate add fails, batch continues
                    SyncOp::Delete { source: "s".into(), id: "1".into(), scope: "kb".into() },
                ],
                None,
            )
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(results[2].ok);
    }

    #[test]
    fn partial_update_replaces_only_content() {
        let fx = Fixture::new();
        let registry = fx.registry();
        let mut metadata = BTreeMap::new();
        metadata.insert("path".to_string(), Value::String("docs/a.md".into()));
        registry.add("wiki", "a", "kb", "old content\n", metadata.clone()).unwrap();
        let updated = registry.update("wiki", "a", "kb", Some("new content\n"), None).unwrap();
        assert_eq!(updated.content, "new content\n");
        assert_eq!(updated.metadata, metadata);
    }
}
