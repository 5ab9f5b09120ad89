//! Vector-store integration: workspace scope sync during update, search
//! ordering, and registry-driven soft-delete filtering.

mod helpers;

use helpers::TestWorkspace;
use kb_mind_core::embed::{EmbeddingClient, HashEmbedder};
use kb_mind_core::indexer::{Indexer, UpdateOptions, VectorSync};
use kb_mind_core::storage::FsStorage;
use kb_mind_core::sync::{SyncFilter, SyncRegistry};
use kb_mind_core::vectors::{SearchFilters, VectorStore};
use std::collections::BTreeMap;

fn update_with_sync(ws: &TestWorkspace, store: &VectorStore, embedder: &HashEmbedder) {
    let indexer = Indexer::new(&ws.root);
    if !ws.root.join(".kb/mind/index.json").exists() {
        indexer.init(false).unwrap();
    }
    indexer
        .update(&UpdateOptions {
            vector_sync: Some(VectorSync { store, embedder, scope_id: "workspace" }),
            ..UpdateOptions::default()
        })
        .unwrap();
}

#[test]
fn update_populates_the_workspace_scope() {
    let ws = TestWorkspace::from_fixture("basic");
    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    update_with_sync(&ws, &store, &embedder);

    assert!(store.scope_exists("workspace"));
    let query = embedder.embed("CoreService facade start").unwrap();
    let matches = store.search("workspace", &query, 5, &SearchFilters::default()).unwrap();
    assert!(!matches.is_empty());
    assert_eq!(matches[0].chunk.path, "src/services/core.ts");

    // Top-k is capped and ordering is non-increasing.
    let all = store.search("workspace", &query, 3, &SearchFilters::default()).unwrap();
    assert!(all.len() <= 3);
    for pair in all.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn changed_files_replace_their_chunks() {
    let ws = TestWorkspace::from_fixture("basic");
    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    update_with_sync(&ws, &store, &embedder);

    ws.write(
        "src/a.ts",
        "/** Rewritten. */\nexport const zebra_constant = 99;\n",
    );
    update_with_sync(&ws, &store, &embedder);

    let query = embedder.embed("zebra_constant").unwrap();
    let matches = store.search("workspace", &query, 5, &SearchFilters::default()).unwrap();
    assert_eq!(matches[0].chunk.path, "src/a.ts");
    assert!(matches[0].chunk.chunk.text.contains("zebra_constant"));
    // Stale chunk text from the old version is gone.
    let stale = store
        .search("workspace", &embedder.embed("Doubles a number").unwrap(), 20, &SearchFilters::default())
        .unwrap();
    assert!(stale.iter().all(|m| !m.chunk.chunk.text.contains("double")));
}

#[test]
fn deleted_files_leave_the_scope() {
    let ws = TestWorkspace::from_fixture("basic");
    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    update_with_sync(&ws, &store, &embedder);

    ws.delete("src/b.ts");
    let indexer = Indexer::new(&ws.root);
    indexer
        .update(&UpdateOptions {
            changed: Some(vec!["src/b.ts".to_string()]),
            vector_sync: Some(VectorSync { store: &store, embedder: &embedder, scope_id: "workspace" }),
            ..UpdateOptions::default()
        })
        .unwrap();

    let query = embedder.embed("useX identity").unwrap();
    let matches = store.search("workspace", &query, 20, &SearchFilters::default()).unwrap();
    assert!(matches.iter().all(|m| m.chunk.path != "src/b.ts"));
}

#[test]
fn oversized_sources_stream_into_line_chunks() {
    let ws = TestWorkspace::from_fixture("basic");
    // Well past the streaming threshold, still under the indexer size cap.
    let big: String = (1..=12_000).map(|i| format!("export const k{i} = {i};\n")).collect();
    assert!(big.len() > 200 * 1024);
    ws.write("src/big.ts", &big);

    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    update_with_sync(&ws, &store, &embedder);

    let query = embedder.embed("k11999").unwrap();
    let matches = store.search("workspace", &query, 5, &SearchFilters::default()).unwrap();
    assert_eq!(matches[0].chunk.path, "src/big.ts");
    // Streamed files yield plain line chunks, not declaration chunks.
    assert_eq!(matches[0].chunk.chunk.chunk_type, kb_mind_core::chunker::ChunkType::Lines);
    assert!(matches[0].chunk.chunk.text.contains("k11999"));
}

#[test]
fn registry_documents_share_scopes_with_search_filtering() {
    let ws = TestWorkspace::from_fixture("basic");
    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    let registry = SyncRegistry::new(&ws.root, &store, &embedder);

    let mut metadata = BTreeMap::new();
    metadata.insert("path".to_string(), serde_json::Value::String("pages/runbook.md".into()));
    registry
        .add(
            "confluence",
            "runbook",
            "ops",
            "# Runbook\n\nRestart the ingest worker when the queue stalls.\n",
            metadata,
        )
        .unwrap();

    let query = embedder.embed("restart ingest worker queue").unwrap();
    let allowed = registry.active_source_ids("ops").unwrap();
    let filters = SearchFilters { source_ids: Some(&allowed), path_predicate: None };
    let matches = store.search("ops", &query, 5, &filters).unwrap();
    assert!(!matches.is_empty());
    assert_eq!(matches[0].chunk.source_id, "confluence:runbook:ops");

    // Soft delete hides it from filtered search without rewriting the scope.
    registry.delete("confluence", "runbook", "ops").unwrap();
    let allowed = registry.active_source_ids("ops").unwrap();
    let filters = SearchFilters { source_ids: Some(&allowed), path_predicate: None };
    assert!(store.search("ops", &query, 5, &filters).unwrap().is_empty());
    // The raw scope still holds the chunks until cleanup.
    assert!(!store.search("ops", &query, 5, &SearchFilters::default()).unwrap().is_empty());

    registry.cleanup(&SyncFilter::default(), true, Some(0)).unwrap();
    assert!(store.search("ops", &query, 5, &SearchFilters::default()).unwrap().is_empty());
}

#[test]
fn path_predicate_filters_matches() {
    let ws = TestWorkspace::from_fixture("basic");
    let store = VectorStore::new(FsStorage::new(&ws.root));
    let embedder = HashEmbedder::default();
    update_with_sync(&ws, &store, &embedder);

    let query = embedder.embed("export const").unwrap();
    let pred = |path: &str| path.starts_with("src/services/");
    let filters = SearchFilters { source_ids: None, path_predicate: Some(&pred) };
    let matches = store.search("workspace", &query, 20, &filters).unwrap();
    assert!(!matches.is_empty());
    assert!(matches.iter().all(|m| m.chunk.path.starts_with("src/services/")));
}
