//! Query contracts, the cache law, and pack budget behavior.

mod helpers;

use helpers::TestWorkspace;
use kb_mind_core::config::{PathMode, Truncation};
use kb_mind_core::indexer::{Indexer, UpdateOptions};
use kb_mind_core::pack::{feed, FeedOptions, PackAssembler, PackBudget, PackRequest};
use kb_mind_core::query::{CacheMode, QueryEngine, QueryKind, QueryOptions, QueryParams};

fn prepared() -> TestWorkspace {
    let ws = TestWorkspace::from_fixture("basic");
    let indexer = Indexer::new(&ws.root);
    indexer.init(false).unwrap();
    indexer.update(&UpdateOptions::default()).unwrap();
    ws
}

fn options() -> QueryOptions {
    QueryOptions {
        limit: 500,
        depth: 5,
        cache_ttl_secs: 60,
        cache_mode: CacheMode::Local,
        no_cache: false,
        path_mode: PathMode::Id,
        ai_mode: false,
    }
}

fn file_params(file: &str) -> QueryParams {
    QueryParams { file: Some(file.to_string()), ..QueryParams::default() }
}

// ---------------------------------------------------------------------------
// Query contracts
// ---------------------------------------------------------------------------

#[test]
fn impact_lists_importers_with_symbols() {
    let ws = prepared();
    let engine = QueryEngine::new(&ws.root);
    let resp = engine.execute(QueryKind::Impact, &file_params("src/a.ts"), &options()).unwrap();
    let importers = resp.result["importers"].as_array().unwrap();
    let files: Vec<&str> = importers.iter().map(|i| i["file"].as_str().unwrap()).collect();
    assert!(files.contains(&"src/b.ts"));
    assert!(files.contains(&"src/index.ts"));
    let b = importers.iter().find(|i| i["file"] == "src/b.ts").unwrap();
    assert_eq!(b["symbols"].as_array().unwrap(), &[serde_json::json!("x")]);
    assert!(!resp.meta.cached);
    assert!(resp.meta.tokens_estimate > 0);
}

#[test]
fn exports_scope_externals_chain_docs_meta() {
    let ws = prepared();
    let engine = QueryEngine::new(&ws.root);

    let resp = engine.execute(QueryKind::Exports, &file_params("src/a.ts"), &options()).unwrap();
    let names: Vec<&str> = resp.result["exports"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["x", "double"]);

    let params = QueryParams { path: Some("src/services".into()), ..QueryParams::default() };
    let resp = engine.execute(QueryKind::Scope, &params, &options()).unwrap();
    assert_eq!(resp.result["count"], 1);
    assert_eq!(resp.result["files"][0], "src/services/core.ts");

    let resp = engine.execute(QueryKind::Externals, &QueryParams::default(), &options()).unwrap();
    assert_eq!(resp.result["externals"]["lodash"][0], "src/b.ts");
    assert_eq!(resp.result["count"], 1);

    let resp = engine.execute(QueryKind::Chain, &file_params("src/index.ts"), &options()).unwrap();
    let chain: Vec<&str> = resp.result["chain"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["file"].as_str().unwrap())
        .collect();
    assert!(chain.contains(&"src/a.ts"));
    assert!(chain.contains(&"src/services/core.ts"));

    let resp = engine.execute(QueryKind::Docs, &QueryParams::default(), &options()).unwrap();
    assert_eq!(resp.result["count"], 2);
    let params = QueryParams { search: Some("usage".into()), ..QueryParams::default() };
    let resp = engine.execute(QueryKind::Docs, &params, &options()).unwrap();
    assert_eq!(resp.result["count"], 1);
    assert_eq!(resp.result["docs"][0]["path"], "docs/guide.md");

    let resp = engine.execute(QueryKind::Meta, &QueryParams::default(), &options()).unwrap();
    let pkg = &resp.result["packages"][0];
    assert_eq!(pkg["name"], "demo-app");
    assert_eq!(pkg["externalDeps"][0], "lodash");
}

#[test]
fn missing_required_param_and_unknown_file_error() {
    let ws = prepared();
    let engine = QueryEngine::new(&ws.root);
    let err = engine.execute(QueryKind::Impact, &QueryParams::default(), &options()).unwrap_err();
    assert_eq!(err.kind(), "MIND_INVALID_FLAG");

    let err =
        engine.execute(QueryKind::Exports, &file_params("src/nope.ts"), &options()).unwrap_err();
    assert_eq!(err.kind(), "MIND_QUERY_ERROR");
}

#[test]
fn queries_without_index_report_no_index() {
    let ws = TestWorkspace::empty();
    let engine = QueryEngine::new(&ws.root);
    let err = engine.execute(QueryKind::Meta, &QueryParams::default(), &options()).unwrap_err();
    assert_eq!(err.kind(), "MIND_NO_INDEX");
    assert_eq!(err.exit_code(), 2);
}

// ---------------------------------------------------------------------------
// Cache law
// ---------------------------------------------------------------------------

#[test]
fn cache_hits_within_ttl_and_invalidates_on_index_change() {
    let ws = prepared();
    let engine = QueryEngine::new(&ws.root);
    let params = file_params("src/a.ts");

    let first = engine.execute(QueryKind::Impact, &params, &options()).unwrap();
    assert!(!first.meta.cached);
    let second = engine.execute(QueryKind::Impact, &params, &options()).unwrap();
    assert!(second.meta.cached);
    assert_eq!(first.result, second.result);

    // Touch a source file and re-index: hashes drift, the cache misses.
    ws.write("src/a.ts", "export const x = 2;\n");
    Indexer::new(&ws.root).update(&UpdateOptions::default()).unwrap();
    let third = engine.execute(QueryKind::Impact, &params, &options()).unwrap();
    assert!(!third.meta.cached);
}

#[test]
fn ci_mode_and_no_cache_bypass_the_cache() {
    let ws = prepared();
    let engine = QueryEngine::new(&ws.root);
    let params = file_params("src/a.ts");

    let mut ci = options();
    ci.cache_mode = CacheMode::Ci;
    assert!(!engine.execute(QueryKind::Impact, &params, &ci).unwrap().meta.cached);
    assert!(!engine.execute(QueryKind::Impact, &params, &ci).unwrap().meta.cached);

    let mut no_cache = options();
    no_cache.no_cache = true;
    assert!(!engine.execute(QueryKind::Impact, &params, &no_cache).unwrap().meta.cached);
    assert!(!engine.execute(QueryKind::Impact, &params, &no_cache).unwrap().meta.cached);
}

// ---------------------------------------------------------------------------
// Pack budget law (S6 included)
// ---------------------------------------------------------------------------

#[test]
fn pack_is_deterministic_and_within_budget() {
    let ws = prepared();
    let assembler = PackAssembler::new(&ws.root);
    let mut request = PackRequest::new("demo");
    request.seed = Some(42);

    let first = assembler.assemble(&request).unwrap();
    let second = assembler.assemble(&request).unwrap();
    assert_eq!(first.json, second.json);
    assert_eq!(first.markdown, second.markdown);
    assert_eq!(first.tokens_estimate, second.tokens_estimate);
    assert_eq!(first.json["sections"]["intent_summary"], second.json["sections"]["intent_summary"]);
    assert_eq!(first.json["seed"], 42);
    assert_eq!(first.json["deterministic"], true);

    // Total and per-section budgets hold (caps are preset-weighted).
    assert!(first.tokens_estimate <= 8000);
    let usage = first.json["sectionUsage"].as_object().unwrap();
    let caps = first.json["budgetApplied"]["caps"].as_object().unwrap();
    for (name, tokens) in usage {
        if let Some(cap) = caps.get(name) {
            assert!(
                tokens.as_u64().unwrap() <= cap.as_u64().unwrap(),
                "section {name} exceeds its cap"
            );
        }
    }
}

#[test]
fn tight_pack_budget_drops_sections_but_keeps_intent() {
    let ws = prepared();
    let assembler = PackAssembler::new(&ws.root);
    let mut request = PackRequest::new("fit into almost nothing");
    request.budget = Some(PackBudget {
        total_tokens: 40,
        caps: Default::default(),
        truncation: Truncation::End,
    });
    let out = assembler.assemble(&request).unwrap();
    assert!(out.tokens_estimate <= 40);
    let sections = out.json["sections"].as_object().unwrap();
    assert!(sections.contains_key("intent_summary"));
}

#[test]
fn pack_writes_output_artifact_when_asked() {
    let ws = prepared();
    let assembler = PackAssembler::new(&ws.root);
    let mut request = PackRequest::new("persisted pack");
    request.out = Some(".kb/mind/query/pack-demo.json".to_string());
    request.with_bundle = true;
    let out = assembler.assemble(&request).unwrap();
    let written = ws.artifact(".kb/mind/query/pack-demo.json");
    assert_eq!(written["intent"], "persisted pack");
    assert_eq!(written["bundle"].as_str().unwrap(), out.markdown);
}

// ---------------------------------------------------------------------------
// feed
// ---------------------------------------------------------------------------

#[test]
fn feed_runs_update_then_pack() {
    let ws = TestWorkspace::from_fixture("basic");
    Indexer::new(&ws.root).init(false).unwrap();

    let outcome = feed(
        &ws.root,
        FeedOptions { no_update: false, update: None, pack: PackRequest::new("feed test") },
    )
    .unwrap();
    let update = outcome.update.expect("feed should have updated");
    assert!(update.api.added >= 4);
    assert!(outcome.pack.tokens_estimate > 0);

    let outcome = feed(
        &ws.root,
        FeedOptions { no_update: true, update: None, pack: PackRequest::new("no update") },
    )
    .unwrap();
    assert!(outcome.update.is_none());
}
