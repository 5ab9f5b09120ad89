//! Artifact integrity verification.
//!
//! Re-hashes every artifact referenced by the manifest and checks the
//! composite checksum. Mismatches and missing files are reported as
//! inconsistencies rather than errors, so a caller always gets the full
//! picture in one pass.

use crate::error::Result;
use crate::hash::hash_value;
use crate::storage::{FsStorage, Storage};
use crate::types::*;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub file: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub inconsistencies: Vec<Inconsistency>,
    pub hint: String,
}

impl VerifyReport {
    fn healthy() -> Self {
        Self {
            ok: true,
            code: None,
            inconsistencies: Vec::new(),
            hint: "index artifacts are consistent".to_string(),
        }
    }

    fn inconsistent(inconsistencies: Vec<Inconsistency>) -> Self {
        Self {
            ok: false,
            code: Some("MIND_INDEX_INCONSISTENT".to_string()),
            inconsistencies,
            hint: "re-run `update` to rebuild the index artifacts".to_string(),
        }
    }
}

/// Parse an artifact file into a canonical-hashable value. Returns an
/// inconsistency instead of erroring on missing or unparsable files.
fn load_value(
    storage: &FsStorage,
    path: &str,
    expected: &str,
    issues: &mut Vec<Inconsistency>,
) -> Option<Value> {
    if !storage.exists(path) {
        issues.push(Inconsistency {
            file: path.to_string(),
            expected: expected.to_string(),
            actual: "missing".to_string(),
        });
        return None;
    }
    let text = match storage.read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            issues.push(Inconsistency {
                file: path.to_string(),
                expected: expected.to_string(),
                actual: format!("unreadable: {e}"),
            });
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            issues.push(Inconsistency {
                file: path.to_string(),
                expected: expected.to_string(),
                actual: format!("unparsable: {e}"),
            });
            None
        }
    }
}

/// Verify a workspace's index artifacts against their recorded hashes.
pub fn verify(root: &Path) -> Result<VerifyReport> {
    let storage = FsStorage::new(root);
    if !storage.exists(INDEX_FILE) {
        return Ok(VerifyReport {
            ok: false,
            code: Some("MIND_NO_INDEX".to_string()),
            inconsistencies: vec![Inconsistency {
                file: INDEX_FILE.to_string(),
                expected: "present".to_string(),
                actual: "missing".to_string(),
            }],
            hint: format!("run `init` and `update` first to create {MIND_DIR}"),
        });
    }
    let manifest: MindIndex = match read_artifact(&storage, INDEX_FILE) {
        Ok(m) => m,
        Err(e) => {
            return Ok(VerifyReport {
                ok: false,
                code: Some("MIND_INDEX_INCONSISTENT".to_string()),
                inconsistencies: vec![Inconsistency {
                    file: INDEX_FILE.to_string(),
                    expected: "valid manifest".to_string(),
                    actual: e.to_string(),
                }],
                hint: "re-run `init --force` and `update`".to_string(),
            });
        }
    };

    let mut issues = Vec::new();

    // Per-artifact hashes recorded in the manifest.
    let checks = [
        (API_INDEX_FILE, &manifest.api_index_hash),
        (DEPS_FILE, &manifest.deps_hash),
        (RECENT_DIFF_FILE, &manifest.recent_diff_hash),
    ];
    let mut values: Vec<Option<Value>> = Vec::new();
    for (path, expected) in checks {
        let value = load_value(&storage, path, expected, &mut issues);
        if let Some(value) = &value {
            let actual = hash_value(value);
            if actual != *expected {
                issues.push(Inconsistency {
                    file: path.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        values.push(value);
    }

    // Meta and docs have no individual recorded hash but participate in the
    // composite checksum.
    let meta_value = load_value(&storage, META_FILE, "present", &mut issues);
    let docs_value = load_value(&storage, DOCS_FILE, "present", &mut issues);

    // Composite checksum over the raw parsed values, so even a mutation a
    // typed round-trip would drop (an injected field, say) is caught.
    if issues.is_empty() {
        let composite = serde_json::json!({
            "apiIndex": values[0].clone().unwrap_or_default(),
            "deps": values[1].clone().unwrap_or_default(),
            "recentDiff": values[2].clone().unwrap_or_default(),
            "meta": meta_value.unwrap_or_default(),
            "docs": docs_value.unwrap_or_default(),
        });
        let actual = hash_value(&composite);
        if actual != manifest.index_checksum {
            issues.push(Inconsistency {
                file: INDEX_FILE.to_string(),
                expected: manifest.index_checksum.clone(),
                actual,
            });
        }
    }

    if issues.is_empty() {
        Ok(VerifyReport::healthy())
    } else {
        Ok(VerifyReport::inconsistent(issues))
    }
}
