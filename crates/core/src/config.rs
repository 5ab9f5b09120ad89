//! Runtime configuration.
//!
//! Defaults match the documented option set; a `.kbmind.toml` at the
//! workspace root can override any of them. Unknown keys are ignored so old
//! configs keep working across releases.

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

pub const CONFIG_FILE: &str = ".kbmind.toml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Wall-clock budget for the indexing stage inside `feed`.
    pub time_budget_ms: u64,
    /// Files above this size are never read into memory by the indexer.
    pub max_file_size_bytes: u64,
    /// Per-file cap on lines included in pack snippets.
    pub max_snippet_lines: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: 800,
            max_file_size_bytes: 1_572_864, // 1.5 MiB
            max_snippet_lines: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub cache_ttl_secs: u64,
    pub limit: usize,
    pub depth: usize,
    pub path_mode: PathMode,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60, limit: 500, depth: 5, path_mode: PathMode::Id }
    }
}

/// Path output style for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Workspace-relative POSIX paths (the identity used by the index).
    Id,
    /// Absolute paths resolved against the workspace root.
    Absolute,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackCaps {
    pub intent_summary: usize,
    pub product_overview: usize,
    pub api_signatures: usize,
    pub recent_diffs: usize,
    pub impl_snippets: usize,
    pub configs_profiles: usize,
}

impl Default for PackCaps {
    fn default() -> Self {
        Self {
            intent_summary: 300,
            product_overview: 600,
            api_signatures: 2200,
            recent_diffs: 1200,
            impl_snippets: 3000,
            configs_profiles: 700,
        }
    }
}

/// Preset weights multiplied into section caps before truncation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackPreset {
    pub overview: f64,
    pub api: f64,
    pub diffs: f64,
    pub snippets: f64,
    pub configs: f64,
}

impl Default for PackPreset {
    fn default() -> Self {
        Self { overview: 1.0, api: 1.2, diffs: 1.0, snippets: 1.4, configs: 0.6 }
    }
}

/// Line-drop policy when a section exceeds its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Truncation {
    Start,
    Middle,
    End,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    pub total_tokens: usize,
    pub caps: PackCaps,
    pub truncation: Truncation,
    pub preset: PackPreset,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            total_tokens: 8000,
            caps: PackCaps::default(),
            truncation: Truncation::Middle,
            preset: PackPreset::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoftDeleteConfig {
    pub enabled: bool,
    pub ttl_days: u64,
}

impl Default for SoftDeleteConfig {
    fn default() -> Self {
        Self { enabled: true, ttl_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Only `filesystem` is recognized.
    pub kind: String,
    pub path: String,
    pub soft_delete: SoftDeleteConfig,
    pub partial_updates: bool,
    pub batch_max_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kind: "filesystem".to_string(),
            path: ".kb/mind/sync/registry.json".to_string(),
            soft_delete: SoftDeleteConfig::default(),
            partial_updates: true,
            batch_max_size: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MindConfig {
    pub indexer: IndexerConfig,
    pub query: QueryConfig,
    pub pack: PackConfig,
    pub sync: SyncConfig,
}

impl MindConfig {
    /// Load configuration for a workspace. A missing or unparsable config
    /// file yields pure defaults; a parse failure is logged, not raised.
    pub fn load(root: &Path) -> Self {
        let path = root.join(CONFIG_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match toml::from_str::<MindConfig>(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(file = CONFIG_FILE, error = %e, "ignoring malformed config");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MindConfig::default();
        assert_eq!(cfg.pack.total_tokens, 8000);
        assert_eq!(cfg.pack.caps.api_signatures, 2200);
        assert_eq!(cfg.query.cache_ttl_secs, 60);
        assert_eq!(cfg.query.limit, 500);
        assert_eq!(cfg.query.depth, 5);
        assert_eq!(cfg.sync.batch_max_size, 100);
        assert_eq!(cfg.sync.soft_delete.ttl_days, 30);
        assert_eq!(cfg.indexer.max_file_size_bytes, 1_572_864);
    }

    #[test]
    fn partial_config_overrides_only_named_keys() {
        let cfg: MindConfig = toml::from_str(
            r#"
            [pack]
            total_tokens = 4000

            [query]
            depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pack.total_tokens, 4000);
        assert_eq!(cfg.pack.caps.impl_snippets, 3000);
        assert_eq!(cfg.query.depth, 3);
        assert_eq!(cfg.query.limit, 500);
    }
}
