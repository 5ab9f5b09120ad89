//! Error taxonomy for the mind core.
//!
//! Every failure carries a stable machine-readable kind (`MIND_*`), a process
//! exit code for the CLI collaborator, and a human-facing hint. Per-file
//! errors during indexing are collected into the run report instead of being
//! raised; only operations that cannot produce any useful output return one
//! of these.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MindError>;

#[derive(Debug, Error)]
pub enum MindError {
    #[error("no index found under {path}")]
    NoIndex { path: String },

    #[error("index artifacts are inconsistent: {detail}")]
    IndexInconsistent { detail: String },

    #[error("change source unavailable: {detail}")]
    NoGit { detail: String },

    #[error("storage operation on {path} exceeded its budget")]
    FsTimeout { path: String },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("section {section} cannot fit its budget even after truncation ({needed} > {cap} tokens)")]
    PackBudgetExceeded {
        section: &'static str,
        needed: usize,
        cap: usize,
    },

    #[error("update exhausted its time budget ({used_ms}ms of {limit_ms}ms)")]
    TimeBudget { used_ms: u64, limit_ms: u64 },

    #[error("invalid or missing parameter {flag}: {detail}")]
    InvalidFlag { flag: String, detail: String },

    #[error("path {path} escapes the workspace")]
    Forbidden { path: String },

    #[error("query failed: {detail}")]
    Query { detail: String },

    #[error("storage failure on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl MindError {
    /// Stable machine-readable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            MindError::NoIndex { .. } => "MIND_NO_INDEX",
            MindError::IndexInconsistent { .. } => "MIND_INDEX_INCONSISTENT",
            MindError::NoGit { .. } => "MIND_NO_GIT",
            MindError::FsTimeout { .. } => "MIND_FS_TIMEOUT",
            MindError::Parse { .. } => "MIND_PARSE_ERROR",
            MindError::PackBudgetExceeded { .. } => "MIND_PACK_BUDGET_EXCEEDED",
            MindError::TimeBudget { .. } => "MIND_TIME_BUDGET",
            MindError::InvalidFlag { .. } => "MIND_INVALID_FLAG",
            MindError::Forbidden { .. } => "MIND_FORBIDDEN",
            MindError::Query { .. } => "MIND_QUERY_ERROR",
            MindError::Io { .. } => "MIND_FS_ERROR",
        }
    }

    /// Process exit code the CLI collaborator should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Transient / environment problems
            MindError::NoIndex { .. }
            | MindError::NoGit { .. }
            | MindError::FsTimeout { .. } => 2,
            // Invariant violations
            MindError::Forbidden { .. } => 3,
            // Everything else is a plain failure
            _ => 1,
        }
    }

    /// Short user-facing hint for terminal display.
    pub fn hint(&self) -> String {
        match self {
            MindError::NoIndex { path } => {
                format!("run `init` and `update` first to create {path}")
            }
            MindError::IndexInconsistent { .. } => {
                "re-run `update` to rebuild the index artifacts".to_string()
            }
            MindError::NoGit { .. } => {
                "pass an explicit changed-file list or run inside a git repository".to_string()
            }
            MindError::FsTimeout { path } => format!("retry the operation on {path}"),
            MindError::Parse { path, .. } => {
                format!("{path} could not be chunked; it is skipped from the index")
            }
            MindError::PackBudgetExceeded { section, .. } => {
                format!("raise the pack budget or drop the `{section}` section")
            }
            MindError::TimeBudget { limit_ms, .. } => {
                format!("re-run `update` or raise timeBudgetMs above {limit_ms}")
            }
            MindError::InvalidFlag { flag, detail } => format!("{flag}: {detail}"),
            MindError::Forbidden { path } => {
                format!("{path} must stay inside the workspace root")
            }
            MindError::Query { detail } => detail.clone(),
            MindError::Io { path, .. } => format!("check permissions and disk space for {path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(MindError::NoIndex { path: ".kb/mind".into() }.exit_code(), 2);
        assert_eq!(MindError::Forbidden { path: "../x".into() }.exit_code(), 3);
        assert_eq!(
            MindError::Query { detail: "bad".into() }.exit_code(),
            1
        );
        assert_eq!(MindError::NoGit { detail: "no repo".into() }.exit_code(), 2);
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            MindError::TimeBudget { used_ms: 10, limit_ms: 5 }.kind(),
            "MIND_TIME_BUDGET"
        );
        assert_eq!(
            MindError::InvalidFlag { flag: "file".into(), detail: "required".into() }.kind(),
            "MIND_INVALID_FLAG"
        );
    }
}
