//! Change-source capability.
//!
//! The indexer only ever talks to the `ChangeSource` trait; the in-tree
//! implementation diffs workspace state against a reference via libgit2. A
//! missing repository maps to `MIND_NO_GIT` so callers can fall back to an
//! explicit changed-file list or a full walk.

use crate::error::{MindError, Result};
use crate::types::{DiffFile, DiffStatus};
use git2::{Delta, DiffOptions, Repository, StatusOptions};
use std::path::Path;

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

pub trait ChangeSource: Send + Sync {
    /// Files changed between `since` and the current working tree.
    fn diff_since(&self, cwd: &Path, since: &str) -> Result<Vec<DiffFile>>;

    /// Paths currently staged in the index.
    fn list_staged(&self, cwd: &Path) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// libgit2 implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Git2ChangeSource;

impl Git2ChangeSource {
    pub fn new() -> Self {
        Self
    }

    fn open(cwd: &Path) -> Result<Repository> {
        Repository::discover(cwd).map_err(|e| MindError::NoGit { detail: e.message().to_string() })
    }
}

fn status_of(delta: Delta) -> DiffStatus {
    match delta {
        Delta::Added | Delta::Untracked | Delta::Copied => DiffStatus::A,
        Delta::Deleted => DiffStatus::D,
        Delta::Renamed => DiffStatus::R,
        _ => DiffStatus::M,
    }
}

impl ChangeSource for Git2ChangeSource {
    fn diff_since(&self, cwd: &Path, since: &str) -> Result<Vec<DiffFile>> {
        let repo = Self::open(cwd)?;
        let base = repo
            .revparse_single(since)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|e| MindError::NoGit {
                detail: format!("cannot resolve '{since}': {}", e.message()),
            })?;
        let base_tree = base
            .tree()
            .map_err(|e| MindError::NoGit { detail: e.message().to_string() })?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
            .map_err(|e| MindError::NoGit { detail: e.message().to_string() })?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .and_then(|p| p.to_str())
                    .unwrap_or("")
                    .to_string();
                if !path.is_empty() {
                    files.push(DiffFile { path, status: status_of(delta.status()) });
                }
                true
            },
            None,
            None,
            None,
        )
        .map_err(|e| MindError::NoGit { detail: e.message().to_string() })?;

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        Ok(files)
    }

    fn list_staged(&self, cwd: &Path) -> Result<Vec<String>> {
        let repo = Self::open(cwd)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| MindError::NoGit { detail: e.message().to_string() })?;
        let mut staged = Vec::new();
        for entry in statuses.iter() {
            let s = entry.status();
            if s.is_index_new() || s.is_index_modified() || s.is_index_renamed() {
                if let Some(path) = entry.path() {
                    staged.push(path.to_string());
                }
            }
        }
        staged.sort();
        Ok(staged)
    }
}
