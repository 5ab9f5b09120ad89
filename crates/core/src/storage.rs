//! Workspace-scoped storage capability.
//!
//! All core reads and writes go through the `Storage` trait so tests and
//! gateways can substitute their own backend. The in-tree `FsStorage` scopes
//! every path to the workspace root (rejecting escapes with `MIND_FORBIDDEN`)
//! and routes every write through a temp-file + fsync + rename sequence so a
//! reader never observes a half-written artifact.

use crate::error::{MindError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

pub trait Storage: Send + Sync {
    /// Read a workspace-relative file in full.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Atomically write a workspace-relative file, creating parent
    /// directories as needed.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// List files (not directories) under a workspace-relative prefix,
    /// POSIX-normalized and sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a workspace-relative file. Deleting a missing file is not an
    /// error.
    fn delete(&self, path: &str) -> Result<()>;

    /// Create a directory (and parents) under the workspace.
    fn mkdir(&self, path: &str) -> Result<()>;

    /// Whether a workspace-relative path exists.
    fn exists(&self, path: &str) -> bool;

    fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| MindError::Parse {
            path: path.to_string(),
            detail: format!("not valid UTF-8: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Path validation
// ---------------------------------------------------------------------------

/// Normalize to POSIX separators and reject anything that could escape the
/// workspace root: absolute paths, drive letters, `..` components.
pub fn validate_rel_path(path: &str) -> Result<String> {
    let normalized = path.replace('\\', "/");
    let forbidden = normalized.starts_with('/')
        || normalized.contains(":/")
        || normalized.split('/').any(|c| c == "..");
    if forbidden || normalized.is_empty() {
        return Err(MindError::Forbidden { path: path.to_string() });
    }
    // Collapse no-op segments so "src/./a.ts" and "src/a.ts" hash identically.
    let cleaned: Vec<&str> =
        normalized.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    Ok(cleaned.join("/"))
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

/// Storage rooted at a workspace directory.
#[derive(Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> Result<PathBuf> {
        let cleaned = validate_rel_path(rel)?;
        Ok(self.root.join(cleaned))
    }

    fn io_err(path: &str, source: std::io::Error) -> MindError {
        MindError::Io { path: path.to_string(), source }
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let abs = self.abs(path)?;
        fs::read(&abs).map_err(|e| Self::io_err(path, e))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let abs = self.abs(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(path, e))?;
        }
        // tmp + fsync + rename: readers either see the old bytes or the new
        // bytes, never a prefix.
        let tmp = abs.with_extension(match abs.extension() {
            Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
            None => "tmp".to_string(),
        });
        {
            let mut file = fs::File::create(&tmp).map_err(|e| Self::io_err(path, e))?;
            file.write_all(bytes).map_err(|e| Self::io_err(path, e))?;
            file.sync_all().map_err(|e| Self::io_err(path, e))?;
        }
        fs::rename(&tmp, &abs).map_err(|e| Self::io_err(path, e))?;
        debug!(path, bytes = bytes.len(), "wrote artifact");
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let abs = self.abs(prefix)?;
        let mut out = Vec::new();
        if abs.is_dir() {
            collect_files(&abs, &self.root, &mut out);
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let abs = self.abs(path)?;
        match fs::remove_file(&abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(path, e)),
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let abs = self.abs(path)?;
        fs::create_dir_all(&abs).map_err(|e| Self::io_err(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        match self.abs(path) {
            Ok(abs) => abs.exists(),
            Err(_) => false,
        }
    }
}

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, root, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_rel_path("../secrets").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("a/../../b").is_err());
        assert_eq!(validate_rel_path("src/./a.ts").unwrap(), "src/a.ts");
        assert_eq!(validate_rel_path("src\\a.ts").unwrap(), "src/a.ts");
    }

    #[test]
    fn write_read_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.write(".kb/mind/index.json", b"{}").unwrap();
        storage.write(".kb/mind/deps.json", b"[]").unwrap();
        assert_eq!(storage.read(".kb/mind/index.json").unwrap(), b"{}");
        assert_eq!(
            storage.list(".kb/mind").unwrap(),
            vec![".kb/mind/deps.json".to_string(), ".kb/mind/index.json".to_string()]
        );
        storage.delete(".kb/mind/deps.json").unwrap();
        assert!(!storage.exists(".kb/mind/deps.json"));
        // Deleting twice is fine.
        storage.delete(".kb/mind/deps.json").unwrap();
    }

    #[test]
    fn atomic_write_leaves_no_tmp_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.write("out/data.json", b"123").unwrap();
        let listed = storage.list("out").unwrap();
        assert_eq!(listed, vec!["out/data.json".to_string()]);
    }
}
