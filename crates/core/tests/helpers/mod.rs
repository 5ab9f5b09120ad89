//! Test harness: builds a throwaway workspace from a fixture directory and
//! exposes small helpers for mutating files and reading artifacts.
#![allow(dead_code)]

pub mod fixtures;

use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestWorkspace {
    pub root: PathBuf,
    _temp_dir: TempDir,
}

impl TestWorkspace {
    /// Copy a named fixture directory into a temp workspace.
    pub fn from_fixture(name: &str) -> Self {
        let fixture_src =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
        assert!(fixture_src.exists(), "fixture '{name}' not found at {}", fixture_src.display());
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        fixtures::copy_dir_recursive(&fixture_src, temp_dir.path());
        Self { root: temp_dir.path().to_path_buf(), _temp_dir: temp_dir }
    }

    /// Empty workspace with no files at all.
    pub fn empty() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        Self { root: temp_dir.path().to_path_buf(), _temp_dir: temp_dir }
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(path, content).expect("failed to write file");
    }

    pub fn delete(&self, rel: &str) {
        std::fs::remove_file(self.root.join(rel)).expect("failed to delete file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel))
            .unwrap_or_else(|e| panic!("failed to read {rel}: {e}"))
    }

    pub fn artifact(&self, rel: &str) -> serde_json::Value {
        serde_json::from_str(&self.read(rel))
            .unwrap_or_else(|e| panic!("artifact {rel} is not valid JSON: {e}"))
    }
}
