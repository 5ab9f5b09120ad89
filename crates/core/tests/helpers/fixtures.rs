//! Fixture scaffolding utilities.

use std::path::Path;

/// Recursively copy a directory tree. Preserves file contents but not
/// metadata.
pub fn copy_dir_recursive(src: &Path, dst: &Path) {
    if !dst.exists() {
        std::fs::create_dir_all(dst).expect("failed to create dir");
    }
    for entry in std::fs::read_dir(src).expect("failed to read dir") {
        let entry = entry.expect("failed to read entry");
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            std::fs::copy(&src_path, &dst_path).expect("failed to copy file");
        }
    }
}
