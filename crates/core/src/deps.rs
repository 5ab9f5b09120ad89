//! Import-graph resolution.
//!
//! Extracts import references from TS/JS sources and resolves each one to an
//! internal file (relative imports and tsconfig-style aliases, with the
//! documented extension order) or an external package name. Edge `type`
//! follows the package manifest's dependency classification; internal edges
//! are always `runtime`.

use crate::chunker::file_ext;
use crate::types::{DepEdge, DepsGraph, EdgeType, PackageDep, TargetKind};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

/// Extension resolution order for extensionless imports, then `index.*` in
/// the target directory.
const RESOLVE_EXTENSIONS: [&str; 8] = ["ts", "tsx", "js", "jsx", "mts", "cts", "mjs", "cjs"];

// ---------------------------------------------------------------------------
// Import reference extraction
// ---------------------------------------------------------------------------

/// One `import`/`require`/`export … from` reference in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub specifier: String,
    /// Imported symbol names: named imports by source name, `default` for a
    /// default import, `*` for a namespace import.
    pub symbols: Vec<String>,
}

struct ImportPatterns {
    from_clause: Regex,
    bare_import: Regex,
    require_call: Regex,
    dynamic_import: Regex,
}

fn import_patterns() -> &'static ImportPatterns {
    static CELL: OnceLock<ImportPatterns> = OnceLock::new();
    CELL.get_or_init(|| ImportPatterns {
        from_clause: Regex::new(
            r#"^\s*(?:import|export)\s+(?:type\s+)?(.*?)\s*from\s*['"]([^'"]+)['"]"#,
        )
        .unwrap(),
        bare_import: Regex::new(r#"^\s*import\s*['"]([^'"]+)['"]"#).unwrap(),
        require_call: Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
        dynamic_import: Regex::new(r#"import\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
    })
}

fn clause_symbols(clause: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    let clause = clause.trim();
    if clause.is_empty() || clause == "*" {
        return symbols;
    }
    let mut rest = clause;
    // Namespace import: `* as ns`
    if rest.starts_with('*') {
        symbols.push("*".to_string());
        return symbols;
    }
    // Named list: `{ a, b as c }`, possibly after a default import.
    if let Some(open) = rest.find('{') {
        let before = rest[..open].trim().trim_end_matches(',').trim();
        if !before.is_empty() {
            symbols.push("default".to_string());
        }
        if let Some(close) = rest.find('}') {
            for item in rest[open + 1..close].split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let name = item.split_once(" as ").map(|(src, _)| src.trim()).unwrap_or(item);
                symbols.push(name.trim_start_matches("type ").trim().to_string());
            }
        }
        return symbols;
    }
    // Plain default import: `x` (possibly `x, * as ns`)
    if let Some((first, tail)) = rest.split_once(',') {
        if !first.trim().is_empty() {
            symbols.push("default".to_string());
        }
        rest = tail.trim();
        if rest.starts_with('*') {
            symbols.push("*".to_string());
        }
    } else {
        symbols.push("default".to_string());
    }
    symbols
}

/// Scan source text for import references. `export … from` counts; bare
/// side-effect imports yield an empty symbol list.
pub fn extract_imports(text: &str) -> Vec<ImportRef> {
    let p = import_patterns();
    let mut refs: Vec<ImportRef> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = p.from_clause.captures(line) {
            refs.push(ImportRef {
                specifier: caps[2].to_string(),
                symbols: clause_symbols(&caps[1]),
            });
            continue;
        }
        if let Some(caps) = p.bare_import.captures(line) {
            refs.push(ImportRef { specifier: caps[1].to_string(), symbols: Vec::new() });
            continue;
        }
        for caps in p.require_call.captures_iter(line) {
            refs.push(ImportRef { specifier: caps[1].to_string(), symbols: Vec::new() });
        }
        for caps in p.dynamic_import.captures_iter(line) {
            refs.push(ImportRef { specifier: caps[1].to_string(), symbols: Vec::new() });
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// tsconfig-style alias configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AliasConfig {
    pub base_url: Option<String>,
    /// `("@/*", ["src/*"])`-style mappings, in declaration order.
    pub paths: Vec<(String, Vec<String>)>,
}

/// Strip `//` and `/* … */` comments (outside strings) plus trailing commas,
/// so tsconfig's JSON-with-comments parses.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut prev_escape = false;
    while let Some(c) = chars.next() {
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
                out.push(c);
            }
            continue;
        }
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        if in_string {
            out.push(c);
            if c == '"' && !prev_escape {
                in_string = false;
            }
            prev_escape = c == '\\' && !prev_escape;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                prev_escape = false;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                in_line_comment = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                in_block_comment = true;
            }
            _ => out.push(c),
        }
    }
    // Trailing commas before a closing brace/bracket.
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    let trailing = TRAILING.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());
    trailing.replace_all(&out, "$1").into_owned()
}

/// Load alias configuration from `tsconfig.json` at the workspace root.
pub fn load_alias_config(root: &Path) -> Option<AliasConfig> {
    let text = std::fs::read_to_string(root.join("tsconfig.json")).ok()?;
    let value: Value = serde_json::from_str(&strip_jsonc(&text)).ok()?;
    let options = value.get("compilerOptions")?;
    let base_url = options
        .get("baseUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.trim_start_matches("./").trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty() && s != ".");
    let mut paths = Vec::new();
    if let Some(map) = options.get("paths").and_then(|v| v.as_object()) {
        for (pattern, targets) in map {
            let targets: Vec<String> = targets
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|t| t.as_str())
                        .map(|t| t.trim_start_matches("./").to_string())
                        .collect()
                })
                .unwrap_or_default();
            if !targets.is_empty() {
                paths.push((pattern.clone(), targets));
            }
        }
    }
    if base_url.is_none() && paths.is_empty() {
        None
    } else {
        Some(AliasConfig { base_url, paths })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Workspace-relative POSIX path of the resolved file.
    Internal(String),
    /// External package name (`lodash`, `@scope/pkg`).
    External(String),
    Unresolved,
}

pub struct DependencyResolver<'a> {
    root: &'a Path,
    alias: Option<AliasConfig>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { alias: load_alias_config(root), root }
    }

    pub fn with_alias(root: &'a Path, alias: Option<AliasConfig>) -> Self {
        Self { root, alias }
    }

    /// Resolve one import specifier from `from_rel`.
    pub fn resolve(&self, from_rel: &str, specifier: &str) -> Resolution {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = match from_rel.rsplit_once('/') {
                Some((dir, _)) => dir,
                None => "",
            };
            let joined = join_posix(dir, specifier);
            return match joined.and_then(|p| self.try_file(&p)) {
                Some(path) => Resolution::Internal(path),
                None => Resolution::Unresolved,
            };
        }
        if let Some(resolution) = self.resolve_alias(specifier) {
            return resolution;
        }
        Resolution::External(external_package_name(specifier))
    }

    /// Alias resolution: configured `paths` first (under `baseUrl` when one
    /// is declared, straight from the workspace root otherwise), then a
    /// root-directory scan keyed on the alias prefix.
    fn resolve_alias(&self, specifier: &str) -> Option<Resolution> {
        let alias = self.alias.as_ref()?;
        for (pattern, targets) in &alias.paths {
            let Some(rest) = match_alias_pattern(pattern, specifier) else {
                continue;
            };
            for target in targets {
                let mapped = target.replace('*', rest);
                let candidate = match &alias.base_url {
                    Some(base) => format!("{base}/{mapped}"),
                    None => mapped,
                };
                if let Some(path) = self.try_file(&candidate) {
                    return Some(Resolution::Internal(path));
                }
            }
            // No base directory and no direct target hit: scan top-level
            // workspace directories for the remainder.
            if alias.base_url.is_none() {
                if let Some(path) = self.scan_workspace_dirs(rest) {
                    return Some(Resolution::Internal(path));
                }
            }
            // A matched alias that resolves nowhere is not an external.
            return Some(Resolution::Unresolved);
        }
        None
    }

    fn scan_workspace_dirs(&self, rest: &str) -> Option<String> {
        let entries = std::fs::read_dir(self.root).ok()?;
        let mut dirs: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.') && name != "node_modules")
            .collect();
        dirs.sort();
        for dir in dirs {
            if let Some(path) = self.try_file(&format!("{dir}/{rest}")) {
                return Some(path);
            }
        }
        None
    }

    /// Try a candidate path as-is, with each extension, then as a directory
    /// containing `index.*`.
    fn try_file(&self, candidate: &str) -> Option<String> {
        let abs = self.root.join(candidate);
        if abs.is_file() && !file_ext(candidate).is_empty() {
            return Some(candidate.to_string());
        }
        for ext in RESOLVE_EXTENSIONS {
            let with_ext = format!("{candidate}.{ext}");
            if self.root.join(&with_ext).is_file() {
                return Some(with_ext);
            }
        }
        if abs.is_dir() {
            for ext in RESOLVE_EXTENSIONS {
                let index = format!("{candidate}/index.{ext}");
                if self.root.join(&index).is_file() {
                    return Some(index);
                }
            }
        }
        None
    }
}

/// `@scope/pkg/deep` → `@scope/pkg`; `lodash/fp` → `lodash`.
pub fn external_package_name(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(name) => format!("{scope}/{name}"),
            None => scope.to_string(),
        },
        Some(first) => first.to_string(),
        None => specifier.to_string(),
    }
}

fn match_alias_pattern<'s>(pattern: &str, specifier: &'s str) -> Option<&'s str> {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            let rest = specifier.strip_prefix(prefix)?;
            rest.strip_suffix(suffix).or(Some(rest))
        }
        None => {
            if specifier == pattern {
                Some("")
            } else {
                None
            }
        }
    }
}

/// POSIX path join with `.`/`..` normalization; `None` when the path escapes
/// the workspace root.
fn join_posix(dir: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for comp in rel.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Package manifest and edge assembly
// ---------------------------------------------------------------------------

/// Read `package.json`: the project name plus declared dependencies with
/// their classification.
pub fn load_packages(root: &Path) -> (Option<String>, Vec<PackageDep>) {
    let text = match std::fs::read_to_string(root.join("package.json")) {
        Ok(t) => t,
        Err(_) => return (None, Vec::new()),
    };
    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) => return (None, Vec::new()),
    };
    let name = value.get("name").and_then(|v| v.as_str()).map(|s| s.to_string());
    let mut packages = Vec::new();
    for (section, dep_type) in [
        ("dependencies", EdgeType::Runtime),
        ("devDependencies", EdgeType::Dev),
        ("peerDependencies", EdgeType::Peer),
    ] {
        if let Some(map) = value.get(section).and_then(|v| v.as_object()) {
            for (pkg, version) in map {
                packages.push(PackageDep {
                    name: pkg.clone(),
                    version: version.as_str().unwrap_or("*").to_string(),
                    dep_type,
                });
            }
        }
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    (name, packages)
}

/// Classification for an external edge: whatever the manifest declares,
/// `runtime` for undeclared imports.
pub fn external_edge_type(packages: &[PackageDep], name: &str) -> EdgeType {
    packages
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.dep_type)
        .unwrap_or(EdgeType::Runtime)
}

/// Resolve every import of one file into deduplicated, sorted edges. The
/// internal/external decision is made here, once, and carried on the edge.
pub fn resolve_file_edges(
    resolver: &DependencyResolver,
    from_rel: &str,
    text: &str,
    packages: &[PackageDep],
) -> Vec<DepEdge> {
    let mut merged: BTreeMap<(String, EdgeType), (TargetKind, BTreeSet<String>)> = BTreeMap::new();
    for import in extract_imports(text) {
        let (to, edge_type, target) = match resolver.resolve(from_rel, &import.specifier) {
            Resolution::Internal(path) => (path, EdgeType::Runtime, TargetKind::Internal),
            Resolution::External(name) => {
                let t = external_edge_type(packages, &name);
                (name, t, TargetKind::External)
            }
            Resolution::Unresolved => continue,
        };
        if to == from_rel {
            continue; // no self-edges
        }
        let slot = merged.entry((to, edge_type)).or_insert_with(|| (target, BTreeSet::new()));
        slot.1.extend(import.symbols);
    }
    merged
        .into_iter()
        .map(|((to, edge_type), (target, symbols))| DepEdge {
            from: from_rel.to_string(),
            to,
            edge_type,
            target,
            symbols: symbols.into_iter().collect(),
        })
        .collect()
}

/// Recompute the externals summary and restore the global edge ordering.
pub fn recompute_summary(graph: &mut DepsGraph) {
    graph.edges.sort_by(|a, b| {
        (&a.from, &a.to, a.edge_type).cmp(&(&b.from, &b.to, b.edge_type))
    });
    graph.edges.dedup_by(|a, b| a.from == b.from && a.to == b.to && a.edge_type == b.edge_type);

    let mut externals: BTreeSet<String> = BTreeSet::new();
    let mut internals: BTreeSet<&str> = BTreeSet::new();
    for edge in &graph.edges {
        internals.insert(edge.from.as_str());
        match edge.target {
            TargetKind::Internal => {
                internals.insert(edge.to.as_str());
            }
            TargetKind::External => {
                externals.insert(edge.to.clone());
            }
        }
    }
    graph.summary.internal_files = internals.len();
    graph.summary.external_count = externals.len();
    graph.summary.edge_count = graph.edges.len();
    graph.summary.external_deps = externals.into_iter().collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn extracts_import_symbols() {
        let refs = extract_imports(
            "import def, { a, b as c } from './x';\nimport * as ns from 'pkg';\nimport './side';\nconst y = require('fs');\n",
        );
        assert_eq!(refs[0].specifier, "./x");
        assert_eq!(refs[0].symbols, vec!["default", "a", "b"]);
        assert_eq!(refs[1].symbols, vec!["*"]);
        assert!(refs[2].symbols.is_empty());
        assert_eq!(refs[3].specifier, "fs");
    }

    #[test]
    fn resolves_relative_with_extension_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.ts", "export const x = 1;\n");
        write(dir.path(), "src/util/index.js", "module.exports = {};\n");
        let resolver = DependencyResolver::with_alias(dir.path(), None);
        assert_eq!(
            resolver.resolve("src/b.ts", "./a"),
            Resolution::Internal("src/a.ts".into())
        );
        assert_eq!(
            resolver.resolve("src/b.ts", "./util"),
            Resolution::Internal("src/util/index.js".into())
        );
        assert_eq!(resolver.resolve("src/b.ts", "./missing"), Resolution::Unresolved);
    }

    #[test]
    fn alias_resolves_with_and_without_base_url() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/services/core.ts", "export const core = 1;\n");

        let with_base = AliasConfig {
            base_url: Some("src".into()),
            paths: vec![("@/*".into(), vec!["*".into()])],
        };
        let resolver = DependencyResolver::with_alias(dir.path(), Some(with_base));
        assert_eq!(
            resolver.resolve("src/index.ts", "@/services/core"),
            Resolution::Internal("src/services/core.ts".into())
        );

        let without_base = AliasConfig {
            base_url: None,
            paths: vec![("@/*".into(), vec!["src/*".into()])],
        };
        let resolver = DependencyResolver::with_alias(dir.path(), Some(without_base));
        assert_eq!(
            resolver.resolve("src/index.ts", "@/services/core"),
            Resolution::Internal("src/services/core.ts".into())
        );
    }

    #[test]
    fn alias_without_targets_scans_workspace_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/widgets/button.ts", "export const b = 1;\n");
        let alias = AliasConfig {
            base_url: None,
            paths: vec![("~/*".into(), vec!["nowhere/*".into()])],
        };
        let resolver = DependencyResolver::with_alias(dir.path(), Some(alias));
        assert_eq!(
            resolver.resolve("src/index.ts", "~/widgets/button"),
            Resolution::Internal("src/widgets/button.ts".into())
        );
    }

    #[test]
    fn external_names_follow_scope_rules() {
        assert_eq!(external_package_name("lodash"), "lodash");
        assert_eq!(external_package_name("lodash/fp"), "lodash");
        assert_eq!(external_package_name("@scope/pkg/deep"), "@scope/pkg");
    }

    #[test]
    fn jsonc_tsconfig_parses() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "tsconfig.json",
            r#"{
  // alias configuration
  "compilerOptions": {
    "baseUrl": ".",
    "paths": {
      "@/*": ["src/*"], /* mapped */
    },
  },
}"#,
        );
        let alias = load_alias_config(dir.path()).unwrap();
        assert_eq!(alias.base_url, None); // "." is treated as no base dir
        assert_eq!(alias.paths.len(), 1);
        assert_eq!(alias.paths[0].0, "@/*");
    }

    #[test]
    fn relative_imports_stay_internal_regardless_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/data.json", "{\"k\": 1}\n");
        write(
            dir.path(),
            "src/b.ts",
            "import data from './data.json';\nexport const k = data;\n",
        );
        let resolver = DependencyResolver::with_alias(dir.path(), None);
        let text = fs::read_to_string(dir.path().join("src/b.ts")).unwrap();
        let mut graph = DepsGraph::empty();
        graph.edges = resolve_file_edges(&resolver, "src/b.ts", &text, &[]);
        recompute_summary(&mut graph);

        let edge = graph.edges.iter().find(|e| e.to == "src/data.json").unwrap();
        assert_eq!(edge.target, TargetKind::Internal);
        assert!(graph.summary.external_deps.is_empty());
    }

    #[test]
    fn summary_lists_each_external_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.ts", "export const x = 1;\n");
        write(
            dir.path(),
            "src/b.ts",
            "import { x } from './a';\nimport _ from 'lodash';\nimport fp from 'lodash/fp';\n",
        );
        let resolver = DependencyResolver::with_alias(dir.path(), None);
        let text = fs::read_to_string(dir.path().join("src/b.ts")).unwrap();
        let mut graph = DepsGraph::empty();
        graph.edges = resolve_file_edges(&resolver, "src/b.ts", &text, &[]);
        recompute_summary(&mut graph);
        assert_eq!(graph.summary.external_deps, vec!["lodash".to_string()]);
        assert_eq!(graph.summary.edge_count, 2);
        assert!(graph
            .edges
            .iter()
            .any(|e| e.from == "src/b.ts" && e.to == "src/a.ts" && e.edge_type == EdgeType::Runtime));
    }
}
