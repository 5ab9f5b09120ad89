//! tree-sitter chunking for recognized languages.
//!
//! Extracts top-level functions, classes, interfaces, type aliases, enums,
//! and modules with exact line boundaries, tagging each chunk with its kind
//! and name. Feature-gated behind `treesitter` to keep the default build
//! free of compiled grammars; without it the regex strategy covers the same
//! extensions.

use crate::chunker::{Chunk, ChunkOptions, ChunkType, Span};
use std::collections::BTreeMap;
use tree_sitter::{Language, Node, Parser};

// ---------------------------------------------------------------------------
// Language resolution
// ---------------------------------------------------------------------------

fn language_for_ext(ext: &str) -> Option<Language> {
    match ext {
        "ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "cs" => Some(tree_sitter_c_sharp::LANGUAGE.into()),
        _ => None,
    }
}

/// Map a node kind to the chunk type it should produce. `None` means the
/// node is a container to descend into (export statements, namespaces).
fn classify_node(kind: &str) -> Option<ChunkType> {
    match kind {
        // TS / JS
        "function_declaration" | "generator_function_declaration" => Some(ChunkType::Function),
        "class_declaration" => Some(ChunkType::Class),
        "interface_declaration" => Some(ChunkType::Interface),
        "type_alias_declaration" => Some(ChunkType::TypeAlias),
        "enum_declaration" => Some(ChunkType::Enum),
        "lexical_declaration" | "variable_declaration" => Some(ChunkType::Function),

        // Python
        "function_definition" => Some(ChunkType::Function),
        "class_definition" => Some(ChunkType::Class),
        "decorated_definition" => None, // descend to the wrapped definition

        // Go
        "method_declaration" => Some(ChunkType::Function),
        "type_spec" => Some(ChunkType::TypeAlias),
        "type_declaration" => None, // descend into type_spec children

        // Rust
        "function_item" => Some(ChunkType::Function),
        "struct_item" => Some(ChunkType::Class),
        "enum_item" => Some(ChunkType::Enum),
        "trait_item" => Some(ChunkType::Interface),
        "impl_item" => Some(ChunkType::Class),
        "type_item" => Some(ChunkType::TypeAlias),
        "mod_item" => Some(ChunkType::Module),

        // C#
        "struct_declaration" => Some(ChunkType::Class),

        _ => None,
    }
}

/// Containers whose children are the interesting declarations.
fn is_container(kind: &str) -> bool {
    matches!(
        kind,
        "export_statement"
            | "type_declaration"
            | "decorated_definition"
            | "namespace_declaration"
            | "file_scoped_namespace_declaration"
            | "module"
            | "internal_module"
            | "declaration_list"
            | "compilation_unit"
            | "global_statement"
    )
}

fn extract_name(node: &Node, source: &[u8]) -> Option<String> {
    for field in ["name", "type"] {
        if let Some(name_node) = node.child_by_field_name(field) {
            if let Ok(text) = name_node.utf8_text(source) {
                let name = text.trim().to_string();
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }
    // const/let/var: name lives on the first variable_declarator.
    if matches!(node.kind(), "lexical_declaration" | "variable_declaration") {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "variable_declarator" {
                if let Some(name_node) = child.child_by_field_name("name") {
                    if let Ok(text) = name_node.utf8_text(source) {
                        return Some(text.trim().to_string());
                    }
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Chunk extraction
// ---------------------------------------------------------------------------

struct Decl {
    start_line: usize, // 1-based
    end_line: usize,   // 1-based inclusive
    chunk_type: ChunkType,
    name: Option<String>,
}

fn collect_decls(node: &Node, source: &[u8], depth: usize, out: &mut Vec<Decl>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let kind = child.kind();
        if let Some(chunk_type) = classify_node(kind) {
            out.push(Decl {
                start_line: child.start_position().row + 1,
                end_line: child.end_position().row + 1,
                chunk_type,
                name: extract_name(&child, source),
            });
        } else if is_container(kind) && depth < 3 {
            collect_decls(&child, source, depth + 1, out);
        }
    }
}

/// Parse source text and produce one chunk per top-level declaration.
/// Returns `None` when the language is unsupported or nothing was found, in
/// which case the caller falls back to another strategy.
pub fn chunk_ast(text: &str, ext: &str, opts: &ChunkOptions) -> Option<Vec<Chunk>> {
    let lang = language_for_ext(ext)?;
    let mut parser = Parser::new();
    parser.set_language(&lang).ok()?;
    let tree = parser.parse(text, None)?;
    let root = tree.root_node();

    let source = text.as_bytes();
    let mut decls = Vec::new();
    collect_decls(&root, source, 0, &mut decls);
    if decls.is_empty() {
        return None;
    }
    decls.sort_by_key(|d| (d.start_line, d.end_line));

    let lines: Vec<&str> = text.lines().collect();
    let header_end = (0..decls[0].start_line.saturating_sub(1))
        .take_while(|&i| crate::chunker::is_header_line(lines[i], ext))
        .last();
    let header_text = header_end.map(|end| lines[..=end].join("\n"));

    let mut chunks: Vec<Chunk> = Vec::with_capacity(decls.len());
    for (i, decl) in decls.iter().enumerate() {
        let mut start = decl.start_line - 1; // to 0-based
        if opts.include_doc_comments {
            let floor = if i > 0 { decls[i - 1].end_line } else { 0 };
            while start > floor && crate::chunker::is_doc_comment_line(lines[start - 1]) {
                start -= 1;
            }
        }
        let end = (decl.end_line - 1).min(lines.len().saturating_sub(1));
        if end < start {
            continue;
        }
        let mut body = lines[start..=end].join("\n");
        if opts.preserve_context && start > 0 {
            if let Some(header) = &header_text {
                body = format!("{header}\n{body}");
            }
        }
        if body.trim().is_empty() {
            continue;
        }
        chunks.push(Chunk {
            text: body,
            span: Span { start_line: start + 1, end_line: end + 1 },
            chunk_type: decl.chunk_type,
            name: decl.name.clone(),
            metadata: BTreeMap::new(),
        });
    }

    // Merge undersized adjacent declarations, mirroring the regex strategy.
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(prev)
                if (prev.span.end_line - prev.span.start_line + 1) < opts.min_lines
                    && chunk.span.start_line > prev.span.end_line
                    && chunk.span.start_line - prev.span.end_line <= 2 =>
            {
                let gap_start = prev.span.end_line; // 0-based index of first gap line
                for line in lines[gap_start..chunk.span.start_line - 1].iter() {
                    prev.text.push('\n');
                    prev.text.push_str(line);
                }
                prev.text.push('\n');
                prev.text.push_str(&chunk.text);
                prev.span.end_line = chunk.span.end_line;
            }
            _ => merged.push(chunk),
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChunkOptions {
        ChunkOptions { min_lines: 1, ..ChunkOptions::code() }
    }

    #[test]
    fn chunks_typescript_declarations() {
        let src = r#"import { q } from './q';

/** Adds. */
export function add(a: number, b: number): number {
  return a + b;
}

export interface Shape {
  area(): number;
}

export type Point = { x: number; y: number };

export enum Mode {
  On,
  Off,
}
"#;
        let chunks = chunk_ast(src, "ts", &opts()).unwrap();
        let names: Vec<_> = chunks.iter().filter_map(|c| c.name.as_deref()).collect();
        assert!(names.contains(&"add"));
        assert!(names.contains(&"Shape"));
        assert!(names.contains(&"Point"));
        assert!(names.contains(&"Mode"));
        let add = chunks.iter().find(|c| c.name.as_deref() == Some("add")).unwrap();
        assert_eq!(add.chunk_type, ChunkType::Function);
        assert!(add.text.contains("Adds."));
    }

    #[test]
    fn chunks_python_and_rust() {
        let py = "def top():\n    return 1\n\nclass Thing:\n    pass\n";
        let chunks = chunk_ast(py, "py", &opts()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::Function);
        assert_eq!(chunks[1].chunk_type, ChunkType::Class);

        let rs = "pub struct Config {\n    pub name: String,\n}\n\npub fn load() -> Config {\n    Config { name: String::new() }\n}\n";
        let chunks = chunk_ast(rs, "rs", &opts()).unwrap();
        let kinds: Vec<_> = chunks.iter().map(|c| c.chunk_type).collect();
        assert!(kinds.contains(&ChunkType::Class));
        assert!(kinds.contains(&ChunkType::Function));
    }

    #[test]
    fn unsupported_extension_returns_none() {
        assert!(chunk_ast("body {}", "css", &opts()).is_none());
    }
}
