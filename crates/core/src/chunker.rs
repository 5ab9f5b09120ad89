//! Chunking: turning a source file into line-spanned semantic units.
//!
//! Strategy selection is keyed on `(extension, size, generated-pattern)`:
//! generated artifacts and oversized files stream through a sliding window,
//! Markdown splits on heading regions plus fenced code blocks, recognized
//! languages get AST chunking (feature `treesitter`) with a regex fallback,
//! and everything else streams. A chunker that fails or produces nothing
//! falls back to the streaming strategy; no single file ever aborts a run.

use crate::error::{MindError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

// ---------------------------------------------------------------------------
// Size thresholds and window geometry
// ---------------------------------------------------------------------------

/// Above this size every file streams, regardless of language.
pub const STREAMING_THRESHOLD_BYTES: u64 = 200 * 1024;
/// Sliding window for the streaming chunker.
pub const WINDOW_BYTES: usize = 50 * 1024;
/// Trailing bytes carried into the next window for continuity.
pub const WINDOW_OVERLAP_BYTES: usize = 5 * 1024;
/// Read buffer for streaming.
pub const READ_BUFFER_BYTES: usize = 8 * 1024;

// Declared metadata keys — the only ones the core ever writes on a chunk.
pub const META_IS_SUB_CHUNK: &str = "isSubChunk";
pub const META_ORIGINAL_START: &str = "originalStartLine";
pub const META_ORIGINAL_END: &str = "originalEndLine";
pub const META_LANGUAGE: &str = "language";

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// 1-based inclusive line range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Function,
    Class,
    Interface,
    TypeAlias,
    Enum,
    Module,
    Section,
    CodeBlock,
    Lines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    pub span: Span,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Chunk {
    fn lines(text: String, start_line: usize, end_line: usize) -> Self {
        Chunk {
            text,
            span: Span { start_line, end_line },
            chunk_type: ChunkType::Lines,
            name: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Per-call chunking options. Defaults depend on the file kind; use
/// `ChunkOptions::for_path`.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub min_lines: usize,
    pub max_lines: usize,
    /// Prepend file-level imports/header comments to each chunk's text.
    pub preserve_context: bool,
    /// Extend declaration chunks upward over their doc comments.
    pub include_doc_comments: bool,
}

impl ChunkOptions {
    pub fn code() -> Self {
        Self { min_lines: 20, max_lines: 200, preserve_context: false, include_doc_comments: true }
    }

    pub fn markdown() -> Self {
        Self { min_lines: 30, max_lines: 150, preserve_context: false, include_doc_comments: false }
    }

    pub fn for_path(path: &str) -> Self {
        if is_markdown(path) {
            Self::markdown()
        } else {
            Self::code()
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// AST-aware chunking for a recognized language extension.
    Ast,
    /// Top-level declarations by pattern.
    Regex,
    Markdown,
    StreamingLine,
}

pub fn file_ext(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path).rsplit_once('.').map(|(_, e)| e).unwrap_or("")
}

pub fn is_markdown(path: &str) -> bool {
    matches!(file_ext(path), "md" | "mdx" | "markdown")
}

pub fn is_recognized_lang(ext: &str) -> bool {
    matches!(
        ext,
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" | "py" | "pyi" | "go" | "rs" | "cs"
    )
}

/// Paths that are build output or vendored bundles always stream.
pub fn is_generated_path(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if file_name.starts_with("bundle.") || file_name.starts_with("vendor.") {
        return true;
    }
    if file_name.contains(".min.") {
        return true;
    }
    path.split('/').any(|seg| matches!(seg, "dist" | "build" | "node_modules"))
}

/// Selection rules, applied in priority order.
pub fn select_strategy(path: &str, size: u64) -> Strategy {
    if is_generated_path(path) {
        return Strategy::StreamingLine;
    }
    if size > STREAMING_THRESHOLD_BYTES {
        return Strategy::StreamingLine;
    }
    if is_markdown(path) {
        return Strategy::Markdown;
    }
    if is_recognized_lang(file_ext(path)) {
        #[cfg(feature = "treesitter")]
        {
            return Strategy::Ast;
        }
        #[cfg(not(feature = "treesitter"))]
        {
            return Strategy::Regex;
        }
    }
    Strategy::StreamingLine
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Chunk in-memory source text. Falls back to the streaming strategy when the
/// selected chunker fails or yields nothing.
pub fn chunk_source(text: &str, path: &str, opts: &ChunkOptions) -> Result<Vec<Chunk>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let strategy = select_strategy(path, text.len() as u64);
    let primary = match strategy {
        #[cfg(feature = "treesitter")]
        Strategy::Ast => crate::ast::chunk_ast(text, file_ext(path), opts),
        #[cfg(not(feature = "treesitter"))]
        Strategy::Ast => None,
        Strategy::Regex => chunk_regex(text, file_ext(path), opts),
        Strategy::Markdown => chunk_markdown(text, opts),
        Strategy::StreamingLine => None,
    };
    let chunks = match primary {
        Some(chunks) if !chunks.is_empty() => chunks,
        _ => {
            if strategy != Strategy::StreamingLine {
                debug!(path, ?strategy, "chunker produced nothing, streaming instead");
            }
            stream_chunks(text.as_bytes(), opts)
        }
    };
    if chunks.is_empty() {
        return Err(MindError::Parse {
            path: path.to_string(),
            detail: "no chunker produced output".to_string(),
        });
    }
    Ok(split_oversized(chunks, opts.max_lines))
}

/// Chunk a file on disk. Files routed to the streaming strategy are read
/// through the sliding window and never fully loaded.
pub fn chunk_file(abs: &Path, rel: &str, opts: &ChunkOptions) -> Result<Vec<Chunk>> {
    let size = std::fs::metadata(abs)
        .map_err(|e| MindError::Io { path: rel.to_string(), source: e })?
        .len();
    if select_strategy(rel, size) == Strategy::StreamingLine {
        let file = std::fs::File::open(abs)
            .map_err(|e| MindError::Io { path: rel.to_string(), source: e })?;
        let chunks: Vec<Chunk> =
            StreamingChunks::new(BufReader::with_capacity(READ_BUFFER_BYTES, file), opts)
                .collect();
        return Ok(split_oversized(chunks, opts.max_lines));
    }
    let text = std::fs::read_to_string(abs)
        .map_err(|e| MindError::Io { path: rel.to_string(), source: e })?;
    chunk_source(&text, rel, opts)
}

// ---------------------------------------------------------------------------
// Oversize splitting
// ---------------------------------------------------------------------------

/// Split chunks longer than `max_lines` into equal sub-chunks carrying the
/// original bounds in metadata.
pub fn split_oversized(chunks: Vec<Chunk>, max_lines: usize) -> Vec<Chunk> {
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let line_count = chunk.span.end_line - chunk.span.start_line + 1;
        if line_count <= max_lines || max_lines == 0 {
            out.push(chunk);
            continue;
        }
        let pieces = line_count.div_ceil(max_lines);
        let per_piece = line_count.div_ceil(pieces);
        let lines: Vec<&str> = chunk.text.lines().collect();
        for (i, window) in lines.chunks(per_piece).enumerate() {
            let start = chunk.span.start_line + i * per_piece;
            let end = (start + window.len() - 1).min(chunk.span.end_line);
            let mut metadata = chunk.metadata.clone();
            metadata.insert(META_IS_SUB_CHUNK.to_string(), Value::Bool(true));
            metadata.insert(META_ORIGINAL_START.to_string(), chunk.span.start_line.into());
            metadata.insert(META_ORIGINAL_END.to_string(), chunk.span.end_line.into());
            out.push(Chunk {
                text: window.join("\n"),
                span: Span { start_line: start, end_line: end },
                chunk_type: chunk.chunk_type,
                name: chunk.name.clone(),
                metadata,
            });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Markdown chunker
// ---------------------------------------------------------------------------

/// One chunk per heading region, plus each fenced code block as a separate
/// chunk annotated with its declared language. Regions shorter than
/// `min_lines` merge into the following region.
pub fn chunk_markdown(text: &str, opts: &ChunkOptions) -> Option<Vec<Chunk>> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return None;
    }

    // Pass 1: heading starts (outside fences) and fenced code blocks.
    let mut heading_starts: Vec<(usize, String)> = Vec::new(); // 0-based line, title
    let mut fences: Vec<(usize, usize, String)> = Vec::new(); // start, end (0-based), lang
    let mut open_fence: Option<(usize, &'static str)> = None;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if let Some((start, marker)) = open_fence {
            if trimmed.starts_with(marker) {
                let lang =
                    lines[start].trim_start().trim_start_matches(['`', '~']).trim().to_string();
                fences.push((start, i, lang));
                open_fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            open_fence = Some((i, "```"));
            continue;
        }
        if trimmed.starts_with("~~~") {
            open_fence = Some((i, "~~~"));
            continue;
        }
        if trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|&c| c == '#').count();
            if level <= 6 && trimmed.chars().nth(level).is_none_or(|c| c == ' ') {
                heading_starts.push((i, trimmed[level..].trim().to_string()));
            }
        }
    }
    // Unterminated fence runs to EOF.
    if let Some((start, _)) = open_fence {
        let lang = lines[start].trim_start().trim_start_matches(['`', '~']).trim().to_string();
        fences.push((start, lines.len() - 1, lang));
    }

    // Pass 2: heading regions; the preamble before the first heading is its
    // own region.
    let mut regions: Vec<(usize, usize, Option<String>)> = Vec::new();
    if heading_starts.is_empty() {
        regions.push((0, lines.len() - 1, None));
    } else {
        if heading_starts[0].0 > 0 {
            regions.push((0, heading_starts[0].0 - 1, None));
        }
        for (i, (start, title)) in heading_starts.iter().enumerate() {
            let end = if i + 1 < heading_starts.len() {
                heading_starts[i + 1].0 - 1
            } else {
                lines.len() - 1
            };
            regions.push((*start, end, Some(title.clone())));
        }
    }

    // Merge regions shorter than min_lines into their successor.
    let mut merged: Vec<(usize, usize, Option<String>)> = Vec::new();
    for region in regions {
        match merged.last_mut() {
            Some(prev) if (prev.1 - prev.0 + 1) < opts.min_lines => {
                prev.1 = region.1;
                if prev.2.is_none() {
                    prev.2 = region.2;
                }
            }
            _ => merged.push(region),
        }
    }

    let mut chunks = Vec::new();
    for (start, end, title) in merged {
        let text = lines[start..=end].join("\n");
        if text.trim().is_empty() {
            continue;
        }
        chunks.push(Chunk {
            text,
            span: Span { start_line: start + 1, end_line: end + 1 },
            chunk_type: ChunkType::Section,
            name: title,
            metadata: BTreeMap::new(),
        });
    }
    for (start, end, lang) in fences {
        let text = lines[start..=end].join("\n");
        let mut metadata = BTreeMap::new();
        if !lang.is_empty() {
            metadata.insert(META_LANGUAGE.to_string(), Value::String(lang));
        }
        chunks.push(Chunk {
            text,
            span: Span { start_line: start + 1, end_line: end + 1 },
            chunk_type: ChunkType::CodeBlock,
            name: None,
            metadata,
        });
    }
    chunks.sort_by_key(|c| (c.span.start_line, c.span.end_line));
    if chunks.is_empty() {
        None
    } else {
        Some(chunks)
    }
}

// ---------------------------------------------------------------------------
// Regex chunker — top-level declarations by pattern
// ---------------------------------------------------------------------------

struct DeclPattern {
    regex: Regex,
    chunk_type: ChunkType,
}

fn decl_patterns(ext: &str) -> Vec<DeclPattern> {
    let specs: &[(&str, ChunkType)] = match ext {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => &[
            (r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+(\w+)", ChunkType::Function),
            (r"^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(\w+)", ChunkType::Class),
            (r"^(?:export\s+)?interface\s+(\w+)", ChunkType::Interface),
            (r"^(?:export\s+)?type\s+(\w+)\s*=", ChunkType::TypeAlias),
            (r"^(?:export\s+)?(?:const\s+)?enum\s+(\w+)", ChunkType::Enum),
            (r"^(?:export\s+)?namespace\s+(\w+)", ChunkType::Module),
            (r"^(?:export\s+)?(?:const|let|var)\s+(\w+)", ChunkType::Function),
        ],
        "py" | "pyi" => &[
            (r"^(?:async\s+)?def\s+(\w+)", ChunkType::Function),
            (r"^class\s+(\w+)", ChunkType::Class),
        ],
        "go" => &[
            (r"^func\s+(?:\([^)]*\)\s*)?(\w+)", ChunkType::Function),
            (r"^type\s+(\w+)\s+interface", ChunkType::Interface),
            (r"^type\s+(\w+)", ChunkType::TypeAlias),
        ],
        "rs" => &[
            (r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)", ChunkType::Function),
            (r"^(?:pub(?:\([^)]*\))?\s+)?struct\s+(\w+)", ChunkType::Class),
            (r"^(?:pub(?:\([^)]*\))?\s+)?enum\s+(\w+)", ChunkType::Enum),
            (r"^(?:pub(?:\([^)]*\))?\s+)?trait\s+(\w+)", ChunkType::Interface),
            (r"^impl(?:<[^>]*>)?\s+(?:\S+\s+for\s+)?(\w+)", ChunkType::Class),
            (r"^(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)", ChunkType::Module),
            (r"^(?:pub(?:\([^)]*\))?\s+)?type\s+(\w+)", ChunkType::TypeAlias),
        ],
        "cs" => &[
            (
                r"^\s{0,8}(?:\[[^\]]*\]\s*)?(?:(?:public|internal|private|protected|static|abstract|sealed|partial)\s+)*class\s+(\w+)",
                ChunkType::Class,
            ),
            (
                r"^\s{0,8}(?:(?:public|internal|private|protected)\s+)*interface\s+(\w+)",
                ChunkType::Interface,
            ),
            (
                r"^\s{0,8}(?:(?:public|internal|private|protected)\s+)*enum\s+(\w+)",
                ChunkType::Enum,
            ),
            (
                r"^\s{0,8}(?:(?:public|internal|private|protected)\s+)*struct\s+(\w+)",
                ChunkType::Class,
            ),
            (r"^namespace\s+([\w.]+)", ChunkType::Module),
        ],
        _ => &[],
    };
    specs
        .iter()
        .map(|(pattern, chunk_type)| DeclPattern {
            regex: Regex::new(pattern).unwrap(),
            chunk_type: *chunk_type,
        })
        .collect()
}

pub(crate) fn is_header_line(line: &str, ext: &str) -> bool {
    let t = line.trim_start();
    if t.is_empty() {
        return true;
    }
    match ext {
        "py" | "pyi" => t.starts_with('#') || t.starts_with("import ") || t.starts_with("from "),
        "rs" => t.starts_with("//") || t.starts_with("use ") || t.starts_with("#!["),
        "go" => t.starts_with("//") || t.starts_with("import") || t.starts_with("package "),
        _ => {
            t.starts_with("//")
                || t.starts_with("/*")
                || t.starts_with('*')
                || t.starts_with("import ")
                || t.starts_with("require(")
                || t.starts_with("using ")
        }
    }
}

pub(crate) fn is_doc_comment_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("///")
        || t.starts_with("//")
        || t.starts_with("/**")
        || t.starts_with("/*")
        || t.starts_with('*')
        || t.starts_with('#')
}

/// Extract top-level declarations by pattern. Chunks run from one matched
/// declaration to the line before the next; the leading import/header block
/// is optionally prepended to every chunk.
pub fn chunk_regex(text: &str, ext: &str, opts: &ChunkOptions) -> Option<Vec<Chunk>> {
    let patterns = decl_patterns(ext);
    if patterns.is_empty() {
        return None;
    }
    let lines: Vec<&str> = text.lines().collect();

    // (0-based line, type, name)
    let mut decls: Vec<(usize, ChunkType, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        for p in &patterns {
            if let Some(caps) = p.regex.captures(line) {
                let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                decls.push((i, p.chunk_type, name));
                break;
            }
        }
    }
    if decls.is_empty() {
        return None;
    }

    // Header: contiguous import/comment/blank prefix before the first decl.
    let header_end = (0..decls[0].0).take_while(|&i| is_header_line(lines[i], ext)).last();
    let header_text = header_end.map(|end| lines[..=end].join("\n"));

    // Pull doc comment blocks into their declaration before fixing ends, so
    // adjacent chunks stay disjoint.
    let mut starts: Vec<usize> = Vec::with_capacity(decls.len());
    for (i, (decl_line, _, _)) in decls.iter().enumerate() {
        let mut start = *decl_line;
        if opts.include_doc_comments {
            let floor = if i > 0 { decls[i - 1].0 + 1 } else { 0 };
            while start > floor && is_doc_comment_line(lines[start - 1]) {
                start -= 1;
            }
        }
        starts.push(start);
    }

    let mut chunks = Vec::new();
    for (i, (_, chunk_type, name)) in decls.iter().enumerate() {
        let start = starts[i];
        let end = if i + 1 < decls.len() { starts[i + 1] - 1 } else { lines.len() - 1 };
        if end < start {
            continue;
        }
        let mut body = lines[start..=end].join("\n");
        if opts.preserve_context && start > 0 {
            if let Some(header) = &header_text {
                body = format!("{header}\n{body}");
            }
        }
        chunks.push(Chunk {
            text: body,
            span: Span { start_line: start + 1, end_line: end + 1 },
            chunk_type: *chunk_type,
            name: if name.is_empty() { None } else { Some(name.clone()) },
            metadata: BTreeMap::new(),
        });
    }

    // Merge undersized fragments into their predecessor.
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(prev)
                if (prev.span.end_line - prev.span.start_line + 1) < opts.min_lines
                    && prev.span.end_line + 1 == chunk.span.start_line =>
            {
                prev.text.push('\n');
                prev.text.push_str(&chunk.text);
                prev.span.end_line = chunk.span.end_line;
            }
            _ => merged.push(chunk),
        }
    }
    Some(merged)
}

// ---------------------------------------------------------------------------
// Streaming line chunker
// ---------------------------------------------------------------------------

/// Lazy sliding-window chunker. Holds at most one window of text in memory;
/// line numbers are global, adjusted by counting newlines slid past. Trailing
/// lines up to the overlap size are carried into the next chunk.
pub struct StreamingChunks<R: BufRead> {
    reader: Option<R>,
    max_lines: usize,
    chunk_lines: Vec<String>,
    chunk_start: usize,
    chunk_bytes: usize,
    /// Lines added since the last emit; the EOF flush is skipped when the
    /// remainder is only the carried overlap.
    fresh_lines: usize,
    partial: Option<String>,
}

impl<R: BufRead> StreamingChunks<R> {
    pub fn new(reader: R, opts: &ChunkOptions) -> Self {
        Self {
            reader: Some(reader),
            max_lines: opts.max_lines.max(1),
            chunk_lines: Vec::new(),
            chunk_start: 1,
            chunk_bytes: 0,
            fresh_lines: 0,
            partial: None,
        }
    }

    /// Emit the current window and retain the overlap tail.
    fn emit_window(&mut self) -> Option<Chunk> {
        let start = self.chunk_start;
        let end = start + self.chunk_lines.len() - 1;
        let text = self.chunk_lines.join("\n");

        // Overlap is bounded both in bytes and in lines (a tenth of the
        // window) so short-line files still make forward progress.
        let max_carry = (self.max_lines / 10).min(self.chunk_lines.len().saturating_sub(1));
        let mut overlap_len = 0usize;
        let mut carried = 0usize;
        for line in self.chunk_lines.iter().rev() {
            if carried >= max_carry || overlap_len + line.len() + 1 > WINDOW_OVERLAP_BYTES {
                break;
            }
            overlap_len += line.len() + 1;
            carried += 1;
        }
        self.chunk_lines = self.chunk_lines[self.chunk_lines.len() - carried..].to_vec();
        self.chunk_bytes = self.chunk_lines.iter().map(|l| l.len() + 1).sum();
        self.chunk_start = end + 1 - carried;
        self.fresh_lines = 0;

        if text.trim().is_empty() {
            None
        } else {
            Some(Chunk::lines(text, start, end))
        }
    }
}

impl<R: BufRead> Iterator for StreamingChunks<R> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return None;
            };
            let mut raw = Vec::with_capacity(256);
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => {
                    self.reader = None;
                    if let Some(partial) = self.partial.take() {
                        self.chunk_lines.push(partial);
                        self.fresh_lines += 1;
                    }
                    if self.chunk_lines.is_empty() || self.fresh_lines == 0 {
                        return None;
                    }
                    let start = self.chunk_start;
                    let end = start + self.chunk_lines.len() - 1;
                    let text = std::mem::take(&mut self.chunk_lines).join("\n");
                    if text.trim().is_empty() {
                        return None;
                    }
                    return Some(Chunk::lines(text, start, end));
                }
                Ok(_) => {
                    let had_newline = raw.last() == Some(&b'\n');
                    if had_newline {
                        raw.pop();
                        if raw.last() == Some(&b'\r') {
                            raw.pop();
                        }
                    }
                    let mut line = String::from_utf8_lossy(&raw).into_owned();
                    if let Some(prefix) = self.partial.take() {
                        line = prefix + &line;
                    }
                    if !had_newline && line.len() < WINDOW_BYTES {
                        // No terminator yet; keep accumulating this line.
                        self.partial = Some(line);
                        continue;
                    }
                    self.chunk_bytes += line.len() + 1;
                    self.chunk_lines.push(line);
                    self.fresh_lines += 1;

                    if self.chunk_lines.len() >= self.max_lines
                        || self.chunk_bytes >= WINDOW_BYTES
                    {
                        if let Some(chunk) = self.emit_window() {
                            return Some(chunk);
                        }
                    }
                }
                Err(_) => {
                    self.reader = None;
                    return None;
                }
            }
        }
    }
}

/// Streaming chunker over an in-memory byte slice (the fallback path).
pub fn stream_chunks(bytes: &[u8], opts: &ChunkOptions) -> Vec<Chunk> {
    StreamingChunks::new(BufReader::with_capacity(READ_BUFFER_BYTES, bytes), opts).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_opts() -> ChunkOptions {
        ChunkOptions::code()
    }

    #[test]
    fn selection_prefers_streaming_for_generated_and_large() {
        assert_eq!(select_strategy("dist/app.js", 100), Strategy::StreamingLine);
        assert_eq!(select_strategy("src/bundle.js", 100), Strategy::StreamingLine);
        assert_eq!(select_strategy("lib/app.min.js", 100), Strategy::StreamingLine);
        assert_eq!(
            select_strategy("src/a.ts", STREAMING_THRESHOLD_BYTES + 1),
            Strategy::StreamingLine
        );
        assert_eq!(select_strategy("README.md", 100), Strategy::Markdown);
        assert_eq!(select_strategy("notes.txt", 100), Strategy::StreamingLine);
        #[cfg(not(feature = "treesitter"))]
        assert_eq!(select_strategy("src/a.ts", 100), Strategy::Regex);
        #[cfg(feature = "treesitter")]
        assert_eq!(select_strategy("src/a.ts", 100), Strategy::Ast);
    }

    #[test]
    fn markdown_chunker_splits_headings_and_fences() {
        let mut text = String::from("# Title\n\nintro text\n");
        for i in 0..40 {
            text.push_str(&format!("line {i}\n"));
        }
        text.push_str("## Usage\n\n```rust\nfn main() {}\n```\n");
        for i in 0..40 {
            text.push_str(&format!("usage {i}\n"));
        }
        let chunks = chunk_markdown(&text, &ChunkOptions::markdown()).unwrap();
        let sections: Vec<_> =
            chunks.iter().filter(|c| c.chunk_type == ChunkType::Section).collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name.as_deref(), Some("Title"));
        assert_eq!(sections[1].name.as_deref(), Some("Usage"));
        let blocks: Vec<_> =
            chunks.iter().filter(|c| c.chunk_type == ChunkType::CodeBlock).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.get(META_LANGUAGE), Some(&Value::String("rust".into())));
        assert!(blocks[0].text.contains("fn main"));
    }

    #[test]
    fn regex_chunker_finds_top_level_decls() {
        let src = "\
import { x } from './x';

/** Greets. */
export function greet(name: string): string {
  return `hi ${name}`;
}

export class Service {
  run(): void {}
}
";
        let chunks = chunk_regex(src, "ts", &ChunkOptions { min_lines: 1, ..code_opts() }).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name.as_deref(), Some("greet"));
        assert_eq!(chunks[0].chunk_type, ChunkType::Function);
        // Doc comment pulled into the chunk.
        assert!(chunks[0].text.contains("Greets."));
        assert_eq!(chunks[1].name.as_deref(), Some("Service"));
        assert_eq!(chunks[1].chunk_type, ChunkType::Class);
    }

    #[test]
    fn oversized_chunks_split_into_equal_sub_chunks() {
        let lines: Vec<String> = (1..=450).map(|i| format!("line {i}")).collect();
        let chunk = Chunk::lines(lines.join("\n"), 1, 450);
        let out = split_oversized(vec![chunk], 200);
        assert_eq!(out.len(), 3);
        for sub in &out {
            assert!(sub.span.end_line - sub.span.start_line + 1 <= 200);
            assert_eq!(sub.metadata.get(META_IS_SUB_CHUNK), Some(&Value::Bool(true)));
            assert_eq!(sub.metadata.get(META_ORIGINAL_START), Some(&Value::from(1)));
            assert_eq!(sub.metadata.get(META_ORIGINAL_END), Some(&Value::from(450)));
        }
        assert_eq!(out[0].span.start_line, 1);
        assert_eq!(out[2].span.end_line, 450);
    }

    #[test]
    fn streaming_chunker_tracks_global_line_numbers() {
        let text: String = (1..=500).map(|i| format!("row {i}\n")).collect();
        let chunks = stream_chunks(text.as_bytes(), &code_opts());
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].span.start_line, 1);
        assert_eq!(chunks[0].span.end_line, 200);
        // Overlap: the next chunk starts at or before line 201.
        assert!(chunks[1].span.start_line <= 201);
        assert_eq!(chunks.last().unwrap().span.end_line, 500);
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert!(c.span.start_line <= c.span.end_line);
        }
    }

    #[test]
    fn streaming_chunker_handles_missing_trailing_newline() {
        let chunks = stream_chunks(b"alpha\nbeta\ngamma", &code_opts());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].span, Span { start_line: 1, end_line: 3 });
        assert!(chunks[0].text.ends_with("gamma"));
    }

    #[test]
    fn chunk_file_streams_generated_paths() {
        let dir = tempfile::tempdir().unwrap();
        let abs = dir.path().join("bundle.js");
        let text: String = (1..=300).map(|i| format!("var v{i} = {i};\n")).collect();
        std::fs::write(&abs, &text).unwrap();
        let chunks = chunk_file(&abs, "dist/bundle.js", &code_opts()).unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Lines));
        assert_eq!(chunks[0].span.start_line, 1);
        assert_eq!(chunks.last().unwrap().span.end_line, 300);
    }

    #[test]
    fn fallback_kicks_in_for_unparseable_source() {
        // No recognizable declarations: the regex chunker yields nothing and
        // the streaming fallback takes over.
        let text = "just\nsome\nplain\nwords\n";
        let chunks = chunk_source(text, "src/weird.ts", &code_opts()).unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].chunk_type, ChunkType::Lines);
    }
}
