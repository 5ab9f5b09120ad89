//! Exported-symbol extraction for TypeScript/JavaScript sources.
//!
//! Produces the per-file `ApiExport` records: exported name, kind, a
//! one-line whitespace-collapsed signature, and the first line or two of a
//! doc comment when one directly precedes the declaration. Re-export lists
//! are recorded under their exported names with kind `const` when nothing
//! better can be inferred; anonymous default exports are recorded as
//! `default`.

use crate::types::{ApiExport, ExportKind};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Declaration patterns
// ---------------------------------------------------------------------------

struct ExportPatterns {
    function: Regex,
    class: Regex,
    interface: Regex,
    type_alias: Regex,
    const_decl: Regex,
    enum_decl: Regex,
    default_function: Regex,
    default_class: Regex,
    default_expr: Regex,
    reexport_list: Regex,
}

fn patterns() -> &'static ExportPatterns {
    static CELL: OnceLock<ExportPatterns> = OnceLock::new();
    CELL.get_or_init(|| ExportPatterns {
        function: Regex::new(r"^export\s+(?:async\s+)?function\s*\*?\s*(\w+)").unwrap(),
        class: Regex::new(r"^export\s+(?:abstract\s+)?class\s+(\w+)").unwrap(),
        interface: Regex::new(r"^export\s+interface\s+(\w+)").unwrap(),
        type_alias: Regex::new(r"^export\s+type\s+(\w+)").unwrap(),
        const_decl: Regex::new(r"^export\s+(?:declare\s+)?(?:const|let|var)\s+(\w+)").unwrap(),
        enum_decl: Regex::new(r"^export\s+(?:const\s+)?enum\s+(\w+)").unwrap(),
        default_function: Regex::new(r"^export\s+default\s+(?:async\s+)?function\s*\*?\s*(\w+)?")
            .unwrap(),
        default_class: Regex::new(r"^export\s+default\s+class\s+(\w+)?").unwrap(),
        default_expr: Regex::new(r"^export\s+default\s+").unwrap(),
        reexport_list: Regex::new(r"^export\s*\{([^}]*)\}").unwrap(),
    })
}

// ---------------------------------------------------------------------------
// Signature and doc comment helpers
// ---------------------------------------------------------------------------

/// Build a one-line signature: the declaration text up to its body opener,
/// whitespace-collapsed, spanning at most a handful of source lines.
fn one_line_signature(lines: &[&str], start: usize) -> String {
    let mut collected = String::new();
    for line in lines.iter().skip(start).take(5) {
        if !collected.is_empty() {
            collected.push(' ');
        }
        collected.push_str(line.trim());
        if line.contains('{') || line.trim_end().ends_with(';') {
            break;
        }
    }
    let cut = collected.find('{').unwrap_or(collected.len());
    let head = collected[..cut].trim_end_matches([';', ' ', '=']).trim();
    let collapsed: Vec<&str> = head.split_whitespace().collect();
    let mut sig = collapsed.join(" ");
    if sig.len() > 200 {
        let boundary = sig
            .char_indices()
            .take_while(|(i, _)| *i <= 200)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        sig.truncate(boundary);
        sig.push('…');
    }
    sig
}

/// First one or two content lines of a `/** … */` (or `//`) comment block
/// ending directly above `decl_line`.
fn leading_doc(lines: &[&str], decl_line: usize) -> Option<String> {
    if decl_line == 0 {
        return None;
    }
    let mut i = decl_line - 1;
    let above = lines[i].trim();
    if !(above.ends_with("*/") || above.starts_with("//")) {
        return None;
    }
    // Walk up to the start of the comment block.
    let mut start = i;
    if above.ends_with("*/") {
        loop {
            let t = lines[start].trim();
            if t.starts_with("/**") || t.starts_with("/*") {
                break;
            }
            if start == 0 {
                return None;
            }
            start -= 1;
        }
    } else {
        while start > 0 && lines[start - 1].trim().starts_with("//") {
            start -= 1;
        }
    }
    i = start;
    let mut content = Vec::new();
    while i < decl_line && content.len() < 2 {
        let t = lines[i]
            .trim()
            .trim_start_matches("/**")
            .trim_start_matches("/*")
            .trim_start_matches("//")
            .trim_start_matches('*')
            .trim_end_matches("*/")
            .trim();
        if !t.is_empty() && !t.starts_with('@') {
            content.push(t.to_string());
        }
        i += 1;
    }
    if content.is_empty() {
        None
    } else {
        Some(content.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract exported symbols from TS/JS source text. Names are unique within
/// the result; the first declaration wins.
pub fn extract_exports(text: &str) -> Vec<ApiExport> {
    let p = patterns();
    let lines: Vec<&str> = text.lines().collect();
    let mut exports: Vec<ApiExport> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let push = |exports: &mut Vec<ApiExport>,
                    seen: &mut HashSet<String>,
                    name: String,
                    kind: ExportKind,
                    signature: String,
                    jsdoc: Option<String>| {
        if seen.insert(name.clone()) {
            exports.push(ApiExport { name, kind, signature, jsdoc });
        }
    };

    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim_start();
        if !line.starts_with("export") {
            continue;
        }
        let sig = || one_line_signature(&lines, i);
        let doc = || leading_doc(&lines, i);

        if let Some(caps) = p.default_function.captures(line) {
            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or("default".into());
            push(&mut exports, &mut seen, name, ExportKind::Function, sig(), doc());
        } else if let Some(caps) = p.default_class.captures(line) {
            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or("default".into());
            push(&mut exports, &mut seen, name, ExportKind::Class, sig(), doc());
        } else if p.default_expr.is_match(line) {
            push(&mut exports, &mut seen, "default".into(), ExportKind::Const, sig(), doc());
        } else if let Some(caps) = p.function.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Function, sig(), doc());
        } else if let Some(caps) = p.class.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Class, sig(), doc());
        } else if let Some(caps) = p.interface.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Interface, sig(), doc());
        } else if let Some(caps) = p.enum_decl.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Enum, sig(), doc());
        } else if let Some(caps) = p.type_alias.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Type, sig(), doc());
        } else if let Some(caps) = p.const_decl.captures(line) {
            push(&mut exports, &mut seen, caps[1].into(), ExportKind::Const, sig(), doc());
        } else if let Some(caps) = p.reexport_list.captures(line) {
            // export { a, b as c } [from './x'] — record exported names with
            // kind const (the target's kind is not visible here).
            for item in caps[1].split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let name = match item.split_once(" as ") {
                    Some((_, alias)) => alias.trim(),
                    None => item,
                };
                if name == "default" || name.is_empty() {
                    continue;
                }
                push(
                    &mut exports,
                    &mut seen,
                    name.to_string(),
                    ExportKind::Const,
                    item.split_whitespace().collect::<Vec<_>>().join(" "),
                    None,
                );
            }
        }
    }
    exports
}
