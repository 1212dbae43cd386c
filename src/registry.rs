//! Parser registry: per-language syntax analysis behind one dispatch point
//!
//! The registry is an explicit instance constructed once per process and
//! passed by reference into the indexer. There is no global language table;
//! callers own the registry's lifetime.
//!
//! `parse_file` returns a tagged `ParseOutcome`: either structural facts or
//! a typed unavailable diagnostic. Callers dispatch on the tag, never on a
//! probed result shape.

use std::path::Path;

use tracing::{debug, warn};
use tree_sitter::{Node, Tree};

use crate::error::Result;
use crate::fingerprint;
use crate::lang::{GrammarBackend, Lang, LangFamily};
use crate::schema::{FunctionRecord, ModuleRecord};

/// Structural facts extracted from one file
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    /// Name of the grammar backend that produced these facts
    pub parser: String,
    pub functions: Vec<FunctionRecord>,
    pub module: ModuleRecord,
}

/// Result of asking the registry to parse one file.
///
/// Tagged union: dispatch on the variant. `Unavailable` is a diagnostic,
/// not an error — the indexer degrades to a synthetic module record.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    Parsed(ParsedFile),
    Unavailable {
        language: String,
        /// Install guidance: the crate/grammar that would make this parseable
        missing_module: String,
    },
}

/// Per-process parser registry.
///
/// Grammar backends are compiled in; construction cannot fail. The struct
/// exists (rather than free functions) so the language table is injected
/// state, reusable across every file of an indexing session.
#[derive(Debug, Default)]
pub struct ParserRegistry {
    _private: (),
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Parse one file into structural facts.
    ///
    /// Selection is by extension. Languages with multiple candidate
    /// backends try the preferred grammar first, then the alternate,
    /// before declaring the parser unavailable. Recognized non-code
    /// formats yield a best-effort empty-function module record, so
    /// indexing never fails outright for a known file type.
    pub fn parse_file(&self, path: &Path, source: &str) -> Result<ParseOutcome> {
        let lang = match Lang::from_path(path) {
            Ok(lang) => lang,
            Err(err) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("none")
                    .to_string();
                debug!(path = %path.display(), code = err.code(), "no parser for extension");
                return Ok(ParseOutcome::Unavailable {
                    language: ext.clone(),
                    missing_module: format!("a tree-sitter grammar for .{}", ext),
                });
            }
        };

        let backends = lang.backends();
        if backends.is_empty() {
            // Recognized format with no structural grammar: empty record
            return Ok(ParseOutcome::Parsed(ParsedFile {
                parser: lang.name().to_string(),
                functions: Vec::new(),
                module: ModuleRecord {
                    file_path: path.to_string_lossy().to_string(),
                    language: lang.name().to_string(),
                    ..Default::default()
                },
            }));
        }

        for backend in backends {
            match try_parse(*backend, source) {
                Some(tree) => {
                    return Ok(ParseOutcome::Parsed(extract_facts(
                        path, source, &tree, lang, *backend,
                    )));
                }
                None => {
                    warn!(
                        language = lang.name(),
                        backend = backend.name(),
                        "grammar backend failed, trying alternate"
                    );
                }
            }
        }

        Ok(ParseOutcome::Unavailable {
            language: lang.name().to_string(),
            missing_module: backends[0].crate_name().to_string(),
        })
    }
}

/// Attempt a parse with one backend; None if the grammar cannot load or
/// produces no tree
fn try_parse(backend: GrammarBackend, source: &str) -> Option<Tree> {
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&backend.tree_sitter_language()).ok()?;
    parser.parse(source, None)
}

fn node_text(node: &Node, source: &str) -> String {
    node.utf8_text(source.as_bytes()).unwrap_or("").to_string()
}

/// Collapse a signature to a single line
fn normalize_signature(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract functions and module facts from a parsed tree
fn extract_facts(
    path: &Path,
    source: &str,
    tree: &Tree,
    lang: Lang,
    backend: GrammarBackend,
) -> ParsedFile {
    let file_path = path.to_string_lossy().to_string();
    let mut functions = Vec::new();
    let mut exports = Vec::new();
    let mut dependencies = Vec::new();

    let root = tree.root_node();
    let family = lang.family();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        collect_from_node(
            &node,
            source,
            family,
            &file_path,
            &mut functions,
            &mut exports,
            &mut dependencies,
        );
        for i in (0..node.named_child_count()).rev() {
            if let Some(child) = node.named_child(i) {
                stack.push(child);
            }
        }
    }

    functions.sort_by(|a, b| a.start_line.cmp(&b.start_line));
    exports.dedup();

    ParsedFile {
        parser: backend.name().to_string(),
        functions,
        module: ModuleRecord {
            file_path,
            language: lang.name().to_string(),
            exports,
            dependencies,
            partially_indexed: false,
        },
    }
}

fn collect_from_node(
    node: &Node,
    source: &str,
    family: LangFamily,
    file_path: &str,
    functions: &mut Vec<FunctionRecord>,
    exports: &mut Vec<String>,
    dependencies: &mut Vec<String>,
) {
    let kind = node.kind();
    match family {
        LangFamily::JavaScript => match kind {
            "function_declaration" | "generator_function_declaration" | "method_definition" => {
                if let Some(record) = function_from_node(node, source, family, file_path) {
                    if is_exported_js(node) {
                        exports.push(record.name.clone());
                    }
                    functions.push(record);
                }
            }
            "variable_declarator" => {
                // const f = (x) => ... and const f = function (x) { ... }
                if let Some(value) = node.child_by_field_name("value") {
                    if matches!(value.kind(), "arrow_function" | "function_expression") {
                        if let Some(name) = node.child_by_field_name("name") {
                            if let Some(mut record) =
                                function_from_node(&value, source, family, file_path)
                            {
                                record.name = node_text(&name, source);
                                record.signature = normalize_signature(&format!(
                                    "{} = {}",
                                    record.name,
                                    signature_text(&value, source)
                                ));
                                if is_exported_js(node) {
                                    exports.push(record.name.clone());
                                }
                                functions.push(record);
                            }
                        }
                    }
                }
            }
            "class_declaration" => {
                if is_exported_js(node) {
                    if let Some(name) = node.child_by_field_name("name") {
                        exports.push(node_text(&name, source));
                    }
                }
            }
            "import_statement" => {
                if let Some(src) = node.child_by_field_name("source") {
                    let spec = node_text(&src, source);
                    dependencies.push(spec.trim_matches(|c| c == '"' || c == '\'').to_string());
                }
            }
            _ => {}
        },
        LangFamily::Rust => match kind {
            "function_item" => {
                if let Some(record) = function_from_node(node, source, family, file_path) {
                    if has_pub_modifier(node) {
                        exports.push(record.name.clone());
                    }
                    functions.push(record);
                }
            }
            "struct_item" | "enum_item" | "trait_item" => {
                if has_pub_modifier(node) {
                    if let Some(name) = node.child_by_field_name("name") {
                        exports.push(node_text(&name, source));
                    }
                }
            }
            "use_declaration" => {
                let text = node_text(node, source);
                let dep = text
                    .trim_start_matches("pub ")
                    .trim_start_matches("use ")
                    .trim_end_matches(';')
                    .trim()
                    .to_string();
                if !dep.is_empty() {
                    dependencies.push(dep);
                }
            }
            _ => {}
        },
        LangFamily::Python => match kind {
            "function_definition" => {
                if let Some(record) = function_from_node(node, source, family, file_path) {
                    if !record.name.starts_with('_') && is_top_level_py(node) {
                        exports.push(record.name.clone());
                    }
                    functions.push(record);
                }
            }
            "class_definition" => {
                if is_top_level_py(node) {
                    if let Some(name) = node.child_by_field_name("name") {
                        let name = node_text(&name, source);
                        if !name.starts_with('_') {
                            exports.push(name);
                        }
                    }
                }
            }
            "import_statement" | "import_from_statement" => {
                if let Some(module) = node
                    .child_by_field_name("module_name")
                    .or_else(|| node.named_child(0))
                {
                    dependencies.push(node_text(&module, source));
                }
            }
            _ => {}
        },
        LangFamily::Go => match kind {
            "function_declaration" | "method_declaration" => {
                if let Some(record) = function_from_node(node, source, family, file_path) {
                    if record.name.chars().next().is_some_and(|c| c.is_uppercase()) {
                        exports.push(record.name.clone());
                    }
                    functions.push(record);
                }
            }
            "import_spec" => {
                if let Some(path_node) = node.child_by_field_name("path") {
                    dependencies
                        .push(node_text(&path_node, source).trim_matches('"').to_string());
                }
            }
            _ => {}
        },
        LangFamily::Config | LangFamily::Plain => {}
    }
}

/// Signature text: from node start to body start, single line
fn signature_text(node: &Node, source: &str) -> String {
    let start = node.start_byte();
    let end = node
        .child_by_field_name("body")
        .map(|b| b.start_byte())
        .unwrap_or_else(|| node.end_byte());
    normalize_signature(source.get(start..end).unwrap_or(""))
}

/// Build a FunctionRecord from a function-like node, with fingerprint
fn function_from_node(
    node: &Node,
    source: &str,
    family: LangFamily,
    file_path: &str,
) -> Option<FunctionRecord> {
    let name = node
        .child_by_field_name("name")
        .map(|n| node_text(&n, source))
        .unwrap_or_default();
    let body = node.child_by_field_name("body")?;
    let params = node
        .child_by_field_name("parameters")
        .map(|p| param_names(&p, family, source))
        .unwrap_or_default();
    let flags = fingerprint::fingerprint(family, &body, &params, source);

    Some(FunctionRecord {
        file_path: file_path.to_string(),
        name,
        signature: signature_text(node, source),
        purpose: String::new(),
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        confidence: 0.9,
        flags,
        access_count: 0,
        outcome_count: 0,
    })
}

/// Declared parameter names from a parameter-list node
fn param_names(params: &Node, family: LangFamily, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for i in 0..params.named_child_count() {
        let Some(child) = params.named_child(i) else {
            continue;
        };
        match (family, child.kind()) {
            (_, "identifier") => names.push(node_text(&child, source)),
            (LangFamily::Rust, "parameter") => {
                if let Some(pattern) = child.child_by_field_name("pattern") {
                    names.push(node_text(&pattern, source).trim_start_matches("mut ").to_string());
                }
            }
            (LangFamily::Rust, "self_parameter") => names.push("self".to_string()),
            (LangFamily::Go, "parameter_declaration") => {
                // one declaration can name several parameters: `a, b int`
                for j in 0..child.named_child_count() {
                    if let Some(part) = child.named_child(j) {
                        if part.kind() == "identifier" {
                            names.push(node_text(&part, source));
                        }
                    }
                }
            }
            (LangFamily::Python, "typed_parameter" | "default_parameter" | "typed_default_parameter") => {
                if let Some(inner) = child
                    .child_by_field_name("name")
                    .or_else(|| child.named_child(0))
                {
                    if inner.kind() == "identifier" {
                        names.push(node_text(&inner, source));
                    }
                }
            }
            (LangFamily::JavaScript, "assignment_pattern") => {
                if let Some(left) = child.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        names.push(node_text(&left, source));
                    }
                }
            }
            (LangFamily::JavaScript, "required_parameter" | "optional_parameter") => {
                // TypeScript grammar wraps parameters
                if let Some(pattern) = child.child_by_field_name("pattern") {
                    if pattern.kind() == "identifier" {
                        names.push(node_text(&pattern, source));
                    }
                }
            }
            _ => {}
        }
    }
    names
}

/// Whether a JS node is under an export statement
fn is_exported_js(node: &Node) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if parent.kind() == "export_statement" {
            return true;
        }
        if matches!(parent.kind(), "statement_block" | "class_body") {
            return false;
        }
        current = parent.parent();
    }
    false
}

/// Whether a Rust item carries a `pub` visibility modifier
fn has_pub_modifier(node: &Node) -> bool {
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if child.kind() == "visibility_modifier" {
                return true;
            }
        }
    }
    false
}

/// Whether a Python definition sits at module top level
fn is_top_level_py(node: &Node) -> bool {
    node.parent().map(|p| p.kind() == "module").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(path: &str, source: &str) -> ParseOutcome {
        let registry = ParserRegistry::new();
        registry.parse_file(&PathBuf::from(path), source).unwrap()
    }

    fn expect_parsed(outcome: ParseOutcome) -> ParsedFile {
        match outcome {
            ParseOutcome::Parsed(parsed) => parsed,
            ParseOutcome::Unavailable { language, .. } => {
                panic!("expected parse, got unavailable for {}", language)
            }
        }
    }

    #[test]
    fn test_javascript_functions_and_imports() {
        let parsed = expect_parsed(parse(
            "src/app.js",
            r#"
import { thing } from './thing';

export function greet(name) {
    return "hi " + name;
}

const shout = (msg) => msg.toUpperCase();
"#,
        ));
        assert_eq!(parsed.parser, "javascript");
        let names: Vec<_> = parsed.functions.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"greet"));
        assert!(names.contains(&"shout"));
        assert!(parsed.module.exports.contains(&"greet".to_string()));
        assert_eq!(parsed.module.dependencies, vec!["./thing".to_string()]);
    }

    #[test]
    fn test_rust_functions_and_exports() {
        let parsed = expect_parsed(parse(
            "src/lib.rs",
            r#"
use std::collections::HashMap;

pub fn lookup(map: &HashMap<String, u32>, key: &str) -> Option<u32> {
    map.get(key).copied()
}

fn helper(x: u32) -> u32 { x * 2 }
"#,
        ));
        assert_eq!(parsed.parser, "rust");
        assert_eq!(parsed.functions.len(), 2);
        assert_eq!(parsed.module.exports, vec!["lookup".to_string()]);
        assert_eq!(
            parsed.module.dependencies,
            vec!["std::collections::HashMap".to_string()]
        );
    }

    #[test]
    fn test_python_exports_skip_underscore() {
        let parsed = expect_parsed(parse(
            "pkg/mod.py",
            "import os\n\ndef visible(a):\n    return a\n\ndef _hidden(b):\n    return b\n",
        ));
        assert_eq!(parsed.module.exports, vec!["visible".to_string()]);
        assert_eq!(parsed.functions.len(), 2);
        assert_eq!(parsed.module.dependencies, vec!["os".to_string()]);
    }

    #[test]
    fn test_go_capitalized_exports() {
        let parsed = expect_parsed(parse(
            "pkg/main.go",
            "package pkg\n\nimport \"fmt\"\n\nfunc Public(a int) int {\n\treturn a\n}\n\nfunc private(b int) int {\n\treturn b\n}\n",
        ));
        assert_eq!(parsed.module.exports, vec!["Public".to_string()]);
        assert_eq!(parsed.module.dependencies, vec!["fmt".to_string()]);
    }

    #[test]
    fn test_line_ranges_are_one_indexed() {
        let parsed = expect_parsed(parse(
            "src/one.js",
            "function solo() {\n    return 1;\n}\n",
        ));
        assert_eq!(parsed.functions.len(), 1);
        assert_eq!(parsed.functions[0].start_line, 1);
        assert_eq!(parsed.functions[0].end_line, 3);
    }

    #[test]
    fn test_recognized_format_without_grammar_yields_empty_record() {
        let parsed = expect_parsed(parse("README.md", "# Title\n\nSome prose.\n"));
        assert_eq!(parsed.parser, "markdown");
        assert!(parsed.functions.is_empty());
        assert_eq!(parsed.module.language, "markdown");
        assert!(!parsed.module.partially_indexed);
    }

    #[test]
    fn test_unknown_extension_is_unavailable_not_error() {
        match parse("Main.kt", "fun main() {}") {
            ParseOutcome::Unavailable {
                language,
                missing_module,
            } => {
                assert_eq!(language, "kt");
                assert!(missing_module.contains("tree-sitter"));
            }
            ParseOutcome::Parsed(_) => panic!("kotlin should be unavailable"),
        }
    }

    #[test]
    fn test_typescript_uses_preferred_backend() {
        let parsed = expect_parsed(parse(
            "src/util.ts",
            "export function double(n: number): number {\n    return n * 2;\n}\n",
        ));
        assert_eq!(parsed.parser, "typescript");
        assert_eq!(parsed.functions.len(), 1);
        assert!(parsed.functions[0].flags.is_pure);
        assert!(parsed.functions[0].flags.return_depends_on_inputs);
    }
}
