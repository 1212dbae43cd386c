//! Behavioral fingerprinting over surface syntax
//!
//! Derives `BehaviorFlags` for a function body by pattern-matching the
//! syntax tree: mutation targets, known-impure builtins, throw sites, and
//! the free variables of return expressions. This is a heuristic over
//! surface syntax, not dataflow analysis; it is substitutable with a
//! stricter analysis as long as the known-pure false-negative bound holds.

use tree_sitter::Node;

use crate::lang::LangFamily;
use crate::schema::BehaviorFlags;

/// Node kinds that introduce a nested function scope.
///
/// Traversal stops at these so a throw inside a nested closure does not
/// count against the enclosing function's own body.
const NESTED_FUNCTION_KINDS: &[&str] = &[
    "function_declaration",
    "function_expression",
    "generator_function_declaration",
    "arrow_function",
    "method_definition",
    "function_definition",
    "function_item",
    "closure_expression",
    "func_literal",
];

/// Method names that mutate their receiver in place
const MUTATING_METHODS: &[&str] = &[
    // JavaScript / TypeScript
    "push", "pop", "shift", "unshift", "splice", "sort", "reverse", "fill",
    "set", "delete", "add", "clear", "copyWithin",
    // Python
    "append", "extend", "insert", "remove", "update", "setdefault", "popitem",
    // Rust
    "push_str", "insert_str", "truncate", "retain", "drain", "dedup",
    // Go has no methods in this set; mutation goes through pointers
];

/// Visit the nodes of a function's own body, skipping nested functions.
fn visit_own_body<F>(body: &Node, mut visitor: F)
where
    F: FnMut(&Node),
{
    let mut cursor = body.walk();
    let mut did_visit_children = false;

    loop {
        if !did_visit_children {
            let node = cursor.node();
            let is_nested = node.id() != body.id() && NESTED_FUNCTION_KINDS.contains(&node.kind());
            if !is_nested {
                visitor(&node);
                if cursor.goto_first_child() {
                    continue;
                }
            }
        }

        if cursor.goto_next_sibling() {
            did_visit_children = false;
            continue;
        }

        if !cursor.goto_parent() {
            break;
        }
        did_visit_children = true;
    }
}

fn node_text(node: &Node, source: &str) -> String {
    node.utf8_text(source.as_bytes()).unwrap_or("").to_string()
}

/// Collect identifier texts in a subtree (without crossing into nested functions)
fn collect_identifiers(node: &Node, source: &str, out: &mut Vec<String>) {
    visit_own_body(node, |n| {
        if matches!(n.kind(), "identifier" | "shorthand_property_identifier") {
            out.push(node_text(n, source));
        }
    });
}

/// Leftmost identifier of an lvalue, e.g. `a` in `a.b[0].c`
fn root_identifier(node: &Node, source: &str) -> Option<String> {
    let mut current = *node;
    loop {
        if matches!(current.kind(), "identifier" | "self") {
            return Some(node_text(&current, source));
        }
        match current
            .child_by_field_name("object")
            .or_else(|| current.child_by_field_name("value"))
            .or_else(|| current.child_by_field_name("operand"))
            .or_else(|| current.named_child(0))
        {
            Some(child) => current = child,
            None => return None,
        }
    }
}

/// Throw/raise/panic sites per language family
fn is_throw_site(node: &Node, source: &str, family: LangFamily) -> bool {
    match family {
        LangFamily::JavaScript => node.kind() == "throw_statement",
        LangFamily::Python => node.kind() == "raise_statement",
        LangFamily::Rust => {
            if node.kind() != "macro_invocation" {
                return false;
            }
            let text = node_text(node, source);
            ["panic!", "unreachable!", "todo!", "unimplemented!", "assert!", "assert_eq!"]
                .iter()
                .any(|m| text.starts_with(m))
        }
        LangFamily::Go => {
            node.kind() == "call_expression"
                && node
                    .child_by_field_name("function")
                    .map(|f| node_text(&f, source) == "panic")
                    .unwrap_or(false)
        }
        LangFamily::Config | LangFamily::Plain => false,
    }
}

/// Known-impure builtin prefixes per family, matched against call text
fn impure_call_prefixes(family: LangFamily) -> &'static [&'static str] {
    match family {
        LangFamily::JavaScript => &[
            "console.", "fetch", "require", "process.", "document.", "window.",
            "localStorage", "sessionStorage", "setTimeout", "setInterval",
            "Math.random", "Date.now", "alert",
        ],
        LangFamily::Python => &[
            "print", "open", "input", "os.", "sys.", "random.", "shutil.",
            "subprocess.", "logging.", "time.sleep",
        ],
        LangFamily::Rust => &[
            "println!", "eprintln!", "print!", "eprint!", "std::fs::", "fs::",
            "std::io::", "io::stdin", "io::stdout", "File::", "std::process::",
        ],
        LangFamily::Go => &[
            "fmt.Print", "fmt.Fprint", "os.", "log.", "rand.", "time.Sleep",
            "ioutil.", "http.",
        ],
        LangFamily::Config | LangFamily::Plain => &[],
    }
}

fn is_assignment_kind(kind: &str) -> bool {
    matches!(
        kind,
        "assignment_expression"
            | "augmented_assignment_expression"
            | "assignment"
            | "augmented_assignment"
            | "assignment_statement"
            | "compound_assignment_expr"
            | "update_expression"
            | "inc_dec_statement"
    )
}

/// Names a locally-introduced binding, so assigning to it is not a capture
fn is_declaration_kind(kind: &str) -> bool {
    matches!(
        kind,
        "variable_declarator" | "let_declaration" | "short_var_declaration"
    )
}

/// Compute behavioral flags for one function.
///
/// `body` is the function's body node, `params` the declared parameter
/// names, `source` the full file text.
pub fn fingerprint(family: LangFamily, body: &Node, params: &[String], source: &str) -> BehaviorFlags {
    let mut flags = BehaviorFlags::default();

    let impure_prefixes = impure_call_prefixes(family);
    let mut locals: Vec<String> = Vec::new();
    let mut return_identifiers: Vec<String> = Vec::new();
    let mut saw_return = false;

    // Python: names declared global/nonlocal make bare-identifier
    // assignment an external mutation rather than a local binding
    let mut escaping_names: Vec<String> = Vec::new();

    visit_own_body(body, |node| {
        let kind = node.kind();

        // Local bindings
        if is_declaration_kind(kind) {
            if let Some(name) = node
                .child_by_field_name("name")
                .or_else(|| node.child_by_field_name("left"))
                .or_else(|| node.named_child(0))
            {
                let mut names = Vec::new();
                collect_identifiers(&name, source, &mut names);
                locals.extend(names);
            }
        }

        if matches!(kind, "global_statement" | "nonlocal_statement") {
            let mut names = Vec::new();
            collect_identifiers(node, source, &mut names);
            escaping_names.extend(names);
        }

        // Throws
        if is_throw_site(node, source, family) {
            flags.throws = true;
        }

        // Calls: impure builtins and mutating methods on parameters
        if matches!(kind, "call_expression" | "call" | "macro_invocation") {
            let call_text = node
                .child_by_field_name("function")
                .map(|f| node_text(&f, source))
                .unwrap_or_else(|| node_text(node, source));

            if impure_prefixes.iter().any(|p| call_text.starts_with(p)) {
                flags.has_side_effects = true;
            }

            // receiver.method(...) where receiver is a parameter
            if let Some(func) = node.child_by_field_name("function") {
                if matches!(
                    func.kind(),
                    "member_expression" | "attribute" | "field_expression" | "selector_expression"
                ) {
                    let method = func
                        .child_by_field_name("property")
                        .or_else(|| func.child_by_field_name("attribute"))
                        .or_else(|| func.child_by_field_name("field"))
                        .map(|m| node_text(&m, source))
                        .unwrap_or_default();
                    if MUTATING_METHODS.contains(&method.as_str()) {
                        if let Some(root) = root_identifier(&func, source) {
                            if params.contains(&root) {
                                flags.modifies_params = true;
                            }
                        }
                    }
                }
            }
        }

        // Assignments: parameter mutation and captured-reference mutation
        if is_assignment_kind(kind) {
            let target = node
                .child_by_field_name("left")
                .or_else(|| node.child_by_field_name("argument"))
                .or_else(|| node.named_child(0));
            if let Some(target) = target {
                let is_projection = matches!(
                    target.kind(),
                    "member_expression"
                        | "subscript_expression"
                        | "subscript"
                        | "attribute"
                        | "field_expression"
                        | "index_expression"
                        | "selector_expression"
                );
                if let Some(root) = root_identifier(&target, source) {
                    if params.contains(&root) {
                        if is_projection {
                            // property/index assignment through a parameter
                            flags.modifies_params = true;
                        }
                        // bare rebinding of a parameter identifier stays local
                    } else if escaping_names.contains(&root) {
                        flags.has_side_effects = true;
                    } else if family == LangFamily::Python && !is_projection {
                        // bare assignment introduces a local binding in Python
                        locals.push(root);
                    } else if !locals.contains(&root) {
                        // target was captured from an enclosing scope
                        flags.has_side_effects = true;
                    }
                }
            }
        }

        // Return expressions: free variables vs. parameter set
        if matches!(kind, "return_statement" | "return_expression") {
            saw_return = true;
            let mut names = Vec::new();
            collect_identifiers(node, source, &mut names);
            return_identifiers.extend(names);
        }
    });

    // Rust: an expression-bodied function returns its trailing expression
    if family == LangFamily::Rust && !saw_return {
        if let Some(last) = last_expression(body) {
            let mut names = Vec::new();
            collect_identifiers(&last, source, &mut names);
            return_identifiers.extend(names);
        }
    }

    // JS arrow functions with a concise body: the body IS the return
    // expression, no return_statement node exists
    if family == LangFamily::JavaScript && !saw_return && body.kind() != "statement_block" {
        let mut names = Vec::new();
        collect_identifiers(body, source, &mut names);
        return_identifiers.extend(names);
    }

    flags.return_depends_on_inputs = return_identifiers.iter().any(|n| params.contains(n));
    flags.has_side_effects |= flags.throws;
    flags.is_pure = !flags.has_side_effects && !flags.modifies_params && !flags.throws;
    flags
}

/// Trailing expression of a block body, if any (Rust implicit return)
fn last_expression<'a>(body: &Node<'a>) -> Option<Node<'a>> {
    let last = body.named_child(body.named_child_count().checked_sub(1)?)?;
    if last.kind().ends_with("_expression")
        || matches!(last.kind(), "identifier" | "call_expression" | "binary_expression")
    {
        Some(last)
    } else {
        None
    }
}
