//! ES module transforms on top of the tree-sitter TypeScript grammar
//!
//! Every transform is a set of byte-range edits applied to the source text;
//! nothing is pretty-printed, so untouched code keeps its exact formatting.

pub mod analyze;
pub mod cjs;
pub mod ssr;
pub mod strip;

use crate::error::{Location, TransformError};
use std::ops::Range;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

pub use analyze::{analyze, ImportBinding, ImportKind, ImportRef, ModuleAnalysis, ModuleFormat, ReExport};
pub use cjs::{wrap_commonjs, wrap_commonjs_runner};
pub use ssr::ssr_transform;
pub use strip::strip_types;

/// Source language of a file, picked from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JavaScript,
    Jsx,
    TypeScript,
    Tsx,
}

impl Dialect {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("ts") | Some("mts") | Some("cts") => Dialect::TypeScript,
            Some("tsx") => Dialect::Tsx,
            Some("jsx") => Dialect::Jsx,
            _ => Dialect::JavaScript,
        }
    }

    pub fn is_typescript(self) -> bool {
        matches!(self, Dialect::TypeScript | Dialect::Tsx)
    }

    fn language(self) -> tree_sitter::Language {
        match self {
            Dialect::Tsx | Dialect::Jsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Dialect::TypeScript | Dialect::JavaScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        }
    }
}

/// Parse `source`, failing on the first syntax error
pub fn parse(source: &str, dialect: Dialect, file: &str) -> Result<Tree, TransformError> {
    let mut parser = Parser::new();
    parser
        .set_language(&dialect.language())
        .map_err(|e| TransformError::Grammar(e.to_string()))?;
    let tree = parser.parse(source, None).ok_or_else(|| TransformError::Syntax {
        location: Location {
            file: file.to_string(),
            line: 1,
            column: 1,
        },
        message: "parser produced no tree".to_string(),
    })?;

    let root = tree.root_node();
    if root.has_error() {
        let node = first_error(root).unwrap_or(root);
        let message = if node.is_missing() {
            format!("expected `{}`", node.kind())
        } else {
            let snippet: String = source[node.byte_range()].chars().take(40).collect();
            format!("unexpected `{}`", snippet.trim())
        };
        return Err(TransformError::Syntax {
            location: location(node, file),
            message,
        });
    }
    Ok(tree)
}

fn first_error(root: Node<'_>) -> Option<Node<'_>> {
    let mut found = None;
    walk(root, |node| {
        if found.is_some() {
            return Walk::Skip;
        }
        if node.is_error() || node.is_missing() {
            found = Some(node);
            return Walk::Skip;
        }
        if node.has_error() {
            Walk::Children
        } else {
            Walk::Skip
        }
    });
    found
}

pub(crate) fn location(node: Node<'_>, file: &str) -> Location {
    let point = node.start_position();
    Location {
        file: file.to_string(),
        line: point.row + 1,
        column: point.column + 1,
    }
}

pub(crate) enum Walk<'t> {
    Children,
    Skip,
    /// Visit this one child instead of all of them
    Only(Node<'t>),
}

/// Pre-order walk without recursion; minified bundles nest deep enough to
/// overflow a worker thread's stack.
pub(crate) fn walk<'t>(root: Node<'t>, mut visit: impl FnMut(Node<'t>) -> Walk<'t>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match visit(node) {
            Walk::Skip => {}
            Walk::Only(child) => stack.push(child),
            Walk::Children => {
                let mut cursor = node.walk();
                let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
                stack.extend(children.into_iter().rev());
            }
        }
    }
}

pub(crate) fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    &source[node.byte_range()]
}

/// Value of a string literal node, quotes removed
pub(crate) fn string_value(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let raw = text(node, source);
    if raw.len() < 2 {
        return None;
    }
    Some(raw[1..raw.len() - 1].to_string())
}

/// Anonymous child token with the given text, e.g. `type` or `?`
pub(crate) fn token_child<'t>(node: Node<'t>, token: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|child| !child.is_named() && child.kind() == token);
    found
}

pub(crate) fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub(crate) fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

/// JS string literal for `value`
pub(crate) fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// `object.name`, or `object["name"]` when `name` is not an identifier
pub(crate) fn member_access(object: &str, name: &str) -> String {
    if is_identifier(name) {
        format!("{}.{}", object, name)
    } else {
        format!("{}[{}]", object, js_string(name))
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do", "else",
    "enum", "export", "extends", "false", "finally", "for", "function", "if", "implements", "import", "in",
    "instanceof", "interface", "let", "new", "null", "package", "private", "protected", "public", "return", "static",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Whether `name` can be declared as a local binding
pub(crate) fn is_bindable(name: &str) -> bool {
    is_identifier(name) && !RESERVED_WORDS.contains(&name)
}

/// Names bound by a declaration pattern
pub(crate) fn pattern_names(node: Node<'_>, source: &str, out: &mut Vec<String>) {
    match node.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => out.push(text(node, source).to_string()),
        "variable_declarator" | "required_parameter" | "optional_parameter" => {
            let field = if node.kind() == "variable_declarator" { "name" } else { "pattern" };
            if let Some(inner) = node.child_by_field_name(field) {
                pattern_names(inner, source, out);
            }
        }
        "pair_pattern" => {
            if let Some(value) = node.child_by_field_name("value") {
                pattern_names(value, source, out);
            }
        }
        "assignment_pattern" | "object_assignment_pattern" => {
            if let Some(left) = node.child_by_field_name("left") {
                pattern_names(left, source, out);
            }
        }
        "object_pattern" | "array_pattern" | "rest_pattern" | "formal_parameters" => {
            for child in named_children(node) {
                pattern_names(child, source, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone)]
struct Edit {
    range: Range<usize>,
    text: String,
}

/// Byte-range edits against one source string
#[derive(Debug, Default)]
pub(crate) struct Edits {
    edits: Vec<Edit>,
}

impl Edits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, range: Range<usize>, text: impl Into<String>) {
        self.edits.push(Edit {
            range,
            text: text.into(),
        });
    }

    pub fn remove(&mut self, range: Range<usize>) {
        self.replace(range, String::new());
    }

    pub fn insert(&mut self, at: usize, text: impl Into<String>) {
        self.replace(at..at, text);
    }

    /// Apply every edit. An edit overlapping one that starts earlier is
    /// dropped; inserts at the same offset keep their order.
    pub fn apply(mut self, source: &str) -> String {
        self.edits.sort_by_key(|edit| (edit.range.start, edit.range.end));
        let mut out = String::with_capacity(source.len());
        let mut cursor = 0;
        for edit in self.edits {
            if edit.range.start < cursor {
                continue;
            }
            out.push_str(&source[cursor..edit.range.start]);
            out.push_str(&edit.text);
            cursor = edit.range.end;
        }
        out.push_str(&source[cursor..]);
        out
    }
}
