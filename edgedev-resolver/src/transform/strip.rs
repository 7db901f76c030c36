//! TypeScript type stripping
//!
//! Removes type-only syntax and leaves runtime code byte-for-byte intact.
//! Constructs that need emitted runtime code (`enum`, `namespace`, parameter
//! properties) and JSX are rejected with their location.

use super::{children, location, named_children, parse, text, token_child, walk, Dialect, Edits, Walk};
use crate::error::TransformError;
use std::collections::HashSet;
use tree_sitter::Node;

/// Strip type syntax from `source`. Unused imports of TypeScript files are
/// elided, since they may name types only.
pub fn strip_types(source: &str, dialect: Dialect, file: &str) -> Result<String, TransformError> {
    let tree = parse(source, dialect, file)?;
    let mut stripper = Stripper {
        source,
        file,
        edits: Edits::new(),
        used: HashSet::new(),
        imports: Vec::new(),
        error: None,
    };
    walk(tree.root_node(), |node| stripper.visit(node));
    if let Some(err) = stripper.error {
        return Err(err);
    }
    if dialect.is_typescript() {
        stripper.elide_unused_imports();
    }
    Ok(stripper.edits.apply(source))
}

struct ImportDecl<'t> {
    node: Node<'t>,
    source_text: String,
    default: Option<String>,
    namespace: Option<String>,
    /// `(specifier text, local name, type-only)`
    named: Vec<(String, String, bool)>,
}

struct Stripper<'s, 't> {
    source: &'s str,
    file: &'s str,
    edits: Edits,
    used: HashSet<String>,
    imports: Vec<ImportDecl<'t>>,
    error: Option<TransformError>,
}

impl<'s, 't> Stripper<'s, 't> {
    fn visit(&mut self, node: Node<'t>) -> Walk<'t> {
        if self.error.is_some() {
            return Walk::Skip;
        }
        match node.kind() {
            "jsx_element" | "jsx_self_closing_element" | "jsx_fragment" => self.unsupported(node, "JSX"),
            "enum_declaration" => self.unsupported(node, "`enum`"),
            "internal_module" | "module" => self.unsupported(node, "`namespace`"),
            "import_alias" => self.unsupported(node, "`import =` alias"),

            "interface_declaration" | "type_alias_declaration" | "ambient_declaration" | "function_signature" => {
                self.remove_declaration(node);
                Walk::Skip
            }
            "abstract_method_signature" | "method_signature" | "index_signature" => {
                self.edits.remove(node.byte_range());
                Walk::Skip
            }
            "type_annotation"
            | "asserts_annotation"
            | "type_predicate_annotation"
            | "type_parameters"
            | "type_arguments"
            | "implements_clause" => {
                self.edits.remove(node.byte_range());
                Walk::Skip
            }

            "as_expression" | "satisfies_expression" => match named_children(node).first() {
                Some(&expr) => {
                    self.edits.remove(expr.end_byte()..node.end_byte());
                    Walk::Only(expr)
                }
                None => Walk::Skip,
            },
            "non_null_expression" => {
                if let Some(bang) = children(node).last().filter(|c| c.kind() == "!") {
                    self.edits.remove(bang.byte_range());
                }
                Walk::Children
            }

            "required_parameter" | "optional_parameter" => self.visit_parameter(node),
            "public_field_definition" => {
                if token_child(node, "declare").is_some() || token_child(node, "abstract").is_some() {
                    self.edits.remove(node.byte_range());
                    return Walk::Skip;
                }
                self.remove_modifiers(node, &["readonly", "?", "!"]);
                Walk::Children
            }
            "method_definition" => {
                self.remove_modifiers(node, &["?"]);
                Walk::Children
            }
            "abstract_class_declaration" => {
                if let Some(keyword) = token_child(node, "abstract") {
                    self.edits.remove(keyword.start_byte()..keyword.end_byte() + 1);
                }
                Walk::Children
            }

            "import_statement" => {
                self.visit_import(node);
                Walk::Skip
            }
            "export_statement" => {
                if token_child(node, "type").is_some() {
                    self.edits.remove(node.byte_range());
                    return Walk::Skip;
                }
                if token_child(node, "=").is_some() {
                    return self.unsupported(node, "`export =`");
                }
                for clause in named_children(node).into_iter().filter(|c| c.kind() == "export_clause") {
                    for specifier in named_children(clause) {
                        if token_child(specifier, "type").is_some() {
                            self.remove_list_item(specifier);
                        }
                    }
                }
                Walk::Children
            }

            "identifier" | "shorthand_property_identifier" => {
                self.used.insert(text(node, self.source).to_string());
                Walk::Skip
            }
            _ => Walk::Children,
        }
    }

    fn unsupported(&mut self, node: Node<'t>, construct: &str) -> Walk<'t> {
        self.error = Some(TransformError::Unsupported {
            location: location(node, self.file),
            construct: construct.to_string(),
        });
        Walk::Skip
    }

    fn visit_parameter(&mut self, node: Node<'t>) -> Walk<'t> {
        let is_property = children(node).iter().any(|child| {
            matches!(child.kind(), "accessibility_modifier" | "override_modifier")
                || (!child.is_named() && child.kind() == "readonly")
        });
        if is_property {
            return self.unsupported(node, "parameter property");
        }
        if node.child_by_field_name("pattern").map(|p| p.kind()) == Some("this") {
            self.remove_list_item(node);
            return Walk::Skip;
        }
        if let Some(question) = token_child(node, "?") {
            self.edits.remove(question.byte_range());
        }
        Walk::Children
    }

    fn remove_modifiers(&mut self, node: Node<'t>, tokens: &[&str]) {
        for child in children(node) {
            let is_modifier = matches!(child.kind(), "accessibility_modifier" | "override_modifier")
                || (!child.is_named() && tokens.contains(&child.kind()));
            if is_modifier {
                self.edits.remove(child.byte_range());
            }
        }
    }

    /// Remove a declaration, together with its `export` when it has one
    fn remove_declaration(&mut self, node: Node<'t>) {
        match node.parent().filter(|p| p.kind() == "export_statement") {
            Some(export) => self.edits.remove(export.byte_range()),
            None => self.edits.remove(node.byte_range()),
        }
    }

    /// Remove an element of a comma separated list with its trailing comma
    fn remove_list_item(&mut self, node: Node<'t>) {
        let mut end = node.end_byte();
        if let Some(next) = node.next_sibling().filter(|n| n.kind() == ",") {
            end = next.end_byte();
        }
        self.edits.remove(node.start_byte()..end);
    }

    fn visit_import(&mut self, node: Node<'t>) {
        if token_child(node, "type").is_some() {
            self.edits.remove(node.byte_range());
            return;
        }
        if named_children(node).iter().any(|c| c.kind() == "import_require_clause") {
            self.unsupported(node, "`import = require()`");
            return;
        }
        let Some(source) = node.child_by_field_name("source") else {
            return;
        };
        let Some(clause) = named_children(node).into_iter().find(|c| c.kind() == "import_clause") else {
            return;
        };

        let mut decl = ImportDecl {
            node,
            source_text: text(source, self.source).to_string(),
            default: None,
            namespace: None,
            named: Vec::new(),
        };
        for part in named_children(clause) {
            match part.kind() {
                "identifier" => decl.default = Some(text(part, self.source).to_string()),
                "namespace_import" => {
                    decl.namespace = named_children(part)
                        .into_iter()
                        .find(|c| c.kind() == "identifier")
                        .map(|c| text(c, self.source).to_string());
                }
                "named_imports" => {
                    for specifier in named_children(part).into_iter().filter(|s| s.kind() == "import_specifier") {
                        let local = specifier
                            .child_by_field_name("alias")
                            .or_else(|| specifier.child_by_field_name("name"))
                            .map(|n| text(n, self.source).to_string())
                            .unwrap_or_default();
                        let type_only = token_child(specifier, "type").is_some();
                        let mut spec_text = text(specifier, self.source).to_string();
                        if type_only {
                            spec_text = spec_text.trim_start_matches("type").trim_start().to_string();
                        }
                        decl.named.push((spec_text, local, type_only));
                    }
                }
                _ => {}
            }
        }
        self.imports.push(decl);
    }

    fn elide_unused_imports(&mut self) {
        for decl in std::mem::take(&mut self.imports) {
            let total = decl.default.iter().count() + decl.namespace.iter().count() + decl.named.len();
            if total == 0 {
                continue;
            }
            let default = decl.default.filter(|name| self.used.contains(name));
            let namespace = decl.namespace.filter(|name| self.used.contains(name));
            let named: Vec<String> = decl
                .named
                .iter()
                .filter(|(_, local, type_only)| !type_only && self.used.contains(local))
                .map(|(specifier, _, _)| specifier.clone())
                .collect();

            let kept = default.iter().count() + namespace.iter().count() + named.len();
            if kept == total {
                continue;
            }
            if kept == 0 {
                self.edits.remove(decl.node.byte_range());
                continue;
            }

            let mut parts = Vec::new();
            if let Some(default) = default {
                parts.push(default);
            }
            if let Some(namespace) = namespace {
                parts.push(format!("* as {}", namespace));
            } else if !named.is_empty() {
                parts.push(format!("{{ {} }}", named.join(", ")));
            }
            self.edits.replace(
                decl.node.byte_range(),
                format!("import {} from {};", parts.join(", "), decl.source_text),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn strip(source: &str) -> String {
        strip_types(source, Dialect::TypeScript, "/src/test.ts").unwrap()
    }

    #[test]
    fn test_strips_annotations() {
        let out = strip("function add(a: number, b?: number): number { return a + (b ?? 0 as number); }");
        assert_eq!(out, "function add(a, b) { return a + (b ?? 0); }");
    }

    #[test]
    fn test_removes_type_declarations_and_type_imports() {
        let out = strip(
            r#"import type { Config } from "./config";
import { helper, type Options } from "./helpers";
import { unused } from "./unused";
export interface Shape { area(): number }
export type Id = string;
export const run = (o: Options): string => helper(o);
"#,
        );
        assert!(out.contains(r#"import { helper } from "./helpers";"#), "{}", out);
        assert!(out.contains("export const run = (o) => helper(o);"), "{}", out);
        assert!(!out.contains("Config"));
        assert!(!out.contains("Options"));
        assert!(!out.contains("unused"));
        assert!(!out.contains("interface"));
        assert!(!out.contains("Id"));
    }

    #[test]
    fn test_generics_and_non_null() {
        let out = strip(r#"const m = new Map<string, number>(); const v = m.get("a")!;"#);
        assert_eq!(out, r#"const m = new Map(); const v = m.get("a");"#);
    }

    #[test]
    fn test_class_member_modifiers() {
        let out = strip("class A implements B { private readonly x?: number = 1; declare y: string; }");
        assert!(out.contains("x = 1"), "{}", out);
        assert!(!out.contains("private"));
        assert!(!out.contains("readonly"));
        assert!(!out.contains("declare"));
        assert!(!out.contains("implements"));
    }

    #[test]
    fn test_runtime_only_constructs_are_rejected() {
        let err = strip_types("const a = 1;\nenum Color { Red }", Dialect::TypeScript, "/src/c.ts").unwrap_err();
        assert_matches!(err, TransformError::Unsupported { ref construct, .. } if construct == "`enum`");
        assert_eq!(err.location().unwrap().line, 2);

        let err = strip_types(
            "class P { constructor(private x: number) {} }",
            Dialect::TypeScript,
            "/src/p.ts",
        )
        .unwrap_err();
        assert_matches!(err, TransformError::Unsupported { ref construct, .. } if construct == "parameter property");

        let err = strip_types("const el = <div />;", Dialect::Tsx, "/src/v.tsx").unwrap_err();
        assert_matches!(err, TransformError::Unsupported { ref construct, .. } if construct == "JSX");
    }

    #[test]
    fn test_javascript_keeps_unused_imports() {
        let out = strip_types(r#"import "./polyfill"; import { a } from "./a";"#, Dialect::JavaScript, "/a.js").unwrap();
        assert_eq!(out, r#"import "./polyfill"; import { a } from "./a";"#);
    }
}
