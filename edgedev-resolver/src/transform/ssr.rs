//! ES module to module-runner form
//!
//! Imports become awaited `__vite_ssr_import__` calls hoisted to the top of
//! the module, exports become getters on `__vite_ssr_exports__`, and every
//! reference to an imported binding is rewritten to a live member access.
//! Hoisted code shares the first line so line numbers are preserved.

use super::{
    member_access, named_children, parse, pattern_names, string_value, text, token_child, walk, Dialect, Edits, Walk,
};
use crate::error::TransformError;
use std::collections::HashMap;
use tree_sitter::Node;

const EXPORTS: &str = "__vite_ssr_exports__";

pub fn ssr_transform(code: &str, file: &str) -> Result<String, TransformError> {
    let tree = parse(code, Dialect::JavaScript, file)?;
    let root = tree.root_node();
    let mut transform = SsrTransform {
        source: code,
        edits: Edits::new(),
        hoisted_imports: Vec::new(),
        hoisted_defines: Vec::new(),
        import_vars: HashMap::new(),
        bindings: HashMap::new(),
    };

    for statement in named_children(root) {
        match statement.kind() {
            "import_statement" => transform.rewrite_import(statement),
            "export_statement" => transform.rewrite_export(statement),
            _ => {}
        }
    }
    walk(root, |node| transform.visit(node));

    let mut out = String::with_capacity(code.len() + 256);
    for line in transform.hoisted_imports.iter().chain(&transform.hoisted_defines) {
        out.push_str(line);
    }
    out.push_str(&transform.edits.apply(code));
    Ok(out)
}

fn define(name: &str, expr: &str) -> String {
    format!(
        "Object.defineProperty({}, {}, {{ enumerable: true, configurable: true, get(){{ return {} }}}});",
        EXPORTS,
        super::js_string(name),
        expr
    )
}

struct SsrTransform<'s> {
    source: &'s str,
    edits: Edits,
    hoisted_imports: Vec<String>,
    hoisted_defines: Vec<String>,
    /// specifier -> `__vite_ssr_import_N__`
    import_vars: HashMap<String, String>,
    /// local binding -> expression reading it
    bindings: HashMap<String, String>,
}

impl<'s> SsrTransform<'s> {
    fn import_var(&mut self, specifier: &str) -> String {
        if let Some(var) = self.import_vars.get(specifier) {
            return var.clone();
        }
        let var = format!("__vite_ssr_import_{}__", self.import_vars.len());
        self.hoisted_imports.push(format!(
            "const {} = await __vite_ssr_import__({});",
            var,
            super::js_string(specifier)
        ));
        self.import_vars.insert(specifier.to_string(), var.clone());
        var
    }

    fn string_field(&self, node: Node<'_>, field: &str) -> Option<String> {
        node.child_by_field_name(field).and_then(|n| string_value(n, self.source))
    }

    fn name_of(&self, node: Node<'_>) -> String {
        string_value(node, self.source).unwrap_or_else(|| text(node, self.source).to_string())
    }

    fn rewrite_import(&mut self, statement: Node<'_>) {
        let Some(specifier) = self.string_field(statement, "source") else {
            return;
        };
        self.edits.remove(statement.byte_range());
        if token_child(statement, "type").is_some() {
            return;
        }
        let var = self.import_var(&specifier);
        let Some(clause) = named_children(statement).into_iter().find(|c| c.kind() == "import_clause") else {
            return;
        };
        for part in named_children(clause) {
            match part.kind() {
                "identifier" => {
                    self.bindings
                        .insert(text(part, self.source).to_string(), format!("{}.default", var));
                }
                "namespace_import" => {
                    if let Some(name) = named_children(part).into_iter().find(|c| c.kind() == "identifier") {
                        self.bindings.insert(text(name, self.source).to_string(), var.clone());
                    }
                }
                "named_imports" => {
                    for specifier in named_children(part).into_iter().filter(|s| s.kind() == "import_specifier") {
                        let Some(imported) = specifier.child_by_field_name("name").map(|n| self.name_of(n)) else {
                            continue;
                        };
                        let local = specifier
                            .child_by_field_name("alias")
                            .map(|n| text(n, self.source).to_string())
                            .unwrap_or_else(|| imported.clone());
                        self.bindings.insert(local, member_access(&var, &imported));
                    }
                }
                _ => {}
            }
        }
    }

    fn rewrite_export(&mut self, statement: Node<'_>) {
        let start = statement.start_byte();

        if let Some(specifier) = self.string_field(statement, "source") {
            let var = self.import_var(&specifier);
            let replacement = if let Some(namespace) =
                named_children(statement).into_iter().find(|c| c.kind() == "namespace_export")
            {
                let name = named_children(namespace)
                    .first()
                    .map(|n| self.name_of(*n))
                    .unwrap_or_default();
                define(&name, &var)
            } else if let Some(clause) = named_children(statement).into_iter().find(|c| c.kind() == "export_clause") {
                self.export_pairs(clause)
                    .into_iter()
                    .map(|(name, exported)| define(&exported, &member_access(&var, &name)))
                    .collect()
            } else {
                format!("__vite_ssr_exportAll__({});", var)
            };
            self.edits.replace(statement.byte_range(), replacement);
            return;
        }

        if token_child(statement, "default").is_some() {
            let assign = format!("{}.default = ", EXPORTS);
            if let Some(declaration) = statement.child_by_field_name("declaration") {
                match declaration.child_by_field_name("name") {
                    Some(name) => {
                        let name = text(name, self.source);
                        self.edits.remove(start..declaration.start_byte());
                        self.define_declaration(statement, declaration.kind(), "default", name);
                    }
                    None => self.edits.replace(start..declaration.start_byte(), assign),
                }
            } else if let Some(value) = statement.child_by_field_name("value") {
                self.edits.replace(start..value.start_byte(), assign);
            }
            return;
        }

        if let Some(declaration) = statement.child_by_field_name("declaration") {
            self.edits.remove(start..declaration.start_byte());
            match declaration.kind() {
                "lexical_declaration" | "variable_declaration" => {
                    let mut names = Vec::new();
                    for declarator in named_children(declaration) {
                        pattern_names(declarator, self.source, &mut names);
                    }
                    let defines: String = names.iter().map(|name| define(name, name)).collect();
                    self.edits.insert(statement.end_byte(), format!(";{}", defines));
                }
                kind => {
                    if let Some(name) = declaration.child_by_field_name("name") {
                        let name = text(name, self.source);
                        self.define_declaration(statement, kind, name, name);
                    }
                }
            }
            return;
        }

        if let Some(clause) = named_children(statement).into_iter().find(|c| c.kind() == "export_clause") {
            let defines: String = self
                .export_pairs(clause)
                .into_iter()
                .map(|(local, exported)| {
                    let expr = self.bindings.get(&local).cloned().unwrap_or(local);
                    define(&exported, &expr)
                })
                .collect();
            self.edits.replace(statement.byte_range(), defines);
        }
    }

    /// Function declarations are hoisted, so their getter can be too
    fn define_declaration(&mut self, statement: Node<'_>, kind: &str, exported: &str, local: &str) {
        if matches!(kind, "function_declaration" | "generator_function_declaration") {
            self.hoisted_defines.push(define(exported, local));
        } else {
            self.edits
                .insert(statement.end_byte(), format!(";{}", define(exported, local)));
        }
    }

    fn export_pairs(&self, clause: Node<'_>) -> Vec<(String, String)> {
        named_children(clause)
            .into_iter()
            .filter(|s| s.kind() == "export_specifier")
            .filter_map(|specifier| {
                let name = self.name_of(specifier.child_by_field_name("name")?);
                let exported = specifier
                    .child_by_field_name("alias")
                    .map(|n| self.name_of(n))
                    .unwrap_or_else(|| name.clone());
                Some((name, exported))
            })
            .collect()
    }

    fn visit<'t>(&mut self, node: Node<'t>) -> Walk<'t> {
        match node.kind() {
            "import_statement" => Walk::Skip,
            "export_statement" => {
                let replaced = node.child_by_field_name("source").is_some()
                    || named_children(node).iter().any(|c| c.kind() == "export_clause");
                if replaced {
                    Walk::Skip
                } else {
                    Walk::Children
                }
            }
            "call_expression" => {
                if let Some(function) = node.child_by_field_name("function").filter(|f| f.kind() == "import") {
                    self.edits
                        .replace(function.byte_range(), "__vite_ssr_dynamic_import__");
                }
                Walk::Children
            }
            "meta_property" => {
                if text(node, self.source).starts_with("import") {
                    self.edits.replace(node.byte_range(), "__vite_ssr_import_meta__");
                }
                Walk::Skip
            }
            "member_expression" => {
                let is_import_meta = node
                    .child_by_field_name("object")
                    .is_some_and(|object| object.kind() == "import");
                if is_import_meta {
                    self.edits.replace(node.byte_range(), "__vite_ssr_import_meta__");
                    Walk::Skip
                } else {
                    Walk::Children
                }
            }
            "identifier" => {
                let name = text(node, self.source);
                if let Some(expr) = self.binding_for(node, name) {
                    let is_callee = node.parent().is_some_and(|parent| {
                        parent.kind() == "call_expression"
                            && parent.child_by_field_name("function").map(|f| f.id()) == Some(node.id())
                    });
                    let replacement = if is_callee { format!("(0, {})", expr) } else { expr };
                    self.edits.replace(node.byte_range(), replacement);
                }
                Walk::Skip
            }
            "shorthand_property_identifier" => {
                let name = text(node, self.source);
                if let Some(expr) = self.binding_for(node, name) {
                    self.edits.replace(node.byte_range(), format!("{}: {}", name, expr));
                }
                Walk::Skip
            }
            _ => Walk::Children,
        }
    }

    fn binding_for(&self, node: Node<'_>, name: &str) -> Option<String> {
        let expr = self.bindings.get(name)?;
        if is_shadowed(node, name, self.source) {
            return None;
        }
        Some(expr.clone())
    }
}

/// Whether a scope between `node` and the module top level declares `name`
fn is_shadowed(node: Node<'_>, name: &str, source: &str) -> bool {
    let mut current = node.parent();
    while let Some(scope) = current {
        if scope.kind() == "program" {
            return false;
        }
        if declares(scope, name, source) {
            return true;
        }
        current = scope.parent();
    }
    false
}

fn declares(scope: Node<'_>, name: &str, source: &str) -> bool {
    let mut names = Vec::new();
    match scope.kind() {
        "function_declaration"
        | "generator_function_declaration"
        | "function_expression"
        | "function"
        | "generator_function"
        | "arrow_function"
        | "method_definition" => {
            if let Some(params) = scope.child_by_field_name("parameters") {
                pattern_names(params, source, &mut names);
            }
            if let Some(param) = scope.child_by_field_name("parameter") {
                pattern_names(param, source, &mut names);
            }
            let named_expression = matches!(scope.kind(), "function_expression" | "function" | "generator_function");
            if named_expression {
                if let Some(own) = scope.child_by_field_name("name") {
                    names.push(text(own, source).to_string());
                }
            }
        }
        "statement_block" | "switch_body" => {
            for statement in named_children(scope) {
                declared_by(statement, source, &mut names);
            }
        }
        "for_statement" => {
            if let Some(init) = scope.child_by_field_name("initializer") {
                declared_by(init, source, &mut names);
            }
        }
        "for_in_statement" => {
            if scope.child_by_field_name("kind").is_some() {
                if let Some(left) = scope.child_by_field_name("left") {
                    pattern_names(left, source, &mut names);
                }
            }
        }
        "catch_clause" => {
            if let Some(param) = scope.child_by_field_name("parameter") {
                pattern_names(param, source, &mut names);
            }
        }
        _ => {}
    }
    names.iter().any(|n| n == name)
}

fn declared_by(statement: Node<'_>, source: &str, out: &mut Vec<String>) {
    match statement.kind() {
        "lexical_declaration" | "variable_declaration" => {
            for declarator in named_children(statement) {
                pattern_names(declarator, source, out);
            }
        }
        "function_declaration" | "generator_function_declaration" | "class_declaration" => {
            if let Some(name) = statement.child_by_field_name("name") {
                out.push(text(name, source).to_string());
            }
        }
        _ => {}
    }
}
