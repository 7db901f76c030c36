//! Import/export discovery for a single module

use super::{named_children, parse, pattern_names, string_value, text, token_child, walk, Dialect, Walk};
use crate::error::TransformError;
use std::ops::Range;
use tree_sitter::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    Esm,
    CommonJs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBinding {
    Default(String),
    Namespace(String),
    Named { imported: String, local: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReExport {
    /// `export * from`
    All,
    /// `export * as name from`
    Namespace(String),
    /// `export { imported as exported } from`
    Named(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    Static(Vec<ImportBinding>),
    ReExport(ReExport),
    Dynamic,
    Require,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub specifier: String,
    pub kind: ImportKind,
    /// The whole statement, or the call expression for `import()` and
    /// `require()`
    pub range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleAnalysis {
    pub format: ModuleFormat,
    pub imports: Vec<ImportRef>,
    /// Names exported with ESM syntax, `default` included. Names that only
    /// arrive through `export *` are not listed.
    pub exports: Vec<String>,
    /// Names assigned onto `exports` / `module.exports`
    pub commonjs_exports: Vec<String>,
}

impl ModuleAnalysis {
    pub fn specifiers(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().map(|import| import.specifier.as_str())
    }

    pub fn requires(&self) -> impl Iterator<Item = &str> {
        self.imports
            .iter()
            .filter(|import| import.kind == ImportKind::Require)
            .map(|import| import.specifier.as_str())
    }
}

pub fn analyze(source: &str, dialect: Dialect, file: &str) -> Result<ModuleAnalysis, TransformError> {
    let tree = parse(source, dialect, file)?;
    let mut analyzer = Analyzer {
        source,
        imports: Vec::new(),
        exports: Vec::new(),
        commonjs_exports: Vec::new(),
        has_esm_syntax: false,
        uses_commonjs: false,
    };
    walk(tree.root_node(), |node| analyzer.visit(node));

    let format = if !analyzer.has_esm_syntax && analyzer.uses_commonjs {
        ModuleFormat::CommonJs
    } else {
        ModuleFormat::Esm
    };
    Ok(ModuleAnalysis {
        format,
        imports: analyzer.imports,
        exports: analyzer.exports,
        commonjs_exports: analyzer.commonjs_exports,
    })
}

struct Analyzer<'s> {
    source: &'s str,
    imports: Vec<ImportRef>,
    exports: Vec<String>,
    commonjs_exports: Vec<String>,
    has_esm_syntax: bool,
    uses_commonjs: bool,
}

impl<'s> Analyzer<'s> {
    fn visit<'t>(&mut self, node: Node<'t>) -> Walk<'t> {
        match node.kind() {
            "import_statement" => {
                self.has_esm_syntax = true;
                self.visit_import(node);
                Walk::Skip
            }
            "export_statement" => {
                self.has_esm_syntax = true;
                if node.child_by_field_name("source").is_some() {
                    self.visit_re_export(node);
                    return Walk::Skip;
                }
                self.visit_export(node);
                Walk::Children
            }
            "call_expression" => {
                self.visit_call(node);
                Walk::Children
            }
            "assignment_expression" => {
                self.visit_assignment(node);
                Walk::Children
            }
            "member_expression" => {
                if let Some(("module", "exports")) = self.member(node) {
                    self.uses_commonjs = true;
                }
                Walk::Children
            }
            _ => Walk::Children,
        }
    }

    fn visit_import(&mut self, node: Node<'_>) {
        let Some(specifier) = node.child_by_field_name("source").and_then(|s| string_value(s, self.source)) else {
            return;
        };
        let mut bindings = Vec::new();
        if let Some(clause) = named_children(node).into_iter().find(|c| c.kind() == "import_clause") {
            for part in named_children(clause) {
                match part.kind() {
                    "identifier" => bindings.push(ImportBinding::Default(text(part, self.source).to_string())),
                    "namespace_import" => {
                        if let Some(name) = named_children(part).into_iter().find(|c| c.kind() == "identifier") {
                            bindings.push(ImportBinding::Namespace(text(name, self.source).to_string()));
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
                            bindings.push(ImportBinding::Named { imported, local });
                        }
                    }
                    _ => {}
                }
            }
        }
        self.imports.push(ImportRef {
            specifier,
            kind: ImportKind::Static(bindings),
            range: node.byte_range(),
        });
    }

    fn visit_re_export(&mut self, node: Node<'_>) {
        let Some(specifier) = node.child_by_field_name("source").and_then(|s| string_value(s, self.source)) else {
            return;
        };
        let kind = if let Some(namespace) = named_children(node).into_iter().find(|c| c.kind() == "namespace_export") {
            let name = named_children(namespace)
                .first()
                .map(|n| self.name_of(*n))
                .unwrap_or_default();
            self.push_export(name.clone());
            ReExport::Namespace(name)
        } else if let Some(clause) = named_children(node).into_iter().find(|c| c.kind() == "export_clause") {
            let pairs = self.export_clause(clause);
            for (_, exported) in &pairs {
                self.push_export(exported.clone());
            }
            ReExport::Named(pairs)
        } else {
            ReExport::All
        };
        self.imports.push(ImportRef {
            specifier,
            kind: ImportKind::ReExport(kind),
            range: node.byte_range(),
        });
    }

    fn visit_export(&mut self, node: Node<'_>) {
        if token_child(node, "default").is_some() {
            self.push_export("default".to_string());
            return;
        }
        if let Some(declaration) = node.child_by_field_name("declaration") {
            let mut names = Vec::new();
            match declaration.kind() {
                "lexical_declaration" | "variable_declaration" => {
                    for declarator in named_children(declaration) {
                        pattern_names(declarator, self.source, &mut names);
                    }
                }
                _ => {
                    if let Some(name) = declaration.child_by_field_name("name") {
                        names.push(text(name, self.source).to_string());
                    }
                }
            }
            for name in names {
                self.push_export(name);
            }
            return;
        }
        if let Some(clause) = named_children(node).into_iter().find(|c| c.kind() == "export_clause") {
            for (_, exported) in self.export_clause(clause) {
                self.push_export(exported);
            }
        }
    }

    /// `(local or imported, exported)` pairs of an export clause
    fn export_clause(&self, clause: Node<'_>) -> Vec<(String, String)> {
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

    fn visit_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let source = self.source;
        let first_string = || {
            node.child_by_field_name("arguments")
                .and_then(|args| named_children(args).into_iter().next())
                .and_then(|arg| string_value(arg, source))
        };
        match function.kind() {
            "import" => {
                if let Some(specifier) = first_string() {
                    self.imports.push(ImportRef {
                        specifier,
                        kind: ImportKind::Dynamic,
                        range: node.byte_range(),
                    });
                }
            }
            "identifier" if text(function, self.source) == "require" => {
                self.uses_commonjs = true;
                if let Some(specifier) = first_string() {
                    self.imports.push(ImportRef {
                        specifier,
                        kind: ImportKind::Require,
                        range: node.byte_range(),
                    });
                }
            }
            "member_expression" if self.member(function) == Some(("Object", "defineProperty")) => {
                let args = node
                    .child_by_field_name("arguments")
                    .map(named_children)
                    .unwrap_or_default();
                if let [target, name, ..] = args.as_slice() {
                    if self.is_exports_object(*target) {
                        if let Some(name) = string_value(*name, self.source) {
                            self.uses_commonjs = true;
                            self.push_commonjs_export(name);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn visit_assignment(&mut self, node: Node<'_>) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if left.kind() != "member_expression" {
            return;
        }
        if let Some(("module", "exports")) = self.member(left) {
            self.uses_commonjs = true;
            if let Some(object) = node.child_by_field_name("right").filter(|r| r.kind() == "object") {
                for property in named_children(object) {
                    let key = match property.kind() {
                        "pair" | "method_definition" => property
                            .child_by_field_name(if property.kind() == "pair" { "key" } else { "name" })
                            .map(|k| self.name_of(k)),
                        "shorthand_property_identifier" => Some(text(property, self.source).to_string()),
                        _ => None,
                    };
                    if let Some(key) = key {
                        self.push_commonjs_export(key);
                    }
                }
            }
            return;
        }
        let Some(object) = left.child_by_field_name("object") else {
            return;
        };
        if self.is_exports_object(object) {
            self.uses_commonjs = true;
            if let Some(property) = left.child_by_field_name("property") {
                self.push_commonjs_export(text(property, self.source).to_string());
            }
        }
    }

    /// `exports` or `module.exports`
    fn is_exports_object(&self, node: Node<'_>) -> bool {
        match node.kind() {
            "identifier" => text(node, self.source) == "exports",
            "member_expression" => self.member(node) == Some(("module", "exports")),
            _ => false,
        }
    }

    /// `(object, property)` of a plain `a.b` member expression
    fn member(&self, node: Node<'_>) -> Option<(&'s str, &'s str)> {
        let object = node.child_by_field_name("object")?;
        let property = node.child_by_field_name("property")?;
        if object.kind() != "identifier" || property.kind() != "property_identifier" {
            return None;
        }
        Some((text(object, self.source), text(property, self.source)))
    }

    /// Identifier text, or the value of a string-literal module export name
    fn name_of(&self, node: Node<'_>) -> String {
        string_value(node, self.source).unwrap_or_else(|| text(node, self.source).to_string())
    }

    fn push_export(&mut self, name: String) {
        if !self.exports.contains(&name) {
            self.exports.push(name);
        }
    }

    fn push_commonjs_export(&mut self, name: String) {
        if !self.commonjs_exports.contains(&name) {
            self.commonjs_exports.push(name);
        }
    }
}
