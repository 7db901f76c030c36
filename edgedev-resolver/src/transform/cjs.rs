//! CommonJS wrappers
//!
//! Both forms evaluate the original code inside a function that receives
//! `module`, `exports` and `require`, so the code sees the usual CommonJS
//! scope. A `require` binding must already be in scope where the wrapper is
//! placed.

use super::is_bindable;

fn wrap_body(code: &str) -> String {
    format!(
        "const module = {{ exports: {{}} }};\n\
         const exports = module.exports;\n\
         (function (module, exports, require) {{\n\
         {}\n\
         }}).call(module.exports, module, exports, require);\n",
        code
    )
}

/// Names that can be re-exported as ESM bindings
fn bindable_exports(names: &[String]) -> Vec<&str> {
    names
        .iter()
        .map(String::as_str)
        .filter(|name| !matches!(*name, "module" | "exports" | "require" | "__esModule" | "default"))
        .filter(|name| is_bindable(name))
        .collect()
}

/// Wrap CommonJS `code` as an ES module. `module.exports` becomes the default
/// export and every statically known name in `named_exports` a named one.
pub fn wrap_commonjs(code: &str, named_exports: &[String]) -> String {
    let mut out = wrap_body(code);
    out.push_str("export default module.exports;\n");
    let names = bindable_exports(named_exports);
    if !names.is_empty() {
        out.push_str(&format!("export const {{ {} }} = module.exports;\n", names.join(", ")));
    }
    out
}

/// Wrap CommonJS `code` for the module runner: the exports object is copied
/// onto `__vite_ssr_exports__` once the code has run.
pub fn wrap_commonjs_runner(code: &str) -> String {
    let mut out = wrap_body(code);
    out.push_str("__vite_ssr_exports__.default = module.exports;\n");
    out.push_str("__vite_ssr_exportAll__(module.exports);\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esm_wrapper_exports_default_and_names() {
        let names = vec![
            "debounce".to_string(),
            "__esModule".to_string(),
            "default".to_string(),
            "not-an-identifier".to_string(),
            "flush".to_string(),
        ];
        let out = wrap_commonjs("module.exports.debounce = function () {};", &names);
        assert!(out.starts_with("const module = { exports: {} };\nconst exports = module.exports;\n"));
        assert!(out.contains("(function (module, exports, require) {\nmodule.exports.debounce = function () {};\n})"));
        assert!(out.contains("export default module.exports;\n"));
        assert!(out.ends_with("export const { debounce, flush } = module.exports;\n"));
    }

    #[test]
    fn test_esm_wrapper_without_names() {
        let out = wrap_commonjs("exports[key] = 1;", &[]);
        assert!(out.ends_with("export default module.exports;\n"));
        assert!(!out.contains("export const"));
    }

    #[test]
    fn test_runner_wrapper() {
        let out = wrap_commonjs_runner("exports.a = 1; // trailing comment");
        assert!(out.contains("exports.a = 1; // trailing comment\n})"));
        assert!(out.contains("__vite_ssr_exports__.default = module.exports;"));
        assert!(out.ends_with("__vite_ssr_exportAll__(module.exports);\n"));
        assert!(!out.contains("export default"));
    }
}
