//! Posix-style module path helpers
//!
//! Module ids inside the sandbox are always forward-slash paths, whatever the
//! host platform.

/// `./x`, `../x`, `.` and `..`
pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

/// Bare package specifiers name a package rather than a path
pub fn is_bare_specifier(specifier: &str) -> bool {
    !(specifier.starts_with('.') || specifier.starts_with('/') || has_scheme(specifier))
}

fn has_scheme(specifier: &str) -> bool {
    match specifier.split_once(':') {
        // a single letter before the colon is a windows drive, not a scheme
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Everything before the last `/`; `/` for top-level files
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Collapse `.` and `..` segments and duplicate separators
pub fn normalize_posix(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().map_or(false, |s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Resolve `specifier` against the file `importer` when it is relative;
/// other specifiers are returned unchanged.
pub fn join_specifier(importer: Option<&str>, specifier: &str) -> String {
    match importer {
        Some(importer) if is_relative_specifier(specifier) => {
            normalize_posix(&format!("{}/{}", dirname(importer), specifier))
        }
        _ => specifier.to_string(),
    }
}

/// Package name of a bare specifier: `lodash/debounce` → `lodash`,
/// `@remix-run/react/dist` → `@remix-run/react`
pub fn package_name(specifier: &str) -> Option<&str> {
    if !is_bare_specifier(specifier) {
        return None;
    }
    let mut parts = specifier.splitn(3, '/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(&specifier[..first.len() + 1 + second.len()])
    } else {
        Some(first)
    }
}
