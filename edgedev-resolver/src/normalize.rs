//! Specifier normalization
//!
//! The sandbox hands the fallback resolver specifiers in several shapes:
//! percent-encoded, `/`-prefixed, or as `file:` URLs. Query values are
//! percent-decoded once with [`decode_specifier`]; [`normalize_specifier`]
//! then reduces the decoded text to a path without a leading separator.
//! Its output is a fixed point: normalizing it again returns it unchanged.

use crate::error::ResolveError;
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};

/// Reduce a decoded specifier to its canonical module path.
///
/// Steps, in order: strip one leading `/`, strip a `file:` scheme and the
/// empty `//` authority that follows it, then strip the separators left in
/// front of an absolute path (the stray `/` before a Windows drive letter
/// among them). No decoding happens here, so `%40` stays `%40`.
pub fn normalize_specifier(raw: Option<&str>) -> Result<String, ResolveError> {
    let raw = raw.filter(|s| !s.is_empty()).ok_or(ResolveError::MissingSpecifier)?;

    let mut path = raw.strip_prefix('/').unwrap_or(raw);
    while let Some(rest) = path.strip_prefix("file:") {
        path = rest.strip_prefix("//").unwrap_or(rest).trim_start_matches('/');
    }
    let path = path.trim_start_matches('/');

    if path.is_empty() {
        return Err(ResolveError::MissingSpecifier);
    }
    Ok(path.to_string())
}

/// Percent-decode one query value. Applied once, before normalization.
pub fn decode_specifier(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Rewrite a normalized absolute path that lies under `root` as a path
/// relative to it. Other paths are returned as they are.
pub fn relative_to_root(root: &Path, normalized: &str) -> String {
    if !root.is_absolute() || root.parent().is_none() {
        return normalized.to_string();
    }
    let absolute = Path::new("/").join(normalized);
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    match absolute.strip_prefix(&root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        _ => normalized.to_string(),
    }
}

/// Join a normalized module path onto `root`
pub fn root_path(root: &Path, normalized: &str) -> PathBuf {
    let relative = normalized.trim_start_matches('/');
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::ParentDir => {
                if path != root {
                    path.pop();
                }
            }
            _ => {}
        }
    }
    path
}

/// `/` + the path of `file` relative to `root`, with forward slashes
pub fn location_for(root: &Path, file: &Path) -> String {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let file = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
    let relative = file.strip_prefix(&root).unwrap_or(&file);
    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}
