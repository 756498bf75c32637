//! Validation of root-relative dataset paths.
//!
//! Dataset paths travel over the wire as POSIX-style relative paths. They
//! must never address anything outside the root: no absolute paths, no `..`
//! components, no empty components.

use std::path::{Component, Path, PathBuf};

use crate::error::{DepotError, Result};

/// Validate a wire path and return its normalized POSIX form.
pub fn normalize(relpath: &str) -> Result<String> {
    if relpath.is_empty() {
        return Err(DepotError::PathInvalid("empty path".into()));
    }
    if relpath.starts_with('/') || relpath.starts_with('\\') {
        return Err(DepotError::PathInvalid(format!(
            "path is not relative: {relpath:?}"
        )));
    }

    let mut parts = Vec::new();
    for component in Path::new(relpath).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(DepotError::PathInvalid(format!(
                        "non-unicode component in path: {relpath:?}"
                    )));
                }
            },
            Component::CurDir => continue,
            Component::ParentDir => {
                return Err(DepotError::PathInvalid(format!(
                    "\"..\" not allowed in path: {relpath:?}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DepotError::PathInvalid(format!(
                    "path is not relative: {relpath:?}"
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(DepotError::PathInvalid(format!("empty path: {relpath:?}")));
    }
    Ok(parts.join("/"))
}

/// Resolve a wire path against a root directory, guaranteeing the result
/// stays inside it.
pub fn resolve_under(root: &Path, relpath: &str) -> Result<PathBuf> {
    let normalized = normalize(relpath)?;
    Ok(root.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(normalize("ds-1d.b2nd").unwrap(), "ds-1d.b2nd");
        assert_eq!(normalize("dir1/ds-2d.b2nd").unwrap(), "dir1/ds-2d.b2nd");
        assert_eq!(normalize("./dir1/./x").unwrap(), "dir1/x");
    }

    #[test]
    fn rejects_escapes() {
        assert!(normalize("../etc/passwd").is_err());
        assert!(normalize("dir1/../../x").is_err());
        assert!(normalize("/etc/passwd").is_err());
        assert!(normalize("").is_err());
        assert!(normalize(".").is_err());
    }

    #[test]
    fn resolution_stays_inside_root() {
        let root = Path::new("/srv/data");
        let abs = resolve_under(root, "dir1/ds.b2nd").unwrap();
        assert_eq!(abs, Path::new("/srv/data/dir1/ds.b2nd"));
        assert!(resolve_under(root, "dir1/../../ds.b2nd").is_err());
    }
}
