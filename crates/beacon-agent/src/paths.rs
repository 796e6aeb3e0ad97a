//! Path safety for share-relative requests: traversal rejection, collision
//! free destination naming, client-relative path rendering.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Parent directory traversal is not allowed")]
    Traversal,
    #[error("Path is outside configured root directory")]
    OutsideRoot,
    #[error("Invalid filename")]
    BadFilename,
    #[error("Failed to allocate destination filename")]
    NoAvailableName,
}

/// Split a client-supplied relative path into components, rejecting any
/// `..`. Backslashes are treated as separators so Windows clients behave.
pub fn relative_parts(raw_path: &str) -> Result<Vec<String>, PathError> {
    let normalized = raw_path.replace('\\', "/");
    let mut parts = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal),
            other => parts.push(other.to_string()),
        }
    }
    Ok(parts)
}

/// Resolve a client path against a share root. Relative inputs are joined
/// component-wise (so they cannot escape); absolute inputs must already lie
/// under the root.
pub fn resolve_share_path(root: &Path, raw_path: &str) -> Result<PathBuf, PathError> {
    let input = raw_path.trim();
    if input.is_empty() {
        return Ok(root.to_path_buf());
    }

    let candidate = Path::new(input);
    if candidate.is_absolute() {
        let resolved = candidate.canonicalize().unwrap_or_else(|_| candidate.to_path_buf());
        let root_resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        if resolved != root_resolved && !resolved.starts_with(&root_resolved) {
            return Err(PathError::OutsideRoot);
        }
        return Ok(resolved);
    }

    let mut resolved = root.to_path_buf();
    for part in relative_parts(input)? {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Render a path relative to the share root in POSIX form; the root itself
/// renders as "".
pub fn to_client_path(path: &Path, root: &Path) -> Result<String, PathError> {
    let relative = path.strip_prefix(root).map_err(|_| PathError::OutsideRoot)?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return Err(PathError::OutsideRoot),
        }
    }
    Ok(parts.join("/"))
}

/// Strip any directory components and whitespace from a client filename.
pub fn safe_filename(name: &str) -> Result<String, PathError> {
    let cleaned = Path::new(name)
        .file_name()
        .map(|part| part.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(PathError::BadFilename);
    }
    Ok(cleaned)
}

/// First non-colliding variant of `path`, suffixing `" (n)"` before the
/// extension for n in 1..1000.
pub fn next_available_path(path: &Path) -> Result<PathBuf, PathError> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    for index in 1..1000 {
        let candidate = path.with_file_name(format!("{stem} ({index}){suffix}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(PathError::NoAvailableName)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_parts_reject_traversal() {
        assert!(relative_parts("a/../b").is_err());
        assert!(relative_parts("..").is_err());
        assert_eq!(relative_parts("a/./b//c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(relative_parts("a\\b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn resolve_joins_relative_paths_under_root() {
        let root = Path::new("/srv/share");
        assert_eq!(
            resolve_share_path(root, "docs/report.pdf").unwrap(),
            PathBuf::from("/srv/share/docs/report.pdf")
        );
        assert_eq!(resolve_share_path(root, "  ").unwrap(), root.to_path_buf());
        assert!(resolve_share_path(root, "../outside").is_err());
    }

    #[test]
    fn resolve_rejects_absolute_paths_outside_root() {
        let root = std::env::temp_dir().canonicalize().unwrap();
        let outside = "/definitely/not/under/tmp";
        assert!(resolve_share_path(&root, outside).is_err());
        let inside = root.join("x.txt");
        assert!(resolve_share_path(&root, inside.to_str().unwrap()).is_ok());
    }

    #[test]
    fn client_path_is_posix_relative() {
        let root = Path::new("/srv/share");
        assert_eq!(
            to_client_path(Path::new("/srv/share/a/b.txt"), root).unwrap(),
            "a/b.txt"
        );
        assert_eq!(to_client_path(root, root).unwrap(), "");
        assert!(to_client_path(Path::new("/etc/passwd"), root).is_err());
    }

    #[test]
    fn safe_filename_strips_directories() {
        assert_eq!(safe_filename("/tmp/evil/../x.bin").unwrap(), "x.bin");
        assert_eq!(safe_filename("plain.txt").unwrap(), "plain.txt");
        assert!(safe_filename("").is_err());
        assert!(safe_filename("dir/").is_err());
    }

    #[test]
    fn collision_suffix_counts_up() {
        let dir = std::env::temp_dir().join(format!("beacon_paths_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("file.txt");
        assert_eq!(next_available_path(&base).unwrap(), base);

        std::fs::write(&base, b"x").unwrap();
        assert_eq!(next_available_path(&base).unwrap(), dir.join("file (1).txt"));

        std::fs::write(dir.join("file (1).txt"), b"x").unwrap();
        assert_eq!(next_available_path(&base).unwrap(), dir.join("file (2).txt"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
