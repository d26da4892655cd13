//! Path algebra for archive keys.
//!
//! Archive paths are slash-separated Unicode strings with no leading or
//! trailing slash and no empty segments; the empty string is the root
//! directory. Paths are compared bytewise and never touch the OS, so they
//! stay `str` rather than `std::path::Path`.

use crate::error::{Error, Result};

/// Normalize a directory path: collapse slash runs, strip leading and
/// trailing slashes. `.` and `..` segments are rejected, the archive is
/// not a real filesystem.
pub fn normalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(Error::InvalidPath(path.to_string()));
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// Normalize a file path. Same as [`normalize`] but the result must be
/// non-empty (the root cannot be a file).
pub fn normalize_file(path: &str) -> Result<String> {
    let normalized = normalize(path)?;
    if normalized.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(normalized)
}

/// Everything before the last `/`, or `""` for top-level entries.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// The final segment of a path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// All ancestors from the root down to and including `path` itself:
/// `""`, `"a"`, `"a/b"`, ... for `"a/b/c"`.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = vec![""];
    for (i, c) in path.char_indices() {
        if c == '/' {
            out.push(&path[..i]);
        }
    }
    if !path.is_empty() {
        out.push(path);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_strips() {
        assert_eq!(normalize("/a//b/c/").unwrap(), "a/b/c");
        assert_eq!(normalize("a/b").unwrap(), "a/b");
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("///").unwrap(), "");
    }

    #[test]
    fn test_normalize_rejects_dot_segments() {
        assert!(normalize("a/./b").is_err());
        assert!(normalize("../a").is_err());
        assert!(normalize(".").is_err());
    }

    #[test]
    fn test_normalize_file_rejects_root() {
        assert!(normalize_file("").is_err());
        assert!(normalize_file("//").is_err());
        assert_eq!(normalize_file("/a").unwrap(), "a");
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(parent(""), "");
        assert_eq!(basename("a/b/c"), "c");
        assert_eq!(basename("a"), "a");
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("a/b/c"), vec!["", "a", "a/b", "a/b/c"]);
        assert_eq!(ancestors(""), vec![""]);
        assert_eq!(ancestors("top"), vec!["", "top"]);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
    }
}
