//! Slash-delimited data paths.
//!
//! A canonical path always starts with `/` and never ends with one, except
//! the root `/` itself. Empty segments are dropped, so `//a///b/` and `/a/b`
//! name the same location.

pub const ROOT: &str = "/";

/// Canonicalize a path: leading slash, no trailing slash, no empty segments.
pub fn canonicalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Join a relative path onto a base path. Both sides are canonicalized,
/// so a leading slash on `relative` does not reset to the root.
pub fn join(base: &str, relative: &str) -> String {
    canonicalize(&format!("{base}/{relative}"))
}

/// Number of `/` separators. The root has depth 0.
pub fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}

pub fn has_parent(path: &str) -> bool {
    path != ROOT
}

/// The immediate parent of a canonical path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if !has_parent(path) {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// True when `ancestor` is a strict prefix ancestor of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == ROOT {
        return path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Strict ancestors of a canonical path, nearest first, ending with the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_of(path), |p| parent_of(*p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_trims_slashes() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("///"), "/");
        assert_eq!(canonicalize("a/b"), "/a/b");
        assert_eq!(canonicalize("/a/b/"), "/a/b");
        assert_eq!(canonicalize("//a//b//"), "/a/b");
    }

    #[test]
    fn join_handles_slashes_on_both_sides() {
        assert_eq!(join("/", "/x/y"), "/x/y");
        assert_eq!(join("/a/b/", "/x/y"), "/a/b/x/y");
        assert_eq!(join("/a/b", "x/y"), "/a/b/x/y");
        assert_eq!(join("/a", ""), "/a");
    }

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b/c"), 3);
    }

    #[test]
    fn parent_of_walks_one_level() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn ancestor_requires_segment_boundary() {
        assert!(is_ancestor("/", "/a"));
        assert!(is_ancestor("/a", "/a/b"));
        assert!(is_ancestor("/a", "/a/b/c"));
        assert!(!is_ancestor("/a", "/ab"));
        assert!(!is_ancestor("/a", "/a"));
        assert!(!is_ancestor("/", "/"));
        assert!(!is_ancestor("/a/b", "/a"));
    }

    #[test]
    fn ancestors_nearest_first() {
        let chain: Vec<&str> = ancestors("/a/b/c").collect();
        assert_eq!(chain, vec!["/a/b", "/a", "/"]);
        assert_eq!(ancestors("/").count(), 0);
    }
}
