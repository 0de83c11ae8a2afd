//! Minimal locator helpers.
//!
//! Track sources are plain strings: either a filesystem path or a
//! `scheme://` locator. These helpers cover the little parsing the engine
//! needs: locality tests and the parent walks used for staged-ancestor
//! lookups. Locators are expected to be normalized (no trailing slash).

use std::path::PathBuf;

/// Returns the scheme of `uri`, if it has one.
pub fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once("://")?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(scheme)
}

/// A locator is local when it is a bare path or a `file://` URI.
pub fn is_local(uri: &str) -> bool {
    match scheme(uri) {
        None => true,
        Some(s) => s == "file",
    }
}

/// The local filesystem path behind `uri`, when there is one.
pub fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        Some(PathBuf::from(rest))
    } else if scheme(uri).is_none() {
        Some(PathBuf::from(uri))
    } else {
        None
    }
}

/// Parent locator of `uri`, or `None` once the walk reaches the root.
///
/// The bare filesystem root ("/") and bare authorities ("sftp://host") are
/// treated as roots: nothing is ever staged under those names directly, so
/// ancestor walks stop there.
pub fn parent(uri: &str) -> Option<String> {
    let start = uri.find("://").map(|i| i + 3).unwrap_or(0);
    let path = &uri[start..];
    let cut = path.rfind('/')?;
    if cut == 0 {
        return None;
    }
    Some(uri[..start + cut].to_string())
}

/// Final path component of `uri`.
pub fn basename(uri: &str) -> &str {
    let start = uri.find("://").map(|i| i + 3).unwrap_or(0);
    let path = &uri[start..];
    match path.rfind('/') {
        Some(cut) => &path[cut + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert_eq!(scheme("sftp://host/a"), Some("sftp"));
        assert_eq!(scheme("file:///tmp/x"), Some("file"));
        assert_eq!(scheme("/plain/path"), None);
        assert_eq!(scheme("relative/path"), None);
    }

    #[test]
    fn locality() {
        assert!(is_local("/tmp/image.iso"));
        assert!(is_local("file:///tmp/image.iso"));
        assert!(!is_local("sftp://host/image.iso"));
        assert_eq!(
            local_path("file:///tmp/image.iso"),
            Some(PathBuf::from("/tmp/image.iso"))
        );
        assert_eq!(local_path("sftp://host/image.iso"), None);
    }

    #[test]
    fn parent_walk_stops_at_roots() {
        assert_eq!(parent("sftp://host/a/b").as_deref(), Some("sftp://host/a"));
        assert_eq!(parent("sftp://host/a").as_deref(), Some("sftp://host"));
        assert_eq!(parent("sftp://host"), None);
        assert_eq!(parent("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent("/a"), None);
    }

    #[test]
    fn basenames() {
        assert_eq!(basename("sftp://host/a/b.iso"), "b.iso");
        assert_eq!(basename("/a/b.iso"), "b.iso");
        assert_eq!(basename("sftp://host"), "host");
    }
}
