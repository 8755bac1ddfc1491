//! Normalized resource keys.
//!
//! Every cache lookup, registration and fetch is keyed by a [`ResourceKey`].
//! Two spellings of the same resource (`a/./b.b3dm`, `a/b.b3dm?v=2`) map to
//! one key so they share a fetch and a cache entry.

use std::fmt;
use std::sync::Arc;

/// A normalized resource path or URL.
///
/// Normalization strips any query string and fragment, keeps a
/// `scheme://authority` prefix untouched and collapses `.`, `..` and empty
/// path segments. A `..` that would climb above the root of an absolute path
/// is dropped; in a relative path it is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    /// Normalize `raw` into a key.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(normalize(raw).into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme of the key, if it has a `scheme://` prefix.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Whether the key should be fetched over HTTP.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.scheme()
            .is_some_and(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"))
    }

    /// Extension of the last path segment, without the dot.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let path = match self.0.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
            None => &self.0,
        };
        let file = path.rsplit('/').next()?;
        let (stem, ext) = file.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some(ext)
    }

    /// Whether the key's extension matches `ext`, ignoring ASCII case.
    #[must_use]
    pub fn has_extension(&self, ext: &str) -> bool {
        self.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ResourceKey {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&String> for ResourceKey {
    fn from(raw: &String) -> Self {
        Self::new(raw)
    }
}

fn normalize(raw: &str) -> String {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let raw = &raw[..end];

    // Split off `scheme://authority`; everything after is the path.
    let (prefix, path) = match raw.find("://") {
        Some(scheme_end) => {
            let authority_start = scheme_end + 3;
            let path_start = raw[authority_start..]
                .find('/')
                .map_or(raw.len(), |i| authority_start + i);
            raw.split_at(path_start)
        }
        None => ("", raw),
    };

    let absolute = path.starts_with('/') || !prefix.is_empty();
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if !absolute => segments.push(".."),
                _ => {}
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        if prefix.is_empty() || !path.is_empty() {
            format!("{prefix}/{joined}")
        } else {
            prefix.to_string()
        }
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        ResourceKey::new(raw).as_str().to_string()
    }

    #[test]
    fn test_strips_query_and_fragment() {
        assert_eq!(norm("tiles/a.b3dm?v=2"), "tiles/a.b3dm");
        assert_eq!(norm("tiles/a.b3dm#frag"), "tiles/a.b3dm");
        assert_eq!(norm("tiles/a.b3dm?x#y"), "tiles/a.b3dm");
        assert_eq!(
            ResourceKey::new("a.b3dm?session=1"),
            ResourceKey::new("a.b3dm?session=2")
        );
    }

    #[test]
    fn test_collapses_segments() {
        assert_eq!(norm("a/./b//c.b3dm"), "a/b/c.b3dm");
        assert_eq!(norm("a/b/../c.b3dm"), "a/c.b3dm");
        assert_eq!(norm("/a/../../c.b3dm"), "/c.b3dm");
        assert_eq!(norm("../a/../../c.b3dm"), "../../c.b3dm");
        assert_eq!(norm("a/.."), ".");
        assert_eq!(norm("/"), "/");
    }

    #[test]
    fn test_preserves_scheme_and_authority() {
        assert_eq!(
            norm("https://example.com/tiles/./0/../1.b3dm?token=x"),
            "https://example.com/tiles/1.b3dm"
        );
        assert_eq!(norm("https://example.com/../a.json"), "https://example.com/a.json");
        assert_eq!(norm("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_extension_and_scheme() {
        let key = ResourceKey::new("https://example.com/tiles/0.B3DM?x=1");
        assert_eq!(key.extension(), Some("B3DM"));
        assert!(key.has_extension("b3dm"));
        assert!(key.is_remote());

        let local = ResourceKey::new("data/tileset.json");
        assert_eq!(local.scheme(), None);
        assert!(!local.is_remote());
        assert!(local.has_extension("json"));

        assert_eq!(ResourceKey::new("data/.hidden").extension(), None);
        assert_eq!(ResourceKey::new("https://host.com").extension(), None);
    }
}
