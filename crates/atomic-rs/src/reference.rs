//! Image reference decomposition and glob matching.
//!
//! A reference such as `registry.example.com/rhel7/rsyslog:latest` is split
//! into three components: everything before the first `/` is the registry,
//! everything after the rightmost `:` of the remainder is the tag, and the
//! rest is the repository. Matching compares each component of a user token
//! against the same component of every `repo:tag` an image carries, using
//! shell-style globs.

use glob::Pattern;

use crate::engine::ObjectRef;

/// Wildcard used for a registry or tag the token does not specify.
pub const WILDCARD: &str = "*";

/// A reference split into registry, repository and tag.
///
/// # Examples
///
/// ```
/// use atomic_rs::reference::CompoundName;
///
/// let name = CompoundName::parse("docker.io/library/nginx:1.19");
/// assert_eq!(name.registry, "docker.io");
/// assert_eq!(name.repo, "library/nginx");
/// assert_eq!(name.tag, "1.19");
///
/// let name = CompoundName::parse("nginx");
/// assert_eq!(name.registry, "");
/// assert_eq!(name.tag, "");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundName<'a> {
    /// Component before the first `/`, or empty.
    pub registry: &'a str,
    /// Repository.
    pub repo: &'a str,
    /// Component after the rightmost `:`, or empty.
    pub tag: &'a str,
}

impl<'a> CompoundName<'a> {
    /// Split `[registry/]repo[:tag]`.
    pub fn parse(name: &'a str) -> Self {
        let (registry, rest) = name.split_once('/').unwrap_or(("", name));
        let (repo, tag) = rest.rsplit_once(':').unwrap_or((rest, ""));
        Self {
            registry,
            repo,
            tag,
        }
    }

    /// Replace an unspecified registry or tag with [`WILDCARD`].
    fn as_pattern(&self) -> Self {
        Self {
            registry: if self.registry.is_empty() {
                WILDCARD
            } else {
                self.registry
            },
            repo: self.repo,
            tag: if self.tag.is_empty() { WILDCARD } else { self.tag },
        }
    }
}

/// A glob that falls back to literal comparison when the text is not a
/// valid pattern (e.g. an unbalanced `[`).
#[derive(Debug)]
struct Glob(Pattern);

impl Glob {
    fn new(text: &str) -> Self {
        let pattern = Pattern::new(text)
            .or_else(|_| Pattern::new(&Pattern::escape(text)))
            .unwrap_or_default();
        Self(pattern)
    }

    fn matches(&self, text: &str) -> bool {
        self.0.matches(text)
    }
}

struct TokenMatcher<'t> {
    token: &'t str,
    registry: Glob,
    repo: Glob,
    tag: Glob,
}

impl<'t> TokenMatcher<'t> {
    fn new(token: &'t str) -> Self {
        let pattern = CompoundName::parse(token).as_pattern();
        Self {
            token,
            registry: Glob::new(pattern.registry),
            repo: Glob::new(pattern.repo),
            tag: Glob::new(pattern.tag),
        }
    }

    fn matches(&self, repo_tag: &str) -> bool {
        let name = CompoundName::parse(repo_tag);
        let globbed = self.registry.matches(name.registry)
            && self.repo.matches(name.repo)
            && self.tag.matches(name.tag);
        // Short registry-qualified names like `rhel7/rsyslog` decompose with
        // `rhel7` as the registry; accept a repo that ends with the token.
        globbed || name.repo.ends_with(self.token)
    }
}

/// Images with at least one `repo:tag` matching `token`.
///
/// Each image appears at most once, in the order of `images`.
///
/// # Examples
///
/// ```
/// use atomic_rs::engine::ObjectRef;
/// use atomic_rs::reference::match_images;
///
/// let images = vec![
///     ObjectRef::image("abc123", ["nginx:latest"]),
///     ObjectRef::image("abcdef", ["nginx:1.19"]),
///     ObjectRef::image("fff000", ["docker.io/redis:7"]),
/// ];
/// assert_eq!(match_images("nginx", &images).len(), 2);
/// assert_eq!(match_images("nginx:1.*", &images)[0].id, "abcdef");
/// assert_eq!(match_images("*/redis", &images)[0].id, "fff000");
/// assert!(match_images("postgres", &images).is_empty());
/// ```
pub fn match_images<'a>(token: &str, images: &'a [ObjectRef]) -> Vec<&'a ObjectRef> {
    let matcher = TokenMatcher::new(token);
    let mut matched: Vec<&ObjectRef> = Vec::new();
    for image in images {
        if matched.iter().any(|m| m.id == image.id) {
            continue;
        }
        if image.repo_tags.iter().any(|t| matcher.matches(t)) {
            matched.push(image);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> Vec<ObjectRef> {
        vec![
            ObjectRef::image("abc123", ["nginx:latest"]),
            ObjectRef::image("abcdef", ["nginx:1.19", "web:1.19"]),
            ObjectRef::image("rsys01", ["registry.example.com/rhel7/rsyslog:7.2"]),
            ObjectRef::image("none00", ["<none>:<none>"]),
        ]
    }

    #[test]
    fn test_parse_components() {
        assert_eq!(
            CompoundName::parse("localhost:5000/app"),
            CompoundName {
                registry: "localhost:5000",
                repo: "app",
                tag: ""
            }
        );
        assert_eq!(CompoundName::parse("a/b/c:d:e").repo, "b/c:d");
        assert_eq!(CompoundName::parse("a/b/c:d:e").tag, "e");
        assert_eq!(CompoundName::parse("").repo, "");
    }

    #[test]
    fn test_exact_tag() {
        let images = images();
        let matched = match_images("nginx:latest", &images);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "abc123");
    }

    #[test]
    fn test_short_form_suffix() {
        let images = images();
        let matched = match_images("rsyslog", &images);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "rsys01");

        let matched = match_images("rhel7/rsyslog", &images);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_no_duplicates_first_seen_order() {
        let mut images = images();
        images.push(ObjectRef::image("abcdef", ["nginx:1.19"]));
        let matched = match_images("*", &images);
        let ids: Vec<_> = matched.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["abc123", "abcdef", "rsys01", "none00"]);
    }

    #[test]
    fn test_image_matching_several_tags_once() {
        let images = images();
        let matched = match_images("*:1.19", &images);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "abcdef");
    }

    #[test]
    fn test_invalid_glob_is_literal() {
        let images = vec![ObjectRef::image("x1", ["weird[:1"])];
        assert_eq!(match_images("weird[", &images).len(), 1);
        assert!(match_images("other[", &images).is_empty());
    }
}
