//! Resolution of user-supplied identifiers to exactly one image or container.
//!
//! A token is tried, in order, as:
//!
//! 1. a prefix of an image ID,
//! 2. an image reference glob (see [`match_images`]),
//! 3. a prefix of a container ID,
//! 4. a container name (with or without the leading `/`).
//!
//! The first step with any match decides the outcome. A single match is
//! returned; several matches fail with an ambiguity error listing every
//! candidate. Ties are never broken silently.

use serde::Serialize;

use crate::engine::{ObjectRef, normalize_id};
use crate::error::{AtomicError, Result};
use crate::reference::match_images;
use crate::snapshot::Snapshot;

/// An object selected by a user token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTarget {
    pub object: ObjectRef,
    /// The token as the user gave it.
    pub matched_token: String,
}

impl ResolvedTarget {
    /// Whether the token was an ID or ID prefix rather than a name.
    pub fn is_id_form(&self) -> bool {
        self.object.id.starts_with(normalize_id(&self.matched_token))
    }
}

/// Resolve one token against `snapshot`.
pub fn resolve(token: &str, snapshot: &Snapshot) -> Result<ResolvedTarget> {
    let object = resolve_object(token, snapshot)?;
    tracing::debug!("resolved '{}' to {} {}", token, object.kind, object.short_id());
    Ok(ResolvedTarget {
        object: object.clone(),
        matched_token: token.to_string(),
    })
}

/// Resolve a batch of tokens, dropping repeats of the same object.
///
/// The first token that reached an object is the one kept.
pub fn resolve_all<S: AsRef<str>>(tokens: &[S], snapshot: &Snapshot) -> Result<Vec<ResolvedTarget>> {
    let mut resolved: Vec<ResolvedTarget> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let target = resolve(token.as_ref(), snapshot)?;
        if resolved.iter().any(|r| r.object.id == target.object.id) {
            tracing::debug!("'{}' repeats an earlier target", token.as_ref());
            continue;
        }
        resolved.push(target);
    }
    Ok(resolved)
}

fn resolve_object<'a>(token: &str, snapshot: &'a Snapshot) -> Result<&'a ObjectRef> {
    let id_token = normalize_id(token);
    if id_token.is_empty() {
        return Err(AtomicError::NotFound(token.to_string()));
    }

    let by_id: Vec<&ObjectRef> = prefix_matches(&snapshot.images, id_token);
    if let Some(found) = single(by_id, |matches| AtomicError::AmbiguousImage {
        token: token.to_string(),
        candidates: matches.iter().map(|m| m.id.clone()).collect(),
    })? {
        return Ok(found);
    }

    let by_name = match_images(token, &snapshot.images);
    if let Some(found) = single(by_name, |matches| AtomicError::AmbiguousImage {
        token: token.to_string(),
        candidates: matches.iter().map(|m| image_label(m, token)).collect(),
    })? {
        return Ok(found);
    }

    let by_id = prefix_matches(&snapshot.containers, id_token);
    if let Some(found) = single(by_id, |matches| AtomicError::AmbiguousContainer {
        token: token.to_string(),
        candidates: matches.iter().map(|m| m.id.clone()).collect(),
    })? {
        return Ok(found);
    }

    let wanted = token.trim_start_matches('/');
    let by_name: Vec<&ObjectRef> = snapshot
        .containers
        .iter()
        .filter(|c| c.names.iter().any(|n| n.trim_start_matches('/') == wanted))
        .collect();
    if let Some(found) = single(by_name, |matches| AtomicError::AmbiguousContainer {
        token: token.to_string(),
        candidates: matches.iter().map(|m| container_label(m)).collect(),
    })? {
        return Ok(found);
    }

    Err(AtomicError::NotFound(token.to_string()))
}

fn prefix_matches<'a>(objects: &'a [ObjectRef], prefix: &str) -> Vec<&'a ObjectRef> {
    objects.iter().filter(|o| o.id.starts_with(prefix)).collect()
}

/// Zero matches is `None`, one is returned, more is the ambiguity error.
fn single<'a, F>(matches: Vec<&'a ObjectRef>, ambiguous: F) -> Result<Option<&'a ObjectRef>>
where
    F: FnOnce(&[&'a ObjectRef]) -> AtomicError,
{
    match matches.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        many => Err(ambiguous(many)),
    }
}

/// The `repo:tag` that best shows why an image matched.
fn image_label(image: &ObjectRef, token: &str) -> String {
    image
        .repo_tags
        .iter()
        .find(|t| t.contains(token))
        .or_else(|| image.repo_tags.first())
        .cloned()
        .unwrap_or_else(|| image.id.clone())
}

fn container_label(container: &ObjectRef) -> String {
    match container.names.first() {
        Some(name) => format!("{} ({})", name.trim_start_matches('/'), container.short_id()),
        None => container.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot::new(
            vec![
                ObjectRef::image("abc123", ["nginx:latest"]),
                ObjectRef::image("abcdef", ["nginx:1.19"]),
                ObjectRef::image("fedcba", ["docker.io/redis:7"]),
            ],
            vec![
                ObjectRef::container("c0ffee01", ["/web"]),
                ObjectRef::container("c0ffee02", ["db"]),
                ObjectRef::container("deadbeef", ["twin"]),
                ObjectRef::container("beefdead", ["twin"]),
            ],
        )
    }

    #[test]
    fn test_ambiguous_id_prefix() {
        let err = resolve("abc", &snapshot()).unwrap_err();
        match err {
            AtomicError::AmbiguousImage { candidates, .. } => {
                assert_eq!(candidates, ["abc123", "abcdef"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_unique_id_prefix() {
        let target = resolve("abc1", &snapshot()).unwrap();
        assert_eq!(target.object.id, "abc123");
        assert_eq!(target.matched_token, "abc1");
        assert!(target.is_id_form());

        let target = resolve("sha256:fed", &snapshot()).unwrap();
        assert_eq!(target.object.id, "fedcba");
    }

    #[test]
    fn test_ambiguous_name() {
        let err = resolve("nginx", &snapshot()).unwrap_err();
        assert!(matches!(err, AtomicError::AmbiguousImage { .. }));
        assert_eq!(
            err.candidates().unwrap(),
            ["nginx:latest".to_string(), "nginx:1.19".to_string()]
        );
    }

    #[test]
    fn test_unique_name() {
        let target = resolve("redis", &snapshot()).unwrap();
        assert_eq!(target.object.id, "fedcba");
        assert!(!target.is_id_form());
    }

    #[test]
    fn test_containers() {
        let snap = snapshot();
        assert!(matches!(
            resolve("c0ffee", &snap),
            Err(AtomicError::AmbiguousContainer { ref candidates, .. }) if candidates.len() == 2
        ));
        assert_eq!(resolve("c0ffee02", &snap).unwrap().object.id, "c0ffee02");
        assert_eq!(resolve("web", &snap).unwrap().object.id, "c0ffee01");
        assert_eq!(resolve("/db", &snap).unwrap().object.id, "c0ffee02");

        let err = resolve("twin", &snap).unwrap_err();
        assert!(matches!(err, AtomicError::AmbiguousContainer { .. }));
        assert_eq!(err.candidates().map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_not_found() {
        assert!(matches!(
            resolve("postgres", &snapshot()),
            Err(AtomicError::NotFound(ref t)) if t == "postgres"
        ));
        assert!(matches!(resolve("", &snapshot()), Err(AtomicError::NotFound(_))));
        assert!(matches!(
            resolve("sha256:", &snapshot()),
            Err(AtomicError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_all_dedups() {
        let targets = resolve_all(&["abc1", "nginx:latest", "web"], &snapshot()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].matched_token, "abc1");
        assert_eq!(targets[1].object.id, "c0ffee01");
    }
}
