//! OCI reference parsing (spec §4.3): `[registry[:port]/][repo/]name[:tag|@digest]`.
//! Deliberately hand-rolled rather than delegated to a registry client
//! crate's own parser — the disambiguation rules here (numeric trailing
//! segment is a port, not a tag; bare names get `library/` prefixed) are
//! spec-mandated and don't match every registry client's conventions.

use crate::error::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub normalized: String,
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_digest(candidate: &str) -> bool {
    match candidate.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Splits a trailing `:suffix` off `segment`, refusing to treat a purely
/// numeric suffix as a tag (it's a registry port instead).
fn split_trailing_tag(segment: &str) -> (&str, Option<&str>) {
    match segment.rsplit_once(':') {
        Some((name, suffix)) if !suffix.is_empty() && !suffix.chars().all(|c| c.is_ascii_digit()) => {
            (name, Some(suffix))
        }
        _ => (segment, None),
    }
}

pub fn parse(input: &str) -> Result<ImageReference> {
    if input.is_empty() {
        return Err(Error::InvalidImageRef { input: input.to_string() });
    }

    let (before_digest, digest_part) = match input.split_once('@') {
        Some((left, right)) => (left, Some(right)),
        None => (input, None),
    };

    let digest = match digest_part {
        Some(d) if is_valid_digest(d) => Some(d.to_string()),
        Some(_) => return Err(Error::InvalidImageRef { input: input.to_string() }),
        None => None,
    };

    if before_digest.is_empty() {
        return Err(Error::InvalidImageRef { input: input.to_string() });
    }

    let segments: Vec<&str> = before_digest.split('/').collect();

    let (registry, rest): (String, Vec<&str>) = if segments.len() > 1 && looks_like_registry(segments[0]) {
        (segments[0].to_string(), segments[1..].to_vec())
    } else {
        (DEFAULT_REGISTRY.to_string(), segments.clone())
    };

    if rest.is_empty() {
        return Err(Error::InvalidImageRef { input: input.to_string() });
    }

    let last = *rest.last().unwrap();
    let (last_name, tag) = split_trailing_tag(last);

    // Digest present => tag must be absent from the parse result, per
    // spec: "digest preserved, tag absent".
    let tag = if digest.is_some() { None } else { tag.map(str::to_string) };

    if last_name.is_empty() {
        return Err(Error::InvalidImageRef { input: input.to_string() });
    }

    let mut repo_parts: Vec<&str> = rest[..rest.len() - 1].to_vec();
    repo_parts.push(last_name);
    let mut repository = repo_parts.join("/");

    if repository_is_single_segment(&repository) && registry == DEFAULT_REGISTRY {
        repository = format!("library/{repository}");
    }

    if repository.is_empty() {
        return Err(Error::InvalidImageRef { input: input.to_string() });
    }

    let tag = if digest.is_none() && tag.is_none() { Some(DEFAULT_TAG.to_string()) } else { tag };

    let normalized = match (&tag, &digest) {
        (_, Some(d)) => format!("{registry}/{repository}@{d}"),
        (Some(t), None) => format!("{registry}/{repository}:{t}"),
        (None, None) => format!("{registry}/{repository}:{DEFAULT_TAG}"),
    };

    Ok(ImageReference { registry, repository, tag, digest, normalized })
}

fn repository_is_single_segment(repository: &str) -> bool {
    !repository.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name_with_implied_registry_and_tag() {
        let r = parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.normalized, "docker.io/library/alpine:latest");
    }

    #[test]
    fn parses_digest_pinned_reference_with_no_tag() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let input = format!("ghcr.io/acme/app@{digest}");
        let r = parse(&input).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "acme/app");
        assert!(r.tag.is_none());
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn trailing_numeric_segment_on_registry_is_a_port_not_a_tag() {
        let r = parse("registry.example.com:5000/team/app").unwrap();
        assert_eq!(r.registry, "registry.example.com:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn normalized_output_is_a_fixed_point_of_parse() {
        for input in ["alpine", "ghcr.io/acme/app:v2", "localhost/foo/bar:dev"] {
            let once = parse(input).unwrap();
            let twice = parse(&once.normalized).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_malformed_digest() {
        assert!(parse("alpine@sha256:not-hex").is_err());
        assert!(parse("alpine@sha256:abc").is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(parse("").is_err());
    }
}
