//! Registry image reference parsing.
//!
//! Turns `alpine:3.19` or `registry.local:5000/team/base@sha256:...` into
//! registry, repository and tag/digest parts.

use a3s_rootfs_core::error::{Result, RootfsError};

const DEFAULT_REGISTRY: &str = "docker.io";

const DEFAULT_TAG: &str = "latest";

/// Scheme prefix accepted in front of registry references.
pub const DOCKER_SCHEME: &str = "docker://";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine")
    pub repository: String,
    pub tag: Option<String>,
    /// Manifest digest pin (e.g., "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference, with or without a `docker://` prefix.
    ///
    /// Bare names resolve against Docker Hub's `library/` namespace and a
    /// missing tag defaults to `latest` unless a digest is pinned.
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let trimmed = trimmed.strip_prefix(DOCKER_SCHEME).unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(RootfsError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match trimmed.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(RootfsError::InvalidReference(format!(
                        "'{}': digest must be algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical `registry/repository[:tag][@digest]` form.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`. A colon is a tag separator only after the last '/',
/// and a purely numeric suffix on a slash-less name is a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let last_segment = &name_tag[last_segment_start..];

    match last_segment.rfind(':') {
        Some(colon) => {
            let tag = &last_segment[colon + 1..];
            if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                return (name_tag, None);
            }
            (
                &name_tag[..last_segment_start + colon],
                Some(tag.to_string()),
            )
        }
        None => (name_tag, None),
    }
}

fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(RootfsError::InvalidReference(format!(
                    "'{}': empty repository",
                    reference
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
