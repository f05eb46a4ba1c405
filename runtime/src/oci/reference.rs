//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` or `host:5000/x@sha256:...`
//! into registry, repository, tag and digest.

use strata_core::error::{Result, StrataError};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Registry plus repository: everything needed to address a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub registry: String,
    pub repository: String,
}

impl RepositoryRef {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
        }
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, optionally with port (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    /// Tag (e.g. "3.19")
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.19` → docker.io/library/alpine:3.19
    /// - `ghcr.io/org/app:v1` → ghcr.io/org/app:v1
    /// - `localhost:5000/app@sha256:...` → pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StrataError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(StrataError::InvalidReference(format!(
                        "invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag can only follow the last path component; a colon before the
        // first slash is a registry port.
        let last_component_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_component_start..].rfind(':') {
            Some(colon) => {
                let split = last_component_start + colon;
                let tag = &name_tag[split + 1..];
                let is_bare_port = last_component_start == 0
                    && !tag.is_empty()
                    && tag.chars().all(|c| c.is_ascii_digit())
                    && name_tag[..split].contains('.');
                if is_bare_port {
                    (name_tag, None)
                } else {
                    (&name_tag[..split], Some(tag.to_string()))
                }
            }
            None => (name_tag, None),
        };

        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(StrataError::InvalidReference(format!(
                    "empty tag in '{}'",
                    reference
                )));
            }
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        if name.is_empty() {
            return Err(StrataError::InvalidReference(
                "empty repository name".to_string(),
            ));
        }

        // First component is a registry if it looks like a hostname
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(StrataError::InvalidReference(format!(
                        "empty repository in '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Docker Hub official images live under library/
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Tag or digest used to request the manifest (digest wins).
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    pub fn repository_ref(&self) -> RepositoryRef {
        RepositoryRef::new(&self.registry, &self.repository)
    }

    /// Get the full reference string.
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
