//! Image Reference Parsing
//!
//! Parses Docker-style image references like:
//! - nginx
//! - nginx:1.25
//! - myuser/myapp:v1.0
//! - ghcr.io/owner/repo:tag
//! - registry.example.com:5000/app@sha256:abc...
//!
//! and local OCI layout references:
//! - ocidir://path/to/layout:tag
//! - ocidir://path/to/layout@sha256:abc...

use std::fmt;
use std::str::FromStr;

use crate::image::{Digest, ImageError};

const DOCKER_HUB: &str = "docker.io";
const OCIDIR_PREFIX: &str = "ocidir://";
const MAX_TAG_LEN: usize = 128;

/// Where a reference points: a remote registry or a local OCI layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefScheme {
    Registry,
    OciDir,
}

/// Parsed image reference
///
/// Immutable; mutation helpers return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub scheme: RefScheme,

    /// Registry host for `Registry`, layout directory for `OciDir`
    pub registry: String,

    /// Repository path (e.g., "library/nginx"); empty for `OciDir`
    pub repository: String,

    /// Tag; absent with an absent digest means "latest"
    pub tag: Option<String>,

    /// Digest; takes precedence over tag when reading
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse an image reference string
    ///
    /// Handles various formats:
    /// - `nginx` -> docker.io/library/nginx:latest
    /// - `nginx:1.25` -> docker.io/library/nginx:1.25
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `ghcr.io/owner/repo:tag`
    /// - `registry:5000/app@sha256:abc...`
    /// - `ocidir://./out:v1`
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let s = s.trim();

        if s.is_empty() {
            return Err(ImageError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        if let Some(rest) = s.strip_prefix(OCIDIR_PREFIX) {
            return Self::parse_ocidir(rest);
        }

        // Split off digest if present
        let (ref_part, digest) = match s.split_once('@') {
            Some((r, d)) => (r, Some(Digest::parse(d)?)),
            None => (s, None),
        };

        // Determine if the first component is a registry
        let parts: Vec<&str> = ref_part.splitn(2, '/').collect();

        let (registry, rest) = if parts.len() == 1 {
            // No slash - just an image name like "nginx"
            (DOCKER_HUB, parts[0])
        } else {
            let first = parts[0];
            // Check if first part looks like a registry (has dot, colon, or is "localhost")
            let is_registry =
                first.contains('.') || first.contains(':') || first == "localhost";

            if is_registry {
                // an underscore makes the component ambiguous unless a
                // port or dot marks it as a hostname
                if first.contains('_') {
                    return Err(ImageError::InvalidReference(format!(
                        "underscore in host: {}",
                        first
                    )));
                }
                (first, parts[1])
            } else {
                // It's a user/repo format like "myuser/myapp"
                (DOCKER_HUB, ref_part)
            }
        };

        // The digest has already been split off, so a remaining colon
        // after the last path separator introduces a tag
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((r, t)) => (r.to_string(), Some(t.to_string())),
            None => (rest.to_string(), None),
        };

        if repository.is_empty() {
            return Err(ImageError::InvalidReference(format!(
                "missing repository: {}",
                s
            )));
        }
        if let Some(t) = &tag {
            validate_tag(t)?;
        }

        // Add "library/" prefix for Docker Hub official images
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        // Normalize Docker Hub registry name
        let registry = match registry {
            "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
                DOCKER_HUB.to_string()
            }
            r => r.to_string(),
        };

        Ok(Self {
            scheme: RefScheme::Registry,
            registry,
            repository,
            tag,
            digest,
        })
    }

    fn parse_ocidir(rest: &str) -> Result<Self, ImageError> {
        let (path_part, digest) = match rest.split_once('@') {
            Some((p, d)) => (p, Some(Digest::parse(d)?)),
            None => (rest, None),
        };
        // a colon after the last path separator introduces a tag
        let (path, tag) = match path_part.rsplit_once(':') {
            Some((p, t)) if !t.contains('/') && !p.is_empty() => (p, Some(t.to_string())),
            _ => (path_part, None),
        };
        if path.is_empty() {
            return Err(ImageError::InvalidReference(
                "empty ocidir path".to_string(),
            ));
        }
        if let Some(t) = &tag {
            validate_tag(t)?;
        }
        Ok(Self {
            scheme: RefScheme::OciDir,
            registry: path.to_string(),
            repository: String::new(),
            tag,
            digest,
        })
    }

    /// Create a copy of this reference with a different digest
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            tag: None,
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Create a copy of this reference with a different tag
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    /// Tag to use when neither tag nor digest is set
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The tag or digest string used in registry API paths
    pub fn api_reference(&self) -> String {
        match &self.digest {
            Some(d) => d.to_string(),
            None => self.tag_or_latest().to_string(),
        }
    }

    /// Get the full reference string
    pub fn common_name(&self) -> String {
        let prefix = match self.scheme {
            RefScheme::Registry => format!("{}/{}", self.registry, self.repository),
            RefScheme::OciDir => format!("{}{}", OCIDIR_PREFIX, self.registry),
        };
        match (&self.tag, &self.digest) {
            (_, Some(d)) => format!("{}@{}", prefix, d),
            (Some(t), None) => format!("{}:{}", prefix, t),
            (None, None) => prefix,
        }
    }
}

fn validate_tag(tag: &str) -> Result<(), ImageError> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(ImageError::InvalidReference(format!(
            "tag length out of range: {}",
            tag
        )));
    }
    if !tag
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
    {
        return Err(ImageError::InvalidReference(format!(
            "invalid tag characters: {}",
            tag
        )));
    }
    Ok(())
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.common_name())
    }
}

impl FromStr for Reference {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
