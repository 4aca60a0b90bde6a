//! OCI Image Manifest Parsing
//!
//! Supports OCI image manifests and indexes, Docker Image Manifest v2 and
//! manifest lists, and opaque artifact manifests. The raw body bytes are
//! kept alongside the parsed view: the digest of those bytes is the
//! manifest's identity, so inspection never changes serialization.
//! See: https://github.com/opencontainers/image-spec/blob/main/manifest.md

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::image::{Descriptor, Digest, ImageError, Platform};

/// OCI Media Types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// OCI Image Index
    OciIndex,
    /// OCI Image Manifest
    OciManifest,
    /// OCI Image Config
    OciImageConfig,
    /// OCI Layer (uncompressed tar)
    OciLayer,
    /// OCI Layer (gzip compressed)
    OciLayerGzip,
    /// OCI Layer (zstd compressed)
    OciLayerZstd,
    /// Docker Manifest List (fat manifest)
    DockerManifestList,
    /// Docker Manifest v2
    DockerManifestV2,
    /// Docker Image Config
    DockerImageConfig,
    /// Docker Layer
    DockerLayer,
    /// Unknown/other media type
    Other(String),
}

impl MediaType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "application/vnd.oci.image.index.v1+json" => MediaType::OciIndex,
            "application/vnd.oci.image.manifest.v1+json" => MediaType::OciManifest,
            "application/vnd.oci.image.config.v1+json" => MediaType::OciImageConfig,
            "application/vnd.oci.image.layer.v1.tar" => MediaType::OciLayer,
            "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::OciLayerGzip,
            "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::OciLayerZstd,
            "application/vnd.docker.distribution.manifest.list.v2+json" => {
                MediaType::DockerManifestList
            }
            "application/vnd.docker.distribution.manifest.v2+json" => MediaType::DockerManifestV2,
            "application/vnd.docker.container.image.v1+json" => MediaType::DockerImageConfig,
            "application/vnd.docker.image.rootfs.diff.tar.gzip" => MediaType::DockerLayer,
            other => MediaType::Other(other.to_string()),
        }
    }

    /// True for index/list media types (children are manifests)
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciIndex | MediaType::DockerManifestList)
    }

    /// True for single-image manifest media types
    pub fn is_image(&self) -> bool {
        matches!(self, MediaType::OciManifest | MediaType::DockerManifestV2)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::OciIndex => write!(f, "application/vnd.oci.image.index.v1+json"),
            MediaType::OciManifest => write!(f, "application/vnd.oci.image.manifest.v1+json"),
            MediaType::OciImageConfig => write!(f, "application/vnd.oci.image.config.v1+json"),
            MediaType::OciLayer => write!(f, "application/vnd.oci.image.layer.v1.tar"),
            MediaType::OciLayerGzip => write!(f, "application/vnd.oci.image.layer.v1.tar+gzip"),
            MediaType::OciLayerZstd => write!(f, "application/vnd.oci.image.layer.v1.tar+zstd"),
            MediaType::DockerManifestList => {
                write!(
                    f,
                    "application/vnd.docker.distribution.manifest.list.v2+json"
                )
            }
            MediaType::DockerManifestV2 => {
                write!(f, "application/vnd.docker.distribution.manifest.v2+json")
            }
            MediaType::DockerImageConfig => {
                write!(f, "application/vnd.docker.container.image.v1+json")
            }
            MediaType::DockerLayer => {
                write!(f, "application/vnd.docker.image.rootfs.diff.tar.gzip")
            }
            MediaType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Accept header listing every manifest media type the client parses
pub fn accept_manifest_types() -> String {
    [
        MediaType::OciManifest,
        MediaType::OciIndex,
        MediaType::DockerManifestV2,
        MediaType::DockerManifestList,
    ]
    .iter()
    .map(|m| m.to_string())
    .collect::<Vec<_>>()
    .join(", ")
}

/// Image manifest: config plus ordered layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Reference to image configuration
    pub config: Descriptor,

    /// List of layer descriptors
    pub layers: Vec<Descriptor>,

    /// Referrer subject, points at the manifest this one annotates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Manifest index: ordered child manifests, typically per-platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl ManifestIndex {
    /// Find the child descriptor for a platform selector
    pub fn find_platform(&self, selector: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| selector.matches(p))
        })
    }

    /// All platforms present in the index
    pub fn platforms(&self) -> Vec<&Platform> {
        self.manifests
            .iter()
            .filter_map(|m| m.platform.as_ref())
            .collect()
    }
}

/// Parsed view of a manifest body
#[derive(Debug, Clone)]
pub enum ManifestBody {
    Image(ImageManifest),
    Index(ManifestIndex),
    /// Artifact or unrecognized type, raw bytes only
    Unknown,
}

/// A manifest with its identity-preserving raw bytes
#[derive(Debug, Clone)]
pub struct Manifest {
    media_type: String,
    digest: Digest,
    raw: Vec<u8>,
    body: ManifestBody,
}

impl Manifest {
    /// Parse a manifest body, dispatching on its media type.
    ///
    /// An empty media type falls back to probing the body (a `manifests`
    /// array marks an index). Unrecognized media types are kept opaque.
    pub fn parse(media_type: &str, raw: Vec<u8>) -> Result<Self, ImageError> {
        let digest = Digest::from_bytes(&raw);
        let mt = if media_type.is_empty() {
            probe_media_type(&raw)?
        } else {
            MediaType::from_str(media_type)
        };
        let body = if mt.is_index() {
            let index: ManifestIndex = serde_json::from_slice(&raw)?;
            ManifestBody::Index(index)
        } else if mt.is_image() {
            let image: ImageManifest = serde_json::from_slice(&raw)?;
            ManifestBody::Image(image)
        } else {
            ManifestBody::Unknown
        };
        Ok(Self {
            media_type: mt.to_string(),
            digest,
            raw,
            body,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Raw body bytes, byte-for-byte as received
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn body(&self) -> &ManifestBody {
        &self.body
    }

    pub fn is_index(&self) -> bool {
        matches!(self.body, ManifestBody::Index(_))
    }

    /// Descriptor pointing at this manifest
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type.clone(), self.digest.clone(), self.raw.len() as u64)
    }

    pub fn as_index(&self) -> Option<&ManifestIndex> {
        match &self.body {
            ManifestBody::Index(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageManifest> {
        match &self.body {
            ManifestBody::Image(m) => Some(m),
            _ => None,
        }
    }

    /// Resolve the child descriptor for a platform selector
    pub fn platform_descriptor(&self, selector: &Platform) -> Result<Descriptor, ImageError> {
        let index = self.as_index().ok_or_else(|| {
            ImageError::UnsupportedMediaType(format!(
                "platform lookup on non-index manifest: {}",
                self.media_type
            ))
        })?;
        index
            .find_platform(selector)
            .cloned()
            .ok_or_else(|| ImageError::PlatformNotFound(selector.to_string()))
    }

    /// Produce a new index retaining only children matching any selector.
    ///
    /// The body is re-serialized, so the result has a fresh digest. Works
    /// on the raw JSON to preserve fields this crate does not model.
    pub fn filter_platforms(&self, selectors: &[Platform]) -> Result<Manifest, ImageError> {
        if self.as_index().is_none() {
            return Err(ImageError::UnsupportedMediaType(format!(
                "platform filter on non-index manifest: {}",
                self.media_type
            )));
        }
        let mut value: serde_json::Value = serde_json::from_slice(&self.raw)?;
        let Some(entries) = value
            .get_mut("manifests")
            .and_then(|m| m.as_array_mut())
        else {
            return Err(ImageError::InvalidManifest(
                "index missing manifests array".to_string(),
            ));
        };
        entries.retain(|entry| {
            let platform: Option<Platform> = entry
                .get("platform")
                .and_then(|p| serde_json::from_value(p.clone()).ok());
            match platform {
                Some(p) => selectors.iter().any(|sel| sel.matches(&p)),
                None => false,
            }
        });
        let raw = serde_json::to_vec(&value)?;
        Manifest::parse(&self.media_type, raw)
    }

    /// Descriptors this manifest references: children for an index,
    /// config plus layers for an image, nothing for unknown bodies.
    pub fn child_descriptors(&self) -> Vec<&Descriptor> {
        match &self.body {
            ManifestBody::Index(i) => i.manifests.iter().collect(),
            ManifestBody::Image(m) => {
                let mut all = Vec::with_capacity(m.layers.len() + 1);
                all.push(&m.config);
                all.extend(m.layers.iter());
                all
            }
            ManifestBody::Unknown => Vec::new(),
        }
    }
}

/// Detect the manifest type when no media type is available
fn probe_media_type(raw: &[u8]) -> Result<MediaType, ImageError> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
        manifests: Option<Vec<serde_json::Value>>,
        config: Option<serde_json::Value>,
    }

    let probe: Probe = serde_json::from_slice(raw)?;
    if let Some(mt) = probe.media_type {
        return Ok(MediaType::from_str(&mt));
    }
    if probe.manifests.is_some() {
        return Ok(MediaType::OciIndex);
    }
    if probe.config.is_some() {
        return Ok(MediaType::OciManifest);
    }
    Ok(MediaType::Other(String::new()))
}
