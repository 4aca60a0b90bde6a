//! Content descriptors and platform selectors
//!
//! A descriptor points at a blob or manifest by digest. Index entries
//! additionally carry a platform for multi-arch selection.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::image::{Digest, ImageError};

/// Content descriptor - refers to a blob by digest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// MIME type of the referenced content
    #[serde(rename = "mediaType")]
    pub media_type: String,

    /// Content hash (e.g., "sha256:abc123...")
    pub digest: Digest,

    /// Size in bytes
    pub size: u64,

    /// Optional URLs for direct access to content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Optional annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    /// Platform this entry is for (index entries only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Inline payload, base64 encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
            data: None,
        }
    }

    /// Decode the inline `data` payload, verifying it against the
    /// descriptor's size and digest. Returns None when no data is set.
    pub fn inline_data(&self) -> Result<Option<Vec<u8>>, ImageError> {
        let Some(encoded) = &self.data else {
            return Ok(None);
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ImageError::InvalidDescriptor(format!("bad data field: {}", e)))?;
        if decoded.len() as u64 != self.size {
            return Err(ImageError::InvalidDescriptor(format!(
                "data length {} does not match descriptor size {}",
                decoded.len(),
                self.size
            )));
        }
        let mut digester = crate::image::Digester::new(self.digest.algorithm());
        digester.update(&decoded);
        let computed = digester.finalize();
        if computed != self.digest {
            return Err(ImageError::ContentVerificationError {
                expected: self.digest.to_string(),
                actual: computed.to_string(),
            });
        }
        Ok(Some(decoded))
    }

    /// External (foreign) layers carry direct URLs
    pub fn is_external(&self) -> bool {
        self.urls.as_ref().is_some_and(|u| !u.is_empty())
    }
}

/// Platform specification for multi-arch images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture (e.g., "amd64", "arm64")
    pub architecture: String,

    /// Operating system (e.g., "linux", "windows")
    pub os: String,

    /// OS version (optional)
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// OS features (optional)
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,

    /// CPU variant (e.g., "v8" for arm64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Parse an "os/arch" or "os/arch/variant" string
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let mut parts = s.split('/');
        let (os, architecture) = match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
                (os.to_string(), arch.to_string())
            }
            _ => {
                return Err(ImageError::InvalidPlatform(s.to_string()));
            }
        };
        let variant = parts.next().map(|v| v.to_string());
        if parts.next().is_some() {
            return Err(ImageError::InvalidPlatform(s.to_string()));
        }
        Ok(Self {
            architecture,
            os,
            os_version: None,
            os_features: None,
            variant,
        })
    }

    /// Check whether a target platform satisfies this selector.
    ///
    /// Empty selector fields match anything; set fields must match the
    /// target exactly. An unset variant matches "v8" on arm64 (the two
    /// spellings are used interchangeably by registries).
    pub fn matches(&self, target: &Platform) -> bool {
        if !self.os.is_empty() && self.os != target.os {
            return false;
        }
        if !self.architecture.is_empty() && self.architecture != target.architecture {
            return false;
        }
        let self_variant = self.variant.as_deref().unwrap_or("");
        let target_variant = target.variant.as_deref().unwrap_or("");
        if self_variant != target_variant
            && !(target.architecture == "arm64"
                && (self_variant.is_empty() && target_variant == "v8"
                    || self_variant == "v8" && target_variant.is_empty()))
        {
            return false;
        }
        if let Some(v) = &self.os_version {
            if !v.is_empty() && target.os_version.as_deref() != Some(v) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(os: &str, arch: &str, variant: Option<&str>) -> Platform {
        Platform {
            architecture: arch.to_string(),
            os: os.to_string(),
            os_version: None,
            os_features: None,
            variant: variant.map(|v| v.to_string()),
        }
    }

    #[test]
    fn test_parse_platform() {
        let p = Platform::parse("linux/amd64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert!(p.variant.is_none());

        let p = Platform::parse("linux/arm/v7").unwrap();
        assert_eq!(p.variant.as_deref(), Some("v7"));

        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/amd64/v2/extra").is_err());
    }

    #[test]
    fn test_exact_match() {
        let sel = platform("linux", "amd64", None);
        assert!(sel.matches(&platform("linux", "amd64", None)));
        assert!(!sel.matches(&platform("linux", "arm64", None)));
        assert!(!sel.matches(&platform("windows", "amd64", None)));
    }

    #[test]
    fn test_arm64_variant_default() {
        let sel = platform("linux", "arm64", None);
        assert!(sel.matches(&platform("linux", "arm64", Some("v8"))));
        let sel_v8 = platform("linux", "arm64", Some("v8"));
        assert!(sel_v8.matches(&platform("linux", "arm64", None)));
    }

    #[test]
    fn test_variant_mismatch() {
        let sel = platform("linux", "arm", Some("v6"));
        assert!(!sel.matches(&platform("linux", "arm", Some("v7"))));
        // no v8 shortcut outside arm64
        let sel = platform("linux", "arm", None);
        assert!(!sel.matches(&platform("linux", "arm", Some("v7"))));
    }

    #[test]
    fn test_empty_fields_match_all() {
        let sel = platform("", "", None);
        assert!(sel.matches(&platform("linux", "s390x", None)));
    }

    #[test]
    fn test_descriptor_serde() {
        let json = r#"{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "size": 0
        }"#;
        let d: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.size, 0);
        assert!(!d.is_external());
        // optional fields stay absent on re-serialization
        let out = serde_json::to_string(&d).unwrap();
        assert!(!out.contains("urls"));
        assert!(!out.contains("platform"));
    }

    #[test]
    fn test_inline_data_valid() {
        let payload = b"config-bytes";
        let d = Descriptor {
            data: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
            ..Descriptor::new(
                "application/vnd.oci.image.config.v1+json",
                Digest::from_bytes(payload),
                payload.len() as u64,
            )
        };
        assert_eq!(d.inline_data().unwrap().unwrap(), payload);
    }

    #[test]
    fn test_inline_data_size_mismatch() {
        let payload = b"config-bytes";
        let d = Descriptor {
            data: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
            ..Descriptor::new(
                "application/vnd.oci.image.config.v1+json",
                Digest::from_bytes(payload),
                payload.len() as u64 + 1,
            )
        };
        assert!(d.inline_data().is_err());
    }

    #[test]
    fn test_inline_data_digest_mismatch() {
        let payload = b"config-bytes";
        let d = Descriptor {
            data: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
            ..Descriptor::new(
                "application/vnd.oci.image.config.v1+json",
                Digest::from_bytes(b"other"),
                payload.len() as u64,
            )
        };
        assert!(matches!(
            d.inline_data(),
            Err(ImageError::ContentVerificationError { .. })
        ));
    }
}
