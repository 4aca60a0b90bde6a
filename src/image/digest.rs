//! Content digests
//!
//! A digest is an `algorithm:hex` pair identifying a blob or manifest.
//! Supports sha256 (canonical) and sha512.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::image::ImageError;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Expected length of the hex encoding
    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ImageError::InvalidDigest(format!(
                "unsupported algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse a digest from its `algo:hex` form
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| ImageError::InvalidDigest(format!("missing algorithm: {}", s)))?;
        let algorithm: DigestAlgorithm = algo.parse()?;
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ImageError::InvalidDigest(format!(
                "malformed {} hex: {}",
                algorithm, hex
            )));
        }
        Ok(Self {
            algorithm,
            // hex comparison is case-insensitive, store lowercase
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of a byte slice using the canonical algorithm (sha256)
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex portion without the algorithm prefix
    pub fn encoded(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher bound to an algorithm
pub struct Digester {
    inner: DigesterInner,
}

enum DigesterInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Sha256 => DigesterInner::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigesterInner::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    /// Canonical digester (sha256)
    pub fn canonical() -> Self {
        Self::new(DigestAlgorithm::Sha256)
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            DigesterInner::Sha256(h) => h.update(data),
            DigesterInner::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.inner {
            DigesterInner::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            DigesterInner::Sha512(h) => Digest {
                algorithm: DigestAlgorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_roundtrip() {
        let d = Digest::parse(EMPTY_SHA256).unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(d.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_case_insensitive_equality() {
        let upper = EMPTY_SHA256.replace("sha256:", "sha256:").to_uppercase();
        let upper = upper.replace("SHA256", "sha256");
        let a = Digest::parse(EMPTY_SHA256).unwrap();
        let b = Digest::parse(&upper).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_bytes_matches_digester() {
        let data = b"hello world";
        let direct = Digest::from_bytes(data);

        let mut digester = Digester::canonical();
        digester.update(&data[..5]);
        digester.update(&data[5..]);
        assert_eq!(digester.finalize(), direct);
    }

    #[test]
    fn test_empty_input_digest() {
        assert_eq!(Digest::from_bytes(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_sha512() {
        let mut digester = Digester::new(DigestAlgorithm::Sha512);
        digester.update(b"abc");
        let d = digester.finalize();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha512);
        assert_eq!(d.encoded().len(), 128);
        assert!(Digest::parse(&d.to_string()).is_ok());
    }

    #[test]
    fn test_invalid_digests() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:tooshort").is_err());
        assert!(Digest::parse(&format!("sha256:{}", "z".repeat(64))).is_err());
    }

    #[test]
    fn test_serde_string_form() {
        let d: Digest = serde_json::from_str(&format!("\"{}\"", EMPTY_SHA256)).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), format!("\"{}\"", EMPTY_SHA256));
    }
}
