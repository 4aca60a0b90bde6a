//! Image model types
//!
//! References, digests, descriptors, platforms, and manifest variants
//! shared by every scheme and the copy engine.

mod descriptor;
mod digest;
mod manifest;
mod reference;

pub use descriptor::{Descriptor, Platform};
pub use digest::{Digest, DigestAlgorithm, Digester};
pub use manifest::{
    accept_manifest_types, ImageManifest, Manifest, ManifestBody, ManifestIndex, MediaType,
};
pub use reference::{RefScheme, Reference};

use thiserror::Error;

/// Errors from parsing or validating image model types
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("platform not found in index: {0}")]
    PlatformNotFound(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("content verification failed: expected {expected}, got {actual}")]
    ContentVerificationError { expected: String, actual: String },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
