//! Registry access
//!
//! Per-host configuration, credential resolution, the auth engine, the
//! retrying HTTP transport, and the registry scheme built on top of it.

mod auth;
mod client;
mod creds;
mod host;
mod transport;

pub use auth::{parse_challenges, select_challenge, Challenge, HostAuth};
pub use client::{RateLimitInfo, RegistryScheme};
pub use creds::{helper_get, helper_list, CredStore, Credential, DockerConfig};
pub use host::{HostConfig, TlsMode};
pub use transport::{
    ApiRequest, Transport, TransportBuilder, TransportResponse, DEFAULT_DELAY_INIT,
    DEFAULT_DELAY_MAX, DEFAULT_RETRY_LIMIT,
};

use thiserror::Error;

/// Errors that can occur during registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("backoff limit reached for host {0}")]
    BackoffLimit(String),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("unsupported API: {0}")]
    UnsupportedApi(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("operation canceled")]
    Canceled,

    #[error("all requests failed: {0}")]
    AllRequestsFailed(String),

    #[error("credential helper failed: {0}")]
    CredentialHelper(String),

    #[error("unexpected status {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] crate::image::ImageError),
}

impl RegistryError {
    /// Fatal errors are never retried on another mirror
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::DigestMismatch { .. } | RegistryError::Canceled
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
