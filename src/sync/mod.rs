//! Sync orchestrator
//!
//! Scheduled multi-step mirroring: YAML configuration, tag filtering,
//! platform resolution, rate-limit-aware throttling, and the runner
//! driving image copies under bounded parallelism.

mod config;
mod engine;
mod filter;

pub use config::{
    RateLimitConfig, StepTiming, StepType, SyncConfig, SyncDefaults, SyncStep, TagFilterConfig,
};
pub use engine::{SyncAction, SyncRunner};
pub use filter::TagFilter;

use thiserror::Error;

/// Errors from the sync orchestrator
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("config error: {0}")]
    Config(String),

    #[error("bad schedule: {0}")]
    BadSchedule(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("image error: {0}")]
    Image(#[from] crate::image::ImageError),

    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, SyncError>;
