//! Sync configuration
//!
//! YAML configuration for the mirroring tool: registry credentials,
//! run-wide defaults, and the ordered list of sync steps.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::image::accept_manifest_types;
use crate::registry::HostConfig;
use crate::sync::{Result, SyncError};

/// Top-level sync configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub version: u32,

    /// Registry credentials and connection settings
    #[serde(default)]
    pub creds: Vec<HostConfig>,

    #[serde(default)]
    pub defaults: SyncDefaults,

    /// Ordered sync steps
    #[serde(default)]
    pub sync: Vec<SyncStep>,
}

/// Defaults applied to steps that do not set their own value
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncDefaults {
    /// Parallel image copies across the whole run
    pub parallel: usize,

    /// Default step interval, seconds
    pub interval: Option<u64>,

    /// Default cron schedule
    pub schedule: Option<String>,

    pub ratelimit: RateLimitConfig,

    /// Backup reference template applied before overwrites
    pub backup: Option<String>,

    /// Manifest cache entries kept for platform resolution
    #[serde(rename = "cacheCount")]
    pub cache_count: usize,

    /// Manifest cache entry lifetime, seconds
    #[serde(rename = "cacheTime")]
    pub cache_time: u64,

    /// Do not read docker config.json credentials
    #[serde(rename = "skipDockerConf")]
    pub skip_docker_conf: bool,

    /// Source media types steps accept
    #[serde(rename = "mediaTypes")]
    pub media_types: Vec<String>,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            parallel: 1,
            interval: None,
            schedule: None,
            ratelimit: RateLimitConfig::default(),
            backup: None,
            cache_count: 100,
            cache_time: 300,
            skip_docker_conf: false,
            media_types: accept_manifest_types()
                .split(", ")
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Source rate limit gate settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Pause copying when the source reports fewer remaining requests
    pub min: u64,

    /// Seconds to wait before rechecking the limit
    pub retry: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { min: 0, retry: 300 }
    }
}

impl RateLimitConfig {
    pub fn retry_duration(&self) -> Duration {
        Duration::from_secs(self.retry.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// One source reference to one target reference
    Image,
    /// Every matching tag of a source repository
    Repository,
    /// Every repository of a source registry
    Registry,
}

/// Tag filter patterns; each is anchored as ^pattern$
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TagFilterConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// One sync step
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncStep {
    pub source: String,
    pub target: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Cron schedule for server mode
    #[serde(default)]
    pub schedule: Option<String>,

    /// Interval in seconds for server mode, when no schedule is set
    #[serde(default)]
    pub interval: Option<u64>,

    /// Resolve this single platform from a source index
    #[serde(default)]
    pub platform: Option<String>,

    /// Rewrite the target index to only these platforms
    #[serde(default)]
    pub platforms: Vec<String>,

    #[serde(default)]
    pub tags: TagFilterConfig,

    #[serde(rename = "mediaTypes", default)]
    pub media_types: Option<Vec<String>>,

    #[serde(default)]
    pub backup: Option<String>,

    #[serde(rename = "forceRecursive", default)]
    pub force_recursive: Option<bool>,

    #[serde(rename = "digestTags", default)]
    pub digest_tags: Option<bool>,

    #[serde(default)]
    pub referrers: Option<bool>,

    #[serde(rename = "fastCheck", default)]
    pub fast_check: Option<bool>,

    #[serde(rename = "rateLimit", default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl SyncStep {
    /// Effective media type allow list
    pub fn media_types<'a>(&'a self, defaults: &'a SyncDefaults) -> &'a [String] {
        self.media_types.as_deref().unwrap_or(&defaults.media_types)
    }

    pub fn rate_limit<'a>(&'a self, defaults: &'a SyncDefaults) -> &'a RateLimitConfig {
        self.rate_limit.as_ref().unwrap_or(&defaults.ratelimit)
    }

    pub fn backup<'a>(&'a self, defaults: &'a SyncDefaults) -> Option<&'a str> {
        self.backup
            .as_deref()
            .or(defaults.backup.as_deref())
    }

    /// Schedule for server mode: explicit cron, else interval, falling
    /// back to the defaults
    pub fn timing(&self, defaults: &SyncDefaults) -> Option<StepTiming> {
        if let Some(schedule) = self.schedule.as_ref().or(defaults.schedule.as_ref()) {
            return Some(StepTiming::Cron(schedule.clone()));
        }
        self.interval
            .or(defaults.interval)
            .map(|secs| StepTiming::Interval(Duration::from_secs(secs.max(1))))
    }
}

/// When a step fires in server mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTiming {
    Cron(String),
    Interval(Duration),
}

impl SyncConfig {
    pub fn load_reader(mut reader: impl Read) -> Result<Self> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        let config: SyncConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::load_reader(file)
    }

    fn validate(&self) -> Result<()> {
        if self.version > 1 {
            return Err(SyncError::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        for (i, step) in self.sync.iter().enumerate() {
            if step.source.is_empty() || step.target.is_empty() {
                return Err(SyncError::Config(format!(
                    "sync step {} missing source or target",
                    i
                )));
            }
        }
        Ok(())
    }
}
