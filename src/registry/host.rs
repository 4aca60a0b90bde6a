//! Per-host registry configuration
//!
//! Connection settings for a registry host: TLS policy, mirrors,
//! credentials, upload chunking, and request throttling. Hosts are
//! merged field-wise when the same name appears in multiple sources
//! (inline config, docker config.json, credential helpers).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// TLS policy for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Verified https
    #[default]
    Enabled,
    /// https without certificate verification
    Insecure,
    /// Plain http
    Disabled,
}

/// Configuration for a single registry host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Name the host is looked up by (usually the registry component of
    /// a reference)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub tls: TlsMode,

    /// Hostname to connect to when it differs from `name`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub pass: String,

    /// Identity token, used instead of user/pass when set
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Inserted between /v2 and the repository in request paths
    #[serde(rename = "pathPrefix", skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,

    /// Host names to try before this host
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,

    /// Lower priority mirrors are tried first
    pub priority: u32,

    /// Registry quirks, e.g. {"disableHead": "true"}
    #[serde(rename = "apiOpts", skip_serializing_if = "HashMap::is_empty")]
    pub api_opts: HashMap<String, String>,

    /// Chunk size for blob uploads, 0 = default
    #[serde(rename = "blobChunk")]
    pub blob_chunk: u64,

    /// Largest blob pushed in a single request, 0 = default
    #[serde(rename = "blobMax")]
    pub blob_max: u64,

    /// Request rate limit, requests per second
    #[serde(rename = "reqPerSec", skip_serializing_if = "Option::is_none")]
    pub req_per_sec: Option<f64>,

    /// Rate limiter burst size
    #[serde(rename = "reqBurst", skip_serializing_if = "Option::is_none")]
    pub req_burst: Option<u32>,

    /// Keep distinct auth state per repository on this host
    #[serde(rename = "repoAuth")]
    pub repo_auth: bool,

    /// Credential helper name (docker-credential-<name>)
    #[serde(rename = "credHelper", skip_serializing_if = "String::is_empty")]
    pub cred_helper: String,

    /// PEM root certificate for this host
    #[serde(rename = "regCert", skip_serializing_if = "String::is_empty")]
    pub reg_cert: String,
}

impl HostConfig {
    /// New host config with defaults for a name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Hostname to connect to
    pub fn hostname(&self) -> &str {
        if self.hostname.is_empty() {
            &self.name
        } else {
            &self.hostname
        }
    }

    /// True when the named apiOpt is set to a truthy value
    pub fn api_opt(&self, name: &str) -> bool {
        self.api_opts
            .get(name)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    /// Merge another config into this one; set fields in `other` win
    pub fn merge(&mut self, other: HostConfig) {
        if other.tls != TlsMode::default() {
            self.tls = other.tls;
        }
        if !other.hostname.is_empty() {
            self.hostname = other.hostname;
        }
        if !other.user.is_empty() {
            self.user = other.user;
        }
        if !other.pass.is_empty() {
            self.pass = other.pass;
        }
        if !other.token.is_empty() {
            self.token = other.token;
        }
        if !other.path_prefix.is_empty() {
            self.path_prefix = other.path_prefix;
        }
        if !other.mirrors.is_empty() {
            self.mirrors = other.mirrors;
        }
        if other.priority != 0 {
            self.priority = other.priority;
        }
        if !other.api_opts.is_empty() {
            self.api_opts = other.api_opts;
        }
        if other.blob_chunk != 0 {
            self.blob_chunk = other.blob_chunk;
        }
        if other.blob_max != 0 {
            self.blob_max = other.blob_max;
        }
        if other.req_per_sec.is_some() {
            self.req_per_sec = other.req_per_sec;
        }
        if other.req_burst.is_some() {
            self.req_burst = other.req_burst;
        }
        if other.repo_auth {
            self.repo_auth = true;
        }
        if !other.cred_helper.is_empty() {
            self.cred_helper = other.cred_helper;
        }
        if !other.reg_cert.is_empty() {
            self.reg_cert = other.reg_cert;
        }
    }
}
