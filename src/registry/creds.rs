//! Credential resolution
//!
//! Merges credentials from inline host config, docker-style
//! `config.json` auths, and credential-helper subprocesses. Helpers are
//! trusted collaborators speaking the docker-credential protocol:
//! hostname on stdin, `{ServerURL, Username, Secret}` JSON on stdout,
//! non-zero exit meaning "no credentials".

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::registry::{HostConfig, RegistryError, Result};

/// The username credential helpers use to mark an identity token
const TOKEN_USER: &str = "<token>";

/// Resolved credentials for one host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub user: String,
    pub pass: String,
    /// Identity token, used for token auth instead of user/pass
    pub token: String,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.pass.is_empty() && self.token.is_empty()
    }
}

/// Docker config.json structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerConfig {
    /// Registry auths (base64 encoded credentials)
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,

    /// Credential store (e.g., "osxkeychain", "secretservice")
    #[serde(rename = "credsStore", skip_serializing_if = "Option::is_none")]
    pub creds_store: Option<String>,

    /// Per-registry credential helpers
    #[serde(rename = "credHelpers", default)]
    pub cred_helpers: HashMap<String, String>,
}

/// Docker auth entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerAuthEntry {
    /// Base64-encoded "username:password"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Identity token
    #[serde(rename = "identitytoken", skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

impl DockerConfig {
    /// Load Docker config from its default location, `DOCKER_CONFIG`
    /// overriding the directory. Missing file is not an error.
    pub fn load() -> Result<Option<Self>> {
        let Some(path) = Self::config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: DockerConfig = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Credentials for a hostname from the auths table
    fn lookup(&self, hostname: &str) -> Option<Credential> {
        for key in registry_keys(hostname) {
            if let Some(entry) = self.auths.get(&key) {
                if let Some(cred) = decode_docker_auth(entry) {
                    return Some(cred);
                }
            }
        }
        None
    }

    /// Helper configured for a hostname, if any
    fn helper_for(&self, hostname: &str) -> Option<&str> {
        self.cred_helpers
            .get(hostname)
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }
}

/// Resolves host credentials, loading the docker config at most once
#[derive(Debug, Default)]
pub struct CredStore {
    docker: Option<DockerConfig>,
}

impl CredStore {
    /// Store backed by the ambient docker config
    pub fn from_docker_config() -> Self {
        let docker = match DockerConfig::load() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load docker config");
                None
            }
        };
        Self { docker }
    }

    /// Store that ignores docker config (skipDockerConf)
    pub fn empty() -> Self {
        Self { docker: None }
    }

    /// Resolve credentials for a host.
    ///
    /// Precedence: inline host config, then docker config.json auths,
    /// then a credential helper (host-configured or docker-configured).
    pub async fn resolve(&self, host: &HostConfig) -> Credential {
        if !host.user.is_empty() || !host.token.is_empty() {
            return Credential {
                user: host.user.clone(),
                pass: host.pass.clone(),
                token: host.token.clone(),
            };
        }

        if let Some(docker) = &self.docker {
            if let Some(cred) = docker.lookup(host.hostname()) {
                return cred;
            }
        }

        let helper = if !host.cred_helper.is_empty() {
            Some(host.cred_helper.as_str())
        } else {
            self.docker
                .as_ref()
                .and_then(|d| d.helper_for(host.hostname()))
        };
        if let Some(helper) = helper {
            match helper_get(helper, host.hostname()).await {
                Ok(cred) => return cred,
                Err(e) => {
                    tracing::debug!(helper, error = %e, "credential helper returned nothing");
                }
            }
        }

        Credential::default()
    }
}

/// Output of `docker-credential-<helper> get`
#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "ServerURL", default)]
    #[allow(dead_code)]
    server_url: String,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Run `docker-credential-<helper> get` with the hostname on stdin
pub async fn helper_get(helper: &str, hostname: &str) -> Result<Credential> {
    let program = helper_program(helper);
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| RegistryError::CredentialHelper(format!("{}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(hostname.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        // non-zero exit means no credentials for this host
        return Err(RegistryError::CredentialHelper(format!(
            "{}: exit {}",
            program,
            output.status.code().unwrap_or(-1)
        )));
    }
    let parsed: HelperOutput = serde_json::from_slice(&output.stdout)?;
    if parsed.username == TOKEN_USER {
        Ok(Credential {
            token: parsed.secret,
            ..Default::default()
        })
    } else {
        Ok(Credential {
            user: parsed.username,
            pass: parsed.secret,
            ..Default::default()
        })
    }
}

/// Run `docker-credential-<helper> list`, returning host -> username
pub async fn helper_list(helper: &str) -> Result<HashMap<String, String>> {
    let program = helper_program(helper);
    let output = Command::new(&program)
        .arg("list")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| RegistryError::CredentialHelper(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        return Err(RegistryError::CredentialHelper(format!(
            "{}: exit {}",
            program,
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn helper_program(helper: &str) -> String {
    if helper.starts_with("docker-credential-") {
        helper.to_string()
    } else {
        format!("docker-credential-{}", helper)
    }
}

/// config.json keys that may hold a hostname's credentials
fn registry_keys(hostname: &str) -> Vec<String> {
    match hostname {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => vec![
            "https://index.docker.io/v1/".to_string(),
            "docker.io".to_string(),
        ],
        h => vec![
            h.to_string(),
            format!("https://{}", h),
        ],
    }
}

/// Decode Docker auth entry to credentials
fn decode_docker_auth(entry: &DockerAuthEntry) -> Option<Credential> {
    if let Some(token) = &entry.identity_token {
        return Some(Credential {
            token: token.clone(),
            ..Default::default()
        });
    }

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Some(Credential {
            user: username.clone(),
            pass: password.clone(),
            ..Default::default()
        });
    }

    if let Some(auth) = &entry.auth {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(auth) {
            if let Ok(s) = String::from_utf8(decoded) {
                if let Some((username, password)) = s.split_once(':') {
                    return Some(Credential {
                        user: username.to_string(),
                        pass: password.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn test_decode_docker_auth() {
        let entry = DockerAuthEntry {
            auth: Some(b64("testuser:testpass")),
            ..Default::default()
        };
        let cred = decode_docker_auth(&entry).unwrap();
        assert_eq!(cred.user, "testuser");
        assert_eq!(cred.pass, "testpass");
        assert!(cred.token.is_empty());
    }

    #[test]
    fn test_decode_identity_token() {
        let entry = DockerAuthEntry {
            identity_token: Some("id-token".to_string()),
            auth: Some(b64("ignored:ignored")),
            ..Default::default()
        };
        let cred = decode_docker_auth(&entry).unwrap();
        assert!(cred.user.is_empty());
        assert_eq!(cred.token, "id-token");
    }

    #[test]
    fn test_registry_keys_hub_alias() {
        let keys = registry_keys("docker.io");
        assert!(keys.contains(&"https://index.docker.io/v1/".to_string()));
    }

    #[test]
    fn test_docker_config_lookup() {
        let json = format!(
            r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#,
            b64("user:pw")
        );
        let config: DockerConfig = serde_json::from_str(&json).unwrap();
        let cred = config.lookup("ghcr.io").unwrap();
        assert_eq!(cred.user, "user");
        assert!(config.lookup("other.example.com").is_none());
    }

    #[tokio::test]
    async fn test_inline_precedence() {
        let store = CredStore::empty();
        let mut host = HostConfig::new("reg.example.com");
        host.user = "inline".to_string();
        host.pass = "pw".to_string();
        let cred = store.resolve(&host).await;
        assert_eq!(cred.user, "inline");
    }

    #[tokio::test]
    async fn test_missing_helper_is_anonymous() {
        let store = CredStore::empty();
        let mut host = HostConfig::new("reg.example.com");
        host.cred_helper = "definitely-not-installed".to_string();
        let cred = store.resolve(&host).await;
        assert!(cred.is_empty());
    }
}
