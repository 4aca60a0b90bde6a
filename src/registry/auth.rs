//! Registry Authentication
//!
//! Implements the Docker registry token authentication flow:
//! 1. Request to registry returns 401 with WWW-Authenticate header
//! 2. Parse realm, service, and scope from header
//! 3. Request token from auth server
//! 4. Use token for subsequent requests
//!
//! Scopes accumulate per repository: once a push is attempted, later
//! tokens are fetched with `pull,push` so a session escalates without a
//! second challenge on every write.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::registry::{Credential, RegistryError, Result};

/// Fallback token lifetime when the server omits expires_in
const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(60);
/// Refresh slightly before the advertised expiry
const EXPIRY_LEEWAY: Duration = Duration::from_secs(5);

/// A parsed WWW-Authenticate challenge
#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    Basic {
        realm: String,
    },
    Bearer {
        realm: String,
        service: String,
        scope: Option<String>,
    },
}

/// Parse a WWW-Authenticate header into its challenges.
///
/// A header may carry several comma-separated challenges; parameters
/// are also comma-separated, so a new challenge starts at a scheme
/// keyword rather than at every comma.
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges = Vec::new();
    let mut scheme: Option<String> = None;
    let mut params: HashMap<String, String> = HashMap::new();

    let mut flush = |scheme: &Option<String>, params: &mut HashMap<String, String>| {
        let Some(s) = scheme else {
            return;
        };
        match s.as_str() {
            "basic" => {
                challenges.push(Challenge::Basic {
                    realm: params.remove("realm").unwrap_or_default(),
                });
            }
            "bearer" => {
                challenges.push(Challenge::Bearer {
                    realm: params.remove("realm").unwrap_or_default(),
                    service: params.remove("service").unwrap_or_default(),
                    scope: params.remove("scope"),
                });
            }
            _ => {}
        }
        params.clear();
    };

    for part in split_quoted(header) {
        let part = part.as_str();
        let (head, rest) = match part.split_once(' ') {
            Some((h, r)) => (h, Some(r.trim())),
            None => (part, None),
        };
        let lowered = head.to_ascii_lowercase();
        if (lowered == "basic" || lowered == "bearer") && !head.contains('=') {
            flush(&scheme, &mut params);
            scheme = Some(lowered);
            if let Some(rest) = rest {
                parse_param(rest, &mut params);
            }
        } else {
            parse_param(part, &mut params);
        }
    }
    flush(&scheme, &mut params);
    challenges
}

fn parse_param(s: &str, params: &mut HashMap<String, String>) {
    if let Some((key, value)) = s.split_once('=') {
        let value = value.trim().trim_matches('"');
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
    }
}

/// Split on commas outside quotes; quoted values may hold commas
/// (e.g. scope="repository:a/img:pull,push")
fn split_quoted(header: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in header.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                cur.push(c);
            }
            ',' if !in_quotes => {
                if !cur.trim().is_empty() {
                    parts.push(cur.trim().to_string());
                }
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur.trim().to_string());
    }
    parts
}

/// Pick the usable challenge: the first Bearer with a realm that parses
/// as an absolute URL, falling back to the first Basic.
pub fn select_challenge(challenges: &[Challenge]) -> Option<&Challenge> {
    challenges
        .iter()
        .find(|c| match c {
            Challenge::Bearer { realm, .. } => reqwest::Url::parse(realm).is_ok(),
            _ => false,
        })
        .or_else(|| {
            challenges
                .iter()
                .find(|c| matches!(c, Challenge::Basic { .. }))
        })
}

#[derive(Debug, Clone, PartialEq, Default)]
enum AuthMode {
    #[default]
    Anonymous,
    Basic,
    Bearer {
        realm: String,
        service: String,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Auth state for one host (or one repository when repoAuth is set)
pub struct HostAuth {
    http: reqwest::Client,
    cred: Credential,
    mode: Mutex<AuthMode>,
    /// Accumulated actions per scope resource, e.g.
    /// "repository:a/img" -> {"pull", "push"}
    scopes: Mutex<HashMap<String, BTreeSet<String>>>,
    /// Tokens keyed by (realm, service, sorted scopes)
    tokens: Mutex<HashMap<String, CachedToken>>,
    /// Scope keys that already failed once; a second identical failure
    /// means the credentials are exhausted
    failed: Mutex<HashSet<String>>,
}

impl HostAuth {
    pub fn new(http: reqwest::Client, cred: Credential) -> Self {
        Self {
            http,
            cred,
            mode: Mutex::new(AuthMode::Anonymous),
            scopes: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Record the scope a request implies, docker-client style:
    /// reads need pull, writes need pull,push.
    pub fn add_scope(&self, repository: &str, push: bool) {
        if repository.is_empty() {
            return;
        }
        let resource = format!("repository:{}", repository);
        let mut scopes = self.scopes.lock().unwrap();
        let actions = scopes.entry(resource).or_default();
        let before = actions.len();
        actions.insert("pull".to_string());
        if push {
            actions.insert("push".to_string());
        }
        if actions.len() != before {
            // widened scopes invalidate the failure memory
            self.failed.lock().unwrap().clear();
        }
    }

    /// Inject the Authorization header for the current auth state
    pub async fn apply(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            AuthMode::Anonymous => Ok(req),
            AuthMode::Basic => {
                if self.cred.user.is_empty() {
                    return Err(RegistryError::Unauthorized(
                        "basic auth required but no credentials configured".to_string(),
                    ));
                }
                Ok(req.basic_auth(&self.cred.user, Some(&self.cred.pass)))
            }
            AuthMode::Bearer { realm, service } => {
                let token = self.bearer_token(&realm, &service).await?;
                Ok(req.bearer_auth(token))
            }
        }
    }

    /// Process a 401 challenge. Returns true when the auth state
    /// advanced and the request should be retried on the same host.
    pub fn handle_challenge(&self, www_authenticate: &str) -> Result<bool> {
        let challenges = parse_challenges(www_authenticate);
        let Some(challenge) = select_challenge(&challenges) else {
            return Err(RegistryError::Unauthorized(format!(
                "unparsable challenge: {}",
                www_authenticate
            )));
        };

        match challenge {
            Challenge::Basic { .. } => {
                if self.cred.user.is_empty() {
                    return Ok(false);
                }
                let mut mode = self.mode.lock().unwrap();
                if *mode == AuthMode::Basic {
                    // credentials already presented and rejected
                    return Ok(false);
                }
                *mode = AuthMode::Basic;
                Ok(true)
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let new_mode = AuthMode::Bearer {
                    realm: realm.clone(),
                    service: service.clone(),
                };
                let mode_changed = {
                    let mut mode = self.mode.lock().unwrap();
                    let changed = *mode != new_mode;
                    *mode = new_mode;
                    changed
                };
                let scope_grew = match scope {
                    Some(s) => self.merge_challenge_scope(s),
                    None => false,
                };
                if mode_changed || scope_grew {
                    self.failed.lock().unwrap().clear();
                    return Ok(true);
                }
                // same mode, same scopes: allow one retry with a fresh
                // token in case the cached one expired server-side
                let key = self.cache_key(realm, service);
                let mut failed = self.failed.lock().unwrap();
                if failed.contains(&key) {
                    return Ok(false);
                }
                failed.insert(key.clone());
                self.tokens.lock().unwrap().remove(&key);
                Ok(true)
            }
        }
    }

    /// Merge a challenge's scope string; returns true when it added
    /// resources or actions not yet tracked.
    fn merge_challenge_scope(&self, scope: &str) -> bool {
        let mut grew = false;
        let mut scopes = self.scopes.lock().unwrap();
        for one in scope.split(' ').filter(|s| !s.is_empty()) {
            let Some((resource, actions)) = one.rsplit_once(':') else {
                continue;
            };
            let entry = scopes.entry(resource.to_string()).or_default();
            for action in actions.split(',').filter(|a| !a.is_empty()) {
                grew |= entry.insert(action.to_string());
            }
        }
        grew
    }

    /// All accumulated scopes in canonical sorted form
    fn scope_list(&self) -> Vec<String> {
        let scopes = self.scopes.lock().unwrap();
        let mut list: Vec<String> = scopes
            .iter()
            .map(|(resource, actions)| {
                let actions: Vec<&str> = actions.iter().map(String::as_str).collect();
                format!("{}:{}", resource, actions.join(","))
            })
            .collect();
        list.sort();
        list
    }

    fn cache_key(&self, realm: &str, service: &str) -> String {
        format!("{}|{}|{}", realm, service, self.scope_list().join(" "))
    }

    /// Return a cached bearer token or fetch a new one
    async fn bearer_token(&self, realm: &str, service: &str) -> Result<String> {
        let key = self.cache_key(realm, service);
        {
            let tokens = self.tokens.lock().unwrap();
            if let Some(cached) = tokens.get(&key) {
                if cached.is_valid() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let token = self.fetch_token(realm, service).await?;
        self.tokens.lock().unwrap().insert(key, token.clone());
        Ok(token.token)
    }

    async fn fetch_token(&self, realm: &str, service: &str) -> Result<CachedToken> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
            expires_in: Option<u64>,
            #[allow(dead_code)]
            issued_at: Option<String>,
        }

        let mut query: Vec<(&str, String)> = Vec::new();
        if !service.is_empty() {
            query.push(("service", service.to_string()));
        }
        for scope in self.scope_list() {
            query.push(("scope", scope));
        }

        let mut request = self.http.get(realm).query(&query);
        if !self.cred.user.is_empty() {
            request = request.basic_auth(&self.cred.user, Some(&self.cred.pass));
        } else if !self.cred.token.is_empty() {
            request = request.basic_auth("<token>", Some(&self.cred.token));
        }

        tracing::debug!(realm, service, "fetching bearer token");
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Unauthorized(format!(
                "token request failed: {}",
                response.status()
            )));
        }
        let parsed: TokenResponse = response.json().await?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .ok_or_else(|| RegistryError::Unauthorized("no token in response".to_string()))?;
        let ttl = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_EXPIRY);
        Ok(CachedToken {
            token,
            expires_at: Instant::now() + ttl.saturating_sub(EXPIRY_LEEWAY),
        })
    }
}
