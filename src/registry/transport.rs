//! Registry HTTP transport
//!
//! Sends distribution API requests with per-host policy: mirror
//! selection, retry with exponential backoff, bearer/basic auth,
//! token-bucket request throttling, TLS mode, and digest-verified
//! range-resumable response reading.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::image::{Digest, Digester};
use crate::registry::{
    CredStore, HostAuth, HostConfig, RegistryError, Result, TlsMode,
};

pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_DELAY_INIT: Duration = Duration::from_secs(1);
pub const DEFAULT_DELAY_MAX: Duration = Duration::from_secs(30);

/// A distribution API request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Host name the request targets (reference registry component)
    pub host: String,
    pub method: Method,
    /// Repository for path construction and auth scope; empty for
    /// registry-level endpoints like _catalog
    pub repository: String,
    /// Path under the repository (or under /v2 when repository is empty)
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Request body; kept as Bytes so retries can replay it
    pub body: Option<bytes::Bytes>,
    /// Expected digest of the response body, verified at EOF
    pub expect_digest: Option<Digest>,
    /// Bypass URL construction, e.g. blob CDN redirects or foreign layers
    pub direct_url: Option<Url>,
    /// Skip mirrors for this request (uploads must hit the upstream)
    pub no_mirrors: bool,
}

impl ApiRequest {
    pub fn new(host: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            method,
            repository: String::new(),
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            expect_digest: None,
            direct_url: None,
            no_mirrors: false,
        }
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: bytes::Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn expect_digest(mut self, digest: Digest) -> Self {
        self.expect_digest = Some(digest);
        self
    }

    pub fn direct_url(mut self, url: Url) -> Self {
        self.direct_url = Some(url);
        self
    }

    pub fn no_mirrors(mut self) -> Self {
        self.no_mirrors = true;
        self
    }

    /// Writes need push scope, reads only pull
    fn is_push(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }
}

/// Per-host token bucket gating request starts
struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(rate: f64, burst: u32) -> Self {
        let burst = (burst.max(1)) as f64;
        Self {
            rate,
            burst,
            state: Mutex::new((burst, Instant::now())),
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let (ref mut tokens, ref mut last) = *state;
                let now = Instant::now();
                *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.rate)
                    .min(self.burst);
                *last = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - *tokens) / self.rate)
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(RegistryError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    cur: u32,
    until: Option<Instant>,
}

/// Transport state for one host, created lazily on first use and
/// retained for the client lifetime
struct HostState {
    config: HostConfig,
    client: reqwest::Client,
    /// Shared auth, or per-repository when repoAuth is set
    auth: Arc<HostAuth>,
    repo_auth: Mutex<HashMap<String, Arc<HostAuth>>>,
    cred: crate::registry::Credential,
    backoff: Mutex<BackoffState>,
    limiter: Option<RateLimiter>,
}

impl HostState {
    fn auth_for(&self, repository: &str) -> Arc<HostAuth> {
        if !self.config.repo_auth || repository.is_empty() {
            return self.auth.clone();
        }
        let mut map = self.repo_auth.lock().unwrap();
        map.entry(repository.to_string())
            .or_insert_with(|| {
                Arc::new(HostAuth::new(self.client.clone(), self.cred.clone()))
            })
            .clone()
    }

    fn backoff_until(&self) -> Option<Instant> {
        self.backoff.lock().unwrap().until
    }

    /// Record a failure; returns the backoff-limit error once retries
    /// for this host are exhausted
    fn backoff_set(
        &self,
        retry_after: Option<Duration>,
        delay_init: Duration,
        delay_max: Duration,
        retry_limit: u32,
    ) -> Result<()> {
        let mut backoff = self.backoff.lock().unwrap();
        backoff.cur += 1;
        // Nth failure sleeps delay_init * 2^(N-1), capped at delay_max
        let mut sleep = delay_init
            .checked_mul(1u32 << (backoff.cur - 1).min(16))
            .unwrap_or(delay_max)
            .min(delay_max);
        if let Some(ra) = retry_after {
            sleep = ra.max(sleep).min(delay_max);
        }
        backoff.until = Some(Instant::now() + sleep);
        if backoff.cur >= retry_limit {
            return Err(RegistryError::BackoffLimit(self.config.name.clone()));
        }
        Ok(())
    }

    fn backoff_clear(&self, retry_limit: u32) {
        let mut backoff = self.backoff.lock().unwrap();
        if backoff.cur > retry_limit {
            backoff.cur = retry_limit;
        }
        if backoff.cur > 0 {
            backoff.cur -= 1;
            if backoff.cur == 0 {
                backoff.until = None;
            }
        }
    }
}

/// Builder for [`Transport`]
pub struct TransportBuilder {
    hosts: Vec<HostConfig>,
    cred_store: CredStore,
    retry_limit: u32,
    delay_init: Duration,
    delay_max: Duration,
    user_agent: String,
    root_cas: Vec<Vec<u8>>,
    ca_dirs: Vec<PathBuf>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            cred_store: CredStore::empty(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            delay_init: DEFAULT_DELAY_INIT,
            delay_max: DEFAULT_DELAY_MAX,
            user_agent: format!("regmirror/{}", env!("CARGO_PKG_VERSION")),
            root_cas: Vec::new(),
            ca_dirs: Vec::new(),
        }
    }
}

impl TransportBuilder {
    pub fn host(mut self, config: HostConfig) -> Self {
        self.hosts.push(config);
        self
    }

    pub fn hosts(mut self, configs: impl IntoIterator<Item = HostConfig>) -> Self {
        self.hosts.extend(configs);
        self
    }

    pub fn cred_store(mut self, store: CredStore) -> Self {
        self.cred_store = store;
        self
    }

    pub fn retry(mut self, limit: u32, delay_init: Duration, delay_max: Duration) -> Self {
        self.retry_limit = limit.max(1);
        self.delay_init = delay_init;
        self.delay_max = delay_max.max(delay_init);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn root_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.root_cas.push(pem);
        self
    }

    /// Directory holding `<hostname>/*.crt` host certificates
    pub fn ca_dir(mut self, dir: PathBuf) -> Self {
        self.ca_dirs.push(dir);
        self
    }

    pub fn build(self) -> Transport {
        let mut configs = HashMap::new();
        for host in self.hosts {
            if host.name.is_empty() {
                continue;
            }
            configs
                .entry(host.name.clone())
                .or_insert_with(|| HostConfig::new(&host.name))
                .merge(host);
        }
        Transport {
            configs: Mutex::new(configs),
            states: Mutex::new(HashMap::new()),
            cred_store: self.cred_store,
            retry_limit: self.retry_limit,
            delay_init: self.delay_init,
            delay_max: self.delay_max,
            user_agent: self.user_agent,
            root_cas: self.root_cas,
            ca_dirs: self.ca_dirs,
        }
    }
}

/// The registry HTTP engine
pub struct Transport {
    configs: Mutex<HashMap<String, HostConfig>>,
    states: Mutex<HashMap<String, Arc<HostState>>>,
    cred_store: CredStore,
    retry_limit: u32,
    delay_init: Duration,
    delay_max: Duration,
    user_agent: String,
    root_cas: Vec<Vec<u8>>,
    ca_dirs: Vec<PathBuf>,
}

/// What to do with the candidate host after a failed attempt
struct AttemptError {
    err: RegistryError,
    backoff: bool,
    drop_host: bool,
    retry_host: bool,
    retry_after: Option<Duration>,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    /// Host configuration as the transport sees it
    pub fn host_config(&self, name: &str) -> HostConfig {
        let configs = self.configs.lock().unwrap();
        configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| HostConfig::new(name))
    }

    async fn host_state(&self, name: &str) -> Result<Arc<HostState>> {
        if let Some(state) = self.states.lock().unwrap().get(name) {
            return Ok(state.clone());
        }
        // build outside the lock, credential helpers may block
        let config = self.host_config(name);
        let client = self.build_client(&config)?;
        let cred = self.cred_store.resolve(&config).await;
        let limiter = config
            .req_per_sec
            .filter(|r| *r > 0.0)
            .map(|r| RateLimiter::new(r, config.req_burst.unwrap_or(1)));
        let state = Arc::new(HostState {
            auth: Arc::new(HostAuth::new(client.clone(), cred.clone())),
            repo_auth: Mutex::new(HashMap::new()),
            cred,
            backoff: Mutex::new(BackoffState::default()),
            limiter,
            client,
            config,
        });
        let mut states = self.states.lock().unwrap();
        Ok(states.entry(name.to_string()).or_insert(state).clone())
    }

    /// Per-host client carrying the TLS policy and root CA set
    fn build_client(&self, config: &HostConfig) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(30));
        if config.tls == TlsMode::Insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        for pem in &self.root_cas {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        if !config.reg_cert.is_empty() {
            builder =
                builder.add_root_certificate(reqwest::Certificate::from_pem(config.reg_cert.as_bytes())?);
        }
        for dir in &self.ca_dirs {
            let host_dir = dir.join(config.hostname());
            let entries = match std::fs::read_dir(&host_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "crt") {
                    let pem = std::fs::read(&path)?;
                    builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
                }
            }
        }
        Ok(builder.build()?)
    }

    /// Send a request, trying mirrors and retrying per host policy
    pub async fn send(
        &self,
        req: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse> {
        let upstream = self.host_state(&req.host).await?;
        let mut hosts: Vec<Arc<HostState>> = Vec::with_capacity(1 + upstream.config.mirrors.len());
        if !req.no_mirrors && req.direct_url.is_none() {
            for mirror in upstream.config.mirrors.clone() {
                hosts.push(self.host_state(&mirror).await?);
            }
        }
        hosts.push(upstream.clone());
        sort_hosts(&mut hosts, &upstream.config.name);

        let mut cur = 0usize;
        let mut last_err: Option<RegistryError> = None;
        let mut all_not_found = true;
        loop {
            if hosts.is_empty() {
                return Err(match last_err {
                    Some(e) if all_not_found => e,
                    Some(e) if e.is_fatal() => e,
                    Some(e) => match e {
                        RegistryError::Unauthorized(_)
                        | RegistryError::UnsupportedApi(_)
                        | RegistryError::RateLimited(_) => e,
                        other => RegistryError::AllRequestsFailed(other.to_string()),
                    },
                    None => RegistryError::AllRequestsFailed("no hosts available".to_string()),
                });
            }
            if cur >= hosts.len() {
                cur = 0;
            }
            if cancel.is_cancelled() {
                return Err(RegistryError::Canceled);
            }
            let host = hosts[cur].clone();
            match self.attempt(&req, &host, cancel).await {
                Ok(resp) => {
                    host.backoff_clear(self.retry_limit);
                    return Ok(resp);
                }
                Err(attempt) => {
                    if attempt.err.is_fatal() {
                        return Err(attempt.err);
                    }
                    all_not_found &=
                        matches!(attempt.err, RegistryError::NotFound(_));
                    tracing::debug!(
                        host = %host.config.name,
                        error = %attempt.err,
                        "request attempt failed"
                    );
                    let mut drop_host = attempt.drop_host;
                    if attempt.backoff {
                        if host
                            .backoff_set(
                                attempt.retry_after,
                                self.delay_init,
                                self.delay_max,
                                self.retry_limit,
                            )
                            .is_err()
                        {
                            drop_host = true;
                        }
                    }
                    last_err = Some(attempt.err);
                    if drop_host {
                        hosts.remove(cur);
                    } else if !attempt.retry_host {
                        cur += 1;
                    }
                }
            }
        }
    }

    /// One request against one candidate host
    async fn attempt(
        &self,
        req: &ApiRequest,
        host: &Arc<HostState>,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransportResponse, AttemptError> {
        let fail = |err, backoff, drop_host, retry_host| AttemptError {
            err,
            backoff,
            drop_host,
            retry_host,
            retry_after: None,
        };

        if req.method == Method::HEAD && host.config.api_opt("disableHead") {
            return Err(fail(
                RegistryError::UnsupportedApi(format!(
                    "HEAD disabled for host {}",
                    host.config.name
                )),
                false,
                true,
                false,
            ));
        }

        // wait out an active backoff window
        if let Some(until) = host.backoff_until() {
            let now = Instant::now();
            if until > now {
                tracing::warn!(
                    host = %host.config.name,
                    seconds = (until - now).as_secs_f64(),
                    "sleeping for backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(fail(RegistryError::Canceled, false, false, false));
                    }
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(until)) => {}
                }
            }
        }

        // token bucket gates the request start, not the bytes
        if let Some(limiter) = &host.limiter {
            if let Err(e) = limiter.acquire(cancel).await {
                return Err(fail(e, false, false, false));
            }
        }

        let url = match &req.direct_url {
            Some(u) => u.clone(),
            None => match build_url(&host.config, req) {
                Ok(u) => u,
                Err(e) => return Err(fail(e, false, true, false)),
            },
        };

        let mut builder = host.client.request(req.method.clone(), url.clone());
        for (key, value) in &req.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let auth = host.auth_for(&req.repository);
        auth.add_scope(&req.repository, req.is_push());
        builder = match auth.apply(builder).await {
            Ok(b) => b,
            Err(e) => return Err(fail(e, true, false, false)),
        };

        tracing::debug!(method = %req.method, url = %url, "http request");
        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                // DNS/connect/TLS level failure
                return Err(fail(RegistryError::Http(e), true, false, false));
            }
        };

        let status = resp.status();
        if status.is_success() {
            let caller_range = req
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(RANGE.as_str()));
            return Ok(TransportResponse::new(
                resp,
                url,
                host.clone(),
                auth,
                req.method.clone(),
                req.expect_digest.clone(),
                caller_range,
            ));
        }

        match status {
            StatusCode::UNAUTHORIZED => {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string);
                match challenge {
                    Some(header) => match auth.handle_challenge(&header) {
                        Ok(true) => Err(fail(
                            RegistryError::Unauthorized("authentication required".to_string()),
                            false,
                            false,
                            true,
                        )),
                        Ok(false) => Err(fail(
                            RegistryError::Unauthorized(format!(
                                "credentials exhausted for {}",
                                host.config.name
                            )),
                            false,
                            true,
                            false,
                        )),
                        Err(e) => Err(fail(e, true, true, false)),
                    },
                    None => Err(fail(
                        RegistryError::Unauthorized("401 without challenge".to_string()),
                        true,
                        true,
                        false,
                    )),
                }
            }
            StatusCode::NOT_FOUND => Err(fail(
                RegistryError::NotFound(url.to_string()),
                false,
                true,
                false,
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(AttemptError {
                    err: RegistryError::RateLimited(url.to_string()),
                    backoff: true,
                    drop_host: false,
                    retry_host: false,
                    retry_after,
                })
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(fail(
                RegistryError::HttpStatus {
                    status,
                    body: String::new(),
                },
                true,
                false,
                false,
            )),
            s if s.is_server_error() => Err(fail(
                RegistryError::HttpStatus {
                    status,
                    body: read_error_body(resp).await,
                },
                true,
                false,
                false,
            )),
            _ => Err(fail(
                RegistryError::HttpStatus {
                    status,
                    body: read_error_body(resp).await,
                },
                true,
                true,
                false,
            )),
        }
    }
}

async fn read_error_body(resp: reqwest::Response) -> String {
    let body = resp.text().await.unwrap_or_default();
    body.chars().take(512).collect()
}

/// `scheme://hostname/v2[/prefix]/<repository>/<path>`
fn build_url(config: &HostConfig, req: &ApiRequest) -> Result<Url> {
    let scheme = if config.tls == TlsMode::Disabled {
        "http"
    } else {
        "https"
    };
    let mut path = String::from("/v2");
    if !config.path_prefix.is_empty() {
        path.push('/');
        path.push_str(&config.path_prefix);
    }
    if !req.repository.is_empty() {
        path.push('/');
        path.push_str(&req.repository);
    }
    path.push('/');
    path.push_str(&req.path);

    let mut url = Url::parse(&format!("{}://{}{}", scheme, config.hostname(), path))
        .map_err(|e| RegistryError::AllRequestsFailed(format!("bad url: {}", e)))?;
    if !req.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &req.query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Sort candidates: hosts in active backoff by soonest availability,
/// then ascending priority, with the upstream host last
fn sort_hosts(hosts: &mut [Arc<HostState>], upstream: &str) {
    let now = Instant::now();
    let any_backoff = hosts
        .iter()
        .any(|h| h.backoff_until().is_some_and(|u| u > now));
    hosts.sort_by(|a, b| {
        if any_backoff {
            let au = a.backoff_until().unwrap_or(now);
            let bu = b.backoff_until().unwrap_or(now);
            if au != bu {
                return au.cmp(&bu);
            }
        }
        let pri = a.config.priority.cmp(&b.config.priority);
        if pri != std::cmp::Ordering::Equal {
            return pri;
        }
        (a.config.name == upstream).cmp(&(b.config.name == upstream))
    });
}

/// Consecutive zero-progress resume attempts tolerated on short reads
const RESUME_LIMIT: u32 = 3;

/// A successful response with digest verification and short-read resume
pub struct TransportResponse {
    resp: reqwest::Response,
    url: Url,
    host: Arc<HostState>,
    auth: Arc<HostAuth>,
    method: Method,
    status: StatusCode,
    headers: HeaderMap,
    digester: Option<Digester>,
    expect: Option<Digest>,
    read_cur: u64,
    read_max: Option<u64>,
    stalled_resumes: u32,
    done: bool,
}

impl TransportResponse {
    fn new(
        resp: reqwest::Response,
        url: Url,
        host: Arc<HostState>,
        auth: Arc<HostAuth>,
        method: Method,
        expect: Option<Digest>,
        caller_range: bool,
    ) -> Self {
        let status = resp.status();
        let headers = resp.headers().clone();
        let read_max = headers
            .get(CONTENT_LENGTH)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        // the digest is only meaningful over a full read from offset 0;
        // hash with the expected digest's algorithm when one is set
        let digester = if caller_range {
            None
        } else {
            Some(match &expect {
                Some(d) => Digester::new(d.algorithm()),
                None => Digester::canonical(),
            })
        };
        Self {
            resp,
            url,
            host,
            auth,
            status,
            headers,
            digester,
            expect,
            read_cur: 0,
            read_max,
            stalled_resumes: 0,
            done: method == Method::HEAD,
            method,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// URL the successful attempt was sent to (mirror or upstream)
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.read_max
    }

    /// Next chunk of the body. Short reads are resumed with a range
    /// request into the same digester; at clean EOF the digest is
    /// verified against the expected value (never for HEAD).
    pub async fn chunk(&mut self) -> Result<Option<bytes::Bytes>> {
        loop {
            if self.done {
                return Ok(None);
            }
            match self.resp.chunk().await {
                Ok(Some(chunk)) => {
                    self.read_cur += chunk.len() as u64;
                    if !chunk.is_empty() {
                        self.stalled_resumes = 0;
                    }
                    if let Some(digester) = &mut self.digester {
                        digester.update(&chunk);
                    }
                    return Ok(Some(chunk));
                }
                Ok(None) => {
                    match self.read_max {
                        Some(max) if self.read_cur < max => {
                            // short read, pick up where the stream ended
                            self.resume().await?;
                        }
                        _ => {
                            self.done = true;
                            self.verify()?;
                            return Ok(None);
                        }
                    }
                }
                Err(e) => {
                    // a broken body stream is resumable like an early EOF
                    match self.read_max {
                        Some(max) if self.read_cur < max => {
                            tracing::debug!(error = %e, "body stream failed, resuming");
                            self.resume().await?;
                        }
                        _ => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Issue a range request to the same URL and continue reading
    async fn resume(&mut self) -> Result<()> {
        let Some(max) = self.read_max else {
            return Err(RegistryError::AllRequestsFailed(
                "cannot resume without content length".to_string(),
            ));
        };
        self.stalled_resumes += 1;
        if self.stalled_resumes > RESUME_LIMIT {
            return Err(RegistryError::AllRequestsFailed(format!(
                "read of {} stalled at {}/{}",
                self.url, self.read_cur, max
            )));
        }
        tracing::debug!(
            url = %self.url,
            cur = self.read_cur,
            max,
            "short read, resuming with range request"
        );
        let builder = self
            .host
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={}-{}", self.read_cur, max - 1));
        let builder = self.auth.apply(builder).await?;
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::HttpStatus {
                status: resp.status(),
                body: String::new(),
            });
        }
        if resp.headers().get(CONTENT_RANGE).is_none() {
            return Err(RegistryError::UnsupportedApi(
                "range request not supported by server".to_string(),
            ));
        }
        self.resp = resp;
        Ok(())
    }

    fn verify(&mut self) -> Result<()> {
        if self.method == Method::HEAD {
            return Ok(());
        }
        let (Some(expect), Some(digester)) = (self.expect.take(), self.digester.take()) else {
            return Ok(());
        };
        let computed = digester.finalize();
        if computed != expect {
            tracing::warn!(expected = %expect, computed = %computed, "digest mismatch");
            return Err(RegistryError::DigestMismatch {
                expected: expect.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }

    /// Read and verify the whole body
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.read_max.unwrap_or(0) as usize);
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_burst_then_throttle() {
        let limiter = RateLimiter::new(1000.0, 2);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire(&cancel).await.unwrap();
        }
        // two from the burst, two at ~1ms each
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_rate_limiter_cancel() {
        let limiter = RateLimiter::new(0.001, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, RegistryError::Canceled));
    }

    #[test]
    fn test_build_url() {
        let mut config = HostConfig::new("reg.example.com");
        let req = ApiRequest::new("reg.example.com", Method::GET, "manifests/latest")
            .repository("a/img");
        let url = build_url(&config, &req).unwrap();
        assert_eq!(
            url.as_str(),
            "https://reg.example.com/v2/a/img/manifests/latest"
        );

        config.tls = TlsMode::Disabled;
        config.path_prefix = "hub".to_string();
        let url = build_url(&config, &req).unwrap();
        assert_eq!(
            url.as_str(),
            "http://reg.example.com/v2/hub/a/img/manifests/latest"
        );
    }

    #[test]
    fn test_build_url_query_and_no_repo() {
        let config = HostConfig::new("reg.example.com");
        let req = ApiRequest::new("reg.example.com", Method::GET, "_catalog")
            .query("n", "100")
            .query("last", "repo1");
        let url = build_url(&config, &req).unwrap();
        assert_eq!(
            url.as_str(),
            "https://reg.example.com/v2/_catalog?n=100&last=repo1"
        );
    }

    #[test]
    fn test_backoff_arithmetic() {
        let state = HostState {
            config: HostConfig::new("reg.example.com"),
            client: reqwest::Client::new(),
            auth: Arc::new(HostAuth::new(
                reqwest::Client::new(),
                crate::registry::Credential::default(),
            )),
            repo_auth: Mutex::new(HashMap::new()),
            cred: crate::registry::Credential::default(),
            backoff: Mutex::new(BackoffState::default()),
            limiter: None,
        };
        let init = Duration::from_millis(100);
        let max = Duration::from_millis(1000);

        // first backoff: 100ms * 2^0
        state.backoff_set(None, init, max, 3).unwrap();
        {
            let b = state.backoff.lock().unwrap();
            assert_eq!(b.cur, 1);
            let sleep = b.until.unwrap() - Instant::now();
            assert!(sleep <= Duration::from_millis(100));
            assert!(sleep > Duration::from_millis(50));
        }

        // second: 200ms
        state.backoff_set(None, init, max, 3).unwrap();
        // third reaches the retry limit
        assert!(matches!(
            state.backoff_set(None, init, max, 3),
            Err(RegistryError::BackoffLimit(_))
        ));
        // capped at delay_max regardless of the exponent
        let b = state.backoff.lock().unwrap();
        assert!(b.until.unwrap() - Instant::now() <= max);
    }

    #[test]
    fn test_backoff_retry_after_override() {
        let state = HostState {
            config: HostConfig::new("reg.example.com"),
            client: reqwest::Client::new(),
            auth: Arc::new(HostAuth::new(
                reqwest::Client::new(),
                crate::registry::Credential::default(),
            )),
            repo_auth: Mutex::new(HashMap::new()),
            cred: crate::registry::Credential::default(),
            backoff: Mutex::new(BackoffState::default()),
            limiter: None,
        };
        let init = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        state
            .backoff_set(Some(Duration::from_secs(2)), init, max, 10)
            .unwrap();
        let b = state.backoff.lock().unwrap();
        let sleep = b.until.unwrap() - Instant::now();
        // Retry-After wins over the smaller exponential delay
        assert!(sleep > Duration::from_millis(1900));
        assert!(sleep <= max);
    }

    #[test]
    fn test_backoff_clear_decrements() {
        let state = HostState {
            config: HostConfig::new("reg.example.com"),
            client: reqwest::Client::new(),
            auth: Arc::new(HostAuth::new(
                reqwest::Client::new(),
                crate::registry::Credential::default(),
            )),
            repo_auth: Mutex::new(HashMap::new()),
            cred: crate::registry::Credential::default(),
            backoff: Mutex::new(BackoffState::default()),
            limiter: None,
        };
        let init = Duration::from_millis(10);
        let max = Duration::from_millis(100);
        state.backoff_set(None, init, max, 5).unwrap();
        state.backoff_set(None, init, max, 5).unwrap();
        state.backoff_clear(5);
        assert_eq!(state.backoff.lock().unwrap().cur, 1);
        state.backoff_clear(5);
        let b = state.backoff.lock().unwrap();
        assert_eq!(b.cur, 0);
        assert!(b.until.is_none());
    }

    #[test]
    fn test_is_push_by_method() {
        for (method, push) in [
            (Method::GET, false),
            (Method::HEAD, false),
            (Method::PUT, true),
            (Method::POST, true),
            (Method::PATCH, true),
            (Method::DELETE, true),
        ] {
            let req = ApiRequest::new("reg", method, "blobs/uploads/");
            assert_eq!(req.is_push(), push);
        }
    }
}
