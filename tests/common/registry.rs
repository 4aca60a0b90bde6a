//! In-process mock registry for integration tests
//!
//! Serves enough of the distribution API to exercise the client:
//! manifests, blobs, upload sessions, cross-repo mounts, tag listings,
//! bearer auth with scope checks, and per-response rate limit headers.
//! Every request is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex};

use regmirror::image::Digest;
use tiny_http::{Header, Method, Response, Server};

fn header(key: &str, value: &str) -> Header {
    Header::from_bytes(key.as_bytes(), value.as_bytes()).unwrap()
}

#[derive(Default)]
pub struct RegistryState {
    /// (repo, digest string) -> bytes
    pub blobs: HashMap<(String, String), Vec<u8>>,
    /// (repo, tag or digest string) -> (media type, bytes)
    pub manifests: HashMap<(String, String), (String, Vec<u8>)>,
    /// open upload sessions
    uploads: HashMap<String, (String, Vec<u8>)>,
    upload_seq: u64,
    /// "METHOD path?query" for every request seen
    pub log: Vec<String>,
    /// require bearer tokens for /v2 requests
    pub require_auth: bool,
    /// scope strings granted via the token endpoint, in order
    pub tokens_issued: Vec<String>,
    /// values served as RateLimit-Remaining on manifest requests
    pub ratelimit_remaining: VecDeque<u64>,
    /// mount requests answered with 202 instead of 201
    pub refuse_mounts: bool,
    /// one-shot 503s per path substring
    pub fail_once: Vec<String>,
}

impl RegistryState {
    /// Store a manifest under a tag and its digest
    pub fn put_manifest(&mut self, repo: &str, tag: Option<&str>, media_type: &str, body: &[u8]) {
        let digest = Digest::from_bytes(body).to_string();
        if let Some(tag) = tag {
            self.manifests.insert(
                (repo.to_string(), tag.to_string()),
                (media_type.to_string(), body.to_vec()),
            );
        }
        self.manifests
            .insert((repo.to_string(), digest), (media_type.to_string(), body.to_vec()));
    }

    pub fn put_blob(&mut self, repo: &str, body: &[u8]) -> String {
        let digest = Digest::from_bytes(body).to_string();
        self.blobs
            .insert((repo.to_string(), digest.clone()), body.to_vec());
        digest
    }

    pub fn requests_matching(&self, pattern: &str) -> Vec<String> {
        self.log
            .iter()
            .filter(|line| line.contains(pattern))
            .cloned()
            .collect()
    }
}

pub struct MockRegistry {
    pub port: u16,
    pub state: Arc<Mutex<RegistryState>>,
}

impl MockRegistry {
    pub fn spawn() -> Self {
        Self::spawn_with(RegistryState::default())
    }

    pub fn spawn_with(state: RegistryState) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind mock registry");
        let port = server.server_addr().to_ip().unwrap().port();
        let state = Arc::new(Mutex::new(state));
        let thread_state = state.clone();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                handle(port, &thread_state, request);
            }
        });
        Self { port, state }
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

fn handle(port: u16, state: &Arc<Mutex<RegistryState>>, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let raw_url = request.url().to_string();
    let mut body = Vec::new();
    let _ = request.as_reader().read_to_end(&mut body);

    let base = url::Url::parse("http://0").unwrap();
    let parsed = url::Url::options()
        .base_url(Some(&base))
        .parse(&raw_url)
        .unwrap();
    let path = parsed.path().to_string();
    let query: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let authorization = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("authorization"))
        .map(|h| h.value.to_string());
    let range = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("range"))
        .map(|h| h.value.to_string());

    let response = {
        let mut st = state.lock().unwrap();
        st.log.push(format!("{} {}", method, raw_url));
        route(port, &mut st, &method, &path, &query, &body, authorization, range)
    };

    let _ = request.respond(response);
}

type BoxedResponse = Response<Box<dyn Read + Send>>;

fn boxed(resp: Response<std::io::Cursor<Vec<u8>>>) -> BoxedResponse {
    resp.boxed()
}

#[allow(clippy::too_many_arguments)]
fn route(
    port: u16,
    st: &mut RegistryState,
    method: &Method,
    path: &str,
    query: &[(String, String)],
    body: &[u8],
    authorization: Option<String>,
    range: Option<String>,
) -> BoxedResponse {
    // one-shot failures for mirror/backoff tests
    if let Some(pos) = st.fail_once.iter().position(|p| path.contains(p.as_str())) {
        st.fail_once.remove(pos);
        return boxed(Response::from_data(b"unavailable".to_vec()).with_status_code(503));
    }

    // the token endpoint itself is unauthenticated
    if path == "/token" {
        let scopes: Vec<String> = query
            .iter()
            .filter(|(k, _)| k == "scope")
            .map(|(_, v)| v.clone())
            .collect();
        let joined = scopes.join(" ");
        st.tokens_issued.push(joined.clone());
        let json = format!(
            r#"{{"token": "tok {}", "expires_in": 300}}"#,
            joined
        );
        return boxed(
            Response::from_data(json.into_bytes())
                .with_header(header("Content-Type", "application/json")),
        );
    }

    let Some((repo, op)) = split_repo_path(path) else {
        return boxed(Response::from_data(b"bad path".to_vec()).with_status_code(404));
    };

    if st.require_auth {
        let needed = if matches!(method, Method::Get | Method::Head) {
            format!("repository:{}:pull", repo)
        } else {
            format!("repository:{}:pull,push", repo)
        };
        let authorized = authorization
            .as_deref()
            .and_then(|a| a.strip_prefix("Bearer tok "))
            .is_some_and(|granted| {
                granted.split(' ').any(|scope| scope_covers(scope, &needed))
            });
        if !authorized {
            let challenge = format!(
                r#"Bearer realm="http://127.0.0.1:{}/token",service="mock",scope="{}""#,
                port, needed
            );
            return boxed(
                Response::from_data(b"unauthorized".to_vec())
                    .with_status_code(401)
                    .with_header(header("WWW-Authenticate", &challenge)),
            );
        }
    }

    match op {
        RepoOp::Manifest(reference) => match method {
            Method::Head => match st.manifests.get(&(repo.clone(), reference.clone())) {
                Some((mt, data)) => {
                    let digest = Digest::from_bytes(data).to_string();
                    let mut resp = Response::from_data(Vec::new())
                        .with_header(header("Docker-Content-Digest", &digest))
                        .with_header(header("Content-Type", mt));
                    if let Some(remain) = st.ratelimit_remaining.pop_front() {
                        resp = resp
                            .with_header(header("RateLimit-Remaining", &format!("{};w=21600", remain)));
                    }
                    boxed(resp)
                }
                None => boxed(Response::from_data(Vec::new()).with_status_code(404)),
            },
            Method::Get => match st.manifests.get(&(repo.clone(), reference.clone())) {
                Some((mt, data)) => {
                    let digest = Digest::from_bytes(data).to_string();
                    let mut resp = Response::from_data(data.clone())
                        .with_header(header("Docker-Content-Digest", &digest))
                        .with_header(header("Content-Type", mt));
                    if let Some(remain) = st.ratelimit_remaining.pop_front() {
                        resp = resp
                            .with_header(header("RateLimit-Remaining", &format!("{};w=21600", remain)));
                    }
                    boxed(resp)
                }
                None => boxed(Response::from_data(Vec::new()).with_status_code(404)),
            },
            Method::Put => {
                let mt = "application/vnd.oci.image.manifest.v1+json";
                st.put_manifest(&repo, Some(&reference), mt, body);
                let digest = Digest::from_bytes(body).to_string();
                boxed(
                    Response::from_data(Vec::new())
                        .with_status_code(201)
                        .with_header(header("Docker-Content-Digest", &digest)),
                )
            }
            Method::Delete => {
                match st.manifests.remove(&(repo.clone(), reference.clone())) {
                    Some(_) => boxed(Response::from_data(Vec::new()).with_status_code(202)),
                    None => boxed(Response::from_data(Vec::new()).with_status_code(404)),
                }
            }
            _ => boxed(Response::from_data(Vec::new()).with_status_code(405)),
        },
        RepoOp::Blob(digest) => match method {
            Method::Head => match st.blobs.get(&(repo.clone(), digest.clone())) {
                Some(data) => boxed(
                    Response::from_data(Vec::new())
                        .with_header(header("Content-Length-Hint", &data.len().to_string())),
                ),
                None => boxed(Response::from_data(Vec::new()).with_status_code(404)),
            },
            Method::Get => match st.blobs.get(&(repo.clone(), digest.clone())) {
                Some(data) => match range {
                    Some(range) => {
                        let (start, end) = parse_range(&range, data.len());
                        let slice = data[start..=end].to_vec();
                        boxed(
                            Response::from_data(slice)
                                .with_status_code(206)
                                .with_header(header(
                                    "Content-Range",
                                    &format!("bytes {}-{}/{}", start, end, data.len()),
                                )),
                        )
                    }
                    None => boxed(Response::from_data(data.clone())),
                },
                None => boxed(Response::from_data(Vec::new()).with_status_code(404)),
            },
            _ => boxed(Response::from_data(Vec::new()).with_status_code(405)),
        },
        RepoOp::UploadStart => {
            let mount = query.iter().find(|(k, _)| k == "mount").map(|(_, v)| v.clone());
            let from = query.iter().find(|(k, _)| k == "from").map(|(_, v)| v.clone());
            if let (Some(mount), Some(from)) = (mount, from) {
                if !st.refuse_mounts {
                    if let Some(data) = st.blobs.get(&(from, mount.clone())).cloned() {
                        st.blobs.insert((repo.clone(), mount.clone()), data);
                        return boxed(
                            Response::from_data(Vec::new())
                                .with_status_code(201)
                                .with_header(header(
                                    "Location",
                                    &format!("/v2/{}/blobs/{}", repo, mount),
                                )),
                        );
                    }
                }
            }
            st.upload_seq += 1;
            let session = format!("session-{}", st.upload_seq);
            st.uploads.insert(session.clone(), (repo.clone(), Vec::new()));
            boxed(
                Response::from_data(Vec::new())
                    .with_status_code(202)
                    .with_header(header(
                        "Location",
                        &format!("/v2/{}/blobs/uploads/{}", repo, session),
                    )),
            )
        }
        RepoOp::UploadSession(session) => match method {
            Method::Patch => {
                let Some((_, buffer)) = st.uploads.get_mut(&session) else {
                    return boxed(Response::from_data(Vec::new()).with_status_code(404));
                };
                buffer.extend_from_slice(body);
                boxed(
                    Response::from_data(Vec::new())
                        .with_status_code(202)
                        .with_header(header(
                            "Location",
                            &format!("/v2/{}/blobs/uploads/{}", repo, session),
                        )),
                )
            }
            Method::Put => {
                let Some((upload_repo, mut buffer)) = st.uploads.remove(&session) else {
                    return boxed(Response::from_data(Vec::new()).with_status_code(404));
                };
                buffer.extend_from_slice(body);
                let computed = Digest::from_bytes(&buffer).to_string();
                let expected = query
                    .iter()
                    .find(|(k, _)| k == "digest")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                if computed != expected {
                    return boxed(Response::from_data(Vec::new()).with_status_code(400));
                }
                st.blobs.insert((upload_repo, computed.clone()), buffer);
                boxed(
                    Response::from_data(Vec::new())
                        .with_status_code(201)
                        .with_header(header("Docker-Content-Digest", &computed)),
                )
            }
            _ => boxed(Response::from_data(Vec::new()).with_status_code(405)),
        },
        RepoOp::TagList => {
            let mut tags: Vec<String> = st
                .manifests
                .keys()
                .filter(|(r, reference)| r == &repo && !reference.contains(':'))
                .map(|(_, reference)| reference.clone())
                .collect();
            tags.sort();
            let json = serde_json::json!({"name": repo, "tags": tags});
            boxed(
                Response::from_data(json.to_string().into_bytes())
                    .with_header(header("Content-Type", "application/json")),
            )
        }
        RepoOp::Referrers(_) => boxed(Response::from_data(Vec::new()).with_status_code(404)),
    }
}

enum RepoOp {
    Manifest(String),
    Blob(String),
    UploadStart,
    UploadSession(String),
    TagList,
    Referrers(String),
}

/// Split "/v2/<repo>/<op>" into the repository and operation
fn split_repo_path(path: &str) -> Option<(String, RepoOp)> {
    let rest = path.strip_prefix("/v2/")?;
    if let Some((repo, reference)) = rest.split_once("/manifests/") {
        return Some((repo.to_string(), RepoOp::Manifest(reference.to_string())));
    }
    if let Some((repo, tail)) = rest.split_once("/blobs/uploads") {
        let session = tail.trim_start_matches('/');
        if session.is_empty() {
            return Some((repo.to_string(), RepoOp::UploadStart));
        }
        return Some((repo.to_string(), RepoOp::UploadSession(session.to_string())));
    }
    if let Some((repo, digest)) = rest.split_once("/blobs/") {
        return Some((repo.to_string(), RepoOp::Blob(digest.to_string())));
    }
    if let Some((repo, digest)) = rest.split_once("/referrers/") {
        return Some((repo.to_string(), RepoOp::Referrers(digest.to_string())));
    }
    if let Some(repo) = rest.strip_suffix("/tags/list") {
        return Some((repo.to_string(), RepoOp::TagList));
    }
    None
}

/// True when a granted scope satisfies a needed scope
fn scope_covers(granted: &str, needed: &str) -> bool {
    let Some((g_resource, g_actions)) = granted.rsplit_once(':') else {
        return false;
    };
    let Some((n_resource, n_actions)) = needed.rsplit_once(':') else {
        return false;
    };
    g_resource == n_resource
        && n_actions
            .split(',')
            .all(|action| g_actions.split(',').any(|g| g == action))
}

/// Parse "bytes=start-end" against a known length
fn parse_range(range: &str, len: usize) -> (usize, usize) {
    let spec = range.trim_start_matches("bytes=");
    let (start, end) = spec.split_once('-').unwrap_or((spec, ""));
    let start: usize = start.parse().unwrap_or(0);
    let end: usize = end.parse().unwrap_or(len - 1).min(len - 1);
    (start, end)
}
