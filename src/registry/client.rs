//! Registry scheme
//!
//! Maps the blob/manifest/tag operations of the distribution API onto
//! the transport: upload sessions, cross-repo mounts, paginated
//! listings, and the referrers API.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::image::{accept_manifest_types, Descriptor, Digest, Manifest, Reference};
use crate::registry::{ApiRequest, RegistryError, Result, Transport};
use crate::scheme::{Blob, ManifestHead};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const OCTET_STREAM: &str = "application/octet-stream";

/// Upload chunk size when the host does not configure one
const DEFAULT_BLOB_CHUNK: u64 = 1024 * 1024;
const MIN_BLOB_CHUNK: u64 = 64 * 1024;
/// Largest blob sent as a single request
const DEFAULT_BLOB_MAX: u64 = 512 * 1024 * 1024;

/// Source rate limit reported by registry response headers
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remain: Option<u64>,
}

impl RateLimitInfo {
    fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let parse = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                // values may carry a window suffix: "100;w=21600"
                .and_then(|v| v.split(';').next())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let info = Self {
            limit: parse("ratelimit-limit"),
            remain: parse("ratelimit-remaining"),
        };
        info.remain.is_some().then_some(info)
    }
}

/// Registry-backed scheme over the HTTP transport
pub struct RegistryScheme {
    transport: Arc<Transport>,
}

impl RegistryScheme {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Verify a blob exists; falls back to GET when HEAD is disabled
    /// for the host
    pub async fn blob_head(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let req = ApiRequest::new(&r.registry, Method::HEAD, format!("blobs/{}", d))
            .repository(&r.repository);
        let resp = match self.transport.send(req, cancel).await {
            Ok(resp) => resp,
            Err(RegistryError::UnsupportedApi(_)) => {
                let req = ApiRequest::new(&r.registry, Method::GET, format!("blobs/{}", d))
                    .repository(&r.repository);
                // headers are enough, drop the body unread
                self.transport.send(req, cancel).await?
            }
            Err(e) => return Err(e),
        };
        Ok(resp.content_length().unwrap_or(0))
    }

    /// Open a verified streaming read of a blob
    pub async fn blob_get(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        let req = ApiRequest::new(&r.registry, Method::GET, format!("blobs/{}", d))
            .repository(&r.repository)
            .expect_digest(d.clone());
        let resp = self.transport.send(req, cancel).await?;
        Ok(Blob::from_response(resp))
    }

    /// Fetch an external (foreign) layer from one of its URLs
    pub async fn blob_get_url(
        &self,
        r: &Reference,
        d: &Digest,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        let mut last_err = None;
        for url in urls {
            let parsed = match Url::parse(url) {
                Ok(u) => u,
                Err(e) => {
                    last_err = Some(RegistryError::InvalidInput(format!("bad layer url: {}", e)));
                    continue;
                }
            };
            let req = ApiRequest::new(&r.registry, Method::GET, String::new())
                .repository(&r.repository)
                .expect_digest(d.clone())
                .direct_url(parsed)
                .no_mirrors();
            match self.transport.send(req, cancel).await {
                Ok(resp) => return Ok(Blob::from_response(resp)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| RegistryError::NotFound(format!("no usable url for {}", d))))
    }

    /// Delete a blob from a repository
    pub async fn blob_delete(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let req = ApiRequest::new(&r.registry, Method::DELETE, format!("blobs/{}", d))
            .repository(&r.repository)
            .no_mirrors();
        self.transport.send(req, cancel).await?;
        Ok(())
    }

    /// Ask the registry to mount a blob from another repository.
    /// Only a 201 means the mount happened; a 202 opens an upload
    /// session which is abandoned in favor of a fresh upload.
    pub async fn blob_mount(
        &self,
        src: &Reference,
        tgt: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let req = ApiRequest::new(&tgt.registry, Method::POST, "blobs/uploads/".to_string())
            .repository(&tgt.repository)
            .query("mount", d.to_string())
            .query("from", src.repository.clone())
            .no_mirrors();
        let resp = self.transport.send(req, cancel).await?;
        if resp.status() == StatusCode::CREATED {
            return Ok(());
        }
        Err(RegistryError::UnsupportedApi(format!(
            "mount refused with status {}",
            resp.status()
        )))
    }

    /// Upload a blob: single POST+PUT when it fits in memory, chunked
    /// PATCH session otherwise
    pub async fn blob_put(
        &self,
        r: &Reference,
        d: &Digest,
        blob: Blob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let host = self.transport.host_config(&r.registry);
        let blob_max = if host.blob_max > 0 {
            host.blob_max
        } else {
            DEFAULT_BLOB_MAX
        };
        let chunk_size = if host.blob_chunk > 0 {
            host.blob_chunk.max(MIN_BLOB_CHUNK)
        } else {
            DEFAULT_BLOB_CHUNK
        } as usize;

        let location = self.upload_session(r, cancel).await?;

        match blob.size() {
            Some(size) if size <= blob_max => {
                let data = blob.read_all().await?;
                self.upload_single(r, d, location, data.into(), cancel).await
            }
            _ => self.upload_chunked(r, d, blob, location, chunk_size, cancel).await,
        }
    }

    /// POST an upload session, returning the session URL
    async fn upload_session(&self, r: &Reference, cancel: &CancellationToken) -> Result<Url> {
        let req = ApiRequest::new(&r.registry, Method::POST, "blobs/uploads/".to_string())
            .repository(&r.repository)
            .no_mirrors();
        let resp = self.transport.send(req, cancel).await?;
        resolve_location(&resp, "upload session")
    }

    async fn upload_single(
        &self,
        r: &Reference,
        d: &Digest,
        location: Url,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut url = location;
        url.query_pairs_mut().append_pair("digest", &d.to_string());
        let req = ApiRequest::new(&r.registry, Method::PUT, String::new())
            .repository(&r.repository)
            .direct_url(url)
            .header(CONTENT_TYPE.as_str(), OCTET_STREAM)
            .body(data)
            .no_mirrors();
        let resp = self.transport.send(req, cancel).await?;
        check_digest_echo(&resp, d)
    }

    async fn upload_chunked(
        &self,
        r: &Reference,
        d: &Digest,
        mut blob: Blob,
        mut location: Url,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut offset: u64 = 0;
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        loop {
            let chunk = blob.chunk().await?;
            let eof = chunk.is_none();
            if let Some(chunk) = chunk {
                buffer.extend_from_slice(&chunk);
            }
            while buffer.len() >= chunk_size || (eof && !buffer.is_empty()) {
                let send = if buffer.len() > chunk_size {
                    let rest = buffer.split_off(chunk_size);
                    Bytes::from(std::mem::replace(&mut buffer, rest))
                } else {
                    Bytes::from(std::mem::take(&mut buffer))
                };
                let end = offset + send.len() as u64;
                let req = ApiRequest::new(&r.registry, Method::PATCH, String::new())
                    .repository(&r.repository)
                    .direct_url(location.clone())
                    .header(CONTENT_TYPE.as_str(), OCTET_STREAM)
                    .header("Content-Range", format!("{}-{}", offset, end - 1))
                    .body(send)
                    .no_mirrors();
                let resp = self.transport.send(req, cancel).await?;
                offset = end;
                // the session may move between chunks
                if resp.header(LOCATION.as_str()).is_some() {
                    location = resolve_location(&resp, "upload chunk")?;
                }
            }
            if eof {
                break;
            }
        }

        let mut url = location;
        url.query_pairs_mut().append_pair("digest", &d.to_string());
        let req = ApiRequest::new(&r.registry, Method::PUT, String::new())
            .repository(&r.repository)
            .direct_url(url)
            .no_mirrors();
        let resp = self.transport.send(req, cancel).await?;
        check_digest_echo(&resp, d)
    }

    /// Probe a manifest without fetching the body
    pub async fn manifest_head(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<ManifestHead> {
        let req = ApiRequest::new(
            &r.registry,
            Method::HEAD,
            format!("manifests/{}", r.api_reference()),
        )
        .repository(&r.repository)
        .header("Accept", accept_manifest_types());
        let resp = self.transport.send(req, cancel).await?;
        let rate_limit = RateLimitInfo::from_headers(resp.headers());

        let media_type = resp
            .header(CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .to_string();
        let size = resp.content_length().unwrap_or(0);
        let header_digest = match resp.header(DOCKER_CONTENT_DIGEST) {
            Some(h) => Some(Digest::parse(h)?),
            None => None,
        };
        if let (Some(expected), Some(found)) = (&r.digest, &header_digest) {
            if expected != found {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    computed: found.to_string(),
                });
            }
        }
        let digest = match header_digest.or_else(|| r.digest.clone()) {
            Some(d) => d,
            None => {
                // registries that omit the digest header force a full get
                let manifest = self.manifest_get(r, cancel).await?;
                return Ok(ManifestHead {
                    descriptor: manifest.descriptor(),
                    rate_limit,
                });
            }
        };
        Ok(ManifestHead {
            descriptor: Descriptor::new(media_type, digest, size),
            rate_limit,
        })
    }

    /// Fetch and parse a manifest, verifying its digest
    pub async fn manifest_get(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        let mut req = ApiRequest::new(
            &r.registry,
            Method::GET,
            format!("manifests/{}", r.api_reference()),
        )
        .repository(&r.repository)
        .header("Accept", accept_manifest_types());
        if let Some(d) = &r.digest {
            req = req.expect_digest(d.clone());
        }
        let resp = self.transport.send(req, cancel).await?;
        let media_type = resp
            .header(CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .to_string();
        let header_digest = resp.header(DOCKER_CONTENT_DIGEST).map(str::to_string);
        let body = resp.read_all().await?;
        let manifest = Manifest::parse(&media_type, body)?;
        if let Some(header_digest) = header_digest {
            let header_digest = Digest::parse(&header_digest)?;
            if &header_digest != manifest.digest() {
                return Err(RegistryError::DigestMismatch {
                    expected: header_digest.to_string(),
                    computed: manifest.digest().to_string(),
                });
            }
        }
        Ok(manifest)
    }

    /// Push a manifest; referenced config and layers must already be
    /// durable in the repository
    pub async fn manifest_put(
        &self,
        r: &Reference,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let req = ApiRequest::new(
            &r.registry,
            Method::PUT,
            format!("manifests/{}", r.api_reference()),
        )
        .repository(&r.repository)
        .header(CONTENT_TYPE.as_str(), manifest.media_type())
        .body(Bytes::copy_from_slice(manifest.raw()))
        .no_mirrors();
        self.transport.send(req, cancel).await?;
        Ok(())
    }

    /// Delete a manifest by digest
    pub async fn manifest_delete(&self, r: &Reference, cancel: &CancellationToken) -> Result<()> {
        let Some(digest) = &r.digest else {
            return Err(RegistryError::InvalidInput(format!(
                "digest required to delete manifest: {}",
                r.common_name()
            )));
        };
        let req = ApiRequest::new(&r.registry, Method::DELETE, format!("manifests/{}", digest))
            .repository(&r.repository)
            .no_mirrors();
        self.transport.send(req, cancel).await?;
        Ok(())
    }

    /// List tags in a repository, following pagination links
    pub async fn tag_list(&self, r: &Reference, cancel: &CancellationToken) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct TagListBody {
            #[serde(default)]
            tags: Vec<String>,
        }

        let mut tags = Vec::new();
        let mut next: Option<Url> = None;
        loop {
            let mut req = ApiRequest::new(&r.registry, Method::GET, "tags/list".to_string())
                .repository(&r.repository);
            if let Some(url) = next.take() {
                req = req.direct_url(url);
            }
            let resp = self.transport.send(req, cancel).await?;
            let link = parse_link_next(resp.header("link"), resp.url());
            let body: TagListBody = serde_json::from_slice(&resp.read_all().await?)?;
            tags.extend(body.tags);
            match link {
                Some(url) => next = Some(url),
                None => break,
            }
        }
        Ok(tags)
    }

    /// List repositories on a registry host
    pub async fn repo_list(&self, host: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct CatalogBody {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let mut repos = Vec::new();
        let mut next: Option<Url> = None;
        loop {
            let mut req = ApiRequest::new(host, Method::GET, "_catalog".to_string());
            if let Some(url) = next.take() {
                req = req.direct_url(url);
            }
            let resp = self.transport.send(req, cancel).await?;
            let link = parse_link_next(resp.header("link"), resp.url());
            let body: CatalogBody = serde_json::from_slice(&resp.read_all().await?)?;
            repos.extend(body.repositories);
            match link {
                Some(url) => next = Some(url),
                None => break,
            }
        }
        Ok(repos)
    }

    /// Manifests referring to a subject digest. A missing referrers API
    /// is reported as an empty list, not an error.
    pub async fn referrer_list(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let req = ApiRequest::new(&r.registry, Method::GET, format!("referrers/{}", d))
            .repository(&r.repository);
        let resp = match self.transport.send(req, cancel).await {
            Ok(resp) => resp,
            Err(RegistryError::NotFound(_)) | Err(RegistryError::UnsupportedApi(_)) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let body = resp.read_all().await?;
        let manifest = Manifest::parse("application/vnd.oci.image.index.v1+json", body)?;
        Ok(manifest
            .as_index()
            .map(|i| i.manifests.clone())
            .unwrap_or_default())
    }
}

/// Resolve a response's Location header against the request URL
fn resolve_location(resp: &crate::registry::TransportResponse, what: &str) -> Result<Url> {
    let location = resp.header(LOCATION.as_str()).ok_or_else(|| {
        RegistryError::UnsupportedApi(format!("{} response missing Location", what))
    })?;
    resp.url()
        .join(location)
        .map_err(|e| RegistryError::UnsupportedApi(format!("bad {} location: {}", what, e)))
}

/// Cross-check the digest echoed by an upload completion
fn check_digest_echo(resp: &crate::registry::TransportResponse, d: &Digest) -> Result<()> {
    if let Some(echo) = resp.header(DOCKER_CONTENT_DIGEST) {
        let echoed = Digest::parse(echo)?;
        if &echoed != d {
            return Err(RegistryError::DigestMismatch {
                expected: d.to_string(),
                computed: echoed.to_string(),
            });
        }
    }
    Ok(())
}

/// Extract the rel="next" target from a Link header
fn parse_link_next(link: Option<&str>, base: &Url) -> Option<Url> {
    let link = link?;
    for part in link.split(',') {
        let part = part.trim();
        if !part
            .to_ascii_lowercase()
            .contains("rel=\"next\"")
        {
            continue;
        }
        let target = part.split(';').next()?.trim();
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        return base.join(target).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_next() {
        let base = Url::parse("https://reg.example.com/v2/a/img/tags/list").unwrap();
        let link = r#"</v2/a/img/tags/list?last=v5&n=100>; rel="next""#;
        let next = parse_link_next(Some(link), &base).unwrap();
        assert_eq!(
            next.as_str(),
            "https://reg.example.com/v2/a/img/tags/list?last=v5&n=100"
        );
    }

    #[test]
    fn test_parse_link_multiple_rels() {
        let base = Url::parse("https://reg.example.com/v2/_catalog").unwrap();
        let link = r#"<https://cdn.example.com/prev>; rel="prev", </v2/_catalog?last=x>; rel="next""#;
        let next = parse_link_next(Some(link), &base).unwrap();
        assert_eq!(next.as_str(), "https://reg.example.com/v2/_catalog?last=x");
        assert!(parse_link_next(None, &base).is_none());
        assert!(parse_link_next(Some(r#"<u>; rel="prev""#), &base).is_none());
    }

    #[test]
    fn test_rate_limit_from_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("ratelimit-remaining", "100;w=21600".parse().unwrap());
        headers.insert("ratelimit-limit", "200;w=21600".parse().unwrap());
        let info = RateLimitInfo::from_headers(&headers).unwrap();
        assert_eq!(info.remain, Some(100));
        assert_eq!(info.limit, Some(200));

        let empty = reqwest::header::HeaderMap::new();
        assert!(RateLimitInfo::from_headers(&empty).is_none());
    }
}
