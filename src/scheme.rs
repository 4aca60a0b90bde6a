//! Scheme abstraction
//!
//! A scheme maps blob/manifest/tag operations onto a backing store: the
//! registry HTTP scheme or a local OCI layout directory. The copy
//! engine depends only on this surface and dispatches by reference
//! scheme.

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::image::{Descriptor, Digest, Digester, Manifest, Reference};
use crate::ocidir::OciDirScheme;
use crate::registry::{RateLimitInfo, RegistryError, RegistryScheme, Result, TransportResponse};

const FILE_CHUNK: usize = 64 * 1024;

/// Result of a manifest existence probe
#[derive(Debug, Clone)]
pub struct ManifestHead {
    pub descriptor: Descriptor,
    /// Rate limit state reported alongside the response, when any
    pub rate_limit: Option<RateLimitInfo>,
}

/// A blob being moved between schemes.
///
/// Chunks stream from the underlying source with digest verification at
/// EOF, wherever the source supports it.
pub struct Blob {
    size: Option<u64>,
    source: BlobSource,
    observer: Option<std::sync::Arc<dyn Fn(u64) + Send + Sync>>,
    observed: u64,
}

enum BlobSource {
    /// Streaming network response (digest verified by the transport)
    Http(TransportResponse),
    /// Local CAS file, hashed while reading
    File {
        file: tokio::fs::File,
        digester: Option<Digester>,
        expect: Option<Digest>,
        done: bool,
    },
    /// In-memory payload, verified up front
    Bytes(Option<Bytes>),
}

impl Blob {
    pub fn from_response(resp: TransportResponse) -> Self {
        Self {
            size: resp.content_length(),
            source: BlobSource::Http(resp),
            observer: None,
            observed: 0,
        }
    }

    pub fn from_file(file: tokio::fs::File, size: u64, expect: Option<Digest>) -> Self {
        let digester = match &expect {
            Some(d) => Digester::new(d.algorithm()),
            None => Digester::canonical(),
        };
        Self {
            size: Some(size),
            source: BlobSource::File {
                file,
                digester: Some(digester),
                expect,
                done: false,
            },
            observer: None,
            observed: 0,
        }
    }

    /// Wrap bytes already in memory, verifying them against a digest
    pub fn from_bytes(data: Bytes, expect: Option<&Digest>) -> Result<Self> {
        if let Some(expect) = expect {
            let mut digester = Digester::new(expect.algorithm());
            digester.update(&data);
            let computed = digester.finalize();
            if &computed != expect {
                return Err(RegistryError::DigestMismatch {
                    expected: expect.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        Ok(Self {
            size: Some(data.len() as u64),
            source: BlobSource::Bytes(Some(data)),
            observer: None,
            observed: 0,
        })
    }

    /// Invoke a callback with cumulative bytes read as chunks pass by
    pub fn with_observer(mut self, observer: std::sync::Arc<dyn Fn(u64) + Send + Sync>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Size when known up front (Content-Length or file metadata)
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Next chunk, or None at verified EOF
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let chunk = self.next_chunk().await?;
        if let (Some(chunk), Some(observer)) = (&chunk, &self.observer) {
            self.observed += chunk.len() as u64;
            observer(self.observed);
        }
        Ok(chunk)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.source {
            BlobSource::Http(resp) => resp.chunk().await,
            BlobSource::File {
                file,
                digester,
                expect,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                let mut buf = vec![0u8; FILE_CHUNK];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    *done = true;
                    if let (Some(expect), Some(digester)) = (expect.take(), digester.take()) {
                        let computed = digester.finalize();
                        if computed != expect {
                            return Err(RegistryError::DigestMismatch {
                                expected: expect.to_string(),
                                computed: computed.to_string(),
                            });
                        }
                    }
                    return Ok(None);
                }
                buf.truncate(n);
                if let Some(digester) = digester {
                    digester.update(&buf);
                }
                Ok(Some(Bytes::from(buf)))
            }
            BlobSource::Bytes(data) => Ok(data.take()),
        }
    }

    /// Read the full blob into memory, verifying at EOF
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size.unwrap_or(0) as usize);
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// A scheme bound to whichever backend a reference selects
#[derive(Clone)]
pub enum SchemeHandle {
    Registry(std::sync::Arc<RegistryScheme>),
    OciDir(std::sync::Arc<OciDirScheme>),
}

impl SchemeHandle {
    /// Verify a blob exists, returning its size when reported
    pub async fn blob_head(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        match self {
            SchemeHandle::Registry(s) => s.blob_head(r, d, cancel).await,
            SchemeHandle::OciDir(s) => s.blob_head(r, d).await,
        }
    }

    pub async fn blob_get(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        match self {
            SchemeHandle::Registry(s) => s.blob_get(r, d, cancel).await,
            SchemeHandle::OciDir(s) => s.blob_get(r, d).await,
        }
    }

    pub async fn blob_put(
        &self,
        r: &Reference,
        d: &Digest,
        blob: Blob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            SchemeHandle::Registry(s) => s.blob_put(r, d, blob, cancel).await,
            SchemeHandle::OciDir(s) => s.blob_put(r, d, blob, cancel).await,
        }
    }

    pub async fn blob_delete(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            SchemeHandle::Registry(s) => s.blob_delete(r, d, cancel).await,
            SchemeHandle::OciDir(s) => s.blob_delete(r, d).await,
        }
    }

    /// Read an external (foreign) layer. Registries fetch from the
    /// descriptor's URLs; a local layout already holds the bytes.
    pub async fn blob_get_external(
        &self,
        r: &Reference,
        d: &Digest,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        match self {
            SchemeHandle::Registry(s) => s.blob_get_url(r, d, urls, cancel).await,
            SchemeHandle::OciDir(s) => s.blob_get(r, d).await,
        }
    }

    /// Server-side cross-repo copy; unsupported outside registries
    pub async fn blob_mount(
        &self,
        src: &Reference,
        tgt: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            SchemeHandle::Registry(s) => s.blob_mount(src, tgt, d, cancel).await,
            SchemeHandle::OciDir(_) => Err(RegistryError::UnsupportedApi(
                "blob mount on ocidir".to_string(),
            )),
        }
    }

    pub async fn manifest_head(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<ManifestHead> {
        match self {
            SchemeHandle::Registry(s) => s.manifest_head(r, cancel).await,
            SchemeHandle::OciDir(s) => s.manifest_head(r).await,
        }
    }

    pub async fn manifest_get(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        match self {
            SchemeHandle::Registry(s) => s.manifest_get(r, cancel).await,
            SchemeHandle::OciDir(s) => s.manifest_get(r).await,
        }
    }

    /// Push a manifest; `child` marks members of an index being copied,
    /// which suppresses tag indexing in the OCI-dir scheme
    pub async fn manifest_put(
        &self,
        r: &Reference,
        manifest: &Manifest,
        child: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            SchemeHandle::Registry(s) => s.manifest_put(r, manifest, cancel).await,
            SchemeHandle::OciDir(s) => s.manifest_put(r, manifest, child).await,
        }
    }

    pub async fn manifest_delete(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            SchemeHandle::Registry(s) => s.manifest_delete(r, cancel).await,
            SchemeHandle::OciDir(s) => s.manifest_delete(r).await,
        }
    }

    pub async fn tag_list(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        match self {
            SchemeHandle::Registry(s) => s.tag_list(r, cancel).await,
            SchemeHandle::OciDir(s) => s.tag_list(r).await,
        }
    }

    /// Manifests whose subject points at the given digest. Schemes
    /// without a referrers API return an empty list; the caller falls
    /// back to the digest-tag convention.
    pub async fn referrer_list(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        match self {
            SchemeHandle::Registry(s) => s.referrer_list(r, d, cancel).await,
            SchemeHandle::OciDir(_) => Ok(Vec::new()),
        }
    }

    /// Flush any buffered state for a reference
    pub async fn close(&self, _r: &Reference) -> Result<()> {
        // both schemes write through eagerly
        Ok(())
    }
}
