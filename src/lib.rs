//! regmirror
//!
//! Client library for the OCI/Docker distribution protocol and a local
//! OCI image layout, plus the engine that copies and mirrors images
//! between them. The [`RegClient`] facade owns per-host transport state
//! (auth, backoff, rate limits) and dispatches each operation to the
//! scheme a reference selects.

pub mod copy;
pub mod image;
pub mod ocidir;
pub mod registry;
pub mod scheme;
pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::copy::CopyOptions;
use crate::image::{Descriptor, Digest, Manifest, RefScheme, Reference};
use crate::ocidir::OciDirScheme;
use crate::registry::{
    CredStore, HostConfig, RegistryScheme, Result, Transport, TransportBuilder,
};
use crate::scheme::{Blob, ManifestHead, SchemeHandle};

/// Builder for [`RegClient`]
#[derive(Default)]
pub struct RegClientBuilder {
    hosts: Vec<HostConfig>,
    user_agent: Option<String>,
    docker_creds: bool,
    retry: Option<(u32, Duration, Duration)>,
    root_cas: Vec<Vec<u8>>,
    ca_dirs: Vec<PathBuf>,
}

impl RegClientBuilder {
    /// Add host configurations (merged by name)
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = HostConfig>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn host(mut self, host: HostConfig) -> Self {
        self.hosts.push(host);
        self
    }

    /// Resolve credentials through docker config.json and its helpers
    pub fn docker_creds(mut self) -> Self {
        self.docker_creds = true;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn retry(mut self, limit: u32, delay_init: Duration, delay_max: Duration) -> Self {
        self.retry = Some((limit, delay_init, delay_max));
        self
    }

    pub fn root_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.root_cas.push(pem);
        self
    }

    /// Directory of `<hostname>/*.crt` certificates
    pub fn ca_dir(mut self, dir: PathBuf) -> Self {
        self.ca_dirs.push(dir);
        self
    }

    pub fn build(self) -> RegClient {
        let mut builder: TransportBuilder = Transport::builder().hosts(self.hosts);
        if self.docker_creds {
            builder = builder.cred_store(CredStore::from_docker_config());
        }
        if let Some(ua) = self.user_agent {
            builder = builder.user_agent(ua);
        }
        if let Some((limit, init, max)) = self.retry {
            builder = builder.retry(limit, init, max);
        }
        for pem in self.root_cas {
            builder = builder.root_ca_pem(pem);
        }
        for dir in self.ca_dirs {
            builder = builder.ca_dir(dir);
        }
        let transport = Arc::new(builder.build());
        RegClient {
            registry: Arc::new(RegistryScheme::new(transport.clone())),
            transport,
            ocidirs: Mutex::new(HashMap::new()),
        }
    }
}

/// Client over registries and local OCI layouts
pub struct RegClient {
    transport: Arc<Transport>,
    registry: Arc<RegistryScheme>,
    /// One scheme instance per layout path so index writes serialize
    ocidirs: Mutex<HashMap<String, Arc<OciDirScheme>>>,
}

impl Default for RegClient {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RegClient {
    pub fn builder() -> RegClientBuilder {
        RegClientBuilder::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// The transport, for host-level inspection
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Scheme backing a reference
    pub fn scheme_for(&self, r: &Reference) -> SchemeHandle {
        match r.scheme {
            RefScheme::Registry => SchemeHandle::Registry(self.registry.clone()),
            RefScheme::OciDir => {
                let mut dirs = self.ocidirs.lock().unwrap();
                let scheme = dirs
                    .entry(r.registry.clone())
                    .or_insert_with(|| Arc::new(OciDirScheme::new(r.registry.clone())));
                SchemeHandle::OciDir(scheme.clone())
            }
        }
    }

    pub async fn manifest_head(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<ManifestHead> {
        self.scheme_for(r).manifest_head(r, cancel).await
    }

    pub async fn manifest_get(&self, r: &Reference, cancel: &CancellationToken) -> Result<Manifest> {
        self.scheme_for(r).manifest_get(r, cancel).await
    }

    pub async fn manifest_put(
        &self,
        r: &Reference,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.scheme_for(r)
            .manifest_put(r, manifest, false, cancel)
            .await
    }

    pub async fn manifest_delete(&self, r: &Reference, cancel: &CancellationToken) -> Result<()> {
        self.scheme_for(r).manifest_delete(r, cancel).await
    }

    pub async fn blob_head(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.scheme_for(r).blob_head(r, d, cancel).await
    }

    pub async fn blob_get(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        self.scheme_for(r).blob_get(r, d, cancel).await
    }

    pub async fn blob_put(
        &self,
        r: &Reference,
        d: &Digest,
        blob: Blob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.scheme_for(r).blob_put(r, d, blob, cancel).await
    }

    pub async fn blob_delete(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.scheme_for(r).blob_delete(r, d, cancel).await
    }

    pub async fn tag_list(&self, r: &Reference, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.scheme_for(r).tag_list(r, cancel).await
    }

    /// Repositories on a registry host
    pub async fn repo_list(&self, host: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.registry.repo_list(host, cancel).await
    }

    pub async fn referrer_list(
        &self,
        r: &Reference,
        d: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        self.scheme_for(r).referrer_list(r, d, cancel).await
    }

    /// Copy an image graph between any two references
    pub async fn image_copy(
        &self,
        src: &Reference,
        dst: &Reference,
        opts: CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        copy::image_copy(
            self.scheme_for(src),
            src,
            self.scheme_for(dst),
            dst,
            opts,
            cancel.clone(),
        )
        .await
    }

    /// Flush buffered state for a reference
    pub async fn close(&self, r: &Reference) -> Result<()> {
        self.scheme_for(r).close(r).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_dispatch() {
        let client = RegClient::new();
        let reg = Reference::parse("ghcr.io/a/img:1").unwrap();
        let dir = Reference::parse("ocidir://./out:1").unwrap();
        assert!(matches!(
            client.scheme_for(&reg),
            SchemeHandle::Registry(_)
        ));
        assert!(matches!(client.scheme_for(&dir), SchemeHandle::OciDir(_)));
    }

    #[test]
    fn test_ocidir_scheme_shared_per_path() {
        let client = RegClient::new();
        let a = Reference::parse("ocidir://./out:1").unwrap();
        let b = Reference::parse("ocidir://./out:2").unwrap();
        let (SchemeHandle::OciDir(s1), SchemeHandle::OciDir(s2)) =
            (client.scheme_for(&a), client.scheme_for(&b))
        else {
            panic!("expected ocidir schemes");
        };
        assert!(Arc::ptr_eq(&s1, &s2));
    }
}
