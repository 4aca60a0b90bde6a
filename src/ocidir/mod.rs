//! OCI image layout scheme
//!
//! Implements the blob/manifest/tag operations over a local directory
//! in OCI image layout form:
//!
//! ```text
//! oci-layout              {"imageLayoutVersion": "1.0.0"}
//! index.json              top-level index, tags via ref.name annotation
//! blobs/<algo>/<hex>      content-addressed files
//! ```
//!
//! Blob writes stream to a temp file, hash as they go, and rename into
//! the CAS path on success, so concurrent readers see either the old
//! file or the new one and duplicate writes are idempotent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::image::{Descriptor, Digest, Digester, Manifest, ManifestIndex, MediaType, Reference};
use crate::registry::{RegistryError, Result};
use crate::scheme::{Blob, ManifestHead};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const REF_NAME: &str = "org.opencontainers.image.ref.name";

#[derive(Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// Scheme over an OCI image layout directory
pub struct OciDirScheme {
    root: PathBuf,
    /// Serializes read-modify-write cycles on index.json
    index_lock: tokio::sync::Mutex<()>,
    temp_counter: AtomicU64,
}

impl OciDirScheme {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_lock: tokio::sync::Mutex::new(()),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, d: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(d.algorithm().as_str())
            .join(d.encoded())
    }

    /// Write the layout marker and an empty index if missing
    async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let layout = self.root.join(LAYOUT_FILE);
        if !layout.exists() {
            let marker = serde_json::to_vec(&OciLayout {
                image_layout_version: "1.0.0".to_string(),
            })?;
            atomic_write(&layout, &marker, self.temp_name()).await?;
        }
        let index = self.root.join(INDEX_FILE);
        if !index.exists() {
            self.write_index(&ManifestIndex {
                schema_version: 2,
                media_type: Some(MediaType::OciIndex.to_string()),
                manifests: Vec::new(),
                annotations: None,
            })
            .await?;
        }
        Ok(())
    }

    fn temp_name(&self) -> String {
        format!(
            ".tmp-{}-{}",
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn read_index(&self) -> Result<ManifestIndex> {
        let path = self.root.join(INDEX_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(format!(
                    "no OCI layout at {}",
                    self.root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_index(&self, index: &ManifestIndex) -> Result<()> {
        let data = serde_json::to_vec(index)?;
        atomic_write(&self.root.join(INDEX_FILE), &data, self.temp_name()).await
    }

    /// Index entry for a reference: digest match first, then the
    /// ref.name annotation against the tag
    fn index_lookup<'a>(index: &'a ManifestIndex, r: &Reference) -> Option<&'a Descriptor> {
        if let Some(d) = &r.digest {
            return index.manifests.iter().find(|m| &m.digest == d);
        }
        let tag = r.tag_or_latest();
        index.manifests.iter().find(|m| {
            m.annotations
                .as_ref()
                .and_then(|a| a.get(REF_NAME))
                .is_some_and(|name| name == tag)
        })
    }

    pub async fn blob_head(&self, _r: &Reference, d: &Digest) -> Result<u64> {
        let meta = match tokio::fs::metadata(self.blob_path(d)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(d.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(meta.len())
    }

    pub async fn blob_get(&self, _r: &Reference, d: &Digest) -> Result<Blob> {
        let path = self.blob_path(d);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(d.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(Blob::from_file(file, size, Some(d.clone())))
    }

    /// Stream a blob into the CAS, verifying its digest while writing
    pub async fn blob_put(
        &self,
        _r: &Reference,
        d: &Digest,
        mut blob: Blob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_layout().await?;
        let final_path = self.blob_path(d);
        if final_path.exists() {
            // already stored; content addressing makes this a no-op
            return Ok(());
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = final_path.with_file_name(format!("{}{}", d.encoded(), self.temp_name()));
        let result = self
            .write_blob_temp(&temp_path, d, &mut blob, cancel)
            .await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&temp_path, &final_path).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn write_blob_temp(
        &self,
        temp_path: &Path,
        d: &Digest,
        blob: &mut Blob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut digester = Digester::new(d.algorithm());
        loop {
            if cancel.is_cancelled() {
                return Err(RegistryError::Canceled);
            }
            match blob.chunk().await? {
                Some(chunk) => {
                    digester.update(&chunk);
                    file.write_all(&chunk).await?;
                }
                None => break,
            }
        }
        file.flush().await?;
        let computed = digester.finalize();
        if &computed != d {
            return Err(RegistryError::DigestMismatch {
                expected: d.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a blob file from the CAS
    pub async fn blob_delete(&self, _r: &Reference, d: &Digest) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(d)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::NotFound(d.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn manifest_head(&self, r: &Reference) -> Result<ManifestHead> {
        let index = self.read_index().await?;
        if let Some(desc) = Self::index_lookup(&index, r) {
            return Ok(ManifestHead {
                descriptor: desc.clone(),
                rate_limit: None,
            });
        }
        // digest references may point at un-indexed child manifests
        if r.digest.is_some() {
            let manifest = self.manifest_get(r).await?;
            return Ok(ManifestHead {
                descriptor: manifest.descriptor(),
                rate_limit: None,
            });
        }
        Err(RegistryError::NotFound(r.common_name()))
    }

    pub async fn manifest_get(&self, r: &Reference) -> Result<Manifest> {
        let index = self.read_index().await?;
        let (digest, media_type) = match Self::index_lookup(&index, r) {
            Some(desc) => (desc.digest.clone(), desc.media_type.clone()),
            None => match &r.digest {
                Some(d) => (d.clone(), String::new()),
                None => return Err(RegistryError::NotFound(r.common_name())),
            },
        };
        let data = match tokio::fs::read(self.blob_path(&digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut digester = Digester::new(digest.algorithm());
        digester.update(&data);
        let computed = digester.finalize();
        if computed != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(Manifest::parse(&media_type, data)?)
    }

    /// Write a manifest blob and upsert the top-level index entry.
    /// Child manifests of an index copy skip the index so only the
    /// top-level manifest gets a tag.
    pub async fn manifest_put(&self, r: &Reference, manifest: &Manifest, child: bool) -> Result<()> {
        self.ensure_layout().await?;
        let digest = manifest.digest().clone();

        // manifest bytes land in the CAS like any blob
        let final_path = self.blob_path(&digest);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !final_path.exists() {
            let temp_path =
                final_path.with_file_name(format!("{}{}", digest.encoded(), self.temp_name()));
            tokio::fs::write(&temp_path, manifest.raw()).await?;
            tokio::fs::rename(&temp_path, &final_path).await?;
        }

        if child {
            return Ok(());
        }

        let mut desc = manifest.descriptor();
        if r.digest.is_none() {
            let tag = r.tag_or_latest().to_string();
            desc.annotations = Some(HashMap::from([(REF_NAME.to_string(), tag)]));
        }

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        match &r.digest {
            Some(_) => {
                // untagged entry, keyed by digest alone
                if !index.manifests.iter().any(|m| m.digest == desc.digest
                    && m.annotations.as_ref().and_then(|a| a.get(REF_NAME)).is_none())
                {
                    index.manifests.push(desc);
                }
            }
            None => {
                // at most one entry per tag
                let tag = r.tag_or_latest();
                index.manifests.retain(|m| {
                    m.annotations
                        .as_ref()
                        .and_then(|a| a.get(REF_NAME))
                        .map(String::as_str)
                        != Some(tag)
                });
                index.manifests.push(desc);
            }
        }
        self.write_index(&index).await
    }

    /// Remove a manifest and its index entries; digest required
    pub async fn manifest_delete(&self, r: &Reference) -> Result<()> {
        let Some(digest) = r.digest.clone() else {
            return Err(RegistryError::InvalidInput(format!(
                "digest required to delete manifest: {}",
                r.common_name()
            )));
        };
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.manifests.retain(|m| m.digest != digest);
        self.write_index(&index).await?;
        match tokio::fs::remove_file(self.blob_path(&digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::NotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tags present in the index, sorted lexicographically
    pub async fn tag_list(&self, _r: &Reference) -> Result<Vec<String>> {
        let index = self.read_index().await?;
        let mut tags: Vec<String> = index
            .manifests
            .iter()
            .filter_map(|m| {
                m.annotations
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME))
                    .cloned()
            })
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }
}

/// Write through a temp file and rename into place
async fn atomic_write(path: &Path, data: &[u8], temp_suffix: String) -> Result<()> {
    let temp = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}{}", name.to_string_lossy(), temp_suffix)),
        None => {
            return Err(RegistryError::InvalidInput(format!(
                "bad path: {}",
                path.display()
            )));
        }
    };
    tokio::fs::write(&temp, data).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}
