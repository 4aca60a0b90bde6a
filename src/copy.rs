//! Image copy engine
//!
//! Recursively copies a manifest and everything it references between
//! two schemes: index children, config and layer blobs, digest tags,
//! and referrers. Blob transfers inside a copy run in parallel under a
//! shared semaphore; cross-repo mounts and already-present blobs skip
//! the byte transfer entirely.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::image::{Descriptor, Digest, Manifest, Platform, RefScheme, Reference};
use crate::registry::{RegistryError, Result};
use crate::scheme::{Blob, ManifestHead, SchemeHandle};

/// Blob transfers running at once within one image copy
const DEFAULT_BLOB_PARALLEL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Manifest,
    Blob,
    Referrer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Queued,
    Started,
    Active,
    Finished,
    Skipped,
}

/// Progress report for one manifest, blob, or referrer
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// Digest or tag the event is about
    pub instance: String,
    pub state: ProgressState,
    pub cur: u64,
    pub total: u64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Options for an image copy
#[derive(Clone, Default)]
pub struct CopyOptions {
    /// Copy children even when the destination digest already matches
    pub force_recursive: bool,
    /// Trust a matching destination digest without scanning extras
    pub fast_check: bool,
    /// Copy tags of the form sha256-<hex>.* that point into the graph
    pub digest_tags: bool,
    /// Copy referrers of the source manifest
    pub referrers: bool,
    /// Copy external (foreign URL) layers instead of skipping them
    pub include_external: bool,
    /// Keep only matching index children; empty keeps everything
    pub platforms: Vec<Platform>,
    /// Parallel blob transfers, 0 = default
    pub blob_parallel: usize,
    pub callback: Option<ProgressCallback>,
}

struct CopyCtx {
    src_scheme: SchemeHandle,
    dst_scheme: SchemeHandle,
    opts: CopyOptions,
    blob_gate: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Manifest digests in the copied graph, for digest-tag matching
    copied: Mutex<HashSet<Digest>>,
    /// Referrer digests already visited, guards adversarial cycles
    referrer_seen: Mutex<HashSet<Digest>>,
}

impl CopyCtx {
    fn emit(&self, kind: ProgressKind, instance: &str, state: ProgressState, cur: u64, total: u64) {
        if let Some(cb) = &self.opts.callback {
            cb(ProgressEvent {
                kind,
                instance: instance.to_string(),
                state,
                cur,
                total,
            });
        }
    }
}

/// Copy an image (or index graph) from one reference to another
pub async fn image_copy(
    src_scheme: SchemeHandle,
    src: &Reference,
    dst_scheme: SchemeHandle,
    dst: &Reference,
    opts: CopyOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let parallel = if opts.blob_parallel == 0 {
        DEFAULT_BLOB_PARALLEL
    } else {
        opts.blob_parallel
    };
    let ctx = Arc::new(CopyCtx {
        src_scheme,
        dst_scheme,
        opts,
        blob_gate: Arc::new(Semaphore::new(parallel)),
        cancel,
        copied: Mutex::new(HashSet::new()),
        referrer_seen: Mutex::new(HashSet::new()),
    });

    copy_manifest(ctx.clone(), src.clone(), dst.clone(), false).await?;

    if ctx.opts.digest_tags && !ctx.opts.fast_check {
        copy_digest_tags(&ctx, src, dst).await?;
    }
    if ctx.opts.referrers && !ctx.opts.fast_check {
        let head = source_head(&ctx, src).await?;
        copy_referrers(&ctx, src, dst, &head.descriptor.digest).await?;
    }
    Ok(())
}

/// Manifest head with a GET fallback for hosts that disable HEAD
async fn source_head(ctx: &CopyCtx, r: &Reference) -> Result<ManifestHead> {
    match ctx.src_scheme.manifest_head(r, &ctx.cancel).await {
        Ok(head) => Ok(head),
        Err(RegistryError::UnsupportedApi(_)) => {
            let m = ctx.src_scheme.manifest_get(r, &ctx.cancel).await?;
            Ok(ManifestHead {
                descriptor: m.descriptor(),
                rate_limit: None,
            })
        }
        Err(e) => Err(e),
    }
}

fn copy_manifest(
    ctx: Arc<CopyCtx>,
    src: Reference,
    dst: Reference,
    child: bool,
) -> futures::future::BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        let head = source_head(&ctx, &src).await?;
        let src_digest = head.descriptor.digest.clone();
        let instance = src_digest.to_string();
        ctx.emit(ProgressKind::Manifest, &instance, ProgressState::Queued, 0, 0);
        ctx.copied.lock().unwrap().insert(src_digest.clone());

        // platform filtering rewrites the top-level index, so fetch
        // before the fast-path comparison when a filter is set
        let filter = !child && !ctx.opts.platforms.is_empty();
        let mut manifest: Option<Manifest> = None;
        let push_digest = if filter {
            let fetched = ctx.src_scheme.manifest_get(&src, &ctx.cancel).await?;
            let rewritten = if fetched.is_index() {
                fetched.filter_platforms(&ctx.opts.platforms)?
            } else {
                fetched
            };
            let d = rewritten.digest().clone();
            manifest = Some(rewritten);
            d
        } else {
            src_digest.clone()
        };

        // fast path: the destination already holds this digest
        if let Ok(dst_head) = ctx.dst_scheme.manifest_head(&dst, &ctx.cancel).await {
            if dst_head.descriptor.digest == push_digest
                && (ctx.opts.fast_check || !ctx.opts.force_recursive)
            {
                tracing::debug!(
                    source = %src.common_name(),
                    target = %dst.common_name(),
                    "manifest already present, skipping"
                );
                ctx.emit(ProgressKind::Manifest, &instance, ProgressState::Skipped, 0, 0);
                return Ok(());
            }
        }

        let manifest = match manifest {
            Some(m) => m,
            None => ctx.src_scheme.manifest_get(&src, &ctx.cancel).await?,
        };
        ctx.emit(ProgressKind::Manifest, &instance, ProgressState::Started, 0, 0);

        if let Some(index) = manifest.as_index() {
            // children first so the index PUT sees durable manifests
            let mut tasks = tokio::task::JoinSet::new();
            for desc in &index.manifests {
                let ctx = ctx.clone();
                let child_src = src.with_digest(desc.digest.clone());
                let child_dst = dst.with_digest(desc.digest.clone());
                tasks.spawn(copy_manifest(ctx, child_src, child_dst, true));
            }
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| {
                    RegistryError::AllRequestsFailed(format!("copy task panicked: {}", e))
                })??;
            }
        } else if let Some(image) = manifest.as_image() {
            let mut blobs: Vec<Descriptor> = Vec::with_capacity(image.layers.len() + 1);
            blobs.push(image.config.clone());
            blobs.extend(image.layers.iter().cloned());

            let mut tasks = tokio::task::JoinSet::new();
            for desc in blobs {
                let ctx = ctx.clone();
                let src = src.clone();
                let dst = dst.clone();
                tasks.spawn(async move { copy_blob(&ctx, &src, &dst, &desc).await });
            }
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| {
                    RegistryError::AllRequestsFailed(format!("copy task panicked: {}", e))
                })??;
            }
        }
        // unknown (artifact) manifests copy as bare bytes

        ctx.dst_scheme
            .manifest_put(&dst, &manifest, child, &ctx.cancel)
            .await?;
        ctx.emit(ProgressKind::Manifest, &instance, ProgressState::Finished, 0, 0);
        Ok(())
    })
}

/// Copy one blob, preferring the cheapest available path
async fn copy_blob(ctx: &CopyCtx, src: &Reference, dst: &Reference, desc: &Descriptor) -> Result<()> {
    let _permit = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(RegistryError::Canceled),
        permit = ctx.blob_gate.clone().acquire_owned() => {
            permit.map_err(|_| RegistryError::Canceled)?
        }
    };

    let d = &desc.digest;
    let instance = d.to_string();
    ctx.emit(ProgressKind::Blob, &instance, ProgressState::Queued, 0, desc.size);

    // external layers are skipped unless explicitly included
    if desc.is_external() && !ctx.opts.include_external {
        ctx.emit(ProgressKind::Blob, &instance, ProgressState::Skipped, 0, desc.size);
        return Ok(());
    }

    // already at the destination
    if ctx.dst_scheme.blob_head(dst, d, &ctx.cancel).await.is_ok() {
        ctx.emit(
            ProgressKind::Blob,
            &instance,
            ProgressState::Skipped,
            desc.size,
            desc.size,
        );
        return Ok(());
    }

    ctx.emit(ProgressKind::Blob, &instance, ProgressState::Started, 0, desc.size);

    // same registry, different repository: ask for a server-side mount
    if mount_candidate(src, dst) && !desc.is_external() {
        match ctx.dst_scheme.blob_mount(src, dst, d, &ctx.cancel).await {
            Ok(()) => {
                tracing::debug!(digest = %d, from = %src.repository, "blob mounted");
                ctx.emit(
                    ProgressKind::Blob,
                    &instance,
                    ProgressState::Finished,
                    desc.size,
                    desc.size,
                );
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(digest = %d, error = %e, "mount failed, uploading");
            }
        }
    }

    // inline data avoids the round trip entirely
    let blob = if let Some(data) = desc.inline_data().map_err(RegistryError::Image)? {
        Blob::from_bytes(data.into(), Some(d))?
    } else if desc.is_external() {
        ctx.src_scheme
            .blob_get_external(src, d, desc.urls.as_deref().unwrap_or_default(), &ctx.cancel)
            .await?
    } else {
        ctx.src_scheme.blob_get(src, d, &ctx.cancel).await?
    };

    let blob = match &ctx.opts.callback {
        Some(cb) => {
            let cb = cb.clone();
            let instance = instance.clone();
            let total = desc.size;
            blob.with_observer(Arc::new(move |cur| {
                cb(ProgressEvent {
                    kind: ProgressKind::Blob,
                    instance: instance.clone(),
                    state: ProgressState::Active,
                    cur,
                    total,
                })
            }))
        }
        None => blob,
    };

    ctx.dst_scheme.blob_put(dst, d, blob, &ctx.cancel).await?;
    ctx.emit(
        ProgressKind::Blob,
        &instance,
        ProgressState::Finished,
        desc.size,
        desc.size,
    );
    Ok(())
}

fn mount_candidate(src: &Reference, dst: &Reference) -> bool {
    src.scheme == RefScheme::Registry
        && dst.scheme == RefScheme::Registry
        && src.registry == dst.registry
        && src.repository != dst.repository
}

/// Copy tags of the form `sha256-<hex>.*` whose hex matches a manifest
/// digest in the copied graph
async fn copy_digest_tags(ctx: &Arc<CopyCtx>, src: &Reference, dst: &Reference) -> Result<()> {
    let tags = match ctx.src_scheme.tag_list(src, &ctx.cancel).await {
        Ok(tags) => tags,
        Err(RegistryError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let copied_hex: HashSet<String> = ctx
        .copied
        .lock()
        .unwrap()
        .iter()
        .map(|d| d.encoded().to_string())
        .collect();
    for tag in tags {
        let Some(hex) = digest_tag_hex(&tag) else {
            continue;
        };
        if !copied_hex.contains(hex) {
            continue;
        }
        tracing::debug!(tag = %tag, "copying digest tag");
        ctx.emit(ProgressKind::Referrer, &tag, ProgressState::Started, 0, 0);
        let result = copy_manifest(
            ctx.clone(),
            src.with_tag(&tag),
            dst.with_tag(&tag),
            false,
        )
        .await;
        match result {
            Ok(()) => {
                ctx.emit(ProgressKind::Referrer, &tag, ProgressState::Finished, 0, 0);
            }
            // a tag listed moments ago may already be gone
            Err(RegistryError::NotFound(_)) => {
                ctx.emit(ProgressKind::Referrer, &tag, ProgressState::Skipped, 0, 0);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The hex portion of a digest tag (`sha256-<hex>` or `sha256-<hex>.sig`)
fn digest_tag_hex(tag: &str) -> Option<&str> {
    let rest = tag.strip_prefix("sha256-")?;
    let hex = match rest.find('.') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
    valid.then_some(hex)
}

/// Copy referrers of a subject digest, via the referrers API with a
/// digest-tag fallback; absence of both is not an error
async fn copy_referrers(
    ctx: &Arc<CopyCtx>,
    src: &Reference,
    dst: &Reference,
    subject: &Digest,
) -> Result<()> {
    {
        let mut seen = ctx.referrer_seen.lock().unwrap();
        if !seen.insert(subject.clone()) {
            return Ok(());
        }
    }

    let referrers = ctx
        .src_scheme
        .referrer_list(src, subject, &ctx.cancel)
        .await?;
    if referrers.is_empty() {
        // fall back to the digest-tag convention for this subject
        let tags = match ctx.src_scheme.tag_list(src, &ctx.cancel).await {
            Ok(tags) => tags,
            Err(RegistryError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for tag in tags {
            if digest_tag_hex(&tag) != Some(subject.encoded()) {
                continue;
            }
            ctx.emit(ProgressKind::Referrer, &tag, ProgressState::Started, 0, 0);
            copy_manifest(ctx.clone(), src.with_tag(&tag), dst.with_tag(&tag), false).await?;
            ctx.emit(ProgressKind::Referrer, &tag, ProgressState::Finished, 0, 0);
        }
        return Ok(());
    }

    for desc in referrers {
        let instance = desc.digest.to_string();
        ctx.emit(ProgressKind::Referrer, &instance, ProgressState::Started, 0, 0);
        copy_manifest(
            ctx.clone(),
            src.with_digest(desc.digest.clone()),
            dst.with_digest(desc.digest.clone()),
            false,
        )
        .await?;
        ctx.emit(ProgressKind::Referrer, &instance, ProgressState::Finished, 0, 0);
        // referrers can themselves be annotated
        Box::pin(copy_referrers(ctx, src, dst, &desc.digest)).await?;
    }
    Ok(())
}
