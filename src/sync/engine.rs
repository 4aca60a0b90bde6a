//! Sync runner
//!
//! Drives the configured steps: once, check (dry-run), or server mode
//! with cron/interval scheduling. Image copies across the whole run
//! share one parallelism gate; a worker sleeping for a source rate
//! limit releases its permit so other steps keep moving.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::copy::CopyOptions;
use crate::image::{Digest, Manifest, Platform, Reference};
use crate::registry::RegistryError;
use crate::scheme::ManifestHead;
use crate::sync::{
    Result, StepTiming, StepType, SyncConfig, SyncError, SyncStep, TagFilter,
};
use crate::RegClient;

/// What a run does with each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Copy,
    Check,
}

/// Manifest cache for platform resolution, bounded by count and age
struct ManifestCache {
    entries: Mutex<HashMap<Digest, (Manifest, Instant)>>,
    max_count: usize,
    ttl: Duration,
}

impl ManifestCache {
    fn new(max_count: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_count: max_count.max(1),
            ttl,
        }
    }

    fn get(&self, digest: &Digest) -> Option<Manifest> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(digest) {
            Some((manifest, inserted)) if inserted.elapsed() < self.ttl => {
                Some(manifest.clone())
            }
            Some(_) => {
                entries.remove(digest);
                None
            }
            None => None,
        }
    }

    fn insert(&self, digest: Digest, manifest: Manifest) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, inserted)| inserted.elapsed() < self.ttl);
        if entries.len() >= self.max_count {
            // evict the oldest entry to stay within the bound
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (_, inserted))| *inserted)
                .map(|(d, _)| d.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(digest, (manifest, Instant::now()));
    }
}

/// Executes a sync configuration against a client
pub struct SyncRunner {
    core: Arc<RunnerCore>,
}

struct RunnerCore {
    client: Arc<RegClient>,
    config: SyncConfig,
    gate: Semaphore,
    cache: ManifestCache,
    check_needed: AtomicBool,
}

impl SyncRunner {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let mut builder = RegClient::builder()
            .hosts(config.creds.clone())
            .user_agent(format!("regmirror/{}", env!("CARGO_PKG_VERSION")));
        if !config.defaults.skip_docker_conf {
            builder = builder.docker_creds();
        }
        Ok(Self::with_client(config, Arc::new(builder.build())))
    }

    /// Runner over an existing client (tests inject mock-backed hosts)
    pub fn with_client(config: SyncConfig, client: Arc<RegClient>) -> Self {
        let parallel = config.defaults.parallel.max(1);
        let cache = ManifestCache::new(
            config.defaults.cache_count,
            Duration::from_secs(config.defaults.cache_time.max(1)),
        );
        Self {
            core: Arc::new(RunnerCore {
                client,
                gate: Semaphore::new(parallel),
                cache,
                config,
                check_needed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// One pass through all steps, steps running concurrently under the
    /// parallelism gate. The first error is returned after every step
    /// has finished.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        for step in self.core.config.sync.clone() {
            let core = self.core.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { core.process_step(&step, SyncAction::Copy, &cancel).await });
        }
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| SyncError::Config(format!("step task panicked: {}", e)))?;
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dry-run every step in order; returns true when any step would
    /// have copied
    pub async fn run_check(&self, cancel: &CancellationToken) -> Result<bool> {
        self.core.check_needed.store(false, Ordering::SeqCst);
        let mut first_err = None;
        for step in &self.core.config.sync {
            if let Err(e) = self
                .core
                .process_step(step, SyncAction::Check, cancel)
                .await
            {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(self.core.check_needed.load(Ordering::SeqCst)),
        }
    }

    /// Server mode: each step fires on its schedule or interval until
    /// shutdown. A step never overlaps itself; fire times that pass
    /// while it runs are skipped. On shutdown, scheduling stops and
    /// in-flight steps are awaited before hard-canceling I/O.
    pub async fn run_server(
        &self,
        shutdown: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        for step in self.core.config.sync.clone() {
            let Some(timing) = step.timing(&self.core.config.defaults) else {
                tracing::error!(
                    source = %step.source,
                    target = %step.target,
                    "no schedule or interval found, ignoring step"
                );
                continue;
            };
            // fail on bad expressions before the first sleep
            next_fire(&timing)?;
            tracing::debug!(
                source = %step.source,
                target = %step.target,
                timing = ?timing,
                "scheduled task"
            );
            let core = self.core.clone();
            let shutdown = shutdown.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut first_err: Option<SyncError> = None;
                loop {
                    let wait = match next_fire(&timing) {
                        Ok(wait) => wait,
                        Err(e) => break Some(e),
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => break first_err,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    tracing::debug!(source = %step.source, target = %step.target, "running task");
                    if let Err(e) = core.process_step(&step, SyncAction::Copy, &cancel).await {
                        tracing::error!(
                            source = %step.source,
                            target = %step.target,
                            error = %e,
                            "sync step failed"
                        );
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(e)) = joined {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        // in-flight work is done; release anything still waiting on I/O
        cancel.cancel();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl RunnerCore {
    /// Process one step: a single image, every matching tag of a
    /// repository, or every repository of a registry
    async fn process_step(
        &self,
        step: &SyncStep,
        action: SyncAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match step.step_type {
            StepType::Image => {
                let src = Reference::parse(&step.source)?;
                let tgt = Reference::parse(&step.target)?;
                self.process_ref(step, &src, &tgt, action, cancel).await
            }
            StepType::Repository => {
                let src = Reference::parse(&step.source)?;
                let tgt = Reference::parse(&step.target)?;
                self.process_repo(step, &src, &tgt, action, cancel).await
            }
            StepType::Registry => {
                let repos = self.client.repo_list(&step.source, cancel).await?;
                let mut first_err = None;
                for repo in repos {
                    let src = Reference::parse(&format!("{}/{}", step.source, repo))?;
                    let tgt = Reference::parse(&format!("{}/{}", step.target, repo))?;
                    if let Err(e) = self.process_repo(step, &src, &tgt, action, cancel).await {
                        tracing::error!(
                            source = %src.common_name(),
                            error = %e,
                            "repository sync failed"
                        );
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Sync every tag of a repository passing the step's filter
    async fn process_repo(
        &self,
        step: &SyncStep,
        src: &Reference,
        tgt: &Reference,
        action: SyncAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let available = self.client.tag_list(src, cancel).await?;
        let filter = TagFilter::new(&step.tags.allow, &step.tags.deny)?;
        let tags = filter.filter(available.clone());
        if tags.is_empty() {
            tracing::info!(
                source = %src.common_name(),
                available = available.len(),
                "no matching tags found"
            );
            return Ok(());
        }
        let mut first_err = None;
        for tag in tags {
            let src = src.with_tag(&tag);
            let tgt = tgt.with_tag(&tag);
            if let Err(e) = self.process_ref(step, &src, &tgt, action, cancel).await {
                tracing::error!(
                    source = %src.common_name(),
                    target = %tgt.common_name(),
                    error = %e,
                    "failed to sync"
                );
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sync a single source reference to a target reference
    async fn process_ref(
        &self,
        step: &SyncStep,
        src: &Reference,
        tgt: &Reference,
        action: SyncAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let src_head = self.source_head(src, cancel).await?;
        let tgt_head = self.client.manifest_head(tgt, cancel).await.ok();
        let tgt_exists = tgt_head.is_some();
        let force = step.force_recursive.unwrap_or(false);
        let mut matches = tgt_head
            .as_ref()
            .is_some_and(|h| h.descriptor.digest == src_head.descriptor.digest);
        if matches && !force {
            tracing::debug!(
                source = %src.common_name(),
                target = %tgt.common_name(),
                "image matches"
            );
            return Ok(());
        }

        // skip sources with a media type the step does not accept
        let media_type = &src_head.descriptor.media_type;
        if !media_type.is_empty()
            && !step
                .media_types(&self.config.defaults)
                .iter()
                .any(|mt| mt == media_type)
        {
            tracing::info!(
                source = %src.common_name(),
                media_type = %media_type,
                "skipping unsupported media type"
            );
            return Ok(());
        }

        // resolve a single platform out of a source index
        let mut src = src.clone();
        if let Some(platform) = &step.platform {
            if crate::image::MediaType::from_str(media_type).is_index() {
                let digest = self
                    .platform_digest(&src, &src_head.descriptor.digest, platform, cancel)
                    .await?;
                if let Some(h) = &tgt_head {
                    matches = h.descriptor.digest == digest;
                }
                src = src.with_digest(digest);
                if matches && !force {
                    tracing::debug!(
                        source = %src.common_name(),
                        platform = %platform,
                        target = %tgt.common_name(),
                        "image matches for platform"
                    );
                    return Ok(());
                }
            }
        }

        if matches {
            tracing::info!(
                source = %src.common_name(),
                target = %tgt.common_name(),
                "image sync forced"
            );
        } else {
            tracing::info!(
                source = %src.common_name(),
                target = %tgt.common_name(),
                "image sync needed"
            );
        }
        if action == SyncAction::Check {
            self.check_needed.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // one permit per image copy
        let mut permit = self.acquire(cancel).await?;

        // wait out the source rate limit, yielding the permit while
        // sleeping so other workers can proceed
        let rate_limit = step.rate_limit(&self.config.defaults);
        if rate_limit.min > 0 {
            let mut head = self.source_head(&src, cancel).await?;
            while head
                .rate_limit
                .is_some_and(|rl| rl.remain.unwrap_or(u64::MAX) < rate_limit.min)
            {
                let remain = head.rate_limit.and_then(|rl| rl.remain).unwrap_or(0);
                tracing::info!(
                    source = %src.common_name(),
                    remain,
                    min = rate_limit.min,
                    sleep = rate_limit.retry,
                    "delaying for rate limit"
                );
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Canceled),
                    _ = tokio::time::sleep(rate_limit.retry_duration()) => {}
                }
                permit = self.acquire(cancel).await?;
                head = self.source_head(&src, cancel).await?;
            }
        }

        // best-effort backup of the target being overwritten
        if tgt_exists && !matches {
            if let Some(template) = step.backup(&self.config.defaults) {
                let backup_ref = expand_backup(template, tgt)?;
                tracing::info!(
                    original = %tgt.common_name(),
                    backup = %backup_ref.common_name(),
                    "saving backup"
                );
                if let Err(e) = self
                    .client
                    .image_copy(tgt, &backup_ref, CopyOptions::default(), cancel)
                    .await
                {
                    tracing::warn!(
                        original = %tgt.common_name(),
                        backup = %backup_ref.common_name(),
                        error = %e,
                        "failed to backup existing image"
                    );
                }
            }
        }

        let opts = CopyOptions {
            force_recursive: force,
            fast_check: step.fast_check.unwrap_or(false),
            digest_tags: step.digest_tags.unwrap_or(false),
            referrers: step.referrers.unwrap_or(false),
            platforms: step
                .platforms
                .iter()
                .map(|p| Platform::parse(p))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            ..Default::default()
        };
        tracing::debug!(
            source = %src.common_name(),
            target = %tgt.common_name(),
            "image sync running"
        );
        self.client.image_copy(&src, tgt, opts, cancel).await?;
        self.client.close(tgt).await?;
        drop(permit);
        Ok(())
    }

    async fn acquire<'a>(&'a self, cancel: &CancellationToken) -> Result<SemaphorePermit<'a>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Canceled),
            permit = self.gate.acquire() => {
                permit.map_err(|_| SyncError::Canceled)
            }
        }
    }

    /// Manifest head with a GET fallback when HEAD is disabled
    async fn source_head(
        &self,
        r: &Reference,
        cancel: &CancellationToken,
    ) -> Result<ManifestHead> {
        match self.client.manifest_head(r, cancel).await {
            Ok(head) => Ok(head),
            Err(RegistryError::UnsupportedApi(_)) => {
                let m = self.client.manifest_get(r, cancel).await?;
                Ok(ManifestHead {
                    descriptor: m.descriptor(),
                    rate_limit: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a platform's child digest out of an index, caching the
    /// index body per run
    async fn platform_digest(
        &self,
        src: &Reference,
        index_digest: &Digest,
        platform: &str,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        let platform = Platform::parse(platform)?;
        let manifest = match self.cache.get(index_digest) {
            Some(m) => m,
            None => {
                let m = self.client.manifest_get(src, cancel).await?;
                self.cache.insert(index_digest.clone(), m.clone());
                m
            }
        };
        Ok(manifest.platform_descriptor(&platform)?.digest.clone())
    }
}

/// Time until the next firing of a schedule
fn next_fire(timing: &StepTiming) -> Result<Duration> {
    match timing {
        StepTiming::Interval(d) => Ok(*d),
        StepTiming::Cron(expr) => {
            let normalized = normalize_cron(expr);
            let schedule = cron::Schedule::from_str(&normalized)
                .map_err(|e| SyncError::BadSchedule(format!("{}: {}", expr, e)))?;
            let next = schedule
                .upcoming(chrono::Local)
                .next()
                .ok_or_else(|| SyncError::BadSchedule(format!("{}: never fires", expr)))?;
            (next - chrono::Local::now())
                .to_std()
                .map_err(|_| SyncError::BadSchedule(format!("{}: fires in the past", expr)))
        }
    }
}

/// Accept standard 5-field cron by prepending a seconds field
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Expand a backup template against the target reference. A result
/// containing `/` or `:` parses as a full reference, anything else is a
/// tag on the target repository.
fn expand_backup(template: &str, tgt: &Reference) -> Result<Reference> {
    let expanded = template
        .replace("{tag}", tgt.tag_or_latest())
        .replace("{registry}", &tgt.registry)
        .replace("{repository}", &tgt.repository);
    let expanded = expanded.trim();
    if expanded.contains('/') || expanded.contains(':') {
        Ok(Reference::parse(expanded)?)
    } else {
        Ok(tgt.with_tag(expanded))
    }
}
