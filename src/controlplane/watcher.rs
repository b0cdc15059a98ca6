//! Usage Watcher
//!
//! Fixed-cadence reconciliation loop. Each cycle starts from a fresh listing
//! of every managed claim and, per disk:
//!
//! 1. records live usage and last-used time, backfills missing bookkeeping
//! 2. applies `VolumeBound` / `VolumeLost` from the claim phase
//! 3. deletes disks whose life span ran out
//! 4. applies the overuse policy
//! 5. completes deletions that were interrupted
//!
//! and finally clears name reservations whose claim is gone. Nothing is kept
//! between cycles, so a restarted watcher simply runs the next cycle.

use crate::controlplane::gateway::GatewayExt;
use crate::controlplane::lifecycle::{transition, DiskEvent};
use crate::controlplane::metrics::DeleteReason;
use crate::controlplane::retry::ConflictRetry;
use crate::controlplane::service::DiskService;
use crate::domain::disk::{
    format_timestamp, Disk, DiskStatus, ExpiryAnchor, CREATED_AT_ANNOTATION,
    LAST_USAGE_CHECK_ANNOTATION, LAST_USED_ANNOTATION, STATUS_ANNOTATION, USED_BYTES_ANNOTATION,
};
use crate::domain::ports::{Mutation, ResourceKey, ScopeFilter, VolumeClaim, VolumeClaimPhase};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// What to do with a disk using more than it requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverusePolicy {
    Ignore,
    #[default]
    Log,
    Remove,
}

impl std::str::FromStr for OverusePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ignore" => Ok(OverusePolicy::Ignore),
            "log" => Ok(OverusePolicy::Log),
            "remove" => Ok(OverusePolicy::Remove),
            other => Err(Error::Configuration(format!(
                "unknown overuse policy {}, use 'ignore', 'log' or 'remove'",
                other
            ))),
        }
    }
}

/// Configuration for the usage watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between cycle starts
    pub interval: Duration,
    pub expiry_anchor: ExpiryAnchor,
    pub overuse_policy: OverusePolicy,
    /// Budget for per-disk versioned updates
    pub retry: ConflictRetry,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            expiry_anchor: ExpiryAnchor::CreatedAt,
            overuse_policy: OverusePolicy::Log,
            retry: ConflictRetry::default(),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub disks_seen: usize,
    pub updated: usize,
    pub became_ready: usize,
    pub became_broken: usize,
    pub expired: usize,
    pub overused: usize,
    pub removed_for_overuse: usize,
    pub deletes_completed: usize,
    pub orphans_cleared: usize,
    pub skipped: usize,
}

/// Live observations for one claim
#[derive(Debug, Clone, Copy, Default)]
struct Observation {
    used_bytes: Option<u64>,
    mounted: bool,
}

/// Bookkeeping changes for one claim, or `None` when it is up to date
fn plan_update(
    claim: &VolumeClaim,
    disk: &Disk,
    observed: Observation,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>> {
    let mut mutation = Mutation::new().expect_version(claim.version.clone());

    let event = match (disk.status, claim.phase) {
        (DiskStatus::Pending, VolumeClaimPhase::Bound) => Some(DiskEvent::VolumeBound),
        (DiskStatus::Pending | DiskStatus::Ready, VolumeClaimPhase::Lost) => {
            Some(DiskEvent::VolumeLost)
        }
        _ => None,
    };
    let status = match event {
        Some(event) => transition(disk.status, event)?.unwrap_or(disk.status),
        None => disk.status,
    };
    if status != disk.status || !claim.annotations.contains_key(STATUS_ANNOTATION) {
        mutation = mutation.annotate(STATUS_ANNOTATION, status.to_string());
    }

    if !claim.annotations.contains_key(CREATED_AT_ANNOTATION) {
        mutation = mutation.annotate(CREATED_AT_ANNOTATION, format_timestamp(disk.created_at));
    }
    if let Some(used) = observed.used_bytes {
        mutation = mutation
            .annotate(USED_BYTES_ANNOTATION, used.to_string())
            .annotate(LAST_USAGE_CHECK_ANNOTATION, format_timestamp(now));
    }
    if observed.mounted {
        mutation = mutation.annotate(LAST_USED_ANNOTATION, format_timestamp(now));
    }

    Ok((!mutation.is_empty()).then_some(mutation))
}

// =============================================================================
// Usage Watcher
// =============================================================================

/// Reconciliation loop over every managed disk
pub struct UsageWatcher {
    service: Arc<DiskService>,
    config: WatcherConfig,
}

impl UsageWatcher {
    /// Create a new watcher
    pub fn new(service: Arc<DiskService>, config: WatcherConfig) -> Self {
        Self { service, config }
    }

    /// Run cycles until cancelled. A failed cycle is retried with backoff
    /// instead of waiting for the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting usage watcher (interval {:?}, expiry anchor {:?}, overuse policy {:?})",
            self.config.interval, self.config.expiry_anchor, self.config.overuse_policy
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            current_interval: Duration::from_secs(1),
            max_interval: self.config.interval,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                match self.run_cycle().await {
                    Ok(report) => {
                        backoff.reset();
                        debug!("Watcher cycle finished: {:?}", report);
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(self.config.interval);
                        error!("Watcher cycle failed, retrying in {:?}: {}", delay, e);
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!("Usage watcher stopped");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        info!("Usage watcher stopped");
    }

    /// Run one cycle now
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let metrics = self.service.metrics().clone();
        let timer = metrics.cycle_duration.start_timer();
        metrics.watcher_cycles.inc();

        let result = self.reconcile(now).await;
        timer.observe_duration();

        match &result {
            Ok(report) => {
                metrics.watcher_skipped_disks.inc_by(report.skipped as u64);
                metrics.orphans_cleared.inc_by(report.orphans_cleared as u64);
            }
            Err(_) => metrics.watcher_failed_cycles.inc(),
        }
        result
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let gateway = self.service.gateway();
        let claims = gateway.list_claims(&ScopeFilter::all()).await?;

        let usage: BTreeMap<ResourceKey, u64> = match gateway.usage_samples().await {
            Ok(samples) => samples
                .into_iter()
                .map(|sample| (sample.key, sample.used_bytes))
                .collect(),
            Err(e) => {
                warn!("Usage samples unavailable this cycle: {}", e);
                BTreeMap::new()
            }
        };
        let mounted: BTreeSet<ResourceKey> = match gateway.mounted_claims().await {
            Ok(mounted) => mounted.into_iter().collect(),
            Err(e) => {
                warn!("Mounted claims unavailable this cycle: {}", e);
                BTreeSet::new()
            }
        };

        let mut report = CycleReport::default();
        let mut claim_keys = BTreeSet::new();
        for claim in &claims {
            claim_keys.insert(claim.key.clone());
            report.disks_seen += 1;

            let observed = Observation {
                used_bytes: usage.get(&claim.key).copied(),
                mounted: mounted.contains(&claim.key),
            };
            if let Err(e) = self.reconcile_disk(claim, observed, now, &mut report).await {
                warn!("Skipping disk {} this cycle: {}", claim.key, e);
                report.skipped += 1;
            }
        }

        for reservation in gateway.list_reservations(&ScopeFilter::all()).await? {
            let target = ResourceKey::new(
                reservation.key.namespace.clone(),
                reservation.disk_id.clone(),
            );
            if claim_keys.contains(&target) {
                continue;
            }
            match self.service.naming().clear_orphan(&reservation, now).await {
                Ok(true) => report.orphans_cleared += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to clear reservation {}: {}", reservation.key, e);
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    async fn reconcile_disk(
        &self,
        claim: &VolumeClaim,
        observed: Observation,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let before = Disk::from_claim(claim)?;
        if before.status == DiskStatus::Deleting {
            self.service.finish_delete(&before).await?;
            info!("Completed interrupted deletion of disk {}", before.id);
            report.deletes_completed += 1;
            return Ok(());
        }

        let disk = self.update_bookkeeping(claim, observed, now).await?;
        if disk.status != before.status {
            report.updated += 1;
            match disk.status {
                DiskStatus::Ready => report.became_ready += 1,
                DiskStatus::Broken => {
                    warn!("Disk {} in {} is broken", disk.id, disk.scope);
                    report.became_broken += 1;
                }
                _ => {}
            }
        }
        if !disk.is_live() {
            return Ok(());
        }

        if let Some(expires_at) = disk.expires_at(self.config.expiry_anchor) {
            if expires_at <= now {
                info!(
                    "Disk {} in {} expired at {}, deleting",
                    disk.id, disk.scope, expires_at
                );
                self.remove(&disk, DeleteReason::Expired).await?;
                report.expired += 1;
                return Ok(());
            }
        }

        if disk.is_overused() {
            report.overused += 1;
            let used = disk.used_bytes.unwrap_or_default();
            match self.config.overuse_policy {
                OverusePolicy::Ignore => {}
                OverusePolicy::Log => warn!(
                    "Disk {} in {} uses {} bytes of {} requested",
                    disk.id, disk.scope, used, disk.requested_capacity_bytes
                ),
                OverusePolicy::Remove => {
                    warn!(
                        "Disk {} in {} uses {} bytes of {} requested, deleting",
                        disk.id, disk.scope, used, disk.requested_capacity_bytes
                    );
                    self.remove(&disk, DeleteReason::Overuse).await?;
                    report.removed_for_overuse += 1;
                }
            }
        }

        Ok(())
    }

    /// Apply usage, phase and backfill changes with a versioned patch,
    /// recomputing from a fresh read after a conflict
    async fn update_bookkeeping(
        &self,
        listed: &VolumeClaim,
        observed: Observation,
        now: DateTime<Utc>,
    ) -> Result<Disk> {
        let gateway = self.service.gateway();
        self.config
            .retry
            .run("disk bookkeeping", move |attempt| async move {
                let claim = if attempt == 1 {
                    listed.clone()
                } else {
                    gateway.get_claim(&listed.key).await?
                };
                let disk = Disk::from_claim(&claim)?;
                if !disk.is_live() {
                    return Ok(disk);
                }

                match plan_update(&claim, &disk, observed, now)? {
                    Some(mutation) => {
                        let patched = gateway.patch_claim(&claim.key, mutation).await?;
                        debug!("Updated bookkeeping of disk {}", disk.id);
                        Disk::from_claim(&patched)
                    }
                    None => Ok(disk),
                }
            })
            .await
    }

    /// Delete a disk, tolerating a concurrent deleter
    async fn remove(&self, disk: &Disk, reason: DeleteReason) -> Result<()> {
        match self.service.remove_disk(disk, reason).await {
            Err(Error::InvalidTransition { .. }) | Err(Error::NotFound { .. }) => {
                debug!("Disk {} is already being deleted", disk.id);
                Ok(())
            }
            other => other,
        }
    }
}
