//! Disk Service
//!
//! The entry point for the API layer. Creation runs reserve name → admit
//! quota → allocate claim; deletion runs mark Deleting → release name →
//! remove claim. Neither keeps state between calls: every decision is made on
//! a fresh read of the orchestrator.

use crate::controlplane::gateway::GatewayExt;
use crate::controlplane::lifecycle::{transition, DiskEvent};
use crate::controlplane::metrics::{DeleteReason, DiskMetrics};
use crate::controlplane::naming::{NamingConfig, NamingReservationService, Reservation};
use crate::controlplane::quota::{QuotaEnforcer, QuotaLimits};
use crate::controlplane::retry::ConflictRetry;
use crate::domain::disk::{
    claim_spec_for, Disk, DiskRequest, DiskStatus, Scope, DELETED_LABEL, STATUS_ANNOTATION,
};
use crate::domain::ports::{
    Mutation, OrchestratorGatewayRef, ResourceKey, ResourceKind, ScopeFilter,
};
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DISK_KIND: &str = "Disk";
const NAME_LENGTH_MAX: usize = 63;

// =============================================================================
// Service Configuration
// =============================================================================

/// Configuration for the disk service
#[derive(Debug, Clone, Default)]
pub struct DiskServiceConfig {
    /// Storage class used when a request names none
    pub default_storage_class: Option<String>,
    pub naming: NamingConfig,
    pub quota: QuotaLimits,
    /// Budget for versioned status patches
    pub retry: ConflictRetry,
}

/// Check a creation request before touching the orchestrator
pub fn validate_request(request: &DiskRequest) -> Result<()> {
    if request.scope.org.is_empty() || request.scope.project.is_empty() {
        return Err(Error::ApiValidation(
            "organization and project are required".into(),
        ));
    }
    if request.capacity_bytes == 0 {
        return Err(Error::ApiValidation("capacity must be positive".into()));
    }
    if let Some(name) = &request.name {
        validate_name(name)?;
    }
    Ok(())
}

/// Disk names become resource names: lowercase DNS labels
fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = name
        .chars()
        .next()
        .zip(name.chars().last())
        .map_or(false, |(first, last)| {
            first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
        });

    if name.len() > NAME_LENGTH_MAX || !valid_chars || !valid_ends {
        return Err(Error::ApiValidation(format!(
            "invalid disk name '{}': use at most {} lowercase letters, digits and '-', \
             starting and ending with a letter or digit",
            name, NAME_LENGTH_MAX
        )));
    }
    Ok(())
}

// =============================================================================
// Disk Service
// =============================================================================

/// Disk lifecycle facade over the orchestrator gateway
pub struct DiskService {
    gateway: OrchestratorGatewayRef,
    naming: NamingReservationService,
    quota: QuotaEnforcer,
    metrics: Arc<DiskMetrics>,
    config: DiskServiceConfig,
}

impl DiskService {
    /// Create a new disk service
    pub fn new(
        gateway: OrchestratorGatewayRef,
        config: DiskServiceConfig,
        metrics: Arc<DiskMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            naming: NamingReservationService::new(gateway.clone(), config.naming.clone()),
            quota: QuotaEnforcer::new(gateway.clone(), config.quota.clone()),
            gateway,
            metrics,
            config,
        })
    }

    pub fn gateway(&self) -> &OrchestratorGatewayRef {
        &self.gateway
    }

    pub fn naming(&self) -> &NamingReservationService {
        &self.naming
    }

    pub fn metrics(&self) -> &Arc<DiskMetrics> {
        &self.metrics
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Create a disk, or return the existing one for an identical retry.
    ///
    /// The sequence runs on its own task: a caller that goes away does not
    /// cut it short between reservation and allocation.
    pub async fn create_disk(self: &Arc<Self>, request: DiskRequest) -> Result<Disk> {
        let this = self.clone();
        let result = tokio::spawn(async move { this.provision(request).await })
            .await
            .map_err(|e| Error::Internal(format!("disk creation task failed: {}", e)))?;

        if let Err(e) = &result {
            self.metrics.record_rejection(e);
        }
        result
    }

    async fn provision(&self, mut request: DiskRequest) -> Result<Disk> {
        validate_request(&request)?;
        if request.storage_class.is_none() {
            request.storage_class = self.config.default_storage_class.clone();
        }

        let scope = request.scope.clone();
        self.gateway.ensure_namespace(&scope).await?;

        let disk_id = format!("disk-{}", Uuid::new_v4());
        if let Some(name) = &request.name {
            match self.naming.reserve(&request, name, &disk_id).await? {
                Reservation::Existing(disk) => {
                    info!("Disk {} already exists as {}, returning it", name, disk.id);
                    return Ok(disk);
                }
                Reservation::Reserved(_) => {}
            }
        }

        let admitted = self
            .quota
            .check_and_admit(&scope, request.capacity_bytes)
            .await
            .and_then(|admission| admission.into_result(&scope));
        if let Err(e) = admitted {
            self.release_best_effort(&request, &disk_id).await;
            return Err(e);
        }

        let spec = claim_spec_for(
            &request,
            &disk_id,
            request.storage_class.clone(),
            Utc::now(),
        );
        let claim = match self.gateway.create_claim(spec).await {
            Ok(claim) => claim,
            Err(e) => {
                self.release_best_effort(&request, &disk_id).await;
                return Err(e);
            }
        };

        let disk = Disk::from_claim(&claim)?;
        self.metrics.disks_created.inc();
        info!(
            "Created disk {} ({}) in {}: {} bytes",
            disk.id,
            disk.name.as_deref().unwrap_or("unnamed"),
            scope,
            disk.requested_capacity_bytes
        );
        Ok(disk)
    }

    /// Drop a reservation taken for a creation that did not go through
    async fn release_best_effort(&self, request: &DiskRequest, disk_id: &str) {
        let Some(name) = &request.name else {
            return;
        };
        if let Err(e) = self.naming.release(&request.scope, name, disk_id).await {
            // the watcher clears the orphan later
            warn!(
                "Failed to release name {} in {} after aborted creation: {}",
                name, request.scope, e
            );
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Get a disk by id, falling back to its name
    pub async fn get_disk(&self, scope: &Scope, id_or_name: &str) -> Result<Disk> {
        let key = ResourceKey::new(scope.namespace(), id_or_name);
        if let Some(claim) = self.gateway.find_claim(&key).await? {
            let disk = Disk::from_claim(&claim)?;
            if disk.scope == *scope {
                return Ok(disk);
            }
        }
        self.get_disk_by_name(scope, id_or_name).await
    }

    /// Get a disk through its name reservation
    pub async fn get_disk_by_name(&self, scope: &Scope, name: &str) -> Result<Disk> {
        let not_found = || Error::NotFound {
            kind: DISK_KIND.to_string(),
            name: format!("{}/{}", scope, name),
        };

        let reservation = self.naming.lookup(scope, name).await?.ok_or_else(not_found)?;
        let key = ResourceKey::new(scope.namespace(), reservation.disk_id);
        let claim = self.gateway.find_claim(&key).await?.ok_or_else(not_found)?;
        Disk::from_claim(&claim)
    }

    /// Get a disk by id in any scope
    pub async fn get_disk_by_id(&self, id: &str) -> Result<Disk> {
        let claims = self.gateway.list_claims(&ScopeFilter::all()).await?;
        let claim = claims
            .into_iter()
            .find(|claim| claim.key.name == id)
            .ok_or_else(|| Error::NotFound {
                kind: DISK_KIND.to_string(),
                name: id.to_string(),
            })?;
        Disk::from_claim(&claim)
    }

    /// Disks of a scope that are not being deleted, oldest first
    pub async fn list_disks(&self, scope: &Scope) -> Result<Vec<Disk>> {
        let claims = self.gateway.list_claims(&ScopeFilter::scope(scope)).await?;
        let mut disks: Vec<Disk> = claims
            .iter()
            .filter_map(|claim| match Disk::from_claim(claim) {
                Ok(disk) => Some(disk),
                Err(e) => {
                    warn!("Skipping undecodable claim {}: {}", claim.key, e);
                    None
                }
            })
            .filter(Disk::is_live)
            .collect();
        disks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(disks)
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Delete a disk by id or name
    pub async fn delete_disk(&self, scope: &Scope, id_or_name: &str) -> Result<()> {
        let disk = self.get_disk(scope, id_or_name).await?;
        self.remove_disk(&disk, DeleteReason::Api).await
    }

    /// Delete a disk by id in any scope
    pub async fn delete_disk_by_id(&self, id: &str) -> Result<()> {
        let disk = self.get_disk_by_id(id).await?;
        self.remove_disk(&disk, DeleteReason::Api).await
    }

    /// Move a disk to `Deleting`, then remove its name and claim
    pub async fn remove_disk(&self, disk: &Disk, reason: DeleteReason) -> Result<()> {
        transition(disk.status, DiskEvent::DeleteRequested)?;
        self.mark_deleting(&disk.key()).await?;
        info!("Deleting disk {} in {} ({})", disk.id, disk.scope, reason);

        self.finish_delete(disk).await?;
        self.metrics.record_deleted(reason);
        Ok(())
    }

    /// Versioned Deleting patch; a concurrent deleter makes this fail with
    /// `InvalidTransition`, a spent conflict budget with `Unavailable`
    async fn mark_deleting(&self, key: &ResourceKey) -> Result<()> {
        match self.try_mark_deleting(key).await {
            Err(Error::Conflict { .. }) => {
                let claim = self.gateway.get_claim(key).await?;
                transition(Disk::from_claim(&claim)?.status, DiskEvent::DeleteRequested)?;
                Err(Error::unavailable(
                    "mark disk deleting",
                    format!("{} kept changing, conflict retries exhausted", key),
                ))
            }
            other => other,
        }
    }

    async fn try_mark_deleting(&self, key: &ResourceKey) -> Result<()> {
        let gateway = &self.gateway;
        self.config
            .retry
            .run("mark disk deleting", move |_| async move {
                let claim = gateway.get_claim(key).await?;
                let current = Disk::from_claim(&claim)?;
                transition(current.status, DiskEvent::DeleteRequested)?;

                let mutation = Mutation::new()
                    .expect_version(claim.version.clone())
                    .label(DELETED_LABEL, "true")
                    .annotate(STATUS_ANNOTATION, DiskStatus::Deleting.to_string());
                gateway.patch_claim(key, mutation).await.map(|_| ())
            })
            .await
    }

    /// Remove the name and claim of a disk already in `Deleting`
    pub async fn finish_delete(&self, disk: &Disk) -> Result<()> {
        transition(DiskStatus::Deleting, DiskEvent::Removed)?;

        if let Some(name) = &disk.name {
            self.naming.release(&disk.scope, name, &disk.id).await?;
        }
        let removed = self
            .gateway
            .delete_if_exists(ResourceKind::VolumeClaim, &disk.key())
            .await?;
        debug!("Removed claim for disk {} (present: {})", disk.id, removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::gateway::{GatewayOp, InMemoryConfig, InMemoryGateway};
    use crate::controlplane::lifecycle::DiskState;
    use crate::domain::ports::{OrchestratorGateway, VolumeClaimPhase};
    use assert_matches::assert_matches;
    use std::time::Duration;

    const GI: u64 = 1 << 30;

    fn config(limit: u64) -> DiskServiceConfig {
        DiskServiceConfig {
            default_storage_class: Some("standard".into()),
            naming: NamingConfig {
                reservation_grace: Duration::from_secs(60),
                pending_attempts: 3,
                pending_interval: Duration::from_millis(1),
                retry: ConflictRetry::immediate(3),
            },
            quota: QuotaLimits::uniform(limit),
            retry: ConflictRetry::immediate(3),
        }
    }

    fn setup(limit: u64) -> (Arc<InMemoryGateway>, Arc<DiskService>) {
        let gateway = Arc::new(InMemoryGateway::new(InMemoryConfig::default()));
        let metrics = Arc::new(DiskMetrics::new().unwrap());
        let service = DiskService::new(gateway.clone(), config(limit), metrics);
        (gateway, service)
    }

    fn request(name: Option<&str>, capacity: u64) -> DiskRequest {
        DiskRequest {
            scope: Scope::new("acme", "ml"),
            name: name.map(String::from),
            capacity_bytes: capacity,
            storage_class: None,
            life_span: None,
            requester: "alice".into(),
        }
    }

    #[tokio::test]
    async fn test_create_named_disk() {
        let (gateway, service) = setup(100 * GI);
        let disk = service
            .create_disk(request(Some("logs"), 10 * GI))
            .await
            .unwrap();

        assert!(disk.id.starts_with("disk-"));
        assert_eq!(disk.name.as_deref(), Some("logs"));
        assert_eq!(disk.status, DiskStatus::Pending);
        assert_eq!(disk.storage_class.as_deref(), Some("standard"));
        assert_eq!(gateway.claim_count(), 1);
        assert_eq!(gateway.reservation_count(), 1);
        assert!(gateway.has_namespace(&Scope::new("acme", "ml").namespace()));
        assert_eq!(service.metrics().disks_created.get(), 1);
    }

    #[tokio::test]
    async fn test_identical_retry_returns_same_disk() {
        let (gateway, service) = setup(100 * GI);
        let first = service
            .create_disk(request(Some("logs"), 10 * GI))
            .await
            .unwrap();
        let second = service
            .create_disk(request(Some("logs"), 10 * GI))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(gateway.claim_count(), 1);
        assert_eq!(gateway.reservation_count(), 1);
        assert_eq!(service.metrics().disks_created.get(), 1);
    }

    #[tokio::test]
    async fn test_same_name_different_capacity_is_taken() {
        let (_gateway, service) = setup(100 * GI);
        service
            .create_disk(request(Some("logs"), 10 * GI))
            .await
            .unwrap();
        assert_matches!(
            service.create_disk(request(Some("logs"), 20 * GI)).await,
            Err(Error::NameTaken { .. })
        );
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaks_nothing() {
        let (gateway, service) = setup(15 * GI);
        service
            .create_disk(request(Some("logs"), 10 * GI))
            .await
            .unwrap();

        let err = service
            .create_disk(request(Some("data"), 10 * GI))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::QuotaExceeded { used, limit, requested, .. }
                if used == 10 * GI && limit == 15 * GI && requested == 10 * GI
        );
        assert_eq!(gateway.claim_count(), 1);
        assert_eq!(gateway.reservation_count(), 1);

        // the name is free again
        service
            .create_disk(request(Some("data"), 5 * GI))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_allocation_releases_name() {
        let (gateway, service) = setup(100 * GI);
        gateway.fail_next(GatewayOp::Create, ResourceKind::VolumeClaim, 1);

        assert_matches!(
            service.create_disk(request(Some("logs"), GI)).await,
            Err(Error::Unavailable { .. })
        );
        assert_eq!(gateway.claim_count(), 0);
        assert_eq!(gateway.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_unnamed_disk_skips_reservation() {
        let (gateway, service) = setup(100 * GI);
        let disk = service.create_disk(request(None, GI)).await.unwrap();
        assert!(disk.name.is_none());
        assert_eq!(gateway.reservation_count(), 0);

        // quota still applies
        let (_gateway, service) = setup(GI);
        assert_matches!(
            service.create_disk(request(None, 2 * GI)).await,
            Err(Error::QuotaExceeded { .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (gateway, service) = setup(100 * GI);
        assert_matches!(
            service.create_disk(request(Some("Logs!"), GI)).await,
            Err(Error::ApiValidation(_))
        );
        assert_matches!(
            service.create_disk(request(Some("logs"), 0)).await,
            Err(Error::ApiValidation(_))
        );
        assert_eq!(gateway.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_get_by_id_and_name() {
        let (_gateway, service) = setup(100 * GI);
        let scope = Scope::new("acme", "ml");
        let disk = service
            .create_disk(request(Some("logs"), GI))
            .await
            .unwrap();

        assert_eq!(service.get_disk(&scope, &disk.id).await.unwrap().id, disk.id);
        assert_eq!(service.get_disk(&scope, "logs").await.unwrap().id, disk.id);
        assert_eq!(service.get_disk_by_id(&disk.id).await.unwrap().id, disk.id);
        assert_matches!(
            service.get_disk(&scope, "nope").await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            service.get_disk(&Scope::new("acme", "web"), "logs").await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_list_disks() {
        let (_gateway, service) = setup(100 * GI);
        service.create_disk(request(Some("a"), GI)).await.unwrap();
        service.create_disk(request(Some("b"), GI)).await.unwrap();
        let mut other = request(Some("a"), GI);
        other.scope = Scope::new("acme", "web");
        service.create_disk(other).await.unwrap();

        let disks = service.list_disks(&Scope::new("acme", "ml")).await.unwrap();
        assert_eq!(disks.len(), 2);
        assert!(disks.iter().all(|d| d.scope == Scope::new("acme", "ml")));
    }

    #[tokio::test]
    async fn test_delete_disk() {
        let (gateway, service) = setup(100 * GI);
        let scope = Scope::new("acme", "ml");
        let disk = service
            .create_disk(request(Some("logs"), GI))
            .await
            .unwrap();
        gateway
            .set_phase(&disk.key(), VolumeClaimPhase::Bound)
            .unwrap();

        service.delete_disk(&scope, "logs").await.unwrap();
        assert_eq!(gateway.claim_count(), 0);
        assert_eq!(gateway.reservation_count(), 0);
        assert_eq!(service.metrics().deleted(DeleteReason::Api), 1);
        assert_matches!(
            service.delete_disk(&scope, "logs").await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_of_deleting_disk_is_invalid() {
        let (gateway, service) = setup(100 * GI);
        let disk = service
            .create_disk(request(Some("logs"), GI))
            .await
            .unwrap();
        gateway
            .patch(
                ResourceKind::VolumeClaim,
                &disk.key(),
                Mutation::new().label(DELETED_LABEL, "true"),
            )
            .await
            .unwrap();

        let err = service
            .delete_disk_by_id(&disk.id)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::InvalidTransition {
                from: DiskState::Deleting,
                event: DiskEvent::DeleteRequested
            }
        );
        assert_eq!(gateway.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_retries_conflicts() {
        let (gateway, service) = setup(100 * GI);
        let disk = service.create_disk(request(None, GI)).await.unwrap();

        gateway.inject_conflicts(2);
        service.remove_disk(&disk, DeleteReason::Api).await.unwrap();
        assert_eq!(gateway.claim_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_conflicts_never_surface() {
        let (gateway, service) = setup(100 * GI);
        let scope = Scope::new("acme", "ml");
        service
            .create_disk(request(Some("logs"), GI))
            .await
            .unwrap();

        gateway.inject_conflicts(10);
        assert_matches!(
            service.delete_disk(&scope, "logs").await,
            Err(Error::Unavailable { .. })
        );
        assert_eq!(gateway.claim_count(), 1);
        assert_eq!(gateway.reservation_count(), 1);

        gateway.inject_conflicts(0);
        service.delete_disk(&scope, "logs").await.unwrap();
        assert_eq!(gateway.claim_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_surfaces_immediately() {
        let (gateway, service) = setup(100 * GI);
        gateway.set_unavailable(true);
        assert_matches!(
            service.list_disks(&Scope::new("acme", "ml")).await,
            Err(Error::Unavailable { .. })
        );
        assert_eq!(gateway.calls(GatewayOp::List, ResourceKind::VolumeClaim), 1);
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_create_still_allocates() {
        let (gateway, service) = setup(100 * GI);
        let gate = gateway.hold(GatewayOp::Create, ResourceKind::VolumeClaim);

        let caller = tokio::spawn({
            let service = service.clone();
            async move { service.create_disk(request(Some("logs"), GI)).await }
        });
        wait_until(|| gateway.reservation_count() == 1).await;

        // the caller goes away between reservation and allocation
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(gateway.claim_count(), 0);

        gate.add_permits(1);
        wait_until(|| gateway.claim_count() == 1).await;
        assert_eq!(gateway.reservation_count(), 1);

        let disk = service
            .get_disk(&Scope::new("acme", "ml"), "logs")
            .await
            .unwrap();
        assert_eq!(disk.name.as_deref(), Some("logs"));
        assert_eq!(service.metrics().disks_created.get(), 1);
    }

    #[tokio::test]
    async fn test_sequential_creates_stay_within_limit() {
        let (_gateway, service) = setup(10 * GI);
        let scope = Scope::new("acme", "ml");

        let mut admitted = 0;
        for _ in 0..5 {
            match service.create_disk(request(None, 3 * GI)).await {
                Ok(_) => admitted += 1,
                Err(e) => assert_matches!(e, Error::QuotaExceeded { .. }),
            }
        }
        assert_eq!(admitted, 3);

        let used: u64 = service
            .list_disks(&scope)
            .await
            .unwrap()
            .iter()
            .map(|d| d.requested_capacity_bytes)
            .sum();
        assert_eq!(used, 9 * GI);
    }

    #[tokio::test]
    async fn test_concurrent_creates_over_admit_at_most_the_window() {
        const RACERS: u64 = 8;
        let (_gateway, service) = setup(10 * GI);
        let scope = Scope::new("acme", "ml");
        service.create_disk(request(None, 8 * GI)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..RACERS {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.create_disk(request(None, GI)).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => assert_matches!(e, Error::QuotaExceeded { .. }),
            }
        }

        // the first listing sees only the full disk, so something fits
        assert!(admitted >= 1);
        let used: u64 = service
            .list_disks(&scope)
            .await
            .unwrap()
            .iter()
            .map(|d| d.requested_capacity_bytes)
            .sum();
        assert_eq!(used, 8 * GI + admitted * GI);
        assert!(used <= 10 * GI + RACERS * GI);

        // once the window closes, nothing more gets in
        assert_matches!(
            service.create_disk(request(None, 2 * GI)).await,
            Err(Error::QuotaExceeded { .. })
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_name_creates_one_disk() {
        let (gateway, service) = setup(100 * GI);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.create_disk(request(Some("logs"), GI)).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(disk) => ids.push(disk.id),
                Err(e) => assert_matches!(e, Error::NameTaken { .. }),
            }
        }

        assert!(!ids.is_empty());
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(gateway.claim_count(), 1);
        assert_eq!(gateway.reservation_count(), 1);
    }
}
