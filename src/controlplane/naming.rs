//! Naming Reservation Service
//!
//! A disk name is claimed by creating a `NameReservation` keyed by
//! (scope namespace, name). The orchestrator's create-if-absent check decides
//! races; a losing caller inspects the winner's reservation and either gets
//! the same disk back (idempotent retry), waits for an in-flight winner, takes
//! over an orphaned reservation, or fails with `NameTaken`.

use crate::controlplane::gateway::GatewayExt;
use crate::controlplane::retry::ConflictRetry;
use crate::domain::disk::{Disk, DiskRequest, Scope};
use crate::domain::ports::{
    Mutation, NameReservation, NameReservationSpec, OrchestratorGatewayRef, ResourceKey,
    ResourceKind,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Set on a reservation that the watcher is about to remove
pub const RELEASING_LABEL: &str = "disks.platform.io/releasing";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for name reservations
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// A reservation without a claim is only treated as orphaned after this
    pub reservation_grace: Duration,
    /// How often to re-check a reservation whose claim is still being created
    pub pending_attempts: u32,
    pub pending_interval: Duration,
    /// Budget for restarting a reservation attempt after a conflict
    pub retry: ConflictRetry,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            reservation_grace: Duration::from_secs(60),
            pending_attempts: 5,
            pending_interval: Duration::from_millis(200),
            retry: ConflictRetry::default(),
        }
    }
}

/// Outcome of reserving a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The name now points at the new disk id
    Reserved(NameReservation),
    /// The name already points at a live disk created by the same request
    Existing(Disk),
}

/// Key of the reservation for a name in a scope
pub fn reservation_key(scope: &Scope, name: &str) -> ResourceKey {
    ResourceKey::new(scope.namespace(), name)
}

fn claim_key_for(reservation: &NameReservation) -> ResourceKey {
    ResourceKey::new(
        reservation.key.namespace.clone(),
        reservation.disk_id.clone(),
    )
}

fn restart(key: &ResourceKey) -> Error {
    Error::Conflict {
        kind: ResourceKind::NameReservation.to_string(),
        name: key.to_string(),
    }
}

// =============================================================================
// Naming Reservation Service
// =============================================================================

/// Name reservation service
pub struct NamingReservationService {
    gateway: OrchestratorGatewayRef,
    config: NamingConfig,
}

impl NamingReservationService {
    /// Create a new naming service
    pub fn new(gateway: OrchestratorGatewayRef, config: NamingConfig) -> Self {
        Self { gateway, config }
    }

    /// Whether a reservation without a claim is old enough to be reclaimed
    pub fn is_past_grace(&self, reservation: &NameReservation, now: DateTime<Utc>) -> bool {
        reservation.bound_since().map_or(true, |since| {
            (now - since)
                .to_std()
                .map_or(false, |age| age > self.config.reservation_grace)
        })
    }

    /// Reserve `name` for `disk_id`.
    ///
    /// `Existing` is returned when the name already belongs to a live disk
    /// that `request` describes; any other holder yields `NameTaken`.
    pub async fn reserve(
        &self,
        request: &DiskRequest,
        name: &str,
        disk_id: &str,
    ) -> Result<Reservation> {
        let key = &reservation_key(&request.scope, name);
        let this = self;
        let result = self
            .config
            .retry
            .run("name reservation", move |_| async move {
                this.try_reserve(request, key, disk_id).await
            })
            .await;

        match result {
            // conflicts never leave this service
            Err(Error::Conflict { .. }) => Err(Error::NameTaken {
                scope: request.scope.to_string(),
                name: name.to_string(),
            }),
            other => other,
        }
    }

    async fn try_reserve(
        &self,
        request: &DiskRequest,
        key: &ResourceKey,
        disk_id: &str,
    ) -> Result<Reservation> {
        let spec = NameReservationSpec {
            key: key.clone(),
            disk_id: disk_id.to_string(),
            labels: request.scope.labels(),
            reserved_at: Utc::now(),
        };

        match self.gateway.create_reservation(spec).await {
            Ok(reservation) => {
                debug!("Reserved name {} for {}", key, disk_id);
                return Ok(Reservation::Reserved(reservation));
            }
            Err(Error::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }

        self.resolve_taken(request, key, disk_id).await
    }

    /// The name is held: find out by whom
    async fn resolve_taken(
        &self,
        request: &DiskRequest,
        key: &ResourceKey,
        disk_id: &str,
    ) -> Result<Reservation> {
        let taken = || Error::NameTaken {
            scope: request.scope.to_string(),
            name: key.name.clone(),
        };

        let attempts = self.config.pending_attempts.max(1);
        for attempt in 1..=attempts {
            let reservation = match self.gateway.get_reservation(key).await {
                Ok(reservation) => reservation,
                // released since our create; start over
                Err(e) if e.is_not_found() => return Err(restart(key)),
                Err(e) => return Err(e),
            };

            if let Some(claim) = self.gateway.find_claim(&claim_key_for(&reservation)).await? {
                let disk = Disk::from_claim(&claim)?;
                if disk.is_live() && disk.matches_request(request) {
                    debug!("Name {} already belongs to {}", key, disk.id);
                    return Ok(Reservation::Existing(disk));
                }
                return Err(taken());
            }

            if reservation.labels.contains_key(RELEASING_LABEL) {
                return Err(restart(key));
            }

            if self.is_past_grace(&reservation, Utc::now()) {
                return self.reclaim(reservation, disk_id).await;
            }

            // the holder has reserved but not yet allocated
            if attempt < attempts {
                tokio::time::sleep(self.config.pending_interval).await;
            }
        }

        Err(taken())
    }

    /// Retarget an orphaned reservation at `disk_id`.
    ///
    /// The reservation is re-read and its claim re-checked right before the
    /// patch, and the patch is conditioned on the re-read version.
    async fn reclaim(&self, observed: NameReservation, disk_id: &str) -> Result<Reservation> {
        let fresh = match self.gateway.get_reservation(&observed.key).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => return Err(restart(&observed.key)),
            Err(e) => return Err(e),
        };
        if fresh.version != observed.version || fresh.disk_id != observed.disk_id {
            return Err(restart(&observed.key));
        }
        if self.gateway.find_claim(&claim_key_for(&fresh)).await?.is_some() {
            return Err(restart(&observed.key));
        }

        let mutation = Mutation::new()
            .expect_version(fresh.version.clone())
            .retarget(disk_id, Utc::now());
        let reservation = self.gateway.patch_reservation(&fresh.key, mutation).await?;

        info!(
            "Reclaimed orphaned name {} from {} for {}",
            fresh.key, fresh.disk_id, disk_id
        );
        Ok(Reservation::Reserved(reservation))
    }

    /// Look up the reservation for a name
    pub async fn lookup(&self, scope: &Scope, name: &str) -> Result<Option<NameReservation>> {
        match self.gateway.get_reservation(&reservation_key(scope, name)).await {
            Ok(reservation) => Ok(Some(reservation)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the reservation for `name` if it still points at `disk_id`
    pub async fn release(&self, scope: &Scope, name: &str, disk_id: &str) -> Result<bool> {
        let Some(reservation) = self.lookup(scope, name).await? else {
            return Ok(false);
        };
        if reservation.disk_id != disk_id {
            debug!(
                "Not releasing {}: it points at {}, not {}",
                reservation.key, reservation.disk_id, disk_id
            );
            return Ok(false);
        }
        self.gateway
            .delete_if_exists(ResourceKind::NameReservation, &reservation.key)
            .await
    }

    /// Remove a reservation whose claim is gone.
    ///
    /// Returns `false` when the reservation is still within its grace period,
    /// got a claim, or changed since it was listed.
    pub async fn clear_orphan(
        &self,
        observed: &NameReservation,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.is_past_grace(observed, now) {
            return Ok(false);
        }
        if self.gateway.find_claim(&claim_key_for(observed)).await?.is_some() {
            return Ok(false);
        }

        // mark first, conditioned on the listed version, so a concurrent
        // reclaim and this removal cannot both win
        let mutation = Mutation::new()
            .expect_version(observed.version.clone())
            .label(RELEASING_LABEL, "true");
        let marked = match self.gateway.patch_reservation(&observed.key, mutation).await {
            Ok(marked) => marked,
            Err(Error::Conflict { .. }) | Err(Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        if self.gateway.find_claim(&claim_key_for(&marked)).await?.is_some() {
            warn!(
                "Claim for {} appeared while releasing its name; keeping it",
                marked.key
            );
            return Ok(false);
        }

        let removed = self
            .gateway
            .delete_if_exists(ResourceKind::NameReservation, &marked.key)
            .await?;
        if removed {
            info!(
                "Cleared orphaned name reservation {} (target {} is gone)",
                marked.key, marked.disk_id
            );
        }
        Ok(removed)
    }
}
