//! In-memory orchestrator gateway
//!
//! Versioned resource store with the same create/patch semantics as the API
//! server. Used for standalone mode and as the orchestrator double in tests,
//! with hooks to simulate binding, usage, out-of-band deletes and faults.

use crate::domain::disk::{Scope, MANAGED_LABEL};
use crate::domain::ports::{
    Mutation, NameReservation, OrchestratorGateway, Resource, ResourceKey, ResourceKind,
    ResourceSpec, ScopeFilter, UsageSample, VolumeClaim, VolumeClaimPhase,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory gateway
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfig {
    /// Bind claims on creation, as an eager provisioner would
    pub auto_bind: bool,
}

/// Gateway operations, for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GatewayOp {
    Create,
    Get,
    List,
    Delete,
    Patch,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct StoreState {
    claims: BTreeMap<ResourceKey, VolumeClaim>,
    reservations: BTreeMap<ResourceKey, NameReservation>,
    namespaces: BTreeSet<String>,
    usage: BTreeMap<ResourceKey, u64>,
    mounted: BTreeSet<ResourceKey>,
    next_version: u64,
}

impl StoreState {
    fn bump(&mut self) -> Option<String> {
        self.next_version += 1;
        Some(self.next_version.to_string())
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_next: BTreeMap<(GatewayOp, ResourceKind), u32>,
    conflicts: u32,
    calls: BTreeMap<(GatewayOp, ResourceKind), u64>,
    gates: BTreeMap<(GatewayOp, ResourceKind), Arc<Semaphore>>,
}

// =============================================================================
// In-Memory Gateway
// =============================================================================

/// In-memory gateway
pub struct InMemoryGateway {
    config: InMemoryConfig,
    state: RwLock<StoreState>,
    faults: Mutex<Faults>,
}

impl InMemoryGateway {
    /// Create a new in-memory gateway
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(StoreState::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Wait for a permit if the operation is held
    async fn pass_gate(&self, op: GatewayOp, kind: ResourceKind) {
        let gate = self.faults.lock().gates.get(&(op, kind)).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    /// Check injected faults for an operation
    fn enter(&self, op: GatewayOp, kind: ResourceKind) -> Result<()> {
        let mut faults = self.faults.lock();
        *faults.calls.entry((op, kind)).or_default() += 1;

        if faults.unavailable {
            return Err(Error::unavailable(format!("{:?} {}", op, kind), "injected outage"));
        }
        if let Some(remaining) = faults.fail_next.get_mut(&(op, kind)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::unavailable(format!("{:?} {}", op, kind), "injected failure"));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Simulation hooks
    // -------------------------------------------------------------------------

    /// Make every call fail with `Unavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Fail the next `count` calls of one operation on one kind
    pub fn fail_next(&self, op: GatewayOp, kind: ResourceKind, count: u32) {
        self.faults.lock().fail_next.insert((op, kind), count);
    }

    /// Reject the next `count` versioned patches with `Conflict`
    pub fn inject_conflicts(&self, count: u32) {
        self.faults.lock().conflicts = count;
    }

    /// Park every later call of one operation on one kind until the returned
    /// semaphore hands out a permit for it
    pub fn hold(&self, op: GatewayOp, kind: ResourceKind) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.faults.lock().gates.insert((op, kind), gate.clone());
        gate
    }

    /// Number of calls seen for an operation on a kind
    pub fn calls(&self, op: GatewayOp, kind: ResourceKind) -> u64 {
        self.faults
            .lock()
            .calls
            .get(&(op, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Set the binding phase of a claim, as the provisioner would
    pub fn set_phase(&self, key: &ResourceKey, phase: VolumeClaimPhase) -> Result<()> {
        let mut state = self.state.write();
        let version = state.bump();
        let claim = state
            .claims
            .get_mut(key)
            .ok_or_else(|| not_found(ResourceKind::VolumeClaim, key))?;
        claim.phase = phase;
        if phase == VolumeClaimPhase::Bound && claim.capacity_bytes.is_none() {
            claim.capacity_bytes = Some(claim.requested_bytes);
        }
        claim.version = version;
        Ok(())
    }

    /// Report live usage for a claim
    pub fn record_usage(&self, key: &ResourceKey, used_bytes: u64) {
        self.state.write().usage.insert(key.clone(), used_bytes);
    }

    /// Mark a claim as mounted (or not) by a running workload
    pub fn set_mounted(&self, key: &ResourceKey, mounted: bool) {
        let mut state = self.state.write();
        if mounted {
            state.mounted.insert(key.clone());
        } else {
            state.mounted.remove(key);
        }
    }

    /// Delete a resource behind the control plane's back
    pub fn remove_out_of_band(&self, kind: ResourceKind, key: &ResourceKey) -> bool {
        let mut state = self.state.write();
        match kind {
            ResourceKind::VolumeClaim => state.claims.remove(key).is_some(),
            ResourceKind::NameReservation => state.reservations.remove(key).is_some(),
        }
    }

    /// Insert a claim as-is (e.g. one created by another tool)
    pub fn insert_claim(&self, mut claim: VolumeClaim) {
        let mut state = self.state.write();
        claim.version = state.bump();
        state.claims.insert(claim.key.clone(), claim);
    }

    /// Insert a reservation as-is
    pub fn insert_reservation(&self, mut reservation: NameReservation) {
        let mut state = self.state.write();
        reservation.version = state.bump();
        state
            .reservations
            .insert(reservation.key.clone(), reservation);
    }

    pub fn claim_count(&self) -> usize {
        self.state.read().claims.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.state.read().reservations.len()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.read().namespaces.contains(namespace)
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

fn is_managed(claim: &VolumeClaim) -> bool {
    claim.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
}

fn not_found(kind: ResourceKind, key: &ResourceKey) -> Error {
    Error::NotFound {
        kind: kind.to_string(),
        name: key.to_string(),
    }
}

#[async_trait]
impl OrchestratorGateway for InMemoryGateway {
    async fn create(&self, spec: ResourceSpec) -> Result<Resource> {
        // Suspension point, so concurrent callers interleave like real I/O
        tokio::task::yield_now().await;
        self.pass_gate(GatewayOp::Create, spec.kind()).await;
        self.enter(GatewayOp::Create, spec.kind())?;

        let mut state = self.state.write();
        let kind = spec.kind();
        let key = spec.key().clone();
        let exists = match kind {
            ResourceKind::VolumeClaim => state.claims.contains_key(&key),
            ResourceKind::NameReservation => state.reservations.contains_key(&key),
        };
        if exists {
            return Err(Error::AlreadyExists {
                kind: kind.to_string(),
                name: key.to_string(),
            });
        }

        let version = state.bump();
        let now = Utc::now();
        let resource = match spec {
            ResourceSpec::VolumeClaim(spec) => {
                let (phase, capacity_bytes) = if self.config.auto_bind {
                    (VolumeClaimPhase::Bound, Some(spec.requested_bytes))
                } else {
                    (VolumeClaimPhase::Pending, None)
                };
                let claim = VolumeClaim {
                    key: spec.key,
                    storage_class: spec.storage_class,
                    requested_bytes: spec.requested_bytes,
                    capacity_bytes,
                    phase,
                    labels: spec.labels,
                    annotations: spec.annotations,
                    version,
                    created_at: Some(now),
                };
                state.claims.insert(key.clone(), claim.clone());
                Resource::VolumeClaim(claim)
            }
            ResourceSpec::NameReservation(spec) => {
                let reservation = NameReservation {
                    key: spec.key,
                    disk_id: spec.disk_id,
                    labels: spec.labels,
                    reserved_at: Some(spec.reserved_at),
                    version,
                    created_at: Some(now),
                };
                state.reservations.insert(key.clone(), reservation.clone());
                Resource::NameReservation(reservation)
            }
        };

        debug!("Created {} {}", kind, key);
        Ok(resource)
    }

    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Resource> {
        tokio::task::yield_now().await;
        self.pass_gate(GatewayOp::Get, kind).await;
        self.enter(GatewayOp::Get, kind)?;

        let state = self.state.read();
        let resource = match kind {
            ResourceKind::VolumeClaim => state.claims.get(key).cloned().map(Resource::VolumeClaim),
            ResourceKind::NameReservation => state
                .reservations
                .get(key)
                .cloned()
                .map(Resource::NameReservation),
        };
        resource.ok_or_else(|| not_found(kind, key))
    }

    async fn list(&self, kind: ResourceKind, filter: &ScopeFilter) -> Result<Vec<Resource>> {
        tokio::task::yield_now().await;
        self.pass_gate(GatewayOp::List, kind).await;
        self.enter(GatewayOp::List, kind)?;

        let state = self.state.read();
        let resources = match kind {
            ResourceKind::VolumeClaim => state
                .claims
                .values()
                .filter(|c| is_managed(c) && filter.matches(&c.labels))
                .cloned()
                .map(Resource::VolumeClaim)
                .collect(),
            ResourceKind::NameReservation => state
                .reservations
                .values()
                .filter(|r| filter.matches(&r.labels))
                .cloned()
                .map(Resource::NameReservation)
                .collect(),
        };
        Ok(resources)
    }

    async fn delete(&self, kind: ResourceKind, key: &ResourceKey) -> Result<()> {
        tokio::task::yield_now().await;
        self.pass_gate(GatewayOp::Delete, kind).await;
        self.enter(GatewayOp::Delete, kind)?;

        let mut state = self.state.write();
        let removed = match kind {
            ResourceKind::VolumeClaim => {
                state.usage.remove(key);
                state.mounted.remove(key);
                state.claims.remove(key).is_some()
            }
            ResourceKind::NameReservation => state.reservations.remove(key).is_some(),
        };
        if removed {
            debug!("Deleted {} {}", kind, key);
            Ok(())
        } else {
            Err(not_found(kind, key))
        }
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        mutation: Mutation,
    ) -> Result<Resource> {
        tokio::task::yield_now().await;
        self.pass_gate(GatewayOp::Patch, kind).await;
        self.enter(GatewayOp::Patch, kind)?;

        if mutation.expected_version.is_some() {
            let mut faults = self.faults.lock();
            if faults.conflicts > 0 {
                faults.conflicts -= 1;
                return Err(Error::Conflict {
                    kind: kind.to_string(),
                    name: key.to_string(),
                });
            }
        }

        let mut state = self.state.write();
        let current = match kind {
            ResourceKind::VolumeClaim => state.claims.get(key).map(|c| c.version.clone()),
            ResourceKind::NameReservation => {
                state.reservations.get(key).map(|r| r.version.clone())
            }
        }
        .ok_or_else(|| not_found(kind, key))?;

        if let Some(expected) = &mutation.expected_version {
            if current.as_ref() != Some(expected) {
                return Err(Error::Conflict {
                    kind: kind.to_string(),
                    name: key.to_string(),
                });
            }
        }

        let version = state.bump();
        let resource = match kind {
            ResourceKind::VolumeClaim => {
                let claim = state
                    .claims
                    .get_mut(key)
                    .ok_or_else(|| not_found(kind, key))?;
                claim.labels.extend(mutation.labels);
                claim.annotations.extend(mutation.annotations);
                claim.version = version;
                Resource::VolumeClaim(claim.clone())
            }
            ResourceKind::NameReservation => {
                let reservation = state
                    .reservations
                    .get_mut(key)
                    .ok_or_else(|| not_found(kind, key))?;
                reservation.labels.extend(mutation.labels);
                if let Some(disk_id) = mutation.disk_id {
                    reservation.disk_id = disk_id;
                }
                if mutation.reserved_at.is_some() {
                    reservation.reserved_at = mutation.reserved_at;
                }
                reservation.version = version;
                Resource::NameReservation(reservation.clone())
            }
        };
        Ok(resource)
    }

    async fn ensure_namespace(&self, scope: &Scope) -> Result<String> {
        tokio::task::yield_now().await;
        let namespace = scope.namespace();
        self.state.write().namespaces.insert(namespace.clone());
        Ok(namespace)
    }

    async fn usage_samples(&self) -> Result<Vec<UsageSample>> {
        tokio::task::yield_now().await;
        if self.faults.lock().unavailable {
            return Err(Error::unavailable("usage_samples", "injected outage"));
        }
        let state = self.state.read();
        Ok(state
            .usage
            .iter()
            .map(|(key, used)| UsageSample {
                key: key.clone(),
                used_bytes: *used,
            })
            .collect())
    }

    async fn mounted_claims(&self) -> Result<Vec<ResourceKey>> {
        tokio::task::yield_now().await;
        if self.faults.lock().unavailable {
            return Err(Error::unavailable("mounted_claims", "injected outage"));
        }
        Ok(self.state.read().mounted.iter().cloned().collect())
    }

    fn gateway_name(&self) -> &str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{NameReservationSpec, VolumeClaimSpec};
    use assert_matches::assert_matches;

    fn reservation_spec(name: &str, disk_id: &str) -> ResourceSpec {
        ResourceSpec::NameReservation(NameReservationSpec {
            key: ResourceKey::new("ns", name),
            disk_id: disk_id.into(),
            labels: Scope::new("acme", "ml").labels(),
            reserved_at: Utc::now(),
        })
    }

    fn claim_spec(name: &str) -> ResourceSpec {
        let mut labels = Scope::new("acme", "ml").labels();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        ResourceSpec::VolumeClaim(VolumeClaimSpec {
            key: ResourceKey::new("ns", name),
            storage_class: None,
            requested_bytes: 1024,
            labels,
            annotations: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let gateway = InMemoryGateway::default();
        gateway.create(reservation_spec("logs", "disk-1")).await.unwrap();
        let err = gateway
            .create(reservation_spec("logs", "disk-2"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });

        let stored = gateway
            .get(ResourceKind::NameReservation, &ResourceKey::new("ns", "logs"))
            .await
            .unwrap()
            .into_name_reservation()
            .unwrap();
        assert_eq!(stored.disk_id, "disk-1");
    }

    #[tokio::test]
    async fn test_versioned_patch_conflicts() {
        let gateway = InMemoryGateway::default();
        let created = gateway.create(claim_spec("disk-1")).await.unwrap();
        let key = created.key().clone();
        let stale = created.version().map(String::from);

        gateway
            .patch(
                ResourceKind::VolumeClaim,
                &key,
                Mutation::new().annotate("a", "1").expect_version(stale.clone()),
            )
            .await
            .unwrap();

        let err = gateway
            .patch(
                ResourceKind::VolumeClaim,
                &key,
                Mutation::new().annotate("a", "2").expect_version(stale),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict { .. });

        // unversioned patches always apply
        let claim = gateway
            .patch(ResourceKind::VolumeClaim, &key, Mutation::new().annotate("a", "3"))
            .await
            .unwrap()
            .into_volume_claim()
            .unwrap();
        assert_eq!(claim.annotations["a"], "3");
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let gateway = InMemoryGateway::default();
        gateway.create(claim_spec("disk-1")).await.unwrap();
        let key = ResourceKey::new("ns", "disk-1");

        gateway.delete(ResourceKind::VolumeClaim, &key).await.unwrap();
        assert_matches!(
            gateway.delete(ResourceKind::VolumeClaim, &key).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            gateway.get(ResourceKind::VolumeClaim, &key).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_scope() {
        let gateway = InMemoryGateway::default();
        gateway.create(claim_spec("disk-1")).await.unwrap();
        let other = Scope::new("acme", "web");

        let mine = gateway
            .list(ResourceKind::VolumeClaim, &ScopeFilter::scope(&Scope::new("acme", "ml")))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        let theirs = gateway
            .list(ResourceKind::VolumeClaim, &ScopeFilter::scope(&other))
            .await
            .unwrap();
        assert!(theirs.is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let gateway = InMemoryGateway::default();
        gateway.fail_next(GatewayOp::Create, ResourceKind::VolumeClaim, 1);
        assert_matches!(
            gateway.create(claim_spec("disk-1")).await,
            Err(Error::Unavailable { .. })
        );
        gateway.create(claim_spec("disk-1")).await.unwrap();
        assert_eq!(gateway.calls(GatewayOp::Create, ResourceKind::VolumeClaim), 2);

        gateway.set_unavailable(true);
        assert!(gateway.usage_samples().await.is_err());
        gateway.set_unavailable(false);
        assert!(gateway.usage_samples().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_bind() {
        let gateway = InMemoryGateway::new(InMemoryConfig { auto_bind: true });
        let claim = gateway
            .create(claim_spec("disk-1"))
            .await
            .unwrap()
            .into_volume_claim()
            .unwrap();
        assert_eq!(claim.phase, VolumeClaimPhase::Bound);
        assert_eq!(claim.capacity_bytes, Some(1024));
    }
}
