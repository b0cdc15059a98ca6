//! Orchestrator Gateway Adapters
//!
//! Provides the two implementations of [`OrchestratorGateway`]:
//! - Kubernetes: claims are PersistentVolumeClaims, reservations are DiskNamings
//! - In-memory: versioned store for standalone mode and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;

use crate::domain::ports::{
    Mutation, NameReservation, OrchestratorGateway, OrchestratorGatewayRef, ResourceKey,
    ResourceKind, ResourceSpec, ScopeFilter, VolumeClaim, VolumeClaimSpec, NameReservationSpec,
};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Factory for creating gateway adapters
pub struct GatewayFactory;

impl GatewayFactory {
    /// Gateway backed by the Kubernetes API server
    pub fn kube(client: kube::Client, config: KubeGatewayConfig) -> OrchestratorGatewayRef {
        Arc::new(KubeGateway::new(client, config))
    }

    /// Gateway backed by process memory
    pub fn in_memory(config: InMemoryConfig) -> Arc<InMemoryGateway> {
        Arc::new(InMemoryGateway::new(config))
    }
}

// =============================================================================
// Typed Helpers
// =============================================================================

/// Kind-specific wrappers over the generic gateway operations
#[async_trait]
pub trait GatewayExt: OrchestratorGateway {
    async fn create_claim(&self, spec: VolumeClaimSpec) -> Result<VolumeClaim> {
        self.create(ResourceSpec::VolumeClaim(spec))
            .await?
            .into_volume_claim()
    }

    async fn create_reservation(&self, spec: NameReservationSpec) -> Result<NameReservation> {
        self.create(ResourceSpec::NameReservation(spec))
            .await?
            .into_name_reservation()
    }

    async fn get_claim(&self, key: &ResourceKey) -> Result<VolumeClaim> {
        self.get(ResourceKind::VolumeClaim, key)
            .await?
            .into_volume_claim()
    }

    async fn get_reservation(&self, key: &ResourceKey) -> Result<NameReservation> {
        self.get(ResourceKind::NameReservation, key)
            .await?
            .into_name_reservation()
    }

    /// Fetch a claim, mapping `NotFound` to `None`
    async fn find_claim(&self, key: &ResourceKey) -> Result<Option<VolumeClaim>> {
        match self.get_claim(key).await {
            Ok(claim) => Ok(Some(claim)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_claims(&self, filter: &ScopeFilter) -> Result<Vec<VolumeClaim>> {
        self.list(ResourceKind::VolumeClaim, filter)
            .await?
            .into_iter()
            .map(|r| r.into_volume_claim())
            .collect()
    }

    async fn list_reservations(&self, filter: &ScopeFilter) -> Result<Vec<NameReservation>> {
        self.list(ResourceKind::NameReservation, filter)
            .await?
            .into_iter()
            .map(|r| r.into_name_reservation())
            .collect()
    }

    async fn patch_claim(&self, key: &ResourceKey, mutation: Mutation) -> Result<VolumeClaim> {
        self.patch(ResourceKind::VolumeClaim, key, mutation)
            .await?
            .into_volume_claim()
    }

    async fn patch_reservation(
        &self,
        key: &ResourceKey,
        mutation: Mutation,
    ) -> Result<NameReservation> {
        self.patch(ResourceKind::NameReservation, key, mutation)
            .await?
            .into_name_reservation()
    }

    /// Delete a resource; returns `false` if it was already gone
    async fn delete_if_exists(&self, kind: ResourceKind, key: &ResourceKey) -> Result<bool> {
        match self.delete(kind, key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<T: OrchestratorGateway + ?Sized> GatewayExt for T {}
