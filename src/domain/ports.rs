//! Domain Ports - Orchestrator gateway boundary
//!
//! The gateway is the only component that talks to the orchestrator. Both
//! resource kinds it manages go through one operation set parameterized by
//! [`ResourceKind`]; typed helpers live in `controlplane::gateway`.

use crate::domain::disk::Scope;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Resource Identity
// =============================================================================

/// Resource kinds managed through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Generic block-storage claim
    VolumeClaim,
    /// Custom name reservation record
    NameReservation,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::VolumeClaim => write!(f, "PersistentVolumeClaim"),
            ResourceKind::NameReservation => write!(f, "DiskNaming"),
        }
    }
}

/// Namespaced resource address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Label-based list filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    pub org: Option<String>,
    pub project: Option<String>,
}

impl ScopeFilter {
    /// Match resources of every scope
    pub fn all() -> Self {
        Self::default()
    }

    /// Match resources of one scope
    pub fn scope(scope: &Scope) -> Self {
        Self {
            org: Some(scope.org.clone()),
            project: Some(scope.project.clone()),
        }
    }

    /// The exact scope, when both halves are set
    pub fn as_scope(&self) -> Option<Scope> {
        match (&self.org, &self.project) {
            (Some(org), Some(project)) => Some(Scope::new(org.clone(), project.clone())),
            _ => None,
        }
    }

    /// Whether a label set passes this filter
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        use crate::domain::disk::{ORG_LABEL, PROJECT_LABEL};

        let check = |want: &Option<String>, key: &str| {
            want.as_ref()
                .map_or(true, |want| labels.get(key) == Some(want))
        };
        check(&self.org, ORG_LABEL) && check(&self.project, PROJECT_LABEL)
    }
}

// =============================================================================
// Volume Claims
// =============================================================================

/// Binding phase reported by the orchestrator for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeClaimPhase {
    Pending,
    Bound,
    /// The bound volume is gone; unrecoverable
    Lost,
}

/// Desired state of a new claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimSpec {
    pub key: ResourceKey,
    pub storage_class: Option<String>,
    pub requested_bytes: u64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Observed claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    pub key: ResourceKey,
    pub storage_class: Option<String>,
    pub requested_bytes: u64,
    /// Capacity of the bound volume
    pub capacity_bytes: Option<u64>,
    pub phase: VolumeClaimPhase,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Optimistic-concurrency token
    pub version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Name Reservations
// =============================================================================

/// Desired state of a new name reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameReservationSpec {
    pub key: ResourceKey,
    pub disk_id: String,
    pub labels: BTreeMap<String, String>,
    pub reserved_at: DateTime<Utc>,
}

/// Observed name reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameReservation {
    pub key: ResourceKey,
    pub disk_id: String,
    pub labels: BTreeMap<String, String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NameReservation {
    /// When the current binding was made
    pub fn bound_since(&self) -> Option<DateTime<Utc>> {
        self.reserved_at.or(self.created_at)
    }
}

// =============================================================================
// Kind-tagged Resources
// =============================================================================

/// Spec for `create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    VolumeClaim(VolumeClaimSpec),
    NameReservation(NameReservationSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::VolumeClaim(_) => ResourceKind::VolumeClaim,
            ResourceSpec::NameReservation(_) => ResourceKind::NameReservation,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            ResourceSpec::VolumeClaim(spec) => &spec.key,
            ResourceSpec::NameReservation(spec) => &spec.key,
        }
    }
}

/// Resource returned by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    VolumeClaim(VolumeClaim),
    NameReservation(NameReservation),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::VolumeClaim(_) => ResourceKind::VolumeClaim,
            Resource::NameReservation(_) => ResourceKind::NameReservation,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            Resource::VolumeClaim(claim) => &claim.key,
            Resource::NameReservation(reservation) => &reservation.key,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Resource::VolumeClaim(claim) => claim.version.as_deref(),
            Resource::NameReservation(reservation) => reservation.version.as_deref(),
        }
    }

    pub fn into_volume_claim(self) -> Result<VolumeClaim> {
        match self {
            Resource::VolumeClaim(claim) => Ok(claim),
            other => Err(kind_mismatch(ResourceKind::VolumeClaim, &other)),
        }
    }

    pub fn into_name_reservation(self) -> Result<NameReservation> {
        match self {
            Resource::NameReservation(reservation) => Ok(reservation),
            other => Err(kind_mismatch(ResourceKind::NameReservation, &other)),
        }
    }
}

fn kind_mismatch(expected: ResourceKind, got: &Resource) -> Error {
    Error::Internal(format!(
        "gateway returned {} {} where {} was expected",
        got.kind(),
        got.key(),
        expected
    ))
}

// =============================================================================
// Mutations
// =============================================================================

/// Merge-style change applied by `patch`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    /// Reject with `Conflict` unless the stored version still matches
    pub expected_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Retarget a name reservation (ignored for claims)
    pub disk_id: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(mut self, version: Option<String>) -> Self {
        self.expected_version = version;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn retarget(mut self, disk_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.disk_id = Some(disk_id.into());
        self.reserved_at = Some(at);
        self
    }

    /// Whether the mutation changes anything
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty() && self.disk_id.is_none()
    }
}

// =============================================================================
// Usage Observation
// =============================================================================

/// Live consumption of one claim as reported by the node it is mounted on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub key: ResourceKey,
    pub used_bytes: u64,
}

// =============================================================================
// Orchestrator Gateway Port
// =============================================================================

/// Port for every orchestrator call made by the control plane.
///
/// `create` fails with `AlreadyExists` when the key is taken; this is the
/// uniqueness signal the naming service builds on. `patch` fails with
/// `Conflict` on a version mismatch. Calls that time out or cannot reach the
/// orchestrator fail with `Unavailable`.
#[async_trait]
pub trait OrchestratorGateway: Send + Sync {
    /// Create a resource
    async fn create(&self, spec: ResourceSpec) -> Result<Resource>;

    /// Fetch a resource
    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Resource>;

    /// List resources matching the scope filter
    async fn list(&self, kind: ResourceKind, filter: &ScopeFilter) -> Result<Vec<Resource>>;

    /// Delete a resource
    async fn delete(&self, kind: ResourceKind, key: &ResourceKey) -> Result<()>;

    /// Apply a merge mutation
    async fn patch(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        mutation: Mutation,
    ) -> Result<Resource>;

    /// Make sure the scope's namespace exists, returning its name
    async fn ensure_namespace(&self, scope: &Scope) -> Result<String>;

    /// Live usage of every mounted claim
    async fn usage_samples(&self) -> Result<Vec<UsageSample>>;

    /// Claims currently referenced by running workloads
    async fn mounted_claims(&self) -> Result<Vec<ResourceKey>>;

    /// Get gateway name
    fn gateway_name(&self) -> &str;
}

pub type OrchestratorGatewayRef = Arc<dyn OrchestratorGateway>;
