//! Quota Enforcer
//!
//! Project usage is never stored: every admission lists the scope's claims
//! and sums the requested capacity of the disks that are not being deleted.
//! Two admissions racing within one listing window can both pass.

use crate::controlplane::gateway::GatewayExt;
use crate::domain::disk::{Disk, Scope};
use crate::domain::ports::{OrchestratorGatewayRef, ScopeFilter};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Default per-project limit: 64Gi
pub const DEFAULT_PROJECT_LIMIT_BYTES: u64 = 64 << 30;

// =============================================================================
// Limits
// =============================================================================

/// Per-scope storage limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Limit for scopes without an override
    pub default_limit_bytes: u64,
    /// Overrides keyed by `org/project`
    #[serde(default)]
    pub scopes: BTreeMap<String, u64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            default_limit_bytes: DEFAULT_PROJECT_LIMIT_BYTES,
            scopes: BTreeMap::new(),
        }
    }
}

impl QuotaLimits {
    /// Same limit for every scope
    pub fn uniform(limit_bytes: u64) -> Self {
        Self {
            default_limit_bytes: limit_bytes,
            scopes: BTreeMap::new(),
        }
    }

    /// Load limits from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let limits: QuotaLimits = serde_yaml::from_str(&raw)?;
        Ok(limits)
    }

    /// Limit that applies to a scope
    pub fn limit_for(&self, scope: &Scope) -> u64 {
        self.scopes
            .get(&scope.quota_key())
            .copied()
            .unwrap_or(self.default_limit_bytes)
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { used: u64, limit: u64 },
    Rejected { used: u64, limit: u64, requested: u64 },
}

impl Admission {
    /// Turn a rejection into `QuotaExceeded`
    pub fn into_result(self, scope: &Scope) -> Result<()> {
        match self {
            Admission::Admitted { .. } => Ok(()),
            Admission::Rejected {
                used,
                limit,
                requested,
            } => Err(Error::QuotaExceeded {
                scope: scope.to_string(),
                used,
                limit,
                requested,
            }),
        }
    }
}

/// Capacity held by the live disks of a scope
pub fn used_capacity<'a>(disks: impl IntoIterator<Item = &'a Disk>) -> u64 {
    disks
        .into_iter()
        .filter(|d| d.is_live())
        .map(|d| d.requested_capacity_bytes)
        .fold(0u64, u64::saturating_add)
}

/// Capacity-based admission against per-scope limits
pub struct QuotaEnforcer {
    gateway: OrchestratorGatewayRef,
    limits: QuotaLimits,
}

impl QuotaEnforcer {
    pub fn new(gateway: OrchestratorGatewayRef, limits: QuotaLimits) -> Self {
        Self { gateway, limits }
    }

    /// Capacity currently held by a scope
    pub async fn usage(&self, scope: &Scope) -> Result<u64> {
        let claims = self.gateway.list_claims(&ScopeFilter::scope(scope)).await?;
        let used = claims
            .iter()
            .filter(|claim| match Disk::from_claim(claim) {
                Ok(disk) => disk.is_live(),
                Err(e) => {
                    // an undecodable claim still holds its storage
                    warn!("Counting undecodable claim {} by request: {}", claim.key, e);
                    true
                }
            })
            .map(|claim| claim.requested_bytes)
            .fold(0u64, u64::saturating_add);
        Ok(used)
    }

    /// Check whether `requested_bytes` more fit into the scope's limit
    pub async fn check_and_admit(&self, scope: &Scope, requested_bytes: u64) -> Result<Admission> {
        let used = self.usage(scope).await?;
        let limit = self.limits.limit_for(scope);

        let admission = if used.saturating_add(requested_bytes) > limit {
            Admission::Rejected {
                used,
                limit,
                requested: requested_bytes,
            }
        } else {
            Admission::Admitted { used, limit }
        };

        debug!(
            "Quota check for {}: {} used + {} requested, limit {} -> {:?}",
            scope, used, requested_bytes, limit, admission
        );
        Ok(admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::gateway::InMemoryGateway;
    use crate::domain::disk::{claim_spec_for, DiskRequest, DELETED_LABEL};
    use crate::domain::ports::{Mutation, OrchestratorGateway, ResourceSpec};
    use chrono::Utc;
    use std::io::Write;
    use std::sync::Arc;

    const GI: u64 = 1 << 30;

    async fn seed(gateway: &InMemoryGateway, scope: &Scope, id: &str, bytes: u64) {
        let request = DiskRequest {
            scope: scope.clone(),
            name: None,
            capacity_bytes: bytes,
            storage_class: None,
            life_span: None,
            requester: "alice".into(),
        };
        gateway
            .create(ResourceSpec::VolumeClaim(claim_spec_for(
                &request,
                id,
                None,
                Utc::now(),
            )))
            .await
            .unwrap();
    }

    #[test]
    fn test_limits_lookup() {
        let mut limits = QuotaLimits::uniform(10 * GI);
        limits.scopes.insert("acme/ml".into(), 100 * GI);
        assert_eq!(limits.limit_for(&Scope::new("acme", "ml")), 100 * GI);
        assert_eq!(limits.limit_for(&Scope::new("acme", "web")), 10 * GI);
    }

    #[test]
    fn test_limits_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_limit_bytes: 1024\nscopes:\n  acme/ml: 4096\n"
        )
        .unwrap();

        let limits = QuotaLimits::from_yaml_file(file.path()).unwrap();
        assert_eq!(limits.default_limit_bytes, 1024);
        assert_eq!(limits.limit_for(&Scope::new("acme", "ml")), 4096);
    }

    #[test]
    fn test_limits_from_bad_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scopes: [").unwrap();
        assert!(matches!(
            QuotaLimits::from_yaml_file(file.path()),
            Err(Error::YamlParse(_))
        ));
        assert!(matches!(
            QuotaLimits::from_yaml_file("/nonexistent/quota.yaml"),
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_admission_sums_requested_capacity() {
        let gateway = Arc::new(InMemoryGateway::default());
        let scope = Scope::new("acme", "ml");
        seed(&gateway, &scope, "disk-1", 4 * GI).await;
        seed(&gateway, &scope, "disk-2", 4 * GI).await;
        // other scopes do not count
        seed(&gateway, &Scope::new("acme", "web"), "disk-3", 8 * GI).await;

        let enforcer = QuotaEnforcer::new(gateway.clone(), QuotaLimits::uniform(10 * GI));
        assert_eq!(enforcer.usage(&scope).await.unwrap(), 8 * GI);

        let admission = enforcer.check_and_admit(&scope, 2 * GI).await.unwrap();
        assert_eq!(
            admission,
            Admission::Admitted {
                used: 8 * GI,
                limit: 10 * GI
            }
        );

        let admission = enforcer.check_and_admit(&scope, 3 * GI).await.unwrap();
        assert_eq!(
            admission,
            Admission::Rejected {
                used: 8 * GI,
                limit: 10 * GI,
                requested: 3 * GI
            }
        );
        assert!(matches!(
            admission.into_result(&scope),
            Err(Error::QuotaExceeded { used, .. }) if used == 8 * GI
        ));
    }

    #[tokio::test]
    async fn test_deleting_disks_release_quota() {
        let gateway = Arc::new(InMemoryGateway::default());
        let scope = Scope::new("acme", "ml");
        seed(&gateway, &scope, "disk-1", 6 * GI).await;

        let key = crate::domain::ports::ResourceKey::new(scope.namespace(), "disk-1");
        gateway
            .patch(
                crate::domain::ports::ResourceKind::VolumeClaim,
                &key,
                Mutation::new().label(DELETED_LABEL, "true"),
            )
            .await
            .unwrap();

        let enforcer = QuotaEnforcer::new(gateway, QuotaLimits::uniform(6 * GI));
        assert_eq!(enforcer.usage(&scope).await.unwrap(), 0);
        assert!(matches!(
            enforcer.check_and_admit(&scope, 6 * GI).await.unwrap(),
            Admission::Admitted { used: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_unavailable_gateway_propagates() {
        let gateway = Arc::new(InMemoryGateway::default());
        gateway.set_unavailable(true);
        let enforcer = QuotaEnforcer::new(gateway, QuotaLimits::default());
        assert!(matches!(
            enforcer.check_and_admit(&Scope::new("acme", "ml"), 1).await,
            Err(Error::Unavailable { .. })
        ));
    }
}
