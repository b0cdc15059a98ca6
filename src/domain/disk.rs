//! Disk model
//!
//! A Disk is not stored anywhere on its own: it is a view over a managed
//! volume claim. Ownership lives in labels, lifecycle bookkeeping lives in
//! annotations, and this module is the single codec between the two.

use crate::domain::ports::{ResourceKey, VolumeClaim, VolumeClaimPhase, VolumeClaimSpec};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// =============================================================================
// Labels & Annotations
// =============================================================================

/// Marks a claim as managed by this control plane
pub const MANAGED_LABEL: &str = "disks.platform.io/managed";
/// Owning organization
pub const ORG_LABEL: &str = "disks.platform.io/org";
/// Owning project
pub const PROJECT_LABEL: &str = "disks.platform.io/project";
/// Requesting user (slashes replaced with `--`)
pub const OWNER_LABEL: &str = "disks.platform.io/owner";
/// Set once deletion has been requested
pub const DELETED_LABEL: &str = "disks.platform.io/deleted";

pub const NAME_ANNOTATION: &str = "disks.platform.io/name";
pub const STATUS_ANNOTATION: &str = "disks.platform.io/status";
pub const CREATED_AT_ANNOTATION: &str = "disks.platform.io/created-at";
pub const LIFE_SPAN_ANNOTATION: &str = "disks.platform.io/life-span";
pub const USED_BYTES_ANNOTATION: &str = "disks.platform.io/used-bytes";
pub const LAST_USAGE_CHECK_ANNOTATION: &str = "disks.platform.io/last-usage-check";
pub const LAST_USED_ANNOTATION: &str = "disks.platform.io/last-used";

/// Org placeholder for projects that do not belong to an organization
pub const NO_ORG: &str = "NO_ORG";
const NO_ORG_NORMALIZED: &str = "no-org";

const KUBE_NAME_LENGTH_MAX: usize = 63;
const KUBE_NAMESPACE_SEP: &str = "--";
const KUBE_NAMESPACE_PREFIX: &str = "platform";
const KUBE_NAMESPACE_HASH_LENGTH: usize = 24;

/// Longest accepted life span: 100 years
pub const LIFE_SPAN_MAX_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

// =============================================================================
// Scope
// =============================================================================

/// The (organization, project) pair that owns disks, names and quota
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub org: String,
    pub project: String,
}

impl Scope {
    pub fn new(org: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
        }
    }

    /// Namespace holding every resource of this scope
    pub fn namespace(&self) -> String {
        generate_namespace_name(&self.org, &self.project)
    }

    /// Labels identifying this scope on orchestrator resources
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(ORG_LABEL.to_string(), self.org.clone());
        labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
        labels
    }

    /// Key used for per-scope quota overrides
    pub fn quota_key(&self) -> String {
        format!("{}/{}", self.org, self.project)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org, self.project)
    }
}

/// Generate the namespace name `platform--<org>--<project>--<hash>`.
///
/// The prefix and the 24-char sha256 hash are never truncated. When org and
/// project do not fit into 63 chars, both are shortened proportionally to
/// their length so that some part of each survives.
pub fn generate_namespace_name(org: &str, project: &str) -> String {
    let org = if org == NO_ORG { NO_ORG_NORMALIZED } else { org };

    let hashable = format!("{}{}{}", org, KUBE_NAMESPACE_SEP, project);
    let digest = hex::encode(Sha256::digest(hashable.as_bytes()));
    let name_hash = &digest[..KUBE_NAMESPACE_HASH_LENGTH];

    let len_reserved =
        KUBE_NAMESPACE_PREFIX.len() + KUBE_NAMESPACE_SEP.len() * 2 + KUBE_NAMESPACE_HASH_LENGTH;
    let len_free = KUBE_NAME_LENGTH_MAX - len_reserved;

    if hashable.chars().count() <= len_free {
        return format!(
            "{prefix}{sep}{hashable}{sep}{name_hash}",
            prefix = KUBE_NAMESPACE_PREFIX,
            sep = KUBE_NAMESPACE_SEP,
        );
    }

    let len_org = org.chars().count();
    let len_project = project.chars().count();
    let len_org_project = len_org + len_project + KUBE_NAMESPACE_SEP.len();
    let exceeds = len_org_project - len_free;

    let remove_from_org =
        ((len_org as f64 / len_org_project as f64) * exceeds as f64).ceil() as usize;
    let remove_from_project = exceeds - remove_from_org;

    let new_org: String = org
        .chars()
        .take(len_org.saturating_sub(remove_from_org).max(1))
        .collect();
    let new_project: String = project
        .chars()
        .take(len_project.saturating_sub(remove_from_project).max(1))
        .collect();

    format!(
        "{prefix}{sep}{new_org}{sep}{new_project}{sep}{name_hash}",
        prefix = KUBE_NAMESPACE_PREFIX,
        sep = KUBE_NAMESPACE_SEP,
    )
}

// =============================================================================
// Disk Status
// =============================================================================

/// Externally visible disk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskStatus {
    /// Claim submitted, backing volume not yet bound
    Pending,
    /// Backing volume bound and usable
    Ready,
    /// Backing volume reported an unrecoverable error
    Broken,
    /// Deletion requested
    Deleting,
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskStatus::Pending => write!(f, "Pending"),
            DiskStatus::Ready => write!(f, "Ready"),
            DiskStatus::Broken => write!(f, "Broken"),
            DiskStatus::Deleting => write!(f, "Deleting"),
        }
    }
}

impl std::str::FromStr for DiskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(DiskStatus::Pending),
            "Ready" => Ok(DiskStatus::Ready),
            "Broken" => Ok(DiskStatus::Broken),
            "Deleting" => Ok(DiskStatus::Deleting),
            other => Err(Error::Internal(format!("unknown disk status: {}", other))),
        }
    }
}

impl DiskStatus {
    /// Status implied by the claim phase alone, used for claims that predate
    /// the status annotation
    pub fn from_phase(phase: VolumeClaimPhase) -> Self {
        match phase {
            VolumeClaimPhase::Pending => DiskStatus::Pending,
            VolumeClaimPhase::Bound => DiskStatus::Ready,
            VolumeClaimPhase::Lost => DiskStatus::Broken,
        }
    }
}

// =============================================================================
// Disk
// =============================================================================

/// Request to create a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRequest {
    pub scope: Scope,
    /// Tenant-chosen name, unique within the scope
    pub name: Option<String>,
    pub capacity_bytes: u64,
    /// Storage class; `None` uses the configured default
    pub storage_class: Option<String>,
    pub life_span: Option<Duration>,
    /// Identity of the requesting user
    pub requester: String,
}

/// The tenant-visible disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    /// Server-generated id (the claim name)
    pub id: String,
    pub name: Option<String>,
    pub scope: Scope,
    pub owner: String,
    pub storage_class: Option<String>,
    pub requested_capacity_bytes: u64,
    /// Capacity actually provisioned, once bound
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub status: DiskStatus,
    pub life_span: Option<Duration>,
    pub last_usage_check: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Disk {
    /// Key of the claim backing this disk
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.scope.namespace(), self.id.clone())
    }

    /// Whether the disk still counts against quota
    pub fn is_live(&self) -> bool {
        self.status != DiskStatus::Deleting
    }

    /// Point in time when the life span runs out, if the disk has one
    pub fn expires_at(&self, anchor: ExpiryAnchor) -> Option<DateTime<Utc>> {
        let life_span = self.life_span?;
        let start = match anchor {
            ExpiryAnchor::CreatedAt => self.created_at,
            ExpiryAnchor::LastUsed => self
                .last_used_at
                .map_or(self.created_at, |used| used.max(self.created_at)),
        };
        // out-of-range spans never expire
        start.checked_add_signed(life_span)
    }

    /// Whether usage is above the requested capacity
    pub fn is_overused(&self) -> bool {
        self.used_bytes
            .map_or(false, |used| used > self.requested_capacity_bytes)
    }

    /// Whether the request describes this very disk (idempotent retry)
    pub fn matches_request(&self, request: &DiskRequest) -> bool {
        self.scope == request.scope
            && self.name == request.name
            && encode_owner(&self.owner) == encode_owner(&request.requester)
            && self.requested_capacity_bytes == request.capacity_bytes
            && self.storage_class == request.storage_class
    }

    /// Decode a disk from its claim
    pub fn from_claim(claim: &VolumeClaim) -> Result<Self> {
        let label = |key: &str| {
            claim.labels.get(key).cloned().ok_or_else(|| {
                Error::Internal(format!("claim {} is missing label {}", claim.key, key))
            })
        };

        let scope = Scope::new(label(ORG_LABEL)?, label(PROJECT_LABEL)?);
        let owner = claim
            .labels
            .get(OWNER_LABEL)
            .map(|o| decode_owner(o))
            .unwrap_or_default();

        let status = if claim.labels.contains_key(DELETED_LABEL) {
            DiskStatus::Deleting
        } else {
            match claim.annotations.get(STATUS_ANNOTATION) {
                Some(raw) => raw.parse()?,
                None => DiskStatus::from_phase(claim.phase),
            }
        };

        let created_at = match claim.annotations.get(CREATED_AT_ANNOTATION) {
            Some(raw) => parse_timestamp(raw)?,
            None => claim.created_at.unwrap_or_else(Utc::now),
        };

        Ok(Disk {
            id: claim.key.name.clone(),
            name: claim.annotations.get(NAME_ANNOTATION).cloned(),
            scope,
            owner,
            storage_class: claim.storage_class.clone(),
            requested_capacity_bytes: claim.requested_bytes,
            capacity_bytes: claim.capacity_bytes,
            used_bytes: claim
                .annotations
                .get(USED_BYTES_ANNOTATION)
                .map(|raw| {
                    raw.parse::<u64>().map_err(|_| {
                        Error::Internal(format!("claim {} has bad used bytes {}", claim.key, raw))
                    })
                })
                .transpose()?,
            status,
            life_span: claim
                .annotations
                .get(LIFE_SPAN_ANNOTATION)
                .map(|raw| parse_life_span(raw))
                .transpose()?,
            last_usage_check: claim
                .annotations
                .get(LAST_USAGE_CHECK_ANNOTATION)
                .map(|raw| parse_timestamp(raw))
                .transpose()?,
            last_used_at: claim
                .annotations
                .get(LAST_USED_ANNOTATION)
                .map(|raw| parse_timestamp(raw))
                .transpose()?,
            created_at,
        })
    }
}

/// Where a disk's life span is counted from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpiryAnchor {
    /// Count from creation
    #[default]
    CreatedAt,
    /// Count from the last time a workload mounted the disk
    LastUsed,
}

impl std::str::FromStr for ExpiryAnchor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created-at" => Ok(ExpiryAnchor::CreatedAt),
            "last-used" => Ok(ExpiryAnchor::LastUsed),
            other => Err(Error::Configuration(format!(
                "unknown expiry anchor {}, use 'created-at' or 'last-used'",
                other
            ))),
        }
    }
}

// =============================================================================
// Claim Encoding
// =============================================================================

/// Build the claim spec for a new disk
pub fn claim_spec_for(
    request: &DiskRequest,
    disk_id: &str,
    storage_class: Option<String>,
    now: DateTime<Utc>,
) -> VolumeClaimSpec {
    let mut labels = request.scope.labels();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(OWNER_LABEL.to_string(), encode_owner(&request.requester));

    let mut annotations = BTreeMap::new();
    annotations.insert(CREATED_AT_ANNOTATION.to_string(), format_timestamp(now));
    annotations.insert(STATUS_ANNOTATION.to_string(), DiskStatus::Pending.to_string());
    if let Some(life_span) = request.life_span {
        annotations.insert(LIFE_SPAN_ANNOTATION.to_string(), format_life_span(life_span));
    }
    if let Some(name) = &request.name {
        annotations.insert(NAME_ANNOTATION.to_string(), name.clone());
    }

    VolumeClaimSpec {
        key: ResourceKey::new(request.scope.namespace(), disk_id),
        storage_class,
        requested_bytes: request.capacity_bytes,
        labels,
        annotations,
    }
}

/// Owners may contain `/`, which label values cannot
pub fn encode_owner(owner: &str) -> String {
    owner.replace('/', "--")
}

pub fn decode_owner(raw: &str) -> String {
    raw.replace("--", "/")
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::DurationParse(format!("bad timestamp {}: {}", raw, e)))
}

/// Life spans are stored as (possibly fractional) seconds
pub fn format_life_span(life_span: Duration) -> String {
    let millis = life_span.num_milliseconds();
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{}", millis as f64 / 1000.0)
    }
}

pub fn parse_life_span(raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::DurationParse(format!("bad life span: {}", raw)))?;
    life_span_from_secs(secs)
}

pub fn life_span_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(Error::DurationParse(format!(
            "life span must be positive, got {}",
            secs
        )));
    }
    if secs > LIFE_SPAN_MAX_SECS {
        return Err(Error::DurationParse(format!(
            "life span must be at most {} seconds, got {}",
            LIFE_SPAN_MAX_SECS, secs
        )));
    }
    Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
}
