//! DiskNaming CRD
//!
//! A namespaced record mapping a tenant-chosen disk name to the id of the
//! claim that backs it. The API server's create-if-absent semantics on this
//! resource are what makes a disk name unique within a project.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// DiskNaming CRD
// =============================================================================

/// DiskNaming reserves a disk name inside a project namespace.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "disks.platform.io",
    version = "v1",
    kind = "DiskNaming",
    plural = "disknamings",
    shortname = "dn",
    printcolumn = r#"{"name": "Disk", "type": "string", "jsonPath": ".spec.diskId"}"#,
    printcolumn = r#"{"name": "Reserved", "type": "date", "jsonPath": ".spec.reservedAt"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DiskNamingSpec {
    /// Id of the disk (claim name) this name points at
    pub disk_id: String,

    /// When the name was last (re)bound to `disk_id`
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub reserved_at: Option<DateTime<Utc>>,
}

impl DiskNaming {
    /// Get the name of this reservation
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }
}
