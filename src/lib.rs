//! Tenant Disk Operator - Disk-as-a-Service Control Plane
//!
//! A Kubernetes operator that hands out persistent disks to tenant projects:
//! race-free creation under user-chosen names, per-project capacity limits,
//! and a background watcher that keeps usage, status and expiry current.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          REST API (axum)                                     │
//! │           POST/GET/DELETE /api/v1/disk          GET /ping                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Disk Service                                        │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Naming      │  │     Quota       │  │     Disk State Machine      │  │
//! │  │   Reservation   │  │    Enforcer     │  │  Pending/Ready/Broken/...   │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │           ┌─────────────────────────────┐  │
//! │                                │           │       Usage Watcher         │  │
//! │                                │           │  usage/expiry/orphans loop  │  │
//! │                                │           └─────────────┬───────────────┘  │
//! ├────────────────────────────────┴─────────────────────────┴───────────────────┤
//! │                        Orchestrator Gateway                                  │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Kubernetes                │  │           In-memory                 │   │
//! │  │   (PVCs + DiskNamings)      │  │   (standalone mode and tests)       │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Disk service, watcher, gateways and the REST API
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Disk model and the orchestrator port
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig,
    ConflictRetry, DeleteReason, DiskMetrics,
    DiskService, DiskServiceConfig,
    GatewayExt, GatewayFactory, InMemoryConfig, InMemoryGateway, KubeGateway, KubeGatewayConfig,
    NamingConfig, NamingReservationService, QuotaEnforcer, QuotaLimits,
    OverusePolicy, UsageWatcher, WatcherConfig,
};

pub use crd::{DiskNaming, DiskNamingSpec};

pub use domain::disk::{Disk, DiskRequest, DiskStatus, ExpiryAnchor, Scope};

pub use domain::ports::{
    Mutation, OrchestratorGateway, OrchestratorGatewayRef, ResourceKey, ResourceKind,
    ScopeFilter,
};

pub use error::{Error, Result, ErrorAction};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
