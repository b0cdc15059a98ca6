//! Disk Control Plane
//!
//! Everything between the REST surface and the orchestrator: the gateway
//! adapters, name reservations, quota admission, the disk state machine,
//! the disk service facade and the usage watcher.

pub mod api;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod naming;
pub mod quota;
pub mod retry;
pub mod service;
pub mod watcher;

pub use api::*;
pub use gateway::*;
pub use lifecycle::*;
pub use metrics::*;
pub use naming::*;
pub use quota::*;
pub use retry::*;
pub use service::*;
pub use watcher::*;
