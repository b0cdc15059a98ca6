//! Domain layer - Disk model and port definitions
//!
//! This module defines the gateway port that orchestrator adapters
//! implement, following hexagonal architecture principles, plus the disk
//! model decoded from orchestrator resources.

pub mod disk;
pub mod ports;
pub mod quantity;

pub use disk::*;
pub use ports::*;
