//! Custom Resource Definitions for the disk control plane
//!
//! - DiskNaming: name reservation mapping a disk name to its claim

pub mod disk_naming;

pub use disk_naming::*;
