//! API Module
//!
//! REST adapter over the disk service and the server that hosts it.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
