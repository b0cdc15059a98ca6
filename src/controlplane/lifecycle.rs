//! Disk State Machine
//!
//! ```text
//!            VolumeBound
//!   Pending ─────────────► Ready
//!      │                     │
//!      │ VolumeLost          │ VolumeLost
//!      ▼                     ▼
//!    Broken ◄────────────────┘
//!
//!   Pending | Ready | Broken ──DeleteRequested──► Deleting ──Removed──► Terminated
//! ```
//!
//! Every other (state, event) pair is an `InvalidTransition`. Transitions are
//! pure; persisting the result is the caller's job.

use crate::domain::disk::DiskStatus;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state, including the terminal state that has no stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskState {
    Pending,
    Ready,
    Broken,
    Deleting,
    /// Record removed
    Terminated,
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskState::Pending => write!(f, "Pending"),
            DiskState::Ready => write!(f, "Ready"),
            DiskState::Broken => write!(f, "Broken"),
            DiskState::Deleting => write!(f, "Deleting"),
            DiskState::Terminated => write!(f, "Terminated"),
        }
    }
}

impl From<DiskStatus> for DiskState {
    fn from(status: DiskStatus) -> Self {
        match status {
            DiskStatus::Pending => DiskState::Pending,
            DiskStatus::Ready => DiskState::Ready,
            DiskStatus::Broken => DiskState::Broken,
            DiskStatus::Deleting => DiskState::Deleting,
        }
    }
}

/// Lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskEvent {
    /// Backing volume got bound
    VolumeBound,
    /// Backing volume reported an unrecoverable error
    VolumeLost,
    /// Deletion requested by a tenant, expiry or policy
    DeleteRequested,
    /// Record removed from the orchestrator
    Removed,
}

impl std::fmt::Display for DiskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskEvent::VolumeBound => write!(f, "volume-bound"),
            DiskEvent::VolumeLost => write!(f, "volume-lost"),
            DiskEvent::DeleteRequested => write!(f, "delete-requested"),
            DiskEvent::Removed => write!(f, "removed"),
        }
    }
}

impl DiskState {
    /// All states, for exhaustive checks
    pub const ALL: [DiskState; 5] = [
        DiskState::Pending,
        DiskState::Ready,
        DiskState::Broken,
        DiskState::Deleting,
        DiskState::Terminated,
    ];

    /// Apply an event
    pub fn apply(self, event: DiskEvent) -> Result<DiskState> {
        use DiskEvent::*;
        use DiskState::*;

        match (self, event) {
            (Pending, VolumeBound) => Ok(Ready),
            (Pending, VolumeLost) | (Ready, VolumeLost) => Ok(Broken),
            (Pending, DeleteRequested) | (Ready, DeleteRequested) | (Broken, DeleteRequested) => {
                Ok(Deleting)
            }
            (Deleting, Removed) => Ok(Terminated),
            (from, event) => Err(Error::InvalidTransition { from, event }),
        }
    }

    /// Whether the state has no outgoing transitions
    pub fn is_terminal(self) -> bool {
        self == DiskState::Terminated
    }

    /// Stored status for this state; `None` once the record is gone
    pub fn as_status(self) -> Option<DiskStatus> {
        match self {
            DiskState::Pending => Some(DiskStatus::Pending),
            DiskState::Ready => Some(DiskStatus::Ready),
            DiskState::Broken => Some(DiskStatus::Broken),
            DiskState::Deleting => Some(DiskStatus::Deleting),
            DiskState::Terminated => None,
        }
    }
}

impl DiskEvent {
    pub const ALL: [DiskEvent; 4] = [
        DiskEvent::VolumeBound,
        DiskEvent::VolumeLost,
        DiskEvent::DeleteRequested,
        DiskEvent::Removed,
    ];
}

/// Validate a transition on a stored status, returning the new stored status
pub fn transition(status: DiskStatus, event: DiskEvent) -> Result<Option<DiskStatus>> {
    DiskState::from(status).apply(event).map(DiskState::as_status)
}
