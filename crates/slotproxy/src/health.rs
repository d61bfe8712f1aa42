//! Health status types for the proxy.

use serde::{Deserialize, Serialize};

use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// At least one slot can take a request right now
    Ready,
    /// Every usable slot is forwarding; new requests queue
    Busy,
    /// No longer admitting requests
    ShuttingDown,
}

impl Health {
    pub fn from_counts(available_slots: usize, shutting_down: bool) -> Self {
        if shutting_down {
            Self::ShuttingDown
        } else if available_slots == 0 {
            Self::Busy
        } else {
            Self::Ready
        }
    }
}

/// Snapshot of proxy health for transports to serve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub available_slots: usize,
    pub total_slots: usize,
    pub forwarding: usize,
    pub pending_tasks: i64,
    pub queue_capacity: usize,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Health::Ready
    }
}
