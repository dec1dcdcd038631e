//! Lease handles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque lease handle issued by the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{:x}", self.0)
    }
}

/// A lease owned by this process.
///
/// Invariant: `ttl` is strictly greater than the heartbeat interval that renews it.
#[derive(Debug, Clone)]
pub struct LeaseBinding {
    pub id: LeaseId,
    pub ttl: Duration,
    pub last_renewal: Instant,
}

impl LeaseBinding {
    pub fn new(id: LeaseId, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            last_renewal: Instant::now(),
        }
    }

    pub fn renewed(&mut self) {
        self.last_renewal = Instant::now();
    }

    /// Keepalives must land more often than ttl/2.
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(100))
    }
}
