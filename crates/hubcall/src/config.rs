//! Messenger configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`UnifiedMessenger`](crate::UnifiedMessenger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Number of workers that run implementor bodies for calls arriving
    /// from the hub.
    pub worker_count: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self { worker_count: 15 }
    }
}

impl MessengerConfig {
    /// Upper bound for `worker_count`.
    pub const MAX_WORKERS: usize = 256;

    /// Clamps every field into its supported range.
    pub fn validated(mut self) -> Self {
        if self.worker_count == 0 {
            tracing::warn!("worker_count of 0 would stall remote calls; using 1");
            self.worker_count = 1;
        } else if self.worker_count > Self::MAX_WORKERS {
            tracing::warn!(
                count = self.worker_count,
                max = Self::MAX_WORKERS,
                "worker_count exceeds maximum; clamping"
            );
            self.worker_count = Self::MAX_WORKERS;
        }
        self
    }
}
