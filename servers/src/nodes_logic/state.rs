use lib_common::core::NodeHub;
use std::time::Instant;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: NodeHub,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: NodeHub) -> Self {
        Self {
            hub,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
