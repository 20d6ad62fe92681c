//! Shared state for the status server.

use std::sync::Arc;
use std::time::Instant;

use crate::storage::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Persistence gateway shared with the lifecycle controller
    pub store: Arc<dyn Store>,

    /// Name of the generation backend, reported by `/stats`
    pub ai_backend: &'static str,

    started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, ai_backend: &'static str) -> Self {
        Self {
            store,
            ai_backend,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
