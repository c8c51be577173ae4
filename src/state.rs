//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::meter::Meter;

/// Shared application state for the exporter.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Handle to the meter I/O thread.
    pub meter: Meter,
    /// Scrape counters for the health endpoint.
    pub scrape_stats: Arc<ScrapeStats>,
}

/// Scrape statistics — atomics for the counters, Mutex only for the last
/// error string (cold path).
pub struct ScrapeStats {
    pub scrapes_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl ScrapeStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scrapes_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Count one successful scrape.
    pub fn record_success(&self) {
        self.scrapes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed scrape and remember its diagnostic.
    pub async fn record_error(&self, message: String) {
        self.scrapes_total.fetch_add(1, Ordering::Relaxed);
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().await = Some(message);
    }
}

impl Default for ScrapeStats {
    fn default() -> Self {
        Self::new()
    }
}
