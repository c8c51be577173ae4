//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, the serial device in use, and scrape
/// counters. Suitable for load-balancer health checks; it never touches
/// the modem.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let stats = &state.scrape_stats;
    let last_error = stats.last_error.lock().await.clone();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "device": state.meter.device(),
        "scrapes_total": stats.scrapes_total.load(Ordering::Relaxed),
        "scrape_errors_total": stats.errors_total.load(Ordering::Relaxed),
        "last_error": last_error,
    }))
}
