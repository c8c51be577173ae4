//! The scrape endpoint.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::meter::ScrapeError;
use crate::metrics::{render, CONTENT_TYPE};
use crate::AppState;

/// `GET /metrics` — runs one scrape against the meter and renders the
/// samples in the text exposition format.
///
/// A meter that does not answer (receive deadline, hang-up, failed join)
/// maps to 504 Gateway Timeout so the collector can tell "link down" from
/// "exporter broken"; everything else is a 500 with the detail in the log.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.meter.scrape().await {
        Ok(samples) => {
            state.scrape_stats.record_success();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, CONTENT_TYPE)],
                render(&samples),
            )
                .into_response()
        }
        Err(e) => {
            warn!("scrape failed: {e}");
            state.scrape_stats.record_error(e.to_string()).await;
            let status = match &e {
                ScrapeError::Unavailable(_) => StatusCode::GATEWAY_TIMEOUT,
                ScrapeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, format!("scrape failed: {e}\n")).into_response()
        }
    }
}
