//! HTTP route handlers.
//!
//! Two endpoints: [`metrics`] is the scrape surface a collector polls,
//! [`health`] is a liveness probe. Neither requires authentication.

pub mod health;
pub mod metrics;
