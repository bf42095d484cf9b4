//! Health aggregation.
//!
//! Provides:
//! - `GET /healthz` — always 200 OK (process is running)
//! - `GET /readyz`  — 200 when local subsystems are ready, 503 otherwise
//! - `GET /api/v1/status` — JSON aggregate of component status
//!
//! # Readiness contract
//! `/readyz` reflects local prerequisites only (config + L1 + hub bound).
//! Upstream connectivity is reported in the status body but does NOT
//! affect readiness.

use crate::cache::{CacheStats, CacheTier};
use crate::hub::SubscriberHub;
use crate::upstream::UpstreamState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Aggregates status from the other components for the health endpoints.
pub struct HealthReporter {
    started: Instant,
    upstream_state: watch::Receiver<UpstreamState>,
    cache: Arc<CacheTier>,
    hub: Arc<SubscriberHub>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamReport {
    pub state: &'static str,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub failover: bool,
    pub l1_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub upstream: UpstreamReport,
    pub cache: CacheReport,
    pub subscribers: usize,
}

impl HealthReporter {
    pub fn new(
        upstream_state: watch::Receiver<UpstreamState>,
        cache: Arc<CacheTier>,
        hub: Arc<SubscriberHub>,
    ) -> Self {
        HealthReporter {
            started: Instant::now(),
            upstream_state,
            cache,
            hub,
        }
    }

    /// Local subsystems only; the reporter exists once they are up.
    pub fn ready(&self) -> bool {
        true
    }

    pub async fn report(&self) -> HealthReport {
        let upstream = *self.upstream_state.borrow();
        HealthReport {
            status: "ok",
            uptime_seconds: self.started.elapsed().as_secs(),
            upstream: UpstreamReport {
                state: upstream.as_str(),
                connected: upstream == UpstreamState::Connected,
            },
            cache: CacheReport {
                stats: self.cache.stats(),
                failover: self.cache.failover_active(),
                l1_entries: self.cache.l1_len(),
            },
            subscribers: self.hub.connection_count().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<crate::socket::AppState>) -> impl IntoResponse {
    if state.health.ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub async fn status(State(state): State<crate::socket::AppState>) -> impl IntoResponse {
    Json(state.health.report().await)
}
