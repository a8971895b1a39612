//! Prometheus metrics for `GET /health/metrics`.
//!
//! Grounded on `examples/KwaminaWhyte-rivetr/src/api/metrics.rs`:
//! `PrometheusBuilder::install_recorder()` for the recorder/handle pair,
//! `describe_gauge!` at startup, `gauge!(...).set(...)` right before
//! render. The teacher's HTTP-request counters/histograms and deployment
//! metrics have no analogue here, so only the gauges this system actually
//! has are kept.

use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::api::ApiState;

pub const UPTIME_SECONDS: &str = "revp_uptime_seconds";
pub const TRACKED_CONTAINERS: &str = "revp_tracked_containers";
pub const TRACKED_SERVICES: &str = "revp_tracked_services";
pub const STATIC_ROUTES: &str = "revp_static_routes";

/// Install the global Prometheus recorder and register gauge descriptions.
/// Called once at startup; the returned handle is threaded through
/// `ApiState` for `/health/metrics` to render from.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    describe_gauge!(UPTIME_SECONDS, "Seconds since process start");
    describe_gauge!(TRACKED_CONTAINERS, "Number of containers currently tracked");
    describe_gauge!(TRACKED_SERVICES, "Number of valid routing services currently tracked");
    describe_gauge!(STATIC_ROUTES, "Number of operator-authored static routes");

    handle
}

/// Refresh every gauge from current state right before rendering.
pub async fn update_gauges(state: &ApiState) {
    let summary = state.reconciler.containers_summary().await;
    let static_count = state.static_routes.list().await.len();

    gauge!(UPTIME_SECONDS).set(state.started_at.elapsed().as_secs() as f64);
    gauge!(TRACKED_CONTAINERS).set(summary.total_containers as f64);
    gauge!(TRACKED_SERVICES).set(summary.total_services as f64);
    gauge!(STATIC_ROUTES).set(static_count as f64);
}
