//! Read/Query Surface: the operator-facing HTTP API. Every route here only
//! reads from the `Reconciler`'s shared state or mutates the
//! `StaticRouteStore` directly — none of them talk to the proxy or a host
//! runtime synchronously, so a slow backend never blocks an operator
//! request.
//!
//! Grounded on `examples/KwaminaWhyte-rivetr/src/api/mod.rs`'s nested
//! router composition (`Router::new().nest(...)`) and `TraceLayer`
//! middleware stack; the handler bodies themselves are new, since the
//! original exposed an entirely different domain (app deployments) with
//! no analogue here.

pub mod metrics;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::{ErrorKind, ReconcilerError, Result};
use crate::reconciler::Reconciler;
use crate::static_routes::{StaticRoute, StaticRouteStore};

#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Arc<Reconciler>,
    pub static_routes: Arc<StaticRouteStore>,
    pub started_at: Instant,
    pub metrics_handle: PrometheusHandle,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/metrics", get(health_metrics))
        .route("/containers", get(list_containers))
        .route("/containers/summary", get(containers_summary))
        .route("/hosts/status", get(hosts_status))
        .route("/verify-caddy", get(verify_caddy))
        .nest("/api/static-routes", static_routes_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn static_routes_router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_static_routes).post(create_static_route))
        .route(
            "/:domain",
            get(get_static_route).put(update_static_route).delete(delete_static_route),
        )
        .route("/recheck-dns", post(recheck_dns))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn health_detailed(State(state): State<ApiState>) -> Json<Value> {
    let proxy_reachable = state.reconciler.proxy().test_connection().await.unwrap_or(false);
    let summary = state.reconciler.containers_summary().await;
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "proxy_reachable": proxy_reachable,
        "tracked_containers": summary.total_containers,
        "tracked_services": summary.total_services,
    }))
}

/// Prometheus exposition text via the `metrics`/`metrics-exporter-prometheus`
/// recorder, mirroring the teacher's `metrics::metrics_endpoint`.
async fn health_metrics(State(state): State<ApiState>) -> String {
    metrics::update_gauges(&state).await;
    state.metrics_handle.render()
}

#[derive(Debug, Deserialize)]
struct ListContainersQuery {
    host: Option<String>,
    with_revp_labels: Option<bool>,
}

/// `GET /containers[?host=&with_revp_labels=]`, per spec.md §6. Every
/// container this endpoint ever returns already carries valid revp labels
/// (that's the precondition for being tracked at all), so
/// `with_revp_labels=false` yields an empty set rather than filtering
/// anything out.
async fn list_containers(State(state): State<ApiState>, Query(query): Query<ListContainersQuery>) -> Json<Value> {
    let mut containers = state.reconciler.containers_view().await;

    if let Some(host) = &query.host {
        containers.retain(|c| &c.host_alias == host);
    }
    if query.with_revp_labels == Some(false) {
        containers.clear();
    }

    Json(json!({ "containers": containers }))
}

async fn containers_summary(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.reconciler.containers_summary().await))
}

#[derive(Debug, Deserialize)]
struct HostsStatusQuery {
    #[serde(default)]
    recheck_dns: bool,
}

/// `GET /hosts/status[?recheck_dns]`, per spec.md §6. With `recheck_dns`,
/// folds a fresh `VerifyResolution` pass into each host's status entry.
async fn hosts_status(State(state): State<ApiState>, Query(query): Query<HostsStatusQuery>) -> Json<Value> {
    let hosts = state.reconciler.hosts_status().await;

    if !query.recheck_dns {
        return Json(json!({ "hosts": hosts }));
    }

    let resolution = state.reconciler.hosts().verify_resolution(true);
    let annotated: Vec<Value> = hosts
        .into_iter()
        .map(|h| {
            let mut entry = json!(h);
            if let Some(r) = resolution.get(&h.alias) {
                entry["dns_resolved"] = json!(r.dns_resolved);
                entry["ip_address"] = json!(r.ip_address);
                entry["dns_errors"] = json!(r.errors);
                entry["dns_warnings"] = json!(r.warnings);
            }
            entry
        })
        .collect();

    Json(json!({ "hosts": annotated }))
}

async fn verify_caddy(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.reconciler.verify_caddy().await))
}

async fn list_static_routes(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "static_routes": state.static_routes.list().await }))
}

async fn get_static_route(State(state): State<ApiState>, Path(domain): Path<String>) -> Result<Json<StaticRoute>> {
    state
        .static_routes
        .get(&domain)
        .await
        .map(Json)
        .ok_or_else(|| ReconcilerError::new(ErrorKind::NotFound, format!("no static route for domain '{domain}'")))
}

async fn create_static_route(State(state): State<ApiState>, Json(route): Json<StaticRoute>) -> Result<Json<StaticRoute>> {
    state.static_routes.add(route.clone()).await?;
    state.reconciler.apply_static_routes().await?;
    Ok(Json(route))
}

async fn update_static_route(
    State(state): State<ApiState>,
    Path(domain): Path<String>,
    Json(route): Json<StaticRoute>,
) -> Result<Json<StaticRoute>> {
    state.static_routes.update(&domain, route.clone()).await?;
    state.reconciler.apply_static_routes().await?;
    Ok(Json(route))
}

async fn delete_static_route(State(state): State<ApiState>, Path(domain): Path<String>) -> Result<Json<Value>> {
    state.static_routes.delete(&domain).await?;
    state.reconciler.apply_static_routes().await?;
    Ok(Json(json!({ "deleted": domain })))
}

#[derive(Debug, Serialize)]
struct RecheckDnsResponse {
    routes: Vec<StaticRoute>,
}

async fn recheck_dns(State(state): State<ApiState>) -> Json<RecheckDnsResponse> {
    state.static_routes.validate_dns().await;
    Json(RecheckDnsResponse { routes: state.static_routes.list().await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = health().await;
        assert_eq!(response.0["status"], "ok");
    }
}
