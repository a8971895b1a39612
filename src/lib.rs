pub mod api;
pub mod config;
pub mod error;
pub mod hosts;
pub mod proxy;
pub mod reconciler;
pub mod runtime;
pub mod service;
pub mod static_routes;

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use config::Config;
use reconciler::Reconciler;
use static_routes::StaticRouteStore;

/// Shared application state handed to the Read/Query Surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reconciler: Arc<Reconciler>,
    pub static_routes: Arc<StaticRouteStore>,
    pub started_at: Instant,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(
        config: Config,
        reconciler: Arc<Reconciler>,
        static_routes: Arc<StaticRouteStore>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            reconciler,
            static_routes,
            started_at: Instant::now(),
            metrics_handle,
        }
    }

    pub fn api_state(&self) -> api::ApiState {
        api::ApiState {
            reconciler: Arc::clone(&self.reconciler),
            static_routes: Arc::clone(&self.static_routes),
            started_at: self.started_at,
            metrics_handle: self.metrics_handle.clone(),
        }
    }
}
