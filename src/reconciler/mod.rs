//! Reconciler: owns the single source of truth for which containers are
//! running where, drives per-host event consumption, and keeps the proxy's
//! routes converged onto that truth via a periodic sweep.
//!
//! Grounded on `original_source/src/docker_monitor.py`'s `DockerMonitor`:
//! one in-memory container table guarded by a single lock (splitting the
//! table from the proxy-side bookkeeping invites races on container
//! replacement), per-host `_monitor_host` event-consumer tasks with fixed
//! 5s (stream ended) / 30s (exception) reconnect backoff, and the
//! `_reconciliation_loop`'s three-phase sweep: restore routes Caddy lost,
//! reconcile every host's live container list, then cull anything no
//! longer seen. Task-spawning and structured-logging idiom is carried from
//! `examples/KwaminaWhyte-rivetr/src/engine/container_monitor.rs`.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::hosts::{HostRegistry, ResolvedHost};
use crate::proxy::{self, ProxyDriver};
use crate::runtime::{EventAction, RemoteRuntimeClient};
use crate::service::Container;
use crate::static_routes::StaticRouteStore;

const STREAM_END_BACKOFF: Duration = Duration::from_secs(5);
const STREAM_ERROR_BACKOFF: Duration = Duration::from_secs(30);
const SWEEP_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// A snapshot view of a tracked container, for the Read/Query Surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub host_alias: String,
    pub domains: Vec<String>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// A summary count, for `/containers/summary`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainersSummary {
    pub total_containers: usize,
    pub total_services: usize,
    pub by_host: HashMap<String, usize>,
}

/// Per-host status, for `/hosts/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostStatusView {
    pub alias: String,
    pub hostname: String,
    pub enabled: bool,
    pub tracked_containers: usize,
}

/// The outcome of diffing tracked container routes against what's actually
/// installed in the proxy, for `/verify-caddy`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CaddyVerification {
    pub proxy_reachable: bool,
    pub matched_route_ids: Vec<String>,
    pub missing_route_ids: Vec<String>,
    pub orphaned_route_ids: Vec<String>,
}

struct ReconcilerState {
    containers: HashMap<String, Container>,
}

/// Coordinates container discovery, event consumption, and proxy
/// convergence across every configured host.
pub struct Reconciler {
    hosts: HostRegistry,
    runtime: Arc<dyn RemoteRuntimeClient>,
    proxy: ProxyDriver,
    static_routes: Arc<StaticRouteStore>,
    state: Mutex<ReconcilerState>,
    reconcile_interval: Duration,
}

impl Reconciler {
    pub fn new(
        hosts: HostRegistry,
        runtime: Arc<dyn RemoteRuntimeClient>,
        proxy: ProxyDriver,
        static_routes: Arc<StaticRouteStore>,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            runtime,
            proxy,
            static_routes,
            state: Mutex::new(ReconcilerState { containers: HashMap::new() }),
            reconcile_interval,
        })
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn proxy(&self) -> &ProxyDriver {
        &self.proxy
    }

    /// `host.docker.internal` for localhost, DNS-resolved IP for everything
    /// else, falling back to the bare hostname on resolution failure. This
    /// fallback is intentional: a host that's momentarily unreachable by
    /// name shouldn't block route creation for everything else.
    fn resolve_host_ip(hostname: &str) -> String {
        if hostname == "localhost" || hostname == "127.0.0.1" {
            return "host.docker.internal".to_string();
        }
        match (hostname, 0u16).to_socket_addrs() {
            Ok(mut addrs) => addrs
                .next()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| hostname.to_string()),
            Err(_) => hostname.to_string(),
        }
    }

    /// Startup cleanup: remove any `revp_route_*` whose embedded container
    /// id either doesn't exist on any monitored host, or exists but no
    /// longer carries revp labels. Conservative: when in doubt, keep the
    /// route, since it might belong to a container we just can't currently
    /// verify.
    pub async fn startup_cleanup(&self) -> Result<()> {
        let owned_ids = self.proxy.owned_route_ids(proxy::SERVER_HTTPS).await?;
        let mut removed = 0;

        for route_id in owned_ids {
            let Some(rest) = route_id.strip_prefix("revp_route_") else { continue };
            let container_id = rest.split('_').next().unwrap_or(rest);

            if self.should_remove_stale_route(container_id).await {
                if let Err(e) = self.proxy.remove_route_by_id(proxy::SERVER_HTTPS, &route_id).await {
                    warn!(route_id = %route_id, error = %e, "failed to remove stale route during startup cleanup");
                    continue;
                }
                removed += 1;
            }
        }

        info!(removed, "startup route cleanup complete");
        Ok(())
    }

    async fn should_remove_stale_route(&self, container_id: &str) -> bool {
        for host in self.hosts.enabled_hosts() {
            match self.runtime.inspect_container(&host.alias, container_id).await {
                Ok(Some(detail)) => {
                    return Container::has_revp_labels(&detail.labels);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(host = %host.alias, container_id, error = %e, "inspect failed during stale-route check");
                    continue;
                }
            }
        }
        false
    }

    /// Handle a single container lifecycle event from a host's stream.
    async fn handle_event(&self, host: &ResolvedHost, host_ip: &str, action: EventAction, container_id: &str) {
        if action.is_start_like() {
            self.handle_container_start(host, host_ip, container_id).await;
        } else if action.is_stop_like() {
            self.handle_container_stop(container_id).await;
        } else if action == EventAction::Restart {
            self.handle_container_stop(container_id).await;
            self.handle_container_start(host, host_ip, container_id).await;
        }
    }

    async fn handle_container_start(&self, host: &ResolvedHost, host_ip: &str, container_id: &str) {
        let detail = match self.runtime.inspect_container(&host.alias, container_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                debug!(container_id, host = %host.alias, "container not found on inspect");
                return;
            }
            Err(e) => {
                warn!(container_id, host = %host.alias, error = %e, "failed to inspect container");
                return;
            }
        };

        if !Container::has_revp_labels(&detail.labels) {
            return;
        }

        let mut container = Container::new(
            detail.id.clone(),
            detail.name,
            host.alias.clone(),
            host_ip.to_string(),
            detail.labels,
        );

        if !container.is_valid() {
            warn!(container = %container.name, "container has revp labels but no valid services");
            return;
        }

        container.resolve_port_mapping(&detail.ports);

        let services: Vec<_> = container
            .valid_services()
            .map(|(_, s)| s.clone())
            .collect();

        for service in &services {
            if let Err(e) = self.proxy.add_container_route(&container.id, &container.host_ip, service).await {
                error!(domain = %service.domain, error = %e, "failed to add proxy route");
            } else {
                info!(domain = %service.domain, container = %container.name, "added proxy route");
            }
        }

        let mut state = self.state.lock().await;
        state.containers.insert(container.id.clone(), container);
    }

    async fn handle_container_stop(&self, container_id: &str) {
        let mut state = self.state.lock().await;

        let key = if state.containers.contains_key(container_id) {
            Some(container_id.to_string())
        } else {
            let short = &container_id[..container_id.len().min(12)];
            state
                .containers
                .keys()
                .find(|k| k.starts_with(short) || k.as_str() == short)
                .cloned()
        };

        let Some(key) = key else { return };
        let Some(container) = state.containers.remove(&key) else { return };
        drop(state);

        info!(container = %container.name, "container stopped, removing routes");
        for (_, service) in container.valid_services() {
            if let Err(e) = self
                .proxy
                .remove_container_route(&container.id, &service.container_port, service.force_ssl)
                .await
            {
                error!(domain = %service.domain, error = %e, "failed to remove proxy route");
            }
        }
    }

    /// Spawn the per-host event consumer and the periodic sweep task.
    /// Returns immediately; the spawned tasks run for the process lifetime.
    pub fn spawn_tasks(self: &Arc<Self>) {
        for host in self.hosts.enabled_hosts() {
            let reconciler = Arc::clone(self);
            let host = host.clone();
            tokio::spawn(async move {
                reconciler.run_event_consumer(host).await;
            });
        }

        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            reconciler.run_sweep_loop().await;
        });
    }

    async fn run_event_consumer(self: Arc<Self>, host: ResolvedHost) {
        info!(host = %host.alias, "starting event consumer");

        loop {
            let host_ip = Self::resolve_host_ip(&host.hostname);
            let mut stream = self.runtime.stream_events(&host.alias);
            let mut saw_error = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        debug!(host = %host.alias, action = ?event.action, id = %event.id, "container event");
                        self.handle_event(&host, &host_ip, event.action, &event.id).await;
                    }
                    Err(e) => {
                        if e.is_retryable_in_consumer() {
                            warn!(host = %host.alias, error = %e, "event stream error, will reconnect");
                        } else {
                            error!(host = %host.alias, error = %e, "unexpected event stream error");
                        }
                        saw_error = true;
                        break;
                    }
                }
            }

            let backoff = if saw_error { STREAM_ERROR_BACKOFF } else { STREAM_END_BACKOFF };
            warn!(host = %host.alias, backoff_secs = backoff.as_secs(), "event stream ended, reconnecting");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_sweep_loop(self: Arc<Self>) {
        tokio::time::sleep(SWEEP_INITIAL_DELAY).await;

        loop {
            info!("starting reconciliation sweep");

            if let Err(e) = self.check_and_restore_routes().await {
                error!(error = %e, "route restoration check failed");
            }

            self.reconcile_all_hosts().await;

            info!("reconciliation sweep complete");
            tokio::time::sleep(self.reconcile_interval).await;
        }
    }

    /// Restore any `revp_route_*` for a tracked container+service that's
    /// gone missing from the proxy (e.g. an operator wiped Caddy's config).
    /// A no-op while the container table is still empty, since everything
    /// will be (re)discovered by the next host sweep anyway.
    async fn check_and_restore_routes(&self) -> Result<()> {
        let snapshot: Vec<Container> = {
            let state = self.state.lock().await;
            if state.containers.is_empty() {
                return Ok(());
            }
            state.containers.values().cloned().collect()
        };

        let current_ids = self.proxy.owned_route_ids(proxy::SERVER_HTTPS).await?;

        let mut restored = 0;
        for container in &snapshot {
            for (_, service) in container.valid_services() {
                let expected = proxy::container_route_id(&container.id, &service.container_port);
                if !current_ids.contains(&expected) {
                    warn!(route_id = %expected, "route missing from proxy, restoring");
                    if let Err(e) = self.proxy.add_container_route(&container.id, &container.host_ip, service).await {
                        error!(route_id = %expected, error = %e, "failed to restore route");
                    } else {
                        restored += 1;
                    }
                }
            }
        }
        if restored > 0 {
            info!(restored, "restored missing routes");
        }
        Ok(())
    }

    async fn reconcile_all_hosts(&self) {
        let mut seen = std::collections::HashSet::new();

        for host in self.hosts.enabled_hosts() {
            self.reconcile_host(host, &mut seen).await;
        }

        let containers_empty = self.state.lock().await.containers.is_empty();
        if containers_empty {
            info!("no tracked containers after sweep, forcing route creation");
            self.force_route_creation().await;
        }

        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .containers
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect()
        };

        for container_id in stale {
            info!(container_id = %container_id, "container no longer seen on any host, removing");
            self.handle_container_stop(&container_id).await;
        }
    }

    async fn reconcile_host(&self, host: &ResolvedHost, seen: &mut std::collections::HashSet<String>) {
        let host_ip = Self::resolve_host_ip(&host.hostname);

        let containers = match self.runtime.list_containers(&host.alias, false).await {
            Ok(c) => c,
            Err(e) => {
                error!(host = %host.alias, error = %e, "failed to list containers");
                return;
            }
        };

        for summary in containers {
            if summary.id.is_empty() {
                continue;
            }
            seen.insert(summary.id.clone());

            let already_tracked = self.state.lock().await.containers.contains_key(&summary.id);
            if already_tracked {
                if let Some(container) = self.state.lock().await.containers.get_mut(&summary.id) {
                    container.last_seen = chrono::Utc::now();
                }
            } else {
                self.handle_container_start(host, &host_ip, &summary.id).await;
            }
        }
    }

    /// Bootstrap fallback for when the container table is still empty
    /// after a full host sweep (e.g. right after process start, before any
    /// `docker events` have fired): scan every host's containers directly
    /// for revp labels and process them as if they'd just started.
    async fn force_route_creation(&self) {
        for host in self.hosts.enabled_hosts() {
            let host_ip = Self::resolve_host_ip(&host.hostname);

            let containers = match self.runtime.list_containers(&host.alias, false).await {
                Ok(c) => c,
                Err(e) => {
                    error!(host = %host.alias, error = %e, "failed to list containers during forced creation");
                    continue;
                }
            };

            for summary in containers {
                if !Container::has_revp_labels(&summary.labels) {
                    continue;
                }
                info!(container_id = %summary.id, host = %host.alias, "force-creating route");
                self.handle_container_start(host, &host_ip, &summary.id).await;
            }
        }
    }

    /// Apply the static route store's current contents to the proxy:
    /// called at startup and again whenever the store's file-watch fires.
    pub async fn apply_static_routes(&self) -> Result<()> {
        self.static_routes.validate_dns().await;
        let routes = self.static_routes.list().await;
        let skipped = self.proxy.replace_static_routes(&routes).await?;
        if skipped > 0 {
            warn!(skipped, "skipped static routes with failed DNS resolution");
        }
        Ok(())
    }

    pub async fn containers_view(&self) -> Vec<ContainerView> {
        let state = self.state.lock().await;
        state
            .containers
            .values()
            .map(|c| ContainerView {
                id: c.id.clone(),
                name: c.name.clone(),
                host_alias: c.host_alias.clone(),
                domains: c.valid_services().map(|(_, s)| s.domain.clone()).collect(),
                last_seen: c.last_seen,
            })
            .collect()
    }

    pub async fn containers_summary(&self) -> ContainersSummary {
        let state = self.state.lock().await;
        let mut by_host: HashMap<String, usize> = HashMap::new();
        let mut total_services = 0;
        for container in state.containers.values() {
            *by_host.entry(container.host_alias.clone()).or_insert(0) += 1;
            total_services += container.valid_services().count();
        }
        ContainersSummary {
            total_containers: state.containers.len(),
            total_services,
            by_host,
        }
    }

    pub async fn hosts_status(&self) -> Vec<HostStatusView> {
        let state = self.state.lock().await;
        self.hosts
            .all_hosts()
            .into_iter()
            .map(|h| HostStatusView {
                alias: h.alias.clone(),
                hostname: h.hostname.clone(),
                enabled: h.enabled,
                tracked_containers: state.containers.values().filter(|c| c.host_alias == h.alias).count(),
            })
            .collect()
    }

    /// Diff expected `revp_*` routes (tracked containers + static routes)
    /// against what's actually owned on the proxy, for the operator-facing
    /// `/verify-caddy` endpoint: matched / missing / orphaned, per spec.md
    /// §4.7.
    pub async fn verify_caddy(&self) -> CaddyVerification {
        let unreachable = || CaddyVerification {
            proxy_reachable: false,
            matched_route_ids: Vec::new(),
            missing_route_ids: Vec::new(),
            orphaned_route_ids: Vec::new(),
        };

        let reachable = self.proxy.test_connection().await.unwrap_or(false);
        if !reachable {
            return unreachable();
        }

        let https_ids = match self.proxy.owned_route_ids(proxy::SERVER_HTTPS).await {
            Ok(ids) => ids,
            Err(_) => return unreachable(),
        };
        let http_ids = match self.proxy.owned_route_ids(proxy::SERVER_HTTP).await {
            Ok(ids) => ids,
            Err(_) => return unreachable(),
        };
        let current_ids: std::collections::HashSet<String> = https_ids.into_iter().chain(http_ids).collect();

        let mut expected_ids = std::collections::HashSet::new();
        {
            let state = self.state.lock().await;
            for container in state.containers.values() {
                for (_, service) in container.valid_services() {
                    expected_ids.insert(proxy::container_route_id(&container.id, &service.container_port));
                    // cloudflare-tunnel services reuse this same id on srv1, so no
                    // extra expected id; only the plain-redirect case adds one.
                    if !service.cloudflare_tunnel && service.force_ssl {
                        expected_ids.insert(proxy::http_redirect_id(&container.id, &service.container_port));
                    }
                }
            }
        }
        for route in self.static_routes.list().await {
            if route.dns_resolved == Some(false) {
                continue;
            }
            expected_ids.insert(proxy::static_route_id(&route.domain));
            if !route.cloudflare_tunnel && route.force_ssl {
                expected_ids.insert(proxy::static_http_redirect_id(&route.domain));
            }
        }

        let matched: Vec<String> = expected_ids.intersection(&current_ids).cloned().collect();
        let missing: Vec<String> = expected_ids.difference(&current_ids).cloned().collect();
        let orphaned: Vec<String> = current_ids.difference(&expected_ids).cloned().collect();

        CaddyVerification { proxy_reachable: true, matched_route_ids: matched, missing_route_ids: missing, orphaned_route_ids: orphaned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_localhost_to_docker_internal_gateway() {
        assert_eq!(Reconciler::resolve_host_ip("localhost"), "host.docker.internal");
        assert_eq!(Reconciler::resolve_host_ip("127.0.0.1"), "host.docker.internal");
    }

    #[test]
    fn falls_back_to_hostname_when_resolution_fails() {
        let resolved = Reconciler::resolve_host_ip("this-host-does-not-exist.invalid");
        assert_eq!(resolved, "this-host-does-not-exist.invalid");
    }
}
