//! Static Route Store: a YAML-backed list of routes that exist independent
//! of any container, with atomic saves and hot-reload on external edits.
//!
//! Grounded on `original_source/src/static_routes.py`'s `StaticRoute` /
//! `StaticRoutesManager`; the polling-observer + settle-delay watch strategy
//! is carried over verbatim (Docker bind-mount compatibility), but delivery
//! is a channel rather than a bare callback per spec.md §9's redesign note.
//! File-watch mechanics (`notify` + `notify-debouncer-mini`) are adapted
//! from `examples/digitalnodecom-burd`'s `park_watcher.rs`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{ReconcilerError, Result};

/// A route to a backend that doesn't come from container labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticRoute {
    pub domain: String,
    pub backend_url: String,
    #[serde(default = "default_backend_path")]
    pub backend_path: String,
    #[serde(default = "default_true")]
    pub force_ssl: bool,
    #[serde(default)]
    pub support_websocket: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub cloudflare_tunnel: bool,

    /// Populated by `ValidateDNS`, not persisted to disk. Only
    /// deserialization is skipped here (an inbound `PUT`/`POST` body can't
    /// set these) — they still serialize so the API surface (`GET`
    /// `/api/static-routes*`, `recheck-dns`) reports DNS status; the file
    /// persistence path serializes through `PersistedStaticRoute` instead,
    /// which omits them entirely.
    #[serde(skip_deserializing, default)]
    pub dns_resolved: Option<bool>,
    #[serde(skip_deserializing, default)]
    pub backend_host: Option<String>,
    #[serde(skip_deserializing, default)]
    pub backend_ip: Option<String>,
    #[serde(skip_deserializing, default)]
    pub dns_error: Option<String>,
}

fn default_backend_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

impl StaticRoute {
    fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(ReconcilerError::validation("static route domain must not be empty"));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(ReconcilerError::validation(format!(
                "static route '{}': backend_url must start with http:// or https://",
                self.domain
            )));
        }
        Ok(())
    }

    /// Resolve the host (and scheme) out of `backend_url`, populating
    /// `backend_host` for later `ValidateDNS` calls.
    fn parse_backend_host(&self) -> Option<String> {
        self.backend_url
            .split("://")
            .nth(1)?
            .split('/')
            .next()?
            .split(':')
            .next()
            .map(str::to_string)
    }

    /// The `host:port` dial target for the proxy's reverse_proxy upstream:
    /// strips the scheme and any path component but keeps the port.
    pub fn dial_target(&self) -> Result<String> {
        self.backend_url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .map(str::to_string)
            .ok_or_else(|| {
                ReconcilerError::validation(format!(
                    "static route '{}': could not parse backend_url '{}'",
                    self.domain, self.backend_url
                ))
            })
    }
}

#[derive(Debug, Deserialize)]
struct RawStaticRoutesFile {
    #[serde(default)]
    static_routes: Vec<StaticRoute>,
}

/// Only the fields a route file actually carries on disk — the DNS-status
/// fields on `StaticRoute` are runtime-only and never round-trip through
/// YAML, so they don't belong in what gets written back.
#[derive(Debug, Serialize)]
struct PersistedStaticRoute<'a> {
    domain: &'a str,
    backend_url: &'a str,
    backend_path: &'a str,
    force_ssl: bool,
    support_websocket: bool,
    tls_insecure_skip_verify: bool,
    cloudflare_tunnel: bool,
}

impl<'a> From<&'a StaticRoute> for PersistedStaticRoute<'a> {
    fn from(route: &'a StaticRoute) -> Self {
        Self {
            domain: &route.domain,
            backend_url: &route.backend_url,
            backend_path: &route.backend_path,
            force_ssl: route.force_ssl,
            support_websocket: route.support_websocket,
            tls_insecure_skip_verify: route.tls_insecure_skip_verify,
            cloudflare_tunnel: route.cloudflare_tunnel,
        }
    }
}

#[derive(Debug, Serialize)]
struct PersistedStaticRoutesFile<'a> {
    static_routes: Vec<PersistedStaticRoute<'a>>,
}

/// A change notification delivered to `Watch` subscribers: the full,
/// freshly-reloaded route list.
#[derive(Debug, Clone)]
pub struct RoutesChanged(pub Vec<StaticRoute>);

/// The in-memory, file-backed collection of static routes.
pub struct StaticRouteStore {
    path: PathBuf,
    routes: Mutex<HashMap<String, StaticRoute>>,
}

impl StaticRouteStore {
    /// Load from `path`; a missing file is treated as an empty store
    /// (static routes are optional, unlike the host registry).
    pub async fn load(path: &Path) -> Result<Self> {
        let routes = if path.exists() {
            read_routes_file(path)?
        } else {
            info!("no static routes file at {}, starting empty", path.display());
            Vec::new()
        };

        let mut map = HashMap::with_capacity(routes.len());
        for route in routes {
            route.validate()?;
            map.insert(route.domain.clone(), route);
        }

        Ok(Self {
            path: path.to_path_buf(),
            routes: Mutex::new(map),
        })
    }

    pub async fn list(&self) -> Vec<StaticRoute> {
        self.routes.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, domain: &str) -> Option<StaticRoute> {
        self.routes.lock().await.get(domain).cloned()
    }

    pub async fn add(&self, route: StaticRoute) -> Result<()> {
        route.validate()?;
        let mut routes = self.routes.lock().await;
        if routes.contains_key(&route.domain) {
            return Err(ReconcilerError::conflict(format!(
                "static route for domain '{}' already exists",
                route.domain
            )));
        }
        routes.insert(route.domain.clone(), route);
        self.save_locked(&routes).await
    }

    pub async fn update(&self, domain: &str, route: StaticRoute) -> Result<()> {
        route.validate()?;
        let mut routes = self.routes.lock().await;
        if !routes.contains_key(domain) {
            return Err(ReconcilerError::not_found(format!(
                "no static route for domain '{domain}'"
            )));
        }
        if route.domain != domain && routes.contains_key(&route.domain) {
            return Err(ReconcilerError::conflict(format!(
                "static route for domain '{}' already exists",
                route.domain
            )));
        }
        routes.remove(domain);
        routes.insert(route.domain.clone(), route);
        self.save_locked(&routes).await
    }

    pub async fn delete(&self, domain: &str) -> Result<()> {
        let mut routes = self.routes.lock().await;
        if routes.remove(domain).is_none() {
            return Err(ReconcilerError::not_found(format!(
                "no static route for domain '{domain}'"
            )));
        }
        self.save_locked(&routes).await
    }

    /// Resolve each route's backend host via DNS, recording the outcome on
    /// the in-memory copy (spec.md §4.4's `ValidateDNS`). Does not persist
    /// to disk — resolution state is informational only.
    pub async fn validate_dns(&self) {
        let mut routes = self.routes.lock().await;
        for route in routes.values_mut() {
            let Some(host) = route.parse_backend_host() else {
                route.dns_resolved = Some(false);
                route.dns_error = Some("could not parse host from backend_url".to_string());
                continue;
            };
            route.backend_host = Some(host.clone());
            match (host.as_str(), 0u16).to_socket_addrs_best_effort() {
                Ok(ip) => {
                    route.backend_ip = Some(ip.clone());
                    route.dns_resolved = Some(true);
                    route.dns_error = None;
                }
                Err(e) => {
                    route.dns_resolved = Some(false);
                    route.dns_error = Some(e);
                }
            }
        }
    }

    async fn save_locked(&self, routes: &HashMap<String, StaticRoute>) -> Result<()> {
        let list: Vec<StaticRoute> = routes.values().cloned().collect();
        write_routes_file(&self.path, &list)
    }

    /// Start a background watch of the store's parent directory, delivering
    /// the fresh route list on every settled change to this file. Mirrors
    /// `StaticRoutesManager.start_watching`'s ~500ms settle delay, but with
    /// the debouncer crate's own coalescing instead of a hand-rolled sleep.
    pub fn watch(self: &std::sync::Arc<Self>) -> Result<mpsc::Receiver<RoutesChanged>> {
        use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};

        let (tx, rx) = mpsc::channel(8);
        let watch_path = self.path.clone();
        let parent = watch_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let store = std::sync::Arc::clone(self);

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(Duration::from_millis(500), move |res| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| ReconcilerError::internal(format!("failed to start file watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(&parent, notify::RecursiveMode::NonRecursive)
            .map_err(|e| ReconcilerError::internal(format!("failed to watch {}: {e}", parent.display())))?;

        tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(res) = raw_rx.recv().await {
                let Ok(events) = res else {
                    continue;
                };
                let touched = events.iter().any(|e| {
                    e.kind == DebouncedEventKind::Any && e.path == watch_path
                });
                if !touched {
                    continue;
                }

                match read_routes_file(&watch_path) {
                    Ok(fresh) => {
                        let mut map = HashMap::with_capacity(fresh.len());
                        let mut valid = Vec::with_capacity(fresh.len());
                        for route in fresh {
                            if route.validate().is_ok() {
                                map.insert(route.domain.clone(), route.clone());
                                valid.push(route);
                            } else {
                                warn!(domain = %route.domain, "dropping invalid static route on reload");
                            }
                        }
                        *store.routes.lock().await = map;
                        if tx.send(RoutesChanged(valid)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("static routes reload failed: {e}"),
                }
            }
        });

        Ok(rx)
    }
}

const DEFAULT_HEADER: &str = "# Managed by revp-reconciler. Edits are preserved across reloads;\n# this header comment is kept verbatim on every save.\n";

fn read_routes_file(path: &Path) -> Result<Vec<StaticRoute>> {
    let content = std::fs::read_to_string(path)?;
    let raw: RawStaticRoutesFile = serde_yaml::from_str(&content)?;
    Ok(raw.static_routes)
}

/// The leading run of `#`-comment (and blank) lines at the top of the
/// existing file, preserved verbatim across saves per spec.md §4.4. Falls
/// back to a default header when the file doesn't exist yet or carries none.
fn existing_header(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return DEFAULT_HEADER.to_string();
    };

    let mut header = String::new();
    for line in content.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            header.push_str(line);
            header.push('\n');
        } else {
            break;
        }
    }

    if header.is_empty() {
        DEFAULT_HEADER.to_string()
    } else {
        header
    }
}

/// Atomic save: write to a temp file in the same directory, then rename
/// over the target, so a concurrent reader never observes a partial write.
fn write_routes_file(path: &Path, routes: &[StaticRoute]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let header = existing_header(path);
    let persisted = PersistedStaticRoutesFile { static_routes: routes.iter().map(PersistedStaticRoute::from).collect() };
    let yaml = serde_yaml::to_string(&persisted)
        .map_err(|e| ReconcilerError::internal(format!("failed to serialize static routes: {e}")))?;
    let body = format!("{header}{yaml}");

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path)
        .map_err(|e| ReconcilerError::internal(format!("failed to persist static routes file: {e}")))?;

    Ok(())
}

/// Small seam so DNS resolution is unit-testable without touching the
/// network: production code resolves via the standard library, tests can
/// swap in a fake via the same trait if ever needed.
trait BestEffortResolve {
    fn to_socket_addrs_best_effort(&self) -> std::result::Result<String, String>;
}

impl BestEffortResolve for (&str, u16) {
    fn to_socket_addrs_best_effort(&self) -> std::result::Result<String, String> {
        use std::net::ToSocketAddrs;
        match self.to_socket_addrs() {
            Ok(mut addrs) => addrs
                .next()
                .map(|a| a.ip().to_string())
                .ok_or_else(|| format!("no addresses for host '{}'", self.0)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn sample_route(domain: &str) -> StaticRoute {
        StaticRoute {
            domain: domain.to_string(),
            backend_url: "http://10.0.0.5:9000".to_string(),
            backend_path: "/".to_string(),
            force_ssl: true,
            support_websocket: false,
            tls_insecure_skip_verify: false,
            cloudflare_tunnel: false,
            dns_resolved: None,
            backend_host: None,
            backend_ip: None,
            dns_error: None,
        }
    }

    #[tokio::test]
    async fn loads_empty_when_file_missing() {
        let store = StaticRouteStore::load(Path::new("/nonexistent/static-routes.yml"))
            .await
            .unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn add_persists_and_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        store.add(sample_route("a.example.com")).await.unwrap();
        assert_eq!(store.list().await.len(), 1);

        let reloaded = StaticRouteStore::load(&path).await.unwrap();
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        store.add(sample_route("a.example.com")).await.unwrap();
        let err = store.add(sample_route("a.example.com")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn update_rejects_rename_onto_existing_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        store.add(sample_route("a.example.com")).await.unwrap();
        store.add(sample_route("b.example.com")).await.unwrap();

        let err = store
            .update("a.example.com", sample_route("b.example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn save_preserves_a_custom_header_comment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        std::fs::write(&path, "# custom header\n# second line\nstatic_routes: []\n").unwrap();

        let store = StaticRouteStore::load(&path).await.unwrap();
        store.add(sample_route("a.example.com")).await.unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.starts_with("# custom header\n# second line\n"));
    }

    #[tokio::test]
    async fn save_omits_dns_status_fields_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        store.add(sample_route("a.example.com")).await.unwrap();
        store.validate_dns().await;

        let route = store.get("a.example.com").await.unwrap();
        assert!(route.dns_resolved.is_some(), "in-memory copy should carry DNS status");

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("dns_resolved"));
        assert!(!saved.contains("backend_ip"));
    }

    #[tokio::test]
    async fn update_missing_domain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        let err = store
            .update("missing.example.com", sample_route("missing.example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        store.add(sample_route("a.example.com")).await.unwrap();
        store.delete("a.example.com").await.unwrap();
        assert!(store.list().await.is_empty());

        let reloaded = StaticRouteStore::load(&path).await.unwrap();
        assert!(reloaded.list().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_backend_url_without_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-routes.yml");
        let store = StaticRouteStore::load(&path).await.unwrap();

        let mut route = sample_route("a.example.com");
        route.backend_url = "10.0.0.5:9000".to_string();
        assert!(store.add(route).await.is_err());
    }

    #[test]
    fn parses_backend_host_from_url() {
        let route = sample_route("a.example.com");
        assert_eq!(route.parse_backend_host(), Some("10.0.0.5".to_string()));
    }

    #[test]
    fn invalid_routes_in_file_are_rejected_on_load() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(
            b"static_routes:\n  - domain: a.example.com\n    backend_url: not-a-url\n",
        )
        .unwrap();

        let err = futures::executor::block_on(StaticRouteStore::load(f.path())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
