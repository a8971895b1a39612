//! Proxy Driver: talks to the external Caddy-style HTTP admin API to
//! install and remove routes, while never touching anything it doesn't
//! own.
//!
//! Grounded on `original_source/src/caddy_manager.py` (`CaddyManager`):
//! the two-server model (`srv0` terminates HTTPS, `srv1` terminates HTTP
//! and either redirects to HTTPS or passes cloudflare-tunnel traffic
//! straight through), the route JSON shapes (`_create_route_config`,
//! `_create_static_route_config`, `_create_http_redirect_config`), and the
//! safety rule in `_remove_route_by_id` that only routes whose `@id`
//! carries one of the four `revp_`-prefixed grammars are ever touched —
//! every other route already present in the proxy (installed by another
//! system, or by a human) is left alone. One deliberate generalization
//! over the original: route removal targets the server the id actually
//! lives on instead of always querying `srv0`, since this implementation
//! tracks which server owns which id rather than assuming.

use serde_json::{json, Value};

use crate::error::{ReconcilerError, Result};
use crate::service::Service;
use crate::static_routes::StaticRoute;

pub const SERVER_HTTPS: &str = "srv0";
pub const SERVER_HTTP: &str = "srv1";

const ROUTE_PREFIXES: &[&str] = &[
    "revp_route_",
    "revp_static_route_",
    "revp_http_redirect_",
    "revp_static_http_redirect_",
];

/// True if `id` belongs to a grammar this reconciler owns and may mutate.
pub fn is_owned_route_id(id: &str) -> bool {
    ROUTE_PREFIXES.iter().any(|p| id.starts_with(p))
}

fn sanitize_domain(domain: &str) -> String {
    domain.replace('.', "_")
}

/// Heuristic for spec.md §4.5's special-case: a static route whose backend
/// host is a Home-Assistant-style upstream needs the original `Host` header
/// preserved, since Home Assistant validates it against its own
/// `trusted_proxies`/hostname allowlist.
fn targets_home_assistant(backend_url: &str) -> bool {
    backend_url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .map(|host_port| {
            let host = host_port.split(':').next().unwrap_or(host_port).to_ascii_lowercase();
            host == "homeassistant" || host.starts_with("homeassistant.") || host.starts_with("hass.")
        })
        .unwrap_or(false)
}

pub fn container_route_id(container_id: &str, port: &str) -> String {
    format!("revp_route_{container_id}_{port}")
}

pub fn http_redirect_id(container_id: &str, port: &str) -> String {
    format!("revp_http_redirect_{container_id}_{port}")
}

pub fn static_route_id(domain: &str) -> String {
    format!("revp_static_route_{}", sanitize_domain(domain))
}

pub fn static_http_redirect_id(domain: &str) -> String {
    format!("revp_static_http_redirect_{}", sanitize_domain(domain))
}

fn forwarding_headers(cloudflare_tunnel: bool, support_websocket: bool) -> Value {
    let mut set = serde_json::Map::new();
    if cloudflare_tunnel {
        set.insert("X-Forwarded-Proto".into(), json!(["https"]));
        set.insert(
            "X-Real-IP".into(),
            json!(["{http.request.header.CF-Connecting-IP}"]),
        );
        set.insert(
            "X-Forwarded-For".into(),
            json!(["{http.request.header.CF-Connecting-IP}"]),
        );
        set.insert("X-Forwarded-Host".into(), json!(["{http.request.host}"]));
    } else {
        set.insert(
            "X-Forwarded-For".into(),
            json!(["{http.request.header.X-Forwarded-For}, {http.request.remote.host}"]),
        );
        set.insert("X-Forwarded-Proto".into(), json!(["{http.request.scheme}"]));
        set.insert("X-Forwarded-Host".into(), json!(["{http.request.host}"]));
        set.insert("X-Real-IP".into(), json!(["{http.request.remote.host}"]));
    }
    if support_websocket {
        set.insert("Connection".into(), json!(["{http.request.header.Connection}"]));
        set.insert("Upgrade".into(), json!(["{http.request.header.Upgrade}"]));
    }
    json!({ "request": { "set": Value::Object(set) } })
}

fn redirect_handle() -> Value {
    json!([{
        "handler": "static_response",
        "headers": { "Location": ["https://{http.request.host}{http.request.uri}"] },
        "status_code": 308
    }])
}

/// The HTTPS (or cloudflare-tunnel HTTP) route for a container's service.
pub fn build_container_route(container_id: &str, host_ip: &str, service: &Service) -> Value {
    let mut handler = json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": format!("{}:{}", host_ip, service.dial_port()) }],
    });
    if service.backend_proto == "https" {
        handler["transport"] = json!({ "protocol": "http", "tls": {} });
    }
    if service.backend_path != "/" {
        handler["rewrite"] = json!({ "strip_path_prefix": service.backend_path.trim_end_matches('/') });
    }
    handler["headers"] = forwarding_headers(service.cloudflare_tunnel, service.support_websocket);

    json!({
        "@id": container_route_id(container_id, &service.container_port),
        "match": [{ "host": [service.domain] }],
        "handle": [handler],
        "terminal": true,
    })
}

/// The plain 308 HTTP-to-HTTPS redirect for a container's service.
pub fn build_http_redirect(container_id: &str, port: &str, domain: &str) -> Value {
    json!({
        "@id": http_redirect_id(container_id, port),
        "match": [{ "host": [domain] }],
        "handle": redirect_handle(),
        "terminal": true,
    })
}

/// The HTTPS route for an operator-authored static route.
pub fn build_static_route(route: &StaticRoute) -> Result<Value> {
    let backend_dial = route.dial_target()?;
    let mut handler = json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": backend_dial }],
    });
    if route.backend_url.starts_with("https://") {
        let mut tls = json!({});
        if route.tls_insecure_skip_verify {
            tls["insecure_skip_verify"] = json!(true);
        }
        handler["transport"] = json!({ "protocol": "http", "tls": tls });
    }
    if route.backend_path != "/" {
        let path = route.backend_path.trim_end_matches('/');
        handler["rewrite"] = json!({ "uri": format!("{path}{{http.request.uri}}") });
    }
    let mut headers = forwarding_headers(route.cloudflare_tunnel, route.support_websocket);
    if targets_home_assistant(&route.backend_url) {
        headers["request"]["set"]["Host"] = json!(["{http.request.host}"]);
    }
    handler["headers"] = headers;

    Ok(json!({
        "@id": static_route_id(&route.domain),
        "match": [{ "host": [route.domain] }],
        "handle": [handler],
        "terminal": true,
    }))
}

pub fn build_static_http_redirect(domain: &str) -> Value {
    json!({
        "@id": static_http_redirect_id(domain),
        "match": [{ "host": [domain] }],
        "handle": redirect_handle(),
        "terminal": true,
    })
}

/// Thin HTTP client over the admin API, per spec.md §4.5.
#[derive(Debug, Clone)]
pub struct ProxyDriver {
    client: reqwest::Client,
    api_url: String,
}

impl ProxyDriver {
    pub fn new(api_url: impl Into<String>, request_timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_secs))
            .build()?;
        Ok(Self { client, api_url: api_url.into().trim_end_matches('/').to_string() })
    }

    fn server_url(&self, server: &str, suffix: &str) -> String {
        format!("{}/config/apps/http/servers/{server}{suffix}", self.api_url)
    }

    /// Verify the admin API itself is reachable.
    pub async fn test_connection(&self) -> Result<bool> {
        let response = self.client.get(format!("{}/config/", self.api_url)).send().await?;
        Ok(response.status().is_success())
    }

    /// Make sure `srv0` listens on both `:80` and `:443`, creating or
    /// patching the server as needed.
    pub async fn ensure_listeners(&self) -> Result<()> {
        let url = self.server_url(SERVER_HTTPS, "");
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let body = json!({ "listen": [":80", ":443"], "routes": [] });
            let put = self.client.put(&url).json(&body).send().await?;
            if !put.status().is_success() {
                return Err(ReconcilerError::proxy(format!(
                    "failed to create server {}: {}",
                    SERVER_HTTPS,
                    put.status()
                )));
            }
            return Ok(());
        }

        let config: Value = response.json().await?;
        let listen: Vec<String> = config
            .get("listen")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let has_http = listen.iter().any(|l| l.contains(":80"));
        let has_https = listen.iter().any(|l| l.contains(":443"));

        if !has_http || !has_https {
            let patch = self
                .client
                .patch(&url)
                .json(&json!({ "listen": [":80", ":443"] }))
                .send()
                .await?;
            if !patch.status().is_success() {
                return Err(ReconcilerError::proxy(format!(
                    "failed to update listeners on {}: {}",
                    SERVER_HTTPS,
                    patch.status()
                )));
            }
        }

        Ok(())
    }

    /// All routes currently configured on `server`, or an empty vec if the
    /// server or its routes array doesn't exist yet.
    pub async fn get_routes(&self, server: &str) -> Result<Vec<Value>> {
        let response = self.client.get(self.server_url(server, "/routes")).send().await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let routes: Option<Vec<Value>> = response.json().await?;
        Ok(routes.unwrap_or_default())
    }

    /// The full admin API configuration tree, used by the verify/diff
    /// endpoint.
    pub async fn get_full_config(&self) -> Result<Value> {
        let response = self.client.get(format!("{}/config/", self.api_url)).send().await?;
        if !response.status().is_success() {
            return Err(ReconcilerError::proxy(format!(
                "failed to fetch full config: {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Remove every route on `server` whose `@id` equals `route_id`,
    /// iterating in reverse index order to tolerate accidental duplicates.
    /// Refuses to touch ids outside the four owned grammars.
    pub async fn remove_route_by_id(&self, server: &str, route_id: &str) -> Result<()> {
        if !is_owned_route_id(route_id) {
            return Ok(());
        }

        let routes = self.get_routes(server).await?;
        let indices: Vec<usize> = routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.get("@id").and_then(Value::as_str) == Some(route_id))
            .map(|(i, _)| i)
            .collect();

        for index in indices.into_iter().rev() {
            let url = self.server_url(server, &format!("/routes/{index}"));
            let response = self.client.delete(&url).send().await?;
            if !response.status().is_success() && response.status().as_u16() != 404 {
                return Err(ReconcilerError::proxy(format!(
                    "failed to remove route {route_id} at index {index} on {server}: {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    /// Idempotently install `route_config` on `server`: remove any
    /// pre-existing route with the same `@id` first, then append.
    pub async fn apply_route(&self, server: &str, route_config: &Value) -> Result<()> {
        let route_id = route_config
            .get("@id")
            .and_then(Value::as_str)
            .ok_or_else(|| ReconcilerError::internal("route configuration missing @id"))?;

        self.remove_route_by_id(server, route_id).await?;

        let routes_url = self.server_url(server, "/routes");
        let existing = self.client.get(&routes_url).send().await?;
        if existing.status().is_success() {
            let body: Value = existing.json().await?;
            if body.is_null() {
                let init = self.client.put(&routes_url).json(&json!([])).send().await?;
                if !init.status().is_success() {
                    return Err(ReconcilerError::proxy(format!(
                        "failed to initialize routes array on {server}: {}",
                        init.status()
                    )));
                }
            }
        }

        let response = self.client.post(&routes_url).json(route_config).send().await?;
        if !response.status().is_success() {
            return Err(ReconcilerError::proxy(format!(
                "failed to apply route {route_id} on {server}: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Install a container service's route(s), per spec.md §4.5: HTTPS
    /// route always on `srv0`; `srv1` gets either a redirect (force_ssl,
    /// non-tunnel), a passthrough copy (cloudflare_tunnel), or nothing.
    pub async fn add_container_route(&self, container_id: &str, host_ip: &str, service: &Service) -> Result<()> {
        let route = build_container_route(container_id, host_ip, service);
        self.apply_route(SERVER_HTTPS, &route).await?;

        if service.force_ssl && !service.cloudflare_tunnel {
            let redirect = build_http_redirect(container_id, &service.container_port, &service.domain);
            self.apply_route(SERVER_HTTP, &redirect).await?;
        } else if service.cloudflare_tunnel {
            self.apply_route(SERVER_HTTP, &route).await?;
        }

        Ok(())
    }

    /// Remove a container service's route(s) installed by
    /// `add_container_route`.
    pub async fn remove_container_route(&self, container_id: &str, port: &str, force_ssl: bool) -> Result<()> {
        self.remove_route_by_id(SERVER_HTTPS, &container_route_id(container_id, port)).await?;
        if force_ssl {
            self.remove_route_by_id(SERVER_HTTP, &http_redirect_id(container_id, port)).await?;
        }
        Ok(())
    }

    /// Install an operator-authored static route, mirroring
    /// `add_container_route`'s srv0/srv1 split.
    pub async fn add_static_route(&self, route: &StaticRoute) -> Result<()> {
        let config = build_static_route(route)?;
        self.apply_route(SERVER_HTTPS, &config).await?;

        if route.force_ssl && !route.cloudflare_tunnel {
            let redirect = build_static_http_redirect(&route.domain);
            self.apply_route(SERVER_HTTP, &redirect).await?;
        } else if route.cloudflare_tunnel {
            self.apply_route(SERVER_HTTP, &config).await?;
        }

        Ok(())
    }

    pub async fn remove_static_route(&self, domain: &str, force_ssl: bool) -> Result<()> {
        self.remove_route_by_id(SERVER_HTTPS, &static_route_id(domain)).await?;
        if force_ssl {
            self.remove_route_by_id(SERVER_HTTP, &static_http_redirect_id(domain)).await?;
        }
        Ok(())
    }

    /// Wipe every `revp_static_route_*`/`revp_static_http_redirect_*` route
    /// and re-add from `routes` fresh, skipping entries with failed DNS.
    /// Matches spec.md §4.4's accepted brief-empty-window tradeoff.
    pub async fn replace_static_routes(&self, routes: &[StaticRoute]) -> Result<usize> {
        self.wipe_routes_with_prefix(SERVER_HTTPS, "revp_static_route_").await?;
        self.wipe_routes_with_prefix(SERVER_HTTP, "revp_static_http_redirect_").await?;

        let mut skipped = 0;
        for route in routes {
            if route.dns_resolved == Some(false) {
                skipped += 1;
                continue;
            }
            self.add_static_route(route).await?;
        }
        Ok(skipped)
    }

    async fn wipe_routes_with_prefix(&self, server: &str, prefix: &str) -> Result<()> {
        let routes = self.get_routes(server).await?;
        let indices: Vec<usize> = routes
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.get("@id")
                    .and_then(Value::as_str)
                    .map(|id| id.starts_with(prefix))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();

        for index in indices.into_iter().rev() {
            let url = self.server_url(server, &format!("/routes/{index}"));
            let _ = self.client.delete(&url).send().await?;
        }
        Ok(())
    }

    /// All owned route ids currently present on `server`, for the
    /// restoration sweep and the `/verify-caddy` diff.
    pub async fn owned_route_ids(&self, server: &str) -> Result<Vec<String>> {
        let routes = self.get_routes(server).await?;
        Ok(routes
            .iter()
            .filter_map(|r| r.get("@id").and_then(Value::as_str))
            .filter(|id| is_owned_route_id(id))
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(domain: &str) -> Service {
        let mut labels = std::collections::HashMap::new();
        labels.insert("domain".to_string(), domain.to_string());
        crate::service::parse_services(&{
            let mut m = std::collections::HashMap::new();
            m.insert("snadboy.revp.8080.domain".to_string(), domain.to_string());
            m
        })
        .remove("8080")
        .unwrap()
    }

    #[test]
    fn route_ids_follow_the_four_owned_grammars() {
        assert_eq!(container_route_id("abc123", "8080"), "revp_route_abc123_8080");
        assert_eq!(http_redirect_id("abc123", "8080"), "revp_http_redirect_abc123_8080");
        assert_eq!(static_route_id("app.example.com"), "revp_static_route_app_example_com");
        assert_eq!(
            static_http_redirect_id("app.example.com"),
            "revp_static_http_redirect_app_example_com"
        );
    }

    #[test]
    fn owned_route_id_recognizes_all_four_prefixes_and_rejects_foreign() {
        assert!(is_owned_route_id("revp_route_abc_8080"));
        assert!(is_owned_route_id("revp_static_route_x"));
        assert!(is_owned_route_id("revp_http_redirect_abc_8080"));
        assert!(is_owned_route_id("revp_static_http_redirect_x"));
        assert!(!is_owned_route_id("some_other_teams_route"));
        assert!(!is_owned_route_id("catchall"));
    }

    #[test]
    fn container_route_config_has_reverse_proxy_handler_and_id() {
        let svc = service("app.example.com");
        let route = build_container_route("container123456", "192.0.2.10", &svc);
        assert_eq!(route["@id"], "revp_route_container123456_8080");
        assert_eq!(route["match"][0]["host"][0], "app.example.com");
        assert_eq!(route["handle"][0]["handler"], "reverse_proxy");
        assert_eq!(route["handle"][0]["upstreams"][0]["dial"], "192.0.2.10:8080");
    }

    #[test]
    fn redirect_config_is_a_308_static_response() {
        let redirect = build_http_redirect("container123456", "8080", "app.example.com");
        assert_eq!(redirect["@id"], "revp_http_redirect_container123456_8080");
        assert_eq!(redirect["handle"][0]["status_code"], 308);
    }

    #[test]
    fn backend_path_rewrites_with_strip_path_prefix() {
        let mut m = std::collections::HashMap::new();
        m.insert("snadboy.revp.8080.domain".to_string(), "app.example.com".to_string());
        m.insert("snadboy.revp.8080.backend-path".to_string(), "/api".to_string());
        let svc = crate::service::parse_services(&m).remove("8080").unwrap();
        let route = build_container_route("container123456", "192.0.2.10", &svc);
        assert_eq!(route["handle"][0]["rewrite"]["strip_path_prefix"], "/api");
    }

    #[test]
    fn static_route_to_home_assistant_preserves_host_header() {
        let route = StaticRoute {
            domain: "ha.example.com".to_string(),
            backend_url: "http://homeassistant:8123".to_string(),
            backend_path: "/".to_string(),
            force_ssl: true,
            support_websocket: false,
            tls_insecure_skip_verify: false,
            cloudflare_tunnel: false,
            dns_resolved: None,
            backend_host: None,
            backend_ip: None,
            dns_error: None,
        };
        let config = build_static_route(&route).unwrap();
        let headers = &config["handle"][0]["headers"]["request"]["set"];
        assert_eq!(headers["Host"][0], "{http.request.host}");
    }

    #[test]
    fn static_route_to_ordinary_backend_does_not_set_host_header() {
        let route = StaticRoute {
            domain: "app.example.com".to_string(),
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
        };
        let config = build_static_route(&route).unwrap();
        assert!(config["handle"][0]["headers"]["request"]["set"].get("Host").is_none());
    }

    #[test]
    fn cloudflare_tunnel_uses_cf_connecting_ip_headers() {
        let mut m = std::collections::HashMap::new();
        m.insert("snadboy.revp.8080.domain".to_string(), "app.example.com".to_string());
        m.insert("snadboy.revp.8080.cloudflare-tunnel".to_string(), "true".to_string());
        let svc = crate::service::parse_services(&m).remove("8080").unwrap();
        let route = build_container_route("container123456", "192.0.2.10", &svc);
        let headers = &route["handle"][0]["headers"]["request"]["set"];
        assert_eq!(headers["X-Real-IP"][0], "{http.request.header.CF-Connecting-IP}");
    }
}
