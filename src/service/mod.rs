//! Label Parser and Service Model: turns `snadboy.revp.<port>.<property>`
//! container labels into a set of `Service` routing intents, and resolves
//! published host ports from the runtime's port-binding table.
//!
//! Grounded on `original_source/src/docker_monitor.py`'s `ServiceInfo` and
//! `ContainerInfo._parse_services`/`resolve_port_mapping`, restated here as
//! a typed record per spec.md §9's "dynamic label shape -> tagged service
//! record" redesign flag.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// A single routing intent extracted from a container's labels: one
/// container port mapped to one external domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub container_port: String,
    pub domain: String,
    pub backend_proto: String,
    pub backend_path: String,
    pub force_ssl: bool,
    pub support_websocket: bool,
    pub cloudflare_tunnel: bool,
    pub resolved_host_port: Option<String>,
}

impl Service {
    fn from_labels(port: &str, labels: &HashMap<String, String>) -> Self {
        Self {
            container_port: port.to_string(),
            domain: labels.get("domain").cloned().unwrap_or_default(),
            backend_proto: labels
                .get("backend-proto")
                .cloned()
                .unwrap_or_else(|| "http".to_string()),
            backend_path: labels
                .get("backend-path")
                .cloned()
                .unwrap_or_else(|| "/".to_string()),
            force_ssl: parse_bool_label(labels.get("force-ssl"), true),
            support_websocket: parse_bool_label(labels.get("support-websocket"), false),
            cloudflare_tunnel: parse_bool_label(labels.get("cloudflare-tunnel"), false),
            resolved_host_port: None,
        }
    }

    /// A service is valid once it has a domain; the port is always present
    /// because it's the label grouping key.
    pub fn is_valid(&self) -> bool {
        !self.domain.is_empty()
    }

    /// The effective host port to dial: the resolved binding if port
    /// resolution found one, otherwise the declared container port
    /// (informational fallback, spec.md §4.3).
    pub fn dial_port(&self) -> &str {
        self.resolved_host_port
            .as_deref()
            .unwrap_or(&self.container_port)
    }

    /// `<proto>://<host_ip>:<port><path>` for a container-backed service.
    pub fn backend_url(&self, host_ip: &str) -> String {
        let path = normalize_path(&self.backend_path);
        format!(
            "{}://{}:{}{}",
            self.backend_proto,
            host_ip,
            self.dial_port(),
            path
        )
    }
}

fn parse_bool_label(value: Option<&String>, default: bool) -> bool {
    match value {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn label_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^snadboy\.revp\.([0-9]+)\.([A-Za-z0-9_-]+)$").unwrap())
}

/// Parse the `snadboy.revp.<port>.<property>` labels of a container into a
/// `Service` per declared port, per spec.md §4.3. Keys that don't match
/// exactly four dot-separated segments with a numeric third segment are
/// ignored. A service without `domain` is dropped from the valid set but
/// still constructed (so callers can distinguish "no revp labels" from
/// "revp labels present but invalid").
pub fn parse_services(labels: &HashMap<String, String>) -> HashMap<String, Service> {
    let mut grouped: HashMap<String, HashMap<String, String>> = HashMap::new();

    for (key, value) in labels {
        if let Some(caps) = label_key_regex().captures(key) {
            let port = caps.get(1).unwrap().as_str().to_string();
            let property = caps.get(2).unwrap().as_str().to_string();
            grouped.entry(port).or_default().insert(property, value.clone());
        }
    }

    grouped
        .into_iter()
        .map(|(port, props)| {
            let service = Service::from_labels(&port, &props);
            (port, service)
        })
        .collect()
}

/// One binding of a container port to a host port, as reported by the
/// runtime's `NetworkSettings.Ports`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// An observed running container, keyed by the runtime's (opaque) container
/// id. Mirrors spec.md §3's `Container` entity.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub host_alias: String,
    pub host_ip: String,
    pub labels: HashMap<String, String>,
    pub ports: HashMap<String, Vec<PortBinding>>,
    pub services: HashMap<String, Service>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl Container {
    pub fn new(
        id: String,
        name: String,
        host_alias: String,
        host_ip: String,
        labels: HashMap<String, String>,
    ) -> Self {
        let services = parse_services(&labels);
        Self {
            id,
            name,
            host_alias,
            host_ip,
            labels,
            ports: HashMap::new(),
            services,
            last_seen: chrono::Utc::now(),
        }
    }

    /// Whether any `snadboy.revp.<port>.*` labels are present at all
    /// (independent of validity) — used to decide whether to even build a
    /// `Container` for an event.
    pub fn has_revp_labels(labels: &HashMap<String, String>) -> bool {
        labels.keys().any(|k| label_key_regex().is_match(k))
    }

    pub fn is_valid(&self) -> bool {
        self.services.values().any(Service::is_valid)
    }

    pub fn valid_services(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter().filter(|(_, s)| s.is_valid())
    }

    /// The 12-character short id used for event-stream lookups, per
    /// spec.md §4.6 ("store the container under both its full id and its
    /// 12-char short id").
    pub fn short_id(&self) -> &str {
        let len = self.id.len().min(12);
        &self.id[..len]
    }

    /// Resolve each service's container port against the runtime's port
    /// bindings: try `<port>/tcp` first, then `<port>/udp`. Leaves
    /// `resolved_host_port` unset (with a warning) if neither exists.
    pub fn resolve_port_mapping(&mut self, ports: &HashMap<String, Vec<PortBinding>>) {
        self.ports = ports.clone();
        for service in self.services.values_mut() {
            let tcp_key = format!("{}/tcp", service.container_port);
            let udp_key = format!("{}/udp", service.container_port);

            if let Some(bindings) = ports.get(&tcp_key).filter(|b| !b.is_empty()) {
                service.resolved_host_port = Some(bindings[0].host_port.clone());
            } else if let Some(bindings) = ports.get(&udp_key).filter(|b| !b.is_empty()) {
                service.resolved_host_port = Some(bindings[0].host_port.clone());
            } else {
                warn!(
                    container = %self.name,
                    port = %service.container_port,
                    "container port is not published to host"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_single_service_with_defaults() {
        let labels = labels(&[("snadboy.revp.8080.domain", "app.example.com")]);
        let services = parse_services(&labels);
        let service = services.get("8080").unwrap();
        assert_eq!(service.domain, "app.example.com");
        assert_eq!(service.backend_proto, "http");
        assert_eq!(service.backend_path, "/");
        assert!(service.force_ssl);
        assert!(!service.support_websocket);
        assert!(service.is_valid());
    }

    #[test]
    fn ignores_malformed_keys() {
        let labels = labels(&[
            ("snadboy.revp.domain", "app.example.com"),
            ("snadboy.revp.abc.domain", "app.example.com"),
            ("snadboy.other.8080.domain", "app.example.com"),
        ]);
        assert!(parse_services(&labels).is_empty());
    }

    #[test]
    fn service_without_domain_is_invalid() {
        let labels = labels(&[("snadboy.revp.8080.backend-proto", "https")]);
        let services = parse_services(&labels);
        let service = services.get("8080").unwrap();
        assert!(!service.is_valid());
    }

    #[test]
    fn groups_multiple_ports_independently() {
        let labels = labels(&[
            ("snadboy.revp.8080.domain", "a.example.com"),
            ("snadboy.revp.9090.domain", "b.example.com"),
        ]);
        let services = parse_services(&labels);
        assert_eq!(services.len(), 2);
        assert_eq!(services["8080"].domain, "a.example.com");
        assert_eq!(services["9090"].domain, "b.example.com");
    }

    #[test]
    fn port_resolution_prefers_tcp_then_udp_then_unset() {
        let labels = labels(&[("snadboy.revp.8080.domain", "app.example.com")]);
        let mut container = Container::new(
            "abcdef123456".into(),
            "app".into(),
            "h1".into(),
            "192.0.2.10".into(),
            labels,
        );

        let mut ports = HashMap::new();
        ports.insert(
            "8080/tcp".to_string(),
            vec![PortBinding { host_ip: "0.0.0.0".into(), host_port: "32000".into() }],
        );
        container.resolve_port_mapping(&ports);
        assert_eq!(
            container.services["8080"].resolved_host_port.as_deref(),
            Some("32000")
        );
    }

    #[test]
    fn port_resolution_falls_back_to_udp() {
        let labels = labels(&[("snadboy.revp.53.domain", "dns.example.com")]);
        let mut container = Container::new(
            "abcdef123456".into(),
            "dns".into(),
            "h1".into(),
            "192.0.2.10".into(),
            labels,
        );

        let mut ports = HashMap::new();
        ports.insert(
            "53/udp".to_string(),
            vec![PortBinding { host_ip: "0.0.0.0".into(), host_port: "40053".into() }],
        );
        container.resolve_port_mapping(&ports);
        assert_eq!(
            container.services["53"].resolved_host_port.as_deref(),
            Some("40053")
        );
    }

    #[test]
    fn unresolved_port_falls_back_to_declared_port_for_dialing() {
        let labels = labels(&[("snadboy.revp.8080.domain", "app.example.com")]);
        let mut container = Container::new(
            "abcdef123456".into(),
            "app".into(),
            "h1".into(),
            "192.0.2.10".into(),
            labels,
        );
        container.resolve_port_mapping(&HashMap::new());
        assert_eq!(container.services["8080"].resolved_host_port, None);
        assert_eq!(container.services["8080"].dial_port(), "8080");
    }

    #[test]
    fn backend_url_composition() {
        let service = Service {
            container_port: "8080".into(),
            domain: "app.example.com".into(),
            backend_proto: "http".into(),
            backend_path: "/".into(),
            force_ssl: true,
            support_websocket: false,
            cloudflare_tunnel: false,
            resolved_host_port: Some("32000".into()),
        };
        assert_eq!(service.backend_url("192.0.2.10"), "http://192.0.2.10:32000/");
    }

    #[test]
    fn short_id_is_first_twelve_chars() {
        let container = Container::new(
            "abcdef1234567890".into(),
            "app".into(),
            "h1".into(),
            "192.0.2.10".into(),
            HashMap::new(),
        );
        assert_eq!(container.short_id(), "abcdef123456");
    }

    #[test]
    fn has_revp_labels_detects_port_based_keys_only() {
        assert!(Container::has_revp_labels(&labels(&[("snadboy.revp.8080.domain", "x")])));
        assert!(!Container::has_revp_labels(&labels(&[("snadboy.revp.domain", "x")])));
        assert!(!Container::has_revp_labels(&HashMap::new()));
    }
}
