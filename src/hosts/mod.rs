//! Host Registry: loads, validates, and resolves the fleet of managed hosts
//! from a YAML configuration file.
//!
//! Grounded on `original_source/src/hosts_config.py` (`HostConfig`,
//! `HostsConfig`, `verify_hostname_resolution`); validation rules and
//! regexes are carried over, Rust idiom (serde + `ReconcilerError`) replaces
//! pydantic field validators.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{ReconcilerError, Result};

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-.]*[a-zA-Z0-9])?$").unwrap())
}

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

fn alias_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

/// One entry in the managed fleet, with defaults already resolved.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostDefaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub key_file: Option<String>,
}

/// A host entry with all defaults applied — what the rest of the system
/// actually operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub alias: String,
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub key_file: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawHostsFile {
    hosts: HashMap<String, HostConfig>,
    #[serde(default)]
    defaults: Option<HostDefaults>,
}

/// The loaded, validated fleet.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: HashMap<String, ResolvedHost>,
}

impl HostRegistry {
    /// Load and validate a hosts.yml file, per spec.md §4.1.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ReconcilerError::config(format!(
                "hosts configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let raw: RawHostsFile = serde_yaml::from_str(&content)?;

        if raw.hosts.is_empty() {
            return Err(ReconcilerError::config(
                "hosts configuration must contain at least one host".to_string(),
            ));
        }

        let defaults = raw.defaults.unwrap_or_default();
        let mut hosts = HashMap::with_capacity(raw.hosts.len());
        for (alias, entry) in raw.hosts {
            if !alias_regex().is_match(&alias) {
                return Err(ReconcilerError::config(format!(
                    "host alias '{alias}' contains invalid characters"
                )));
            }
            let resolved = resolve_host(&alias, entry, &defaults)?;
            hosts.insert(alias, resolved);
        }

        validate_unique_hostnames(&hosts)?;

        Ok(Self { hosts })
    }

    /// All configured hosts, enabled or not.
    pub fn all_hosts(&self) -> Vec<&ResolvedHost> {
        self.hosts.values().collect()
    }

    /// Only hosts with `enabled: true`.
    pub fn enabled_hosts(&self) -> Vec<&ResolvedHost> {
        self.hosts.values().filter(|h| h.enabled).collect()
    }

    pub fn get(&self, alias: &str) -> Option<&ResolvedHost> {
        self.hosts.get(alias)
    }

    /// `getaddrinfo`-equivalent resolution of every enabled host. Resolution
    /// errors are surfaced in the report but never disable a host
    /// automatically (spec.md §4.1).
    pub fn verify_resolution(&self, check_dns: bool) -> HashMap<String, HostResolution> {
        let mut results = HashMap::new();
        for host in self.enabled_hosts() {
            let mut result = HostResolution {
                alias: host.alias.clone(),
                hostname: host.hostname.clone(),
                enabled: host.enabled,
                dns_resolved: false,
                ip_address: None,
                errors: Vec::new(),
                warnings: Vec::new(),
            };

            if check_dns {
                match (host.hostname.as_str(), host.port).to_socket_addrs() {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            result.ip_address = Some(addr.ip().to_string());
                            result.dns_resolved = true;
                        } else {
                            result
                                .errors
                                .push(format!("could not resolve hostname '{}'", host.hostname));
                        }
                    }
                    Err(e) => {
                        result
                            .errors
                            .push(format!("DNS resolution failed: {e}"));
                    }
                }
            }

            results.insert(host.alias.clone(), result);
        }

        warn_on_shared_ips(&mut results);
        results
    }
}

fn resolve_host(alias: &str, entry: HostConfig, defaults: &HostDefaults) -> Result<ResolvedHost> {
    let hostname = entry.hostname.trim().to_string();
    if hostname.is_empty() || hostname.len() > 253 || !hostname_regex().is_match(&hostname) {
        return Err(ReconcilerError::config(format!(
            "host '{alias}': hostname '{hostname}' is invalid"
        )));
    }

    let user = entry
        .user
        .or_else(|| defaults.user.clone())
        .unwrap_or_else(|| "revp".to_string());
    if user.len() > 32 || !username_regex().is_match(&user) {
        return Err(ReconcilerError::config(format!(
            "host '{alias}': user '{user}' is invalid"
        )));
    }

    let port = entry.port.or(defaults.port).unwrap_or(22);
    if port == 0 {
        return Err(ReconcilerError::config(format!(
            "host '{alias}': port must be between 1 and 65535"
        )));
    }

    let key_file = entry
        .key_file
        .or_else(|| defaults.key_file.clone())
        .unwrap_or_else(|| "/root/.ssh/id_revp".to_string());
    if !key_file.starts_with('/') {
        return Err(ReconcilerError::config(format!(
            "host '{alias}': key_file must be an absolute path, got '{key_file}'"
        )));
    }

    Ok(ResolvedHost {
        alias: alias.to_string(),
        hostname,
        user,
        port,
        key_file,
        description: entry.description.trim().to_string(),
        enabled: entry.enabled,
    })
}

fn validate_unique_hostnames(hosts: &HashMap<String, ResolvedHost>) -> Result<()> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut errors = Vec::new();

    for (alias, host) in hosts {
        let key = host.hostname.to_lowercase();
        if let Some(other_alias) = seen.get(&key) {
            errors.push(format!(
                "duplicate hostname '{}' found for aliases '{}' and '{}'",
                host.hostname, alias, other_alias
            ));
        } else {
            seen.insert(key, alias.clone());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ReconcilerError::config(errors.join("\n")))
    }
}

fn warn_on_shared_ips(results: &mut HashMap<String, HostResolution>) {
    let mut ip_to_aliases: HashMap<String, Vec<String>> = HashMap::new();
    for result in results.values() {
        if let Some(ip) = &result.ip_address {
            ip_to_aliases.entry(ip.clone()).or_default().push(result.alias.clone());
        }
    }

    for (ip, aliases) in ip_to_aliases {
        if aliases.len() > 1 {
            let warning = format!("multiple hosts resolve to the same address {ip}: {}", aliases.join(", "));
            for alias in &aliases {
                if let Some(result) = results.get_mut(alias) {
                    result.warnings.push(warning.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostResolution {
    pub alias: String,
    pub hostname: String,
    pub enabled: bool,
    pub dns_resolved: bool,
    pub ip_address: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_and_applies_defaults() {
        let f = write_temp(
            r#"
defaults:
  user: revp
  port: 22
  key_file: /root/.ssh/id_revp
hosts:
  h1:
    hostname: host-one.example.com
  h2:
    hostname: host-two.example.com
    user: other
    port: 2222
    key_file: /home/other/.ssh/id_revp
"#,
        );

        let registry = HostRegistry::load(f.path()).unwrap();
        let h1 = registry.get("h1").unwrap();
        assert_eq!(h1.user, "revp");
        assert_eq!(h1.port, 22);

        let h2 = registry.get("h2").unwrap();
        assert_eq!(h2.user, "other");
        assert_eq!(h2.port, 2222);
    }

    #[test]
    fn rejects_duplicate_hostnames() {
        let f = write_temp(
            r#"
hosts:
  h1:
    hostname: Same.Example.Com
    user: revp
    key_file: /root/.ssh/id_revp
  h2:
    hostname: same.example.com
    user: revp
    key_file: /root/.ssh/id_revp
"#,
        );

        let err = HostRegistry::load(f.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("h1"));
        assert!(msg.contains("h2"));
    }

    #[test]
    fn rejects_relative_key_file() {
        let f = write_temp(
            r#"
hosts:
  h1:
    hostname: host.example.com
    user: revp
    key_file: relative/path
"#,
        );

        assert!(HostRegistry::load(f.path()).is_err());
    }

    #[test]
    fn rejects_empty_hosts() {
        let f = write_temp("hosts: {}\n");
        assert!(HostRegistry::load(f.path()).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = HostRegistry::load(Path::new("/nonexistent/hosts.yml")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn disabled_hosts_excluded_from_enabled_hosts() {
        let f = write_temp(
            r#"
hosts:
  h1:
    hostname: host-one.example.com
    user: revp
    key_file: /root/.ssh/id_revp
    enabled: false
  h2:
    hostname: host-two.example.com
    user: revp
    key_file: /root/.ssh/id_revp
"#,
        );

        let registry = HostRegistry::load(f.path()).unwrap();
        assert_eq!(registry.all_hosts().len(), 2);
        assert_eq!(registry.enabled_hosts().len(), 1);
        assert_eq!(registry.enabled_hosts()[0].alias, "h2");
    }
}
