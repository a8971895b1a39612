//! SSH-multiplexed transport: generates the managed section of the local
//! SSH client config and shells `docker -H ssh://<alias> ...` to talk to
//! each host's container runtime, relying on OpenSSH's own
//! `ControlMaster`/`ControlPersist` connection multiplexing for reuse and
//! keepalive rather than a dedicated connection pool.
//!
//! Grounded on `original_source/src/ssh_config.py` (`_generate_ssh_config`,
//! `_write_ssh_config`) and `original_source/src/docker_monitor.py`
//! (`_monitor_host`, `_get_container_info`, `_reconcile_host`). One
//! deliberate simplification versus the original: the hosts.yml alias is
//! used directly as the SSH `Host` stanza name, since `HostRegistry`
//! already enforces alias uniqueness — the original derives a separate
//! `docker-<hostname>-<port>` alias, which is redundant once the YAML key
//! itself is the contract.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ReconcilerError, Result};
use crate::hosts::HostRegistry;
use crate::service::PortBinding;

use super::{ContainerDetail, ContainerSummary, Event, EventAction, EventStream, RemoteRuntimeClient};

const BEGIN_MARKER: &str = "# BEGIN REVP MANAGED HOSTS";
const END_MARKER: &str = "# END REVP MANAGED HOSTS";

/// Regenerate the managed section of the SSH client config at
/// `ssh_config_path`, replacing any section between the sentinel markers
/// while preserving everything else in the file, per spec.md §4.2's SSH
/// transport mechanics.
pub fn ensure_ssh_config(ssh_config_path: &Path, registry: &HostRegistry) -> Result<()> {
    if let Some(parent) = ssh_config_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    let existing = std::fs::read_to_string(ssh_config_path).unwrap_or_default();
    let preserved = strip_managed_section(&existing);

    let mut managed = String::new();
    managed.push_str(BEGIN_MARKER);
    managed.push('\n');
    for host in registry.all_hosts() {
        managed.push_str(&format!("# {}\n", host.description));
        managed.push_str(&format!("Host {}\n", host.alias));
        managed.push_str(&format!("    HostName {}\n", host.hostname));
        managed.push_str(&format!("    User {}\n", host.user));
        managed.push_str(&format!("    Port {}\n", host.port));
        managed.push_str(&format!("    IdentityFile {}\n", host.key_file));
        managed.push_str("    PasswordAuthentication no\n");
        managed.push_str("    StrictHostKeyChecking accept-new\n");
        managed.push_str("    ServerAliveInterval 60\n");
        managed.push_str("    ServerAliveCountMax 3\n");
        managed.push_str("    ControlMaster auto\n");
        managed.push_str("    ControlPath ~/.ssh/control-%r@%h:%p\n");
        managed.push_str("    ControlPersist 10m\n");
        managed.push('\n');
    }
    managed.push_str(END_MARKER);
    managed.push('\n');

    let mut content = preserved;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&managed);

    std::fs::write(ssh_config_path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(ssh_config_path, std::fs::Permissions::from_mode(0o644))?;
    }

    Ok(())
}

fn strip_managed_section(content: &str) -> String {
    let mut out = String::new();
    let mut in_managed = false;
    for line in content.lines() {
        if line.trim() == BEGIN_MARKER {
            in_managed = true;
            continue;
        }
        if line.trim() == END_MARKER {
            in_managed = false;
            continue;
        }
        if !in_managed {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Shells `docker` against `ssh://<alias>`, relying on the generated SSH
/// config's multiplexed connections. `docker_bin` defaults to `"docker"`
/// but is overridable for tests.
#[derive(Debug, Clone)]
pub struct SshRuntimeClient {
    docker_bin: String,
}

impl SshRuntimeClient {
    pub fn new() -> Self {
        Self { docker_bin: "docker".to_string() }
    }

    #[cfg(test)]
    pub fn with_binary(docker_bin: impl Into<String>) -> Self {
        Self { docker_bin: docker_bin.into() }
    }

    fn docker_host(alias: &str) -> String {
        format!("ssh://{alias}")
    }

    async fn run_docker(&self, alias: &str, args: &[&str]) -> Result<std::process::Output> {
        let host = Self::docker_host(alias);
        let output = Command::new(&self.docker_bin)
            .arg("-H")
            .arg(&host)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ReconcilerError::transport(format!("failed to spawn docker for {alias}: {e}")))?;
        Ok(output)
    }
}

impl Default for SshRuntimeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

#[async_trait]
impl RemoteRuntimeClient for SshRuntimeClient {
    async fn list_containers(&self, alias: &str, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps", "--format", "{{json .}}"];
        if all {
            args.push("--all");
        }
        let output = self.run_docker(alias, &args).await?;

        if !output.status.success() {
            return Err(ReconcilerError::runtime(format!(
                "docker ps failed on host '{alias}': {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: PsLine = serde_json::from_str(line).map_err(|e| {
                ReconcilerError::runtime(format!("could not parse docker ps output on '{alias}': {e}"))
            })?;
            containers.push(ContainerSummary {
                id: parsed.id,
                names: parsed.names,
                state: parsed.state,
                status: parsed.status,
                image: parsed.image,
                labels: super::parse_labels_field(&parsed.labels),
            });
        }
        Ok(containers)
    }

    async fn inspect_container(&self, alias: &str, id: &str) -> Result<Option<ContainerDetail>> {
        let output = self.run_docker(alias, &["inspect", id]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") {
                return Ok(None);
            }
            return Err(ReconcilerError::runtime(format!(
                "docker inspect failed on host '{alias}' for '{id}': {stderr}"
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Vec<Value> = serde_json::from_str(&stdout).map_err(|e| {
            ReconcilerError::runtime(format!("could not parse docker inspect output on '{alias}': {e}"))
        })?;

        let entry = match parsed.into_iter().next() {
            Some(v) => v,
            None => return Ok(None),
        };

        let detail_id = entry
            .get("Id")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        let name = entry
            .get("Name")
            .and_then(Value::as_str)
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let labels: HashMap<String, String> = entry
            .get("Config")
            .and_then(|c| c.get("Labels"))
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let mut ports: HashMap<String, Vec<PortBinding>> = HashMap::new();
        if let Some(port_map) = entry
            .get("NetworkSettings")
            .and_then(|ns| ns.get("Ports"))
            .and_then(Value::as_object)
        {
            for (key, bindings) in port_map {
                let Some(array) = bindings.as_array() else { continue };
                let parsed_bindings: Vec<PortBinding> = array
                    .iter()
                    .filter_map(|b| {
                        let host_ip = b.get("HostIp")?.as_str()?.to_string();
                        let host_port = b.get("HostPort")?.as_str()?.to_string();
                        Some(PortBinding { host_ip, host_port })
                    })
                    .collect();
                if !parsed_bindings.is_empty() {
                    ports.insert(key.clone(), parsed_bindings);
                }
            }
        }

        Ok(Some(ContainerDetail { id: detail_id, name, labels, ports }))
    }

    fn stream_events(&self, alias: &str) -> EventStream {
        let docker_bin = self.docker_bin.clone();
        let alias = alias.to_string();

        let s = stream! {
            let host = Self::docker_host(&alias);
            let mut child = match Command::new(&docker_bin)
                .arg("-H")
                .arg(&host)
                .args(["events", "--filter", "type=container", "--format", "{{json .}}"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    yield Err(ReconcilerError::transport(format!(
                        "failed to spawn docker events for '{alias}': {e}"
                    )));
                    return;
                }
            };

            let stdout = match child.stdout.take() {
                Some(s) => s,
                None => {
                    yield Err(ReconcilerError::transport(format!(
                        "no stdout pipe for docker events on '{alias}'"
                    )));
                    return;
                }
            };

            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(v) => {
                                let action = v.get("Action").and_then(Value::as_str).unwrap_or("");
                                let id = v
                                    .get("Actor")
                                    .and_then(|a| a.get("ID"))
                                    .and_then(Value::as_str)
                                    .or_else(|| v.get("id").and_then(Value::as_str))
                                    .unwrap_or("")
                                    .to_string();
                                if id.is_empty() {
                                    continue;
                                }
                                yield Ok(Event { action: EventAction::parse(action), id });
                            }
                            Err(e) => {
                                debug!(alias = %alias, error = %e, "skipping unparseable docker event line");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(alias = %alias, "docker events stream ended");
                        break;
                    }
                    Err(e) => {
                        yield Err(ReconcilerError::transport(format!(
                            "docker events stream error on '{alias}': {e}"
                        )));
                        break;
                    }
                }
            }

            let _ = child.wait().await;
        };

        let pinned: Pin<Box<dyn Stream<Item = Result<Event>> + Send>> = Box::pin(s);
        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_existing_managed_section_only() {
        let content = format!(
            "Host other\n    HostName x\n\n{BEGIN_MARKER}\nHost stale\n    HostName y\n{END_MARKER}\n"
        );
        let stripped = strip_managed_section(&content);
        assert!(stripped.contains("Host other"));
        assert!(!stripped.contains("Host stale"));
    }

    #[test]
    fn strip_is_noop_without_markers() {
        let content = "Host other\n    HostName x\n";
        assert_eq!(strip_managed_section(content), content);
    }

    #[test]
    fn docker_host_formats_ssh_uri() {
        assert_eq!(SshRuntimeClient::docker_host("h1"), "ssh://h1");
    }
}
