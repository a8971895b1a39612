//! Remote Runtime Client: runs container-runtime queries and streams
//! container events from one or more remote hosts over authenticated
//! point-to-point transport keyed by host alias.
//!
//! Grounded on `original_source/src/docker_monitor.py`'s `docker -H
//! ssh://<alias> ...` invocations (`_monitor_host`, `_get_container_info`,
//! `_reconcile_host`). The concrete transport (`SshRuntimeClient`) lives in
//! `ssh.rs`, grounded additionally on `original_source/src/ssh_config.py`
//! for the generated-SSH-config/multiplexing approach, since no example
//! repo in the retrieval pack ships a native SSH client.

mod ssh;

pub use ssh::{ensure_ssh_config, SshRuntimeClient};

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::service::PortBinding;

/// A container as reported by a `ps`-style listing: the cheap summary used
/// by the periodic sweep to discover what's running, per spec.md §4.2.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: String,
    pub state: String,
    pub status: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Full container metadata as reported by an `inspect`-style call, per
/// spec.md §4.2: `Config.Labels`, `NetworkSettings.Ports`, `Name`.
#[derive(Debug, Clone)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub ports: HashMap<String, Vec<PortBinding>>,
}

/// One container lifecycle event from the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: EventAction,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Unpause,
    Stop,
    Pause,
    Die,
    Kill,
    Restart,
    Other,
}

impl EventAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => EventAction::Start,
            "unpause" => EventAction::Unpause,
            "stop" => EventAction::Stop,
            "pause" => EventAction::Pause,
            "die" => EventAction::Die,
            "kill" => EventAction::Kill,
            "restart" => EventAction::Restart,
            _ => EventAction::Other,
        }
    }

    /// Events that should run the container-start handler (spec.md §4.6).
    pub fn is_start_like(self) -> bool {
        matches!(self, EventAction::Start | EventAction::Unpause)
    }

    /// Events that should run the container-stop handler.
    pub fn is_stop_like(self) -> bool {
        matches!(
            self,
            EventAction::Stop | EventAction::Pause | EventAction::Die | EventAction::Kill
        )
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Executes container-runtime queries and streams events from a named
/// host, per spec.md §4.2. Each operation fails with a `Transport`-kind or
/// `Runtime`-kind `ReconcilerError`, distinguished by the implementation
/// (e.g. SSH exit 255 vs. a nonzero exit from the runtime binary itself).
#[async_trait]
pub trait RemoteRuntimeClient: Send + Sync {
    async fn list_containers(&self, alias: &str, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, alias: &str, id: &str) -> Result<Option<ContainerDetail>>;

    /// An infinite lazy stream of events; the caller is responsible for
    /// reconnecting (with backoff) when the stream ends.
    fn stream_events(&self, alias: &str) -> EventStream;
}

/// Parse the `labels` field the runtime's `ps --format` emits, which may be
/// either a single comma-separated `key=value` string or (per spec.md
/// §4.2) a native map; accept both.
pub fn parse_labels_field(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for pair in raw.split(',') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            labels.insert(key.to_string(), value.to_string());
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_action_classifies_start_and_stop_like() {
        assert!(EventAction::parse("start").is_start_like());
        assert!(EventAction::parse("unpause").is_start_like());
        assert!(EventAction::parse("stop").is_stop_like());
        assert!(EventAction::parse("die").is_stop_like());
        assert!(EventAction::parse("kill").is_stop_like());
        assert!(EventAction::parse("pause").is_stop_like());
        assert_eq!(EventAction::parse("restart"), EventAction::Restart);
        assert_eq!(EventAction::parse("unknown-thing"), EventAction::Other);
    }

    #[test]
    fn parses_comma_separated_labels_field() {
        let labels = parse_labels_field("snadboy.revp.8080.domain=app.example.com,other=x");
        assert_eq!(labels.get("snadboy.revp.8080.domain").unwrap(), "app.example.com");
        assert_eq!(labels.get("other").unwrap(), "x");
    }

    #[test]
    fn empty_labels_field_parses_empty() {
        assert!(parse_labels_field("").is_empty());
    }
}
