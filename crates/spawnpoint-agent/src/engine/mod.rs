//! Vendor-neutral view of the container engine.
//!
//! Orchestration only ever talks to [`Engine`]; the Docker binding lives in
//! [`docker`] and tests swap in a call-counting fake.

use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use futures_util::stream::BoxStream;

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Connect,
    PrepareImage,
    Create,
    Start,
    Inspect,
    Stop,
    Remove,
    Subscribe,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::PrepareImage => "prepare image",
            Self::Create => "create",
            Self::Start => "start",
            Self::Inspect => "inspect",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Subscribe => "subscribe",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{op} {resource}: no such resource")]
    NotFound { op: EngineOp, resource: String },

    #[error("{op} {resource}: timed out after {}s", timeout.as_secs())]
    Timeout {
        op: EngineOp,
        resource: String,
        timeout: Duration,
    },

    #[error("{op} {resource} failed")]
    Api {
        op: EngineOp,
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    pub fn api(
        op: EngineOp,
        resource: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Api {
            op,
            resource: resource.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Container-side health as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
    /// No health check configured, or the engine did not say.
    Unknown,
}

impl Health {
    /// Whether the server settled enough for its log file to be worth reading.
    pub fn logs_readable(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Engine lifecycle actions the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Stop,
    Die,
    Kill,
    Destroy,
}

impl EventAction {
    pub const TERMINAL: [EventAction; 4] = [Self::Stop, Self::Die, Self::Kill, Self::Destroy];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Destroy => "destroy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        // Docker also emits compound actions such as "exec_die".
        match raw.trim() {
            "stop" => Some(Self::Stop),
            "die" => Some(Self::Die),
            "kill" => Some(Self::Kill),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub resource_id: String,
    pub action: EventAction,
    /// Free-form attributes (exit code, signal, ...) when the engine sends them.
    pub attributes: BTreeMap<String, String>,
}

pub type EventStream = BoxStream<'static, Result<EngineEvent, EngineError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Failures stay visible instead of being silently retried.
    #[default]
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub binds: Vec<BindMount>,
    pub ports: Vec<PortMapping>,
    pub restart: RestartPolicy,
    pub memory_bytes: Option<u64>,
    pub labels: BTreeMap<String, String>,
}

#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Makes `image` available for [`Engine::create_resource`]. May take much
    /// longer than any other call.
    async fn prepare_image(&self, _image: &str) -> Result<(), EngineError> {
        Ok(())
    }

    /// Creates the resource and returns the engine-assigned id.
    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String, EngineError>;

    async fn start(&self, resource: &str) -> Result<(), EngineError>;

    async fn inspect(&self, resource: &str) -> Result<Health, EngineError>;

    async fn stop(&self, resource: &str, grace: Duration) -> Result<(), EngineError>;

    async fn remove(&self, resource: &str) -> Result<(), EngineError>;

    async fn subscribe_events(
        &self,
        resource: &str,
        actions: &[EventAction],
    ) -> Result<EventStream, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_terminal_actions_parse() {
        assert_eq!(EventAction::parse("die"), Some(EventAction::Die));
        assert_eq!(EventAction::parse(" destroy "), Some(EventAction::Destroy));
        assert_eq!(EventAction::parse("exec_die"), None);
        assert_eq!(EventAction::parse("start"), None);
    }

    #[test]
    fn connection_failures_name_the_connect_step() {
        let err = EngineError::api(
            EngineOp::Connect,
            "docker daemon",
            std::io::Error::other("no socket"),
        );
        assert_eq!(err.to_string(), "connect docker daemon failed");
    }

    #[test]
    fn logs_are_read_only_in_settled_health() {
        assert!(Health::Healthy.logs_readable());
        assert!(!Health::Unhealthy.logs_readable());
        assert!(!Health::Starting.logs_readable());
        assert!(!Health::Unknown.logs_readable());
    }
}
