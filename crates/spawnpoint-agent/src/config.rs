use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_IMAGE: &str = "itzg/minecraft-server";
pub const DEFAULT_VERSION: &str = "LATEST";
pub const DEFAULT_MEMORY: &str = "2G";

/// Agent-wide settings.
///
/// Sources, later wins: built-in defaults, an optional TOML file, then
/// `SPAWNPOINT_*` environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub scratch_root: PathBuf,
    pub namespace: String,
    pub name_prefix: String,

    pub image: String,
    pub default_version: String,
    pub default_memory: String,
    /// Extra room on top of the JVM heap for the container's hard limit.
    pub memory_headroom_percent: u32,

    pub service_port_start: u16,
    pub debug_port_start: u16,
    pub internal_service_port: u16,
    pub internal_debug_port: u16,
    pub internal_data_path: String,

    pub stop_grace_secs: u64,
    pub engine_call_timeout_secs: u64,
    /// Bound for fetching a missing image, separate from the per-call timeout.
    pub image_pull_timeout_secs: u64,
    pub log_delivery_timeout_secs: u64,

    /// Appended verbatim to the container environment, `KEY=VALUE` each.
    pub extra_env: Vec<String>,
    pub pull_missing_images: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            namespace: "servers".to_string(),
            name_prefix: "testserver-".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            default_version: DEFAULT_VERSION.to_string(),
            default_memory: DEFAULT_MEMORY.to_string(),
            memory_headroom_percent: 25,
            service_port_start: 25565,
            debug_port_start: 1025,
            internal_service_port: 25565,
            internal_debug_port: 5005,
            internal_data_path: "/data".to_string(),
            stop_grace_secs: 30,
            engine_call_timeout_secs: 45,
            image_pull_timeout_secs: 900,
            log_delivery_timeout_secs: 60,
            extra_env: Vec::new(),
            pull_missing_images: true,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    env_str(name)
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|p| *p != 0)
}

fn env_bool(name: &str) -> Option<bool> {
    match env_str(name)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AgentConfig {
    /// Reads `path` when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_str("SPAWNPOINT_SCRATCH_ROOT") {
            self.scratch_root = PathBuf::from(v);
        }
        if let Some(v) = env_str("SPAWNPOINT_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = env_str("SPAWNPOINT_NAME_PREFIX") {
            self.name_prefix = v;
        }
        if let Some(v) = env_str("SPAWNPOINT_IMAGE") {
            self.image = v;
        }
        if let Some(v) = env_str("SPAWNPOINT_DEFAULT_VERSION") {
            self.default_version = v;
        }
        if let Some(v) = env_str("SPAWNPOINT_DEFAULT_MEMORY") {
            self.default_memory = v;
        }
        if let Some(v) = env_u64("SPAWNPOINT_MEMORY_HEADROOM_PERCENT") {
            self.memory_headroom_percent = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = env_u16("SPAWNPOINT_SERVICE_PORT_START") {
            self.service_port_start = v;
        }
        if let Some(v) = env_u16("SPAWNPOINT_DEBUG_PORT_START") {
            self.debug_port_start = v;
        }
        if let Some(v) = env_u64("SPAWNPOINT_STOP_GRACE_SECS") {
            self.stop_grace_secs = v;
        }
        if let Some(v) = env_u64("SPAWNPOINT_ENGINE_CALL_TIMEOUT_SECS") {
            self.engine_call_timeout_secs = v;
        }
        if let Some(v) = env_u64("SPAWNPOINT_IMAGE_PULL_TIMEOUT_SECS") {
            self.image_pull_timeout_secs = v;
        }
        if let Some(v) = env_u64("SPAWNPOINT_LOG_DELIVERY_TIMEOUT_SECS") {
            self.log_delivery_timeout_secs = v;
        }
        if let Some(v) = env_bool("SPAWNPOINT_PULL_MISSING_IMAGES") {
            self.pull_missing_images = v;
        }
    }

    fn sanitize(&mut self) {
        self.memory_headroom_percent = self.memory_headroom_percent.min(400);
        self.stop_grace_secs = self.stop_grace_secs.clamp(1, 600);
        self.engine_call_timeout_secs = self.engine_call_timeout_secs.clamp(1, 600);
        self.image_pull_timeout_secs = self.image_pull_timeout_secs.clamp(1, 7200);
        self.log_delivery_timeout_secs = self.log_delivery_timeout_secs.clamp(1, 3600);
        self.service_port_start = self.service_port_start.max(1);
        self.debug_port_start = self.debug_port_start.max(1);
        if self.namespace.trim().is_empty() {
            self.namespace = "servers".to_string();
        }
    }

    /// `<scratch_root>/<namespace>`, the parent of every working directory.
    pub fn servers_root(&self) -> PathBuf {
        self.scratch_root.join(&self.namespace)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn engine_call_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_call_timeout_secs)
    }

    pub fn image_pull_timeout(&self) -> Duration {
        Duration::from_secs(self.image_pull_timeout_secs)
    }

    pub fn log_delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.log_delivery_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_server_image_conventions() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.image, "itzg/minecraft-server");
        assert_eq!(cfg.service_port_start, 25565);
        assert_eq!(cfg.debug_port_start, 1025);
        assert_eq!(cfg.internal_debug_port, 5005);
        assert_eq!(cfg.servers_root(), std::env::temp_dir().join("servers"));
        assert_eq!(cfg.stop_grace(), Duration::from_secs(30));
        assert!(cfg.image_pull_timeout() > cfg.engine_call_timeout());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = AgentConfig::from_toml(
            r#"
            namespace = "ci-servers"
            stop_grace_secs = 5
            extra_env = ["ONLINE_MODE=FALSE"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.namespace, "ci-servers");
        assert_eq!(cfg.stop_grace_secs, 5);
        assert_eq!(cfg.extra_env, vec!["ONLINE_MODE=FALSE".to_string()]);
        assert_eq!(cfg.name_prefix, "testserver-");
        assert!(cfg.pull_missing_images);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(AgentConfig::from_toml("stop_grace = 5").is_err());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut cfg = AgentConfig {
            stop_grace_secs: 0,
            engine_call_timeout_secs: 100_000,
            namespace: "  ".to_string(),
            ..AgentConfig::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.stop_grace_secs, 1);
        assert_eq!(cfg.engine_call_timeout_secs, 600);
        assert_eq!(cfg.namespace, "servers");
    }
}
