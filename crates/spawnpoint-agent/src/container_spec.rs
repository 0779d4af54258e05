use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::LazyLock,
};

use regex::Regex;
use spawnpoint_instance::{DeploymentMode, InstanceId};

use crate::{
    archive::SERVER_JAR,
    config::AgentConfig,
    engine::{BindMount, PortMapping, ResourceSpec, RestartPolicy},
    error::{Error, Result},
};

pub const LABEL_INSTANCE: &str = "spawnpoint.instance";
pub const LABEL_MANAGED_BY: &str = "spawnpoint.managed-by";

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)^(\d+)([KMG]?)$").expect("valid regex")
});

/// A JVM-style memory quantity such as `2G` or `512M`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLimit {
    quantity: String,
    bytes: u64,
}

impl MemoryLimit {
    /// Bare digits are read as MiB.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = |why: &str| Error::validation(format!("memory limit {trimmed:?}"), why);

        let caps = MEMORY_RE
            .captures(trimmed)
            .ok_or_else(|| invalid("expected <digits>[K|M|G], e.g. 2G or 512M"))?;
        let amount = caps[1]
            .parse::<u64>()
            .map_err(|_| invalid("amount is too large"))?;
        if amount == 0 {
            return Err(invalid("must be greater than zero"));
        }
        let unit = match caps[2].to_ascii_uppercase().as_str() {
            "K" => 'K',
            "G" => 'G',
            _ => 'M',
        };
        let shift = match unit {
            'K' => 10,
            'M' => 20,
            _ => 30,
        };
        let bytes = amount
            .checked_mul(1u64 << shift)
            .ok_or_else(|| invalid("amount is too large"))?;

        Ok(Self {
            quantity: format!("{amount}{unit}"),
            bytes,
        })
    }

    pub fn quantity(&self) -> &str {
        &self.quantity
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Container hard limit: the heap plus `headroom_percent` for everything
    /// the JVM keeps off-heap.
    pub fn with_headroom(&self, headroom_percent: u32) -> u64 {
        let total = u128::from(self.bytes) * (100 + u128::from(headroom_percent)) / 100;
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quantity)
    }
}

pub fn container_env(
    cfg: &AgentConfig,
    mode: DeploymentMode,
    version: &str,
    memory: &MemoryLimit,
) -> Vec<String> {
    let mut env = vec![
        "EULA=TRUE".to_string(),
        format!("MEMORY={memory}"),
        format!(
            "JVM_OPTS=-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=*:{}",
            cfg.internal_debug_port
        ),
    ];
    match mode {
        DeploymentMode::FullDistribution => {
            env.push("TYPE=CUSTOM".to_string());
            env.push(format!(
                "CUSTOM_SERVER={}/{SERVER_JAR}",
                cfg.internal_data_path.trim_end_matches('/')
            ));
        }
        DeploymentMode::OverlayOnly => {
            env.push("TYPE=PAPER".to_string());
            env.push(format!("VERSION={version}"));
        }
    }
    env.extend(cfg.extra_env.iter().cloned());
    env
}

/// Everything needed to build the engine-level resource for one instance.
pub struct SpecInput<'a> {
    pub id: InstanceId,
    pub name: &'a str,
    pub workdir: &'a Path,
    pub mode: DeploymentMode,
    pub version: &'a str,
    pub memory: &'a MemoryLimit,
    pub service_port: u16,
    pub debug_port: u16,
}

pub fn build(cfg: &AgentConfig, input: &SpecInput<'_>) -> ResourceSpec {
    ResourceSpec {
        name: input.name.to_string(),
        image: cfg.image.clone(),
        env: container_env(cfg, input.mode, input.version, input.memory),
        binds: vec![BindMount {
            host_path: input.workdir.to_path_buf(),
            container_path: cfg.internal_data_path.clone(),
        }],
        ports: vec![
            PortMapping {
                host_port: input.service_port,
                container_port: cfg.internal_service_port,
            },
            PortMapping {
                host_port: input.debug_port,
                container_port: cfg.internal_debug_port,
            },
        ],
        restart: RestartPolicy::Never,
        memory_bytes: Some(input.memory.with_headroom(cfg.memory_headroom_percent)),
        labels: BTreeMap::from([
            (LABEL_INSTANCE.to_string(), input.id.to_string()),
            (LABEL_MANAGED_BY.to_string(), env!("CARGO_PKG_NAME").to_string()),
        ]),
    }
}
