use std::{fmt, str::FromStr};

/// Identity of one provisioned instance.
///
/// Minted by the agent unless the caller brings its own. The engine-level
/// resource name is always derived from it (see [`InstanceId::resource_name`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn resource_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Shape of the uploaded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// The archive carries a ready-to-run server payload.
    FullDistribution,
    /// The archive only carries supplementary content; the runtime fetches the
    /// base distribution for the requested version.
    OverlayOnly,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullDistribution => f.write_str("full_distribution"),
            Self::OverlayOnly => f.write_str("overlay_only"),
        }
    }
}

/// Lifecycle of a provisioned instance. A handle only exists once provisioning
/// succeeded, so failed attempts never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Running,
    Stopping,
    Terminated,
}

impl InstanceState {
    /// Terminated is absorbing: nothing moves an instance out of it.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Provisioning, Running) | (Running, Stopping)
                | (Stopping, Terminated)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    pub mode: DeploymentMode,
    pub version: String,
    pub memory_limit: String,
    pub service_port: u16,
    pub debug_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_unique() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn resource_name_is_derived_from_id() {
        let id: InstanceId = "6f1c2d1e-33a4-4d8e-9a51-8f0c3b7e2a10".parse().unwrap();
        assert_eq!(
            id.resource_name("testserver-"),
            "testserver-6f1c2d1e-33a4-4d8e-9a51-8f0c3b7e2a10"
        );
        assert_eq!(id.resource_name("testserver-"), id.resource_name("testserver-"));
    }

    #[test]
    fn terminated_is_absorbing() {
        use InstanceState::*;
        for next in [Provisioning, Running, Stopping, Terminated] {
            assert!(!Terminated.can_transition_to(next));
        }
        assert!(Provisioning.can_transition_to(Running));
        assert!(!Provisioning.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Terminated));
    }

    #[test]
    fn mode_serializes_snake_case() {
        let s = serde_json::to_string(&DeploymentMode::OverlayOnly).unwrap();
        assert_eq!(s, "\"overlay_only\"");
    }
}
