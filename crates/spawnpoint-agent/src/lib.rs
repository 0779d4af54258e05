//! Short-lived game server instances provisioned from uploaded archives.
//!
//! A [`LifecycleManager`] turns an archive into a running container with its
//! own ports and scratch directory, watches it through engine events, and
//! reclaims everything on every exit path.

pub mod archive;
pub mod config;
pub mod container_spec;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod log_harvest;
pub mod port_alloc;
pub mod supervisor;
pub mod workdir;

#[cfg(test)]
mod test_support;

pub use config::AgentConfig;
pub use engine::{DockerEngine, Engine, EngineError};
pub use error::{Error, Result};
pub use lifecycle::{CreateRequest, InstanceHandle, LifecycleManager, StopOutcome};
pub use log_harvest::{DirectorySink, LogDelivery, LogSink};
pub use spawnpoint_instance::{DeploymentMode, InstanceId, InstanceState, InstanceStatus};
