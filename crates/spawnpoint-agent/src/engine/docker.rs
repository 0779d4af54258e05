use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{EventMessage, HealthStatusEnum, HostConfig, PortBinding, RestartPolicyNameEnum},
    system::EventsOptions,
};
use futures_util::{StreamExt, TryStreamExt};

use super::{
    Engine, EngineError, EngineEvent, EngineOp, EventAction, EventStream, Health, ResourceSpec,
    RestartPolicy,
};

/// [`Engine`] over the local Docker daemon. One handle serves every managed
/// server.
#[derive(Clone, Debug)]
pub struct DockerEngine {
    docker: Docker,
    pull_missing_images: bool,
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` or the platform default socket.
    pub fn connect(pull_missing_images: bool) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::api(EngineOp::Connect, "docker daemon", e))?;
        Ok(Self {
            docker,
            pull_missing_images,
        })
    }

    pub fn from_client(docker: Docker, pull_missing_images: bool) -> Self {
        Self {
            docker,
            pull_missing_images,
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_err(op: EngineOp, resource: &str, error: BollardError) -> EngineError {
    if is_not_found(&error) {
        EngineError::NotFound {
            op,
            resource: resource.to_string(),
        }
    } else {
        EngineError::api(op, resource, error)
    }
}

fn tcp_key(port: u16) -> String {
    format!("{port}/tcp")
}

pub(crate) fn container_config(spec: &ResourceSpec) -> Config<String> {
    let mut exposed_ports = HashMap::<String, HashMap<(), ()>>::new();
    let mut port_bindings = HashMap::<String, Option<Vec<PortBinding>>>::new();
    for p in &spec.ports {
        exposed_ports.insert(tcp_key(p.container_port), HashMap::new());
        port_bindings.insert(
            tcp_key(p.container_port),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(p.host_port.to_string()),
            }]),
        );
    }

    let binds = spec
        .binds
        .iter()
        .map(|b| format!("{}:{}", b.host_path.display(), b.container_path))
        .collect::<Vec<_>>();

    let restart_policy = match spec.restart {
        RestartPolicy::Never => bollard::models::RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        },
    };

    let host_config = HostConfig {
        binds: Some(binds),
        network_mode: Some("bridge".to_string()),
        port_bindings: Some(port_bindings),
        restart_policy: Some(restart_policy),
        memory: spec
            .memory_bytes
            .map(|b| i64::try_from(b).unwrap_or(i64::MAX)),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn map_health(status: Option<HealthStatusEnum>) -> Health {
    match status {
        Some(HealthStatusEnum::STARTING) => Health::Starting,
        Some(HealthStatusEnum::HEALTHY) => Health::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => Health::Unhealthy,
        _ => Health::Unknown,
    }
}

/// `since` value for an event subscription opened now. Docker replays events
/// from that second on, so nothing is lost between subscribing and the first
/// poll of the lazy stream.
fn events_since_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

fn map_event(msg: EventMessage) -> Option<EngineEvent> {
    let action = EventAction::parse(msg.action.as_deref()?)?;
    let actor = msg.actor.unwrap_or_default();
    Some(EngineEvent {
        resource_id: actor.id.unwrap_or_default(),
        action,
        attributes: actor.attributes.unwrap_or_default().into_iter().collect(),
    })
}

#[async_trait::async_trait]
impl Engine for DockerEngine {
    async fn prepare_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(EngineError::api(EngineOp::PrepareImage, image, e)),
        }
        if !self.pull_missing_images {
            return Err(EngineError::NotFound {
                op: EngineOp::PrepareImage,
                resource: image.to_string(),
            });
        }

        tracing::info!(image, "pulling missing image");
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(opts), None, None)
            .try_for_each(|_| async { Ok(()) })
            .await
            .map_err(|e| EngineError::api(EngineOp::PrepareImage, image, e))?;
        Ok(())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String, EngineError> {
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let resp = self
            .docker
            .create_container(Some(opts), container_config(spec))
            .await
            .map_err(|e| map_err(EngineOp::Create, &spec.name, e))?;
        for w in resp.warnings {
            tracing::warn!(container = %spec.name, warning = %w, "engine warning on create");
        }
        Ok(resp.id)
    }

    async fn start(&self, resource: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(resource, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(EngineOp::Start, resource, e))
    }

    async fn inspect(&self, resource: &str) -> Result<Health, EngineError> {
        let resp = self
            .docker
            .inspect_container(resource, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(EngineOp::Inspect, resource, e))?;
        let status = resp
            .state
            .and_then(|s| s.health)
            .and_then(|h| h.status);
        Ok(map_health(status))
    }

    async fn stop(&self, resource: &str, grace: Duration) -> Result<(), EngineError> {
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        match self
            .docker
            .stop_container(resource, Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(EngineOp::Stop, resource, e)),
        }
    }

    async fn remove(&self, resource: &str) -> Result<(), EngineError> {
        let opts = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(resource, Some(opts))
            .await
            .map_err(|e| map_err(EngineOp::Remove, resource, e))
    }

    async fn subscribe_events(
        &self,
        resource: &str,
        actions: &[EventAction],
    ) -> Result<EventStream, EngineError> {
        // Fail fast when the daemon is unreachable instead of handing back a
        // stream that errors on first poll.
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::api(EngineOp::Subscribe, resource, e))?;

        let mut filters = HashMap::<String, Vec<String>>::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("container".to_string(), vec![resource.to_string()]);
        filters.insert(
            "event".to_string(),
            actions.iter().map(|a| a.as_str().to_string()).collect(),
        );
        let opts = EventsOptions::<String> {
            since: Some(events_since_now()),
            filters,
            ..Default::default()
        };

        let resource = resource.to_string();
        let stream = self
            .docker
            .events(Some(opts))
            .filter_map(move |item| {
                let resource = resource.clone();
                async move {
                    match item {
                        Ok(msg) => map_event(msg).map(Ok),
                        Err(e) => Some(Err(EngineError::api(EngineOp::Subscribe, resource, e))),
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}
