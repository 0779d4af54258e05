//! Provisioning, supervision and teardown of server instances.
//!
//! [`LifecycleManager::create`] either returns a running instance or leaves
//! nothing behind. Teardown may be requested from several places at once (an
//! explicit stop, the exit hook, the event supervisor); the instance's
//! `active` flag decides which one does the work.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use spawnpoint_instance::{DeploymentMode, InstanceId, InstanceState, InstanceStatus};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    archive,
    config::AgentConfig,
    container_spec::{self, MemoryLimit, SpecInput},
    engine::{Engine, EngineError, EngineOp, EventAction},
    error::{Error, Result, format_error_chain},
    log_harvest::{self, LogSink},
    port_alloc::{PortAllocator, PortLease},
    supervisor::{self, Supervised, TeardownCause},
    workdir,
};

/// Runs an engine call under `limit`, turning expiry into [`EngineError::Timeout`].
pub(crate) async fn engine_call<T>(
    op: EngineOp,
    resource: &str,
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, EngineError>>,
) -> std::result::Result<T, EngineError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(EngineError::Timeout {
            op,
            resource: resource.to_string(),
            timeout: limit,
        }),
    }
}

async fn delete_workdir(dir: PathBuf) {
    let shown = dir.display().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || workdir::delete(&dir)).await {
        tracing::warn!(dir = %shown, error = %e, "working directory cleanup task failed");
    }
}

/// Parameters for [`LifecycleManager::create`].
#[derive(Clone, Default)]
pub struct CreateRequest {
    pub archive: PathBuf,
    /// Caller-chosen id; minted when absent.
    pub id: Option<InstanceId>,
    /// Only used for overlay payloads. Blank means the configured default.
    pub version: Option<String>,
    pub memory: Option<String>,
    /// Where the final log goes. Without a sink the harvest is skipped.
    pub log_sink: Option<Arc<dyn LogSink>>,
}

impl CreateRequest {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call performed the teardown.
    TornDown,
    /// Another caller already owns the teardown.
    AlreadyStopping,
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    grace: Duration,
    engine_call: Duration,
    log_delivery: Duration,
}

pub(crate) struct Instance {
    id: InstanceId,
    name: String,
    resource_id: String,
    workdir: PathBuf,
    mode: DeploymentMode,
    version: String,
    memory: MemoryLimit,
    service_port: u16,
    debug_port: u16,

    engine: Arc<dyn Engine>,
    log_sink: Option<Arc<dyn LogSink>>,
    timeouts: Timeouts,

    active: AtomicBool,
    harvested: AtomicBool,
    state: watch::Sender<InstanceState>,
    cancel: CancellationToken,
    lease: StdMutex<Option<PortLease>>,
    delivery: StdMutex<Option<JoinHandle<()>>>,
    registry: Weak<Registry>,
}

impl Instance {
    fn set_state(&self, next: InstanceState) {
        self.state.send_if_modified(|cur| {
            if cur.can_transition_to(next) {
                tracing::debug!(instance = %self.name, from = %cur, to = %next, "state change");
                *cur = next;
                true
            } else {
                false
            }
        });
    }

    fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            mode: self.mode,
            version: self.version.clone(),
            memory_limit: self.memory.quantity().to_string(),
            service_port: self.service_port,
            debug_port: self.debug_port,
        }
    }

    async fn stop(&self, cause: TeardownCause) -> StopOutcome {
        if !self.deactivate() {
            tracing::debug!(instance = %self.name, %cause, "stop ignored: already stopping");
            return StopOutcome::AlreadyStopping;
        }
        self.teardown(cause).await;
        StopOutcome::TornDown
    }

    async fn wait_terminated(&self) {
        let mut rx = self.state.subscribe();
        // Only fails if the sender is gone, and `self` holds it.
        let _ = rx.wait_for(|s| *s == InstanceState::Terminated).await;
    }

    async fn stop_and_remove(&self) {
        let t = self.timeouts;
        let stop = engine_call(
            EngineOp::Stop,
            &self.name,
            t.grace + t.engine_call,
            self.engine.stop(&self.resource_id, t.grace),
        )
        .await;
        match stop {
            Ok(()) => tracing::info!(instance = %self.name, "container stopped"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(instance = %self.name, "container already gone at stop");
            }
            Err(e) => tracing::warn!(
                instance = %self.name,
                error = %format_error_chain(&e),
                "stop failed; removing anyway"
            ),
        }

        let remove = engine_call(
            EngineOp::Remove,
            &self.name,
            t.engine_call,
            self.engine.remove(&self.resource_id),
        )
        .await;
        match remove {
            Ok(()) => tracing::info!(instance = %self.name, "container removed"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(instance = %self.name, "container already gone at remove");
            }
            Err(e) => tracing::error!(
                instance = %self.name,
                error = %format_error_chain(&e),
                "failed to remove container"
            ),
        }
    }

    async fn await_log_delivery(&self) {
        let pending = self.delivery.lock().ok().and_then(|mut d| d.take());
        let Some(handle) = pending else {
            return;
        };
        match tokio::time::timeout(self.timeouts.log_delivery, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(instance = %self.name, error = %e, "log delivery task failed");
            }
            Err(_) => tracing::warn!(
                instance = %self.name,
                timeout_secs = self.timeouts.log_delivery.as_secs(),
                "log delivery still running; removing working directory anyway"
            ),
        }
    }
}

#[async_trait::async_trait]
impl Supervised for Instance {
    fn name(&self) -> &str {
        &self.name
    }

    fn deactivate(&self) -> bool {
        self.active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn teardown(&self, cause: TeardownCause) {
        tracing::info!(instance = %self.name, %cause, "tearing down");
        self.set_state(InstanceState::Stopping);
        self.cancel.cancel();

        let inspected = engine_call(
            EngineOp::Inspect,
            &self.name,
            self.timeouts.engine_call,
            self.engine.inspect(&self.resource_id),
        )
        .await;
        let engine_knows_it = match inspected {
            Ok(health) if health.logs_readable() => {
                self.harvest_logs().await;
                true
            }
            Ok(health) => {
                tracing::warn!(instance = %self.name, %health, "skipping log harvest");
                true
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    instance = %self.name,
                    "engine no longer knows the container; skipping log harvest"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    instance = %self.name,
                    error = %format_error_chain(&e),
                    "inspect failed; skipping log harvest"
                );
                true
            }
        };

        if engine_knows_it {
            self.stop_and_remove().await;
        }

        self.await_log_delivery().await;
        delete_workdir(self.workdir.clone()).await;

        if let Some(mut lease) = self.lease.lock().ok().and_then(|mut l| l.take()) {
            lease.release();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.live.lock().await.remove(&self.id);
        }
        self.set_state(InstanceState::Terminated);
        tracing::info!(instance = %self.name, "instance terminated");
    }

    async fn harvest_logs(&self) {
        if self.harvested.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(sink) = self.log_sink.clone() else {
            tracing::warn!(instance = %self.name, "no log sink configured; skipping log harvest");
            return;
        };
        let handle = log_harvest::harvest(&self.workdir, self.id, &self.name, sink).await;
        if let (Some(handle), Ok(mut slot)) = (handle, self.delivery.lock()) {
            *slot = Some(handle);
        }
    }
}

/// A live (or formerly live) instance.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<Instance>,
}

impl InstanceHandle {
    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn assigned_service_port(&self) -> u16 {
        self.inner.service_port
    }

    pub fn assigned_debug_port(&self) -> u16 {
        self.inner.debug_port
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.workdir
    }

    pub fn mode(&self) -> DeploymentMode {
        self.inner.mode
    }

    pub fn state(&self) -> InstanceState {
        self.inner.state()
    }

    pub fn status(&self) -> InstanceStatus {
        self.inner.status()
    }

    /// Idempotent; safe to call concurrently with every other stop path.
    pub async fn stop(&self) -> StopOutcome {
        self.inner.stop(TeardownCause::Requested).await
    }

    /// Resolves once teardown has finished, whoever ran it.
    pub async fn wait_terminated(&self) {
        self.inner.wait_terminated().await
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    live: Mutex<HashMap<InstanceId, Arc<Instance>>>,
    minted: StdMutex<HashSet<InstanceId>>,
    /// Set by [`LifecycleManager::shutdown`] under the `live` lock.
    closing: AtomicBool,
}

/// Owns every instance this process has provisioned.
#[derive(Clone)]
pub struct LifecycleManager {
    config: Arc<AgentConfig>,
    engine: Arc<dyn Engine>,
    ports: PortAllocator,
    registry: Arc<Registry>,
}

impl LifecycleManager {
    pub fn new(config: AgentConfig, engine: Arc<dyn Engine>) -> Self {
        Self::with_ports(config, engine, PortAllocator::global())
    }

    pub fn with_ports(config: AgentConfig, engine: Arc<dyn Engine>, ports: PortAllocator) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            ports,
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn claim_id(&self, requested: Option<InstanceId>) -> Result<InstanceId> {
        let mut minted = self
            .registry
            .minted
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match requested {
            Some(id) => {
                if !minted.insert(id) {
                    return Err(Error::validation(
                        format!("instance id {id}"),
                        "already used by this agent",
                    ));
                }
                Ok(id)
            }
            None => loop {
                let id = InstanceId::new();
                if minted.insert(id) {
                    return Ok(id);
                }
            },
        }
    }

    /// Provisions one instance. On error, nothing created along the way
    /// survives.
    pub async fn create(&self, req: CreateRequest) -> Result<InstanceHandle> {
        let cfg = self.config.clone();

        let version = req
            .version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&cfg.default_version)
            .to_string();
        let memory = MemoryLimit::parse(req.memory.as_deref().unwrap_or(&cfg.default_memory))?;

        let archive_path = req.archive.clone();
        let bundle = tokio::task::spawn_blocking(move || archive::validate(&archive_path))
            .await
            .map_err(|e| Error::io("archive validation task", std::io::Error::other(e)))??;

        let id = self.claim_id(req.id)?;
        let name = id.resource_name(&cfg.name_prefix);
        let workdir = cfg.servers_root().join(&name);
        tracing::info!(
            instance = %name,
            archive = %bundle.source.display(),
            %version,
            memory = %memory,
            "provisioning instance"
        );

        let mode = {
            let (bundle, dir) = (bundle.clone(), workdir.clone());
            tokio::task::spawn_blocking(move || {
                workdir::create(&dir)?;
                archive::ingest(&bundle, &dir)
            })
            .await
            .map_err(|e| Error::io("archive extraction task", std::io::Error::other(e)))
            .and_then(|r| r)
        };
        let mode = match mode {
            Ok(m) => m,
            Err(e) => {
                delete_workdir(workdir).await;
                return Err(e);
            }
        };

        let lease = {
            let ports = self.ports.clone();
            let (service_start, debug_start) = (cfg.service_port_start, cfg.debug_port_start);
            tokio::task::spawn_blocking(move || ports.reserve_pair(service_start, debug_start))
                .await
                .map_err(|e| Error::io("port allocation task", std::io::Error::other(e)))
                .and_then(|r| r)
        };
        let lease = match lease {
            Ok(l) => l,
            Err(e) => {
                delete_workdir(workdir).await;
                return Err(e);
            }
        };

        let spec = container_spec::build(
            &cfg,
            &SpecInput {
                id,
                name: &name,
                workdir: &workdir,
                mode,
                version: &version,
                memory: &memory,
                service_port: lease.service(),
                debug_port: lease.debug(),
            },
        );

        let prepared = engine_call(
            EngineOp::PrepareImage,
            &spec.image,
            cfg.image_pull_timeout(),
            self.engine.prepare_image(&spec.image),
        )
        .await;
        if let Err(e) = prepared {
            delete_workdir(workdir).await;
            return Err(e.into());
        }

        let call_timeout = cfg.engine_call_timeout();
        let resource_id = match engine_call(
            EngineOp::Create,
            &name,
            call_timeout,
            self.engine.create_resource(&spec),
        )
        .await
        {
            Ok(rid) => rid,
            Err(e) => {
                // A create that timed out or failed mid-flight may still exist
                // at the engine under its name.
                if !e.is_not_found() {
                    self.rollback_resource(&name, &name).await;
                }
                delete_workdir(workdir).await;
                return Err(e.into());
            }
        };

        // Subscribe before starting so an immediate exit is still seen.
        let stream = engine_call(
            EngineOp::Subscribe,
            &name,
            call_timeout,
            self.engine
                .subscribe_events(&resource_id, &EventAction::TERMINAL),
        )
        .await;
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                self.rollback_resource(&name, &resource_id).await;
                delete_workdir(workdir).await;
                return Err(Error::EventStream {
                    resource: name,
                    reason: "could not subscribe to engine events".to_string(),
                    source: Some(e),
                });
            }
        };

        let started = engine_call(
            EngineOp::Start,
            &name,
            call_timeout,
            self.engine.start(&resource_id),
        )
        .await;
        if let Err(e) = started {
            drop(stream);
            self.rollback_resource(&name, &resource_id).await;
            delete_workdir(workdir).await;
            return Err(e.into());
        }

        let (state, _) = watch::channel(InstanceState::Provisioning);
        let instance = Arc::new(Instance {
            id,
            name: name.clone(),
            resource_id,
            workdir,
            mode,
            version,
            memory,
            service_port: lease.service(),
            debug_port: lease.debug(),
            engine: self.engine.clone(),
            log_sink: req.log_sink,
            timeouts: Timeouts {
                grace: cfg.stop_grace(),
                engine_call: call_timeout,
                log_delivery: cfg.log_delivery_timeout(),
            },
            active: AtomicBool::new(true),
            harvested: AtomicBool::new(false),
            state,
            cancel: CancellationToken::new(),
            lease: StdMutex::new(Some(lease)),
            delivery: StdMutex::new(None),
            registry: Arc::downgrade(&self.registry),
        });

        instance.set_state(InstanceState::Running);
        let closing = {
            let mut live = self.registry.live.lock().await;
            live.insert(id, instance.clone());
            self.registry.closing.load(Ordering::SeqCst)
        };
        supervisor::spawn(instance.clone(), stream, instance.cancel.clone());

        if closing {
            // Shutdown already walked the registry without this instance.
            tracing::info!(instance = %name, "shutdown in progress; stopping new instance");
            instance.stop(TeardownCause::Shutdown).await;
            return Ok(InstanceHandle { inner: instance });
        }

        tracing::info!(
            instance = %name,
            mode = %instance.mode,
            service_port = instance.service_port,
            debug_port = instance.debug_port,
            "instance running"
        );
        Ok(InstanceHandle { inner: instance })
    }

    async fn rollback_resource(&self, name: &str, resource_id: &str) {
        let res = engine_call(
            EngineOp::Remove,
            name,
            self.config.engine_call_timeout(),
            self.engine.remove(resource_id),
        )
        .await;
        match res {
            Ok(()) => tracing::info!(instance = %name, "rolled back container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::error!(
                instance = %name,
                error = %format_error_chain(&e),
                "failed to roll back container"
            ),
        }
    }

    async fn lookup(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.registry.live.lock().await.get(&id).cloned()
    }

    pub async fn get(&self, id: InstanceId) -> Option<InstanceHandle> {
        self.lookup(id).await.map(|inner| InstanceHandle { inner })
    }

    pub async fn live(&self) -> Vec<InstanceStatus> {
        let mut out: Vec<InstanceStatus> = self
            .registry
            .live
            .lock()
            .await
            .values()
            .map(|i| i.status())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stops a live instance by id; `None` if no such instance is live.
    pub async fn stop_instance(&self, id: InstanceId) -> Option<StopOutcome> {
        let instance = self.lookup(id).await?;
        Some(instance.stop(TeardownCause::Requested).await)
    }

    /// Stops every live instance concurrently and waits until each one has
    /// finished tearing down. Instances that finish provisioning afterwards
    /// are torn down before `create` returns.
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<Instance>> = {
            let live = self.registry.live.lock().await;
            self.registry.closing.store(true, Ordering::SeqCst);
            live.values().cloned().collect()
        };
        if instances.is_empty() {
            return;
        }
        tracing::info!(count = instances.len(), "stopping all instances");
        join_all(instances.into_iter().map(|i| async move {
            if i.stop(TeardownCause::Shutdown).await == StopOutcome::AlreadyStopping {
                i.wait_terminated().await;
            }
        }))
        .await;
    }

    /// Runs [`LifecycleManager::shutdown`] on Ctrl-C or SIGTERM.
    pub fn install_exit_hook(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            manager.shutdown().await;
        })
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
