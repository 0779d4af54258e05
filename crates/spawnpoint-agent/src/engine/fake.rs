use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;

use super::{
    Engine, EngineError, EngineEvent, EngineOp, EventAction, EventStream, Health, ResourceSpec,
};

type EventTx = mpsc::UnboundedSender<Result<EngineEvent, EngineError>>;

/// In-memory engine that counts calls and lets tests inject events.
#[derive(Default)]
pub(crate) struct FakeEngine {
    pub prepares: AtomicUsize,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub inspects: AtomicUsize,
    pub stops: AtomicUsize,
    pub removes: AtomicUsize,
    pub subscribes: AtomicUsize,

    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_subscribe: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
    /// The container exits as soon as it starts, emitting `die`.
    pub die_on_start: bool,
    /// Delay applied after `create_resource` has registered the resource.
    pub create_delay: Option<Duration>,
    /// Health reported by `inspect`; `None` means [`Health::Healthy`].
    pub health: Mutex<Option<Health>>,
    /// Delay applied inside `stop`, to widen race windows.
    pub stop_delay: Option<Duration>,

    pub resources: Mutex<BTreeSet<String>>,
    pub specs: Mutex<Vec<ResourceSpec>>,
    pub senders: Mutex<HashMap<String, EventTx>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn resource_exists(&self, name: &str) -> bool {
        self.resources
            .lock()
            .map(|r| r.contains(name))
            .unwrap_or(false)
    }

    pub fn last_spec(&self) -> Option<ResourceSpec> {
        self.specs.lock().ok().and_then(|s| s.last().cloned())
    }

    pub fn set_health(&self, health: Health) {
        if let Ok(mut h) = self.health.lock() {
            *h = Some(health);
        }
    }

    /// Pushes an event (or a stream failure) into the subscription for
    /// `resource`. Returns false when nobody is listening anymore.
    pub fn emit(&self, resource: &str, item: Result<EngineEvent, EngineError>) -> bool {
        let senders = self.senders.lock().unwrap();
        match senders.get(resource) {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn emit_action(&self, resource: &str, action: EventAction) -> bool {
        self.emit(
            resource,
            Ok(EngineEvent {
                resource_id: resource.to_string(),
                action,
                attributes: Default::default(),
            }),
        )
    }

    /// Drops `resource` as if someone removed it behind the agent's back.
    pub fn forget(&self, resource: &str) {
        self.resources.lock().unwrap().remove(resource);
    }

    /// Ends the subscription for `resource` without an error.
    pub fn close_stream(&self, resource: &str) {
        self.senders.lock().unwrap().remove(resource);
    }
}

#[async_trait::async_trait]
impl Engine for FakeEngine {
    async fn prepare_image(&self, _image: &str) -> Result<(), EngineError> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(EngineError::api(
                EngineOp::Create,
                spec.name.clone(),
                std::io::Error::other("create refused"),
            ));
        }
        self.resources.lock().unwrap().insert(spec.name.clone());
        self.specs.lock().unwrap().push(spec.clone());
        if let Some(d) = self.create_delay {
            tokio::time::sleep(d).await;
        }
        Ok(spec.name.clone())
    }

    async fn start(&self, resource: &str) -> Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(EngineError::api(
                EngineOp::Start,
                resource,
                std::io::Error::other("start refused"),
            ));
        }
        if self.die_on_start {
            // Lost unless somebody subscribed first.
            self.emit_action(resource, EventAction::Die);
        }
        Ok(())
    }

    async fn inspect(&self, resource: &str) -> Result<Health, EngineError> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        if !self.resource_exists(resource) {
            return Err(EngineError::NotFound {
                op: EngineOp::Inspect,
                resource: resource.to_string(),
            });
        }
        Ok(self.health.lock().unwrap().unwrap_or(Health::Healthy))
    }

    async fn stop(&self, resource: &str, _grace: Duration) -> Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.stop_delay {
            tokio::time::sleep(d).await;
        }
        if !self.resource_exists(resource) {
            return Err(EngineError::NotFound {
                op: EngineOp::Stop,
                resource: resource.to_string(),
            });
        }
        if self.fail_stop {
            return Err(EngineError::api(
                EngineOp::Stop,
                resource,
                std::io::Error::other("stop refused"),
            ));
        }
        Ok(())
    }

    async fn remove(&self, resource: &str) -> Result<(), EngineError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove {
            return Err(EngineError::api(
                EngineOp::Remove,
                resource,
                std::io::Error::other("remove refused"),
            ));
        }
        if !self.resources.lock().unwrap().remove(resource) {
            return Err(EngineError::NotFound {
                op: EngineOp::Remove,
                resource: resource.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe_events(
        &self,
        resource: &str,
        actions: &[EventAction],
    ) -> Result<EventStream, EngineError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe {
            return Err(EngineError::api(
                EngineOp::Subscribe,
                resource,
                std::io::Error::other("event endpoint unavailable"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap()
            .insert(resource.to_string(), tx);

        let wanted = actions.to_vec();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .filter(move |item| {
            let keep = match item {
                Ok(ev) => wanted.contains(&ev.action),
                Err(_) => true,
            };
            async move { keep }
        })
        .boxed();
        Ok(stream)
    }
}
