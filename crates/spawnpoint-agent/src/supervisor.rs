//! Watches one instance's engine events and tears it down when the engine
//! reports it gone outside the explicit stop path.

use std::{fmt, sync::Arc};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{EventAction, EventStream},
    error::format_error_chain,
};

/// Why an instance is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    Requested,
    Shutdown,
    EngineEvent(EventAction),
    EventStreamFailed,
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::Shutdown => f.write_str("agent shutdown"),
            Self::EngineEvent(a) => write!(f, "engine reported {a}"),
            Self::EventStreamFailed => f.write_str("event stream failed"),
        }
    }
}

/// What the supervisor needs from an instance.
#[async_trait::async_trait]
pub(crate) trait Supervised: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Flips `active` true→false; true only for the caller that flipped it.
    fn deactivate(&self) -> bool;

    async fn teardown(&self, cause: TeardownCause);

    async fn harvest_logs(&self);
}

pub(crate) fn spawn(
    target: Arc<dyn Supervised>,
    stream: EventStream,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(target, stream, cancel))
}

async fn run(target: Arc<dyn Supervised>, mut stream: EventStream, cancel: CancellationToken) {
    let name = target.name().to_string();
    tracing::debug!(instance = %name, "supervising engine events");

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(instance = %name, "supervision cancelled");
                return;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                if !EventAction::TERMINAL.contains(&event.action) {
                    continue;
                }
                tracing::info!(
                    instance = %name,
                    action = %event.action,
                    attributes = ?event.attributes,
                    "engine reported instance termination"
                );
                if target.deactivate() {
                    drop(stream);
                    target.teardown(TeardownCause::EngineEvent(event.action)).await;
                } else {
                    tracing::debug!(instance = %name, "teardown already in progress");
                }
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    instance = %name,
                    error = %format_error_chain(&e),
                    "event stream failed; forcing teardown"
                );
                if target.deactivate() {
                    drop(stream);
                    target.teardown(TeardownCause::EventStreamFailed).await;
                }
                return;
            }
            None => {
                // The instance may still be alive; only an explicit stop or
                // shutdown tears it down from here on.
                tracing::info!(instance = %name, "event stream closed");
                target.harvest_logs().await;
                return;
            }
        }
    }
}
