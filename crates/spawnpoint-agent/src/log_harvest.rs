//! Final log collection for an instance.
//!
//! The raw server log never leaves the working directory: it is copied line
//! by line into a redacted sibling, and only that copy is handed to the
//! [`LogSink`].

use std::{
    borrow::Cow,
    fs,
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use regex::bytes::Regex;
use spawnpoint_instance::InstanceId;
use tokio::task::JoinHandle;

pub const LOGS_DIR: &str = "logs";
pub const LATEST_LOG: &str = "latest.log";
pub const FILTERED_PREFIX: &str = "filtered_";
pub const REDACTED_ADDRESS: &str = "[FILTERED_IP]";

/// `ip:port` pairs as the server prints them for connecting clients, with
/// the leading slash Java puts in front of socket addresses.
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"/?\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+").expect("valid regex")
});

pub fn redact_line(line: &[u8]) -> Cow<'_, [u8]> {
    ADDRESS_RE.replace_all(line, REDACTED_ADDRESS.as_bytes())
}

/// Copies `src` to `dst`, redacting every line. Returns how many lines were
/// changed.
pub fn redact_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = io::BufReader::new(fs::File::open(src)?);
    let mut writer = BufWriter::new(fs::File::create(dst)?);
    let mut buf = Vec::with_capacity(512);
    let mut changed = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let out = redact_line(&buf);
        if matches!(out, Cow::Owned(_)) {
            changed += 1;
        }
        writer.write_all(&out)?;
    }
    writer.flush()?;
    Ok(changed)
}

pub fn latest_log_path(workdir: &Path) -> PathBuf {
    workdir.join(LOGS_DIR).join(LATEST_LOG)
}

pub fn filtered_log_path(workdir: &Path) -> PathBuf {
    workdir
        .join(LOGS_DIR)
        .join(format!("{FILTERED_PREFIX}{LATEST_LOG}"))
}

/// One redacted log artifact handed to a sink.
#[derive(Debug, Clone)]
pub struct LogDelivery {
    pub instance_id: InstanceId,
    pub instance_name: String,
    pub caption: String,
    /// Deleted once `deliver` returns; sinks must copy what they keep.
    pub path: PathBuf,
}

/// Destination for harvested logs.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn deliver(&self, delivery: &LogDelivery) -> anyhow::Result<()>;
}

/// Copies artifacts into a local directory as `<instance-name>.log`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait::async_trait]
impl LogSink for DirectorySink {
    async fn deliver(&self, delivery: &LogDelivery) -> anyhow::Result<()> {
        use anyhow::Context;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))?;
        let target = self.dir.join(format!("{}.log", delivery.instance_name));
        tokio::fs::copy(&delivery.path, &target)
            .await
            .with_context(|| format!("copy log to {}", target.display()))?;
        tracing::info!(
            instance = %delivery.instance_name,
            path = %target.display(),
            "{}",
            delivery.caption
        );
        Ok(())
    }
}

/// Redacts the instance's latest log and ships it to `sink` on a spawned
/// task. Returns the delivery task, or `None` when there was nothing to send.
pub async fn harvest(
    workdir: &Path,
    instance_id: InstanceId,
    instance_name: &str,
    sink: Arc<dyn LogSink>,
) -> Option<JoinHandle<()>> {
    let raw = latest_log_path(workdir);
    let filtered = filtered_log_path(workdir);

    let redacted = {
        let (raw, filtered) = (raw.clone(), filtered.clone());
        tokio::task::spawn_blocking(move || -> io::Result<u64> {
            if !raw.is_file() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no latest.log"));
            }
            redact_file(&raw, &filtered)
        })
        .await
    };

    match redacted {
        Ok(Ok(changed)) => {
            tracing::debug!(instance = %instance_name, redacted_lines = changed, "log redacted");
        }
        Ok(Err(e)) => {
            tracing::warn!(
                instance = %instance_name,
                path = %raw.display(),
                error = %e,
                "log file missing or unreadable; skipping harvest"
            );
            remove_artifact(&filtered).await;
            return None;
        }
        Err(e) => {
            tracing::warn!(instance = %instance_name, error = %e, "log redaction task failed");
            remove_artifact(&filtered).await;
            return None;
        }
    }

    let delivery = LogDelivery {
        instance_id,
        instance_name: instance_name.to_string(),
        caption: format!("Server logs for {instance_name} (id {instance_id})"),
        path: filtered,
    };
    Some(tokio::spawn(async move {
        match sink.deliver(&delivery).await {
            Ok(()) => {
                tracing::info!(instance = %delivery.instance_name, "server logs delivered");
            }
            Err(e) => {
                tracing::error!(
                    instance = %delivery.instance_name,
                    error = %format!("{e:#}"),
                    "failed to deliver server logs"
                );
            }
        }
        remove_artifact(&delivery.path).await;
    }))
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "filtered log removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove filtered log"),
    }
}
