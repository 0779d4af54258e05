use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use spawnpoint_agent::{
    AgentConfig, CreateRequest, DirectorySink, DockerEngine, InstanceId, LifecycleManager,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Provision one game server from a local archive and keep it running until
/// Ctrl-C, SIGTERM, or the server exiting on its own.
#[derive(Debug, Parser)]
#[command(name = "spawnpoint-agent")]
struct Args {
    /// Server archive (.zip, .tar, .tar.gz or .tgz).
    archive: PathBuf,

    /// Instance id to use instead of a freshly minted one.
    #[arg(long)]
    id: Option<InstanceId>,

    /// Server version for overlay-only archives.
    #[arg(long = "version", value_name = "TAG")]
    server_version: Option<String>,

    /// Heap size such as 2G or 512M.
    #[arg(long, value_name = "QTY")]
    memory: Option<String>,

    /// Where the redacted server log is copied at teardown.
    #[arg(long, env = "SPAWNPOINT_HARVEST_DIR", default_value = "harvested-logs")]
    harvest_dir: PathBuf,

    #[arg(long, env = "SPAWNPOINT_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    match std::env::var_os("SPAWNPOINT_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "spawnpoint-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing();

    let config = AgentConfig::load(args.config.as_deref())?;
    let engine = DockerEngine::connect(config.pull_missing_images)
        .context("connect to the docker daemon")?;
    let manager = LifecycleManager::new(config, Arc::new(engine));
    let hook = manager.install_exit_hook();

    let req = CreateRequest {
        archive: args.archive,
        id: args.id,
        version: args.server_version,
        memory: args.memory,
        log_sink: Some(Arc::new(DirectorySink::new(args.harvest_dir))),
    };
    let handle = match manager.create(req).await {
        Ok(h) => h,
        Err(e) => {
            hook.abort();
            tracing::error!(code = e.code(), "provisioning failed");
            return Err(anyhow::Error::new(e).context("provision server instance"));
        }
    };
    println!("{}", serde_json::to_string_pretty(&handle.status())?);

    handle.wait_terminated().await;
    hook.abort();

    println!("{}", serde_json::to_string_pretty(&handle.status())?);
    Ok(())
}
