use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dropsync_core::{RemoteCfg, SyncManager, TaskConfig, TaskState};
use dropsync_remote_sftp::SftpRemote;
use std::{fs, path::Path, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dropsync", version, about = "dropsync – mirror local directories to a remote store")]
struct Cli {
    /// Path to config file (JSON / YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

fn load_tasks(path: &str) -> Result<Vec<TaskConfig>> {
    let text = fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    // Detect format by extension
    let ext = Path::new(path).extension().and_then(|s| s.to_str()).unwrap_or("");
    let tasks: Vec<TaskConfig> = match ext {
        "json" => serde_json::from_str(&text).with_context(|| format!("parse {path} as JSON"))?,
        _ => serde_yaml::from_str(&text).with_context(|| format!("parse {path} as YAML"))?,
    };
    if tasks.is_empty() {
        return Err(anyhow!("no tasks defined in {path}"));
    }
    Ok(tasks)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let tasks = load_tasks(&cli.config)?;

    let mut manager = SyncManager::new();
    for cfg in tasks {
        match &cfg.remote_cfg {
            RemoteCfg::Sftp {
                host,
                user,
                password,
                fingerprints,
            } => {
                let remote = SftpRemote::connect(
                    host,
                    user,
                    password.as_deref(),
                    fingerprints.clone(),
                    &cfg.remote,
                )
                .await
                .with_context(|| format!("task {}", cfg.name))?;
                manager.start(cfg, Arc::new(remote));
            }
        }
    }

    info!("dropsync running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("stopping");
    for (id, state) in manager.states() {
        if let TaskState::Error(msg) = state {
            error!(%id, "task ended with error: {msg}");
        }
    }
    manager.shutdown().await;
    Ok(())
}
