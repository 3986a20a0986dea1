pub mod analytics;
pub mod db;
pub mod monitor;
pub mod notify;
pub mod reporting;
pub mod scheduler;
pub mod settings;
pub mod sources;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use db::Database;
use monitor::{CommandContext, Monitor, MonitorContext, Response};
use notify::{Dispatcher, LogNotifier, NoticeBoard};
use settings::SettingsStore;
use sources::StateRegistry;

const DEFAULT_SETTINGS_PATH: &str = "glucowatch.json";

fn settings_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GLUCOWATCH_SETTINGS").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
}

/// Wire the monitor together from a settings file.
pub fn build(settings_path: PathBuf) -> Result<(Arc<Monitor>, Arc<StateRegistry>)> {
    let settings = Arc::new(SettingsStore::new(settings_path)?);
    let database = Database::new(settings.current().database_path.clone())
        .context("Failed to open the reading database")?;

    let registry = Arc::new(StateRegistry::new());
    let dispatcher = Dispatcher::new(Arc::new(LogNotifier), Arc::new(NoticeBoard::new()));
    let ctx = MonitorContext::new(settings, database, registry.clone(), dispatcher);
    Ok((Monitor::new(Arc::new(ctx)), registry))
}

/// Serve JSON-line requests from stdin until EOF or Ctrl-C.
async fn serve(commands: CommandContext) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = commands.handle_line(&line).await;
                let encoded = serde_json::to_string(&response).unwrap_or_else(|err| {
                    let fallback = Response::Error { message: err.to_string() };
                    serde_json::to_string(&fallback).unwrap_or_default()
                });
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }
    Ok(())
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("GlucoWatch starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start async runtime: {err}");
            return;
        }
    };

    let result = runtime.block_on(async {
        let (monitor, registry) = build(settings_path())?;
        monitor.start();
        monitor.listen(registry.subscribe());
        monitor.refresh_all().await;

        let served = serve(CommandContext::new(monitor.clone(), registry)).await;
        if let Err(err) = monitor.shutdown().await {
            warn!("Shutdown incomplete: {err:#}");
        }
        served
    });

    if let Err(err) = result {
        error!("GlucoWatch stopped with an error: {err:#}");
        std::process::exit(1);
    }
}
