//! pocketlm – entry point.
//!
//! Startup order:
//! 1. Parse command-line flags and configuration from environment variables.
//! 2. Initialise structured tracing.
//! 3. Load runtime tuning from TOML when configured.
//! 4. Run the requested command against the models directory.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use pocketlm_core::{LoadPlanner, MemoryProbe, RuntimeConfig, SystemProbe};
use pocketlm_fetch::{
    CatalogCache, DownloadManager, HttpTransport, HttpTransportConfig, JsonFileCatalog,
    ModelLayout,
};
use pocketlm_types::{DownloadEvent, DownloadStatus, ModelDescriptor};
use pocketlm_utils::{LogConfig, init_tracing};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;

const GB: f64 = 1_000_000_000.0;

/// Download, inspect and plan on-device GGUF models.
#[derive(Parser)]
#[command(name = "pocketlm", version)]
struct Cli {
    /// Directory holding model files
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,
    /// JSON model catalog
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// TOML runtime tuning file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// tracing filter, e.g. `debug`
    #[arg(long, global = true)]
    log: Option<String>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the device memory reading the planner would use
    Probe,
    /// Print the effective runtime tuning as TOML
    Config,
    /// List catalog models with their local state
    List,
    /// Download (or resume) a catalog model; Ctrl-C pauses
    Download { model_id: String },
    /// Delete a model and any partial download
    Delete { model_id: String },
    /// Show the download state of every model on disk
    Status,
    /// Plan a load for a catalog model id or a GGUF path
    Plan {
        model: String,
        /// Upper bound on the context window
        #[arg(long)]
        context: Option<u32>,
    },
}

/// Everything a command may need.
struct Host {
    config: Config,
    runtime: RuntimeConfig,
    manager: DownloadManager,
    catalog: CatalogCache<JsonFileCatalog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(dir) = cli.models_dir {
        cfg.models_dir = dir;
    }
    if let Some(path) = cli.catalog {
        cfg.catalog_path = path;
    }
    if let Some(path) = cli.config {
        cfg.runtime_config = Some(path);
    }
    if let Some(level) = cli.log {
        cfg.log_level = level;
    }
    cfg.log_json |= cli.log_json;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&LogConfig {
        level: cfg.log_level.clone(),
        json: cfg.log_json,
        log_dir: cfg.log_dir.clone(),
    })
    .context("failed to initialise logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), models_dir = %cfg.models_dir.display(), "pocketlm starting");

    // ── 3. Runtime tuning ──────────────────────────────────────────────────────
    let runtime = match &cfg.runtime_config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    // ── 4. Command ─────────────────────────────────────────────────────────────
    let transport = HttpTransport::new(&HttpTransportConfig {
        proxy: cfg.proxy.clone(),
        ..Default::default()
    })
    .context("failed to build HTTP client")?;
    let manager = DownloadManager::new(ModelLayout::new(&cfg.models_dir), Arc::new(transport));
    let host = Host {
        catalog: CatalogCache::new(JsonFileCatalog::new(&cfg.catalog_path)),
        config: cfg,
        runtime,
        manager,
    };

    let result = match cli.command {
        Command::Probe => probe(),
        Command::Config => print_config(&host),
        Command::List => list(&host).await,
        Command::Download { model_id } => download(&host, &model_id).await,
        Command::Delete { model_id } => delete(&host, &model_id).await,
        Command::Status => status(&host).await,
        Command::Plan { model, context } => plan(&host, &model, context).await,
    };
    host.manager.shutdown();
    result
}

fn probe() -> anyhow::Result<()> {
    let memory = SystemProbe::default().probe();
    println!("{memory}");
    println!("{}", serde_json::to_string_pretty(&memory)?);
    Ok(())
}

fn print_config(host: &Host) -> anyhow::Result<()> {
    print!("{}", host.runtime.to_toml_string()?);
    Ok(())
}

async fn list(host: &Host) -> anyhow::Result<()> {
    host.manager
        .reconcile()
        .await
        .context("failed to scan models directory")?;
    let models = host.catalog.models().await.with_context(|| {
        format!("failed to read catalog {}", host.config.catalog_path.display())
    })?;
    let planner = LoadPlanner::new(host.runtime.planner.clone());

    for model in models.iter() {
        let state = host.manager.state(&model.id).await;
        println!(
            "{:<36} {:>7.2} GB  needs {:>5.1} GB RAM  {:<14} {}{}",
            model.id,
            model.size_bytes as f64 / GB,
            planner.required_total(model.size_bytes) as f64 / GB,
            state.status,
            if model.recommended { "★ " } else { "" },
            model.family,
        );
    }
    Ok(())
}

async fn find_model(host: &Host, model_id: &str) -> anyhow::Result<ModelDescriptor> {
    host.catalog
        .find(model_id)
        .await
        .with_context(|| format!("failed to read catalog {}", host.config.catalog_path.display()))?
        .ok_or_else(|| anyhow!("model {model_id} is not in the catalog"))
}

async fn download(host: &Host, model_id: &str) -> anyhow::Result<()> {
    let descriptor = find_model(host, model_id).await?;
    let manager = &host.manager;
    manager
        .reconcile()
        .await
        .context("failed to scan models directory")?;

    let mut events = manager.subscribe_events();
    if !manager
        .start(&descriptor)
        .await
        .with_context(|| format!("failed to start download of {model_id}"))?
    {
        let state = manager.state(model_id).await;
        if state.status == DownloadStatus::Downloaded {
            println!("{model_id} is already downloaded");
            return Ok(());
        }
        bail!("{model_id} is already being downloaded");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.pause(model_id);
                while manager.active_jobs(model_id) > 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let state = manager.state(model_id).await;
                println!("\npaused at {} bytes; run the same command to resume", state.downloaded_bytes);
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) if event.model_id() != model_id => {}
                Ok(DownloadEvent::Progress { progress, downloaded_bytes, total_bytes, .. }) => {
                    let total = total_bytes.map_or_else(|| "?".to_owned(), |t| format!("{:.2}", t as f64 / GB));
                    eprint!(
                        "\r{model_id}: {:>5.1}%  {:.2} / {total} GB",
                        progress * 100.0,
                        downloaded_bytes as f64 / GB,
                    );
                }
                Ok(DownloadEvent::Completed { .. }) => {
                    eprintln!();
                    let path = manager.path(model_id).unwrap_or_default();
                    println!("{model_id} downloaded to {}", path.display());
                    return Ok(());
                }
                Ok(DownloadEvent::Failed { message, .. }) => {
                    eprintln!();
                    bail!("download of {model_id} failed: {message}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress events dropped");
                }
                Err(RecvError::Closed) => bail!("download store closed"),
            }
        }
    }
}

async fn delete(host: &Host, model_id: &str) -> anyhow::Result<()> {
    host.manager
        .delete(model_id)
        .await
        .with_context(|| format!("failed to delete {model_id}"))?;
    println!("{model_id} deleted");
    Ok(())
}

async fn status(host: &Host) -> anyhow::Result<()> {
    let states = host
        .manager
        .reconcile()
        .await
        .context("failed to scan models directory")?;
    if states.is_empty() {
        println!("no models in {}", host.config.models_dir.display());
    }
    for state in states {
        println!("{}", serde_json::to_string(&state)?);
    }
    Ok(())
}

async fn plan(host: &Host, model: &str, context: Option<u32>) -> anyhow::Result<()> {
    let path = PathBuf::from(model);
    let model_bytes = if path.is_file() {
        tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len()
    } else {
        match host.manager.path(model) {
            Some(local) => tokio::fs::metadata(&local)
                .await
                .with_context(|| format!("failed to stat {}", local.display()))?
                .len(),
            None => find_model(host, model).await?.size_bytes,
        }
    };

    let memory = SystemProbe::default().probe();
    println!("device: {memory}");
    let planner = LoadPlanner::new(host.runtime.planner.clone());
    let load = planner
        .plan(model_bytes, &memory, context)
        .with_context(|| format!("{model} cannot be loaded on this device"))?;
    println!("{}", serde_json::to_string_pretty(&load)?);
    Ok(())
}
