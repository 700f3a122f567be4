//! lva-visd: vision daemon for attention glance checks.

mod camera;
mod detector;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::detector::CentroidDetector;
use crate::server::GlanceServer;

#[derive(Parser, Debug)]
#[command(name = "lva-visd", version, about)]
struct Args {
    /// Config file path (overrides LVA_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print DEBUG messages to console.
    #[arg(long)]
    debug: bool,
}

/// The daemon reads only its own section of the shared config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct VisdConfig {
    camera_index: u32,
    burst_seconds: f64,
    frame_count: usize,
    width: u32,
    height: u32,
    log_level: String,
}

impl Default for VisdConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            burst_seconds: 0.9,
            frame_count: 5,
            width: 320,
            height: 240,
            log_level: "info".into(),
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<VisdConfig> {
    if !path.exists() {
        return Ok(VisdConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in config {}", path.display()))?;
    match value.get("visd") {
        Some(section) => serde_json::from_value(section.clone())
            .with_context(|| format!("invalid visd section in {}", path.display())),
        None => Ok(VisdConfig::default()),
    }
}

fn config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    match std::env::var("LVA_CONFIG_PATH") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
        _ => PathBuf::from("/home/user/linux-voice-assistant/config.json"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&config_path(&args))?;

    let default_level = if args.debug { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "lva-visd starting");

    let socket_path = lva_ipc::visd_socket_path();
    let (listener, mut guard) =
        lva_ipc::SocketGuard::bind(&socket_path).context("failed to bind visd socket")?;

    let server = GlanceServer::new(
        Arc::from(camera::probe(config.camera_index)),
        Arc::new(CentroidDetector::new()),
        config.burst_seconds,
        config.frame_count,
        config.width,
        config.height,
    );

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = server.run(listener) => {}
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    guard.cleanup();
    info!("lva-visd stopped");
    Ok(())
}
