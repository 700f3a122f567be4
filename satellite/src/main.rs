//! lva-satellite: voice assistant satellite core.
//!
//! Owns the audio capture loop, wake-word scoring, the activation state
//! machine, the hub session, the preferences store, and the local control
//! socket. The vision and front-panel daemons are separate processes talking
//! to this one over the UNIX-socket bus.

mod audio;
mod config;
mod distance;
mod events;
mod hub;
mod ipc;
mod metrics;
mod preferences;
mod state;
mod vision;
mod wake;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::{AudioCapture, BlockQueue, Player, RingBuffer};
use crate::config::RuntimeConfig;
use crate::metrics::Metrics;
use crate::state::{Driver, SessionState, VISION_REQUEST_TIMEOUT};

#[derive(Parser, Debug)]
#[command(name = "lva-satellite", version, about)]
struct Args {
    /// Config file path (overrides LVA_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the device name from the config file.
    #[arg(long)]
    name: Option<String>,

    /// List audio input devices and exit.
    #[arg(long)]
    list_input_devices: bool,

    /// Print DEBUG messages to console.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_input_devices {
        println!("Input devices");
        println!("=============");
        for (index, name) in audio::list_input_devices()?.iter().enumerate() {
            println!("[{index}] {name}");
        }
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let app_config = config::load(&config_path)?;
    let core = app_config.core.clone();

    let default_level = if args.debug { "debug" } else { core.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "lva-satellite starting"
    );

    // Preferences: startup failure to read an existing file is fatal; an
    // unwritable preferences path will surface on the first save.
    let prefs_path = app_config.preferences_path(&config_path);
    let prefs = preferences::Preferences::load(&prefs_path)?;
    prefs
        .save(&prefs_path)
        .context("preferences file is not writable")?;

    let runtime = Arc::new(RuntimeConfig::from_startup(&core, &prefs));
    info!(
        wake_word = runtime.wake_word_detection,
        distance = runtime.distance_activation,
        vision = runtime.vision_enabled,
        attention = runtime.attention_required,
        "trigger config"
    );

    let metrics = Metrics::new();
    let (events_tx, events_rx) = mpsc::channel(256);
    let (cfg_tx, cfg_rx) = watch::channel(Arc::clone(&runtime));
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);

    // Audio fan-out: scorer queue, recent-window ring, and the streaming
    // broadcast the hub session subscribes to.
    let scorer_queue = BlockQueue::new(32, Arc::clone(&metrics));
    let ring = RingBuffer::new(
        runtime.engaged_vad_window.as_secs_f64() + 2.0,
        core.audio_input_block_size,
        Arc::clone(&metrics),
    );
    let (stream_tx, _) = broadcast::channel(64);

    let mut capture = AudioCapture::new(
        core.audio_input_device.clone(),
        core.audio_input_block_size,
        Arc::clone(&scorer_queue),
        Arc::clone(&ring),
        stream_tx.clone(),
    );
    capture.start().context("audio input device unusable")?;

    // Wake models + scorer thread.
    let base_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let wake_dirs: Vec<PathBuf> = core
        .wake_word_dirs
        .iter()
        .map(|dir| audio::resolve_path(&base_dir, dir))
        .collect();
    let models = wake::discover_models(&wake_dirs);
    if models.is_empty() {
        warn!("no usable wake models found, wake-word trigger inactive");
    }
    let scorer = wake::Scorer::new(
        models,
        wake_dirs.clone(),
        cfg_rx.clone(),
        Duration::from_secs_f64(core.refractory_seconds.max(0.0)),
    );
    let scorer_thread = {
        let queue = Arc::clone(&scorer_queue);
        let events = events_tx.clone();
        std::thread::Builder::new()
            .name("wake-scorer".into())
            .spawn(move || wake::run_scorer(queue, scorer, events))
            .context("failed to spawn wake scorer thread")?
    };

    // Playback sink and cue sounds.
    let player = Player::detect(core.audio_output_device.clone());
    let sounds = state::driver_sounds(&base_dir, &core);

    // Vision client, hub session, distance trigger.
    let vision = vision::spawn(
        events_tx.clone(),
        lva_ipc::visd_socket_path(),
        VISION_REQUEST_TIMEOUT,
    );
    let (session, session_task) = hub::spawn(
        hub::SessionConfig {
            host: core.hub_host.clone(),
            port: core.hub_port,
            name: args.name.clone().unwrap_or_else(|| core.name.clone()),
            mac: hub::read_mac_address(),
        },
        stream_tx.clone(),
        Arc::clone(&ring),
        events_tx.clone(),
    );
    let distance_reader = distance::open_reader(&runtime.distance_sensor_model);
    tokio::spawn(distance::run(
        distance_reader,
        cfg_rx.clone(),
        state_rx.clone(),
        events_tx.clone(),
    ));

    // Local IPC: control socket in, gpio-events out.
    let (control_listener, mut control_guard) =
        lva_ipc::SocketGuard::bind(&lva_ipc::control_socket_path())
            .context("failed to bind control socket")?;
    ipc::spawn_control_server(control_listener, events_tx.clone(), Arc::clone(&metrics));
    let gpio_tx = ipc::spawn_event_publisher(lva_ipc::gpio_event_socket_path());

    let driver = Driver::new(state::DriverParts {
        initial_cfg: runtime,
        events_rx,
        events_tx: events_tx.clone(),
        session: session.clone(),
        vision,
        player: player.clone(),
        gpio_tx,
        metrics,
        cfg_tx,
        state_tx,
        prefs,
        prefs_path,
        sounds,
        system_volume_device: core.system_volume_device.clone(),
    });

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    info!("satellite initialized, entering main loop");

    let mut exit = Ok(());
    tokio::select! {
        _ = driver.run() => {
            info!("driver exited");
        }
        result = session_task => {
            match result {
                Ok(Err(err)) => {
                    error!(?err, "hub session fatal error");
                    exit = Err(err);
                }
                Ok(Ok(())) => info!("hub session exited"),
                Err(err) => {
                    error!(?err, "hub session task panicked");
                    exit = Err(err.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }

    info!("shutting down...");
    session.cancel().await;
    player.stop().await;
    capture.stop();
    scorer_queue.close();
    if scorer_thread.join().is_err() {
        warn!("wake scorer thread panicked during shutdown");
    }
    control_guard.cleanup();

    info!("lva-satellite stopped");
    exit
}
