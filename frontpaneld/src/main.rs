//! lva-frontpaneld: front panel daemon.
//!
//! Polls the capacitive touch keys and the rotary encoder, debounces them,
//! and sends logical command envelopes to the core's control socket. Also
//! binds the gpio-events socket and consumes state/LED envelopes from the
//! core; actual LED rendering is a pluggable sink. Stateless across
//! restarts.

mod panel;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lva_ipc::{msg, read_envelope, write_envelope, Envelope, Source};

use crate::panel::{NullPanel, PanelEvent, PanelScanner, PinMap};

/// Input poll period.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "lva-frontpaneld", version, about)]
struct Args {
    /// Config file path (overrides LVA_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print DEBUG messages to console.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FrontpaneldConfig {
    mute_pin: u32,
    wake_pin: u32,
    vol_up_pin: u32,
    vol_down_pin: u32,
    enc_a_pin: u32,
    enc_b_pin: u32,
    log_level: String,
}

impl Default for FrontpaneldConfig {
    fn default() -> Self {
        Self {
            mute_pin: 17,
            wake_pin: 27,
            vol_up_pin: 22,
            vol_down_pin: 23,
            enc_a_pin: 5,
            enc_b_pin: 6,
            log_level: "info".into(),
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<FrontpaneldConfig> {
    if !path.exists() {
        return Ok(FrontpaneldConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in config {}", path.display()))?;
    match value.get("frontpaneld") {
        Some(section) => serde_json::from_value(section.clone())
            .with_context(|| format!("invalid frontpaneld section in {}", path.display())),
        None => Ok(FrontpaneldConfig::default()),
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

/// Map a panel event onto its command envelope.
fn event_envelope(event: PanelEvent) -> Envelope {
    match event {
        PanelEvent::MuteToggle => Envelope::new(msg::MUTE_TOGGLE, json!({}), Source::Frontpaneld),
        PanelEvent::ManualWake => Envelope::new(
            msg::MANUAL_WAKE,
            json!({"reason": "front_panel"}),
            Source::Frontpaneld,
        ),
        PanelEvent::VolumeUp => Envelope::new(msg::VOLUME_UP, json!({}), Source::Frontpaneld),
        PanelEvent::VolumeDown => Envelope::new(msg::VOLUME_DOWN, json!({}), Source::Frontpaneld),
        PanelEvent::VolumeDelta(steps) => Envelope::new(
            "VOLUME_DELTA",
            json!({ "steps": steps }),
            Source::Frontpaneld,
        ),
    }
}

/// Send one envelope to the control socket, reconnecting lazily. Returns
/// the connection slot state for the next call.
async fn send_command(
    slot: &mut Option<UnixStream>,
    socket: &std::path::Path,
    envelope: &Envelope,
) {
    if slot.is_none() {
        match UnixStream::connect(socket).await {
            Ok(stream) => *slot = Some(stream),
            Err(err) => {
                debug!(?err, "core control socket unavailable, dropping command");
                return;
            }
        }
    }

    if let Some(stream) = slot.as_mut() {
        if let Err(err) = write_envelope(stream, envelope).await {
            debug!(?err, "control write failed, reconnecting on next command");
            *slot = None;
        }
    }
}

/// Consume state/LED envelopes from the core. Rendering hardware is out of
/// process; here the events only reach the log.
async fn run_event_listener(listener: tokio::net::UnixListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            loop {
                match read_envelope(&mut reader).await {
                    Ok(Some(envelope)) => match envelope.kind.as_str() {
                        msg::LED_STATE => {
                            debug!(mode = %envelope.payload["mode"], "LED mode");
                        }
                        msg::STATE_CHANGED => {
                            debug!(
                                state = %envelope.payload["state"],
                                muted = %envelope.payload["muted"],
                                "core state"
                            );
                        }
                        other => debug!(kind = other, "ignoring core event"),
                    },
                    Ok(None) => return,
                    Err(err) => {
                        debug!(?err, "dropping bad core event frame");
                    }
                }
            }
        });
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

    info!(version = env!("CARGO_PKG_VERSION"), "lva-frontpaneld starting");

    // Events from the core (state changes, LED modes).
    let (event_listener, mut guard) = lva_ipc::SocketGuard::bind(&lva_ipc::gpio_event_socket_path())
        .context("failed to bind gpio-events socket")?;
    tokio::spawn(run_event_listener(event_listener));

    // No userspace GPIO backend registered: poll the null panel so the
    // daemon still exercises its full path on dev machines.
    if !std::path::Path::new("/dev/gpiochip0").exists() {
        warn!("no GPIO chip found, panel inputs inactive");
    }
    let pins = PinMap {
        mute: config.mute_pin,
        wake: config.wake_pin,
        vol_up: config.vol_up_pin,
        vol_down: config.vol_down_pin,
        enc_a: config.enc_a_pin,
        enc_b: config.enc_b_pin,
    };
    let mut scanner = PanelScanner::new(NullPanel, pins);

    let control_socket = lva_ipc::control_socket_path();
    let mut control: Option<UnixStream> = None;
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    info!("frontpaneld started");

    loop {
        tokio::select! {
            _ = poll.tick() => {
                for event in scanner.poll(Instant::now()) {
                    debug!(?event, "panel event");
                    let envelope = event_envelope(event);
                    send_command(&mut control, &control_socket, &envelope).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
        }
    }

    guard.cleanup();
    info!("lva-frontpaneld stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_map_to_expected_envelopes() {
        let mute = event_envelope(PanelEvent::MuteToggle);
        assert_eq!(mute.kind, msg::MUTE_TOGGLE);
        assert_eq!(mute.source, Source::Frontpaneld);

        let wake = event_envelope(PanelEvent::ManualWake);
        assert_eq!(wake.kind, msg::MANUAL_WAKE);
        assert_eq!(wake.payload["reason"], json!("front_panel"));

        let delta = event_envelope(PanelEvent::VolumeDelta(-2));
        assert_eq!(delta.kind, "VOLUME_DELTA");
        assert_eq!(delta.payload["steps"], json!(-2));
    }

    #[tokio::test]
    async fn commands_reach_the_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (listener, _guard) = lva_ipc::SocketGuard::bind(&path).unwrap();

        let mut slot = None;
        send_command(&mut slot, &path, &event_envelope(PanelEvent::VolumeUp)).await;
        assert!(slot.is_some());

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let envelope = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(envelope.kind, msg::VOLUME_UP);
    }

    #[tokio::test]
    async fn absent_core_drops_commands_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");

        let mut slot = None;
        send_command(&mut slot, &path, &event_envelope(PanelEvent::MuteToggle)).await;
        assert!(slot.is_none());
    }
}
