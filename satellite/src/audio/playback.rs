//! Playback sink.
//!
//! Media decoding stays outside the process: each utterance is handed to an
//! `mpv` child that owns decode-and-play for that one source, and volume
//! changes go through `amixer`. When no player binary is present the sink
//! degrades to a null implementation that only logs.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// A play/stop sink. One decoder process per utterance; `stop` kills the
/// current one.
#[derive(Clone)]
pub enum Player {
    Mpv(Arc<MpvPlayer>),
    /// Used when no player binary is available; play/stop become no-ops.
    Null,
}

pub struct MpvPlayer {
    output_device: Option<String>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Player {
    /// Pick the backend: `mpv` on PATH, otherwise a warned null sink.
    pub fn detect(output_device: Option<String>) -> Self {
        let found = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("mpv").is_file()))
            .unwrap_or(false);

        if found {
            Player::Mpv(Arc::new(MpvPlayer {
                output_device,
                stop_tx: Mutex::new(None),
            }))
        } else {
            warn!("mpv not found on PATH, audio playback disabled");
            Player::Null
        }
    }

    /// Play a file or URL. When `done` is provided, a unit is sent once the
    /// decoder exits on its own; a stopped playback does not report
    /// completion.
    pub async fn play(&self, source: &str, done: Option<mpsc::Sender<()>>) {
        match self {
            Player::Mpv(mpv) => mpv.play(source, done),
            Player::Null => {
                debug!(source, "null player: skipping playback");
                // Report immediate completion so callers waiting on
                // playback-finished still advance.
                if let Some(done) = done {
                    let _ = done.send(()).await;
                }
            }
        }
    }

    /// Stop whatever is playing. Idempotent.
    pub async fn stop(&self) {
        if let Player::Mpv(mpv) = self {
            mpv.stop();
        }
    }

    /// Set the output volume as a percentage through `amixer`.
    pub async fn set_volume(&self, percent: f64, device: Option<&str>) {
        let target = percent.clamp(0.0, 100.0).round() as i64;
        let mut cmd = Command::new("amixer");
        if let Some(device) = device {
            cmd.args(["-D", device]);
        }
        cmd.args(["sset", "Master", &format!("{target}%")]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.status().await {
            Ok(status) if status.success() => debug!(target, "volume set"),
            Ok(status) => warn!(target, ?status, "amixer exited non-zero"),
            Err(err) => warn!(?err, "failed to run amixer"),
        }
    }
}

impl MpvPlayer {
    fn play(&self, source: &str, done: Option<mpsc::Sender<()>>) {
        self.stop();

        let mut cmd = Command::new("mpv");
        cmd.arg("--no-video")
            .arg("--really-quiet")
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(device) = &self.output_device {
            cmd.arg(format!("--audio-device={device}"));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(source, ?err, "failed to spawn mpv");
                if let Some(done) = done {
                    tokio::spawn(async move {
                        let _ = done.send(()).await;
                    });
                }
                return;
            }
        };
        debug!(source, "playback started");

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut slot = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(stop_tx);
        }

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let finished = status.map(|s| s.success()).unwrap_or(false);
                    debug!(finished, "playback exited");
                    if finished {
                        if let Some(done) = done {
                            let _ = done.send(()).await;
                        }
                    }
                }
                _ = stop_rx => {
                    debug!("stopping playback");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });
    }

    fn stop(&self) {
        let stop_tx = {
            let mut slot = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
    }
}

/// Resolve a configured relative path against the config directory.
pub fn resolve_path(base: &std::path::Path, configured: &str) -> PathBuf {
    let path = std::path::Path::new(configured);
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_player_reports_immediate_completion() {
        let player = Player::Null;
        let (done_tx, mut done_rx) = mpsc::channel(1);
        player.play("sounds/wake.flac", Some(done_tx)).await;
        assert!(done_rx.recv().await.is_some());
    }

    #[test]
    fn configured_paths_resolve_relative_to_base() {
        let base = std::path::Path::new("/etc/lva");
        assert_eq!(
            resolve_path(base, "sounds/processing.wav"),
            PathBuf::from("/etc/lva/sounds/processing.wav")
        );
        assert_eq!(
            resolve_path(base, "/abs/mute.flac"),
            PathBuf::from("/abs/mute.flac")
        );
    }
}
