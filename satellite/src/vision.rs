//! Vision glance client.
//!
//! At most one request is in flight at a time. Each request opens the visd
//! socket, sends `VISION_GLANCE_REQUEST`, and waits for the matching
//! `VISION_GLANCE_RESULT` on the same connection. A missing daemon surfaces
//! as `Error{unreachable}` and a silent one as `Error{timeout}`, so the
//! state machine can apply its fallback policy either way.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use lva_ipc::{msg, read_envelope, write_envelope, Envelope, Source};

use crate::events::{AttentionVerdict, Event};

/// Connect retry backoff: 0.5 s, 1 s, then capped at 2 s.
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(500);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum VisionCommand {
    Request { id: Uuid },
    Cancel { id: Uuid },
}

#[derive(Clone)]
pub struct VisionHandle {
    tx: mpsc::Sender<VisionCommand>,
}

impl VisionHandle {
    pub(crate) fn from_sender(tx: mpsc::Sender<VisionCommand>) -> Self {
        Self { tx }
    }

    pub async fn request(&self, id: Uuid) {
        let _ = self.tx.send(VisionCommand::Request { id }).await;
    }

    pub async fn cancel(&self, id: Uuid) {
        let _ = self.tx.send(VisionCommand::Cancel { id }).await;
    }
}

/// Spawn the client actor. `request_timeout` bounds the whole exchange.
pub fn spawn(
    events: mpsc::Sender<Event>,
    socket: PathBuf,
    request_timeout: Duration,
) -> VisionHandle {
    let (tx, mut rx) = mpsc::channel::<VisionCommand>(8);

    tokio::spawn(async move {
        let mut inflight: Option<(Uuid, tokio::task::JoinHandle<()>)> = None;

        while let Some(command) = rx.recv().await {
            if let Some((_, handle)) = &inflight {
                if handle.is_finished() {
                    inflight = None;
                }
            }

            match command {
                VisionCommand::Request { id } => {
                    if inflight.is_some() {
                        // The machine never issues overlapping glances; a
                        // second request here is a stale retry.
                        warn!(%id, "dropping glance request, one already in flight");
                        continue;
                    }
                    let events = events.clone();
                    let socket = socket.clone();
                    let handle = tokio::spawn(async move {
                        let started = Instant::now();
                        let (verdict, latency_ms) =
                            perform_glance(&socket, id, started + request_timeout).await;
                        let latency_ms =
                            latency_ms.unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0);
                        let _ = events
                            .send(Event::Vision {
                                request_id: id,
                                verdict,
                                latency_ms,
                            })
                            .await;
                    });
                    inflight = Some((id, handle));
                }
                VisionCommand::Cancel { id } => {
                    if let Some((inflight_id, handle)) = &inflight {
                        if *inflight_id == id {
                            debug!(%id, "cancelling glance request");
                            handle.abort();
                            inflight = None;
                        }
                    }
                }
            }
        }
    });

    VisionHandle { tx }
}

/// Run one glance exchange against the daemon. Returns the verdict plus the
/// daemon-reported latency, when it supplied one.
async fn perform_glance(
    socket: &std::path::Path,
    id: Uuid,
    deadline: Instant,
) -> (AttentionVerdict, Option<f64>) {
    let Some(stream) = connect_until(socket, deadline).await else {
        return (
            AttentionVerdict::Error {
                message: "unreachable".into(),
            },
            None,
        );
    };

    let (read_half, mut write_half) = stream.into_split();
    let request = Envelope::new(
        msg::VISION_GLANCE_REQUEST,
        json!({ "request_id": id.to_string() }),
        Source::Core,
    );
    if write_envelope(&mut write_half, &request).await.is_err() {
        return (
            AttentionVerdict::Error {
                message: "unreachable".into(),
            },
            None,
        );
    }

    let mut reader = BufReader::new(read_half);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return (
                AttentionVerdict::Error {
                    message: "timeout".into(),
                },
                None,
            );
        }

        match tokio::time::timeout(remaining, read_envelope(&mut reader)).await {
            Err(_) | Ok(Ok(None)) => {
                return (
                    AttentionVerdict::Error {
                        message: "timeout".into(),
                    },
                    None,
                );
            }
            Ok(Err(err)) => {
                debug!(?err, "bad frame from visd");
                continue;
            }
            Ok(Ok(Some(envelope))) => {
                if envelope.kind != msg::VISION_GLANCE_RESULT {
                    continue;
                }
                let reply_id = envelope.payload["request_id"].as_str().unwrap_or_default();
                if reply_id != id.to_string() {
                    debug!(reply_id, "ignoring result for a different request");
                    continue;
                }
                return parse_result(&envelope.payload);
            }
        }
    }
}

async fn connect_until(socket: &std::path::Path, deadline: Instant) -> Option<UnixStream> {
    let mut backoff = CONNECT_BACKOFF_START;
    loop {
        match UnixStream::connect(socket).await {
            Ok(stream) => return Some(stream),
            Err(err) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!(?err, "visd unreachable");
                    return None;
                }
                tokio::time::sleep(backoff.min(remaining)).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
            }
        }
    }
}

/// Decode a `VISION_GLANCE_RESULT` payload. Accepts `verdict` with `state`
/// as a legacy alias.
pub(crate) fn parse_result(payload: &Value) -> (AttentionVerdict, Option<f64>) {
    let latency_ms = payload["latency_ms"].as_f64();

    if let Some(error) = payload["error"].as_str() {
        if !error.trim().is_empty() {
            return (
                AttentionVerdict::Error {
                    message: error.trim().to_owned(),
                },
                latency_ms,
            );
        }
    }

    let state = payload["verdict"]
        .as_str()
        .or_else(|| payload["state"].as_str())
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    let confidence = payload["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);

    let verdict = match state.as_str() {
        "FACE_TOWARD" => AttentionVerdict::FaceToward { confidence },
        "FACE_AWAY" => AttentionVerdict::FaceAway,
        _ => AttentionVerdict::NoFace,
    };
    (verdict, latency_ms)
}
