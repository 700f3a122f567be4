//! Local IPC endpoints of the core.
//!
//! The control socket accepts command envelopes from the front panel daemon
//! and external controllers; the gpio-events socket is an outbound stream of
//! state and LED envelopes toward whoever renders them. Malformed and
//! oversize frames are dropped and counted, never fatal.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lva_ipc::{msg, read_envelope, write_envelope, Envelope, IpcError};

use crate::events::{Event, TriggerSource};
use crate::metrics::{Counter, Metrics};
use crate::vision;

/// Accept loop for the control socket.
pub fn spawn_control_server(
    listener: UnixListener,
    events: mpsc::Sender<Event>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!("control client connected");
                    let events = events.clone();
                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        handle_control_client(stream, events, metrics).await;
                    });
                }
                Err(err) => {
                    warn!(?err, "control socket accept failed");
                }
            }
        }
    })
}

async fn handle_control_client(
    stream: UnixStream,
    events: mpsc::Sender<Event>,
    metrics: Arc<Metrics>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => {
                if let Some(event) = envelope_to_event(&envelope) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                } else {
                    debug!(kind = %envelope.kind, "ignoring unknown control message");
                }
            }
            Ok(None) => {
                debug!("control client disconnected");
                return;
            }
            Err(IpcError::OversizeFrame { len }) => {
                metrics.bump(Counter::OversizeFramesDropped);
                warn!(len, "dropped oversize control frame");
            }
            Err(err) => {
                debug!(?err, "dropping malformed control frame");
            }
        }
    }
}

/// Translate one inbound envelope into a queue event. Legacy `{cmd}` shapes
/// were already normalized by the envelope layer.
pub fn envelope_to_event(envelope: &Envelope) -> Option<Event> {
    let payload = &envelope.payload;
    match envelope.kind.as_str() {
        msg::MANUAL_WAKE => Some(Event::Trigger(TriggerSource::Manual {
            reason: payload["reason"].as_str().unwrap_or("ipc").to_owned(),
        })),
        msg::MUTE_TOGGLE => Some(Event::MuteToggle),
        "MUTE_ON" => Some(Event::SetMuted(true)),
        "MUTE_OFF" => Some(Event::SetMuted(false)),
        msg::VOLUME_UP => Some(Event::VolumeStep(5)),
        msg::VOLUME_DOWN => Some(Event::VolumeStep(-5)),
        // Front panel encoder shapes: a signed direction or a raw delta.
        "VOLUME_STEP" => {
            let direction = payload["steps"]
                .as_i64()
                .or_else(|| payload["direction"].as_i64())
                .unwrap_or(0);
            (direction != 0).then(|| Event::VolumeStep(if direction > 0 { 5 } else { -5 }))
        }
        "VOLUME_DELTA" => {
            let steps = payload["steps"].as_i64().unwrap_or(0);
            (steps != 0).then(|| Event::VolumeStep(steps.clamp(-20, 20) as i32))
        }
        msg::CANCEL => Some(Event::Cancel),
        // visd may push results here instead of replying on its own socket.
        msg::VISION_GLANCE_RESULT => {
            let request_id = payload["request_id"].as_str()?;
            let request_id = Uuid::parse_str(request_id).ok()?;
            let (verdict, latency) = vision::parse_result(payload);
            Some(Event::Vision {
                request_id,
                verdict,
                latency_ms: latency.unwrap_or(0.0),
            })
        }
        _ => None,
    }
}

/// Outbound publisher for the gpio-events socket. The peer binds the socket;
/// when it is absent, envelopes are dropped silently and the connection is
/// retried on the next send.
pub fn spawn_event_publisher(socket: PathBuf) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);

    tokio::spawn(async move {
        let mut stream: Option<UnixStream> = None;
        let mut logged_absent = false;

        while let Some(envelope) = rx.recv().await {
            if stream.is_none() {
                match UnixStream::connect(&socket).await {
                    Ok(connected) => {
                        info!(?socket, "gpio-events peer connected");
                        stream = Some(connected);
                        logged_absent = false;
                    }
                    Err(err) => {
                        if !logged_absent {
                            debug!(?socket, ?err, "gpio-events peer absent, dropping events");
                            logged_absent = true;
                        }
                        continue;
                    }
                }
            }

            if let Some(connected) = stream.as_mut() {
                if let Err(err) = write_envelope(connected, &envelope).await {
                    debug!(?err, "gpio-events peer went away");
                    stream = None;
                }
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AttentionVerdict;
    use lva_ipc::{Source, MAX_FRAME_BYTES};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn expect_event(events: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event")
            .expect("event channel closed")
    }

    fn control_fixture() -> (
        std::path::PathBuf,
        mpsc::Receiver<Event>,
        Arc<Metrics>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (listener, guard) = lva_ipc::SocketGuard::bind(&path).unwrap();
        std::mem::forget(guard); // tempdir cleanup covers the file
        let (events_tx, events_rx) = mpsc::channel(16);
        let metrics = Metrics::new();
        spawn_control_server(listener, events_tx, Arc::clone(&metrics));
        (path, events_rx, metrics, dir)
    }

    #[tokio::test]
    async fn legacy_cmd_envelope_is_equivalent_to_typed_manual_wake() {
        let (path, mut events_rx, _metrics, _dir) = control_fixture();

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"{\"cmd\":\"manual_wake\"}\n").await.unwrap();

        match expect_event(&mut events_rx).await {
            Event::Trigger(TriggerSource::Manual { .. }) => {}
            other => panic!("unexpected event {other:?}"),
        }

        // The modern form lands on the same event.
        let envelope = Envelope::new(msg::MANUAL_WAKE, json!({}), Source::External);
        write_envelope(&mut client, &envelope).await.unwrap();
        match expect_event(&mut events_rx).await {
            Event::Trigger(TriggerSource::Manual { .. }) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_frame_is_counted_and_skipped() {
        let (path, mut events_rx, metrics, _dir) = control_fixture();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let blob = "x".repeat(MAX_FRAME_BYTES + 100);
        let frame = format!("{{\"cmd\":\"noise\",\"blob\":\"{blob}\"}}\n");
        client.write_all(frame.as_bytes()).await.unwrap();
        client.write_all(b"{\"cmd\":\"mute_toggle\"}\n").await.unwrap();

        assert!(matches!(expect_event(&mut events_rx).await, Event::MuteToggle));
        assert_eq!(metrics.get(Counter::OversizeFramesDropped), 1);
    }

    #[tokio::test]
    async fn vision_results_are_routed_to_the_queue() {
        let (path, mut events_rx, _metrics, _dir) = control_fixture();
        let id = Uuid::new_v4();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let envelope = Envelope::new(
            msg::VISION_GLANCE_RESULT,
            json!({
                "request_id": id.to_string(),
                "verdict": "FACE_TOWARD",
                "confidence": 0.7,
                "latency_ms": 250.0,
            }),
            Source::Visd,
        );
        write_envelope(&mut client, &envelope).await.unwrap();

        match expect_event(&mut events_rx).await {
            Event::Vision {
                request_id,
                verdict,
                latency_ms,
            } => {
                assert_eq!(request_id, id);
                assert_eq!(verdict, AttentionVerdict::FaceToward { confidence: 0.7 });
                assert_eq!(latency_ms, 250.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn encoder_shapes_map_to_volume_steps() {
        let step = Envelope::new("VOLUME_STEP", json!({"steps": -1}), Source::Frontpaneld);
        assert!(matches!(
            envelope_to_event(&step),
            Some(Event::VolumeStep(-5))
        ));

        let delta = Envelope::new("VOLUME_DELTA", json!({"steps": 2}), Source::Frontpaneld);
        assert!(matches!(
            envelope_to_event(&delta),
            Some(Event::VolumeStep(2))
        ));

        let zero = Envelope::new("VOLUME_DELTA", json!({"steps": 0}), Source::Frontpaneld);
        assert!(envelope_to_event(&zero).is_none());
    }
}
