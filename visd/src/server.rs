//! Glance request/reply server.
//!
//! Listens on the visd UNIX socket for `VISION_GLANCE_REQUEST` envelopes.
//! Each request opens the camera for a short burst, runs the detector, and
//! replies on the same connection with `VISION_GLANCE_RESULT`. Requests
//! arriving while a glance is running are rejected with `busy`; the camera
//! is exclusive and never held open between requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lva_ipc::{msg, read_envelope, spawn_writer, Envelope, IpcError, Source};

use crate::camera::{CameraSource, Frame};
use crate::detector::{Detection, Detector};

pub struct GlanceServer {
    camera: Arc<dyn CameraSource>,
    detector: Arc<dyn Detector>,
    burst: Duration,
    frame_count: usize,
    width: u32,
    height: u32,
    busy: Arc<AtomicBool>,
}

impl GlanceServer {
    pub fn new(
        camera: Arc<dyn CameraSource>,
        detector: Arc<dyn Detector>,
        burst_seconds: f64,
        frame_count: usize,
        width: u32,
        height: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera,
            detector,
            burst: Duration::from_secs_f64(burst_seconds.clamp(0.7, 1.2)),
            frame_count: frame_count.clamp(4, 6),
            width,
            height,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        info!("visd ready");
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_client(stream).await });
                }
                Err(err) => warn!(?err, "visd accept failed"),
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let replies = spawn_writer(write_half);

        loop {
            match read_envelope(&mut reader).await {
                Ok(Some(envelope)) => {
                    if envelope.kind != msg::VISION_GLANCE_REQUEST {
                        debug!(kind = %envelope.kind, "ignoring message");
                        continue;
                    }
                    let request_id = envelope.payload["request_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_owned();
                    if request_id.is_empty() {
                        continue;
                    }
                    self.serve_glance(request_id, &replies).await;
                }
                Ok(None) => return,
                Err(IpcError::OversizeFrame { len }) => {
                    warn!(len, "dropped oversize frame");
                }
                Err(err) => {
                    debug!(?err, "dropping malformed frame");
                }
            }
        }
    }

    async fn serve_glance(&self, request_id: String, replies: &mpsc::Sender<Envelope>) {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!(%request_id, "glance already running, rejecting");
            let _ = replies
                .send(result_envelope(&request_id, Detection::no_face(), 0.0, Some("busy")))
                .await;
            return;
        }

        let started = Instant::now();
        let outcome = self.capture_and_analyze().await;
        self.busy.store(false, Ordering::Release);

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let envelope = match outcome {
            Ok(detection) => {
                info!(
                    %request_id,
                    verdict = detection.verdict,
                    confidence = format_args!("{:.2}", detection.confidence),
                    latency_ms = format_args!("{latency_ms:.0}"),
                    "glance complete"
                );
                result_envelope(&request_id, detection, latency_ms, None)
            }
            Err(error) => {
                warn!(%request_id, %error, "glance failed");
                result_envelope(&request_id, Detection::no_face(), latency_ms, Some(&error))
            }
        };
        let _ = replies.send(envelope).await;
    }

    /// Open the camera, grab the burst, close the camera, run the detector.
    async fn capture_and_analyze(&self) -> Result<Detection, String> {
        let camera = Arc::clone(&self.camera);
        let detector = Arc::clone(&self.detector);
        let burst = self.burst;
        let frame_count = self.frame_count;
        let (width, height) = (self.width, self.height);

        let result = tokio::task::spawn_blocking(move || -> Result<Detection, String> {
            let mut handle = camera
                .open(width, height)
                .map_err(|_| "camera".to_owned())?;

            let deadline = Instant::now() + burst;
            let mut frames: Vec<Frame> = Vec::with_capacity(frame_count);
            while Instant::now() < deadline && frames.len() < frame_count {
                match handle.grab() {
                    Ok(frame) => frames.push(frame),
                    Err(err) => debug!(?err, "frame grab failed"),
                }
            }
            drop(handle);

            if frames.is_empty() {
                return Err("camera_no_frames".into());
            }
            Ok(detector.analyze(&frames))
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(err) => Err(format!("glance_panic: {err}")),
        }
    }
}

fn result_envelope(
    request_id: &str,
    detection: Detection,
    latency_ms: f64,
    error: Option<&str>,
) -> Envelope {
    let mut payload = json!({
        "request_id": request_id,
        "verdict": detection.verdict,
        "confidence": detection.confidence,
        "latency_ms": latency_ms,
    });
    if let Some(error) = error {
        payload["error"] = json!(error);
    }
    Envelope::new(msg::VISION_GLANCE_RESULT, payload, Source::Visd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::ScriptedCamera;
    use crate::camera::NullCamera;
    use crate::detector::CentroidDetector;
    use lva_ipc::{write_envelope, SocketGuard};

    fn bright_center_frame() -> Frame {
        let (width, height) = (64u32, 48u32);
        let mut data = vec![8u8; (width * height) as usize];
        for y in 16..32 {
            for x in 24..40 {
                data[(y * width + x) as usize] = 220;
            }
        }
        Frame {
            width,
            height,
            data,
        }
    }

    async fn request(
        stream: &mut UnixStream,
        request_id: &str,
    ) -> serde_json::Value {
        let envelope = Envelope::new(
            msg::VISION_GLANCE_REQUEST,
            json!({ "request_id": request_id }),
            Source::Core,
        );
        write_envelope(stream, &envelope).await.unwrap();

        let (read_half, _write_half) = stream.split();
        let mut reader = BufReader::new(read_half);
        let reply = tokio::time::timeout(Duration::from_secs(5), read_envelope(&mut reader))
            .await
            .expect("no reply")
            .unwrap()
            .expect("connection closed");
        assert_eq!(reply.kind, msg::VISION_GLANCE_RESULT);
        reply.payload
    }

    fn serve(server: Arc<GlanceServer>) -> (std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visd.sock");
        let (listener, guard) = SocketGuard::bind(&path).unwrap();
        std::mem::forget(guard);
        tokio::spawn(server.run(listener));
        (path, dir)
    }

    #[tokio::test]
    async fn glance_replies_with_detector_verdict() {
        let camera = Arc::new(ScriptedCamera::with_frames(vec![bright_center_frame()]));
        let server = GlanceServer::new(
            camera,
            Arc::new(CentroidDetector::new()),
            0.7,
            4,
            64,
            48,
        );
        let (path, _dir) = serve(server);

        let mut client = UnixStream::connect(&path).await.unwrap();
        let payload = request(&mut client, "vg-1").await;

        assert_eq!(payload["request_id"], json!("vg-1"));
        assert_eq!(payload["verdict"], json!("FACE_TOWARD"));
        assert!(payload["confidence"].as_f64().unwrap() > 0.5);
        assert!(payload["latency_ms"].as_f64().unwrap() >= 0.0);
        assert!(payload.get("error").is_none());
    }

    #[tokio::test]
    async fn missing_camera_reports_camera_error() {
        let server = GlanceServer::new(
            Arc::new(NullCamera),
            Arc::new(CentroidDetector::new()),
            0.9,
            5,
            320,
            240,
        );
        let (path, _dir) = serve(server);

        let mut client = UnixStream::connect(&path).await.unwrap();
        let payload = request(&mut client, "vg-2").await;
        assert_eq!(payload["error"], json!("camera"));
    }

    #[tokio::test]
    async fn concurrent_request_is_rejected_busy() {
        // Slow grabs keep the first glance running long enough for the
        // second request to collide with it.
        let camera = Arc::new(ScriptedCamera {
            frames: std::sync::Mutex::new(vec![bright_center_frame()]),
            grab_delay: Duration::from_millis(150),
            fail_open: false,
        });
        let server = GlanceServer::new(
            camera,
            Arc::new(CentroidDetector::new()),
            0.7,
            4,
            64,
            48,
        );
        let (path, _dir) = serve(server);

        let path_clone = path.clone();
        let first = tokio::spawn(async move {
            let mut client = UnixStream::connect(&path_clone).await.unwrap();
            request(&mut client, "vg-slow").await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut second_client = UnixStream::connect(&path).await.unwrap();
        let second = request(&mut second_client, "vg-collide").await;
        assert_eq!(second["error"], json!("busy"));

        let first = first.await.unwrap();
        assert!(first.get("error").is_none());
    }
}
