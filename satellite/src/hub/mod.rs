//! Hub session.
//!
//! Maintains the TCP connection to the home-automation hub: handshake,
//! keepalive, entity registration, voice-assistant audio streaming, and
//! dispatch of entity-state writes. Entity writes never touch shared state;
//! they become typed events on the activation queue.
//!
//! Reconnection uses exponential backoff (1 s doubling to a 30 s cap). A
//! handshake that keeps getting rejected for more than a minute is fatal.

pub mod entity;
pub mod proto;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioBlock, RingBuffer};
use crate::events::{Event, SessionSignal};
use entity::{dispatch_write, entity_defs, EntityWrite};
use proto::{read_message, write_message, HubMessage, VoicePhase};

/// Keepalive ping interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Handshake reply deadline per attempt.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent handshake rejection becomes fatal after this long.
const HANDSHAKE_FATAL_AFTER: Duration = Duration::from_secs(60);

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum SessionCommand {
    Start { use_vad: bool, trigger: &'static str },
    Cancel,
    EntityState { key: String, value: Value },
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn from_sender(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    pub async fn start(&self, use_vad: bool, trigger: &'static str) {
        let _ = self
            .tx
            .send(SessionCommand::Start { use_vad, trigger })
            .await;
    }

    pub async fn cancel(&self) {
        let _ = self.tx.send(SessionCommand::Cancel).await;
    }

    pub async fn publish_entity(&self, key: impl Into<String>, value: Value) {
        let _ = self
            .tx
            .send(SessionCommand::EntityState {
                key: key.into(),
                value,
            })
            .await;
    }
}

pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub mac: String,
}

/// Spawn the session actor. The returned join handle resolves with an error
/// only on a fatal condition (persistently rejected handshake).
pub fn spawn(
    cfg: SessionConfig,
    audio: broadcast::Sender<AudioBlock>,
    ring: Arc<RingBuffer>,
    events: mpsc::Sender<Event>,
) -> (SessionHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = SessionHandle { tx };
    let task = tokio::spawn(run(cfg, audio, ring, events, rx));
    (handle, task)
}

async fn run(
    cfg: SessionConfig,
    audio: broadcast::Sender<AudioBlock>,
    ring: Arc<RingBuffer>,
    events: mpsc::Sender<Event>,
    mut rx: mpsc::Receiver<SessionCommand>,
) -> Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let mut cached: HashMap<String, Value> = HashMap::new();
    let mut backoff = BACKOFF_START;
    let mut first_rejection: Option<Instant> = None;

    loop {
        drain_offline(&mut rx, &mut cached, &events).await;

        let stream = match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%addr, ?err, "hub connect failed");
                backoff = sleep_serving(&mut rx, &mut cached, &events, backoff).await;
                continue;
            }
            Err(_) => {
                debug!(%addr, "hub connect timed out");
                backoff = sleep_serving(&mut rx, &mut cached, &events, backoff).await;
                continue;
            }
        };

        let (mut reader, mut writer) = stream.into_split();
        match handshake(&cfg, &mut reader, &mut writer).await {
            Ok(()) => {
                first_rejection = None;
                backoff = BACKOFF_START;
            }
            Err(HandshakeError::Rejected(reason)) => {
                let first = *first_rejection.get_or_insert_with(Instant::now);
                warn!(%reason, "hub rejected handshake");
                if first.elapsed() > HANDSHAKE_FATAL_AFTER {
                    bail!("hub handshake persistently rejected: {reason}");
                }
                backoff = sleep_serving(&mut rx, &mut cached, &events, backoff).await;
                continue;
            }
            Err(HandshakeError::Io(err)) => {
                debug!(?err, "handshake failed");
                backoff = sleep_serving(&mut rx, &mut cached, &events, backoff).await;
                continue;
            }
        }

        info!(%addr, "connected to hub");
        let end = connected(&mut rx, &mut cached, &events, &audio, &ring, reader, writer).await;
        match end {
            ConnectionEnd::ChannelClosed => return Ok(()),
            ConnectionEnd::Disconnected { streaming } => {
                warn!(%addr, "hub connection lost, reconnecting");
                if streaming {
                    let _ = events.send(Event::Session(SessionSignal::Ended)).await;
                }
            }
        }
    }
}

enum HandshakeError {
    Rejected(String),
    Io(anyhow::Error),
}

async fn handshake(
    cfg: &SessionConfig,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> std::result::Result<(), HandshakeError> {
    write_message(
        writer,
        &HubMessage::Hello {
            name: cfg.name.clone(),
            mac: cfg.mac.clone(),
        },
    )
    .await
    .map_err(|e| HandshakeError::Io(e.into()))?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(reader))
        .await
        .map_err(|_| HandshakeError::Io(anyhow::anyhow!("handshake timed out")))?
        .map_err(|e| HandshakeError::Io(e.into()))?;

    match reply {
        Some(HubMessage::HelloAck { server }) => {
            debug!(%server, "handshake accepted");
            Ok(())
        }
        Some(HubMessage::HelloNack { reason }) => Err(HandshakeError::Rejected(reason)),
        other => Err(HandshakeError::Io(anyhow::anyhow!(
            "unexpected handshake reply: {other:?}"
        ))),
    }
}

enum ConnectionEnd {
    Disconnected { streaming: bool },
    ChannelClosed,
}

async fn connected(
    rx: &mut mpsc::Receiver<SessionCommand>,
    cached: &mut HashMap<String, Value>,
    events: &mpsc::Sender<Event>,
    audio: &broadcast::Sender<AudioBlock>,
    ring: &RingBuffer,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
) -> ConnectionEnd {
    // All writes funnel through one bounded queue. Audio uses try_send so a
    // stalled hub surfaces as backpressure instead of blocking the actor.
    let (write_tx, mut write_rx) = mpsc::channel::<HubMessage>(256);
    let mut writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = write_rx.recv().await {
            if write_message(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    // Registration, then the current value of every entity.
    let _ = write_tx
        .send(HubMessage::ListEntities {
            entities: entity_defs(),
        })
        .await;
    for (key, value) in cached.iter() {
        let _ = write_tx
            .send(HubMessage::EntityState {
                key: key.clone(),
                value: value.clone(),
            })
            .await;
    }

    let mut audio_rx: Option<broadcast::Receiver<AudioBlock>> = None;
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    writer_task.abort();
                    return ConnectionEnd::ChannelClosed;
                };
                match command {
                    SessionCommand::Start { use_vad, trigger } => {
                        debug!(use_vad, trigger, "starting voice stream");
                        if ring.current_block().is_none() {
                            warn!("audio underrun at session start");
                        }
                        if write_tx
                            .send(HubMessage::VoiceStart { use_vad, wake_word_phrase: None })
                            .await
                            .is_err()
                        {
                            return ConnectionEnd::Disconnected { streaming: true };
                        }
                        // Pre-roll: ship the retained window so the remote
                        // pipeline sees the audio from before the trigger.
                        for block in ring.window() {
                            if write_tx
                                .try_send(HubMessage::VoiceAudio { data: block.samples.to_vec() })
                                .is_err()
                            {
                                break;
                            }
                        }
                        audio_rx = Some(audio.subscribe());
                    }
                    SessionCommand::Cancel => {
                        let _ = write_tx.send(HubMessage::VoiceStop).await;
                        audio_rx = None;
                    }
                    SessionCommand::EntityState { key, value } => {
                        cached.insert(key.clone(), value.clone());
                        let _ = write_tx.send(HubMessage::EntityState { key, value }).await;
                    }
                }
            }

            incoming = read_message(&mut reader) => {
                let message = match incoming {
                    Ok(Some(message)) => message,
                    Ok(None) | Err(_) => {
                        writer_task.abort();
                        return ConnectionEnd::Disconnected { streaming: audio_rx.is_some() };
                    }
                };
                if handle_incoming(message, cached, events, &write_tx, &mut audio_rx).await.is_err() {
                    writer_task.abort();
                    return ConnectionEnd::Disconnected { streaming: audio_rx.is_some() };
                }
            }

            block = recv_audio(&mut audio_rx), if audio_rx.is_some() => {
                match block {
                    AudioRecv::Block(block) => {
                        let frame = HubMessage::VoiceAudio { data: block.samples.to_vec() };
                        if write_tx.try_send(frame).is_err() {
                            // Hub write buffer is full: abort the stream and
                            // surface it.
                            warn!("hub write buffer full, aborting audio stream");
                            audio_rx = None;
                            let _ = write_tx.try_send(HubMessage::VoiceStop);
                            let _ = events.send(Event::Session(SessionSignal::Ended)).await;
                        }
                    }
                    AudioRecv::Lagged => {}
                    AudioRecv::Closed => audio_rx = None,
                }
            }

            _ = keepalive.tick() => {
                if write_tx.try_send(HubMessage::Ping).is_err() {
                    warn!("hub write buffer full on keepalive");
                }
            }

            _ = &mut writer_task => {
                return ConnectionEnd::Disconnected { streaming: audio_rx.is_some() };
            }
        }
    }
}

enum AudioRecv {
    Block(AudioBlock),
    Lagged,
    Closed,
}

async fn recv_audio(audio_rx: &mut Option<broadcast::Receiver<AudioBlock>>) -> AudioRecv {
    match audio_rx {
        Some(rx) => match rx.recv().await {
            Ok(block) => AudioRecv::Block(block),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "audio stream lagged");
                AudioRecv::Lagged
            }
            Err(broadcast::error::RecvError::Closed) => AudioRecv::Closed,
        },
        None => std::future::pending().await,
    }
}

async fn handle_incoming(
    message: HubMessage,
    cached: &mut HashMap<String, Value>,
    events: &mpsc::Sender<Event>,
    write_tx: &mpsc::Sender<HubMessage>,
    audio_rx: &mut Option<broadcast::Receiver<AudioBlock>>,
) -> Result<()> {
    match message {
        HubMessage::Ping => {
            write_tx.send(HubMessage::Pong).await?;
        }
        HubMessage::Pong => {}
        HubMessage::EntityCommand { key, value } => match dispatch_write(&key, &value) {
            Ok(EntityWrite::Patch(patch)) => {
                events.send(Event::Patch(patch)).await?;
            }
            Ok(EntityWrite::SetMuted(muted)) => {
                events.send(Event::SetMuted(muted)).await?;
            }
            Ok(EntityWrite::SetVolume(volume)) => {
                events.send(Event::SetVolume(volume)).await?;
            }
            Err(err) => {
                // Reject: keep the previous value and put it back in front
                // of the hub.
                warn!(%key, %err, "rejected entity write");
                if let Some(previous) = cached.get(&key) {
                    write_tx
                        .send(HubMessage::EntityState {
                            key,
                            value: previous.clone(),
                        })
                        .await?;
                }
            }
        },
        HubMessage::VoiceEvent { event, data } => {
            let signal = match event {
                VoicePhase::RunStart => None,
                VoicePhase::VadStart => Some(SessionSignal::VadStarted),
                VoicePhase::SttEnd | VoicePhase::IntentStart => Some(SessionSignal::Processing),
                VoicePhase::TtsStart => Some(SessionSignal::Speaking {
                    url: data["url"].as_str().map(str::to_owned),
                }),
                VoicePhase::RunEnd => {
                    *audio_rx = None;
                    Some(SessionSignal::Ended)
                }
            };
            if let Some(signal) = signal {
                events.send(Event::Session(signal)).await?;
            }
        }
        HubMessage::VoiceStop => {
            *audio_rx = None;
            events.send(Event::Session(SessionSignal::Ended)).await?;
        }
        other => {
            debug!(?other, "ignoring hub message");
        }
    }
    Ok(())
}

async fn drain_offline(
    rx: &mut mpsc::Receiver<SessionCommand>,
    cached: &mut HashMap<String, Value>,
    events: &mpsc::Sender<Event>,
) {
    while let Ok(command) = rx.try_recv() {
        handle_offline(command, cached, events).await;
    }
}

async fn handle_offline(
    command: SessionCommand,
    cached: &mut HashMap<String, Value>,
    events: &mpsc::Sender<Event>,
) {
    match command {
        SessionCommand::Start { trigger, .. } => {
            debug!(trigger, "session start requested while hub is unreachable");
            let _ = events.send(Event::Session(SessionSignal::Unavailable)).await;
        }
        SessionCommand::Cancel => {}
        SessionCommand::EntityState { key, value } => {
            cached.insert(key, value);
        }
    }
}

/// Sleep through the reconnect backoff while still answering commands, then
/// return the next backoff value.
async fn sleep_serving(
    rx: &mut mpsc::Receiver<SessionCommand>,
    cached: &mut HashMap<String, Value>,
    events: &mpsc::Sender<Event>,
    backoff: Duration,
) -> Duration {
    let wait = tokio::time::sleep(backoff);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            _ = &mut wait => break,
            command = rx.recv() => match command {
                Some(command) => handle_offline(command, cached, events).await,
                None => break,
            },
        }
    }
    (backoff * 2).min(BACKOFF_CAP)
}

/// Best-effort MAC address for the device identity in the handshake.
pub fn read_mac_address() -> String {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return "00:00:00:00:00:00".into();
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        if let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) {
            let mac = mac.trim();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return mac.to_owned();
            }
        }
    }
    "00:00:00:00:00:00".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPatch;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct FakeHub {
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    }

    impl FakeHub {
        /// Accept one satellite connection and complete the handshake.
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();

            match read_message(&mut reader).await.unwrap().unwrap() {
                HubMessage::Hello { name, .. } => assert!(!name.is_empty()),
                other => panic!("expected hello, got {other:?}"),
            }
            write_message(
                &mut writer,
                &HubMessage::HelloAck {
                    server: "test-hub".into(),
                },
            )
            .await
            .unwrap();

            Self { reader, writer }
        }

        async fn recv(&mut self) -> HubMessage {
            tokio::time::timeout(Duration::from_secs(5), read_message(&mut self.reader))
                .await
                .expect("hub read timed out")
                .unwrap()
                .expect("satellite closed connection")
        }

        async fn send(&mut self, message: HubMessage) {
            write_message(&mut self.writer, &message).await.unwrap();
        }
    }

    fn test_ring() -> Arc<RingBuffer> {
        RingBuffer::new(1.0, 1024, crate::metrics::Metrics::new())
    }

    async fn start_session(
        listener: &TcpListener,
    ) -> (SessionHandle, mpsc::Receiver<Event>, JoinHandle<Result<()>>) {
        let addr = listener.local_addr().unwrap();
        let (events_tx, events_rx) = mpsc::channel(32);
        let (audio_tx, _) = broadcast::channel(32);
        let (handle, task) = spawn(
            SessionConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                name: "TestSat".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
            },
            audio_tx,
            test_ring(),
            events_tx,
        );
        (handle, events_rx, task)
    }

    async fn expect_event(events: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn registers_entities_after_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_handle, _events, _task) = start_session(&listener).await;

        let mut hub = FakeHub::accept(&listener).await;
        match hub.recv().await {
            HubMessage::ListEntities { entities } => {
                assert!(entities.iter().any(|e| e.key == "vision_enabled"));
                assert!(entities.iter().any(|e| e.key == "distance"));
            }
            other => panic!("expected entity registration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn entity_write_becomes_patch_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_handle, mut events, _task) = start_session(&listener).await;
        let mut hub = FakeHub::accept(&listener).await;
        let _ = hub.recv().await; // registration

        hub.send(HubMessage::EntityCommand {
            key: "vision_enabled".into(),
            value: json!(false),
        })
        .await;

        match expect_event(&mut events).await {
            Event::Patch(ConfigPatch::VisionEnabled(false)) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_write_republishes_previous_value() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, _events, _task) = start_session(&listener).await;
        let mut hub = FakeHub::accept(&listener).await;
        let _ = hub.recv().await; // registration

        handle.publish_entity("vision_cooldown_s", json!(4.0)).await;
        match hub.recv().await {
            HubMessage::EntityState { key, value } => {
                assert_eq!(key, "vision_cooldown_s");
                assert_eq!(value, json!(4.0));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Out of range: the write is rejected and the old value comes back.
        hub.send(HubMessage::EntityCommand {
            key: "vision_cooldown_s".into(),
            value: json!(99.0),
        })
        .await;
        match hub.recv().await {
            HubMessage::EntityState { key, value } => {
                assert_eq!(key, "vision_cooldown_s");
                assert_eq!(value, json!(4.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn voice_events_map_to_session_signals() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut events, _task) = start_session(&listener).await;
        let mut hub = FakeHub::accept(&listener).await;
        let _ = hub.recv().await; // registration

        handle.start(false, "wake_word").await;
        match hub.recv().await {
            HubMessage::VoiceStart { use_vad, .. } => assert!(!use_vad),
            other => panic!("unexpected {other:?}"),
        }

        hub.send(HubMessage::VoiceEvent {
            event: VoicePhase::SttEnd,
            data: json!({}),
        })
        .await;
        assert!(matches!(
            expect_event(&mut events).await,
            Event::Session(SessionSignal::Processing)
        ));

        hub.send(HubMessage::VoiceEvent {
            event: VoicePhase::TtsStart,
            data: json!({"url": "http://hub/tts.mp3"}),
        })
        .await;
        match expect_event(&mut events).await {
            Event::Session(SessionSignal::Speaking { url }) => {
                assert_eq!(url.as_deref(), Some("http://hub/tts.mp3"));
            }
            other => panic!("unexpected {other:?}"),
        }

        hub.send(HubMessage::VoiceEvent {
            event: VoicePhase::RunEnd,
            data: json!({}),
        })
        .await;
        assert!(matches!(
            expect_event(&mut events).await,
            Event::Session(SessionSignal::Ended)
        ));
    }

    #[tokio::test]
    async fn start_while_disconnected_reports_unavailable() {
        // Bind and drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (audio_tx, _) = broadcast::channel(8);
        let (handle, _task) = spawn(
            SessionConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                name: "TestSat".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
            },
            audio_tx,
            test_ring(),
            events_tx,
        );

        handle.start(true, "manual").await;
        match expect_event(&mut events_rx).await {
            Event::Session(SessionSignal::Unavailable) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_handle, _events, _task) = start_session(&listener).await;
        let mut hub = FakeHub::accept(&listener).await;
        let _ = hub.recv().await; // registration

        hub.send(HubMessage::Ping).await;
        assert!(matches!(hub.recv().await, HubMessage::Pong));
    }
}
