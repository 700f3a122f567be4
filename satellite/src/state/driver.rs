//! Runtime driver for the state machine.
//!
//! Owns the event queue, executes the reducer's effects, arms real timers,
//! folds entity-write patches into fresh config snapshots, and keeps
//! preferences, the hub entities, and the gpio-events socket in sync. This
//! is the single task that serializes every transition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lva_ipc::{msg, Envelope, Source};

use crate::audio::Player;
use crate::config::RuntimeConfig;
use crate::events::{order_drain, Event, TimerKind};
use crate::hub::entity::{entity_states, Diagnostics};
use crate::hub::SessionHandle;
use crate::metrics::Metrics;
use crate::preferences::Preferences;
use crate::state::machine::{Effect, Machine, SessionState, SoundCue};
use crate::vision::VisionHandle;

/// Resolved cue sound paths.
#[derive(Debug, Clone)]
pub struct Sounds {
    pub wakeup: PathBuf,
    pub thinking: PathBuf,
    pub mute: PathBuf,
    pub unmute: PathBuf,
}

/// Resolve the configured cue sounds relative to the config directory.
pub fn driver_sounds(base: &std::path::Path, core: &crate::config::CoreConfig) -> Sounds {
    use crate::audio::resolve_path;
    Sounds {
        wakeup: resolve_path(base, &core.wakeup_sound),
        thinking: resolve_path(base, &core.processing_sound),
        mute: resolve_path(base, &core.mute_sound),
        unmute: resolve_path(base, &core.unmute_sound),
    }
}

impl Sounds {
    fn for_cue(&self, cue: SoundCue) -> &PathBuf {
        match cue {
            SoundCue::Wakeup => &self.wakeup,
            SoundCue::Thinking => &self.thinking,
            SoundCue::Mute => &self.mute,
            SoundCue::Unmute => &self.unmute,
        }
    }
}

pub struct DriverParts {
    pub initial_cfg: Arc<RuntimeConfig>,
    pub events_rx: mpsc::Receiver<Event>,
    pub events_tx: mpsc::Sender<Event>,
    pub session: SessionHandle,
    pub vision: VisionHandle,
    pub player: Player,
    pub gpio_tx: mpsc::Sender<Envelope>,
    pub metrics: Arc<Metrics>,
    pub cfg_tx: watch::Sender<Arc<RuntimeConfig>>,
    pub state_tx: watch::Sender<SessionState>,
    pub prefs: Preferences,
    pub prefs_path: PathBuf,
    pub sounds: Sounds,
    pub system_volume_device: Option<String>,
}

pub struct Driver {
    machine: Machine,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    session: SessionHandle,
    vision: VisionHandle,
    player: Player,
    gpio_tx: mpsc::Sender<Envelope>,
    metrics: Arc<Metrics>,
    cfg_tx: watch::Sender<Arc<RuntimeConfig>>,
    state_tx: watch::Sender<SessionState>,
    prefs: Preferences,
    prefs_path: PathBuf,
    sounds: Sounds,
    system_volume_device: Option<String>,
    diag: Diagnostics,
    volume: f64,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    playback_done: mpsc::Sender<()>,
}

impl Driver {
    pub fn new(parts: DriverParts) -> Self {
        // Forward playback completion into the event queue.
        let (playback_done, mut done_rx) = mpsc::channel::<()>(4);
        let events_tx = parts.events_tx.clone();
        tokio::spawn(async move {
            while done_rx.recv().await.is_some() {
                let _ = events_tx.send(Event::PlaybackFinished).await;
            }
        });

        Self {
            machine: Machine::new(Arc::clone(&parts.initial_cfg)),
            events_rx: parts.events_rx,
            events_tx: parts.events_tx,
            session: parts.session,
            vision: parts.vision,
            player: parts.player,
            gpio_tx: parts.gpio_tx,
            metrics: parts.metrics,
            cfg_tx: parts.cfg_tx,
            state_tx: parts.state_tx,
            prefs: parts.prefs,
            prefs_path: parts.prefs_path,
            sounds: parts.sounds,
            system_volume_device: parts.system_volume_device,
            diag: Diagnostics {
                attention_state: "IDLE".into(),
                ..Diagnostics::default()
            },
            volume: 50.0,
            timers: HashMap::new(),
            playback_done,
        }
    }

    /// Drive until the event channel closes.
    pub async fn run(mut self) {
        self.publish_entities().await;
        self.publish_state().await;

        while let Some(first) = self.events_rx.recv().await {
            let mut batch = vec![first];
            while let Ok(more) = self.events_rx.try_recv() {
                batch.push(more);
            }
            for event in order_drain(batch) {
                self.dispatch(event).await;
            }
        }
        debug!("event queue closed, driver exiting");
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Patch(patch) => {
                debug!(?patch, "applying entity write");
                let next = Arc::new(self.machine.config().with_patch(&patch));
                self.prefs.absorb(&next);
                if let Err(err) = self.prefs.save(&self.prefs_path) {
                    warn!(?err, "failed to persist preferences");
                }
                self.cfg_tx.send_replace(Arc::clone(&next));
                let effects = self.machine.apply(Event::Config(next), Instant::now());
                self.run_effects(effects).await;
                self.publish_entities().await;
            }
            Event::VolumeStep(steps) => {
                let target = self.volume + f64::from(steps);
                self.set_volume(target).await;
            }
            Event::SetVolume(target) => {
                self.set_volume(target).await;
            }
            Event::DistanceReading(mm) => {
                self.diag.distance_mm = mm;
                self.session.publish_entity("distance", json!(mm)).await;
            }
            other => {
                let effects = self.machine.apply(other, Instant::now());
                self.run_effects(effects).await;
            }
        }
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartSession { use_vad, trigger } => {
                    self.session.start(use_vad, trigger).await;
                }
                Effect::CancelSession => self.session.cancel().await,
                Effect::RequestGlance { request_id } => self.vision.request(request_id).await,
                Effect::CancelGlance { request_id } => self.vision.cancel(request_id).await,
                Effect::ArmTimer { kind, after } => self.arm_timer(kind, after),
                Effect::ClearTimer(kind) => {
                    if let Some(handle) = self.timers.remove(&kind) {
                        handle.abort();
                    }
                }
                Effect::PlaySound(cue) => {
                    let path = self.sounds.for_cue(cue).to_string_lossy().into_owned();
                    self.player.play(&path, None).await;
                }
                Effect::PlayResponse { url } => {
                    self.player.play(&url, Some(self.playback_done.clone())).await;
                }
                Effect::StopPlayback => self.player.stop().await,
                Effect::PublishState => self.publish_state().await,
                Effect::SetAttention(text) => {
                    self.diag.attention_state = text.to_owned();
                    self.session
                        .publish_entity("last_attention_state", json!(text))
                        .await;
                }
                Effect::SetVisionLatency(ms) => {
                    self.diag.vision_latency_ms = ms.max(0.0);
                    self.session
                        .publish_entity("last_vision_latency_ms", json!(self.diag.vision_latency_ms))
                        .await;
                }
                Effect::SetVisionError(error) => {
                    self.diag.vision_error = error.clone();
                    self.session
                        .publish_entity("last_vision_error", json!(error))
                        .await;
                }
                Effect::Count(counter) => self.metrics.bump(counter),
            }
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        if let Some(previous) = self.timers.remove(&kind) {
            previous.abort();
        }
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::Timeout(kind)).await;
        });
        self.timers.insert(kind, handle);
    }

    async fn set_volume(&mut self, target: f64) {
        self.volume = target.clamp(0.0, 100.0);
        self.player
            .set_volume(self.volume, self.system_volume_device.as_deref())
            .await;
        self.session.publish_entity("volume", json!(self.volume)).await;
    }

    async fn publish_state(&mut self) {
        let state = self.machine.state();
        let muted = self.machine.muted();
        self.state_tx.send_replace(state);

        let changed = Envelope::new(
            msg::STATE_CHANGED,
            json!({ "state": state.to_string(), "muted": muted }),
            Source::Core,
        );
        let led = Envelope::new(
            msg::LED_STATE,
            json!({ "mode": led_mode(state, muted) }),
            Source::Core,
        );
        // The front panel may be absent; dropped envelopes are fine.
        let _ = self.gpio_tx.try_send(changed);
        let _ = self.gpio_tx.try_send(led);

        self.session.publish_entity("mute", json!(muted)).await;
    }

    async fn publish_entities(&mut self) {
        let states = entity_states(
            self.machine.config(),
            &self.diag,
            self.machine.muted(),
            self.volume,
        );
        for (key, value) in states {
            self.session.publish_entity(key, value).await;
        }
    }
}

fn led_mode(state: SessionState, muted: bool) -> &'static str {
    if muted {
        return "muted";
    }
    match state {
        SessionState::Idle => "idle",
        SessionState::ProxVerify | SessionState::VisionGlance => "glance",
        SessionState::Engaged | SessionState::Listening => "listening",
        SessionState::Processing => "processing",
        SessionState::Speaking => "speaking",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigPatch, CoreConfig, ThresholdPreset};
    use crate::events::TriggerSource;
    use crate::hub::SessionCommand;
    use crate::vision::VisionCommand;

    struct Harness {
        events_tx: mpsc::Sender<Event>,
        session_rx: mpsc::Receiver<SessionCommand>,
        _vision_rx: mpsc::Receiver<VisionCommand>,
        gpio_rx: mpsc::Receiver<Envelope>,
        cfg_rx: watch::Receiver<Arc<RuntimeConfig>>,
        prefs_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn runtime_cfg() -> RuntimeConfig {
        let mut core = CoreConfig::default();
        core.distance_activation = Some(true);
        core.vision_enabled = Some(false);
        core.attention_required = Some(false);
        RuntimeConfig::from_startup(&core, &Preferences::default())
    }

    fn spawn_driver() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let prefs_path = dir.path().join("preferences.json");

        let (events_tx, events_rx) = mpsc::channel(64);
        let (session_tx, session_rx) = mpsc::channel(64);
        let (vision_tx, vision_rx) = mpsc::channel(64);
        let (gpio_tx, gpio_rx) = mpsc::channel(64);
        let initial = Arc::new(runtime_cfg());
        let (cfg_tx, cfg_rx) = watch::channel(Arc::clone(&initial));
        let (state_tx, _state_rx) = watch::channel(SessionState::Idle);

        let driver = Driver::new(DriverParts {
            initial_cfg: initial,
            events_rx,
            events_tx: events_tx.clone(),
            session: SessionHandle::from_sender(session_tx),
            vision: VisionHandle::from_sender(vision_tx),
            player: Player::Null,
            gpio_tx,
            metrics: Metrics::new(),
            cfg_tx,
            state_tx,
            prefs: Preferences::default(),
            prefs_path: prefs_path.clone(),
            sounds: Sounds {
                wakeup: "/tmp/wake.flac".into(),
                thinking: "/tmp/think.wav".into(),
                mute: "/tmp/mute.flac".into(),
                unmute: "/tmp/unmute.flac".into(),
            },
            system_volume_device: None,
        });
        tokio::spawn(driver.run());

        Harness {
            events_tx,
            session_rx,
            _vision_rx: vision_rx,
            gpio_rx,
            cfg_rx,
            prefs_path,
            _dir: dir,
        }
    }

    async fn next_session_command(harness: &mut Harness) -> SessionCommand {
        loop {
            let command = tokio::time::timeout(Duration::from_secs(5), harness.session_rx.recv())
                .await
                .expect("no session command")
                .expect("session channel closed");
            // Entity state sync is chatty; skip it here.
            if !matches!(command, SessionCommand::EntityState { .. }) {
                return command;
            }
        }
    }

    #[tokio::test]
    async fn wake_trigger_starts_session_and_publishes_state() {
        let mut harness = spawn_driver();

        harness
            .events_tx
            .send(Event::Trigger(TriggerSource::WakeWord {
                model_id: "okay_nabu".into(),
                score: 0.8,
            }))
            .await
            .unwrap();

        match next_session_command(&mut harness).await {
            SessionCommand::Start { use_vad, trigger } => {
                assert!(!use_vad);
                assert_eq!(trigger, "wake_word");
            }
            other => panic!("unexpected command {other:?}"),
        }

        // The gpio-events stream carries the transition.
        let mut saw_listening = false;
        for _ in 0..8 {
            let envelope = tokio::time::timeout(Duration::from_secs(5), harness.gpio_rx.recv())
                .await
                .expect("no gpio envelope")
                .expect("gpio channel closed");
            if envelope.kind == msg::STATE_CHANGED
                && envelope.payload["state"] == serde_json::json!("LISTENING")
            {
                saw_listening = true;
                break;
            }
        }
        assert!(saw_listening);
    }

    #[tokio::test(start_paused = true)]
    async fn engaged_window_timer_cancels_session() {
        let mut harness = spawn_driver();

        harness
            .events_tx
            .send(Event::Trigger(TriggerSource::Distance { mm: 90.0 }))
            .await
            .unwrap();

        assert!(matches!(
            next_session_command(&mut harness).await,
            SessionCommand::Start { use_vad: true, .. }
        ));

        // Let the armed engaged-window timer (2.5 s) fire.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            next_session_command(&mut harness).await,
            SessionCommand::Cancel
        ));
    }

    #[tokio::test]
    async fn patch_rewrites_preferences_and_republishes_snapshot() {
        let mut harness = spawn_driver();

        harness
            .events_tx
            .send(Event::Patch(ConfigPatch::ThresholdPreset(
                ThresholdPreset::Strict,
            )))
            .await
            .unwrap();

        // Wait for the snapshot to flip.
        tokio::time::timeout(Duration::from_secs(5), harness.cfg_rx.changed())
            .await
            .expect("snapshot not republished")
            .unwrap();
        assert_eq!(
            harness.cfg_rx.borrow().threshold_preset,
            ThresholdPreset::Strict
        );

        // The persisted preference matches the write.
        let prefs = Preferences::load(&harness.prefs_path).unwrap();
        assert_eq!(prefs.wake_word_threshold_preset, ThresholdPreset::Strict);
    }
}
