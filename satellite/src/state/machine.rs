//! The activation state machine.
//!
//! A pure reducer: [`Machine::apply`] consumes one event plus the current
//! instant and returns the side effects to run. All time-based behavior
//! (cooldowns, the engaged-VAD window, the glance deadline) works off the
//! `now` parameter and armed-timer events, so tests drive the machine with a
//! virtual clock and never sleep.
//!
//! Exactly one task owns the machine and serializes transitions; everything
//! else talks to it through the event queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::events::{AttentionVerdict, Event, SessionSignal, TimerKind, TriggerSource};
use crate::metrics::Counter;

/// Deadline for a vision glance reply.
pub const VISION_REQUEST_TIMEOUT: Duration = Duration::from_millis(1200);

/// Primary session state. The muted overlay is tracked separately and never
/// replaces the primary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ProxVerify,
    VisionGlance,
    Engaged,
    Listening,
    Processing,
    Speaking,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::ProxVerify => "PROX_VERIFY",
            SessionState::VisionGlance => "VISION_GLANCE",
            SessionState::Engaged => "ENGAGED",
            SessionState::Listening => "LISTENING",
            SessionState::Processing => "PROCESSING",
            SessionState::Speaking => "SPEAKING",
        };
        write!(f, "{name}")
    }
}

/// Short cues played through the local sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    Wakeup,
    Mute,
    Unmute,
    Thinking,
}

/// Side effects requested by the reducer. The driver executes them; the
/// machine itself never does I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartSession {
        use_vad: bool,
        trigger: &'static str,
    },
    CancelSession,
    RequestGlance {
        request_id: Uuid,
    },
    CancelGlance {
        request_id: Uuid,
    },
    ArmTimer {
        kind: TimerKind,
        after: Duration,
    },
    ClearTimer(TimerKind),
    PlaySound(SoundCue),
    PlayResponse {
        url: String,
    },
    StopPlayback,
    PublishState,
    SetAttention(&'static str),
    SetVisionLatency(f64),
    SetVisionError(String),
    Count(Counter),
}

pub struct Machine {
    state: SessionState,
    muted: bool,
    cfg: Arc<RuntimeConfig>,
    pending_glance: Option<Uuid>,
    session_active: bool,
    last_vision_decision: Option<Instant>,
}

impl Machine {
    pub fn new(cfg: Arc<RuntimeConfig>) -> Self {
        Self {
            state: SessionState::Idle,
            muted: false,
            cfg,
            pending_glance: None,
            session_active: false,
            last_vision_decision: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.cfg
    }

    /// Apply one event at the given instant and return the effects to run.
    pub fn apply(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let before = self.state;

        match event {
            Event::Trigger(TriggerSource::WakeWord { model_id, score }) => {
                self.on_wake_word(&model_id, score, now, &mut effects);
            }
            Event::Trigger(TriggerSource::Distance { mm }) => {
                self.on_distance(mm, now, &mut effects);
            }
            Event::Trigger(TriggerSource::Manual { reason }) => {
                self.on_manual(&reason, now, &mut effects);
            }
            Event::Cancel => self.on_cancel(&mut effects),
            Event::MuteToggle => self.set_muted(!self.muted, &mut effects),
            Event::SetMuted(muted) => self.set_muted(muted, &mut effects),
            Event::Vision {
                request_id,
                verdict,
                latency_ms,
            } => self.on_vision(request_id, verdict, latency_ms, now, &mut effects),
            Event::Session(signal) => self.on_session(signal, &mut effects),
            Event::PlaybackFinished => self.on_playback_finished(&mut effects),
            Event::Timeout(kind) => self.on_timeout(kind, now, &mut effects),
            Event::Config(cfg) => self.on_config(cfg, &mut effects),
            // Handled by the driver before the machine; inert here.
            Event::Patch(_)
            | Event::VolumeStep(_)
            | Event::SetVolume(_)
            | Event::DistanceReading(_) => {}
        }

        if self.state != before {
            info!(from = %before, to = %self.state, muted = self.muted, "state transition");
        }
        effects
    }

    fn on_wake_word(&mut self, model_id: &str, score: f32, now: Instant, effects: &mut Vec<Effect>) {
        if !self.cfg.wake_word_detection || self.muted {
            return;
        }

        match self.state {
            SessionState::Idle => {
                debug!(model_id, score, "wake word trigger");
                self.start_listening(false, "wake_word", effects);
            }
            SessionState::VisionGlance => {
                // A wake word is a stronger signal than a pending glance:
                // abandon the glance and listen immediately.
                self.abandon_glance(now, effects);
                self.start_listening(false, "wake_word", effects);
            }
            _ => {}
        }
    }

    fn on_distance(&mut self, mm: f64, now: Instant, effects: &mut Vec<Effect>) {
        if !self.cfg.distance_activation || self.muted {
            return;
        }
        if self.state != SessionState::Idle {
            return;
        }

        if self.in_vision_cooldown(now) {
            debug!(mm, "distance trigger suppressed by vision cooldown");
            if self.cfg.attention_required {
                effects.push(Effect::Count(Counter::FalseTriggersPrevented));
            }
            return;
        }

        debug!(mm, "distance trigger");
        self.state = SessionState::ProxVerify;
        effects.push(Effect::PublishState);
        self.resolve_prox_verify(effects);
    }

    fn on_manual(&mut self, reason: &str, now: Instant, effects: &mut Vec<Effect>) {
        if self.muted {
            return;
        }

        match self.state {
            SessionState::Idle => {
                info!(reason, "manual wake");
                self.start_listening(true, "manual", effects);
            }
            SessionState::VisionGlance => {
                self.abandon_glance(now, effects);
                self.start_listening(true, "manual", effects);
            }
            SessionState::Engaged => {
                // Treat a manual wake during the engaged window as the user
                // confirming intent.
                effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
                self.state = SessionState::Listening;
                effects.push(Effect::SetAttention("LISTENING"));
                effects.push(Effect::PublishState);
            }
            _ => {}
        }
    }

    fn on_cancel(&mut self, effects: &mut Vec<Effect>) {
        info!("cancel requested");
        self.teardown(effects);
        effects.push(Effect::StopPlayback);
        self.state = SessionState::Idle;
        effects.push(Effect::SetAttention("IDLE"));
        effects.push(Effect::PublishState);
    }

    /// The muted overlay never replaces the primary state. Muting stops an
    /// active listen; everything else keeps running and the overlay blocks
    /// any automatic entry into LISTENING until unmute.
    fn set_muted(&mut self, muted: bool, effects: &mut Vec<Effect>) {
        if muted == self.muted {
            effects.push(Effect::PublishState);
            return;
        }

        self.muted = muted;
        if muted {
            info!(state = %self.state, "muted");
            if self.state == SessionState::Listening {
                if self.session_active {
                    effects.push(Effect::CancelSession);
                    self.session_active = false;
                }
                effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
                self.state = SessionState::Idle;
                effects.push(Effect::SetAttention("IDLE"));
            }
            effects.push(Effect::PlaySound(SoundCue::Mute));
        } else {
            info!("unmuted");
            effects.push(Effect::PlaySound(SoundCue::Unmute));
        }
        effects.push(Effect::PublishState);
    }

    fn on_vision(
        &mut self,
        request_id: Uuid,
        verdict: AttentionVerdict,
        latency_ms: f64,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.pending_glance != Some(request_id) {
            debug!(%request_id, "dropping stale vision reply");
            return;
        }

        self.pending_glance = None;
        self.last_vision_decision = Some(now);
        effects.push(Effect::ClearTimer(TimerKind::VisionDeadline));
        effects.push(Effect::SetVisionLatency(latency_ms));

        if self.state != SessionState::VisionGlance {
            return;
        }

        match verdict {
            AttentionVerdict::FaceToward { confidence }
                if confidence >= self.cfg.vision_min_confidence =>
            {
                if self.muted {
                    // Attention confirmed, but the overlay suppresses the
                    // session. Not a false trigger.
                    info!(confidence, "attention confirmed while muted, suppressing session");
                    effects.push(Effect::SetAttention("FACE_TOWARD"));
                    self.back_to_idle_keep_attention(effects);
                    return;
                }
                info!(confidence, latency_ms, "attention confirmed");
                effects.push(Effect::Count(Counter::VisionSuccess));
                effects.push(Effect::SetAttention("FACE_TOWARD"));
                effects.push(Effect::SetVisionError(String::new()));
                self.engage(effects);
            }
            AttentionVerdict::Error { message } => {
                info!(error = %message, "vision glance failed");
                effects.push(Effect::SetVisionError(message));
                effects.push(Effect::Count(Counter::VisionTimeout));
                if self.muted {
                    self.back_to_idle("VISION_ERROR", effects);
                } else if self.cfg.vision_fallback_on_error {
                    // Distance-only fallback: proceed as if the glance had
                    // passed.
                    self.engage(effects);
                } else {
                    effects.push(Effect::Count(Counter::FalseTriggersPrevented));
                    self.back_to_idle("VISION_ERROR", effects);
                }
            }
            verdict => {
                info!(verdict = verdict.label(), "attention rejected");
                effects.push(Effect::Count(Counter::FalseTriggersPrevented));
                effects.push(Effect::SetAttention(verdict.label()));
                self.back_to_idle_keep_attention(effects);
            }
        }
    }

    fn on_session(&mut self, signal: SessionSignal, effects: &mut Vec<Effect>) {
        match signal {
            SessionSignal::VadStarted => {
                // The overlay blocks the promotion into LISTENING; the
                // engaged window expires on its own.
                if self.state == SessionState::Engaged && !self.muted {
                    effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
                    self.state = SessionState::Listening;
                    effects.push(Effect::SetAttention("LISTENING"));
                    effects.push(Effect::PublishState);
                }
            }
            SessionSignal::Processing => {
                if matches!(self.state, SessionState::Listening | SessionState::Engaged) {
                    effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
                    self.state = SessionState::Processing;
                    if self.cfg.thinking_sound {
                        effects.push(Effect::PlaySound(SoundCue::Thinking));
                    }
                    effects.push(Effect::PublishState);
                }
            }
            SessionSignal::Speaking { url } => {
                if matches!(
                    self.state,
                    SessionState::Processing | SessionState::Listening
                ) {
                    self.state = SessionState::Speaking;
                    effects.push(Effect::StopPlayback);
                    if let Some(url) = url {
                        effects.push(Effect::PlayResponse { url });
                    }
                    effects.push(Effect::PublishState);
                }
            }
            SessionSignal::Ended => {
                self.session_active = false;
                if self.state == SessionState::Speaking {
                    // Stay in SPEAKING until local playback drains.
                    return;
                }
                if self.state != SessionState::Idle {
                    effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
                    self.back_to_idle("IDLE", effects);
                }
            }
            SessionSignal::Unavailable => {
                // Hub is down: capture ran locally but no conversation can
                // complete. Fall back to IDLE once the VAD window elapses.
                self.session_active = false;
                effects.push(Effect::ArmTimer {
                    kind: TimerKind::EngagedWindow,
                    after: self.cfg.engaged_vad_window,
                });
            }
        }
    }

    fn on_playback_finished(&mut self, effects: &mut Vec<Effect>) {
        if self.state == SessionState::Speaking {
            self.session_active = false;
            self.back_to_idle("IDLE", effects);
        }
    }

    fn on_timeout(&mut self, kind: TimerKind, now: Instant, effects: &mut Vec<Effect>) {
        match kind {
            TimerKind::VisionDeadline => {
                let Some(request_id) = self.pending_glance.take() else {
                    return;
                };
                if self.state != SessionState::VisionGlance {
                    return;
                }

                self.last_vision_decision = Some(now);
                effects.push(Effect::CancelGlance { request_id });
                effects.push(Effect::SetVisionError("timeout".into()));
                effects.push(Effect::Count(Counter::VisionTimeout));
                if self.muted {
                    info!("vision deadline elapsed while muted");
                    self.back_to_idle("VISION_TIMEOUT", effects);
                } else if self.cfg.vision_fallback_on_error {
                    info!("vision deadline elapsed, distance-only fallback");
                    self.engage(effects);
                } else {
                    info!("vision deadline elapsed, trigger rejected");
                    effects.push(Effect::Count(Counter::FalseTriggersPrevented));
                    self.back_to_idle("VISION_TIMEOUT", effects);
                }
            }
            TimerKind::EngagedWindow => match self.state {
                SessionState::Engaged => {
                    info!("engaged window elapsed without speech");
                    self.last_vision_decision = Some(now);
                    if self.session_active {
                        effects.push(Effect::CancelSession);
                        self.session_active = false;
                    }
                    self.back_to_idle("VAD_TIMEOUT", effects);
                }
                SessionState::Listening => {
                    // Disconnected-hub fallback: nothing confirmed the
                    // session, release the pipeline.
                    if self.session_active {
                        effects.push(Effect::CancelSession);
                        self.session_active = false;
                    }
                    self.back_to_idle("IDLE", effects);
                }
                _ => {}
            },
        }
    }

    fn on_config(&mut self, cfg: Arc<RuntimeConfig>, effects: &mut Vec<Effect>) {
        let vision_was_enabled = self.cfg.vision_enabled;
        self.cfg = cfg;

        if vision_was_enabled && !self.cfg.vision_enabled && self.state == SessionState::VisionGlance
        {
            if let Some(request_id) = self.pending_glance.take() {
                effects.push(Effect::CancelGlance { request_id });
                effects.push(Effect::ClearTimer(TimerKind::VisionDeadline));
            }
            self.back_to_idle("IDLE", effects);
        }
    }

    // -- helpers ----------------------------------------------------------

    fn in_vision_cooldown(&self, now: Instant) -> bool {
        match self.last_vision_decision {
            Some(at) => now.duration_since(at) < self.cfg.vision_cooldown,
            None => false,
        }
    }

    /// PROX_VERIFY is transient: the same drain that entered it decides
    /// whether to glance or to engage directly.
    fn resolve_prox_verify(&mut self, effects: &mut Vec<Effect>) {
        if self.cfg.vision_enabled && self.cfg.attention_required {
            let request_id = Uuid::new_v4();
            self.pending_glance = Some(request_id);
            self.state = SessionState::VisionGlance;
            effects.push(Effect::Count(Counter::VisionRequests));
            effects.push(Effect::RequestGlance { request_id });
            effects.push(Effect::ArmTimer {
                kind: TimerKind::VisionDeadline,
                after: VISION_REQUEST_TIMEOUT,
            });
            effects.push(Effect::SetAttention("VISION_GLANCE"));
            effects.push(Effect::PublishState);
        } else {
            self.engage(effects);
        }
    }

    fn engage(&mut self, effects: &mut Vec<Effect>) {
        self.state = SessionState::Engaged;
        self.session_active = true;
        effects.push(Effect::StartSession {
            use_vad: true,
            trigger: "distance",
        });
        effects.push(Effect::ArmTimer {
            kind: TimerKind::EngagedWindow,
            after: self.cfg.engaged_vad_window,
        });
        if self.cfg.activation_sound {
            effects.push(Effect::PlaySound(SoundCue::Wakeup));
        }
        effects.push(Effect::SetAttention("ENGAGED"));
        effects.push(Effect::PublishState);
    }

    fn start_listening(&mut self, use_vad: bool, trigger: &'static str, effects: &mut Vec<Effect>) {
        self.state = SessionState::Listening;
        self.session_active = true;
        effects.push(Effect::StartSession { use_vad, trigger });
        if trigger == "wake_word" || self.cfg.activation_sound {
            effects.push(Effect::PlaySound(SoundCue::Wakeup));
        }
        effects.push(Effect::SetAttention("LISTENING"));
        effects.push(Effect::PublishState);
    }

    /// Drop a pending glance without recording a verdict. Starts the
    /// cooldown so the abandoned glance still rate-limits the next one.
    fn abandon_glance(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if let Some(request_id) = self.pending_glance.take() {
            effects.push(Effect::CancelGlance { request_id });
            effects.push(Effect::ClearTimer(TimerKind::VisionDeadline));
            self.last_vision_decision = Some(now);
        }
    }

    /// Cancel everything outstanding: session stream, glance, timers.
    fn teardown(&mut self, effects: &mut Vec<Effect>) {
        if self.session_active {
            effects.push(Effect::CancelSession);
            self.session_active = false;
        }
        if let Some(request_id) = self.pending_glance.take() {
            effects.push(Effect::CancelGlance { request_id });
            effects.push(Effect::ClearTimer(TimerKind::VisionDeadline));
        }
        effects.push(Effect::ClearTimer(TimerKind::EngagedWindow));
    }

    fn back_to_idle(&mut self, attention: &'static str, effects: &mut Vec<Effect>) {
        self.state = SessionState::Idle;
        effects.push(Effect::SetAttention(attention));
        effects.push(Effect::PublishState);
    }

    fn back_to_idle_keep_attention(&mut self, effects: &mut Vec<Effect>) {
        self.state = SessionState::Idle;
        effects.push(Effect::PublishState);
    }
}
