//! Event and trigger types flowing through the activation queue.
//!
//! Everything that can move the session state machine arrives here as one
//! [`Event`] on a single FIFO queue: triggers from the audio/distance/manual
//! paths, vision verdicts, session phase changes from the hub, armed-timer
//! expirations, and configuration mutations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConfigPatch, RuntimeConfig};

/// What caused an activation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerSource {
    WakeWord { model_id: String, score: f32 },
    Distance { mm: f64 },
    Manual { reason: String },
}

impl TriggerSource {
    /// Tie-break rank when several triggers land in one queue drain:
    /// Manual > WakeWord > Distance.
    pub fn priority(&self) -> u8 {
        match self {
            TriggerSource::Manual { .. } => 0,
            TriggerSource::WakeWord { .. } => 1,
            TriggerSource::Distance { .. } => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TriggerSource::WakeWord { .. } => "wake_word",
            TriggerSource::Distance { .. } => "distance",
            TriggerSource::Manual { .. } => "manual",
        }
    }
}

/// Outcome of a vision glance, as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttentionVerdict {
    FaceToward { confidence: f64 },
    FaceAway,
    NoFace,
    Error { message: String },
}

impl AttentionVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            AttentionVerdict::FaceToward { .. } => "FACE_TOWARD",
            AttentionVerdict::FaceAway => "FACE_AWAY",
            AttentionVerdict::NoFace => "NO_FACE",
            AttentionVerdict::Error { .. } => "VISION_ERROR",
        }
    }
}

/// Session phase changes reported by the hub session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// The remote pipeline saw the user start speaking.
    VadStarted,
    /// Speech captured; the assistant is working on a response.
    Processing,
    /// A response is ready; `url` points at the audio to play.
    Speaking { url: Option<String> },
    /// The conversation run finished or was torn down remotely.
    Ended,
    /// A session start was requested while the hub is unreachable.
    Unavailable,
}

/// Timers armed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Backstop for a glance reply that never arrives.
    VisionDeadline,
    /// The engaged-VAD window: how long we wait for speech after engaging.
    EngagedWindow,
}

/// One entry on the state machine queue. Everything shares this queue so a
/// configuration change observed at time T is reflected in every transition
/// computed after T.
#[derive(Debug, Clone)]
pub enum Event {
    Trigger(TriggerSource),
    Cancel,
    MuteToggle,
    SetMuted(bool),
    Vision {
        request_id: Uuid,
        verdict: AttentionVerdict,
        latency_ms: f64,
    },
    Session(SessionSignal),
    PlaybackFinished,
    Timeout(TimerKind),
    Config(Arc<RuntimeConfig>),
    /// A single-setting mutation from a hub entity write; the driver folds
    /// it into a fresh snapshot before the machine sees it as `Config`.
    Patch(ConfigPatch),
    /// Volume nudge from the front panel; handled outside the machine.
    VolumeStep(i32),
    /// Absolute volume write from the hub's volume entity.
    SetVolume(f64),
    /// Periodic sensor reading for the hub `distance` sensor.
    DistanceReading(Option<f64>),
}

/// Reorder the trigger events inside a single queue drain by priority while
/// leaving every other event in FIFO position.
pub fn order_drain(mut batch: Vec<Event>) -> Vec<Event> {
    let mut slots = Vec::new();
    let mut triggers = Vec::new();
    for (index, event) in batch.iter().enumerate() {
        if let Event::Trigger(source) = event {
            slots.push(index);
            triggers.push(source.clone());
        }
    }

    triggers.sort_by_key(TriggerSource::priority);
    for (slot, trigger) in slots.into_iter().zip(triggers) {
        batch[slot] = Event::Trigger(trigger);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wake() -> Event {
        Event::Trigger(TriggerSource::WakeWord {
            model_id: "okay_nabu".into(),
            score: 0.72,
        })
    }

    fn distance() -> Event {
        Event::Trigger(TriggerSource::Distance { mm: 90.0 })
    }

    fn manual() -> Event {
        Event::Trigger(TriggerSource::Manual {
            reason: "button".into(),
        })
    }

    #[test]
    fn drain_puts_manual_before_wake_before_distance() {
        let ordered = order_drain(vec![distance(), wake(), manual()]);
        let labels: Vec<_> = ordered
            .iter()
            .map(|e| match e {
                Event::Trigger(t) => t.label(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(labels, vec!["manual", "wake_word", "distance"]);
    }

    #[test]
    fn drain_keeps_non_triggers_in_place() {
        let ordered = order_drain(vec![distance(), Event::MuteToggle, manual()]);
        assert!(matches!(
            ordered[0],
            Event::Trigger(TriggerSource::Manual { .. })
        ));
        assert!(matches!(ordered[1], Event::MuteToggle));
        assert!(matches!(
            ordered[2],
            Event::Trigger(TriggerSource::Distance { .. })
        ));
    }

    #[test]
    fn verdict_serializes_with_screaming_tags() {
        let verdict = AttentionVerdict::FaceToward { confidence: 0.75 };
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("FACE_TOWARD"));

        let parsed: AttentionVerdict = serde_json::from_str(r#"{"state":"NO_FACE"}"#).unwrap();
        assert_eq!(parsed, AttentionVerdict::NoFace);
    }
}
