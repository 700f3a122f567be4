//! Hub-exposed entities.
//!
//! A static registry: every control surface the hub sees has a stable key,
//! a kind, optional metadata, and a handler that turns an incoming write
//! into a typed mutation. Writes that fail validation are rejected and the
//! previous value is republished; nothing here mutates runtime state
//! directly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{
    ConfigPatch, RuntimeConfig, ThresholdPreset, THRESHOLD_PRESET_OPTIONS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Switch,
    Select,
    Number,
    Sensor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub key: String,
    pub name: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl EntityDef {
    fn switch(key: &str, name: &str) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: EntityKind::Switch,
            unit: None,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
        }
    }

    fn number(key: &str, name: &str, unit: Option<&str>, min: f64, max: f64, step: f64) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: EntityKind::Number,
            unit: unit.map(Into::into),
            min: Some(min),
            max: Some(max),
            step: Some(step),
            options: Vec::new(),
        }
    }

    fn select(key: &str, name: &str, options: &[&str]) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: EntityKind::Select,
            unit: None,
            min: None,
            max: None,
            step: None,
            options: options.iter().map(|&o| o.into()).collect(),
        }
    }

    fn sensor(key: &str, name: &str, unit: Option<&str>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: EntityKind::Sensor,
            unit: unit.map(Into::into),
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
        }
    }
}

/// The full control surface registered with the hub.
pub fn entity_defs() -> Vec<EntityDef> {
    vec![
        EntityDef::select(
            "wake_word_threshold_preset",
            "WW Threshold Preset",
            THRESHOLD_PRESET_OPTIONS,
        ),
        EntityDef::number("wake_word_threshold", "WW Threshold", Some("%"), 10.0, 95.0, 1.0),
        EntityDef::switch("wake_word_detection", "WW Detection"),
        EntityDef::switch("mute", "Mute"),
        EntityDef::switch("distance_activation", "DIST Activation"),
        EntityDef::number(
            "distance_activation_threshold_mm",
            "DIST Activation Threshold",
            Some("mm"),
            10.0,
            2000.0,
            5.0,
        ),
        EntityDef::switch("vision_enabled", "VIS Enabled"),
        EntityDef::switch("attention_required", "VIS Attention Required"),
        EntityDef::number("vision_cooldown_s", "VIS Cooldown", Some("s"), 0.5, 15.0, 0.5),
        EntityDef::number(
            "vision_min_confidence",
            "VIS Min Confidence",
            None,
            0.0,
            1.0,
            0.05,
        ),
        EntityDef::number(
            "engaged_vad_window_s",
            "VAD Engaged Window",
            Some("s"),
            0.5,
            10.0,
            0.5,
        ),
        EntityDef::switch("enable_thinking_sound", "AUD Thinking Sound"),
        EntityDef::number("volume", "AUD Speaker Volume", Some("%"), 0.0, 100.0, 1.0),
        EntityDef::sensor("distance", "DIST Distance", Some("mm")),
        EntityDef::sensor("last_attention_state", "DIAG Last Attention State", None),
        EntityDef::sensor(
            "last_vision_latency_ms",
            "DIAG Last Vision Latency",
            Some("ms"),
        ),
        EntityDef::sensor("last_vision_error", "DIAG Last Vision Error", None),
    ]
}

/// A validated entity write, ready for the event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    Patch(ConfigPatch),
    SetMuted(bool),
    SetVolume(f64),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WriteError {
    #[error("unknown entity: {0}")]
    UnknownKey(String),
    #[error("entity {0} is read-only")]
    ReadOnly(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, WriteError> {
    value.as_bool().ok_or_else(|| WriteError::Invalid {
        key: key.into(),
        reason: "expected a boolean".into(),
    })
}

fn expect_number(key: &str, value: &Value, min: f64, max: f64) -> Result<f64, WriteError> {
    let number = value.as_f64().ok_or_else(|| WriteError::Invalid {
        key: key.into(),
        reason: "expected a number".into(),
    })?;
    if !(min..=max).contains(&number) {
        return Err(WriteError::Invalid {
            key: key.into(),
            reason: format!("{number} outside [{min}, {max}]"),
        });
    }
    Ok(number)
}

/// Handler table: map one hub write onto a typed mutation, validating
/// against the entity's declared range.
pub fn dispatch_write(key: &str, value: &Value) -> Result<EntityWrite, WriteError> {
    match key {
        "wake_word_threshold_preset" => {
            let name = value.as_str().ok_or_else(|| WriteError::Invalid {
                key: key.into(),
                reason: "expected an option string".into(),
            })?;
            let preset = ThresholdPreset::from_name(name).ok_or_else(|| WriteError::Invalid {
                key: key.into(),
                reason: format!("unknown preset {name:?}"),
            })?;
            Ok(EntityWrite::Patch(ConfigPatch::ThresholdPreset(preset)))
        }
        // Exposed as a percent slider; stored as a fraction.
        "wake_word_threshold" => {
            let percent = expect_number(key, value, 10.0, 95.0)?;
            Ok(EntityWrite::Patch(ConfigPatch::CustomThreshold(
                percent / 100.0,
            )))
        }
        "wake_word_detection" => Ok(EntityWrite::Patch(ConfigPatch::WakeWordDetection(
            expect_bool(key, value)?,
        ))),
        "mute" => Ok(EntityWrite::SetMuted(expect_bool(key, value)?)),
        "distance_activation" => Ok(EntityWrite::Patch(ConfigPatch::DistanceActivation(
            expect_bool(key, value)?,
        ))),
        "distance_activation_threshold_mm" => Ok(EntityWrite::Patch(
            ConfigPatch::DistanceThresholdMm(expect_number(key, value, 10.0, 2000.0)?),
        )),
        "vision_enabled" => Ok(EntityWrite::Patch(ConfigPatch::VisionEnabled(expect_bool(
            key, value,
        )?))),
        "attention_required" => Ok(EntityWrite::Patch(ConfigPatch::AttentionRequired(
            expect_bool(key, value)?,
        ))),
        "vision_cooldown_s" => Ok(EntityWrite::Patch(ConfigPatch::VisionCooldownS(
            expect_number(key, value, 0.5, 15.0)?,
        ))),
        "vision_min_confidence" => Ok(EntityWrite::Patch(ConfigPatch::VisionMinConfidence(
            expect_number(key, value, 0.0, 1.0)?,
        ))),
        "engaged_vad_window_s" => Ok(EntityWrite::Patch(ConfigPatch::EngagedVadWindowS(
            expect_number(key, value, 0.5, 10.0)?,
        ))),
        "enable_thinking_sound" => Ok(EntityWrite::Patch(ConfigPatch::ThinkingSound(
            expect_bool(key, value)?,
        ))),
        "volume" => Ok(EntityWrite::SetVolume(expect_number(key, value, 0.0, 100.0)?)),
        "distance" | "last_attention_state" | "last_vision_latency_ms" | "last_vision_error" => {
            Err(WriteError::ReadOnly(key.into()))
        }
        other => Err(WriteError::UnknownKey(other.into())),
    }
}

/// Diagnostics surfaced through the sensor entities.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub attention_state: String,
    pub vision_latency_ms: f64,
    pub vision_error: String,
    pub distance_mm: Option<f64>,
}

/// Current value of every entity, for the full publish after a (re)connect
/// and for incremental pushes.
pub fn entity_states(
    cfg: &RuntimeConfig,
    diag: &Diagnostics,
    muted: bool,
    volume: f64,
) -> Vec<(String, Value)> {
    vec![
        (
            "wake_word_threshold_preset".into(),
            json!(cfg.threshold_preset.name()),
        ),
        (
            "wake_word_threshold".into(),
            json!((cfg.custom_threshold * 100.0).round()),
        ),
        ("wake_word_detection".into(), json!(cfg.wake_word_detection)),
        ("mute".into(), json!(muted)),
        ("distance_activation".into(), json!(cfg.distance_activation)),
        (
            "distance_activation_threshold_mm".into(),
            json!(cfg.distance_threshold_mm),
        ),
        ("vision_enabled".into(), json!(cfg.vision_enabled)),
        ("attention_required".into(), json!(cfg.attention_required)),
        (
            "vision_cooldown_s".into(),
            json!(cfg.vision_cooldown.as_secs_f64()),
        ),
        (
            "vision_min_confidence".into(),
            json!(cfg.vision_min_confidence),
        ),
        (
            "engaged_vad_window_s".into(),
            json!(cfg.engaged_vad_window.as_secs_f64()),
        ),
        ("enable_thinking_sound".into(), json!(cfg.thinking_sound)),
        ("volume".into(), json!(volume)),
        ("distance".into(), json!(diag.distance_mm)),
        (
            "last_attention_state".into(),
            json!(diag.attention_state),
        ),
        (
            "last_vision_latency_ms".into(),
            json!(diag.vision_latency_ms),
        ),
        ("last_vision_error".into(), json!(diag.vision_error)),
    ]
}
