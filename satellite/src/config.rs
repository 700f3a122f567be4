//! Configuration loading and the runtime settings snapshot.
//!
//! The config file is JSON with `core` / `visd` / `frontpaneld` sections.
//! Unknown keys are warned about and ignored; invalid values refuse startup.
//! Trigger-related keys are optional overrides: when present they win over
//! the persisted preference, when absent the preference value is used.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::preferences::Preferences;

pub const DEFAULT_CONFIG_PATH: &str = "/home/user/linux-voice-assistant/config.json";

/// Named wake-word threshold presets. `ModelDefault` defers to each model's
/// built-in cutoff; `Custom` defers to the numeric slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThresholdPreset {
    #[default]
    ModelDefault,
    Strict,
    Default,
    Sensitive,
    VerySensitive,
    Custom,
}

pub const THRESHOLD_PRESET_OPTIONS: &[&str] = &[
    "ModelDefault",
    "Strict",
    "Default",
    "Sensitive",
    "VerySensitive",
    "Custom",
];

pub const WAKE_THRESHOLD_MIN: f64 = 0.10;
pub const WAKE_THRESHOLD_MAX: f64 = 0.95;

impl ThresholdPreset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ModelDefault" => Some(Self::ModelDefault),
            "Strict" => Some(Self::Strict),
            "Default" => Some(Self::Default),
            "Sensitive" => Some(Self::Sensitive),
            "VerySensitive" => Some(Self::VerySensitive),
            "Custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ModelDefault => "ModelDefault",
            Self::Strict => "Strict",
            Self::Default => "Default",
            Self::Sensitive => "Sensitive",
            Self::VerySensitive => "VerySensitive",
            Self::Custom => "Custom",
        }
    }

    /// Resolve the effective threshold. `None` means "use each model's own
    /// default".
    pub fn resolve(self, custom: f64) -> Option<f64> {
        match self {
            Self::ModelDefault => None,
            Self::Strict => Some(0.60),
            Self::Default => Some(0.50),
            Self::Sensitive => Some(0.45),
            Self::VerySensitive => Some(0.40),
            Self::Custom => Some(custom.clamp(WAKE_THRESHOLD_MIN, WAKE_THRESHOLD_MAX)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub name: String,
    pub hub_host: String,
    pub hub_port: u16,
    pub audio_input_device: Option<String>,
    pub audio_input_block_size: usize,
    pub audio_output_device: Option<String>,
    pub system_volume_device: Option<String>,
    pub wake_word_dirs: Vec<String>,
    pub wake_model: String,
    pub refractory_seconds: f64,
    pub wakeup_sound: String,
    pub processing_sound: String,
    pub mute_sound: String,
    pub unmute_sound: String,
    pub preferences_file: String,
    pub vision_fallback_on_error: bool,
    pub log_level: String,

    // Optional trigger overrides; `None` defers to the persisted preference.
    pub wake_word_detection: Option<bool>,
    pub distance_activation: Option<bool>,
    pub distance_activation_threshold_mm: Option<f64>,
    pub distance_sensor_model: Option<String>,
    pub vision_enabled: Option<bool>,
    pub attention_required: Option<bool>,
    pub vision_cooldown_s: Option<f64>,
    pub vision_min_confidence: Option<f64>,
    pub engaged_vad_window_s: Option<f64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: "LinuxVoiceAssistant".into(),
            hub_host: "127.0.0.1".into(),
            hub_port: 6053,
            audio_input_device: None,
            audio_input_block_size: 1024,
            audio_output_device: None,
            system_volume_device: None,
            wake_word_dirs: vec!["wakewords".into()],
            wake_model: "okay_nabu".into(),
            refractory_seconds: 2.0,
            wakeup_sound: "sounds/wake_word_triggered.flac".into(),
            processing_sound: "sounds/processing.wav".into(),
            mute_sound: "sounds/mute_switch_on.flac".into(),
            unmute_sound: "sounds/mute_switch_off.flac".into(),
            preferences_file: "preferences.json".into(),
            vision_fallback_on_error: true,
            log_level: "info".into(),
            wake_word_detection: None,
            distance_activation: None,
            distance_activation_threshold_mm: None,
            distance_sensor_model: None,
            vision_enabled: None,
            attention_required: None,
            vision_cooldown_s: None,
            vision_min_confidence: None,
            engaged_vad_window_s: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisdConfig {
    pub camera_index: u32,
    pub burst_seconds: f64,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub log_level: String,
}

impl Default for VisdConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            burst_seconds: 0.9,
            frame_count: 5,
            width: 320,
            height: 240,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontpaneldConfig {
    pub mute_pin: u32,
    pub wake_pin: u32,
    pub vol_up_pin: u32,
    pub vol_down_pin: u32,
    pub enc_a_pin: u32,
    pub enc_b_pin: u32,
    pub log_level: String,
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub core: CoreConfig,
    pub visd: VisdConfig,
    pub frontpaneld: FrontpaneldConfig,
}

impl AppConfig {
    /// Startup validation. Invalid values refuse to run rather than being
    /// silently clamped.
    pub fn validate(&self) -> Result<()> {
        let core = &self.core;
        if core.audio_input_block_size == 0 {
            bail!("core.audio_input_block_size must be positive");
        }
        if core.hub_port == 0 {
            bail!("core.hub_port must be non-zero");
        }
        if core.refractory_seconds < 0.0 {
            bail!("core.refractory_seconds must not be negative");
        }
        if let Some(mm) = core.distance_activation_threshold_mm {
            if !(10.0..=2000.0).contains(&mm) {
                bail!("core.distance_activation_threshold_mm must be in [10, 2000]");
            }
        }
        if let Some(model) = core.distance_sensor_model.as_deref() {
            if model != "l0x" && model != "l1x" {
                bail!("core.distance_sensor_model must be \"l0x\" or \"l1x\"");
            }
        }
        if let Some(cooldown) = core.vision_cooldown_s {
            if !(0.5..=15.0).contains(&cooldown) {
                bail!("core.vision_cooldown_s must be in [0.5, 15.0]");
            }
        }
        if let Some(conf) = core.vision_min_confidence {
            if !(0.0..=1.0).contains(&conf) {
                bail!("core.vision_min_confidence must be in [0, 1]");
            }
        }
        if let Some(window) = core.engaged_vad_window_s {
            if !(0.5..=10.0).contains(&window) {
                bail!("core.engaged_vad_window_s must be in [0.5, 10.0]");
            }
        }
        Ok(())
    }

    /// Preferences live next to the config file unless an absolute path was
    /// configured.
    pub fn preferences_path(&self, config_path: &Path) -> PathBuf {
        let configured = Path::new(&self.core.preferences_file);
        if configured.is_absolute() {
            return configured.to_owned();
        }
        match config_path.parent() {
            Some(parent) => parent.join(configured),
            None => configured.to_owned(),
        }
    }
}

/// Path resolution: `LVA_CONFIG_PATH` wins, otherwise the installed default.
pub fn config_path() -> PathBuf {
    match std::env::var("LVA_CONFIG_PATH") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Load the config file, creating it with defaults when missing.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let config = AppConfig::default();
        if let Err(err) = write_default(path, &config) {
            warn!(?path, ?err, "could not write default config, using built-in defaults");
        } else {
            info!(?path, "created default config");
        }
        return Ok(config);
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in config {}", path.display()))?;
    let Value::Object(ref sections) = value else {
        bail!("config {} must be a JSON object", path.display());
    };

    warn_unknown_keys(
        "",
        sections,
        &["core".into(), "visd".into(), "frontpaneld".into()],
    );
    if let Some(Value::Object(core)) = sections.get("core") {
        warn_unknown_keys("core", core, &known_keys::<CoreConfig>()?);
    }
    if let Some(Value::Object(visd)) = sections.get("visd") {
        warn_unknown_keys("visd", visd, &known_keys::<VisdConfig>()?);
    }
    if let Some(Value::Object(panel)) = sections.get("frontpaneld") {
        warn_unknown_keys("frontpaneld", panel, &known_keys::<FrontpaneldConfig>()?);
    }

    let config: AppConfig = serde_json::from_value(value)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn write_default(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Derive the recognized key set of a section from its default serialization,
/// so the warning list can never drift from the struct.
fn known_keys<T: Default + Serialize>() -> Result<Vec<String>> {
    let value = serde_json::to_value(T::default())?;
    let Value::Object(map) = value else {
        bail!("config section did not serialize to an object");
    };
    Ok(map.keys().cloned().collect())
}

fn warn_unknown_keys(section: &str, map: &serde_json::Map<String, Value>, known: &[String]) {
    let known: BTreeSet<&str> = known.iter().map(String::as_str).collect();
    for key in map.keys() {
        if !known.contains(key.as_str()) {
            if section.is_empty() {
                warn!(key = %key, "ignoring unknown config section");
            } else {
                warn!(section = %section, key = %key, "ignoring unknown config key");
            }
        }
    }
}

/// The immutable settings snapshot the event loop publishes after each
/// mutation. Tasks hold an `Arc` and re-read on change notifications; nothing
/// mutates it in place.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub wake_word_detection: bool,
    pub distance_activation: bool,
    pub distance_threshold_mm: f64,
    pub distance_sensor_model: String,
    pub activation_sound: bool,
    pub vision_enabled: bool,
    pub attention_required: bool,
    pub vision_fallback_on_error: bool,
    pub vision_cooldown: Duration,
    pub vision_min_confidence: f64,
    pub engaged_vad_window: Duration,
    pub thinking_sound: bool,
    pub threshold_preset: ThresholdPreset,
    pub custom_threshold: f64,
}

impl RuntimeConfig {
    /// Merge persisted preferences with startup overrides from the config
    /// file.
    pub fn from_startup(core: &CoreConfig, prefs: &Preferences) -> Self {
        Self {
            wake_word_detection: core.wake_word_detection.unwrap_or(prefs.wake_word_detection),
            distance_activation: core.distance_activation.unwrap_or(prefs.distance_activation),
            distance_threshold_mm: core
                .distance_activation_threshold_mm
                .unwrap_or(prefs.distance_activation_threshold_mm)
                .clamp(10.0, 2000.0),
            distance_sensor_model: core
                .distance_sensor_model
                .clone()
                .unwrap_or_else(|| prefs.distance_sensor_model.clone()),
            activation_sound: prefs.distance_activation_sound,
            vision_enabled: core.vision_enabled.unwrap_or(prefs.vision_enabled),
            attention_required: core.attention_required.unwrap_or(prefs.attention_required),
            vision_fallback_on_error: core.vision_fallback_on_error,
            vision_cooldown: Duration::from_secs_f64(
                core.vision_cooldown_s
                    .unwrap_or(prefs.vision_cooldown_s)
                    .clamp(0.5, 15.0),
            ),
            vision_min_confidence: core
                .vision_min_confidence
                .unwrap_or(prefs.vision_min_confidence)
                .clamp(0.0, 1.0),
            engaged_vad_window: Duration::from_secs_f64(
                core.engaged_vad_window_s
                    .unwrap_or(prefs.engaged_vad_window_s)
                    .clamp(0.5, 10.0),
            ),
            thinking_sound: prefs.thinking_sound,
            threshold_preset: prefs.wake_word_threshold_preset,
            custom_threshold: prefs
                .wake_word_threshold_custom
                .clamp(WAKE_THRESHOLD_MIN, WAKE_THRESHOLD_MAX),
        }
    }

    pub fn effective_wake_threshold(&self) -> Option<f64> {
        self.threshold_preset.resolve(self.custom_threshold)
    }

    /// Produce a new snapshot with one setting changed. Values are clamped
    /// into their entity ranges; the caller already rejected writes that are
    /// not parseable at all.
    pub fn with_patch(&self, patch: &ConfigPatch) -> Self {
        let mut next = self.clone();
        match patch {
            ConfigPatch::WakeWordDetection(v) => next.wake_word_detection = *v,
            ConfigPatch::DistanceActivation(v) => next.distance_activation = *v,
            ConfigPatch::DistanceThresholdMm(v) => {
                next.distance_threshold_mm = v.clamp(10.0, 2000.0);
            }
            ConfigPatch::ActivationSound(v) => next.activation_sound = *v,
            ConfigPatch::VisionEnabled(v) => next.vision_enabled = *v,
            ConfigPatch::AttentionRequired(v) => next.attention_required = *v,
            ConfigPatch::VisionCooldownS(v) => {
                next.vision_cooldown = Duration::from_secs_f64(v.clamp(0.5, 15.0));
            }
            ConfigPatch::VisionMinConfidence(v) => {
                next.vision_min_confidence = v.clamp(0.0, 1.0);
            }
            ConfigPatch::EngagedVadWindowS(v) => {
                next.engaged_vad_window = Duration::from_secs_f64(v.clamp(0.5, 10.0));
            }
            ConfigPatch::ThinkingSound(v) => next.thinking_sound = *v,
            ConfigPatch::ThresholdPreset(preset) => next.threshold_preset = *preset,
            ConfigPatch::CustomThreshold(v) => {
                next.custom_threshold = v.clamp(WAKE_THRESHOLD_MIN, WAKE_THRESHOLD_MAX);
                next.threshold_preset = ThresholdPreset::Custom;
            }
        }
        next
    }
}

/// One runtime setting changed by a hub entity write. Writes never mutate
/// shared state directly; they travel the event queue as patches and the
/// event loop publishes the resulting snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigPatch {
    WakeWordDetection(bool),
    DistanceActivation(bool),
    DistanceThresholdMm(f64),
    ActivationSound(bool),
    VisionEnabled(bool),
    AttentionRequired(bool),
    VisionCooldownS(f64),
    VisionMinConfidence(f64),
    EngagedVadWindowS(f64),
    ThinkingSound(bool),
    ThresholdPreset(ThresholdPreset),
    CustomThreshold(f64),
}
