//! Persisted user preferences.
//!
//! A small subset of the runtime settings survives restarts. Writes are
//! atomic: serialize to `preferences.json.tmp`, fsync, rename over the real
//! file, so a crash can never leave a partial file behind.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ThresholdPreset, RuntimeConfig, WAKE_THRESHOLD_MAX, WAKE_THRESHOLD_MIN};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub active_wake_words: Vec<String>,
    pub thinking_sound: bool,
    pub wake_word_detection: bool,
    pub distance_activation: bool,
    pub distance_activation_sound: bool,
    pub distance_activation_threshold_mm: f64,
    pub distance_sensor_model: String,
    pub vision_enabled: bool,
    pub attention_required: bool,
    pub vision_cooldown_s: f64,
    pub vision_min_confidence: f64,
    pub engaged_vad_window_s: f64,
    pub wake_word_threshold_preset: ThresholdPreset,
    pub wake_word_threshold_custom: f64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            active_wake_words: Vec::new(),
            thinking_sound: false,
            wake_word_detection: true,
            distance_activation: false,
            distance_activation_sound: true,
            distance_activation_threshold_mm: 120.0,
            distance_sensor_model: "l0x".into(),
            vision_enabled: true,
            attention_required: true,
            vision_cooldown_s: 4.0,
            vision_min_confidence: 0.60,
            engaged_vad_window_s: 2.5,
            wake_word_threshold_preset: ThresholdPreset::ModelDefault,
            wake_word_threshold_custom: 0.50,
        }
    }
}

impl Preferences {
    /// Load preferences, falling back to defaults when the file is missing.
    /// A corrupt file is an error: refusing to run beats silently resetting
    /// the user's settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(?path, "no preferences file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preferences {}", path.display()))?;
        let mut prefs: Preferences = serde_json::from_str(&text)
            .with_context(|| format!("invalid preferences {}", path.display()))?;
        prefs.normalize();
        Ok(prefs)
    }

    /// Atomic write: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        debug!(?path, "saving preferences");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let text = serde_json::to_string_pretty(self)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Pull the persisted subset back out of a runtime snapshot after an
    /// entity write changed something.
    pub fn absorb(&mut self, runtime: &RuntimeConfig) {
        self.thinking_sound = runtime.thinking_sound;
        self.wake_word_detection = runtime.wake_word_detection;
        self.distance_activation = runtime.distance_activation;
        self.distance_activation_sound = runtime.activation_sound;
        self.distance_activation_threshold_mm = runtime.distance_threshold_mm;
        self.distance_sensor_model = runtime.distance_sensor_model.clone();
        self.vision_enabled = runtime.vision_enabled;
        self.attention_required = runtime.attention_required;
        self.vision_cooldown_s = runtime.vision_cooldown.as_secs_f64();
        self.vision_min_confidence = runtime.vision_min_confidence;
        self.engaged_vad_window_s = runtime.engaged_vad_window.as_secs_f64();
        self.wake_word_threshold_preset = runtime.threshold_preset;
        self.wake_word_threshold_custom = runtime.custom_threshold;
    }

    fn normalize(&mut self) {
        self.distance_activation_threshold_mm =
            self.distance_activation_threshold_mm.clamp(10.0, 2000.0);
        self.vision_cooldown_s = self.vision_cooldown_s.clamp(0.5, 15.0);
        self.vision_min_confidence = self.vision_min_confidence.clamp(0.0, 1.0);
        self.engaged_vad_window_s = self.engaged_vad_window_s.clamp(0.5, 10.0);
        self.wake_word_threshold_custom = self
            .wake_word_threshold_custom
            .clamp(WAKE_THRESHOLD_MIN, WAKE_THRESHOLD_MAX);
        if self.distance_sensor_model != "l0x" && self.distance_sensor_model != "l1x" {
            self.distance_sensor_model = "l0x".into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");

        let mut prefs = Preferences::default();
        prefs.distance_activation = true;
        prefs.wake_word_threshold_preset = ThresholdPreset::Custom;
        prefs.wake_word_threshold_custom = 0.42;
        prefs.save(&path).unwrap();

        let loaded = Preferences::load(&path).unwrap();
        assert_eq!(loaded, prefs);
        // The temp file must not linger after a successful rename.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Preferences::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, Preferences::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Preferences::load(&path).is_err());
    }

    #[test]
    fn out_of_range_values_are_normalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        std::fs::write(
            &path,
            r#"{"vision_min_confidence": 7.0, "distance_sensor_model": "bogus"}"#,
        )
        .unwrap();

        let loaded = Preferences::load(&path).unwrap();
        assert_eq!(loaded.vision_min_confidence, 1.0);
        assert_eq!(loaded.distance_sensor_model, "l0x");
    }
}
