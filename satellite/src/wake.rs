//! Wake-word scoring.
//!
//! Models are registered from wake-word directories: each `<id>.json` config
//! names the phrase and an optional default probability cutoff. Inference
//! kernels are score producers behind [`ScoreProducer`]; the built-in
//! producer is a smoothed RMS-energy detector. A model whose config cannot
//! be loaded is disabled with a single log line and never halts the scorer.
//!
//! The scorer runs on its own OS thread, consuming capture blocks from the
//! bounded queue and emitting `WakeWord` triggers onto the event queue.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::{AudioBlock, BlockQueue};
use crate::config::RuntimeConfig;
use crate::events::{Event, TriggerSource};

/// Debug score lines are throttled to one per model per this interval.
const SCORE_LOG_INTERVAL: Duration = Duration::from_millis(300);

/// Produces a smoothed activation score in `[0, 1]` for each audio block.
/// Inference kernels implement this; the crate ships an energy-based
/// reference producer.
pub trait ScoreProducer: Send {
    fn process(&mut self, samples: &[i16]) -> Option<f32>;
}

/// Smoothed RMS energy mapped into a score. Useful as a stand-in producer
/// and for hardware bring-up; not a phrase detector.
pub struct EnergyScorer {
    smoothed: f32,
}

impl EnergyScorer {
    /// Full-scale RMS that maps to score 1.0.
    const FULL_SCALE: f32 = 0.12;
    const SMOOTHING: f32 = 0.35;

    pub fn new() -> Self {
        Self { smoothed: 0.0 }
    }
}

impl ScoreProducer for EnergyScorer {
    fn process(&mut self, samples: &[i16]) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }
        let sum_squares: f64 = samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32768.0;
                v * v
            })
            .sum();
        let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
        let instant = (rms / Self::FULL_SCALE).clamp(0.0, 1.0);
        self.smoothed = self.smoothed * (1.0 - Self::SMOOTHING) + instant * Self::SMOOTHING;
        Some(self.smoothed)
    }
}

/// On-disk model config, one JSON file per model.
#[derive(Debug, Clone, Deserialize)]
pub struct WakeModelSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub wake_word: String,
    #[serde(default)]
    pub trained_languages: Vec<String>,
    #[serde(default)]
    pub probability_cutoff: Option<f64>,
}

pub struct WakeModel {
    pub id: String,
    pub spec: WakeModelSpec,
    producer: Box<dyn ScoreProducer>,
    last_score_log: Option<Instant>,
}

impl WakeModel {
    pub fn new(id: String, spec: WakeModelSpec, producer: Box<dyn ScoreProducer>) -> Self {
        Self {
            id,
            spec,
            producer,
            last_score_log: None,
        }
    }

    /// The model's own cutoff, used when the preset is `ModelDefault`.
    pub fn default_threshold(&self) -> f64 {
        self.spec.probability_cutoff.unwrap_or(0.50)
    }
}

/// Scan wake-word directories for model configs. Unreadable configs and
/// models without a usable producer are disabled, each logged once.
pub fn discover_models(dirs: &[impl AsRef<Path>]) -> Vec<WakeModel> {
    let mut models = Vec::new();

    for dir in dirs {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(?dir, ?err, "skipping unreadable wake-word dir");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let spec = match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<WakeModelSpec>(&text).map_err(Into::into))
            {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(model = id, ?path, %err, "disabling wake model: bad config");
                    continue;
                }
            };

            let Some(producer) = producer_for(&spec) else {
                warn!(
                    model = id,
                    kind = %spec.kind,
                    "disabling wake model: no inference backend for this type"
                );
                continue;
            };

            info!(model = id, phrase = %spec.wake_word, "wake model registered");
            models.push(WakeModel::new(id.to_owned(), spec, producer));
        }
    }

    models
}

fn producer_for(spec: &WakeModelSpec) -> Option<Box<dyn ScoreProducer>> {
    match spec.kind.as_str() {
        "energy" => Some(Box::new(EnergyScorer::new())),
        _ => None,
    }
}

/// How often the wake-word directories are rescanned for new models.
const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// The scoring loop state. Kept separate from the thread shell so tests can
/// drive it block by block.
pub struct Scorer {
    models: Vec<WakeModel>,
    dirs: Vec<std::path::PathBuf>,
    cfg: watch::Receiver<Arc<RuntimeConfig>>,
    refractory: Duration,
    last_activation: Option<Instant>,
    last_rescan: Option<Instant>,
}

impl Scorer {
    pub fn new(
        models: Vec<WakeModel>,
        dirs: Vec<std::path::PathBuf>,
        cfg: watch::Receiver<Arc<RuntimeConfig>>,
        refractory: Duration,
    ) -> Self {
        Self {
            models,
            dirs,
            cfg,
            refractory,
            last_activation: None,
            last_rescan: None,
        }
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Pick up models dropped into the wake-word directories since startup.
    /// Known ids keep their state; only new ids are registered.
    fn maybe_rescan(&mut self, now: Instant) {
        let due = self
            .last_rescan
            .map(|at| now.duration_since(at) >= RESCAN_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_rescan = Some(now);

        for candidate in discover_models(&self.dirs) {
            if self.models.iter().all(|m| m.id != candidate.id) {
                info!(model = %candidate.id, "registering newly added wake model");
                self.models.push(candidate);
            }
        }
    }

    /// Score one block against every model. Returns the winning trigger, if
    /// any.
    pub fn step(&mut self, block: &AudioBlock) -> Option<TriggerSource> {
        self.maybe_rescan(block.ts);

        let cfg = self.cfg.borrow().clone();
        if !cfg.wake_word_detection {
            return None;
        }

        let preset_threshold = cfg.effective_wake_threshold();
        let now = block.ts;

        for model in &mut self.models {
            let Some(score) = model.producer.process(&block.samples) else {
                continue;
            };
            let threshold = preset_threshold.unwrap_or_else(|| model.default_threshold()) as f32;
            let activated = score >= threshold;

            let should_log = model
                .last_score_log
                .map(|at| now.duration_since(at) >= SCORE_LOG_INTERVAL)
                .unwrap_or(true);
            if should_log {
                debug!(
                    model = %model.id,
                    score = format_args!("{:.1}%", score * 100.0),
                    threshold = format_args!("{:.1}%", threshold * 100.0),
                    result = if activated { "triggered" } else { "not_triggered" },
                    "wake score"
                );
                model.last_score_log = Some(now);
            }

            if !activated {
                continue;
            }

            let refractory_open = self
                .last_activation
                .map(|at| now.duration_since(at) > self.refractory)
                .unwrap_or(true);
            if !refractory_open {
                continue;
            }

            self.last_activation = Some(now);
            return Some(TriggerSource::WakeWord {
                model_id: model.id.clone(),
                score,
            });
        }

        None
    }
}

/// Run the scorer until the capture queue closes. Blocking; call from a
/// dedicated thread.
pub fn run_scorer(queue: Arc<BlockQueue>, mut scorer: Scorer, events: mpsc::Sender<Event>) {
    info!(models = scorer.models.len(), "wake scorer running");
    while let Some(block) = queue.pop() {
        if let Some(trigger) = scorer.step(&block) {
            if events.blocking_send(Event::Trigger(trigger)).is_err() {
                break;
            }
        }
    }
    info!("wake scorer stopped");
}
