//! Distance-based activation trigger.
//!
//! The low-level VL53L0X/VL53L1X register drivers live in the kernel; this
//! module consumes their IIO interface and treats the sensor as "millimetres
//! or nothing". When no matching IIO device exists the trigger degrades to a
//! null reader with a warning and distance activation stays dormant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::events::{Event, TriggerSource};
use crate::state::SessionState;

/// Sustained time below the threshold before a trigger fires.
const DEBOUNCE_HOLD: Duration = Duration::from_millis(250);

/// Consecutive read failures before the sensor is reinitialized.
const REINIT_AFTER_FAILURES: u32 = 3;

/// Sensor value publish interval (0.2 Hz).
const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// A distance source returning millimetres, or `None` on a failed read.
pub trait DistanceReader: Send {
    fn read_mm(&mut self) -> Option<f64>;

    /// Re-probe the hardware after repeated failures. Returns whether a
    /// device is available afterwards.
    fn reinit(&mut self) -> bool;
}

/// Always-absent reader used when no sensor hardware exists.
pub struct NullReader;

impl DistanceReader for NullReader {
    fn read_mm(&mut self) -> Option<f64> {
        None
    }

    fn reinit(&mut self) -> bool {
        false
    }
}

/// Reads a VL53L0X/VL53L1X through the kernel IIO driver
/// (`/sys/bus/iio/devices/iio:deviceN/in_distance_raw`, millimetres).
pub struct IioReader {
    sensor_name: String,
    iio_root: PathBuf,
    raw_path: Option<PathBuf>,
}

impl IioReader {
    pub fn probe(sensor_model: &str, iio_root: impl Into<PathBuf>) -> Option<Self> {
        let sensor_name = match sensor_model {
            "l1x" => "vl53l1x".to_owned(),
            _ => "vl53l0x".to_owned(),
        };
        let mut reader = Self {
            sensor_name,
            iio_root: iio_root.into(),
            raw_path: None,
        };
        if reader.reinit() {
            Some(reader)
        } else {
            None
        }
    }

    fn scan(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.iio_root).ok()?;
        for entry in entries.flatten() {
            let device_dir = entry.path();
            let name = std::fs::read_to_string(device_dir.join("name")).unwrap_or_default();
            if name.trim() == self.sensor_name {
                let raw = device_dir.join("in_distance_raw");
                if raw.exists() {
                    return Some(raw);
                }
            }
        }
        None
    }
}

impl DistanceReader for IioReader {
    fn read_mm(&mut self) -> Option<f64> {
        let path = self.raw_path.as_ref()?;
        let text = std::fs::read_to_string(path).ok()?;
        text.trim().parse::<f64>().ok()
    }

    fn reinit(&mut self) -> bool {
        self.raw_path = self.scan();
        if self.raw_path.is_some() {
            debug!(sensor = %self.sensor_name, path = ?self.raw_path, "distance sensor ready");
        }
        self.raw_path.is_some()
    }
}

/// Open the configured sensor, falling back to the null reader when the
/// hardware is absent.
pub fn open_reader(sensor_model: &str) -> Box<dyn DistanceReader> {
    match IioReader::probe(sensor_model, "/sys/bus/iio/devices") {
        Some(reader) => Box::new(reader),
        None => {
            warn!(
                sensor_model,
                "no distance sensor found, distance activation unavailable"
            );
            Box::new(NullReader)
        }
    }
}

/// Sticky crossing debounce: the reading must stay below the threshold for
/// [`DEBOUNCE_HOLD`] before one trigger fires, then the latch holds until
/// the reading rises back above the threshold.
pub struct Debouncer {
    below_since: Option<Instant>,
    latched: bool,
}

impl Debouncer {
    pub fn new() -> Self {
        Self {
            below_since: None,
            latched: false,
        }
    }

    /// Feed one reading; returns true exactly when a trigger should fire.
    pub fn update(&mut self, below_threshold: bool, now: Instant) -> bool {
        if !below_threshold {
            self.below_since = None;
            self.latched = false;
            return false;
        }
        if self.latched {
            return false;
        }
        match self.below_since {
            None => {
                self.below_since = Some(now);
                false
            }
            Some(since) => {
                if now.duration_since(since) >= DEBOUNCE_HOLD {
                    self.latched = true;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Wraps a reader with the three-strikes reinitialization policy. Failures
/// never propagate to the core.
pub struct Supervisor {
    reader: Box<dyn DistanceReader>,
    consecutive_failures: u32,
}

impl Supervisor {
    pub fn new(reader: Box<dyn DistanceReader>) -> Self {
        Self {
            reader,
            consecutive_failures: 0,
        }
    }

    pub fn read(&mut self) -> Option<f64> {
        match self.reader.read_mm() {
            Some(mm) => {
                self.consecutive_failures = 0;
                Some(mm)
            }
            None => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= REINIT_AFTER_FAILURES {
                    debug!(
                        failures = self.consecutive_failures,
                        "reinitializing distance sensor"
                    );
                    self.reader.reinit();
                    self.consecutive_failures = 0;
                }
                None
            }
        }
    }
}

/// Poll loop: 1 Hz while idle, 5 Hz while an activation is in progress.
/// Emits `Distance` triggers and a periodic sensor reading.
pub async fn run(
    reader: Box<dyn DistanceReader>,
    cfg_rx: watch::Receiver<Arc<RuntimeConfig>>,
    state_rx: watch::Receiver<SessionState>,
    events: mpsc::Sender<Event>,
) {
    let mut supervisor = Supervisor::new(reader);
    let mut debouncer = Debouncer::new();
    let mut last_publish: Option<Instant> = None;

    info!("distance trigger running");
    loop {
        let now = Instant::now();
        let cfg = cfg_rx.borrow().clone();
        let reading = supervisor.read();

        if cfg.distance_activation {
            let below = reading
                .map(|mm| mm <= cfg.distance_threshold_mm.max(1.0))
                .unwrap_or(false);
            if debouncer.update(below, now) {
                let mm = reading.unwrap_or(cfg.distance_threshold_mm);
                debug!(mm, "distance trigger fired");
                if events.send(Event::Trigger(TriggerSource::Distance { mm })).await.is_err() {
                    break;
                }
            }
        } else {
            debouncer.update(false, now);
        }

        let due = last_publish
            .map(|at| now.duration_since(at) >= PUBLISH_INTERVAL)
            .unwrap_or(true);
        if due {
            last_publish = Some(now);
            if events.send(Event::DistanceReading(reading)).await.is_err() {
                break;
            }
        }

        let interval = match *state_rx.borrow() {
            SessionState::Idle => Duration::from_secs(1),
            _ => Duration::from_millis(200),
        };
        tokio::time::sleep(interval).await;
    }
}
