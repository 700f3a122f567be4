//! Touch key and rotary encoder decoding.
//!
//! Pins are active-low with pull-ups: a pressed key reads low. Keys get a
//! 50-ms debounce before firing once per press; the encoder is decoded
//! through the quadrature transition table with an accumulator so a single
//! detent produces exactly one step.

use std::time::{Duration, Instant};

/// Debounce hold before a key press fires.
const KEY_DEBOUNCE: Duration = Duration::from_millis(50);

/// Minimum spacing between emitted encoder steps.
const ENCODER_EMIT_SPACING: Duration = Duration::from_millis(50);

/// Transitions per emitted encoder step.
const ENCODER_DETENT: i32 = 2;

/// Raw pin access. The GPIO character-device backend implements this; the
/// null panel stands in when the hardware is absent.
pub trait PanelInput: Send {
    /// Current level of a pin; `true` is high (not pressed).
    fn pin_level(&mut self, pin: u32) -> bool;
}

/// Used when no GPIO hardware is present: every pin floats high.
pub struct NullPanel;

impl PanelInput for NullPanel {
    fn pin_level(&mut self, _pin: u32) -> bool {
        true
    }
}

/// Logical commands produced by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelEvent {
    MuteToggle,
    ManualWake,
    VolumeUp,
    VolumeDown,
    /// Encoder movement; positive is clockwise.
    VolumeDelta(i32),
}

/// Per-key debounce state.
pub struct KeyDebouncer {
    level: bool,
    changed_at: Option<Instant>,
    fired: bool,
}

impl KeyDebouncer {
    pub fn new() -> Self {
        Self {
            level: true,
            changed_at: None,
            fired: false,
        }
    }

    /// Feed one sampled level; returns true when a debounced press fires.
    pub fn update(&mut self, level: bool, now: Instant) -> bool {
        if level != self.level {
            self.level = level;
            self.changed_at = Some(now);
            if level {
                self.fired = false;
            }
            return false;
        }

        if !level && !self.fired {
            let held = self
                .changed_at
                .map(|at| now.duration_since(at) >= KEY_DEBOUNCE)
                .unwrap_or(false);
            if held {
                self.fired = true;
                return true;
            }
        }
        false
    }
}

/// Quadrature decoder with detent accumulation and emit spacing.
pub struct EncoderDecoder {
    last_state: u8,
    accumulator: i32,
    last_emit: Option<Instant>,
}

impl EncoderDecoder {
    pub fn new(a: bool, b: bool) -> Self {
        Self {
            last_state: encode(a, b),
            accumulator: 0,
            last_emit: None,
        }
    }

    /// Feed one sample of the A/B lines; returns an emitted step direction.
    pub fn update(&mut self, a: bool, b: bool, now: Instant) -> Option<i32> {
        let state = encode(a, b);
        if state == self.last_state {
            return None;
        }

        let transition = (self.last_state << 2) | state;
        self.last_state = state;
        let direction = match transition {
            0b0001 | 0b0111 | 0b1110 | 0b1000 => 1,
            0b0010 | 0b0100 | 0b1101 | 0b1011 => -1,
            _ => 0,
        };
        if direction == 0 {
            return None;
        }

        self.accumulator += direction;
        if self.accumulator.abs() < ENCODER_DETENT {
            return None;
        }

        let spaced = self
            .last_emit
            .map(|at| now.duration_since(at) >= ENCODER_EMIT_SPACING)
            .unwrap_or(true);
        if !spaced {
            return None;
        }

        let emitted = if self.accumulator > 0 { 1 } else { -1 };
        self.accumulator = 0;
        self.last_emit = Some(now);
        Some(emitted)
    }
}

fn encode(a: bool, b: bool) -> u8 {
    ((a as u8) << 1) | (b as u8)
}

/// Pin assignment for one panel.
#[derive(Debug, Clone, Copy)]
pub struct PinMap {
    pub mute: u32,
    pub wake: u32,
    pub vol_up: u32,
    pub vol_down: u32,
    pub enc_a: u32,
    pub enc_b: u32,
}

/// Complete panel scanner: keys plus encoder over a [`PanelInput`].
pub struct PanelScanner<I: PanelInput> {
    input: I,
    pins: PinMap,
    mute: KeyDebouncer,
    wake: KeyDebouncer,
    vol_up: KeyDebouncer,
    vol_down: KeyDebouncer,
    encoder: EncoderDecoder,
}

impl<I: PanelInput> PanelScanner<I> {
    pub fn new(mut input: I, pins: PinMap) -> Self {
        let a = input.pin_level(pins.enc_a);
        let b = input.pin_level(pins.enc_b);
        Self {
            input,
            pins,
            mute: KeyDebouncer::new(),
            wake: KeyDebouncer::new(),
            vol_up: KeyDebouncer::new(),
            vol_down: KeyDebouncer::new(),
            encoder: EncoderDecoder::new(a, b),
        }
    }

    /// Sample all inputs once.
    pub fn poll(&mut self, now: Instant) -> Vec<PanelEvent> {
        let mut events = Vec::new();

        let mute_level = self.input.pin_level(self.pins.mute);
        if self.mute.update(mute_level, now) {
            events.push(PanelEvent::MuteToggle);
        }
        let wake_level = self.input.pin_level(self.pins.wake);
        if self.wake.update(wake_level, now) {
            events.push(PanelEvent::ManualWake);
        }
        let up_level = self.input.pin_level(self.pins.vol_up);
        if self.vol_up.update(up_level, now) {
            events.push(PanelEvent::VolumeUp);
        }
        let down_level = self.input.pin_level(self.pins.vol_down);
        if self.vol_down.update(down_level, now) {
            events.push(PanelEvent::VolumeDown);
        }

        let a = self.input.pin_level(self.pins.enc_a);
        let b = self.input.pin_level(self.pins.enc_b);
        if let Some(direction) = self.encoder.update(a, b, now) {
            events.push(PanelEvent::VolumeDelta(direction * 2));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_fires_once_after_debounce_hold() {
        let mut key = KeyDebouncer::new();
        let t0 = Instant::now();

        // Press: level change, then a sample inside the hold, then one past
        // it.
        assert!(!key.update(false, t0));
        assert!(!key.update(false, t0 + Duration::from_millis(20)));
        assert!(key.update(false, t0 + Duration::from_millis(60)));
        // Held down: no repeat.
        assert!(!key.update(false, t0 + Duration::from_millis(500)));

        // Release and press again: fires again.
        assert!(!key.update(true, t0 + Duration::from_millis(600)));
        assert!(!key.update(false, t0 + Duration::from_millis(700)));
        assert!(key.update(false, t0 + Duration::from_millis(760)));
    }

    #[test]
    fn contact_bounce_does_not_fire() {
        let mut key = KeyDebouncer::new();
        let t0 = Instant::now();

        assert!(!key.update(false, t0));
        // Bounces back high before the hold elapses.
        assert!(!key.update(true, t0 + Duration::from_millis(10)));
        assert!(!key.update(false, t0 + Duration::from_millis(20)));
        assert!(!key.update(false, t0 + Duration::from_millis(40)));
        // Only fires once the low level is 50 ms old.
        assert!(key.update(false, t0 + Duration::from_millis(75)));
    }

    #[test]
    fn encoder_full_detent_emits_one_step() {
        // Gray-code sequence for one clockwise detent from 0b11:
        // 11 -> 10 -> 00, two +1 transitions.
        let mut encoder = EncoderDecoder::new(true, true);
        let t0 = Instant::now();

        assert_eq!(encoder.update(true, false, t0), None);
        assert_eq!(
            encoder.update(false, false, t0 + Duration::from_millis(5)),
            Some(1)
        );
    }

    #[test]
    fn encoder_counter_clockwise_is_negative() {
        // 11 -> 01 -> 00 is the opposite rotation.
        let mut encoder = EncoderDecoder::new(true, true);
        let t0 = Instant::now();

        assert_eq!(encoder.update(false, true, t0), None);
        assert_eq!(
            encoder.update(false, false, t0 + Duration::from_millis(5)),
            Some(-1)
        );
    }

    #[test]
    fn encoder_steps_are_rate_limited() {
        let mut encoder = EncoderDecoder::new(true, true);
        let t0 = Instant::now();

        assert_eq!(encoder.update(true, false, t0), None);
        assert_eq!(encoder.update(false, false, t0), Some(1));

        // A second detent immediately after is swallowed by the spacing;
        // the accumulated movement emits on the next transition once the
        // spacing has elapsed.
        assert_eq!(encoder.update(false, true, t0 + Duration::from_millis(10)), None);
        assert_eq!(encoder.update(true, true, t0 + Duration::from_millis(15)), None);
        assert_eq!(
            encoder.update(true, false, t0 + Duration::from_millis(100)),
            Some(1)
        );
    }

    struct ScriptedPanel {
        low_pins: Vec<u32>,
    }

    impl PanelInput for ScriptedPanel {
        fn pin_level(&mut self, pin: u32) -> bool {
            !self.low_pins.contains(&pin)
        }
    }

    #[test]
    fn scanner_maps_pins_to_events() {
        let pins = PinMap {
            mute: 17,
            wake: 27,
            vol_up: 22,
            vol_down: 23,
            enc_a: 5,
            enc_b: 6,
        };
        let mut scanner = PanelScanner::new(ScriptedPanel { low_pins: vec![27] }, pins);
        let t0 = Instant::now();

        assert!(scanner.poll(t0).is_empty());
        let events = scanner.poll(t0 + Duration::from_millis(60));
        assert_eq!(events, vec![PanelEvent::ManualWake]);
        // Held: fires once.
        assert!(scanner.poll(t0 + Duration::from_millis(200)).is_empty());
    }
}
