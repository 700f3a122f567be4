//! Envelope model and legacy-shape normalization.
//!
//! Every message on the bus is `{"type", "payload", "ts", "source"}`. Older
//! controllers still send `{"cmd": "manual_wake"}` or `{"event": "muted"}`;
//! those are rewritten here, on ingress only, into the modern shape with
//! `source = "external"`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::IpcError;

/// Well-known message types on the bus.
pub mod msg {
    pub const MANUAL_WAKE: &str = "MANUAL_WAKE";
    pub const MUTE_TOGGLE: &str = "MUTE_TOGGLE";
    pub const VOLUME_UP: &str = "VOLUME_UP";
    pub const VOLUME_DOWN: &str = "VOLUME_DOWN";
    pub const CANCEL: &str = "CANCEL";
    pub const VISION_GLANCE_REQUEST: &str = "VISION_GLANCE_REQUEST";
    pub const VISION_GLANCE_RESULT: &str = "VISION_GLANCE_RESULT";
    pub const STATE_CHANGED: &str = "STATE_CHANGED";
    pub const LED_STATE: &str = "LED_STATE";
}

/// Which process put the message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Core,
    Visd,
    Frontpaneld,
    External,
}

/// One message on the local bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,

    /// Seconds since the epoch.
    pub ts: f64,

    pub source: Source,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value, source: Source) -> Self {
        Self {
            kind: kind.into(),
            payload,
            ts: epoch_seconds(),
            source,
        }
    }

    /// Parse one frame, accepting both the modern envelope and the legacy
    /// `{cmd}` / `{event}` shapes.
    pub fn parse(frame: &str) -> Result<Self, IpcError> {
        let value: Value = serde_json::from_str(frame)?;
        let Value::Object(map) = value else {
            return Err(IpcError::NotAnObject);
        };

        if map.contains_key("type") {
            let envelope: Envelope = serde_json::from_value(Value::Object(map))?;
            return Ok(envelope);
        }

        normalize_legacy(map)
    }

    /// Serialize to a single newline-terminated frame.
    pub fn to_frame(&self) -> Result<String, IpcError> {
        let mut frame = serde_json::to_string(self)?;
        frame.push('\n');
        Ok(frame)
    }
}

/// Rewrite `{"cmd": X, ...}` / `{"event": X, ...}` into a modern envelope.
/// The command name becomes the upper-cased `type`, the remaining fields
/// become the payload, and the source is forced to `external`.
fn normalize_legacy(mut map: Map<String, Value>) -> Result<Envelope, IpcError> {
    let name = map
        .remove("cmd")
        .or_else(|| map.remove("event"))
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or(IpcError::NotAnObject)?;

    let ts = map
        .remove("ts")
        .and_then(|v| v.as_f64())
        .unwrap_or_else(epoch_seconds);

    Ok(Envelope {
        kind: name.trim().to_ascii_uppercase(),
        payload: Value::Object(map),
        ts,
        source: Source::External,
    })
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn modern_envelope_round_trip() {
        let envelope = Envelope::new(msg::MUTE_TOGGLE, json!({}), Source::Frontpaneld);
        let frame = envelope.to_frame().unwrap();
        assert!(frame.ends_with('\n'));

        let parsed = Envelope::parse(frame.trim_end()).unwrap();
        assert_eq!(parsed.kind, "MUTE_TOGGLE");
        assert_eq!(parsed.source, Source::Frontpaneld);
    }

    #[test]
    fn legacy_cmd_is_normalized() {
        let parsed = Envelope::parse(r#"{"cmd":"manual_wake"}"#).unwrap();
        assert_eq!(parsed.kind, msg::MANUAL_WAKE);
        assert_eq!(parsed.source, Source::External);
        assert!(parsed.ts > 0.0);
    }

    #[test]
    fn legacy_event_keeps_extra_fields_as_payload() {
        let parsed = Envelope::parse(r#"{"event":"volume_step","steps":-2}"#).unwrap();
        assert_eq!(parsed.kind, "VOLUME_STEP");
        assert_eq!(parsed.payload["steps"], json!(-2));
        assert_eq!(parsed.source, Source::External);
    }

    #[test]
    fn non_object_frames_are_rejected() {
        assert!(Envelope::parse("[1,2,3]").is_err());
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"neither":"shape"}"#).is_err());
    }

    #[test]
    fn source_serializes_lowercase() {
        let envelope = Envelope::new(msg::STATE_CHANGED, json!({"state": "IDLE"}), Source::Core);
        let frame = envelope.to_frame().unwrap();
        assert!(frame.contains(r#""source":"core""#));
    }
}
