//! Face-orientation detection.
//!
//! The heavy face detector is a pluggable [`Detector`]; the built-in
//! implementation scores the luminance-weighted centroid of each frame: a
//! bright subject centered in view reads as a face oriented toward the
//! device, an off-center one as turned away, and a dark or flat scene as no
//! face at all.

use crate::camera::Frame;

/// Tri-state verdict plus confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub verdict: &'static str,
    pub confidence: f64,
}

impl Detection {
    pub fn no_face() -> Self {
        Self {
            verdict: "NO_FACE",
            confidence: 0.0,
        }
    }
}

pub trait Detector: Send + Sync {
    fn analyze(&self, frames: &[Frame]) -> Detection;
}

/// Centroid-based heuristic detector.
pub struct CentroidDetector {
    /// Minimum mean luminance before a frame counts as containing a
    /// subject.
    min_brightness: f64,
}

impl CentroidDetector {
    pub fn new() -> Self {
        Self {
            min_brightness: 16.0,
        }
    }
}

impl Default for CentroidDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for CentroidDetector {
    fn analyze(&self, frames: &[Frame]) -> Detection {
        let mut best_centered = 0.0_f64;
        let mut best_conf = 0.0_f64;
        let mut seen_subject = false;

        for frame in frames {
            let Some((cx, cy, mean)) = luminance_centroid(frame) else {
                continue;
            };
            if mean < self.min_brightness {
                continue;
            }
            seen_subject = true;

            // Normalized distance of the bright centroid from frame center,
            // weighted the way the horizontal axis dominates head turn.
            let dx = (cx / f64::from(frame.width.max(1)) - 0.5).abs();
            let dy = (cy / f64::from(frame.height.max(1)) - 0.5).abs();
            let centered = (1.0 - (dx * 1.8 + dy * 1.2)).max(0.0);
            let brightness = (mean / 128.0).min(1.0);
            let conf = (centered * 0.7 + brightness * 0.3).clamp(0.0, 1.0);

            best_centered = best_centered.max(centered);
            best_conf = best_conf.max(conf);
        }

        if !seen_subject {
            return Detection::no_face();
        }
        if best_centered >= 0.45 {
            Detection {
                verdict: "FACE_TOWARD",
                confidence: best_conf.max(best_centered),
            }
        } else {
            Detection {
                verdict: "FACE_AWAY",
                confidence: best_conf.clamp(0.2, 0.95),
            }
        }
    }
}

/// Brightness-weighted centroid of a frame, plus its mean luminance.
fn luminance_centroid(frame: &Frame) -> Option<(f64, f64, f64)> {
    if frame.data.is_empty() || frame.width == 0 || frame.height == 0 {
        return None;
    }

    let mut sum = 0.0_f64;
    let mut sum_x = 0.0_f64;
    let mut sum_y = 0.0_f64;
    for (index, &value) in frame.data.iter().enumerate() {
        let x = (index as u32 % frame.width) as f64;
        let y = (index as u32 / frame.width) as f64;
        let weight = f64::from(value);
        sum += weight;
        sum_x += x * weight;
        sum_y += y * weight;
    }
    if sum <= 0.0 {
        return None;
    }

    let mean = sum / frame.data.len() as f64;
    Some((sum_x / sum, sum_y / sum, mean))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_blob(width: u32, height: u32, blob_x: u32, blob_y: u32) -> Frame {
        let mut data = vec![8u8; (width * height) as usize];
        for dy in 0..(height / 4) {
            for dx in 0..(width / 4) {
                let x = (blob_x + dx).min(width - 1);
                let y = (blob_y + dy).min(height - 1);
                data[(y * width + x) as usize] = 220;
            }
        }
        Frame {
            width,
            height,
            data,
        }
    }

    #[test]
    fn centered_subject_reads_as_face_toward() {
        let frame = frame_with_blob(64, 48, 24, 18);
        let detection = CentroidDetector::new().analyze(&[frame]);
        assert_eq!(detection.verdict, "FACE_TOWARD");
        assert!(detection.confidence > 0.5);
    }

    #[test]
    fn off_center_subject_reads_as_face_away() {
        let frame = frame_with_blob(64, 48, 0, 0);
        let detection = CentroidDetector::new().analyze(&[frame]);
        assert_eq!(detection.verdict, "FACE_AWAY");
        assert!(detection.confidence >= 0.2);
    }

    #[test]
    fn dark_scene_reads_as_no_face() {
        let frame = Frame {
            width: 64,
            height: 48,
            data: vec![2u8; 64 * 48],
        };
        let detection = CentroidDetector::new().analyze(&[frame]);
        assert_eq!(detection, Detection::no_face());
    }

    #[test]
    fn empty_burst_reads_as_no_face() {
        let detection = CentroidDetector::new().analyze(&[]);
        assert_eq!(detection, Detection::no_face());
    }
}
