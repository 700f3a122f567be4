//! Camera capability.
//!
//! The daemon never holds a camera open between requests: each glance opens
//! a handle, grabs a short burst, and drops it. Capture backends implement
//! [`CameraSource`]; when no device node exists the null source is used and
//! every glance reports `camera`.

use anyhow::{bail, Result};
use tracing::warn;

/// One grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major luminance, `width * height` bytes.
    pub data: Vec<u8>,
}

/// An openable camera. Opening acquires the device; dropping the handle
/// releases it.
pub trait CameraSource: Send + Sync {
    fn open(&self, width: u32, height: u32) -> Result<Box<dyn CameraHandle>>;
}

pub trait CameraHandle: Send {
    fn grab(&mut self) -> Result<Frame>;
}

/// Used when no camera hardware is present.
pub struct NullCamera;

impl CameraSource for NullCamera {
    fn open(&self, _width: u32, _height: u32) -> Result<Box<dyn CameraHandle>> {
        bail!("camera")
    }
}

/// Pick a camera source for the configured index. Probing only checks for
/// the device node; the open itself can still fail per request.
pub fn probe(camera_index: u32) -> Box<dyn CameraSource> {
    let node = format!("/dev/video{camera_index}");
    if std::path::Path::new(&node).exists() {
        warn!(
            node,
            "camera node present but no capture backend is registered; glances will report camera errors"
        );
    } else {
        warn!(node, "no camera device, glances will report camera errors");
    }
    Box::new(NullCamera)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted camera for tests: serves prepared frames, optionally slowly.
    pub struct ScriptedCamera {
        pub frames: Mutex<Vec<Frame>>,
        pub grab_delay: Duration,
        pub fail_open: bool,
    }

    impl ScriptedCamera {
        pub fn with_frames(frames: Vec<Frame>) -> Self {
            Self {
                frames: Mutex::new(frames),
                grab_delay: Duration::ZERO,
                fail_open: false,
            }
        }
    }

    impl CameraSource for ScriptedCamera {
        fn open(&self, _width: u32, _height: u32) -> Result<Box<dyn CameraHandle>> {
            if self.fail_open {
                bail!("camera");
            }
            let frames = self.frames.lock().unwrap().clone();
            Ok(Box::new(ScriptedHandle {
                frames,
                at: 0,
                grab_delay: self.grab_delay,
            }))
        }
    }

    struct ScriptedHandle {
        frames: Vec<Frame>,
        at: usize,
        grab_delay: Duration,
    }

    impl CameraHandle for ScriptedHandle {
        fn grab(&mut self) -> Result<Frame> {
            if !self.grab_delay.is_zero() {
                std::thread::sleep(self.grab_delay);
            }
            let frame = self
                .frames
                .get(self.at % self.frames.len().max(1))
                .cloned();
            self.at += 1;
            frame.ok_or_else(|| anyhow::anyhow!("no frames"))
        }
    }
}
