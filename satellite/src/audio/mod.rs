//! Audio capture and playback.
//!
//! Capture runs on a dedicated OS thread owned by cpal; blocks cross into
//! the async world through bounded queues that drop the oldest entry under
//! backpressure. Playback is a play/stop sink around an external decoder
//! process.

mod capture;
mod playback;

pub use capture::{list_input_devices, AudioBlock, AudioCapture, BlockQueue, RingBuffer, SAMPLE_RATE};
pub use playback::{resolve_path, Player};
