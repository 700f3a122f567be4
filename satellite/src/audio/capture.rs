//! Microphone capture loop.
//!
//! Captures 16-kHz mono PCM in fixed blocks and fans each block out to the
//! wake-word scorer queue and a short ring buffer covering the engaged-VAD
//! window. The cpal callback thread owns the input device; nothing else
//! opens it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::metrics::{Counter, Metrics};

/// Capture sample rate: 16 kHz mono, the rate wake models and the hub
/// pipeline expect.
pub const SAMPLE_RATE: u32 = 16_000;

/// One captured block with its monotonic timestamp.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub samples: Arc<Vec<i16>>,
    pub ts: Instant,
}

/// Bounded FIFO of blocks feeding the wake scorer. When the scorer falls
/// behind, the oldest block is dropped and the xrun counter increments.
pub struct BlockQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
    metrics: Arc<Metrics>,
}

struct QueueInner {
    blocks: VecDeque<AudioBlock>,
    closed: bool,
}

impl BlockQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                blocks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            metrics,
        })
    }

    pub fn push(&self, block: AudioBlock) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        if inner.blocks.len() >= self.capacity {
            inner.blocks.pop_front();
            self.metrics.bump(Counter::Xrun);
        }
        inner.blocks.push_back(block);
        drop(inner);
        self.ready.notify_one();
    }

    /// Blocking pop for the scorer thread. Returns `None` once closed and
    /// drained.
    pub fn pop(&self) -> Option<AudioBlock> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(block) = inner.blocks.pop_front() {
                return Some(block);
            }
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        drop(inner);
        self.ready.notify_all();
    }
}

/// Ring of the most recent blocks, sized to `engaged_vad_window_s + 2 s`.
pub struct RingBuffer {
    inner: Mutex<VecDeque<AudioBlock>>,
    capacity_blocks: usize,
    metrics: Arc<Metrics>,
}

impl RingBuffer {
    /// `window_seconds` is the amount of recent audio to retain.
    pub fn new(window_seconds: f64, block_size: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        let blocks_per_second = SAMPLE_RATE as f64 / block_size.max(1) as f64;
        let capacity_blocks = ((window_seconds * blocks_per_second).ceil() as usize).max(1);
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity_blocks)),
            capacity_blocks,
            metrics,
        })
    }

    pub fn push(&self, block: AudioBlock) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() >= self.capacity_blocks {
            inner.pop_front();
        }
        inner.push_back(block);
    }

    /// Most recent block without waiting. Underrun (nothing captured yet)
    /// increments the xrun counter and returns `None`; the caller continues.
    pub fn current_block(&self) -> Option<AudioBlock> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.back() {
            Some(block) => Some(block.clone()),
            None => {
                self.metrics.bump(Counter::Xrun);
                None
            }
        }
    }

    /// Snapshot of the retained window, oldest first.
    pub fn window(&self) -> Vec<AudioBlock> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.iter().cloned().collect()
    }
}

/// Owns the cpal input stream. `start()` acquires the device, `stop()`
/// releases it.
pub struct AudioCapture {
    device_name: Option<String>,
    block_size: usize,
    scorer_queue: Arc<BlockQueue>,
    ring: Arc<RingBuffer>,
    stream_fanout: broadcast::Sender<AudioBlock>,
    stream: Option<Stream>,
}

impl AudioCapture {
    pub fn new(
        device_name: Option<String>,
        block_size: usize,
        scorer_queue: Arc<BlockQueue>,
        ring: Arc<RingBuffer>,
        stream_fanout: broadcast::Sender<AudioBlock>,
    ) -> Self {
        Self {
            device_name,
            block_size,
            scorer_queue,
            ring,
            stream_fanout,
            stream: None,
        }
    }

    /// Open the input device and begin capturing. An unusable device here is
    /// fatal for the process.
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = match &self.device_name {
            Some(name) => host
                .input_devices()
                .context("failed to enumerate input devices")?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| anyhow!("audio input device not found: {name}"))?,
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow!("no default audio input device"))?,
        };

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            device = device.name().unwrap_or_default(),
            block_size = self.block_size,
            sample_rate = SAMPLE_RATE,
            "opening audio input"
        );

        // The cpal callback must stay small: accumulate into blocks and hand
        // them to the fan-out without blocking.
        let block_size = self.block_size;
        let scorer_queue = Arc::clone(&self.scorer_queue);
        let ring = Arc::clone(&self.ring);
        let stream_fanout = self.stream_fanout.clone();
        let mut pending: Vec<i16> = Vec::with_capacity(block_size);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                        pending.push(value);
                        if pending.len() == block_size {
                            let block = AudioBlock {
                                samples: Arc::new(std::mem::replace(
                                    &mut pending,
                                    Vec::with_capacity(block_size),
                                )),
                                ts: Instant::now(),
                            };
                            ring.push(block.clone());
                            scorer_queue.push(block.clone());
                            // No receivers while no session is streaming;
                            // that is not an error.
                            let _ = stream_fanout.send(block);
                        }
                    }
                },
                |err| {
                    error!(error = %err, "audio capture stream error");
                },
                None,
            )
            .context("failed to build audio input stream")?;

        stream.play().context("failed to start audio input stream")?;
        self.stream = Some(stream);
        debug!("audio capture started");
        Ok(())
    }

    /// Release the input device.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            debug!("audio capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

/// List input device names, for `--list-input-devices`.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host
        .input_devices()
        .context("failed to enumerate input devices")?
    {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(v: i16) -> AudioBlock {
        AudioBlock {
            samples: Arc::new(vec![v; 4]),
            ts: Instant::now(),
        }
    }

    #[test]
    fn queue_drops_oldest_and_counts_xrun() {
        let metrics = Metrics::new();
        let queue = BlockQueue::new(2, Arc::clone(&metrics));

        queue.push(block(1));
        queue.push(block(2));
        queue.push(block(3));

        assert_eq!(metrics.get(Counter::Xrun), 1);
        assert_eq!(queue.pop().unwrap().samples[0], 2);
        assert_eq!(queue.pop().unwrap().samples[0], 3);
    }

    #[test]
    fn queue_pop_returns_none_after_close() {
        let metrics = Metrics::new();
        let queue = BlockQueue::new(4, metrics);
        queue.push(block(7));
        queue.close();

        assert_eq!(queue.pop().unwrap().samples[0], 7);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn ring_retains_a_bounded_window() {
        let metrics = Metrics::new();
        // 1024-sample blocks at 16 kHz: 64 ms each; a 0.128 s window is two
        // blocks.
        let ring = RingBuffer::new(0.128, 1024, Arc::clone(&metrics));

        for v in 0..5 {
            ring.push(block(v));
        }
        let window = ring.window();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].samples[0], 3);
        assert_eq!(window[1].samples[0], 4);
    }

    #[test]
    fn current_block_underrun_counts_xrun() {
        let metrics = Metrics::new();
        let ring = RingBuffer::new(1.0, 1024, Arc::clone(&metrics));

        assert!(ring.current_block().is_none());
        assert_eq!(metrics.get(Counter::Xrun), 1);

        ring.push(block(9));
        assert_eq!(ring.current_block().unwrap().samples[0], 9);
        assert_eq!(metrics.get(Counter::Xrun), 1);
    }
}
