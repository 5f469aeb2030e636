//! Captured audio frames.
//!
//! The satellite only ever moves raw PCM around: 16 kHz, mono, signed
//! 16-bit little-endian. A frame is one fixed-size block as produced by the
//! capture thread.

use std::time::Duration;

use bytes::Bytes;

/// Capture sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample (signed 16-bit).
pub const SAMPLE_WIDTH: usize = 2;

/// Number of capture channels.
pub const CHANNELS: usize = 1;

/// Samples per captured block.
pub const SAMPLES_PER_CHUNK: usize = 1024;

/// Bytes per captured block.
pub const BYTES_PER_CHUNK: usize = SAMPLES_PER_CHUNK * SAMPLE_WIDTH * CHANNELS;

/// One fixed-size block of captured PCM audio.
///
/// `sequence` is assigned by the producer and increases by one for every
/// frame it pushes, so gaps reveal frames that were evicted before the
/// consumer saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Producer-assigned ordinal.
    pub sequence: u64,
    /// Raw PCM samples.
    pub samples: Bytes,
}

impl AudioFrame {
    /// Creates a new frame.
    pub fn new(sequence: u64, samples: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            samples: samples.into(),
        }
    }

    /// Number of samples in this frame.
    pub fn sample_count(&self) -> usize {
        self.samples.len() / (SAMPLE_WIDTH * CHANNELS)
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.sample_count() as f64 / SAMPLE_RATE as f64)
    }
}
