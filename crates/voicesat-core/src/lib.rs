//! Core types: audio frames, volume, tracing setup

pub mod audio;
pub mod tracing;
pub mod volume;

pub use audio::{AudioFrame, BYTES_PER_CHUNK, CHANNELS, SAMPLE_RATE, SAMPLE_WIDTH, SAMPLES_PER_CHUNK};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
pub use volume::{clamp_percent, clamp_unit};
