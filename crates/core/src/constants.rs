//! Shared constants for the EchoSync audio pipeline.

/// Canonical sample rate used throughout the pipeline (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame duration in milliseconds
pub const FRAME_MS: u32 = 10;

/// Frame size in samples (10ms at 48kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Number of mic frames the resynchronizer tries to keep buffered so that
/// reference audio always reaches the echo canceller first
pub const NOMINAL_LAG: usize = 2;
