//! The pipeline coordinator.
//!
//! Owns the two frame assemblers, the resynchronizer, the echo engine and
//! the output queue, and wires the capture callbacks through them. All
//! methods take `&self`; the pipeline is meant to live in an `Arc` shared
//! between the mic, reference and render callbacks.

use crate::assembler::{FrameAssembler, SampleBuf};
use crate::config::PipelineConfig;
use crate::engine::EchoEngine;
use crate::output::OutputQueue;
use crate::resync::{PairedChunk, Resynchronizer, ResyncState};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters observable without blocking the audio callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed_frames: u64,
    pub dropped_mic_frames: u64,
    pub dropped_ref_frames: u64,
    pub dropped_output_frames: u64,
    pub state: ResyncState,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dropped_mic: AtomicU64,
    dropped_ref: AtomicU64,
    dropped_output: AtomicU64,
}

impl Counters {
    fn zero(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.dropped_mic.store(0, Ordering::Relaxed);
        self.dropped_ref.store(0, Ordering::Relaxed);
        self.dropped_output.store(0, Ordering::Relaxed);
    }
}

/// Real-time echo cancellation pipeline.
pub struct EchoPipeline {
    config: PipelineConfig,
    mic_assembler: Mutex<FrameAssembler>,
    ref_assembler: Option<Mutex<FrameAssembler>>,
    resync: Resynchronizer,
    engine: Mutex<EchoEngine>,
    output: OutputQueue,
    counters: Counters,
}

impl EchoPipeline {
    /// Validate the configuration and initialize the DSP state. Fails fast
    /// on an invalid config or an unavailable DSP handle; once running,
    /// nothing in the pipeline errors.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        let mic_assembler =
            Mutex::new(FrameAssembler::new(&config.mic).context("mic assembler init failed")?);
        let ref_assembler = if config.aec_enabled {
            Some(Mutex::new(
                FrameAssembler::new(&config.reference)
                    .context("reference assembler init failed")?,
            ))
        } else {
            None
        };
        let engine = Mutex::new(EchoEngine::new(&config)?);
        let resync = Resynchronizer::new();
        resync.set_debug(config.debug);
        log::info!(
            "pipeline up: aec={} denoise={} agc={} vad={} mic={}ch@{}Hz ref={}ch@{}Hz",
            config.aec_enabled,
            config.denoise,
            config.agc,
            config.vad,
            config.mic.channels,
            config.mic.rate,
            config.reference.channels,
            config.reference.rate,
        );
        Ok(Self {
            config,
            mic_assembler,
            ref_assembler,
            resync,
            engine,
            output: OutputQueue::new(),
            counters: Counters::default(),
        })
    }

    /// Feed a burst of interleaved mic samples from the capture callback.
    pub fn add_mic(&self, data: SampleBuf<'_>) {
        let Ok(mut assembler) = self.mic_assembler.lock() else {
            return;
        };
        assembler.push(data, |frame| {
            if self.config.aec_enabled {
                if self.resync.push_mic(frame) {
                    self.counters.dropped_mic.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                // No reference stream to wait for, clean the frame now.
                self.process_chunk(PairedChunk::Mic(frame));
            }
        });
    }

    /// Feed a burst of interleaved reference (far-end) samples. No-op when
    /// echo cancellation is disabled.
    pub fn add_reference(&self, data: SampleBuf<'_>) {
        let Some(ref_assembler) = self.ref_assembler.as_ref() else {
            return;
        };
        let Ok(mut assembler) = ref_assembler.lock() else {
            return;
        };
        assembler.push(data, |frame| {
            let chunk = self.resync.push_ref(frame);
            if chunk.is_empty() {
                self.counters.dropped_ref.fetch_add(1, Ordering::Relaxed);
            } else {
                // Pairing drives the engine inline; there is no worker
                // thread between the resynchronizer and the output queue.
                self.process_chunk(chunk);
            }
        });
    }

    fn process_chunk(&self, chunk: PairedChunk) {
        let cleaned = match self.engine.lock() {
            Ok(mut engine) => engine.process(chunk),
            Err(_) => return,
        };
        if let Some(frame) = cleaned {
            let evicted = self.output.push(frame) as u64;
            if evicted > 0 {
                self.counters
                    .dropped_output
                    .fetch_add(evicted, Ordering::Relaxed);
            }
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy up to `max` cleaned samples into `dst`. Returns the number
    /// copied; the render callback fills the remainder with silence.
    pub fn pull_output(&self, dst: &mut [i16], max: usize) -> usize {
        self.output.pull(dst, max)
    }

    /// Drop all buffered audio and adaptive state. Afterwards the queues
    /// are empty, the resynchronizer is starved and the counters are zero.
    pub fn reset(&self) {
        self.resync.reset();
        if let Ok(mut engine) = self.engine.lock() {
            engine.reset();
        }
        self.output.clear();
        self.counters.zero();
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            processed_frames: self.counters.processed.load(Ordering::Relaxed),
            dropped_mic_frames: self.counters.dropped_mic.load(Ordering::Relaxed),
            dropped_ref_frames: self.counters.dropped_ref.load(Ordering::Relaxed),
            dropped_output_frames: self.counters.dropped_output.load(Ordering::Relaxed),
            state: self.resync.state(),
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.resync.set_debug(enabled);
    }
}
