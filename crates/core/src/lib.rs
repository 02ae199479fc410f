pub mod assembler;
pub mod config;
pub mod constants;
pub mod engine;
pub mod output;
pub mod pipeline;
pub mod resync;

pub use assembler::{FrameAssembler, SampleBuf};
pub use config::{PipelineConfig, SampleFormat, StreamSpec};
pub use engine::EchoEngine;
pub use output::OutputQueue;
pub use pipeline::{EchoPipeline, PipelineStats};
pub use resync::{Frame, PairedChunk, Resynchronizer, ResyncState};
