//! Pipeline configuration.
//!
//! All values are fixed at construction time; nothing here is mutated while
//! audio is flowing.

use crate::constants::{FRAME_MS, FRAME_SIZE, NOMINAL_LAG, SAMPLE_RATE};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Scalar sample format of a capture stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Signed 16-bit PCM
    S16,
    /// 32-bit float in [-1.0, 1.0]
    F32,
}

/// Format descriptor for one capture stream (microphone or reference).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StreamSpec {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    /// Bitmask selecting which input channels participate in the mono
    /// downmix sum. Ignored for mono streams.
    #[serde(default = "default_channel_mask")]
    pub channel_mask: u64,
}

fn default_channel_mask() -> u64 {
    u64::MAX
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16,
            channels: 1,
            rate: SAMPLE_RATE,
            channel_mask: default_channel_mask(),
        }
    }
}

impl StreamSpec {
    /// Mono S16 at the canonical rate.
    pub fn canonical() -> Self {
        Self::default()
    }

    /// Number of input samples per channel that downmix to one output frame.
    pub fn input_frame_len(&self) -> usize {
        (FRAME_SIZE as u64 * self.rate as u64 / SAMPLE_RATE as u64) as usize
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.channels == 0 {
            bail!("{name}: stream must have at least one channel");
        }
        if self.channels > 64 {
            bail!("{name}: at most 64 channels are supported");
        }
        if self.rate == 0 {
            bail!("{name}: sample rate must be nonzero");
        }
        // One canonical frame must correspond to a whole number of input
        // samples, otherwise the accumulator can never line up.
        if (FRAME_SIZE as u64 * self.rate as u64) % SAMPLE_RATE as u64 != 0 {
            bail!(
                "{name}: rate {} does not divide into {}-sample frames at {}Hz",
                self.rate,
                FRAME_SIZE,
                SAMPLE_RATE
            );
        }
        Ok(())
    }
}

/// Configuration for an [`EchoPipeline`](crate::pipeline::EchoPipeline).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run the echo canceller. When false the reference path is inert and
    /// mic frames go straight to preprocessing.
    #[serde(default = "default_true")]
    pub aec_enabled: bool,
    #[serde(default)]
    pub mic: StreamSpec,
    #[serde(default)]
    pub reference: StreamSpec,
    /// Echo tail the canceller should cover, in milliseconds.
    #[serde(default = "default_filter_ms")]
    pub filter_ms: u32,
    #[serde(default = "default_true")]
    pub denoise: bool,
    #[serde(default = "default_true")]
    pub agc: bool,
    #[serde(default)]
    pub vad: bool,
    /// AGC target amplitude in S16 units.
    #[serde(default = "default_agc_target")]
    pub agc_target: i32,
    /// Amplitude ceiling the AGC may boost the target signal to.
    #[serde(default = "default_agc_max_gain")]
    pub agc_max_gain: i32,
    /// Maximum gain ramp-up in dB per second.
    #[serde(default = "default_agc_increment")]
    pub agc_increment: i32,
    /// Maximum gain ramp-down in dB per second (negative).
    #[serde(default = "default_agc_decrement")]
    pub agc_decrement: i32,
    /// Log queue fill levels on every push.
    #[serde(default)]
    pub debug: bool,
}

fn default_true() -> bool {
    true
}

fn default_filter_ms() -> u32 {
    100 + NOMINAL_LAG as u32 * FRAME_MS
}

fn default_agc_target() -> i32 {
    8000
}

fn default_agc_max_gain() -> i32 {
    20000
}

fn default_agc_increment() -> i32 {
    12
}

fn default_agc_decrement() -> i32 {
    -40
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aec_enabled: true,
            mic: StreamSpec::default(),
            reference: StreamSpec::default(),
            filter_ms: default_filter_ms(),
            denoise: true,
            agc: true,
            vad: false,
            agc_target: default_agc_target(),
            agc_max_gain: default_agc_max_gain(),
            agc_increment: default_agc_increment(),
            agc_decrement: default_agc_decrement(),
            debug: false,
        }
    }
}

impl PipelineConfig {
    /// Echo canceller tail length in samples at the canonical rate.
    pub fn filter_length(&self) -> usize {
        (SAMPLE_RATE * self.filter_ms / 1000) as usize
    }

    pub fn validate(&self) -> Result<()> {
        self.mic.validate("mic")?;
        if self.aec_enabled {
            self.reference.validate("reference")?;
        }
        if self.filter_ms == 0 {
            bail!("filter_ms must be nonzero");
        }
        if self.agc {
            if self.agc_target <= 0 || self.agc_target > i16::MAX as i32 {
                bail!("agc_target must be in (0, 32767]");
            }
            if self.agc_max_gain < self.agc_target {
                bail!("agc_max_gain must be at least agc_target");
            }
            if self.agc_increment <= 0 || self.agc_decrement >= 0 {
                bail!("agc_increment must be positive and agc_decrement negative");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filter_ms, 120);
        assert_eq!(config.filter_length(), FRAME_SIZE * 12);
        assert!(config.aec_enabled);
        assert!(!config.vad);
    }

    #[test]
    fn test_rejects_zero_channels() {
        let mut config = PipelineConfig::default();
        config.mic.channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_rate() {
        let mut config = PipelineConfig::default();
        // 480 * 22050 / 48000 is not a whole number of samples.
        config.mic.rate = 22050;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_cd_rate() {
        let mut config = PipelineConfig::default();
        config.mic.rate = 44100;
        assert!(config.validate().is_ok());
        assert_eq!(config.mic.input_frame_len(), 441);
    }

    #[test]
    fn test_reference_ignored_when_aec_disabled() {
        let mut config = PipelineConfig::default();
        config.aec_enabled = false;
        config.reference.channels = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.aec_enabled);
        assert_eq!(config.agc_target, 8000);
        assert_eq!(config.agc_max_gain, 20000);
        assert_eq!(config.mic.channel_mask, u64::MAX);
    }
}
