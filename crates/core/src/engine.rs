//! Per-frame echo cancellation and preprocessing.
//!
//! Wraps the external DSP collaborators: the AEC3 echo canceller, the
//! RNNoise denoiser and the WebRTC voice detector. The gain controller is
//! implemented here since it needs the voice verdict.

use crate::config::PipelineConfig;
use crate::constants::{FRAME_MS, FRAME_SIZE, SAMPLE_RATE};
use crate::resync::{Frame, PairedChunk};
use aec3::voip::VoipAec3;
use anyhow::{anyhow, Result};
use nnnoiseless::DenoiseState;
use webrtc_vad::{Vad, VadMode};

/// Automatic gain control in the S16 amplitude domain.
///
/// Tracks a gain in dB and slews it towards whatever would bring the frame
/// RMS to the target, bounded per frame by the configured ramp rates.
struct Agc {
    target: f32,
    max_gain_db: f32,
    inc_per_frame: f32,
    dec_per_frame: f32,
    gain_db: f32,
}

impl Agc {
    fn new(config: &PipelineConfig) -> Self {
        let max_linear = config.agc_max_gain as f32 / config.agc_target as f32;
        Self {
            target: config.agc_target as f32,
            max_gain_db: 20.0 * max_linear.log10(),
            inc_per_frame: config.agc_increment as f32 * FRAME_MS as f32 / 1000.0,
            dec_per_frame: config.agc_decrement as f32 * FRAME_MS as f32 / 1000.0,
            gain_db: 0.0,
        }
    }

    fn reset(&mut self) {
        self.gain_db = 0.0;
    }

    /// Adjust the frame in place. When `speech` is false the gain may only
    /// fall, so pauses do not pump the noise floor up.
    fn process(&mut self, samples: &mut [f32], speech: bool) {
        let energy: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (energy / samples.len() as f32).sqrt();
        if rms >= 1.0 {
            let desired_db = (20.0 * (self.target / rms).log10())
                .clamp(-self.max_gain_db, self.max_gain_db);
            if desired_db > self.gain_db {
                if speech {
                    self.gain_db = (self.gain_db + self.inc_per_frame).min(desired_db);
                }
            } else {
                self.gain_db = (self.gain_db + self.dec_per_frame).max(desired_db);
            }
        }
        let gain = 10.0f32.powf(self.gain_db / 20.0);
        for sample in samples.iter_mut() {
            *sample *= gain;
        }
    }
}

/// Runs the echo canceller and the preprocessing chain on paired frames.
pub struct EchoEngine {
    aec: Option<VoipAec3>,
    denoise: Option<Box<DenoiseState<'static>>>,
    vad: Option<Vad>,
    agc: Option<Agc>,
    // Scratch buffers, pre-allocated so the audio path never touches the
    // heap beyond the output frame itself.
    mic_f: [f32; FRAME_SIZE],
    ref_f: [f32; FRAME_SIZE],
    clean_f: [f32; FRAME_SIZE],
    denoised: [f32; FRAME_SIZE],
    vad_buf: [i16; FRAME_SIZE],
}

// Safety: the engine owns its DSP handles (the Vad holds raw pointers) and
// is only ever accessed behind the pipeline's mutex, one thread at a time.
unsafe impl Send for EchoEngine {}

impl EchoEngine {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let aec = if config.aec_enabled {
            Some(Self::build_aec()?)
        } else {
            None
        };
        if aec.is_some() {
            log::info!(
                "echo canceller active, tail {} samples ({}ms)",
                config.filter_length(),
                config.filter_ms
            );
        }
        let denoise = config.denoise.then(DenoiseState::new);
        let vad = config.vad.then(Self::build_vad);
        let agc = config.agc.then(|| Agc::new(config));
        Ok(Self {
            aec,
            denoise,
            vad,
            agc,
            mic_f: [0.0; FRAME_SIZE],
            ref_f: [0.0; FRAME_SIZE],
            clean_f: [0.0; FRAME_SIZE],
            denoised: [0.0; FRAME_SIZE],
            vad_buf: [0; FRAME_SIZE],
        })
    }

    fn build_aec() -> Result<VoipAec3> {
        VoipAec3::builder(SAMPLE_RATE as usize, 1, 1)
            .build()
            .map_err(|e| anyhow!("echo canceller init failed: {e:?}"))
    }

    fn build_vad() -> Vad {
        Vad::new_with_rate_and_mode(webrtc_vad::SampleRate::Rate48kHz, VadMode::Quality)
    }

    /// Process one chunk into a cleaned frame. Returns None for empty
    /// chunks.
    pub fn process(&mut self, chunk: PairedChunk) -> Option<Frame> {
        let (mic, reference) = match chunk {
            PairedChunk::Empty => return None,
            PairedChunk::Mic(mic) => (mic, None),
            PairedChunk::Pair { mic, reference } => (mic, Some(reference)),
        };

        for (dst, &s) in self.mic_f.iter_mut().zip(mic.samples()) {
            *dst = s as f32 * (1.0 / 32768.0);
        }

        // Echo cancellation wants the reference that was captured ahead of
        // this mic frame; without one the mic passes through untouched.
        if let (Some(aec), Some(reference)) = (self.aec.as_mut(), reference.as_ref()) {
            for (dst, &s) in self.ref_f.iter_mut().zip(reference.samples()) {
                *dst = s as f32 * (1.0 / 32768.0);
            }
            if let Err(e) =
                aec.process(&self.mic_f, Some(&self.ref_f[..]), false, &mut self.clean_f)
            {
                log::warn!("echo canceller error, passing mic through: {e:?}");
                self.clean_f.copy_from_slice(&self.mic_f);
            }
        } else {
            self.clean_f.copy_from_slice(&self.mic_f);
        }

        // Preprocessing runs in the S16 amplitude domain from here on.
        for sample in self.clean_f.iter_mut() {
            *sample *= 32768.0;
        }

        if let Some(denoise) = self.denoise.as_mut() {
            denoise.process_frame(&mut self.denoised, &self.clean_f);
            self.clean_f.copy_from_slice(&self.denoised);
        }

        let speech = match self.vad.as_mut() {
            Some(vad) => {
                for (dst, &s) in self.vad_buf.iter_mut().zip(self.clean_f.iter()) {
                    *dst = s.clamp(-32768.0, 32767.0) as i16;
                }
                vad.is_voice_segment(&self.vad_buf).unwrap_or(false)
            }
            None => true,
        };

        if let Some(agc) = self.agc.as_mut() {
            agc.process(&mut self.clean_f, speech);
        }

        let mut clean = mic;
        for (out, &s) in clean.samples_mut().iter_mut().zip(self.clean_f.iter()) {
            *out = s.clamp(-32768.0, 32767.0) as i16;
        }
        Some(clean)
    }

    /// Discard all adaptive state: a fresh echo filter, denoiser history
    /// and unity gain. Keeps the previous canceller if a rebuild fails.
    pub fn reset(&mut self) {
        if self.aec.is_some() {
            match Self::build_aec() {
                Ok(aec) => self.aec = Some(aec),
                Err(e) => log::warn!("echo canceller reset failed, keeping old state: {e}"),
            }
        }
        if self.denoise.is_some() {
            self.denoise = Some(DenoiseState::new());
        }
        if let Some(agc) = self.agc.as_mut() {
            agc.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn plain_config() -> PipelineConfig {
        PipelineConfig {
            aec_enabled: false,
            denoise: false,
            agc: false,
            vad: false,
            ..PipelineConfig::default()
        }
    }

    fn tone_frame(amplitude: f32) -> Frame {
        let mut samples = [0i16; FRAME_SIZE];
        for (i, s) in samples.iter_mut().enumerate() {
            let t = i as f32 / SAMPLE_RATE as f32;
            *s = (amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16;
        }
        Frame::from(samples)
    }

    fn rms(frame: &Frame) -> f32 {
        let sum: f64 = frame.samples().iter().map(|&s| (s as f64).powi(2)).sum();
        (sum / FRAME_SIZE as f64).sqrt() as f32
    }

    #[test]
    fn test_empty_chunk_produces_nothing() {
        let mut engine = EchoEngine::new(&plain_config()).unwrap();
        assert!(engine.process(PairedChunk::Empty).is_none());
    }

    #[test]
    fn test_passthrough_when_everything_disabled() {
        let mut engine = EchoEngine::new(&plain_config()).unwrap();
        let frame = tone_frame(8000.0);
        let expected: Vec<i16> = frame.samples().to_vec();
        let clean = engine.process(PairedChunk::Mic(frame)).unwrap();
        assert_eq!(clean.samples(), &expected[..]);
    }

    #[test]
    fn test_aec_engine_accepts_pairs() {
        let mut config = plain_config();
        config.aec_enabled = true;
        let mut engine = EchoEngine::new(&config).unwrap();
        for _ in 0..20 {
            let clean = engine
                .process(PairedChunk::Pair {
                    mic: tone_frame(4000.0),
                    reference: tone_frame(4000.0),
                })
                .unwrap();
            assert_eq!(clean.samples().len(), FRAME_SIZE);
        }
    }

    #[test]
    fn test_agc_boosts_quiet_speech_towards_target() {
        let mut config = plain_config();
        config.agc = true;
        let mut engine = EchoEngine::new(&config).unwrap();
        let quiet = rms(&tone_frame(1000.0));
        let mut last = 0.0;
        // A second of audio gives the +12dB/s ramp room to move.
        for _ in 0..100 {
            let clean = engine.process(PairedChunk::Mic(tone_frame(1000.0))).unwrap();
            last = rms(&clean);
        }
        assert!(last > quiet * 2.0, "gain did not ramp: {quiet} -> {last}");
        assert!(last < 21000.0, "gain overshot ceiling: {last}");
    }

    #[test]
    fn test_agc_attenuates_hot_input() {
        let mut config = plain_config();
        config.agc = true;
        let mut engine = EchoEngine::new(&config).unwrap();
        let hot = rms(&tone_frame(30000.0));
        let mut last = f32::MAX;
        for _ in 0..200 {
            let clean = engine
                .process(PairedChunk::Mic(tone_frame(30000.0)))
                .unwrap();
            last = rms(&clean);
        }
        assert!(last < hot, "gain did not come down: {hot} -> {last}");
    }

    #[test]
    fn test_denoise_keeps_silence_silent() {
        let mut config = plain_config();
        config.denoise = true;
        let mut engine = EchoEngine::new(&config).unwrap();
        let mut last = f32::MAX;
        for _ in 0..10 {
            let clean = engine.process(PairedChunk::Mic(Frame::silence())).unwrap();
            last = rms(&clean);
        }
        assert!(last < 100.0, "silence came out loud: {last}");
    }

    #[test]
    fn test_reset_returns_gain_to_unity() {
        let mut config = plain_config();
        config.agc = true;
        let mut engine = EchoEngine::new(&config).unwrap();
        for _ in 0..100 {
            engine.process(PairedChunk::Mic(tone_frame(1000.0)));
        }
        engine.reset();
        let frame = tone_frame(1000.0);
        let before = rms(&frame);
        let clean = engine.process(PairedChunk::Mic(frame)).unwrap();
        // First frame after reset has had one ramp step at most.
        let after = rms(&clean);
        assert!((after / before) < 1.1, "gain survived reset: {after}/{before}");
    }
}
