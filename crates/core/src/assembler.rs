//! Frame assembly for one capture stream.
//!
//! Capture callbacks deliver interleaved PCM in whatever format, channel
//! count and rate the device negotiated. The assembler turns those bursts
//! into fixed-size mono S16 frames at the canonical rate: downmix first,
//! then accumulate, then resample, then quantize.

use crate::config::{SampleFormat, StreamSpec};
use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use crate::resync::Frame;
use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};

/// One burst of interleaved samples in the stream's declared format.
#[derive(Clone, Copy)]
pub enum SampleBuf<'a> {
    S16(&'a [i16]),
    F32(&'a [f32]),
}

impl SampleBuf<'_> {
    fn len(&self) -> usize {
        match self {
            SampleBuf::S16(data) => data.len(),
            SampleBuf::F32(data) => data.len(),
        }
    }

    fn format(&self) -> SampleFormat {
        match self {
            SampleBuf::S16(_) => SampleFormat::S16,
            SampleBuf::F32(_) => SampleFormat::F32,
        }
    }
}

/// Accumulates interleaved PCM and emits complete canonical frames.
///
/// Single-writer: owned by the capture callback that feeds it. The
/// assembler never fails at runtime; a malformed burst length is a
/// programmer error upstream.
pub struct FrameAssembler {
    format: SampleFormat,
    channels: usize,
    mask: u64,
    input_len: usize,
    accum: Vec<f32>,
    fill: usize,
    resampler: Option<FftFixedIn<f32>>,
    resample_in: Vec<Vec<f32>>,
    resample_out: Vec<Vec<f32>>,
}

impl FrameAssembler {
    pub fn new(spec: &StreamSpec) -> Result<Self> {
        let input_len = spec.input_frame_len();
        let resampler = if spec.rate != SAMPLE_RATE {
            Some(
                FftFixedIn::new(spec.rate as usize, SAMPLE_RATE as usize, input_len, 4, 1)
                    .with_context(|| {
                        format!("resampler init failed for {}Hz input", spec.rate)
                    })?,
            )
        } else {
            None
        };
        let max_out = resampler
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(0);
        // A mono stream always contributes its only channel.
        let mask = if spec.channels == 1 { 1 } else { spec.channel_mask };
        Ok(Self {
            format: spec.format,
            channels: spec.channels as usize,
            mask,
            input_len,
            accum: vec![0.0; input_len],
            fill: 0,
            resampler,
            resample_in: vec![vec![0.0; input_len]],
            resample_out: vec![vec![0.0; max_out]],
        })
    }

    /// Feed a burst of interleaved samples, invoking `emit` once per
    /// completed frame. Bursts of any size are accepted; partial frames
    /// stay in the accumulator until the next call.
    pub fn push(&mut self, data: SampleBuf<'_>, mut emit: impl FnMut(Frame)) {
        if data.format() != self.format {
            log::warn!(
                "frame assembler fed {:?} data, expected {:?}; burst ignored",
                data.format(),
                self.format
            );
            return;
        }
        let nsamp = data.len() / self.channels;
        let mut offset = 0;
        while offset < nsamp {
            let take = (self.input_len - self.fill).min(nsamp - offset);
            self.downmix(data, offset, take);
            self.fill += take;
            offset += take;
            if self.fill == self.input_len {
                self.fill = 0;
                emit(self.finish_frame());
            }
        }
    }

    /// Sum the masked channels of `count` time-steps starting at `offset`
    /// into the accumulator, converting S16 to float.
    fn downmix(&mut self, data: SampleBuf<'_>, offset: usize, count: usize) {
        let channels = self.channels;
        let mask = self.mask;
        let dst = &mut self.accum[self.fill..self.fill + count];
        match data {
            SampleBuf::F32(input) => {
                for (i, out) in dst.iter_mut().enumerate() {
                    let base = (offset + i) * channels;
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        if mask & (1u64 << ch) != 0 {
                            sum += input[base + ch];
                        }
                    }
                    *out = sum;
                }
            }
            SampleBuf::S16(input) => {
                for (i, out) in dst.iter_mut().enumerate() {
                    let base = (offset + i) * channels;
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        if mask & (1u64 << ch) != 0 {
                            sum += input[base + ch] as f32 * (1.0 / 32768.0);
                        }
                    }
                    *out = sum;
                }
            }
        }
    }

    /// Resample a full accumulator to the canonical rate if needed, then
    /// quantize to S16.
    fn finish_frame(&mut self) -> Frame {
        let mut resampled = [0.0f32; FRAME_SIZE];
        let samples: &[f32] = match &mut self.resampler {
            Some(resampler) => {
                self.resample_in[0].copy_from_slice(&self.accum);
                match resampler.process_into_buffer(&self.resample_in, &mut self.resample_out, None)
                {
                    Ok((_, produced)) => {
                        // Short output leaves a zero tail; long output is cut.
                        let n = produced.min(FRAME_SIZE);
                        resampled[..n].copy_from_slice(&self.resample_out[0][..n]);
                    }
                    Err(e) => log::warn!("resampler failed, emitting silence: {e}"),
                }
                &resampled
            }
            None => &self.accum,
        };

        let mut frame = Frame::silence();
        for (out, &sample) in frame.samples_mut().iter_mut().zip(samples) {
            *out = quantize(sample);
        }
        frame
    }
}

/// Float to S16 with saturating clamp. Full-scale positive input lands on
/// 32767 because the multiplier is 32768.
fn quantize(sample: f32) -> i16 {
    (sample * 32768.0).clamp(-32768.0, 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(format: SampleFormat, channels: u32, rate: u32, mask: u64) -> FrameAssembler {
        FrameAssembler::new(&StreamSpec {
            format,
            channels,
            rate,
            channel_mask: mask,
        })
        .unwrap()
    }

    fn collect(asm: &mut FrameAssembler, data: SampleBuf<'_>) -> Vec<Frame> {
        let mut frames = Vec::new();
        asm.push(data, |f| frames.push(f));
        frames
    }

    #[test]
    fn test_emits_fixed_size_frames() {
        let mut asm = assembler(SampleFormat::F32, 1, SAMPLE_RATE, u64::MAX);
        let input = vec![0.25f32; FRAME_SIZE * 3 + 17];
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame.samples().len(), FRAME_SIZE);
        }
    }

    #[test]
    fn test_partial_fill_carries_over() {
        let mut asm = assembler(SampleFormat::F32, 1, SAMPLE_RATE, u64::MAX);
        let first = vec![0.5f32; 100];
        assert!(collect(&mut asm, SampleBuf::F32(&first)).is_empty());
        let second = vec![0.5f32; FRAME_SIZE - 100];
        let frames = collect(&mut asm, SampleBuf::F32(&second));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples()[0], 16384);
    }

    #[test]
    fn test_quantization_saturates() {
        let mut asm = assembler(SampleFormat::F32, 1, SAMPLE_RATE, u64::MAX);
        let mut input = vec![0.0f32; FRAME_SIZE];
        input[0] = 1.0;
        input[1] = -1.0;
        input[2] = 1.5;
        input[3] = -2.0;
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        let samples = frames[0].samples();
        assert_eq!(samples[0], 32767);
        assert_eq!(samples[1], -32768);
        assert_eq!(samples[2], 32767);
        assert_eq!(samples[3], -32768);
    }

    #[test]
    fn test_downmix_sums_selected_channels() {
        // Stereo, right channel only: left +1.0 is ignored, right -0.5 wins.
        let mut asm = assembler(SampleFormat::F32, 2, SAMPLE_RATE, 0b10);
        let mut input = Vec::with_capacity(FRAME_SIZE * 2);
        for _ in 0..FRAME_SIZE {
            input.push(1.0f32);
            input.push(-0.5f32);
        }
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples()[0], -16384);
    }

    #[test]
    fn test_downmix_is_linear_over_mask() {
        // Both channels selected: 0.25 + 0.125 = 0.375.
        let mut asm = assembler(SampleFormat::F32, 2, SAMPLE_RATE, 0b11);
        let mut input = Vec::with_capacity(FRAME_SIZE * 2);
        for _ in 0..FRAME_SIZE {
            input.push(0.25f32);
            input.push(0.125f32);
        }
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert_eq!(frames[0].samples()[0], 12288);
    }

    #[test]
    fn test_empty_mask_yields_silence() {
        let mut asm = assembler(SampleFormat::F32, 2, SAMPLE_RATE, 0);
        let input = vec![0.9f32; FRAME_SIZE * 2];
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert!(frames[0].samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_mono_ignores_mask() {
        let mut asm = assembler(SampleFormat::F32, 1, SAMPLE_RATE, 0);
        let input = vec![0.5f32; FRAME_SIZE];
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert_eq!(frames[0].samples()[0], 16384);
    }

    #[test]
    fn test_s16_input_round_trips() {
        let mut asm = assembler(SampleFormat::S16, 1, SAMPLE_RATE, u64::MAX);
        let input = vec![-12000i16; FRAME_SIZE];
        let frames = collect(&mut asm, SampleBuf::S16(&input));
        assert_eq!(frames[0].samples()[0], -12000);
    }

    #[test]
    fn test_mismatched_format_is_ignored() {
        let mut asm = assembler(SampleFormat::S16, 1, SAMPLE_RATE, u64::MAX);
        let input = vec![0.5f32; FRAME_SIZE];
        let frames = collect(&mut asm, SampleBuf::F32(&input));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_resamples_cd_rate_to_canonical() {
        let mut asm = assembler(SampleFormat::S16, 1, 44100, u64::MAX);
        // One second of input in uneven bursts.
        let input = vec![1000i16; 44100];
        let mut frames = Vec::new();
        for chunk in input.chunks(997) {
            asm.push(SampleBuf::S16(chunk), |f| frames.push(f));
        }
        assert_eq!(frames.len(), 100);
        for frame in &frames {
            assert_eq!(frame.samples().len(), FRAME_SIZE);
        }
        // Settled output carries the input's DC level, within resampler
        // ripple.
        let mid = frames[50].samples();
        let avg: f64 = mid.iter().map(|&s| s as f64).sum::<f64>() / mid.len() as f64;
        assert!((avg - 1000.0).abs() < 100.0, "avg {avg}");
    }
}
