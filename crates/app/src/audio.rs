use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use echosync_core::constants::{FRAME_MS, FRAME_SIZE, SAMPLE_RATE};
use echosync_core::{EchoPipeline, PipelineConfig, SampleBuf, SampleFormat, StreamSpec};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Settings for [`AudioEngine::start`], resolved from CLI flags and the
/// persisted app config.
pub struct EngineOptions {
    pub input: String,
    pub output: String,
    /// Loopback/monitor device to capture the far-end signal from.
    pub reference: Option<String>,
    /// Feed a generated test tone as the reference instead of a device.
    pub tone_reference: bool,
    pub aec_enabled: bool,
    pub denoise: bool,
    pub agc: bool,
    pub vad: bool,
    pub debug: bool,
}

/// Wires cpal capture and render streams to an [`EchoPipeline`].
///
/// The mic and reference callbacks feed the pipeline directly; the render
/// callback drains it, padding with silence when the pipeline is starved.
pub struct AudioEngine {
    _mic_stream: cpal::Stream,
    _reference_stream: Option<cpal::Stream>,
    _output_stream: cpal::Stream,
    is_running: Arc<AtomicBool>,
    pub pipeline: Arc<EchoPipeline>,
}

impl AudioEngine {
    pub fn start(options: &EngineOptions) -> Result<Self> {
        let host = cpal::default_host();
        info!("Audio host: {}", host.id().name());

        let mic_device = find_input_device(&host, &options.input)?;
        info!("Using input device: {}", mic_device.name().unwrap_or_default());

        let output_device = find_output_device(&host, &options.output)?;
        info!(
            "Using output device: {}",
            output_device.name().unwrap_or_default()
        );

        let reference_device = match (&options.reference, options.aec_enabled) {
            (Some(name), true) => {
                let device = find_input_device(&host, name)
                    .context("reference capture device not found")?;
                info!(
                    "Using reference device: {}",
                    device.name().unwrap_or_default()
                );
                Some(device)
            }
            _ => None,
        };

        let mic_config = mic_device
            .default_input_config()
            .context("no default mic config")?;
        let mic_spec = stream_spec(&mic_config)?;

        let reference_spec = match &reference_device {
            Some(device) => {
                let config = device
                    .default_input_config()
                    .context("no default reference config")?;
                stream_spec(&config)?
            }
            // Tone generator and disabled-AEC paths both feed canonical
            // mono S16.
            None => StreamSpec::canonical(),
        };

        let pipeline = Arc::new(EchoPipeline::new(PipelineConfig {
            aec_enabled: options.aec_enabled,
            mic: mic_spec,
            reference: reference_spec,
            denoise: options.denoise,
            agc: options.agc,
            vad: options.vad,
            debug: options.debug,
            ..PipelineConfig::default()
        })?);

        let mic_stream = build_capture_stream(&mic_device, &mic_config, {
            let pipeline = pipeline.clone();
            move |data| pipeline.add_mic(data)
        })?;

        let reference_stream = match &reference_device {
            Some(device) => {
                let config = device.default_input_config()?;
                let pipeline = pipeline.clone();
                Some(build_capture_stream(device, &config, move |data| {
                    pipeline.add_reference(data)
                })?)
            }
            None => None,
        };

        // Render at the canonical format so pulled samples map one to one.
        let output_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let output_stream = {
            let pipeline = pipeline.clone();
            let mut scratch = vec![0i16; FRAME_SIZE * 8];
            output_device.build_output_stream(
                &output_config,
                move |data: &mut [f32], _| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0);
                    }
                    let got = pipeline.pull_output(&mut scratch, data.len());
                    for (out, &s) in data.iter_mut().zip(&scratch[..got]) {
                        *out = s as f32 * (1.0 / 32768.0);
                    }
                    for out in data.iter_mut().skip(got) {
                        *out = 0.0;
                    }
                },
                |err| warn!("Output error: {}", err),
                None,
            )?
        };

        let is_running = Arc::new(AtomicBool::new(true));

        if options.tone_reference && options.aec_enabled && reference_device.is_none() {
            spawn_tone_generator(pipeline.clone(), is_running.clone())?;
        }

        mic_stream.play()?;
        if let Some(stream) = &reference_stream {
            stream.play()?;
        }
        output_stream.play()?;

        Ok(Self {
            _mic_stream: mic_stream,
            _reference_stream: reference_stream,
            _output_stream: output_stream,
            is_running,
            pipeline,
        })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
    }
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name == "default" {
        host.default_input_device()
            .context("No default input found")
    } else {
        host.input_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Input device not found")
    }
}

fn find_output_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name == "default" {
        host.default_output_device()
            .context("No default output found")
    } else {
        host.output_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Output device not found")
    }
}

/// Describe a cpal capture config in pipeline terms.
fn stream_spec(config: &cpal::SupportedStreamConfig) -> Result<StreamSpec> {
    let format = match config.sample_format() {
        cpal::SampleFormat::F32 => SampleFormat::F32,
        cpal::SampleFormat::I16 => SampleFormat::S16,
        other => bail!("unsupported capture sample format {other:?}"),
    };
    Ok(StreamSpec {
        format,
        channels: config.channels() as u32,
        rate: config.sample_rate().0,
        channel_mask: u64::MAX,
    })
}

/// Open a capture stream in the device's native sample type and hand each
/// burst to `sink`.
fn build_capture_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    sink: impl Fn(SampleBuf<'_>) + Send + 'static,
) -> Result<cpal::Stream> {
    let stream_config: cpal::StreamConfig = config.config();
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| sink(SampleBuf::F32(data)),
            |err| warn!("Capture error: {}", err),
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| sink(SampleBuf::S16(data)),
            |err| warn!("Capture error: {}", err),
            None,
        )?,
        other => bail!("unsupported capture sample format {other:?}"),
    };
    Ok(stream)
}

/// Feed a 440Hz tone as the far-end signal, one frame every 10ms. Useful
/// for exercising the pairing path on machines without a loopback source.
fn spawn_tone_generator(pipeline: Arc<EchoPipeline>, run_flag: Arc<AtomicBool>) -> Result<()> {
    thread::Builder::new()
        .name("echosync-tone".into())
        .spawn(move || {
            let mut frame = [0i16; FRAME_SIZE];
            let mut phase = 0usize;
            while run_flag.load(Ordering::Relaxed) {
                for sample in frame.iter_mut() {
                    let t = phase as f32 / SAMPLE_RATE as f32;
                    *sample = (6000.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16;
                    phase = (phase + 1) % SAMPLE_RATE as usize;
                }
                pipeline.add_reference(SampleBuf::S16(&frame));
                thread::sleep(Duration::from_millis(FRAME_MS as u64));
            }
        })
        .context("Failed to spawn tone generator thread")?;
    Ok(())
}
