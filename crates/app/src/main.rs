use anyhow::Result;
use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod audio;
mod config;

#[derive(Parser)]
#[command(name = "echosync")]
#[command(about = "EchoSync: echo-cancelled microphone capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Run the pipeline in foreground (press Ctrl+C to stop)
    Run {
        #[arg(short, long, default_value = "default")]
        input: String,
        #[arg(short, long, default_value = "default")]
        output: String,
        /// Loopback/monitor device carrying the far-end signal
        #[arg(short, long)]
        reference: Option<String>,
        /// Generate a test tone as the reference signal
        #[arg(long)]
        tone_reference: bool,
        /// Disable echo cancellation (denoise/AGC still run)
        #[arg(long)]
        no_aec: bool,
        /// Log queue fill levels and drop events
        #[arg(long)]
        debug: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List) => {
            list_devices()?;
        }
        Some(Commands::Run {
            input,
            output,
            reference,
            tone_reference,
            no_aec,
            debug,
        }) => {
            let mut app_config = config::AppConfig::load();
            app_config.last_input = input;
            app_config.last_output = output;
            if reference.is_some() {
                app_config.last_reference = reference;
            }
            if no_aec {
                app_config.aec_enabled = false;
            }
            if debug {
                app_config.debug = true;
            }

            let engine = audio::AudioEngine::start(&audio::EngineOptions {
                input: app_config.last_input.clone(),
                output: app_config.last_output.clone(),
                reference: app_config.last_reference.clone(),
                tone_reference,
                aec_enabled: app_config.aec_enabled,
                denoise: app_config.denoise,
                agc: app_config.agc,
                vad: app_config.vad,
                debug: app_config.debug,
            })?;
            app_config.save();
            println!("EchoSync active. Press Ctrl+C to stop.");

            // Graceful shutdown handling
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();

            ctrlc::set_handler(move || {
                println!("\nShutting down gracefully...");
                r.store(false, Ordering::Relaxed);
            })?;

            let mut ticks = 0u32;
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(100));
                ticks += 1;
                if ticks % 50 == 0 {
                    let stats = engine.pipeline.stats();
                    log::debug!(
                        "processed={} dropped_mic={} dropped_ref={} dropped_out={} state={:?}",
                        stats.processed_frames,
                        stats.dropped_mic_frames,
                        stats.dropped_ref_frames,
                        stats.dropped_output_frames,
                        stats.state,
                    );
                }
            }

            println!("EchoSync stopped.");
        }
        None => {
            println!("No command given. Try 'echosync list' or 'echosync run'.");
        }
    }

    Ok(())
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
