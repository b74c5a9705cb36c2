// src/main.rs - Print one job package from the command line
use clap::Parser;
use futures_util::{pin_mut, StreamExt};
use std::path::Path;

use resin_host::config::{self, Config};
use resin_host::file::validate_package;
use resin_host::layer_source::LayerSource;
use resin_host::{build_sequencer, BladeMode, ParameterOverrides, PrintEvent};

#[derive(Debug, Parser)]
#[command(name = "printer-host", version, about = "Prints a resin job package")]
struct Cli {
    /// Job package (.zip with run.gcode and numbered layer images)
    job: String,

    #[arg(short, long, default_value = "printer.toml")]
    config: String,

    /// Use simulated motion host and exposure device
    #[arg(long)]
    simulate: bool,

    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,

    #[arg(long)]
    led_power: Option<u16>,

    /// Blade feed rate in mm/min
    #[arg(long)]
    blade_speed: Option<f64>,

    /// roundtrip or oneway
    #[arg(long)]
    blade_mode: Option<BladeMode>,

    #[arg(long)]
    blade_cycles: Option<u32>,

    #[arg(long)]
    leveling_cycles: Option<u32>,

    /// Check the package and exit
    #[arg(long)]
    validate_only: bool,
}

impl Cli {
    fn overrides(&self) -> ParameterOverrides {
        ParameterOverrides {
            led_power: self.led_power,
            blade_speed: self.blade_speed,
            blade_mode: self.blade_mode,
            blade_cycles_per_layer: self.blade_cycles,
            leveling_cycles: self.leveling_cycles,
            ..ParameterOverrides::default()
        }
    }
}

fn load_or_default(path: &str) -> Result<Config, config::ConfigError> {
    if Path::new(path).exists() {
        tracing::info!("Loading configuration from: {}", path);
        config::load_config(path)
    } else {
        tracing::warn!("Configuration file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    tracing::info!("Starting resin print host");
    let config = load_or_default(&cli.config)?;
    tracing::info!(
        "Printer: {}",
        config.printer.printer_name.as_deref().unwrap_or("Unknown")
    );

    if let Err(e) = validate_package(&cli.job) {
        tracing::error!("Package '{}' rejected: {}", cli.job, e);
        return Err(e.into());
    }
    tracing::info!("Package '{}' is valid", cli.job);
    if cli.validate_only {
        return Ok(());
    }

    let sequencer = build_sequencer(&config, cli.simulate)?;
    let source = LayerSource::open(&cli.job)?;
    let overrides = config.print.merged_with(&cli.overrides());

    let events = sequencer.events();
    pin_mut!(events);
    let job_id = sequencer.start(source, &overrides).await?;
    tracing::info!("Job {} running, Ctrl-C to stop (twice for emergency stop)", job_id);

    let mut interrupts = 0;
    let outcome = loop {
        tokio::select! {
            event = events.next() => match event {
                Some(PrintEvent::Progress { current, total }) => {
                    tracing::info!("Progress: {}/{} layers", current, total);
                }
                Some(PrintEvent::LayerImageReady(image)) => {
                    tracing::debug!("Layer {} image ready ({} bytes)", image.index, image.data.len());
                }
                Some(event) if event.is_terminal() => break Some(event),
                Some(event) => tracing::debug!("Event: {:?}", event),
                None => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    tracing::warn!("Interrupt received, stopping job");
                    sequencer.stop();
                } else if let Err(e) = sequencer.emergency_stop().await {
                    tracing::error!("Emergency stop failed: {}", e);
                }
            }
        }
    };
    sequencer.join().await?;

    match outcome {
        Some(PrintEvent::Completed) => tracing::info!("Print completed"),
        Some(PrintEvent::Stopped) => tracing::info!("Print stopped"),
        Some(PrintEvent::Error(message)) => {
            tracing::error!("Print failed: {}", message);
            std::process::exit(1);
        }
        _ => {
            tracing::error!("Event stream closed before the job finished");
            std::process::exit(1);
        }
    }
    Ok(())
}
