//! CLI Entry Point for thorlabs-daq
//!
//! Runs the two measurement procedures on simulated hardware and fits
//! profiles recorded elsewhere:
//!
//! ```bash
//! thorlabs-daq lockin --cycles 3 --servo-time 2.0
//! thorlabs-daq autocorrelate --frames 5 --sech2
//! thorlabs-daq fit profile.txt --pixel-to-fs 0.764 --json
//! ```
//!
//! Configuration comes from `config/thorlabs_daq.toml` (or `--config`) and
//! `THORLABS_DAQ_*` environment variables; command-line flags win. Ctrl-C
//! stops a running measurement and parks the hardware.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use thorlabs_daq::analysis::{parse_profile, AverageAxis, PulseShape, PulseWidthEstimator};
use thorlabs_daq::config::{LabConfig, DEFAULT_CONFIG_PATH};
use thorlabs_daq::hardware::mock::{MockCamera, MockPowerMeter, MockServo};
use thorlabs_daq::hardware::BoundedAxis;
use thorlabs_daq::logging;
use thorlabs_daq::procedures::{
    execute_procedure_safely, AutocorrelatorProcedure, LockInPowerProcedure, Procedure,
    ProcedureContext, ProcedureProgress, ProcedureResult,
};
use thorlabs_daq::StopFlag;

const LOCKIN_KEYS: &[&str] = &[
    "lockin_signal",
    "mean_on",
    "mean_off",
    "on_samples",
    "off_samples",
    "skipped_reads",
];

const AUTOCORRELATOR_KEYS: &[&str] = &[
    "duration_fs",
    "mean_duration_fs",
    "fit_width_px",
    "fit_center_px",
    "frames_fitted",
    "fps",
];

#[derive(Parser)]
#[command(name = "thorlabs-daq", version)]
#[command(about = "Lock-in power and autocorrelator pulse-width measurements", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print the full result as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chopped-beam power measurement (simulated servo and power meter)
    Lockin {
        /// Number of ON/OFF cycles (1-300)
        #[arg(long)]
        cycles: Option<u32>,

        /// Full chopper period in seconds
        #[arg(long)]
        servo_time: Option<f64>,

        /// Power meter wavelength in nm
        #[arg(long)]
        wavelength: Option<f64>,
    },

    /// Pulse-width measurement (simulated autocorrelator camera)
    Autocorrelate {
        #[arg(long)]
        frames: Option<u32>,

        #[arg(long)]
        exposure_ms: Option<f64>,

        /// Average frames vertically (one value per column)
        #[arg(long)]
        vertical: bool,

        /// Average frames horizontally (one value per row)
        #[arg(long)]
        horizontal: bool,

        #[command(flatten)]
        fit: FitFlags,
    },

    /// Fit a profile stored as whitespace or comma separated numbers
    Fit {
        file: PathBuf,

        #[command(flatten)]
        fit: FitFlags,
    },
}

/// Pulse shape toggles and calibration shared by the fitting commands.
#[derive(clap::Args)]
struct FitFlags {
    /// Assume Gaussian pulses
    #[arg(long)]
    gaussian: bool,

    /// Assume sech² pulses
    #[arg(long)]
    sech2: bool,

    /// Femtoseconds per pixel
    #[arg(long)]
    pixel_to_fs: Option<f64>,
}

impl FitFlags {
    fn shape(&self, configured: PulseShape) -> Result<PulseShape> {
        if self.gaussian || self.sech2 {
            Ok(PulseShape::from_toggles(self.gaussian, self.sech2)?)
        } else {
            Ok(configured)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level.clone_from(level);
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    config.validate()?;

    let stop = StopFlag::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            ctrl_c.trigger("interrupted by user");
        }
    });

    match cli.command {
        Commands::Lockin {
            cycles,
            servo_time,
            wavelength,
        } => {
            if let Some(n) = cycles {
                config.lockin.cycle_count = n;
            }
            if let Some(t) = servo_time {
                config.lockin.servo_time_s = t;
            }
            if wavelength.is_some() {
                config.lockin.wavelength_nm = wavelength;
            }
            let mut procedure = build_lockin(&config)?;
            let result = run(&mut procedure, stop).await?;
            report(&result, cli.json, LOCKIN_KEYS)
        }
        Commands::Autocorrelate {
            frames,
            exposure_ms,
            vertical,
            horizontal,
            fit,
        } => {
            let ac = &mut config.autocorrelator;
            if let Some(n) = frames {
                ac.frames = n;
            }
            if let Some(ms) = exposure_ms {
                ac.exposure_ms = ms;
            }
            if let Some(k) = fit.pixel_to_fs {
                ac.pixel_to_fs = k;
            }
            ac.shape = fit.shape(ac.shape)?;
            if vertical || horizontal {
                ac.average_axis = AverageAxis::from_toggles(vertical, horizontal)?;
            }

            let mut procedure = build_autocorrelator(&config);
            let result = run(&mut procedure, stop).await?;
            report(&result, cli.json, AUTOCORRELATOR_KEYS)
        }
        Commands::Fit { file, fit } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let profile = parse_profile(&text)?;
            let shape = fit.shape(config.autocorrelator.shape)?;
            let pixel_to_fs = fit.pixel_to_fs.unwrap_or(config.autocorrelator.pixel_to_fs);

            let estimator = PulseWidthEstimator::with_options(config.autocorrelator.fit)?;
            let estimate = estimator.fit_profile(&profile, shape, pixel_to_fs)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&estimate)?);
            } else {
                let p = estimate.fit.params;
                println!("amplitude   {:.6}", p.amplitude);
                println!("center_px   {:.4}", p.center);
                println!("width_px    {:.4}", estimate.duration.width_pixels);
                println!("shape       {shape}");
                println!("duration_fs {:.3}", estimate.duration.duration);
            }
            Ok(())
        }
    }
}

fn build_lockin(config: &LabConfig) -> Result<LockInPowerProcedure> {
    let devices = &config.devices;
    let servo = MockServo::new("chopper_servo").with_travel_time(devices.servo.travel_time);
    let chopper = BoundedAxis::new(Arc::new(servo.clone()), devices.servo.axis.clone())?;

    let mut meter = MockPowerMeter::new("power_meter")
        .with_beam(devices.beam)
        .with_chopper(servo);
    if let Some(seed) = devices.seed {
        meter = meter.with_seed(seed);
    }
    let meter = Arc::new(meter);

    Ok(
        LockInPowerProcedure::new(config.lockin.clone(), Arc::new(chopper), meter.clone())
            .with_wavelength_control(meter),
    )
}

fn build_autocorrelator(config: &LabConfig) -> AutocorrelatorProcedure {
    let cam = &config.devices.camera;
    let mut camera = MockCamera::new(cam.width, cam.height).with_scene(cam.scene);
    if let Some(seed) = config.devices.seed {
        camera = camera.with_seed(seed);
    }
    let camera = Arc::new(camera);
    AutocorrelatorProcedure::new(config.autocorrelator.clone(), camera.clone())
        .with_exposure_control(camera)
}

async fn run(procedure: &mut dyn Procedure, stop: StopFlag) -> Result<ProcedureResult> {
    let (ctx, progress) = ProcedureContext::new(stop);
    let watcher = tokio::spawn(log_progress(progress));
    let result = execute_procedure_safely(procedure, &ctx).await;
    drop(ctx);
    let _ = watcher.await;
    result
}

async fn log_progress(mut rx: watch::Receiver<ProcedureProgress>) {
    while rx.changed().await.is_ok() {
        let p = rx.borrow_and_update().clone();
        tracing::info!(
            state = ?p.state,
            step = %p.step_name,
            percent = p.overall_progress * 100.0,
            "progress"
        );
    }
}

fn report(result: &ProcedureResult, json: bool, keys: &[&str]) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("{}", result.summary());
    for key in keys {
        if let Some(v) = result.float(key) {
            println!("  {key:<18} {v:.6e}");
        }
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}
