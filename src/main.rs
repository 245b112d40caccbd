//! Command-line entry point.
//!
//! ```bash
//! spectro_daq run                       # live session, commands on stdin
//! spectro_daq run --force-dark-refresh  # ignore the dark cache
//! spectro_daq calibrate                 # re-acquire the dark reference only
//! spectro_daq view data.bin             # summarise an exported spectrum
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spectro_daq::acquisition::{DarkCalibrator, FrameReader, SpectrumAcquirer};
use spectro_daq::config::{SpectroConfig, DEFAULT_CONFIG_PATH};
use spectro_daq::core::WavelengthAxis;
use spectro_daq::data::{store_for, ArrayFile};
use spectro_daq::instrument::mock::{EmissionLine, MockSpectrometer};
use spectro_daq::messages::SessionCommand;
use spectro_daq::session::{DisplayUpdate, SessionController, SessionOptions};
use spectro_daq::tracing_init;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "spectro_daq")]
#[command(about = "Dark-corrected spectrum acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live session. Operator commands are read from stdin, one per line.
    Run {
        /// Re-acquire the dark reference even if a cache exists
        #[arg(long)]
        force_dark_refresh: bool,
    },
    /// Acquire a fresh dark reference, write the cache and exit
    Calibrate,
    /// Print a summary of an exported spectrum
    View {
        /// Exported file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SpectroConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing_init::init_from_config(&config.application)?;

    match cli.command {
        Commands::Run { force_dark_refresh } => run(&config, force_dark_refresh).await,
        Commands::Calibrate => calibrate(&config).await,
        Commands::View { path } => view(&config, &path),
    }
}

async fn run(config: &SpectroConfig, force_dark_refresh: bool) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let reader = open_reader(config, cancel).await?;
    let store = store_for(config.storage.format);
    let calibrator = DarkCalibrator::new(store.clone(), config.calibration.cache_path.clone());
    let acquirer = SpectrumAcquirer::new(
        reader,
        calibrator,
        config.calibration.reference_exposure,
        force_dark_refresh || config.calibration.force_refresh,
    )
    .await?;

    let controller =
        SessionController::new(acquirer, store, SessionOptions::from_config(config)).await?;
    tokio::spawn(log_display_updates(controller.subscribe()));

    let (command_tx, command_rx) = mpsc::channel(config.session.command_channel_capacity);
    spawn_stdin_commands(command_tx);
    info!("Commands: acquire [s], exposure <s>, autoscale, log, save [path], restart, dark, quit");

    let state = controller.run(command_rx).await?;
    info!(
        mode = ?state.mode(),
        requested_exposure = ?state.requested_exposure(),
        "Session finished"
    );
    Ok(())
}

async fn calibrate(config: &SpectroConfig) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let mut reader = open_reader(config, cancel).await?;
    let calibrator = DarkCalibrator::new(
        store_for(config.storage.format),
        config.calibration.cache_path.clone(),
    );
    let dark = calibrator
        .get_reference(&mut reader, config.calibration.reference_exposure, true)
        .await?;
    let stats = reader.stats();
    info!(
        path = %calibrator.cache_path().display(),
        frames = dark.frames_averaged().unwrap_or_default(),
        transient_failures = stats.transient_failures,
        "Dark reference written"
    );
    Ok(())
}

fn view(config: &SpectroConfig, path: &std::path::Path) -> Result<()> {
    let Some(file) = store_for(config.storage.format).load(path)? else {
        bail!("{} does not exist", path.display());
    };
    let [wavelengths, intensities] = file.rows.as_slice() else {
        bail!(
            "{} holds {} rows, expected wavelengths and intensities",
            path.display(),
            file.rows.len()
        );
    };
    if wavelengths.len() != intensities.len() || wavelengths.is_empty() {
        bail!("{} has mismatched or empty rows", path.display());
    }
    print_summary(&file, wavelengths, intensities);
    Ok(())
}

fn print_summary(file: &ArrayFile, wavelengths: &[f64], intensities: &[f64]) {
    const LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    const COLUMNS: usize = 64;

    for (key, value) in &file.metadata {
        println!("{key:>22}: {value}");
    }
    let (peak_index, peak) = intensities
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
    println!("{:>22}: {}", "pixels", wavelengths.len());
    println!(
        "{:>22}: {:.1} .. {:.1} nm",
        "range",
        wavelengths[0],
        wavelengths[wavelengths.len() - 1]
    );
    println!("{:>22}: {:.1} at {:.1} nm", "peak", peak, wavelengths[peak_index]);

    let chunk = intensities.len().div_ceil(COLUMNS).max(1);
    let bins: Vec<f64> = intensities
        .chunks(chunk)
        .map(|c| c.iter().copied().filter(|v| v.is_finite()).fold(f64::NEG_INFINITY, f64::max))
        .collect();
    let floor = bins.iter().copied().filter(|v| v.is_finite()).fold(f64::INFINITY, f64::min);
    let span = (peak - floor).max(f64::EPSILON);
    let line: String = bins
        .iter()
        .map(|v| {
            if !v.is_finite() {
                return LEVELS[0];
            }
            let level = ((v - floor) / span * (LEVELS.len() - 1) as f64).round() as usize;
            LEVELS[level.min(LEVELS.len() - 1)]
        })
        .collect();
    println!("{line}");
}

async fn open_reader(
    config: &SpectroConfig,
    cancel: CancellationToken,
) -> Result<FrameReader<MockSpectrometer>> {
    let device = &config.device;
    let axis = WavelengthAxis::linear(
        device.wavelength_start_nm,
        device.wavelength_end_nm,
        device.pixels,
    )?;
    // Hg-Ar calibration lamp.
    let lines = [
        (404.66, 2.0, 900.0),
        (435.83, 2.0, 2400.0),
        (546.07, 2.0, 4200.0),
        (576.96, 2.0, 800.0),
        (579.07, 2.0, 850.0),
        (763.51, 2.5, 1600.0),
        (811.53, 2.5, 1300.0),
    ]
    .into_iter()
    .map(|(center_nm, width_nm, amplitude)| EmissionLine {
        center_nm,
        width_nm,
        amplitude,
    })
    .collect();
    let spectrometer =
        MockSpectrometer::synthetic(device.id.clone(), axis, lines, device.dark_level, device.noise_amplitude)
            .with_failure_rate(device.failure_rate)
            .with_simulated_timing(device.simulate_timing)
            .with_seed(device.seed);

    let mut reader = FrameReader::new(spectrometer, config.acquisition.retry.clone())
        .with_cancellation(cancel);
    reader.configure(device.native_integration_time).await?;
    Ok(reader)
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            token.cancel();
        }
    });
    cancel
}

/// Stdin is read on a plain thread so a pending read never holds up runtime
/// shutdown. End of input drops the sender, which ends the session.
fn spawn_stdin_commands(commands: mpsc::Sender<SessionCommand>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "Failed to read operator input");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<SessionCommand>() {
                Ok(command) => {
                    if commands.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "Ignoring operator input"),
            }
        }
    });
}

async fn log_display_updates(mut updates: broadcast::Receiver<Arc<DisplayUpdate>>) {
    loop {
        match updates.recv().await {
            Ok(update) => debug!(
                mode = ?update.mode,
                scale = ?update.scale,
                lower = update.y_limits.lower,
                upper = update.y_limits.upper,
                peak = ?update.spectrum.max(),
                "Display update"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Display logger lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
