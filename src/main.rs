use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;

use clap_verbosity_flag::{Verbosity, WarnLevel};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gonio_lib::orchestrator::{Controller, Notice};
use gonio_lib::{
    Channel, Operation, SerialChannel, SessionConfig, SessionEvent, SessionOutcome, SessionState, photometry,
};
use gonio_rs::config::Settings;
use gonio_rs::sink::{self, ResultWriter, SensorSummary};

/// Host for the rotating goniophotometer rig.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; created on first calibration if missing.
    #[arg(short, long, default_value = "gonio.toml")]
    config: PathBuf,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a measurement; Ctrl+C stops it and keeps the data received so far.
    Measure {
        /// Name used in the result file names.
        #[arg(default_value = "measure")]
        name: String,
        #[command(flatten)]
        device: DeviceArgs,
        /// Polar resolution, degrees per sample.
        #[arg(long)]
        res_theta: Option<f32>,
        /// Azimuth resolution, degrees per sample.
        #[arg(long)]
        res_phi: Option<f32>,
        /// Skip the flux and FWHM computation.
        #[arg(long)]
        no_photometry: bool,
    },
    /// Measure the sensor dark offset and store it in the configuration.
    Calibrate {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// List serial ports, marking the one matching the device pattern.
    Ports,
    /// Recompute flux and FWHM from a results or raw file.
    Compute {
        file: PathBuf,
        /// Polar resolution the file was measured with.
        #[arg(long)]
        res_theta: Option<f32>,
        /// Azimuth resolution the file was measured with.
        #[arg(long)]
        res_phi: Option<f32>,
    },
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Serial port, overriding the configured one and the device pattern.
    #[arg(short, long)]
    port: Option<String>,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<WarnLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // Session progress is printed to stdout, so the console log stays at
    // WARN unless raised with -v.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let result = match cli.command {
        Commands::Measure {
            name,
            device,
            res_theta,
            res_phi,
            no_photometry,
        } => {
            let mut settings = Settings::load(&cli.config)?;
            apply_device_args(&mut settings, device);
            if let Some(res) = res_theta {
                settings.scan.res_theta = res;
            }
            if let Some(res) = res_phi {
                settings.scan.res_phi = res;
            }
            if no_photometry {
                settings.results.photometry = false;
            }
            run_measure(settings, name).await
        }
        Commands::Calibrate { device } => {
            let mut settings = Settings::load(&cli.config)?;
            apply_device_args(&mut settings, device);
            run_calibrate(settings, &cli.config).await
        }
        Commands::Ports => list_ports(&Settings::load(&cli.config)?),
        Commands::Compute {
            file,
            res_theta,
            res_phi,
        } => {
            let mut settings = Settings::load(&cli.config)?;
            if let Some(res) = res_theta {
                settings.scan.res_theta = res;
            }
            if let Some(res) = res_phi {
                settings.scan.res_phi = res;
            }
            compute(&settings, &file)
        }
    };

    if let Err(e) = result {
        error!("{:?}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
    Ok(())
}

fn apply_device_args(settings: &mut Settings, device: DeviceArgs) {
    if device.port.is_some() {
        settings.device.port = device.port;
    }
}

async fn run_measure(settings: Settings, name: String) -> Result<()> {
    settings.validate()?;
    let mut config = SessionConfig::measure(settings.scan_config(), settings.conversion())
        .named(name)
        .with_vocabulary(settings.vocabulary())
        .with_ack_timeout(settings.ack_timeout());
    if !settings.results.photometry {
        config = config.without_photometry();
    }

    let started = Local::now();
    let writer = ResultWriter::new(&settings.results, started)?;
    let outcome = run_session(&settings, config).await?;

    let sensor = SensorSummary {
        distance_m: settings.sensor.distance_m,
        offset_v: settings.sensor.offset_v,
    };
    match writer.write(&outcome, sensor)? {
        Some(files) => {
            println!("Results written to {}", files.results.display());
            if let Some(raw) = files.raw {
                println!("Raw data written to {}", raw.display());
            }
        }
        None => println!("No samples received, no results written."),
    }

    report_outcome(&outcome)
}

async fn run_calibrate(mut settings: Settings, config_path: &Path) -> Result<()> {
    let config = SessionConfig::calibrate()
        .with_vocabulary(settings.vocabulary())
        .with_ack_timeout(settings.ack_timeout());
    let outcome = run_session(&settings, config).await?;

    if let Some(offset) = outcome.calibration_offset {
        settings.sensor.offset_v = offset;
        settings
            .save(config_path)
            .with_context(|| format!("Failed to store the calibration offset in {:?}", config_path))?;
        println!("Calibration offset {} V stored in {}", offset, config_path.display());
    }

    report_outcome(&outcome)
}

/// Runs one session through the controller, forwarding Ctrl+C as a stop.
async fn run_session(settings: &Settings, config: SessionConfig) -> Result<SessionOutcome> {
    let serial = settings.serial_settings();
    let (mut controller, task) = Controller::spawn(move || SerialChannel::new(serial.clone()));
    if !controller.start(config).await {
        bail!("Controller exited before the session started");
    }

    let mut samples = 0usize;
    let outcome = loop {
        tokio::select! {
            notice = controller.next_notice() => match notice {
                Some(Notice::Session(SessionEvent::Log(line))) => println!("{}", line),
                Some(Notice::Session(SessionEvent::State(state))) => debug!(%state, "session state"),
                Some(Notice::Session(SessionEvent::Sample(sample))) => {
                    samples += 1;
                    debug!(samples, %sample, "sample received");
                }
                Some(Notice::Finished(outcome)) => break *outcome,
                Some(Notice::Busy(name)) => bail!("A session is already running ({})", name),
                Some(Notice::Lost(reason)) => bail!("Session aborted: {}", reason),
                None => bail!("Controller exited without a result"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, stopping the device.");
                println!("Stopping...");
                controller.stop().await;
            }
        }
    };

    controller.shutdown().await;
    task.await.context("Controller task failed")?;
    Ok(outcome)
}

fn report_outcome(outcome: &SessionOutcome) -> Result<()> {
    for e in &outcome.errors {
        warn!("{}", e);
    }
    if outcome.malformed_records > 0 {
        println!("{} malformed record(s) skipped.", outcome.malformed_records);
    }
    if outcome.device_unresponsive {
        println!("The device did not answer. Check the connection and restart it if needed.");
    }
    if outcome.operation == Operation::Calibrate && outcome.calibration_offset.is_none() {
        println!("No calibration offset received; the configuration was not changed.");
    }
    if outcome.final_state == SessionState::Failed {
        bail!("{} {} failed", outcome.operation, outcome.name);
    }
    Ok(())
}

/// Lists the ports, marking the one a session would open.
fn list_ports(settings: &Settings) -> Result<()> {
    let channel = SerialChannel::new(settings.serial_settings());
    let ports = channel.list_available().context("Failed to list serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    let selected = channel.resolve_port().ok();
    for port in &ports {
        let marker = if selected.as_deref() == Some(port.as_str()) {
            "*"
        } else {
            " "
        };
        let description = channel.describe(port).unwrap_or_default();
        println!("{} {:<20} {}", marker, port, description);
    }
    if selected.is_none() {
        println!("No port matches '{}'.", settings.device.regex);
    }
    Ok(())
}

fn compute(settings: &Settings, file: &Path) -> Result<()> {
    let resolution = settings.resolution();
    resolution.validate()?;
    let samples = sink::read_samples(file, settings.results.csv_separator)?;
    if samples.is_empty() {
        bail!("No samples found in {:?}", file);
    }
    let report = photometry::analyze(&samples, resolution);

    println!(
        "Samples: {} (expected {} for a semi-sphere, at most {} for a sphere)",
        report.actual_count, report.expected_semi_sphere, report.expected_full_sphere
    );
    match &report.flux {
        Ok(flux) => println!("Luminous flux: {:.2} lm", flux),
        Err(e) => println!("Luminous flux: {}", e),
    }
    println!(
        "FWHM: {:.2} º horizontal, {:.2} º vertical",
        report.fwhm.horizontal, report.fwhm.vertical
    );
    Ok(())
}
