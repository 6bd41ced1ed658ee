//! CareLink Agent
//!
//! Patient monitoring daemon for a wearable Linux board.
//!
//! - Samples the IMU and detects falls
//! - Tracks the latest GPS fix from the receiver's NMEA stream
//! - Sends fall alerts and periodic location updates as SMS
//! - In `--simulate` mode, runs against simulated IMU, GPS and modem

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use carelink_agent::dispatch::{AlertBuilder, AlertDispatcher};
use carelink_agent::modem::{
    CommandReset, HardwareReset, ModemDriver, NoReset, SerialDevice, Transport,
};
use carelink_agent::orchestrator::Orchestrator;
use carelink_agent::position::PositionTracker;
use carelink_agent::sensor::{Mpu6050, SampleSource};
use carelink_agent::sim::{self, ModemBehavior, SimulatedImu, SimulatedModem};
use carelink_common::config::{MonitorConfig, MonitorConfigInput};
use carelink_common::models::Coordinates;
use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tracing_subscriber::EnvFilter;

/// Number used for alerts in simulation mode when none is configured.
const SIMULATED_DESTINATION: &str = "+15550100";

/// CareLink patient monitoring daemon.
#[derive(Parser, Debug)]
#[command(name = "carelink-agent", about = "CareLink fall detection and alerting agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Run against simulated hardware.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Seconds between synthetic falls in simulation mode (0 disables).
    #[arg(long, default_value_t = 90)]
    simulate_fall_every: u64,

    /// Patient identifier override.
    #[arg(long)]
    patient_id: Option<String>,

    /// Alert destination number override.
    #[arg(long)]
    destination: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!(
        patient = %config.patient.id,
        device = %config.patient.device_tag,
        simulate = cli.simulate,
        "carelink-agent starting"
    );

    // ── Task 1: GPS reader ──────────────────────────────────────
    let position = Arc::new(PositionTracker::new(config.position.clone()));
    match gps_reader(&cli, &config).await {
        Ok(reader) => {
            let tracker = position.clone();
            tokio::spawn(async move { tracker.run(reader).await });
        }
        Err(e) => tracing::error!(
            device = %config.devices.gps.display(),
            "GPS unavailable, alerts will carry no position: {e:#}"
        ),
    }

    // ── Modem ───────────────────────────────────────────────────
    let (transport, reset) = modem_hardware(&cli, &config)?;
    let driver = Arc::new(ModemDriver::new(transport, reset, config.modem.clone()));
    let init_driver = driver.clone();
    tokio::spawn(async move {
        if let Err(e) = init_driver.initialize().await {
            tracing::error!("modem unavailable, alerts will fail until it recovers: {e}");
        }
    });
    let dispatcher = Arc::new(AlertDispatcher::new(
        driver.clone(),
        config.modem.destination.as_str(),
    ));

    // ── Task 2: Monitoring loop ─────────────────────────────────
    let source: Box<dyn SampleSource> = if cli.simulate {
        let every = (cli.simulate_fall_every > 0)
            .then(|| Duration::from_secs(cli.simulate_fall_every));
        Box::new(SimulatedImu::new(every))
    } else {
        let imu = Mpu6050::open(&config.devices.i2c_bus, config.devices.imu_address)
            .with_context(|| {
                format!("failed to open IMU on {}", config.devices.i2c_bus.display())
            })?;
        Box::new(imu)
    };
    let orchestrator = Orchestrator::new(
        source,
        config.fall.clone(),
        AlertBuilder::new(config.patient.clone(), position.clone()),
        dispatcher,
        config.heartbeat.clone(),
    );
    let monitor_handle = tokio::spawn(orchestrator.run());

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        result = monitor_handle => {
            if let Err(e) = result {
                tracing::error!("monitoring task failed: {e}");
            }
        }
    }

    tracing::info!("carelink-agent stopped");
    Ok(())
}

/// File config (if any) with command-line overrides applied.
fn load_config(cli: &Cli) -> anyhow::Result<MonitorConfig> {
    let mut input = match &cli.config {
        Some(path) => MonitorConfigInput::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MonitorConfigInput::default(),
    };
    if let Some(id) = &cli.patient_id {
        input.patient.id = Some(id.clone());
    }
    if let Some(destination) = &cli.destination {
        input.modem.destination = Some(destination.clone());
    }
    if cli.simulate && input.modem.destination.is_none() {
        input.modem.destination = Some(SIMULATED_DESTINATION.into());
    }
    input.resolve().context("invalid configuration")
}

async fn gps_reader(
    cli: &Cli,
    config: &MonitorConfig,
) -> anyhow::Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    if cli.simulate {
        let origin = Coordinates {
            latitude: 48.1173,
            longitude: 11.5167,
        };
        let feed = sim::gps_feed(origin, Duration::from_secs(1));
        return Ok(Box::new(BufReader::new(feed)));
    }
    let file = tokio::fs::File::open(&config.devices.gps).await?;
    tracing::info!(device = %config.devices.gps.display(), "GPS device opened");
    Ok(Box::new(BufReader::new(file)))
}

fn modem_hardware(
    cli: &Cli,
    config: &MonitorConfig,
) -> anyhow::Result<(Box<dyn Transport>, Arc<dyn HardwareReset>)> {
    if cli.simulate {
        let (modem, handle) = SimulatedModem::new(ModemBehavior::default());
        return Ok((Box::new(modem), Arc::new(handle.reset_line())));
    }

    let device = SerialDevice::open(&config.devices.modem).with_context(|| {
        format!("failed to open modem on {}", config.devices.modem.display())
    })?;
    let reset: Arc<dyn HardwareReset> = match CommandReset::from_argv(&config.modem.reset_command)
    {
        Some(reset) => Arc::new(reset),
        None => Arc::new(NoReset),
    };
    Ok((Box::new(device), reset))
}
