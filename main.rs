use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use anyhow::Context;

mod bme280;
mod bno055;
mod bus;
mod cancel;
mod compensation;
mod error;
mod sink;

use crate::bme280::Bme280;
use crate::bno055::{Bno055, CalibrationStrategy, ImuConfig};
use crate::bus::I2cBus;
use crate::cancel::CancelToken;
use crate::error::SensorError;
use crate::sink::RecordSink;

type Worker = JoinHandle<Result<(), SensorError>>;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Optional first argument: a writable directory for the per-sensor
    // record files. Without it, records go to stderr.
    let data_dir = env::args().nth(1).map(PathBuf::from);
    if let Some(dir) = &data_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }

    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, cancel.flag())?;

    // Each sensor initializes and runs independently; a failure here takes
    // down that sensor only.
    let mut workers: Vec<(&str, Worker)> = Vec::new();
    match start_pressure(data_dir.as_deref(), &cancel) {
        Ok(worker) => workers.push(("pressure", worker)),
        Err(err) => log::error!("pressure sensor offline: {:#}", err),
    }
    match start_imu(data_dir.as_deref(), &cancel) {
        Ok(worker) => workers.push(("imu", worker)),
        Err(err) => log::error!("imu sensor offline: {:#}", err),
    }

    if workers.is_empty() {
        anyhow::bail!("no sensor came online");
    }

    // Joining lets in-flight bus transactions drain after the cancellation
    // flag is set; the service manager owns the hard-kill timeout.
    for (name, worker) in workers {
        match worker.join() {
            Ok(Ok(())) => log::info!("{} task finished", name),
            Ok(Err(err)) => log::error!("{} task failed: {}", name, err),
            Err(_) => log::error!("{} task panicked", name),
        }
    }

    Ok(())
}

fn start_pressure(dir: Option<&Path>, cancel: &CancelToken) -> anyhow::Result<Worker> {
    let out = RecordSink::open(dir, "pressure.txt").context("opening pressure.txt")?;
    let bus =
        I2cBus::open(bme280::I2C_BUS, bme280::I2C_ADDR).context("opening pressure sensor bus")?;
    let mut sensor = Bme280::initialize(bus, out).context("initializing pressure sensor")?;

    let cancel = cancel.clone();
    Ok(thread::spawn(move || {
        log::info!("pressure task begin");
        let outcome = sensor.run_sampling_loop(bme280::SAMPLE_PERIOD, &cancel);
        log::info!("pressure task end");
        outcome
    }))
}

fn start_imu(dir: Option<&Path>, cancel: &CancelToken) -> anyhow::Result<Worker> {
    let out = RecordSink::open(dir, "imu.txt").context("opening imu.txt")?;
    let bus = I2cBus::open(bno055::I2C_BUS, bno055::I2C_ADDR).context("opening imu sensor bus")?;
    let mut sensor =
        Bno055::initialize(bus, out, &imu_config_from_env()).context("initializing imu sensor")?;

    let cancel = cancel.clone();
    Ok(thread::spawn(move || {
        log::info!("imu task begin");
        sensor.log_system_status()?;
        let outcome = sensor.run_sampling_loop(bno055::SAMPLE_PERIOD, &cancel);
        log::info!("imu task end");
        outcome
    }))
}

fn imu_config_from_env() -> ImuConfig {
    let mut config = ImuConfig::default();
    if env::var("RPSENSORD_IMU_CALIBRATION").map_or(false, |value| value == "interactive") {
        config.calibration = CalibrationStrategy::Interactive;
    }
    if env::var("RPSENSORD_IMU_BIST").map_or(false, |value| value == "1") {
        config.run_bist = true;
    }
    config
}
