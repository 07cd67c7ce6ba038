//! feederd - local controller daemon for the PLAF203 pet feeder.
//!
//! Replaces the vendor cloud backend: point the device's MQTT traffic at a
//! local broker, run feederd against the same broker, and the device gets
//! its heartbeat acks, time calibration, and feeding plan from here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use feeder_kernel::{FeederConfig, FeederEngine, LogSink, SqlitePlanStore};

/// Cooperative scheduler cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Local protocol engine for the PLAF203 pet feeder")]
struct Args {
    /// Path to the JSON config file (same as FEEDER_CONFIG).
    #[arg(long, env = "FEEDER_CONFIG")]
    config: Option<PathBuf>,

    /// Device serial number override.
    #[arg(long, env = "FEEDER_SERIAL")]
    serial: Option<String>,

    /// MQTT broker host override.
    #[arg(long, env = "FEEDER_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// MQTT broker port override.
    #[arg(long, env = "FEEDER_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Plan database path override.
    #[arg(long, env = "FEEDER_DB_PATH")]
    db_path: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("FEEDER_CONFIG", path);
    }
    let mut cfg = FeederConfig::load()?;
    if let Some(serial) = args.serial {
        cfg.identity.serial = serial;
    }
    if let Some(host) = args.mqtt_host {
        cfg.mqtt_host = host;
    }
    if let Some(port) = args.mqtt_port {
        cfg.mqtt_port = port;
    }
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }

    log::info!("feederd starting");
    log::info!("  device serial: {}", cfg.identity.serial);
    log::info!("  MQTT broker: {}:{}", cfg.mqtt_host, cfg.mqtt_port);
    log::info!("  plan database: {}", cfg.db_path);

    let store = SqlitePlanStore::open(&cfg.db_path)?;
    let mut engine = FeederEngine::with_mqtt(cfg, Box::new(LogSink), Box::new(store));

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;

    engine.start()?;
    while running.load(Ordering::SeqCst) {
        if let Err(e) = engine.tick() {
            log::error!("tick failed: {:#}", e);
        }
        std::thread::sleep(TICK_INTERVAL);
    }

    log::info!("feederd stopping");
    engine.stop();
    Ok(())
}
