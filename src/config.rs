//! Startup configuration.
//!
//! Loaded once at process start: a JSON config file named by
//! `FEEDER_CONFIG`, then environment overrides, then validation. A bad
//! credential set is the only unrecoverable error in the engine and it
//! fails here, before any transport activity.
//!
//! The protocol timing knobs are deliberately configuration, not
//! hard-coded: heartbeat cadence and backoff thresholds come from
//! observing one firmware version and want tuning against the real
//! device.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::feedplan::PlanLimits;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_DB_PATH: &str = "feeder.db";

/// The device beacons roughly every 51s; the window adds buffer for
/// transport hiccups before a beacon counts as missed.
const DEFAULT_HEARTBEAT_WINDOW_MS: i64 = 81_000;
/// How long a fresh session waits for the first heartbeat.
const DEFAULT_STARTUP_WINDOW_MS: i64 = 90_000;
const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 10_000;
const DEFAULT_SYNC_INTERVAL_MS: i64 = 900_000;
const DEFAULT_SYNC_TIMEOUT_MS: i64 = 5_000;
const DEFAULT_SYNC_RETRY_MIN_MS: i64 = 5_000;
const DEFAULT_SYNC_RETRY_MAX_MS: i64 = 300_000;
const DEFAULT_DRIFT_THRESHOLD_MS: i64 = 10_000;
const DEFAULT_RECONNECT_MIN_MS: i64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: i64 = 300_000;

const DEFAULT_PLAN_MAX_ENTRIES: usize = 10;
const DEFAULT_PLAN_MIN_PORTIONS: u8 = 1;
const DEFAULT_PLAN_MAX_PORTIONS: u8 = 12;

#[derive(Debug, Deserialize, Default)]
struct FeederConfigFile {
    serial: Option<String>,
    product_key: Option<String>,
    product_secret: Option<String>,
    mqtt: Option<MqttConfigFile>,
    timing: Option<TimingConfigFile>,
    plan: Option<PlanConfigFile>,
    db_path: Option<String>,
    timezone_offset_hours: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    heartbeat_window_ms: Option<i64>,
    startup_window_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    sync_interval_ms: Option<i64>,
    sync_timeout_ms: Option<i64>,
    sync_retry_min_ms: Option<i64>,
    sync_retry_max_ms: Option<i64>,
    drift_threshold_ms: Option<i64>,
    reconnect_min_ms: Option<i64>,
    reconnect_max_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct PlanConfigFile {
    max_entries: Option<usize>,
    min_portions: Option<u8>,
    max_portions: Option<u8>,
}

/// Pre-provisioned device credentials. Immutable for the process
/// lifetime; one process manages one device.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub serial: String,
    pub product_key: String,
    pub product_secret: String,
}

/// What the MQTT transport needs to open a session.
#[derive(Clone, Debug)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug)]
pub struct TimingSettings {
    pub heartbeat_window_ms: i64,
    pub startup_window_ms: i64,
    pub request_timeout_ms: i64,
    pub sync_interval_ms: i64,
    pub sync_timeout_ms: i64,
    pub sync_retry_min_ms: i64,
    pub sync_retry_max_ms: i64,
    pub drift_threshold_ms: i64,
    pub reconnect_min_ms: i64,
    pub reconnect_max_ms: i64,
}

#[derive(Clone, Debug)]
pub struct FeederConfig {
    pub identity: DeviceIdentity,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub keep_alive_secs: u64,
    pub timing: TimingSettings,
    pub plan: PlanLimits,
    pub db_path: String,
    /// Offset reported to the device in calibration replies.
    pub timezone_offset_hours: i64,
}

impl FeederConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FEEDER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeederConfigFile) -> Self {
        let mqtt = file.mqtt.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        let plan = file.plan.unwrap_or_default();
        FeederConfig {
            identity: DeviceIdentity {
                serial: file.serial.unwrap_or_default(),
                product_key: file.product_key.unwrap_or_default(),
                product_secret: file.product_secret.unwrap_or_default(),
            },
            mqtt_host: mqtt.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
            keep_alive_secs: mqtt.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            timing: TimingSettings {
                heartbeat_window_ms: timing
                    .heartbeat_window_ms
                    .unwrap_or(DEFAULT_HEARTBEAT_WINDOW_MS),
                startup_window_ms: timing.startup_window_ms.unwrap_or(DEFAULT_STARTUP_WINDOW_MS),
                request_timeout_ms: timing
                    .request_timeout_ms
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
                sync_interval_ms: timing.sync_interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL_MS),
                sync_timeout_ms: timing.sync_timeout_ms.unwrap_or(DEFAULT_SYNC_TIMEOUT_MS),
                sync_retry_min_ms: timing.sync_retry_min_ms.unwrap_or(DEFAULT_SYNC_RETRY_MIN_MS),
                sync_retry_max_ms: timing.sync_retry_max_ms.unwrap_or(DEFAULT_SYNC_RETRY_MAX_MS),
                drift_threshold_ms: timing
                    .drift_threshold_ms
                    .unwrap_or(DEFAULT_DRIFT_THRESHOLD_MS),
                reconnect_min_ms: timing.reconnect_min_ms.unwrap_or(DEFAULT_RECONNECT_MIN_MS),
                reconnect_max_ms: timing.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS),
            },
            plan: PlanLimits {
                max_entries: plan.max_entries.unwrap_or(DEFAULT_PLAN_MAX_ENTRIES),
                min_portions: plan.min_portions.unwrap_or(DEFAULT_PLAN_MIN_PORTIONS),
                max_portions: plan.max_portions.unwrap_or(DEFAULT_PLAN_MAX_PORTIONS),
            },
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            timezone_offset_hours: file.timezone_offset_hours.unwrap_or(0),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(serial) = std::env::var("FEEDER_SERIAL") {
            if !serial.trim().is_empty() {
                self.identity.serial = serial;
            }
        }
        if let Ok(key) = std::env::var("FEEDER_PRODUCT_KEY") {
            if !key.trim().is_empty() {
                self.identity.product_key = key;
            }
        }
        if let Ok(secret) = std::env::var("FEEDER_PRODUCT_SECRET") {
            if !secret.trim().is_empty() {
                self.identity.product_secret = secret;
            }
        }
        if let Ok(host) = std::env::var("FEEDER_MQTT_HOST") {
            if !host.trim().is_empty() {
                self.mqtt_host = host;
            }
        }
        if let Ok(port) = std::env::var("FEEDER_MQTT_PORT") {
            self.mqtt_port = port
                .parse()
                .map_err(|_| anyhow!("FEEDER_MQTT_PORT must be a port number"))?;
        }
        if let Ok(path) = std::env::var("FEEDER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(offset) = std::env::var("FEEDER_TZ_OFFSET_HOURS") {
            self.timezone_offset_hours = offset
                .parse()
                .map_err(|_| anyhow!("FEEDER_TZ_OFFSET_HOURS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_serial(&self.identity.serial)?;
        validate_credential("product key", &self.identity.product_key)?;
        validate_credential("product secret", &self.identity.product_secret)?;
        if self.mqtt_host.trim().is_empty() {
            return Err(anyhow!("mqtt host must not be empty"));
        }
        if self.timing.reconnect_min_ms <= 0
            || self.timing.reconnect_max_ms < self.timing.reconnect_min_ms
        {
            return Err(anyhow!("reconnect backoff bounds are inconsistent"));
        }
        if self.plan.min_portions == 0 || self.plan.max_portions < self.plan.min_portions {
            return Err(anyhow!("plan portion bounds are inconsistent"));
        }
        Ok(())
    }

    pub fn broker(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: format!("feederd-{}", self.identity.serial),
            keep_alive_secs: self.keep_alive_secs,
            username: self.identity.product_key.clone(),
            password: self.identity.product_secret.clone(),
        }
    }
}

pub fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() || serial.len() > 32 {
        return Err(anyhow!("device serial must be 1..=32 chars"));
    }
    if !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("device serial must be alphanumeric"));
    }
    Ok(())
}

fn validate_credential(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("{} must not be empty", name));
    }
    if value.chars().any(|c| c.is_whitespace() || !c.is_ascii()) {
        return Err(anyhow!("{} contains invalid characters", name));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<FeederConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> FeederConfigFile {
        FeederConfigFile {
            serial: Some("FE2036BC".into()),
            product_key: Some("plaf203key".into()),
            product_secret: Some("s3cret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_everything_but_identity() {
        let cfg = FeederConfig::from_file(FeederConfigFile::default());
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.timing.heartbeat_window_ms, 81_000);
        assert_eq!(cfg.plan.max_portions, 12);
        // Empty identity fails validation, before any transport use.
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serial_validation() {
        assert!(validate_serial("FE2036BC").is_ok());
        assert!(validate_serial("").is_err());
        assert!(validate_serial("has space").is_err());
        assert!(validate_serial(&"a".repeat(33)).is_err());
    }

    #[test]
    fn credentials_must_be_clean_ascii() {
        let mut cfg = FeederConfig::from_file(minimal());
        assert!(cfg.validate().is_ok());

        cfg.identity.product_secret = "bad secret".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broker_settings_carry_credentials() {
        let cfg = FeederConfig::from_file(minimal());
        let broker = cfg.broker();
        assert_eq!(broker.client_id, "feederd-FE2036BC");
        assert_eq!(broker.username, "plaf203key");
        assert_eq!(broker.password, "s3cret");
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let mut cfg = FeederConfig::from_file(minimal());
        cfg.timing.reconnect_max_ms = cfg.timing.reconnect_min_ms - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = FeederConfig::from_file(minimal());
        cfg.plan.min_portions = 9;
        cfg.plan.max_portions = 3;
        assert!(cfg.validate().is_err());
    }
}
