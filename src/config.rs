use crate::commandline::CliArgs;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use wtvb01_lib::protocol::DEFAULT_BAUD_RATE;
use wtvb01_lib::session::SessionConfig;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub port: String,
    pub baud_rate: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(flatten)]
    pub session: SessionConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_device_name(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_secs(1),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log specification, e.g. "info" or "debug, wtvb01_lib=trace".
    pub level: Option<String>,
    /// Additionally log to this file.
    pub file: Option<String>,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &str = "wtvb01.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Loads the given file, or the default file when present, or falls back to defaults.
    pub fn load_or_default(config_file_path: Option<&str>) -> Result<Self> {
        match config_file_path {
            Some(path) => Self::load(path),
            None if std::path::Path::new(Self::DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Self::DEFAULT_CONFIG_FILE)
            }
            None => Ok(Self::default()),
        }
    }

    /// Command line options win over file values.
    pub fn apply_args(&mut self, args: &CliArgs) {
        let device = &mut self.device;
        if let Some(port) = &args.device {
            device.port = port.clone();
        }
        if let Some(baud_rate) = args.baud_rate {
            device.baud_rate = baud_rate;
        }
        if let Some(timeout) = args.timeout {
            device.timeout = timeout;
        }
        if let Some(address) = args.address {
            device.session.address = address;
        }
        if let Some(poll_interval) = args.poll_interval {
            device.session.poll_interval = poll_interval;
        }
    }
}
