use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Acquire for a short moment and print every channel once
    Read {
        /// How long to acquire before printing (e.g. "500ms", "2s")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "500ms")]
        wait: Duration,
        /// Print the values as a JSON object
        #[clap(long, action)]
        json: bool,
    },
    /// Keep acquiring and print the latest values periodically
    Monitor {
        /// Interval for printing the latest values (e.g. "1s", "250ms")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
        /// Accept START/STOP remote control lines on this TCP address (e.g. 127.0.0.1:50007)
        #[clap(long)]
        listen: Option<String>,
    },
    /// Write a configuration register, bracketed by the unlock and save commands
    Write {
        /// Register address, decimal or 0x prefixed hex
        #[arg(value_parser = maybe_hex::<u16>)]
        register: u16,
        /// Register value, decimal or 0x prefixed hex
        #[arg(value_parser = maybe_hex::<u16>)]
        value: u16,
    },
}

const fn about_text() -> &'static str {
    "WTVB01 vibration sensor command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// YAML configuration file, command line options take precedence
    #[arg(short, long)]
    pub config: Option<String>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    pub baud_rate: Option<u32>,

    /// Modbus address of the sensor, decimal or 0x prefixed hex
    #[arg(short, long, value_parser = maybe_hex::<u8>)]
    pub address: Option<u8>,

    /// Timeout for serial I/O operations (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// Pause between two poll cycles (e.g., "50ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub poll_interval: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
