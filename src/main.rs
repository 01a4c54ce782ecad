mod commandline;
mod config;
mod monitor;
mod remote;

use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use config::Config;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};
use wtvb01_lib::session::{Sensor, Session};
use wtvb01_lib::transport::SerialConnector;

fn logging_init(log_spec: &str, log_file: Option<&str>) -> Result<LoggerHandle> {
    let mut logger =
        Logger::try_with_env_or_str(log_spec).with_context(|| "Cannot init logging")?;
    if let Some(log_file) = log_file {
        logger = logger
            .log_to_file(FileSpec::try_from(log_file).with_context(|| "Invalid log file")?)
            .duplicate_to_stderr(Duplicate::All);
    }
    let log_handle = logger.start().with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    config.apply_args(&args);

    // an explicit -v/-q beats the config file
    let log_spec = match &config.logging.level {
        Some(level) if !args.verbose.is_present() => level.clone(),
        _ => args.verbose.log_level_filter().as_str().to_string(),
    };
    let _log_handle = logging_init(&log_spec, config.logging.file.as_deref())?;

    let device = config.device;
    let connector = SerialConnector::new(&device.port)
        .baud_rate(device.baud_rate)
        .timeout(device.timeout);
    let mut session = Session::new(connector, device.session);

    match args.command {
        CliCommands::Read { wait, json } => {
            session
                .open()
                .with_context(|| format!("Cannot open device '{}'", device.port))?;
            session
                .start_acquisition()
                .with_context(|| "Cannot start acquisition")?;
            std::thread::sleep(wait);
            session.stop_acquisition();
            if let Some(fault) = session.take_fault() {
                return Err(fault).with_context(|| "Acquisition failed");
            }
            let samples = session.store().snapshot();
            if json {
                println!("{}", monitor::to_json(&samples));
            } else {
                monitor::print_console(&samples);
            }
            session.close();
        }
        CliCommands::Monitor { interval, listen } => monitor::run(session, interval, listen)?,
        CliCommands::Write { register, value } => {
            session
                .open()
                .with_context(|| format!("Cannot open device '{}'", device.port))?;
            session
                .write_register(register, value)
                .with_context(|| format!("Cannot write register {register:#04x}"))?;
            session.close();
        }
    }

    Ok(())
}
