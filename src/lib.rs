#![cfg_attr(docsrs, feature(doc_cfg))]
//! # wtvb01_lib
//!
//! This crate provides a driver for the WTVB01 triaxial vibration sensor, attached through an
//! RS-485 adapter and spoken to with Modbus-RTU frames.
//!
//! A [`session::Session`] owns the connection and a background polling thread that keeps the
//! [`store::SampleStore`] filled with the latest value of every channel:
//!
//! ```no_run
//! # #[cfg(feature = "serialport")]
//! # fn main() -> Result<(), wtvb01_lib::Error> {
//! use wtvb01_lib::registers::Channel;
//! use wtvb01_lib::session::{Sensor, Session};
//!
//! let mut session = Session::serial("/dev/ttyUSB0");
//! session.open()?;
//! session.start_acquisition()?;
//! std::thread::sleep(std::time::Duration::from_millis(200));
//! println!("accel_x = {:?}", session.get(Channel::AccelX));
//! session.close();
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serialport"))]
//! # fn main() {}
//! ```
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `wtvb01` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the serial transport of the polling [`session::Session`] using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** request/response client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the channel, sample and configuration types.
//! - `bin-dependencies`: Enables all features required by the `wtvb01` binary executable.

/// Modbus CRC16.
pub mod crc;
/// Contains error types for the library.
mod error;
/// Request frames and streaming response reassembly.
pub mod protocol;
/// Register address to channel and unit translation.
pub mod registers;
/// Connection lifecycle and background polling.
pub mod session;
/// Latest value per channel.
pub mod store;
/// Byte transports a session runs on.
pub mod transport;

pub use error::{Error, ProtocolError, Result};

/// Asynchronous client for WTVB01 communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
