//! Byte transport underneath a [`Session`](crate::session::Session).
//!
//! The session never touches a serial port directly; it asks a [`Connector`] for a fresh
//! [`Transport`] on every open, which keeps the retry logic testable without hardware.

use std::io;

/// A connected, bidirectional byte pipe.
pub trait Transport: Send {
    /// Writes one complete request frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Appends all bytes that are already pending to `buffer` without waiting for more.
    fn receive(&mut self, buffer: &mut Vec<u8>) -> io::Result<usize>;

    /// Discards anything still queued in either direction.
    fn clear(&mut self) -> io::Result<()>;
}

/// Opens a [`Transport`], one attempt per call.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn connect(&self) -> crate::Result<Self::Transport>;

    /// Human readable endpoint used in log messages.
    fn endpoint(&self) -> String;
}

#[cfg(feature = "serialport")]
pub use self::serial::{SerialConnector, SerialTransport};

#[cfg(feature = "serialport")]
mod serial {
    use super::{Connector, Transport};
    use crate::protocol::DEFAULT_BAUD_RATE;
    use std::io::{self, Read, Write};
    use std::time::Duration;

    /// Read and write timeout of the serial port.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        port: String,
        baud_rate: u32,
        timeout: Duration,
    }

    impl SerialConnector {
        pub fn new(port: &str) -> Self {
            Self {
                port: port.to_string(),
                baud_rate: DEFAULT_BAUD_RATE,
                timeout: DEFAULT_TIMEOUT,
            }
        }

        pub fn baud_rate(mut self, baud_rate: u32) -> Self {
            self.baud_rate = baud_rate;
            self
        }

        pub fn timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    impl Connector for SerialConnector {
        type Transport = SerialTransport;

        // On unix the native port takes TIOCEXCL when opened, COM ports are exclusive anyway.
        fn connect(&self) -> crate::Result<SerialTransport> {
            let serial = serialport::new(&self.port, self.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(self.timeout)
                .open()?;
            log::debug!(
                "Opened serial port {} at {} baud, timeout {:?}",
                self.port,
                self.baud_rate,
                self.timeout
            );
            Ok(SerialTransport { serial })
        }

        fn endpoint(&self) -> String {
            format!("{}@{}", self.port, self.baud_rate)
        }
    }

    pub struct SerialTransport {
        serial: Box<dyn serialport::SerialPort>,
    }

    impl Transport for SerialTransport {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            log::trace!("write bytes: {frame:02X?}");
            self.serial.write_all(frame)
        }

        fn receive(&mut self, buffer: &mut Vec<u8>) -> io::Result<usize> {
            let pending = self.serial.bytes_to_read()? as usize;
            if pending == 0 {
                return Ok(0);
            }
            let start = buffer.len();
            buffer.resize(start + pending, 0);
            let received = match self.serial.read(&mut buffer[start..]) {
                Ok(received) => received,
                Err(err) => {
                    buffer.truncate(start);
                    return Err(err);
                }
            };
            buffer.truncate(start + received);
            log::trace!("Read {received} of {pending} pending bytes");
            Ok(received)
        }

        fn clear(&mut self) -> io::Result<()> {
            self.serial.clear(serialport::ClearBuffer::All)?;
            Ok(())
        }
    }
}
