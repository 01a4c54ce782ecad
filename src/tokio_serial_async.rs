//! Provides an asynchronous request/response client for the WTVB01 vibration sensor
//! using Tokio and the `tokio-serial` crate for serial communication.
//!
//! Unlike [`Session`](crate::session::Session) there is no background polling: every call sends
//! one request and awaits its answer.
//!
//! # Example
//!
//! ```no_run
//! use wtvb01_lib::tokio_serial_async::{Error, Wtvb01};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut sensor = Wtvb01::new("/dev/ttyUSB0", 230_400)?;
//!     sensor.set_timeout(Duration::from_millis(500));
//!
//!     for sample in sensor.read_all_channels().await? {
//!         println!("{}: {:.3}", sample.key, sample.value);
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::ProtocolError;
use crate::protocol::*;
use crate::registers::{decode_words, Sample};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Errors specific to the asynchronous Tokio serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A response that was framed correctly but cannot be decoded.
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    /// An error indicating that a Tokio timeout elapsed during an I/O operation.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

/// Takes the first decoded frame carrying exactly `count` registers, skipping any other.
///
/// `Ok(None)` means more bytes are needed.
fn take_answer(decoder: &mut FrameDecoder, count: u16) -> Result<Option<ResponseFrame>> {
    while let Some(result) = decoder.next_frame() {
        match result {
            Ok(frame) if frame.payload.len() == count as usize * 2 => return Ok(Some(frame)),
            Ok(frame) => log::warn!(
                "Ignoring response with {} bytes, expected {}",
                frame.payload.len(),
                count * 2
            ),
            Err(err @ ProtocolError::OddPayloadLength(_)) => return Err(err.into()),
            Err(err) => log::trace!("resync: {err}"),
        }
    }
    Ok(None)
}

#[derive(Debug)]
pub struct Wtvb01 {
    serial: tokio_serial::SerialStream,
    decoder: FrameDecoder,
    address: u8,
    io_timeout: Duration,
    settle_delay: Duration,
    retries: u8,
}

impl Wtvb01 {
    /// Opens `port` with the given baud rate, talking to the factory default address.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use wtvb01_lib::tokio_serial_async::Wtvb01;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     match Wtvb01::new("/dev/ttyUSB0", 230_400) {
    ///         Ok(mut sensor) => {
    ///             if let Ok(samples) = sensor.read_all_channels().await {
    ///                 println!("{samples:?}");
    ///             }
    ///         }
    ///         Err(err) => eprintln!("Failed to connect to sensor: {err}"),
    ///     }
    /// }
    /// ```
    pub fn new(port: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self {
            serial: tokio_serial::new(port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
            decoder: FrameDecoder::new(DEFAULT_ADDRESS),
            address: DEFAULT_ADDRESS,
            io_timeout: Duration::from_secs(1),
            settle_delay: SETTLE_DELAY,
            retries: 3,
        })
    }

    /// Sets the Modbus address the requests are sent to.
    pub fn set_address(&mut self, address: u8) {
        self.address = address;
        self.decoder = FrameDecoder::new(address);
    }

    /// Sets the number of retries for a failed read.
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    /// Sets the timeout for a single request/response exchange.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Drops stale bytes so that a late answer to an earlier request is not taken for this one.
    async fn drain_pending(&mut self) -> Result<()> {
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending == 0 {
                break;
            }
            let mut buf = [0u8; 64];
            let received =
                tokio::time::timeout(self.io_timeout, self.serial.read(&mut buf)).await??;
            log::trace!("{received} stale bytes consumed");
        }
        self.decoder.clear();
        Ok(())
    }

    async fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        log::trace!("write bytes: {tx_buffer:02X?}");
        tokio::time::timeout(self.io_timeout, self.serial.write_all(tx_buffer)).await??;
        Ok(())
    }

    async fn request_frame(&mut self, register: u16, count: u16) -> Result<ResponseFrame> {
        self.drain_pending().await?;
        self.send_bytes(&read_request(self.address, register, count))
            .await?;

        let deadline = tokio::time::Instant::now() + self.io_timeout;
        let mut buf = [0u8; 64];
        loop {
            if let Some(frame) = take_answer(&mut self.decoder, count)? {
                return Ok(frame);
            }
            let received = tokio::time::timeout_at(deadline, self.serial.read(&mut buf)).await??;
            if received == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            self.decoder.extend(&buf[..received]);
        }
    }

    /// Reads `count` registers starting at `register` and decodes them.
    pub async fn read_registers(&mut self, register: u16, count: u16) -> Result<Vec<Sample>> {
        log::trace!("read {count} registers from {register:#04x}");
        for t in 0..self.retries {
            match self.request_frame(register, count).await {
                Ok(frame) => return Ok(decode_words(register, frame.words())),
                Err(err) => {
                    log::trace!("Failed try {} of {}, repeating ({err})", t + 1, self.retries);
                }
            }
        }
        let frame = self.request_frame(register, count).await?;
        Ok(decode_words(register, frame.words()))
    }

    /// Reads the whole measurement block, acceleration X to vibration frequency Z.
    pub async fn read_all_channels(&mut self) -> Result<Vec<Sample>> {
        self.read_registers(BLOCK_START, BLOCK_LENGTH).await
    }

    /// Writes a configuration register: unlock, write, save with the settle delay in between.
    pub async fn write_register(&mut self, register: u16, value: u16) -> Result<()> {
        log::trace!("write {value:#06x} to register {register:#04x}");
        self.send_bytes(&unlock_request(self.address)).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.send_bytes(&write_request(self.address, register, value))
            .await?;
        tokio::time::sleep(self.settle_delay).await;
        self.send_bytes(&save_request(self.address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPERATURE_RESPONSE: [u8; 7] = [0x50, 0x03, 0x02, 0x09, 0xE6, 0xC2, 0x52];

    fn two_register_response() -> Vec<u8> {
        let mut frame = vec![0x50, 0x03, 0x04, 0x40, 0x00, 0x09, 0xE6];
        let crc = crate::crc::crc16(&frame, frame.len());
        frame.extend(crc.to_be_bytes());
        frame
    }

    #[test]
    fn answer_with_other_register_count_is_skipped() {
        let mut decoder = FrameDecoder::new(DEFAULT_ADDRESS);
        decoder.extend(&TEMPERATURE_RESPONSE);
        decoder.extend(&two_register_response());
        let frame = take_answer(&mut decoder, 2).unwrap().unwrap();
        assert_eq!(frame.words().collect::<Vec<_>>(), vec![0x4000, 2534]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn incomplete_answer_needs_more_bytes() {
        let mut decoder = FrameDecoder::new(DEFAULT_ADDRESS);
        decoder.extend(&TEMPERATURE_RESPONSE);
        assert!(take_answer(&mut decoder, 2).unwrap().is_none());
        let response = two_register_response();
        decoder.extend(&response[..5]);
        assert!(take_answer(&mut decoder, 2).unwrap().is_none());
        decoder.extend(&response[5..]);
        assert!(take_answer(&mut decoder, 2).unwrap().is_some());
    }

    #[test]
    fn odd_payload_fails_the_request() {
        let mut decoder = FrameDecoder::new(DEFAULT_ADDRESS);
        decoder.extend(&[0x50, 0x03, 0x01, 0x07, 0xA1, 0x76]);
        assert!(matches!(
            take_answer(&mut decoder, 1),
            Err(Error::ProtocolError(ProtocolError::OddPayloadLength(1)))
        ));
    }
}
