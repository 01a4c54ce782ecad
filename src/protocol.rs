//! Modbus-RTU framing for the WTVB01 vibration sensor.
//!
//! Requests are fixed 8 byte frames. Responses to a register read are
//! `[address, 0x03, payload_len, payload.., crc_hi, crc_lo]` and arrive as an arbitrary byte
//! stream, so [`FrameDecoder`] reassembles them from whatever chunks the port hands over.

use crate::crc::crc16;
use crate::error::ProtocolError;
use std::time::Duration;

/// Factory default Modbus address of the sensor.
pub const DEFAULT_ADDRESS: u8 = 0x50;
/// Factory default baud rate of the sensor.
pub const DEFAULT_BAUD_RATE: u32 = 230_400;

pub const FUNCTION_READ: u8 = 0x03;
pub const FUNCTION_WRITE: u8 = 0x06;

/// First register of the measurement block (acceleration X).
pub const BLOCK_START: u16 = 0x34;
/// Number of registers from acceleration X up to vibration frequency Z.
pub const BLOCK_LENGTH: u16 = 19;

/// Configuration writes are ignored unless this magic value was written here first.
pub const UNLOCK_REGISTER: u16 = 0x69;
pub const UNLOCK_VALUE: u16 = 0xB588;
/// Writing zero here persists the configuration.
pub const SAVE_REGISTER: u16 = 0x00;
pub const SAVE_VALUE: u16 = 0x0000;

/// Time the device needs between the unlock, write and save commands.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub const REQUEST_LENGTH: usize = 8;
/// address + function + length byte + two CRC bytes
pub const RESPONSE_OVERHEAD: usize = 5;
/// Longest response the decoder waits for. A header announcing a longer frame (payload of 252
/// bytes or more) is rejected at once, so the decoder never waits with more than this buffered.
pub const MAX_BUFFER_LENGTH: usize = 256;

fn create_request(address: u8, function: u8, register: u16, word: u16) -> [u8; REQUEST_LENGTH] {
    let register = register.to_be_bytes();
    let word = word.to_be_bytes();
    let mut tx_buffer = [
        address,
        function,
        register[0],
        register[1],
        word[0],
        word[1],
        0,
        0,
    ];
    let crc = crc16(&tx_buffer, REQUEST_LENGTH - 2).to_be_bytes();
    tx_buffer[6] = crc[0];
    tx_buffer[7] = crc[1];
    tx_buffer
}

/// Builds a "read holding registers" request.
pub fn read_request(address: u8, register: u16, count: u16) -> [u8; REQUEST_LENGTH] {
    create_request(address, FUNCTION_READ, register, count)
}

/// Builds a "write single register" request.
pub fn write_request(address: u8, register: u16, value: u16) -> [u8; REQUEST_LENGTH] {
    create_request(address, FUNCTION_WRITE, register, value)
}

pub fn unlock_request(address: u8) -> [u8; REQUEST_LENGTH] {
    write_request(address, UNLOCK_REGISTER, UNLOCK_VALUE)
}

pub fn save_request(address: u8) -> [u8; REQUEST_LENGTH] {
    write_request(address, SAVE_REGISTER, SAVE_VALUE)
}

/// A CRC-valid read response, stripped of header and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Iterates the payload as big endian register words.
    pub fn words(&self) -> impl Iterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}

/// Streaming reassembly of read responses.
///
/// Bytes in front of a valid frame are dropped one at a time, so a corrupted or foreign frame never
/// swallows a good one that follows it.
#[derive(Debug)]
pub struct FrameDecoder {
    address: u8,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            buffer: Vec::with_capacity(MAX_BUFFER_LENGTH),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        log::trace!("rx: {bytes:02X?}");
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn drop_first(&mut self) {
        self.buffer.remove(0);
    }

    /// Tries to take the next frame out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. `Some(Err(..))` reports why a byte (or a
    /// malformed frame) was discarded; call again to continue.
    pub fn next_frame(&mut self) -> Option<Result<ResponseFrame, ProtocolError>> {
        if self.buffer.len() < RESPONSE_OVERHEAD {
            return None;
        }
        if self.buffer[0] != self.address {
            let received = self.buffer[0];
            self.drop_first();
            return Some(Err(ProtocolError::AddressMismatch {
                expected: self.address,
                received,
            }));
        }
        if self.buffer[1] != FUNCTION_READ {
            let function = self.buffer[1];
            self.drop_first();
            return Some(Err(ProtocolError::UnexpectedFunction(function)));
        }

        let payload_len = self.buffer[2];
        let frame_len = payload_len as usize + RESPONSE_OVERHEAD;
        if frame_len > MAX_BUFFER_LENGTH {
            // could only complete by growing the buffer past its cap
            self.drop_first();
            return Some(Err(ProtocolError::BufferOverflow(frame_len)));
        }
        if self.buffer.len() < frame_len {
            return None;
        }

        let calculated = crc16(&self.buffer, frame_len - 2);
        let received = u16::from_be_bytes([self.buffer[frame_len - 2], self.buffer[frame_len - 1]]);
        if calculated != received {
            self.drop_first();
            return Some(Err(ProtocolError::CrcMismatch {
                calculated,
                received,
            }));
        }

        let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
        if payload_len % 2 != 0 {
            return Some(Err(ProtocolError::OddPayloadLength(payload_len)));
        }
        log::trace!("frame: {frame:02X?}");
        Some(Ok(ResponseFrame {
            payload: frame[3..frame_len - 2].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 19 registers starting at 0x34: 16384, 40000, 0xFFFF, 300, 400 ... with 25.34 °C at 0x40
    pub(crate) const BLOCK_RESPONSE: [u8; 43] = [
        0x50, 0x03, 0x26, 0x40, 0x00, 0x9C, 0x40, 0xFF, 0xFF, 0x01, 0x2C, 0x01, 0x90, 0x01, 0xF4,
        0x02, 0x58, 0x02, 0xBC, 0x03, 0x20, 0x03, 0x84, 0x03, 0xE8, 0x04, 0x4C, 0x09, 0xE6, 0x05,
        0x14, 0x05, 0x78, 0x05, 0xDC, 0x06, 0x40, 0x06, 0xA4, 0x07, 0x08, 0xD4, 0xB5,
    ];
    const TEMPERATURE_RESPONSE: [u8; 7] = [0x50, 0x03, 0x02, 0x09, 0xE6, 0xC2, 0x52];

    fn drain(decoder: &mut FrameDecoder) -> (Vec<ResponseFrame>, Vec<ProtocolError>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(frame) => frames.push(frame),
                Err(err) => errors.push(err),
            }
        }
        (frames, errors)
    }

    #[test]
    fn read_request_layout() {
        assert_eq!(
            read_request(0x50, BLOCK_START, BLOCK_LENGTH),
            [0x50, 0x03, 0x00, 0x34, 0x00, 0x13, 0x48, 0x48]
        );
    }

    #[test]
    fn unlock_and_save_layout() {
        assert_eq!(
            unlock_request(0x50),
            [0x50, 0x06, 0x00, 0x69, 0xB5, 0x88, 0x22, 0xA1]
        );
        assert_eq!(
            save_request(0x50),
            [0x50, 0x06, 0x00, 0x00, 0x00, 0x00, 0x84, 0x4B]
        );
    }

    #[test]
    fn write_request_carries_value() {
        let request = write_request(0x50, 0x1A, 0x0102);
        assert_eq!(&request[..6], &[0x50, 0x06, 0x00, 0x1A, 0x01, 0x02]);
        assert_eq!(
            u16::from_be_bytes([request[6], request[7]]),
            crc16(&request, 6)
        );
    }

    #[test]
    fn decodes_complete_frame() {
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&TEMPERATURE_RESPONSE);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, vec![0x09, 0xE6]);
        assert_eq!(frame.words().collect::<Vec<_>>(), vec![2534]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn waits_for_missing_bytes() {
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&BLOCK_RESPONSE[..4]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&BLOCK_RESPONSE[4..30]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&BLOCK_RESPONSE[30..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 38);
    }

    #[test]
    fn byte_by_byte_matches_single_chunk() {
        let mut whole = FrameDecoder::new(0x50);
        whole.extend(&BLOCK_RESPONSE);
        let (expected, _) = drain(&mut whole);

        let mut fragmented = FrameDecoder::new(0x50);
        let mut frames = Vec::new();
        for b in BLOCK_RESPONSE {
            fragmented.extend(&[b]);
            frames.extend(drain(&mut fragmented).0);
        }
        assert_eq!(frames, expected);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn skips_leading_garbage() {
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&[0x00, 0x12, 0x50, 0x06]);
        decoder.extend(&TEMPERATURE_RESPONSE);
        let (frames, errors) = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            errors,
            vec![
                ProtocolError::AddressMismatch {
                    expected: 0x50,
                    received: 0x00
                },
                ProtocolError::AddressMismatch {
                    expected: 0x50,
                    received: 0x12
                },
                ProtocolError::UnexpectedFunction(0x06),
                ProtocolError::AddressMismatch {
                    expected: 0x50,
                    received: 0x06
                },
            ]
        );
    }

    #[test]
    fn corrupted_crc_is_rejected_and_next_frame_survives() {
        let mut corrupted = BLOCK_RESPONSE;
        corrupted[42] ^= 0x01;
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&corrupted);
        decoder.extend(&TEMPERATURE_RESPONSE);
        let (frames, errors) = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0x09, 0xE6]);
        assert!(matches!(
            errors[0],
            ProtocolError::CrcMismatch {
                calculated: 0xD4B5,
                received: 0xD4B4
            }
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn odd_payload_is_consumed_and_reported() {
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&[0x50, 0x03, 0x01, 0x07, 0xA1, 0x76]);
        decoder.extend(&TEMPERATURE_RESPONSE);
        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::OddPayloadLength(1)))
        );
        assert!(decoder.next_frame().unwrap().is_ok());
    }

    #[test]
    fn oversized_header_is_rejected_without_waiting() {
        let mut decoder = FrameDecoder::new(0x50);
        // header announcing a 252 byte payload, one byte more than fits
        decoder.extend(&[0x50, 0x03, 0xFC]);
        decoder.extend(&TEMPERATURE_RESPONSE);
        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::BufferOverflow(MAX_BUFFER_LENGTH + 1)))
        );
        let (frames, _) = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0x09, 0xE6]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn pending_bytes_stay_below_cap() {
        let mut decoder = FrameDecoder::new(0x50);
        decoder.extend(&[0x50, 0x03, 0xFF]);
        decoder.extend(&[0u8; MAX_BUFFER_LENGTH]);
        let (frames, errors) = drain(&mut decoder);
        assert!(frames.is_empty());
        assert_eq!(errors[0], ProtocolError::BufferOverflow(MAX_BUFFER_LENGTH + 4));
        assert!(decoder.buffered() < RESPONSE_OVERHEAD);
    }

    #[test]
    fn largest_frame_that_fits_is_decoded() {
        // 125 registers, 250 payload bytes, 255 bytes on the wire
        let mut frame = vec![0x50, 0x03, 250];
        frame.extend((0..250).map(|i| i as u8));
        let crc = crc16(&frame, frame.len());
        frame.extend(crc.to_be_bytes());
        assert!(frame.len() <= MAX_BUFFER_LENGTH);

        let mut decoder = FrameDecoder::new(0x50);
        for chunk in frame.chunks(16) {
            decoder.extend(chunk);
        }
        let (frames, errors) = drain(&mut decoder);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 250);
    }
}
