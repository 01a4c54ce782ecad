//! Register address to physical quantity translation.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Physical quantity measured by a block of registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Quantity {
    Acceleration,
    AngularVelocity,
    VibrationVelocity,
    VibrationAngle,
    Temperature,
    VibrationDisplacement,
    VibrationFrequency,
}

impl Quantity {
    /// Converts a signed register value into the physical unit.
    pub fn scale(self, value: i32) -> f64 {
        let value = value as f64;
        match self {
            Quantity::Acceleration => value / 32768.0 * 16.0,
            Quantity::AngularVelocity => value / 32768.0 * 2000.0,
            // TODO: confirm this divisor on hardware, an earlier decoder revision disagreed
            Quantity::VibrationVelocity => value / 32768.0 * 100.0,
            Quantity::VibrationAngle => value / 32768.0 * 180.0,
            Quantity::Temperature => value / 100.0,
            Quantity::VibrationDisplacement => value / 32768.0 * 1000.0,
            Quantity::VibrationFrequency => value / 32768.0 * 1000.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Acceleration => "g",
            Quantity::AngularVelocity => "°/s",
            Quantity::VibrationVelocity => "mm/s",
            Quantity::VibrationAngle => "°",
            Quantity::Temperature => "°C",
            Quantity::VibrationDisplacement => "µm",
            Quantity::VibrationFrequency => "Hz",
        }
    }
}

/// Inclusive register ranges and what they hold, ordered by address.
pub const REGISTER_MAP: [(u16, u16, Quantity); 7] = [
    (0x34, 0x36, Quantity::Acceleration),
    (0x37, 0x39, Quantity::AngularVelocity),
    (0x3A, 0x3C, Quantity::VibrationVelocity),
    (0x3D, 0x3F, Quantity::VibrationAngle),
    (0x40, 0x40, Quantity::Temperature),
    (0x41, 0x43, Quantity::VibrationDisplacement),
    (0x44, 0x46, Quantity::VibrationFrequency),
];

/// Looks up the quantity stored at `register`.
pub fn quantity_at(register: u16) -> Option<Quantity> {
    REGISTER_MAP
        .iter()
        .find(|(start, end, _)| (*start..=*end).contains(&register))
        .map(|(_, _, quantity)| *quantity)
}

/// One decoded measurement channel, in register order starting at 0x34.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Channel {
    AccelX,
    AccelY,
    AccelZ,
    GyroX,
    GyroY,
    GyroZ,
    VibSpeedX,
    VibSpeedY,
    VibSpeedZ,
    VibAngleX,
    VibAngleY,
    VibAngleZ,
    Temperature,
    VibDispX,
    VibDispY,
    VibDispZ,
    VibFreqX,
    VibFreqY,
    VibFreqZ,
}

impl Channel {
    pub const COUNT: usize = 19;
    /// Register of [`Channel::AccelX`].
    pub const FIRST_REGISTER: u16 = 0x34;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::AccelX,
        Channel::AccelY,
        Channel::AccelZ,
        Channel::GyroX,
        Channel::GyroY,
        Channel::GyroZ,
        Channel::VibSpeedX,
        Channel::VibSpeedY,
        Channel::VibSpeedZ,
        Channel::VibAngleX,
        Channel::VibAngleY,
        Channel::VibAngleZ,
        Channel::Temperature,
        Channel::VibDispX,
        Channel::VibDispY,
        Channel::VibDispZ,
        Channel::VibFreqX,
        Channel::VibFreqY,
        Channel::VibFreqZ,
    ];

    pub fn from_register(register: u16) -> Option<Self> {
        let index = register.checked_sub(Self::FIRST_REGISTER)? as usize;
        Self::ALL.get(index).copied()
    }

    pub fn register(self) -> u16 {
        Self::FIRST_REGISTER + self.index() as u16
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn quantity(self) -> Quantity {
        match quantity_at(self.register()) {
            Some(quantity) => quantity,
            None => unreachable!("every channel register is mapped"),
        }
    }

    /// Stable name, e.g. `accel_x` or `vib_speed_z`.
    pub fn key(self) -> &'static str {
        match self {
            Channel::AccelX => "accel_x",
            Channel::AccelY => "accel_y",
            Channel::AccelZ => "accel_z",
            Channel::GyroX => "gyro_x",
            Channel::GyroY => "gyro_y",
            Channel::GyroZ => "gyro_z",
            Channel::VibSpeedX => "vib_speed_x",
            Channel::VibSpeedY => "vib_speed_y",
            Channel::VibSpeedZ => "vib_speed_z",
            Channel::VibAngleX => "vib_angle_x",
            Channel::VibAngleY => "vib_angle_y",
            Channel::VibAngleZ => "vib_angle_z",
            Channel::Temperature => "temperature",
            Channel::VibDispX => "vib_disp_x",
            Channel::VibDispY => "vib_disp_y",
            Channel::VibDispZ => "vib_disp_z",
            Channel::VibFreqX => "vib_freq_x",
            Channel::VibFreqY => "vib_freq_y",
            Channel::VibFreqZ => "vib_freq_z",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.key() == key)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where a decoded value is stored: a known channel or, outside the map, the bare register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Key {
    Channel(Channel),
    Register(u16),
}

impl Key {
    pub fn for_register(register: u16) -> Self {
        match Channel::from_register(register) {
            Some(channel) => Key::Channel(channel),
            None => Key::Register(register),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Channel(channel) => write!(f, "{channel}"),
            Key::Register(register) => write!(f, "{register}"),
        }
    }
}

/// Device specific sign handling.
///
/// Values above 32768 have 65535 (not 65536) subtracted, so `0xFFFF` reads as 0 and the result is
/// one higher than two's complement. Hardware verification of this rule is still pending; keep it
/// until then.
pub fn to_signed(raw: u16) -> i32 {
    let raw = raw as i32;
    if raw > 32768 {
        raw - 65535
    } else {
        raw
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    pub key: Key,
    pub value: f64,
}

/// Decodes one raw word read from `register`.
pub fn decode_word(register: u16, raw: u16) -> Sample {
    let signed = to_signed(raw);
    let key = Key::for_register(register);
    let value = match key {
        Key::Channel(channel) => channel.quantity().scale(signed),
        Key::Register(_) => signed as f64,
    };
    Sample { key, value }
}

/// Decodes consecutive register words, the first one read from `start_register`.
pub fn decode_words(start_register: u16, words: impl IntoIterator<Item = u16>) -> Vec<Sample> {
    words
        .into_iter()
        .enumerate()
        .map(|(offset, raw)| decode_word(start_register.wrapping_add(offset as u16), raw))
        .collect()
}
