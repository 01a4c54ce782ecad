//! Latest value per channel, shared between the polling thread and any number of readers.

use crate::registers::{Channel, Key, Sample};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Values {
    channels: [Option<f64>; Channel::COUNT],
    registers: BTreeMap<u16, f64>,
}

/// Holds the most recent decoded value of every channel. No history, no timestamps.
#[derive(Debug, Default)]
pub struct SampleStore {
    values: RwLock<Values>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer cannot leave a half written f64 behind, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Values> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Values> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest value of `channel`, `None` until it was decoded once.
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.read().channels[channel.index()]
    }

    pub fn get_key(&self, key: Key) -> Option<f64> {
        match key {
            Key::Channel(channel) => self.get(channel),
            Key::Register(register) => self.read().registers.get(&register).copied(),
        }
    }

    pub fn set(&self, sample: Sample) {
        let mut values = self.write();
        match sample.key {
            Key::Channel(channel) => values.channels[channel.index()] = Some(sample.value),
            Key::Register(register) => {
                values.registers.insert(register, sample.value);
            }
        }
    }

    /// Stores all samples of one decoded frame, each one becoming visible as it is written.
    pub fn update(&self, samples: &[Sample]) {
        for sample in samples {
            self.set(*sample);
        }
    }

    /// All known values, channels first in register order, then unmapped registers.
    pub fn snapshot(&self) -> Vec<Sample> {
        let values = self.read();
        let channels = Channel::ALL.iter().filter_map(|channel| {
            values.channels[channel.index()].map(|value| Sample {
                key: Key::Channel(*channel),
                value,
            })
        });
        let registers = values.registers.iter().map(|(register, value)| Sample {
            key: Key::Register(*register),
            value: *value,
        });
        channels.chain(registers).collect()
    }

    pub fn clear(&self) {
        *self.write() = Values::default();
    }
}
