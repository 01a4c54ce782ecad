//! Device session: connection lifecycle, the background polling thread and register writes.
//!
//! ```text
//! Closed --open()--> Opening --> Open --start_acquisition()--> Polling
//! Polling --stop_acquisition()--> Open --close()--> Closed
//! Polling --fault / lost connection--> Closed
//! ```
//!
//! All traffic on the wire goes through one mutex around the transport. The polling thread holds
//! it for one drain/decode/request cycle, [`Session::write_register`] holds it for the whole
//! unlock/write/save sequence, so the two never interleave.

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{
    read_request, save_request, unlock_request, write_request, FrameDecoder, BLOCK_LENGTH,
    BLOCK_START, DEFAULT_ADDRESS, MAX_BUFFER_LENGTH, SETTLE_DELAY,
};
use crate::registers::{decode_words, Channel};
use crate::store::SampleStore;
use crate::transport::{Connector, Transport};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lower bound of the poll interval, the device needs time to answer.
pub const MINIMUM_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Capabilities every supported sensor model offers.
pub trait Sensor {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn start_acquisition(&mut self) -> Result<()>;
    fn stop_acquisition(&mut self);
    /// Requests the whole measurement block; the answer is picked up by the polling thread.
    fn read_all_channels(&self) -> Result<()>;
    /// Writes a configuration register, bracketed by unlock and save.
    fn write_register(&self, register: u16, value: u16) -> Result<()>;
    /// Latest value, never blocks on I/O.
    fn get(&self, channel: Channel) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Polling,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Name used in log messages.
    pub name: String,
    /// Modbus address of the sensor.
    pub address: u8,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub poll_interval: Duration,
    pub open_attempts: u32,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub open_backoff: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub settle_delay: Duration,
    pub max_consecutive_errors: u32,
    /// How long `close()`/`stop_acquisition()` wait for the polling thread.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub join_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "WTVB01".to_string(),
            address: DEFAULT_ADDRESS,
            poll_interval: Duration::from_millis(50),
            open_attempts: 3,
            open_backoff: Duration::from_secs(2),
            settle_delay: SETTLE_DELAY,
            max_consecutive_errors: 5,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Cooperative stop flag observed once per polling iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared<T> {
    state: Mutex<SessionState>,
    transport: Mutex<Option<T>>,
    store: SampleStore,
    /// Start register of the last read request; responses do not echo it.
    read_start: AtomicU16,
    fault: Mutex<Option<u32>>,
}

impl<T: Transport> Shared<T> {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn send_read(&self, transport: &mut T, address: u8, register: u16, count: u16) -> Result<()> {
        self.read_start.store(register, Ordering::Release);
        transport
            .send(&read_request(address, register, count))
            .map_err(|e| Error::Acquisition(format!("cannot send read request: {e}")))
    }

    fn release_transport(&self) {
        clear_transport(&mut lock(&self.transport));
    }

    /// Closes the session from the polling thread, unless the owner cancelled it first.
    ///
    /// The cancel check and the release happen under the transport lock, so a thread the owner
    /// gave up waiting for never touches a transport opened after it was cancelled.
    fn close_from_worker(&self, cancel: &CancelToken, fault: Option<u32>) {
        let mut transport = lock(&self.transport);
        if cancel.is_cancelled() {
            return;
        }
        if fault.is_some() {
            *lock(&self.fault) = fault;
        }
        clear_transport(&mut transport);
        self.set_state(SessionState::Closed);
    }
}

fn clear_transport<T: Transport>(slot: &mut Option<T>) {
    if let Some(mut transport) = slot.take() {
        if let Err(err) = transport.clear() {
            log::warn!("Cannot clear serial buffers: {err}");
        }
    }
}

struct Worker {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// One physical sensor behind a [`Connector`].
pub struct Session<C: Connector> {
    connector: C,
    config: SessionConfig,
    shared: Arc<Shared<C::Transport>>,
    worker: Option<Worker>,
}

#[cfg(feature = "serialport")]
impl Session<crate::transport::SerialConnector> {
    /// Session on a serial port with the factory baud rate and address.
    pub fn serial(port: &str) -> Self {
        Self::new(
            crate::transport::SerialConnector::new(port),
            SessionConfig::default(),
        )
    }
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, mut config: SessionConfig) -> Self {
        if config.poll_interval < MINIMUM_POLL_INTERVAL {
            log::warn!(
                "poll interval {:?} lower minimum {MINIMUM_POLL_INTERVAL:?}, use minimum",
                config.poll_interval
            );
            config.poll_interval = MINIMUM_POLL_INTERVAL;
        }
        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Closed),
                transport: Mutex::new(None),
                store: SampleStore::new(),
                read_start: AtomicU16::new(BLOCK_START),
                fault: Mutex::new(None),
            }),
            worker: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Open | SessionState::Polling)
    }

    pub fn is_acquiring(&self) -> bool {
        self.state() == SessionState::Polling
    }

    pub fn store(&self) -> &SampleStore {
        &self.shared.store
    }

    /// Returns the fault that closed the session, if any, and forgets it.
    pub fn take_fault(&self) -> Option<Error> {
        lock(&self.shared.fault)
            .take()
            .map(|consecutive_errors| Error::Fault { consecutive_errors })
    }

    fn not_open(&self) -> Error {
        Error::Connection(format!("device {} is not open", self.config.name))
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let cancel = CancelToken::default();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-poll", self.config.name))
            .spawn(move || poll_loop(shared, config, token))?;
        self.worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Cancels the polling thread and waits up to `join_timeout` for it.
    fn stop_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.cancel.cancel();
        let deadline = Instant::now() + self.config.join_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                log::error!("Polling thread of {} panicked", self.config.name);
            }
        } else {
            log::warn!(
                "Polling thread of {} did not stop within {:?}",
                self.config.name,
                self.config.join_timeout
            );
        }
    }
}

impl<C: Connector> Sensor for Session<C> {
    fn open(&mut self) -> Result<()> {
        if self.state() != SessionState::Closed {
            log::warn!("Device {} already open", self.config.name);
            return Ok(());
        }
        // reap a polling thread that ended on its own
        self.stop_worker();

        let endpoint = self.connector.endpoint();
        log::info!("Opening device {} ({endpoint})", self.config.name);
        self.shared.set_state(SessionState::Opening);
        *lock(&self.shared.fault) = None;

        let attempts = self.config.open_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect() {
                Ok(transport) => {
                    *lock(&self.shared.transport) = Some(transport);
                    self.shared.set_state(SessionState::Open);
                    log::info!("Device {} connected", self.config.name);
                    return Ok(());
                }
                Err(err) => {
                    log::error!("Cannot open {endpoint} (attempt {attempt}/{attempts}): {err}");
                    if attempt >= attempts {
                        self.shared.set_state(SessionState::Closed);
                        return Err(Error::Connection(format!(
                            "cannot open {endpoint} after {attempts} attempts: {err}"
                        )));
                    }
                    std::thread::sleep(self.config.open_backoff);
                    attempt += 1;
                }
            }
        }
    }

    fn close(&mut self) {
        if self.worker.is_none() && self.state() == SessionState::Closed {
            log::debug!("Device {} already closed", self.config.name);
            return;
        }
        log::info!("Closing device {}", self.config.name);
        self.stop_worker();
        self.shared.release_transport();
        self.shared.set_state(SessionState::Closed);
        log::info!("Device {} closed", self.config.name);
    }

    fn start_acquisition(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Polling => {
                log::warn!("Acquisition on {} already running", self.config.name);
                Ok(())
            }
            SessionState::Open => {
                self.stop_worker();
                self.shared.set_state(SessionState::Polling);
                if let Err(err) = self.spawn_worker() {
                    self.shared.set_state(SessionState::Open);
                    return Err(err);
                }
                log::info!("Acquisition on {} started", self.config.name);
                Ok(())
            }
            SessionState::Closed | SessionState::Opening => {
                log::warn!("Device {} not open, cannot start acquisition", self.config.name);
                Err(self.not_open())
            }
        }
    }

    fn stop_acquisition(&mut self) {
        if self.worker.is_none() {
            log::warn!("Acquisition on {} not running", self.config.name);
            return;
        }
        self.stop_worker();
        let mut state = lock(&self.shared.state);
        if *state == SessionState::Polling {
            *state = SessionState::Open;
        }
        log::info!("Acquisition on {} stopped", self.config.name);
    }

    fn read_all_channels(&self) -> Result<()> {
        let mut transport = lock(&self.shared.transport);
        let transport = transport.as_mut().ok_or_else(|| self.not_open())?;
        self.shared
            .send_read(transport, self.config.address, BLOCK_START, BLOCK_LENGTH)
    }

    fn write_register(&self, register: u16, value: u16) -> Result<()> {
        let address = self.config.address;
        let mut transport = lock(&self.shared.transport);
        let transport = transport.as_mut().ok_or_else(|| self.not_open())?;
        log::info!(
            "Writing {value:#06x} to register {register:#04x} of {}",
            self.config.name
        );
        transport.send(&unlock_request(address))?;
        std::thread::sleep(self.config.settle_delay);
        transport.send(&write_request(address, register, value))?;
        std::thread::sleep(self.config.settle_delay);
        transport.send(&save_request(address))?;
        Ok(())
    }

    fn get(&self, channel: Channel) -> Option<f64> {
        self.shared.store.get(channel)
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// One drain/decode/request round. Holds the transport for its whole duration.
///
/// Returns whether at least one frame was decoded. A cycle that received bytes but rejected all
/// of them fails with the last rejection, as does a cycle that saw a malformed frame.
fn poll_cycle<T: Transport>(
    shared: &Shared<T>,
    config: &SessionConfig,
    cancel: &CancelToken,
    decoder: &mut FrameDecoder,
    rx_buffer: &mut Vec<u8>,
) -> Result<bool> {
    let mut transport = lock(&shared.transport);
    if cancel.is_cancelled() {
        return Ok(false);
    }
    let transport = transport
        .as_mut()
        .ok_or_else(|| Error::Connection("serial port closed".to_string()))?;

    rx_buffer.clear();
    transport
        .receive(rx_buffer)
        .map_err(|e| Error::Acquisition(format!("serial read failed: {e}")))?;
    if cancel.is_cancelled() {
        return Ok(false);
    }

    let mut decoded = 0;
    let mut rejected = None;
    let mut malformed = None;
    if !rx_buffer.is_empty() {
        decoder.extend(rx_buffer);
        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(frame) => {
                    let start = shared.read_start.load(Ordering::Acquire);
                    let samples = decode_words(start, frame.words());
                    log::debug!("Decoded {} registers from {start:#04x}", samples.len());
                    shared.store.update(&samples);
                    decoded += 1;
                }
                Err(err @ ProtocolError::OddPayloadLength(_)) => {
                    log::error!("Malformed frame: {err}");
                    malformed = Some(err);
                }
                Err(err @ (ProtocolError::CrcMismatch { .. } | ProtocolError::BufferOverflow(_))) => {
                    log::warn!("{err}");
                    rejected = Some(err);
                }
                Err(err) => {
                    log::trace!("resync: {err}");
                    rejected = Some(err);
                }
            }
        }
    }

    shared.send_read(transport, config.address, BLOCK_START, BLOCK_LENGTH)?;
    match (malformed, rejected) {
        (Some(err), _) => Err(err.into()),
        (None, Some(err)) if decoded == 0 => Err(err.into()),
        _ => Ok(decoded > 0),
    }
}

fn poll_loop<T: Transport>(shared: Arc<Shared<T>>, config: SessionConfig, cancel: CancelToken) {
    log::debug!("Polling thread of {} started", config.name);
    let mut decoder = FrameDecoder::new(config.address);
    let mut rx_buffer = Vec::with_capacity(MAX_BUFFER_LENGTH);
    let mut consecutive_errors: u32 = 0;

    while !cancel.is_cancelled() {
        match poll_cycle(&shared, &config, &cancel, &mut decoder, &mut rx_buffer) {
            Ok(true) => consecutive_errors = 0,
            // nothing arrived yet, neither a success nor a failure
            Ok(false) => {}
            Err(Error::Connection(err)) => {
                log::error!("Device {} lost: {err}", config.name);
                shared.close_from_worker(&cancel, None);
                break;
            }
            Err(err) => {
                consecutive_errors += 1;
                log::error!(
                    "Acquisition error ({consecutive_errors}/{}): {err}",
                    config.max_consecutive_errors
                );
                if consecutive_errors >= config.max_consecutive_errors {
                    log::error!(
                        "Too many consecutive errors, closing device {}",
                        config.name
                    );
                    shared.close_from_worker(&cancel, Some(consecutive_errors));
                    break;
                }
            }
        }
        std::thread::sleep(config.poll_interval);
    }
    log::debug!("Polling thread of {} stopped", config.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::default();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[derive(Default)]
    struct CountingTransport {
        clears: usize,
    }

    impl Transport for CountingTransport {
        fn send(&mut self, _frame: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn receive(&mut self, _buffer: &mut Vec<u8>) -> std::io::Result<usize> {
            Ok(0)
        }
        fn clear(&mut self) -> std::io::Result<()> {
            self.clears += 1;
            Ok(())
        }
    }

    fn open_shared() -> Shared<CountingTransport> {
        Shared {
            state: Mutex::new(SessionState::Polling),
            transport: Mutex::new(Some(CountingTransport::default())),
            store: SampleStore::new(),
            read_start: AtomicU16::new(BLOCK_START),
            fault: Mutex::new(None),
        }
    }

    #[test]
    fn cancelled_worker_leaves_transport_alone() {
        let shared = open_shared();
        let cancel = CancelToken::default();
        cancel.cancel();
        shared.close_from_worker(&cancel, Some(5));
        assert!(lock(&shared.transport).is_some());
        assert_eq!(shared.state(), SessionState::Polling);
        assert!(lock(&shared.fault).is_none());

        let config = SessionConfig::default();
        let mut decoder = FrameDecoder::new(config.address);
        let mut rx_buffer = Vec::new();
        assert!(!poll_cycle(&shared, &config, &cancel, &mut decoder, &mut rx_buffer).unwrap());
    }

    #[test]
    fn worker_fault_releases_transport() {
        let shared = open_shared();
        shared.close_from_worker(&CancelToken::default(), Some(5));
        assert!(lock(&shared.transport).is_none());
        assert_eq!(shared.state(), SessionState::Closed);
        assert_eq!(*lock(&shared.fault), Some(5));
    }

    #[test]
    fn default_config_matches_device_timing() {
        let config = SessionConfig::default();
        assert_eq!(config.address, 0x50);
        assert_eq!(config.open_attempts, 3);
        assert_eq!(config.open_backoff, Duration::from_secs(2));
        assert_eq!(config.settle_delay, Duration::from_millis(100));
        assert_eq!(config.max_consecutive_errors, 5);
        assert!(config.poll_interval >= MINIMUM_POLL_INTERVAL);
    }
}
