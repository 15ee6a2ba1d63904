//! # Serial Link
//!
//! Byte transport to the GSM module. This layer knows nothing about AT
//! commands: it opens a port, writes bytes, reads whatever arrives before a
//! deadline and closes.
//!
//! Access is scoped. [`LinkOpener::open`] returns a [`LinkHandle`] that owns the
//! port for the duration of one exchange and closes it on drop, so every exit
//! path (including early returns on error) releases the port. A
//! [`PortRegistry`] guarantees at most one open handle per physical port; a
//! second open on a held port fails with [`LinkError::Busy`].
//!
//! The production opener ([`SystemOpener`]) uses the `serialport` crate and is
//! compiled with the default `serial` feature. Tests use [`mock::MockModem`].

pub mod mock;

use log::{debug, trace};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::logutil::hex_snippet;
use crate::storage::DeviceId;

/// Upper bound on a single blocking read, so deadlines are honoured promptly.
pub const READ_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LinkError {
    /// No device behind this path (unplugged or wrong path).
    #[error("serial port {port} unavailable: {reason}")]
    Unavailable { port: String, reason: String },

    /// Another exchange currently holds the port.
    #[error("serial port {0} is held by another exchange")]
    Busy(String),

    /// The module stopped accepting bytes before the write deadline.
    #[error("serial port {0} timed out")]
    Timeout(String),

    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LinkError::Unavailable { .. })
    }
}

/// An open byte channel to a GSM module.
pub trait SerialLink: Send {
    fn port(&self) -> &str;

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Return the bytes that arrive before `deadline`.
    ///
    /// Returns as soon as at least one byte is available; returns an empty
    /// buffer once the deadline passes with nothing received. Bytes already
    /// buffered are returned even if the deadline is in the past.
    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, LinkError>;

    fn close(&mut self);
}

/// Opens links. Implemented by the real serial backend and by test doubles.
pub trait LinkOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<LinkHandle, LinkError>;
}

/// Which serial port reaches which device. Devices without an override share
/// the default port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    default: String,
    overrides: HashMap<DeviceId, String>,
}

impl PortMap {
    pub fn new(default: &str) -> Self {
        Self {
            default: default.to_string(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, device: DeviceId, port: &str) -> Self {
        self.overrides.insert(device, port.to_string());
        self
    }

    pub fn port_for(&self, device: DeviceId) -> &str {
        self.overrides
            .get(&device)
            .map(|s| s.as_str())
            .unwrap_or(&self.default)
    }

    /// Group `devices` by the port serving them, in port order.
    pub fn group_by_port(&self, devices: &[DeviceId]) -> BTreeMap<String, Vec<DeviceId>> {
        let mut groups: BTreeMap<String, Vec<DeviceId>> = BTreeMap::new();
        for device in devices {
            groups
                .entry(self.port_for(*device).to_string())
                .or_default()
                .push(*device);
        }
        groups
    }
}

/// Tracks which ports currently have an open handle.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by every [`SystemOpener`].
    pub fn global() -> Self {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PortRegistry::new).clone()
    }

    /// Claim `port` for exclusive use; released when the claim drops.
    pub fn claim(&self, port: &str) -> Result<PortClaim, LinkError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(port.to_string()) {
            return Err(LinkError::Busy(port.to_string()));
        }
        Ok(PortClaim {
            port: port.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, port: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(port)
    }
}

#[derive(Debug)]
pub struct PortClaim {
    port: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

/// Scoped ownership of one open link. Closing happens exactly once, either
/// explicitly through [`LinkHandle::close`] or on drop, and the port claim is
/// released right after.
pub struct LinkHandle {
    link: Box<dyn SerialLink>,
    closed: bool,
    _claim: PortClaim,
}

impl LinkHandle {
    pub fn new(link: Box<dyn SerialLink>, claim: PortClaim) -> Self {
        Self {
            link,
            closed: false,
            _claim: claim,
        }
    }

    pub fn port(&self) -> &str {
        self.link.port()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        trace!("TX {} {}", self.link.port(), hex_snippet(bytes, 64));
        self.link.write(bytes)
    }

    pub fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, LinkError> {
        let data = self.link.read_available(deadline)?;
        if !data.is_empty() {
            trace!("RX {} {}", self.link.port(), hex_snippet(&data, 64));
        }
        Ok(data)
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.link.close();
            self.closed = true;
            debug!("Serial link {} closed", self.link.port());
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("port", &self.link.port())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SystemOpener {
    registry: PortRegistry,
}

impl SystemOpener {
    pub fn new() -> Self {
        Self {
            registry: PortRegistry::global(),
        }
    }
}

impl Default for SystemOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkOpener for SystemOpener {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<LinkHandle, LinkError> {
        let claim = self.registry.claim(port)?;

        #[cfg(feature = "serial")]
        {
            let link = SerialPortLink::open(port, baud_rate, timeout)?;
            Ok(LinkHandle::new(Box::new(link), claim))
        }

        #[cfg(not(feature = "serial"))]
        {
            let _ = (baud_rate, timeout, claim);
            Err(LinkError::Unavailable {
                port: port.to_string(),
                reason: "serial support not compiled in".to_string(),
            })
        }
    }
}

#[cfg(feature = "serial")]
pub struct SerialPortLink {
    port_name: String,
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialPortLink {
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LinkError> {
        debug!("Opening serial port {} at {} baud", port_name, baud_rate);
        let mut builder = serialport::new(port_name, baud_rate).timeout(timeout.min(READ_SLICE));
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| open_error(port_name, e))?;
        let _ = port.write_data_terminal_ready(true);
        Ok(Self {
            port_name: port_name.to_string(),
            port,
        })
    }
}

/// Only a missing device counts as an absent module; a port that exists but
/// cannot be opened (held elsewhere, no permission) is an I/O failure.
#[cfg(feature = "serial")]
fn open_error(port_name: &str, e: serialport::Error) -> LinkError {
    use serialport::ErrorKind;
    match e.kind() {
        ErrorKind::NoDevice | ErrorKind::Io(std::io::ErrorKind::NotFound) => LinkError::Unavailable {
            port: port_name.to_string(),
            reason: e.to_string(),
        },
        ErrorKind::Io(kind) => LinkError::Io(std::io::Error::new(kind, format!("{}: {}", port_name, e))),
        _ => LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{}: {}", port_name, e),
        )),
    }
}

#[cfg(feature = "serial")]
impl SerialLink for SerialPortLink {
    fn port(&self) -> &str {
        &self.port_name
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        use std::io::{ErrorKind, Write};
        let timed_out = |e: std::io::Error| {
            if e.kind() == ErrorKind::TimedOut {
                LinkError::Timeout(self.port_name.clone())
            } else {
                LinkError::Io(e)
            }
        };
        self.port.write_all(bytes).map_err(timed_out)?;
        self.port.flush().map_err(timed_out)?;
        Ok(())
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, LinkError> {
        use std::io::{ErrorKind, Read};
        let mut buffer = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let pending = self.port.bytes_to_read().unwrap_or(0);
                if pending == 0 {
                    return Ok(Vec::new());
                }
            }
            let slice = remaining.min(READ_SLICE).max(Duration::from_millis(1));
            let _ = self.port.set_timeout(slice);
            match self.port.read(&mut buffer) {
                Ok(0) => {
                    if remaining.is_zero() {
                        return Ok(Vec::new());
                    }
                }
                Ok(n) => return Ok(buffer[..n].to_vec()),
                Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    if remaining.is_zero() {
                        return Ok(Vec::new());
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                    debug!("Serial read interrupted (EINTR) on {}", self.port_name);
                }
                Err(e) => return Err(LinkError::Io(e)),
            }
        }
    }

    fn close(&mut self) {
        use std::io::Write;
        let _ = self.port.flush();
        let _ = self.port.write_data_terminal_ready(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_second_claim() {
        let registry = PortRegistry::new();
        let first = registry.claim("/dev/ttyTEST0").unwrap();
        assert!(matches!(
            registry.claim("/dev/ttyTEST0"),
            Err(LinkError::Busy(p)) if p == "/dev/ttyTEST0"
        ));
        assert!(registry.claim("/dev/ttyTEST1").is_ok());
        drop(first);
        assert!(registry.claim("/dev/ttyTEST0").is_ok());
    }

    #[test]
    fn handle_releases_port_on_drop() {
        let modem = mock::MockModem::new();
        {
            let _handle = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1)).unwrap();
            assert!(modem.registry().is_held("/dev/ttyMOCK"));
        }
        assert!(!modem.registry().is_held("/dev/ttyMOCK"));
        assert_eq!(modem.close_count(), 1);
    }

    #[test]
    fn explicit_close_runs_once() {
        let modem = mock::MockModem::new();
        let handle = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1)).unwrap();
        handle.close();
        assert_eq!(modem.close_count(), 1);
        assert!(!modem.registry().is_held("/dev/ttyMOCK"));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn only_missing_devices_count_as_unavailable() {
        use serialport::{Error, ErrorKind};
        let missing = open_error("/dev/ttyUSB9", Error::new(ErrorKind::NoDevice, "no such device"));
        assert!(missing.is_unavailable());
        let not_found = open_error(
            "/dev/ttyUSB9",
            Error::new(ErrorKind::Io(std::io::ErrorKind::NotFound), "not found"),
        );
        assert!(not_found.is_unavailable());

        let denied = open_error(
            "/dev/ttyUSB0",
            Error::new(ErrorKind::Io(std::io::ErrorKind::PermissionDenied), "permission denied"),
        );
        assert!(matches!(&denied, LinkError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied));
        let locked = open_error("/dev/ttyUSB0", Error::new(ErrorKind::Unknown, "device or resource busy"));
        assert!(matches!(locked, LinkError::Io(_)));
    }

    #[test]
    fn port_map_groups_shared_ports() {
        let map = PortMap::new("/dev/ttyUSB0").with_override(3, "/dev/ttyUSB1");
        assert_eq!(map.port_for(3), "/dev/ttyUSB1");
        assert_eq!(map.port_for(4), "/dev/ttyUSB0");
        let groups = map.group_by_port(&[1, 3, 4]);
        assert_eq!(groups["/dev/ttyUSB0"], vec![1, 4]);
        assert_eq!(groups["/dev/ttyUSB1"], vec![3]);
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn system_opener_reports_unavailable_without_serial_feature() {
        let opener = SystemOpener::new();
        let err = opener
            .open("/dev/ttyNOPE", 9600, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
