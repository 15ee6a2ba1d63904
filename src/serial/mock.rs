//! Scripted GSM module for tests and dry runs.
//!
//! [`MockModem`] implements [`LinkOpener`] and answers AT commands the way a
//! SIM800-class module does: `OK` to probes and mode changes, a `> ` prompt after
//! `AT+CMGS`, and a configurable reply to the Ctrl-Z terminator. Every byte
//! written is journaled per port, and the modem tracks how many handles are open
//! on each port at once so tests can check mutual exclusion.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{LinkError, LinkHandle, LinkOpener, PortRegistry, SerialLink};
use crate::protocol::CTRL_Z;

/// How the module answers the message terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatorReply {
    /// Delivery confirmed with the given message reference.
    Accepted(u32),
    /// Module reports a failure line, e.g. `+CMS ERROR: 500`.
    Failed(String),
    /// Nothing comes back; the exchange runs into its deadline.
    Silent,
}

#[derive(Debug, Default)]
struct MockState {
    absent: bool,
    absent_ports: HashSet<String>,
    fail_writes: bool,
    reject_text_mode: bool,
    hold: Duration,
    default_reply: Option<TerminatorReply>,
    queued_replies: VecDeque<TerminatorReply>,
    inbox: HashMap<String, String>,
    unsolicited: HashMap<String, String>,
    journal: HashMap<String, Vec<u8>>,
    open_now: HashMap<String, usize>,
    peak_open: HashMap<String, usize>,
    busy_rejections: usize,
    opens: usize,
    closes: usize,
}

/// Shared handle to the scripted modem; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MockModem {
    state: Arc<Mutex<MockState>>,
    registry: PortRegistry,
}

impl MockModem {
    /// A present module that confirms every message with reference 12.
    pub fn new() -> Self {
        let modem = Self::default();
        modem.with_state(|s| s.default_reply = Some(TerminatorReply::Accepted(12)));
        modem
    }

    /// No module attached: every open fails with `LinkError::Unavailable`.
    pub fn absent() -> Self {
        let modem = Self::new();
        modem.with_state(|s| s.absent = true);
        modem
    }

    /// A module that never answers the terminator.
    pub fn silent() -> Self {
        let modem = Self::new();
        modem.set_default_reply(TerminatorReply::Silent);
        modem
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn set_absent(&self, absent: bool) {
        self.with_state(|s| s.absent = absent);
    }

    pub fn set_port_absent(&self, port: &str) {
        self.with_state(|s| {
            s.absent_ports.insert(port.to_string());
        });
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.with_state(|s| s.fail_writes = fail);
    }

    /// Answer `AT+CMGF=1` with `ERROR`.
    pub fn set_reject_text_mode(&self, reject: bool) {
        self.with_state(|s| s.reject_text_mode = reject);
    }

    /// Keep each write busy for `hold`, widening race windows in concurrency tests.
    pub fn set_hold(&self, hold: Duration) {
        self.with_state(|s| s.hold = hold);
    }

    pub fn set_default_reply(&self, reply: TerminatorReply) {
        self.with_state(|s| s.default_reply = Some(reply));
    }

    /// Replies consumed one per terminator before falling back to the default.
    pub fn queue_reply(&self, reply: TerminatorReply) {
        self.with_state(|s| s.queued_replies.push_back(reply));
    }

    /// Body returned (before the final `OK`) when `AT+CMGL` is issued on `port`.
    /// The inbox is emptied once listed.
    pub fn set_inbox(&self, port: &str, listing: &str) {
        self.with_state(|s| {
            s.inbox.insert(port.to_string(), listing.to_string());
        });
    }

    /// Text the module emits on its own right after the next open of `port`.
    pub fn push_unsolicited(&self, port: &str, text: &str) {
        self.with_state(|s| {
            s.unsolicited
                .entry(port.to_string())
                .or_default()
                .push_str(text);
        });
    }

    /// Everything written to `port`, in order.
    pub fn written(&self, port: &str) -> Vec<u8> {
        self.with_state(|s| s.journal.get(port).cloned().unwrap_or_default())
    }

    pub fn written_text(&self, port: &str) -> String {
        String::from_utf8_lossy(&self.written(port)).into_owned()
    }

    /// Number of messages terminated (Ctrl-Z bytes written) on `port`.
    pub fn terminators_sent(&self, port: &str) -> usize {
        self.written(port).iter().filter(|b| **b == CTRL_Z).count()
    }

    /// Highest number of simultaneously open handles observed on `port`.
    pub fn peak_open(&self, port: &str) -> usize {
        self.with_state(|s| s.peak_open.get(port).copied().unwrap_or(0))
    }

    pub fn busy_rejections(&self) -> usize {
        self.with_state(|s| s.busy_rejections)
    }

    pub fn open_count(&self) -> usize {
        self.with_state(|s| s.opens)
    }

    pub fn close_count(&self) -> usize {
        self.with_state(|s| s.closes)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl LinkOpener for MockModem {
    fn open(&self, port: &str, _baud_rate: u32, _timeout: Duration) -> Result<LinkHandle, LinkError> {
        let absent = self.with_state(|s| s.absent || s.absent_ports.contains(port));
        if absent {
            return Err(LinkError::Unavailable {
                port: port.to_string(),
                reason: "No such file or directory".to_string(),
            });
        }
        let claim = match self.registry.claim(port) {
            Ok(claim) => claim,
            Err(e) => {
                self.with_state(|s| s.busy_rejections += 1);
                return Err(e);
            }
        };
        let pending = self.with_state(|s| {
            s.opens += 1;
            let now = s.open_now.entry(port.to_string()).or_insert(0);
            *now += 1;
            let current = *now;
            let peak = s.peak_open.entry(port.to_string()).or_insert(0);
            *peak = (*peak).max(current);
            s.unsolicited.remove(port).unwrap_or_default()
        });
        let link = MockLink {
            port: port.to_string(),
            state: Arc::clone(&self.state),
            pending: pending.into_bytes(),
            closed: false,
        };
        Ok(LinkHandle::new(Box::new(link), claim))
    }
}

struct MockLink {
    port: String,
    state: Arc<Mutex<MockState>>,
    pending: Vec<u8>,
    closed: bool,
}

impl MockLink {
    fn respond(&self, state: &mut MockState, bytes: &[u8]) -> String {
        if bytes == [CTRL_Z] {
            let reply = state
                .queued_replies
                .pop_front()
                .or_else(|| state.default_reply.clone())
                .unwrap_or(TerminatorReply::Silent);
            return match reply {
                TerminatorReply::Accepted(reference) => {
                    format!("\r\n+CMGS: {}\r\n\r\nOK\r\n", reference)
                }
                TerminatorReply::Failed(line) => format!("\r\n{}\r\n", line),
                TerminatorReply::Silent => String::new(),
            };
        }
        let text = String::from_utf8_lossy(bytes);
        let command = text.trim_end_matches('\r');
        if command == "AT" {
            "\r\nOK\r\n".to_string()
        } else if command == "AT+CMGF=1" {
            if state.reject_text_mode {
                "\r\nERROR\r\n".to_string()
            } else {
                "\r\nOK\r\n".to_string()
            }
        } else if command.starts_with("AT+CMGS=") {
            "\r\n> ".to_string()
        } else if command.starts_with("AT+CMGL=") {
            let listing = state.inbox.remove(&self.port).unwrap_or_default();
            format!("{}\r\nOK\r\n", listing)
        } else if command.starts_with("AT+CMGD=") || command.starts_with("AT+") {
            "\r\nOK\r\n".to_string()
        } else {
            // Message body: echoed characters are not modelled.
            String::new()
        }
    }
}

impl SerialLink for MockLink {
    fn port(&self) -> &str {
        &self.port
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let (hold, reply) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.fail_writes {
                return Err(LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failure",
                )));
            }
            state
                .journal
                .entry(self.port.clone())
                .or_default()
                .extend_from_slice(bytes);
            let reply = self.respond(&mut state, bytes);
            (state.hold, reply)
        };
        if !hold.is_zero() {
            thread::sleep(hold);
        }
        self.pending.extend_from_slice(reply.as_bytes());
        Ok(())
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, LinkError> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            thread::sleep(remaining.min(Duration::from_millis(5)));
        }
        Ok(Vec::new())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closes += 1;
        if let Some(now) = state.open_now.get_mut(&self.port) {
            *now = now.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_like_a_gsm_module() {
        let modem = MockModem::new();
        let mut link = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1)).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        link.write(b"AT\r").unwrap();
        assert_eq!(link.read_available(deadline).unwrap(), b"\r\nOK\r\n");
        link.write(b"AT+CMGS=\"+237600000000\"\r").unwrap();
        assert_eq!(link.read_available(deadline).unwrap(), b"\r\n> ");
        link.write(&[CTRL_Z]).unwrap();
        let reply = String::from_utf8(link.read_available(deadline).unwrap()).unwrap();
        assert!(reply.contains("+CMGS: 12"));
    }

    #[test]
    fn queued_replies_precede_default() {
        let modem = MockModem::new();
        modem.queue_reply(TerminatorReply::Failed("+CMS ERROR: 500".into()));
        let mut link = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1)).unwrap();
        let deadline = Instant::now();
        link.write(&[CTRL_Z]).unwrap();
        assert_eq!(
            link.read_available(deadline).unwrap(),
            b"\r\n+CMS ERROR: 500\r\n"
        );
        link.write(&[CTRL_Z]).unwrap();
        let reply = String::from_utf8(link.read_available(deadline).unwrap()).unwrap();
        assert!(reply.contains("+CMGS: 12"));
    }

    #[test]
    fn second_open_on_same_port_is_busy() {
        let modem = MockModem::new();
        let _held = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1)).unwrap();
        let second = modem.open("/dev/ttyMOCK", 9600, Duration::from_secs(1));
        assert!(matches!(second, Err(LinkError::Busy(_))));
        assert_eq!(modem.busy_rejections(), 1);
        assert_eq!(modem.peak_open("/dev/ttyMOCK"), 1);
    }

    #[test]
    fn absent_modem_is_unavailable() {
        let modem = MockModem::absent();
        let err = modem
            .open("/dev/ttyUSB0", 9600, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(modem.open_count(), 0);
    }
}
