//! # AT Command Protocol
//!
//! Drives one SMS exchange with the GSM module as an explicit state machine:
//!
//! ```text
//! Idle -> ModuleProbe -> TextModeSet -> NumberAddressed -> PayloadSent -> TerminatorSent
//!                                                                           |-> Confirmed
//!                                                                           '-> Rejected
//! Idle -> Simulated   (no module attached and simulation enabled)
//! ```
//!
//! Every transition writes one command and then reads the module's answer with a
//! bounded deadline instead of sleeping blindly: intermediate steps stop reading as
//! soon as a final result code (or the `>` prompt) arrives, or when the settle
//! window expires; the terminator step waits up to the command deadline for
//! `OK`/`+CMGS:`.
//!
//! The whole sequence runs under one [`LinkHandle`]. A failed write or an
//! `ERROR` answer ends the exchange in `Rejected`; the handle is dropped (and the
//! port closed) on every path. There is no retry here; that belongs to the
//! dispatcher.
//!
//! All calls block on serial I/O and are meant to run on a blocking thread
//! (`tokio::task::spawn_blocking`).

pub mod commands;
pub mod inbox;

pub use commands::{AtCommand, CTRL_Z};
pub use inbox::{parse_inbox, InboundKind, InboundMessage};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::logutil::{escape_log, mask_number};
use crate::serial::{LinkError, LinkHandle, LinkOpener};
use commands::{
    closing_result, error_line, has_error_token, has_final_result, has_prompt, has_success_token,
    message_reference, LIST_UNREAD,
};

/// States of one outbound exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeState {
    Idle,
    ModuleProbe,
    TextModeSet,
    NumberAddressed,
    PayloadSent,
    TerminatorSent,
    Confirmed,
    Rejected,
    Simulated,
}

/// Timing profile of the module. Values come from `[gsm]` in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTiming {
    /// Window after opening the port, used to drain boot noise and unsolicited notices
    pub open_settle: Duration,
    /// Upper bound on waiting for an intermediate command's answer
    pub step_settle: Duration,
    /// Deadline for the final answer after the terminator (and for busy-port waits)
    pub command_timeout: Duration,
    /// Poll interval while the port is held by another exchange
    pub busy_poll: Duration,
}

impl Default for ExchangeTiming {
    fn default() -> Self {
        Self {
            open_settle: Duration::from_secs(1),
            step_settle: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
            busy_poll: Duration::from_millis(50),
        }
    }
}

impl ExchangeTiming {
    /// Near-zero settle windows with a short deadline, for scripted links.
    pub fn immediate(command_timeout: Duration) -> Self {
        Self {
            open_settle: Duration::ZERO,
            step_settle: Duration::ZERO,
            command_timeout,
            busy_poll: Duration::from_millis(1),
        }
    }
}

/// Why an exchange was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No module on the port and simulation is disabled
    HardwareAbsent(String),
    /// The port stayed held by another exchange past the deadline
    LinkBusy,
    /// Write/read failure on an open port
    Transport(String),
    /// The module answered a step with an error result
    ModuleError { state: ExchangeState, line: String },
    /// No success token before the deadline
    Timeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::HardwareAbsent(detail) => write!(f, "GSM module absent: {}", detail),
            RejectReason::LinkBusy => write!(f, "serial link busy"),
            RejectReason::Transport(detail) => write!(f, "transport fault: {}", detail),
            RejectReason::ModuleError { state, line } => {
                write!(f, "module error in {:?}: {}", state, line)
            }
            RejectReason::Timeout => write!(f, "no confirmation before deadline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Confirmed { reference: Option<u32> },
    Rejected(RejectReason),
    /// No module attached; delivery was simulated, nothing went over the air.
    Simulated,
}

impl ExchangeOutcome {
    /// Confirmed or simulated.
    pub fn is_delivered(&self) -> bool {
        !matches!(self, ExchangeOutcome::Rejected(_))
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, ExchangeOutcome::Simulated)
    }
}

/// Result of one outbound exchange.
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub outcome: ExchangeOutcome,
    /// Every state visited, starting at `Idle` and ending in a terminal state
    pub trace: Vec<ExchangeState>,
    /// Text collected after the terminator
    pub response: String,
    pub elapsed: Duration,
}

impl ExchangeReport {
    pub fn final_state(&self) -> ExchangeState {
        self.trace.last().copied().unwrap_or(ExchangeState::Idle)
    }
}

#[derive(Debug, Clone)]
pub enum InboxOutcome {
    Read(Vec<InboundMessage>),
    Simulated,
    Failed(RejectReason),
}

/// Runs exchanges against one modem backend.
#[derive(Clone)]
pub struct AtProtocol {
    opener: Arc<dyn LinkOpener>,
    baud_rate: u32,
    timing: ExchangeTiming,
    simulate_when_absent: bool,
}

impl AtProtocol {
    pub fn new(
        opener: Arc<dyn LinkOpener>,
        baud_rate: u32,
        timing: ExchangeTiming,
        simulate_when_absent: bool,
    ) -> Self {
        Self {
            opener,
            baud_rate,
            timing,
            simulate_when_absent,
        }
    }

    pub fn timing(&self) -> ExchangeTiming {
        self.timing
    }

    /// Send `body` to `number` through the module on `port`.
    pub fn send_sms(&self, port: &str, number: &str, body: &str) -> ExchangeReport {
        let started = Instant::now();
        let mut trace = vec![ExchangeState::Idle];
        let masked = mask_number(number);

        let mut link = match self.acquire(port) {
            Ok(link) => link,
            Err(LinkError::Unavailable { port, reason }) if self.simulate_when_absent => {
                warn!(
                    "[SIMULATION] No GSM module on {} ({}); simulating SMS to {}: {}",
                    port,
                    reason,
                    masked,
                    escape_log(body)
                );
                trace.push(ExchangeState::Simulated);
                return ExchangeReport {
                    outcome: ExchangeOutcome::Simulated,
                    trace,
                    response: String::new(),
                    elapsed: started.elapsed(),
                };
            }
            Err(e) => {
                let reason = reason_from_link_error(e);
                warn!("Cannot open GSM link on {}: {}", port, reason);
                trace.push(ExchangeState::Rejected);
                return ExchangeReport {
                    outcome: ExchangeOutcome::Rejected(reason),
                    trace,
                    response: String::new(),
                    elapsed: started.elapsed(),
                };
            }
        };

        let result = self.run_send(&mut link, &mut trace, number, body);
        link.close();

        let (outcome, response) = match result {
            Ok((reference, response)) => {
                info!(
                    "SMS to {} confirmed on {} (ref {:?})",
                    masked, port, reference
                );
                trace.push(ExchangeState::Confirmed);
                (ExchangeOutcome::Confirmed { reference }, response)
            }
            Err((reason, response)) => {
                warn!(
                    "SMS to {} rejected on {}: {} (module said: {})",
                    masked,
                    port,
                    reason,
                    escape_log(&response)
                );
                trace.push(ExchangeState::Rejected);
                (ExchangeOutcome::Rejected(reason), response)
            }
        };
        ExchangeReport {
            outcome,
            trace,
            response,
            elapsed: started.elapsed(),
        }
    }

    fn run_send(
        &self,
        link: &mut LinkHandle,
        trace: &mut Vec<ExchangeState>,
        number: &str,
        body: &str,
    ) -> Result<(Option<u32>, String), (RejectReason, String)> {
        let t = self.timing;
        let boot = collect(link, t.open_settle, |_| false).map_err(|e| (transport(e), String::new()))?;
        if !boot.is_empty() {
            debug!("Discarded on open: {}", escape_log(&boot));
        }

        self.step(link, trace, ExchangeState::ModuleProbe, &AtCommand::Probe, t.step_settle, has_final_result, false)?;
        self.step(link, trace, ExchangeState::TextModeSet, &AtCommand::TextMode, t.step_settle, has_final_result, true)?;
        let compose = AtCommand::Compose {
            number: number.to_string(),
        };
        self.step(link, trace, ExchangeState::NumberAddressed, &compose, t.step_settle, has_prompt, true)?;
        self.step(link, trace, ExchangeState::PayloadSent, &AtCommand::Body(body.to_string()), t.step_settle, |_| false, false)?;

        trace.push(ExchangeState::TerminatorSent);
        link.write(&AtCommand::Terminator.encode())
            .map_err(|e| (transport(e), String::new()))?;
        let response = collect(link, t.command_timeout, |r| {
            has_success_token(r) || has_error_token(r)
        })
        .map_err(|e| (transport(e), String::new()))?;
        debug!("<ctrl-z> -> {}", escape_log(&response));

        if has_success_token(&response) {
            Ok((message_reference(&response), response))
        } else if let Some(line) = error_line(&response) {
            Err((
                RejectReason::ModuleError {
                    state: ExchangeState::TerminatorSent,
                    line,
                },
                response,
            ))
        } else {
            Err((RejectReason::Timeout, response))
        }
    }

    /// Write `command`, enter `state`, and read the answer until `done` or `window` expires.
    /// With `reject_on_error`, an error result code ends the exchange.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        link: &mut LinkHandle,
        trace: &mut Vec<ExchangeState>,
        state: ExchangeState,
        command: &AtCommand,
        window: Duration,
        done: fn(&str) -> bool,
        reject_on_error: bool,
    ) -> Result<String, (RejectReason, String)> {
        link.write(&command.encode())
            .map_err(|e| (transport(e), String::new()))?;
        trace.push(state);
        let response = collect(link, window, done).map_err(|e| (transport(e), String::new()))?;
        debug!("{} -> {}", command.label(), escape_log(&response));
        if reject_on_error {
            if let Some(line) = error_line(&response) {
                return Err((RejectReason::ModuleError { state, line }, response));
            }
        }
        Ok(response)
    }

    /// List unread messages stored on the module behind `port`.
    ///
    /// Unsolicited `+CMTI` notices that arrive while the port settles are parsed
    /// along with the listing.
    pub fn read_inbox(&self, port: &str) -> InboxOutcome {
        let mut link = match self.acquire(port) {
            Ok(link) => link,
            Err(LinkError::Unavailable { port, reason }) if self.simulate_when_absent => {
                debug!(
                    "[SIMULATION] No GSM module on {} ({}); no inbound messages",
                    port, reason
                );
                return InboxOutcome::Simulated;
            }
            Err(e) => return InboxOutcome::Failed(reason_from_link_error(e)),
        };
        let result = self.run_list(&mut link);
        link.close();
        match result {
            Ok(raw) => {
                let messages = parse_inbox(&raw);
                debug!("Inbox on {}: {} message(s)", port, messages.len());
                InboxOutcome::Read(messages)
            }
            Err(reason) => {
                warn!("Inbox read on {} failed: {}", port, reason);
                InboxOutcome::Failed(reason)
            }
        }
    }

    fn run_list(&self, link: &mut LinkHandle) -> Result<String, RejectReason> {
        let t = self.timing;
        let mut raw = collect(link, t.open_settle, |_| false).map_err(transport)?;
        let mut trace = Vec::new();
        let strip = |(reason, _): (RejectReason, String)| reason;

        self.step(link, &mut trace, ExchangeState::ModuleProbe, &AtCommand::Probe, t.step_settle, has_final_result, false)
            .map_err(strip)?;
        self.step(link, &mut trace, ExchangeState::TextModeSet, &AtCommand::TextMode, t.step_settle, has_final_result, true)
            .map_err(strip)?;

        let list = AtCommand::List {
            filter: LIST_UNREAD.to_string(),
        };
        link.write(&list.encode()).map_err(transport)?;
        let listing = collect(link, t.command_timeout, |r| closing_result(r).is_some()).map_err(transport)?;
        debug!("{} -> {}", list.label(), escape_log(&listing));
        match closing_result(&listing) {
            Some(code) if code.contains(commands::TOKEN_ERROR) => {
                return Err(RejectReason::ModuleError {
                    state: ExchangeState::TextModeSet,
                    line: code.to_string(),
                });
            }
            Some(_) => {}
            None => return Err(RejectReason::Timeout),
        }
        raw.push_str(&listing);
        Ok(raw)
    }

    /// Check that a module answers `AT` on `port`. Never simulated.
    ///
    /// Returns the raw answer when it carries a final result code.
    pub fn probe(&self, port: &str) -> Result<String, RejectReason> {
        let mut link = self.acquire(port).map_err(reason_from_link_error)?;
        let result = self.run_probe(&mut link);
        link.close();
        let answer = result.map_err(transport)?;
        if let Some(line) = error_line(&answer) {
            return Err(RejectReason::ModuleError {
                state: ExchangeState::ModuleProbe,
                line,
            });
        }
        if has_final_result(&answer) {
            Ok(answer)
        } else {
            Err(RejectReason::Timeout)
        }
    }

    fn run_probe(&self, link: &mut LinkHandle) -> Result<String, LinkError> {
        collect(link, self.timing.open_settle, |_| false)?;
        link.write(&AtCommand::Probe.encode())?;
        collect(link, self.timing.command_timeout, has_final_result)
    }

    /// Open the port, waiting out a busy port up to the command deadline.
    fn acquire(&self, port: &str) -> Result<LinkHandle, LinkError> {
        let deadline = Instant::now() + self.timing.command_timeout;
        loop {
            match self
                .opener
                .open(port, self.baud_rate, self.timing.command_timeout)
            {
                Err(LinkError::Busy(p)) if Instant::now() < deadline => {
                    debug!("Port {} busy, waiting", p);
                    thread::sleep(self.timing.busy_poll.max(Duration::from_millis(1)));
                }
                other => return other,
            }
        }
    }
}

/// Read until `done` says the answer is complete or `window` expires.
fn collect<F>(link: &mut LinkHandle, window: Duration, done: F) -> Result<String, LinkError>
where
    F: Fn(&str) -> bool,
{
    let deadline = Instant::now() + window;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = link.read_available(deadline)?;
        buf.extend_from_slice(&chunk);
        let text = String::from_utf8_lossy(&buf);
        if done(&text) || (chunk.is_empty() && Instant::now() >= deadline) {
            return Ok(text.into_owned());
        }
    }
}

fn transport(e: LinkError) -> RejectReason {
    RejectReason::Transport(e.to_string())
}

fn reason_from_link_error(e: LinkError) -> RejectReason {
    match e {
        LinkError::Unavailable { reason, .. } => RejectReason::HardwareAbsent(reason),
        LinkError::Busy(_) => RejectReason::LinkBusy,
        LinkError::Timeout(_) => RejectReason::Timeout,
        LinkError::Io(e) => RejectReason::Transport(e.to_string()),
    }
}
