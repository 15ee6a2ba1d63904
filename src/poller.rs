//! # Inbound Poller
//!
//! Once per period, reads the messages stored on every GSM module that serves a
//! known device and appends them to the exchange log as RECEIVED entries.
//!
//! A cycle groups devices by serial port, so a port shared by several devices is
//! read once. While a port is read its lock is held, so no outbound job talks
//! to that module at the same time. Each message
//! is routed to the device whose GSM number matches the sender, falling back to
//! the first device of the port. Failures on one port are logged and reported;
//! the cycle carries on with the next port.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatch::PortLocks;
use crate::logutil::{escape_log, mask_number};
use crate::metrics;
use crate::protocol::{AtProtocol, InboundMessage, InboxOutcome, RejectReason};
use crate::serial::PortMap;
use crate::storage::{DeviceId, ExchangeLogEntry, Storage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFailure {
    pub port: String,
    pub devices: Vec<DeviceId>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub ports_polled: usize,
    pub devices_polled: usize,
    /// Ports skipped because no module is attached and simulation is enabled
    pub simulated_ports: usize,
    /// (device, message content) for each entry appended, in order
    pub received: Vec<(DeviceId, String)>,
    pub failures: Vec<PortFailure>,
}

#[derive(Clone)]
pub struct InboundPoller {
    protocol: AtProtocol,
    storage: Storage,
    locks: PortLocks,
    ports: PortMap,
}

impl InboundPoller {
    pub fn new(protocol: AtProtocol, storage: Storage, locks: PortLocks, ports: PortMap) -> Self {
        Self {
            protocol,
            storage,
            locks,
            ports,
        }
    }

    /// Run one polling cycle over every known device.
    pub async fn poll_once(&self) -> PollReport {
        let devices: Vec<DeviceId> = self.storage.devices().await.iter().map(|d| d.id).collect();
        let mut report = PollReport::default();
        debug!("Inbound poll: {} device(s)", devices.len());

        for (port, mut group) in self.ports.group_by_port(&devices) {
            group.sort_unstable();
            report.ports_polled += 1;
            report.devices_polled += group.len();

            let guard = self.locks.acquire(&port).await;

            let protocol = self.protocol.clone();
            let target = port.clone();
            let outcome = match tokio::task::spawn_blocking(move || protocol.read_inbox(&target)).await {
                Ok(outcome) => outcome,
                Err(e) => InboxOutcome::Failed(RejectReason::Transport(format!("inbox task failed: {}", e))),
            };

            match outcome {
                InboxOutcome::Read(messages) => {
                    for message in messages {
                        if let Some(device) = self.route(&message, &group).await {
                            report.received.push((device, message.content));
                        }
                    }
                }
                InboxOutcome::Simulated => report.simulated_ports += 1,
                InboxOutcome::Failed(reason) => {
                    warn!("Inbound poll on {} failed: {}", port, reason);
                    metrics::inc_poll_failures();
                    report.failures.push(PortFailure {
                        port: port.clone(),
                        devices: group.clone(),
                        reason,
                    });
                }
            }
            drop(guard);
        }

        if !report.received.is_empty() {
            metrics::add_inbound(report.received.len() as u64);
            info!("Inbound poll: {} message(s) received", report.received.len());
        }
        report
    }

    async fn route(&self, message: &InboundMessage, group: &[DeviceId]) -> Option<DeviceId> {
        let fallback = *group.first()?;
        let matched = match &message.sender {
            Some(sender) => self.storage.device_by_phone(sender).await.map(|d| d.id),
            None => None,
        };
        let device = matched.unwrap_or(fallback);
        debug!(
            "Inbound from {} routed to device {}: {}",
            message.sender.as_deref().map(mask_number).unwrap_or_else(|| "-".to_string()),
            device,
            escape_log(&message.content)
        );

        let entry = ExchangeLogEntry::inbound(device, message.sender.as_deref(), &message.content);
        if let Err(e) = self.storage.append_entry(entry).await {
            error!("Cannot record inbound message for device {}: {}", device, e);
            return None;
        }
        if let Err(e) = self.storage.touch_last_contact(device, Utc::now()).await {
            error!("Last-contact update for device {} failed: {}", device, e);
        }
        Some(device)
    }

    /// Poll every `interval` until the returned handle is stopped. The first
    /// cycle runs right away.
    pub fn spawn(self, interval: Duration) -> PollerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            info!("Inbound poller started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let report = self.poll_once().await;
                        if !report.failures.is_empty() {
                            debug!("Inbound poll finished with {} failing port(s)", report.failures.len());
                        }
                    }
                }
            }
            debug!("Inbound poller stopped");
        });
        PollerHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

pub struct PollerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop after the current cycle, if any, completes.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}
