//! One attempt of one job.
//!
//! Runs on a worker task holding a pool permit: resolves the device, opens the
//! exchange log entry on the first attempt, takes the lock of the device's port,
//! runs the protocol on a blocking thread and writes terminal outcomes back to
//! storage. Whether to retry is decided here; when to retry is up to the
//! scheduler. A port held by another process past the deadline defers the job
//! without spending an attempt.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{DispatchContext, JobId, JobOutcome};
use crate::logutil::{escape_log, mask_number};
use crate::metrics;
use crate::protocol::{ExchangeOutcome, RejectReason};
use crate::storage::{DeviceId, ExchangeLogEntry};

#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub id: JobId,
    pub device: DeviceId,
    pub payload: String,
    /// 1-based number of this attempt
    pub number: u32,
    pub log_entry: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub(crate) enum Verdict {
    Finished(JobOutcome),
    Retry,
    /// The port was busy; try again later without counting an attempt
    Deferred,
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptResult {
    /// False when the job ended before reaching the modem
    pub attempted: bool,
    pub log_entry: Option<Uuid>,
    pub error: Option<String>,
    pub verdict: Verdict,
}

pub(crate) async fn run_attempt(ctx: Arc<DispatchContext>, attempt: Attempt) -> AttemptResult {
    let Attempt {
        id,
        device: device_id,
        payload,
        number,
        mut log_entry,
    } = attempt;

    let Some(device) = ctx.storage.device(device_id).await else {
        warn!("Job {}: device {} not found", id, device_id);
        metrics::inc_jobs_not_found();
        let detail = format!("device {} not found", device_id);
        if let Some(entry) = log_entry {
            record(ctx.storage.mark_error(entry, number - 1, &detail).await, id);
        }
        return AttemptResult {
            attempted: false,
            log_entry,
            error: Some(detail),
            verdict: Verdict::Finished(JobOutcome::NotFound),
        };
    };

    if log_entry.is_none() {
        let entry = ExchangeLogEntry::outbound(device_id, &payload, Some(id.0));
        let entry_id = entry.id;
        match ctx.storage.append_entry(entry).await {
            Ok(()) => log_entry = Some(entry_id),
            Err(e) => error!("Job {}: cannot open exchange log entry: {}", id, e),
        }
    }

    let port = ctx.ports.port_for(device_id).to_string();
    let _guard = ctx.locks.acquire(&port).await;
    info!(
        "Job {}: attempt {}/{} to device {} ({}) via {}",
        id,
        number,
        ctx.policy.max_attempts,
        device_id,
        mask_number(&device.phone),
        port
    );
    debug!("Job {} payload: {}", id, escape_log(&payload));

    let protocol = ctx.protocol.clone();
    let phone = device.phone.clone();
    let body = payload.clone();
    let started = Instant::now();
    let outcome = match tokio::task::spawn_blocking(move || protocol.send_sms(&port, &phone, &body)).await {
        Ok(report) => report.outcome,
        Err(e) => ExchangeOutcome::Rejected(RejectReason::Transport(format!("exchange task failed: {}", e))),
    };
    metrics::observe_exchange_latency(started);

    match outcome {
        ExchangeOutcome::Confirmed { .. } | ExchangeOutcome::Simulated => {
            let simulated = outcome.is_simulated();
            if simulated {
                metrics::inc_sms_simulated();
            } else {
                metrics::inc_sms_sent();
            }
            match ctx.storage.touch_last_contact(device_id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => debug!("Job {}: device {} vanished before last-contact update", id, device_id),
                Err(e) => error!("Job {}: last-contact update failed: {}", id, e),
            }
            if let Some(entry) = log_entry {
                record(ctx.storage.mark_sent(entry, number, simulated).await, id);
            }
            info!(
                "Job {}: delivered to device {} after {} attempt(s){}",
                id,
                device_id,
                number,
                if simulated { " [SIMULATION]" } else { "" }
            );
            AttemptResult {
                attempted: true,
                log_entry,
                error: None,
                verdict: Verdict::Finished(JobOutcome::Success { simulated }),
            }
        }
        ExchangeOutcome::Rejected(RejectReason::LinkBusy) => {
            warn!("Job {}: port busy, deferring attempt {}", id, number);
            AttemptResult {
                attempted: false,
                log_entry,
                error: Some(RejectReason::LinkBusy.to_string()),
                verdict: Verdict::Deferred,
            }
        }
        ExchangeOutcome::Rejected(reason) => {
            metrics::inc_failed_attempts();
            let detail = reason.to_string();
            if ctx.policy.allows_retry(number) {
                warn!("Job {}: attempt {} failed: {}", id, number, detail);
                return AttemptResult {
                    attempted: true,
                    log_entry,
                    error: Some(detail),
                    verdict: Verdict::Retry,
                };
            }
            let final_outcome = match reason {
                RejectReason::HardwareAbsent(_) => JobOutcome::HardwareError,
                _ => JobOutcome::Exhausted,
            };
            metrics::inc_jobs_exhausted();
            error!(
                "Job {}: giving up on device {} after {} attempt(s): {}",
                id, device_id, number, detail
            );
            if let Some(entry) = log_entry {
                record(ctx.storage.mark_error(entry, number, &detail).await, id);
            }
            AttemptResult {
                attempted: true,
                log_entry,
                error: Some(detail),
                verdict: Verdict::Finished(final_outcome),
            }
        }
    }
}

fn record<T, E: std::fmt::Display>(result: Result<T, E>, id: JobId) {
    if let Err(e) = result {
        error!("Job {}: exchange log update failed: {}", id, e);
    }
}
