//! Process-wide counters for the GSM link.
//!
//! Plain atomics, read through [`snapshot`]. `canelink start` logs them on
//! shutdown.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static SMS_SENT: AtomicU64 = AtomicU64::new(0);
static SMS_SIMULATED: AtomicU64 = AtomicU64::new(0);
static SMS_FAILED_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static SMS_RETRIES: AtomicU64 = AtomicU64::new(0);
static JOBS_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
static JOBS_NOT_FOUND: AtomicU64 = AtomicU64::new(0);
static INBOUND_RECEIVED: AtomicU64 = AtomicU64::new(0);
static POLL_FAILURES: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_sms_sent() {
    SMS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_simulated() {
    SMS_SIMULATED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_failed_attempts() {
    SMS_FAILED_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries() {
    SMS_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_jobs_exhausted() {
    JOBS_EXHAUSTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_jobs_not_found() {
    JOBS_NOT_FOUND.fetch_add(1, Ordering::Relaxed);
}
pub fn add_inbound(count: u64) {
    INBOUND_RECEIVED.fetch_add(count, Ordering::Relaxed);
}
pub fn inc_poll_failures() {
    POLL_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_exchange_latency(started: Instant) {
    let ms = started.elapsed().as_millis() as u64;
    EXCHANGE_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    EXCHANGE_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub sms_sent: u64,
    pub sms_simulated: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub jobs_exhausted: u64,
    pub jobs_not_found: u64,
    pub inbound_received: u64,
    pub poll_failures: u64,
    pub exchange_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = EXCHANGE_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = EXCHANGE_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        sms_sent: SMS_SENT.load(Ordering::Relaxed),
        sms_simulated: SMS_SIMULATED.load(Ordering::Relaxed),
        failed_attempts: SMS_FAILED_ATTEMPTS.load(Ordering::Relaxed),
        retries: SMS_RETRIES.load(Ordering::Relaxed),
        jobs_exhausted: JOBS_EXHAUSTED.load(Ordering::Relaxed),
        jobs_not_found: JOBS_NOT_FOUND.load(Ordering::Relaxed),
        inbound_received: INBOUND_RECEIVED.load(Ordering::Relaxed),
        poll_failures: POLL_FAILURES.load(Ordering::Relaxed),
        exchange_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}
