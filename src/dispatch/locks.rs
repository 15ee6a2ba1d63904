//! Per-port execution locks.
//!
//! At most one exchange (outbound job or inbound poll) talks to a given GSM
//! module at a time. Locks are keyed by serial port path, so devices sharing a
//! module queue behind each other instead of racing for the port. The
//! dispatcher and the poller share one [`PortLocks`]; exchanges on different
//! ports proceed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

pub type PortGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, Default)]
pub struct PortLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PortLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, port: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(port.to_string()).or_default())
    }

    /// Wait until `port` is free and hold it until the guard drops.
    pub async fn acquire(&self, port: &str) -> PortGuard {
        self.slot(port).lock_owned().await
    }

    pub fn try_acquire(&self, port: &str) -> Option<PortGuard> {
        self.slot(port).try_lock_owned().ok()
    }
}
