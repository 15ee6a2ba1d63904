//! # Storage Module - Device Records and Exchange Log
//!
//! Persistence for what the GSM link reads and writes on behalf of its
//! collaborators:
//!
//! - [`Device`] records (GSM number, communication status, last contact)
//! - the append-only [`ExchangeLogEntry`] journal of every outbound command and
//!   inbound message
//! - the per-device slot tables of the contact allocator
//!
//! ## Layout
//!
//! ```text
//! data/
//! ├── devices.json        ← device records, rewritten atomically
//! ├── slots.json          ← slot table snapshot, rewritten atomically
//! └── exchange_log.jsonl  ← one JSON line per entry revision, appended
//! ```
//!
//! Every file write takes an exclusive `fs2` lock; snapshots go through a temp
//! file and a rename so readers never see a torn file. A log entry that changes
//! status (PENDING -> SENT/ERROR) is appended again with the same id; on load
//! the last revision wins. The in-memory log cache is bounded, but PENDING
//! entries are never evicted: they stay until their transition is recorded.
//!
//! [`Storage::in_memory`] keeps everything in process memory, for tests and dry
//! runs.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::slots::SlotSnapshot;

pub type DeviceId = u64;
pub type ContactId = u64;

const DEVICES_FILE: &str = "devices.json";
const SLOTS_FILE: &str = "slots.json";
const LOG_FILE: &str = "exchange_log.jsonl";
const DEFAULT_LOG_CACHE: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown exchange log entry {0}")]
    UnknownEntry(Uuid),

    #[error("exchange log entry {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: LogStatus,
        to: LogStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// GSM number of the module inside the cane
    pub phone: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: DeviceId, phone: &str) -> Self {
        Self {
            id,
            phone: phone.trim().to_string(),
            status: DeviceStatus::Active,
            last_contact: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Pending,
    Sent,
    Received,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeLogEntry {
    pub id: Uuid,
    pub device: DeviceId,
    pub direction: Direction,
    pub content: String,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sender number of an inbound message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub simulated: bool,
    #[serde(default)]
    pub attempts: u32,
    /// Dispatch job that produced an outbound entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Uuid>,
}

impl ExchangeLogEntry {
    pub fn outbound(device: DeviceId, content: &str, job: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            direction: Direction::Outbound,
            content: content.to_string(),
            status: LogStatus::Pending,
            timestamp: Utc::now(),
            error: None,
            sender: None,
            simulated: false,
            attempts: 0,
            job,
        }
    }

    pub fn inbound(device: DeviceId, sender: Option<&str>, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            direction: Direction::Inbound,
            content: content.to_string(),
            status: LogStatus::Received,
            timestamp: Utc::now(),
            error: None,
            sender: sender.map(|s| s.to_string()),
            simulated: false,
            attempts: 0,
            job: None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<DeviceId, Device>,
    log: VecDeque<ExchangeLogEntry>,
    slots: SlotSnapshot,
}

/// Shared storage handle; clones see the same data.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<Mutex<Inner>>,
    data_dir: Option<PathBuf>,
    log_cache_limit: usize,
}

impl Storage {
    /// Volatile storage, nothing touches the disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            data_dir: None,
            log_cache_limit: DEFAULT_LOG_CACHE,
        }
    }

    /// Open (creating if needed) the data directory and load existing records.
    pub async fn open(data_dir: &str, log_cache_limit: Option<usize>) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let dir = PathBuf::from(data_dir);
        let limit = log_cache_limit.unwrap_or(DEFAULT_LOG_CACHE).max(1);

        let devices: Vec<Device> = read_json(&dir.join(DEVICES_FILE))
            .await?
            .unwrap_or_default();
        let slots: SlotSnapshot = read_json(&dir.join(SLOTS_FILE)).await?.unwrap_or_default();
        let log = load_log(&dir.join(LOG_FILE), limit).await?;
        debug!(
            "Storage opened at {}: {} device(s), {} log entr(ies) cached",
            data_dir,
            devices.len(),
            log.len()
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                devices: devices.into_iter().map(|d| (d.id, d)).collect(),
                log,
                slots,
            })),
            data_dir: Some(dir),
            log_cache_limit: limit,
        })
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    pub async fn device(&self, id: DeviceId) -> Option<Device> {
        self.inner.lock().await.devices.get(&id).cloned()
    }

    /// Device whose GSM number is `phone` (spaces ignored).
    pub async fn device_by_phone(&self, phone: &str) -> Option<Device> {
        let wanted = normalize_number(phone);
        self.inner
            .lock()
            .await
            .devices
            .values()
            .find(|d| normalize_number(&d.phone) == wanted)
            .cloned()
    }

    pub async fn upsert_device(&self, device: Device) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.devices.insert(device.id, device);
        self.persist_devices(&inner)
    }

    pub async fn remove_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.devices.remove(&id);
        if removed.is_some() {
            self.persist_devices(&inner)?;
        }
        Ok(removed)
    }

    /// Record a successful exchange with `id`. Returns false for unknown devices.
    pub async fn touch_last_contact(&self, id: DeviceId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(&id) {
            Some(device) => device.last_contact = Some(at),
            None => return Ok(false),
        }
        self.persist_devices(&inner)?;
        Ok(true)
    }

    pub async fn append_entry(&self, entry: ExchangeLogEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        self.append_log_line(&entry)?;
        inner.log.push_back(entry);
        evict_settled(&mut inner.log, self.log_cache_limit);
        Ok(())
    }

    /// PENDING -> SENT.
    pub async fn mark_sent(&self, id: Uuid, attempts: u32, simulated: bool) -> Result<ExchangeLogEntry, StorageError> {
        self.transition(id, LogStatus::Sent, |e| {
            e.attempts = attempts;
            e.simulated = simulated;
            e.error = None;
        })
        .await
    }

    /// PENDING -> ERROR.
    pub async fn mark_error(&self, id: Uuid, attempts: u32, detail: &str) -> Result<ExchangeLogEntry, StorageError> {
        self.transition(id, LogStatus::Error, |e| {
            e.attempts = attempts;
            e.error = Some(detail.to_string());
        })
        .await
    }

    async fn transition<F>(&self, id: Uuid, to: LogStatus, apply: F) -> Result<ExchangeLogEntry, StorageError>
    where
        F: FnOnce(&mut ExchangeLogEntry),
    {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .log
            .iter_mut()
            .rev()
            .find(|e| e.id == id)
            .ok_or(StorageError::UnknownEntry(id))?;
        if entry.status != LogStatus::Pending {
            return Err(StorageError::InvalidTransition {
                id,
                from: entry.status,
                to,
            });
        }
        let mut updated = entry.clone();
        updated.status = to;
        apply(&mut updated);
        self.append_log_line(&updated)?;
        *entry = updated.clone();
        evict_settled(&mut inner.log, self.log_cache_limit);
        Ok(updated)
    }

    pub async fn entry(&self, id: Uuid) -> Option<ExchangeLogEntry> {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .rev()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Cached entries for `device`, oldest first.
    pub async fn entries_for(&self, device: DeviceId) -> Vec<ExchangeLogEntry> {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .filter(|e| e.device == device)
            .cloned()
            .collect()
    }

    /// Most recent cached entries across all devices, newest first.
    pub async fn recent_entries(&self, limit: usize) -> Vec<ExchangeLogEntry> {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn slot_tables(&self) -> SlotSnapshot {
        self.inner.lock().await.slots.clone()
    }

    pub async fn save_slot_tables(&self, snapshot: SlotSnapshot) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.slots = snapshot;
        if let Some(dir) = &self.data_dir {
            let data = serde_json::to_string_pretty(&inner.slots)?;
            write_file_locked(&dir.join(SLOTS_FILE), &data)?;
        }
        Ok(())
    }

    fn persist_devices(&self, inner: &Inner) -> Result<(), StorageError> {
        if let Some(dir) = &self.data_dir {
            let list: Vec<&Device> = inner.devices.values().collect();
            let data = serde_json::to_string_pretty(&list)?;
            write_file_locked(&dir.join(DEVICES_FILE), &data)?;
        }
        Ok(())
    }

    fn append_log_line(&self, entry: &ExchangeLogEntry) -> Result<(), StorageError> {
        if let Some(dir) = &self.data_dir {
            let line = serde_json::to_string(entry)? + "\n";
            append_file_locked(&dir.join(LOG_FILE), &line)?;
        }
        Ok(())
    }
}

/// Strip formatting so `+237 699 99 99 99` matches `+237699999999`.
pub fn normalize_number(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => {
            let cleaned = data.trim_start_matches('\0');
            if cleaned.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(serde_json::from_str(cleaned)?))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn load_log(path: &Path, limit: usize) -> Result<VecDeque<ExchangeLogEntry>, StorageError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e.into()),
    };
    let mut order: Vec<Uuid> = Vec::new();
    let mut latest: HashMap<Uuid, ExchangeLogEntry> = HashMap::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExchangeLogEntry>(line) {
            Ok(entry) => {
                if !latest.contains_key(&entry.id) {
                    order.push(entry.id);
                }
                latest.insert(entry.id, entry);
            }
            Err(e) => warn!("Skipping malformed exchange log line {}: {}", n + 1, e),
        }
    }
    let mut log: VecDeque<ExchangeLogEntry> = order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect();
    evict_settled(&mut log, limit);
    Ok(log)
}

/// Drop the oldest non-PENDING entries until `log` fits `limit`.
fn evict_settled(log: &mut VecDeque<ExchangeLogEntry>, limit: usize) {
    let mut excess = log.len().saturating_sub(limit);
    if excess == 0 {
        return;
    }
    log.retain(|e| {
        if excess > 0 && e.status != LogStatus::Pending {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Replace `path` with `content` under an exclusive lock, via temp file and rename.
fn write_file_locked(path: &Path, content: &str) -> Result<(), StorageError> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("data.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    };
    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}

/// Append one line to `path` under an exclusive lock.
fn append_file_locked(path: &Path, content: &str) -> Result<(), StorageError> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    let _ = file.sync_data();
    drop(file);
    Ok(())
}
