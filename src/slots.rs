//! Contact slot allocation.
//!
//! The cane stores up to [`SLOT_CAPACITY`] emergency contacts, addressed by
//! index 1..=5. [`SlotAllocator`] mirrors that memory per device: a new contact
//! takes the lowest free index, keeps it until released, and a freed index is
//! handed out again on the next allocation.
//!
//! The index travels to the cane inside a `CONF:<index>:<role>:<number>` SMS
//! ([`ConfCommand`]).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::storage::{normalize_number, ContactId, DeviceId};

pub const SLOT_CAPACITY: u8 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("contact memory of device {device} is full ({capacity} max)", capacity = SLOT_CAPACITY)]
    SlotTableFull { device: DeviceId },

    #[error("contact already registered on device {device} at slot {index}")]
    DuplicateContact { device: DeviceId, index: u8 },

    #[error("contact {contact} has no slot on device {device}")]
    NotAssigned { device: DeviceId, contact: ContactId },

    #[error("slot index {0} outside 1..={max}", max = SLOT_CAPACITY)]
    InvalidSlot(u8),
}

/// One occupied slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub index: u8,
    pub contact: ContactId,
    pub phone: String,
}

/// Occupied slots of every device, in index order. Persisted by storage.
pub type SlotSnapshot = BTreeMap<DeviceId, Vec<SlotAssignment>>;

#[derive(Debug, Clone)]
struct Holder {
    contact: ContactId,
    phone: String,
}

type Table = [Option<Holder>; SLOT_CAPACITY as usize];

#[derive(Debug, Default)]
pub struct SlotAllocator {
    tables: RwLock<HashMap<DeviceId, Table>>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild tables from a persisted snapshot. Entries with an invalid index,
    /// or colliding with an earlier entry, are skipped and returned.
    pub fn from_snapshot(snapshot: &SlotSnapshot) -> (Self, Vec<(DeviceId, SlotAssignment)>) {
        let allocator = Self::new();
        let rejected = allocator.restore(snapshot);
        (allocator, rejected)
    }

    /// Give `contact` the lowest free slot of `device`.
    pub fn allocate(&self, device: DeviceId, contact: ContactId, phone: &str) -> Result<u8, SlotError> {
        let wanted = normalize_number(phone);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(device).or_default();

        if let Some(pos) = table.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|h| h.contact == contact || normalize_number(&h.phone) == wanted)
        }) {
            return Err(SlotError::DuplicateContact {
                device,
                index: pos as u8 + 1,
            });
        }

        let free = table
            .iter()
            .position(Option::is_none)
            .ok_or(SlotError::SlotTableFull { device })?;
        table[free] = Some(Holder {
            contact,
            phone: phone.trim().to_string(),
        });
        Ok(free as u8 + 1)
    }

    /// Free slot `index` of `device`. Releasing a free slot is a no-op.
    pub fn release(&self, device: DeviceId, index: u8) -> Result<(), SlotError> {
        let pos = slot_position(index)?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = tables.get_mut(&device) {
            table[pos] = None;
        }
        Ok(())
    }

    /// Free whatever slot `contact` holds on `device`.
    pub fn release_contact(&self, device: DeviceId, contact: ContactId) -> Option<u8> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let table = tables.get_mut(&device)?;
        let pos = table
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|h| h.contact == contact))?;
        table[pos] = None;
        Some(pos as u8 + 1)
    }

    pub fn lookup(&self, device: DeviceId, contact: ContactId) -> Result<u8, SlotError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(&device)
            .and_then(|table| {
                table
                    .iter()
                    .position(|slot| slot.as_ref().is_some_and(|h| h.contact == contact))
            })
            .map(|pos| pos as u8 + 1)
            .ok_or(SlotError::NotAssigned { device, contact })
    }

    pub fn occupied(&self, device: DeviceId) -> Vec<SlotAssignment> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(&device).map(assignments).unwrap_or_default()
    }

    /// Forget every slot of `device`.
    pub fn clear_device(&self, device: DeviceId) -> usize {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .remove(&device)
            .map(|table| table.iter().flatten().count())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .iter()
            .map(|(device, table)| (*device, assignments(table)))
            .filter(|(_, slots)| !slots.is_empty())
            .collect()
    }

    /// Replace all tables with `snapshot`, returning the entries that could not be placed.
    pub fn restore(&self, snapshot: &SlotSnapshot) -> Vec<(DeviceId, SlotAssignment)> {
        let mut rejected = Vec::new();
        let mut rebuilt: HashMap<DeviceId, Table> = HashMap::new();
        for (device, slots) in snapshot {
            let table = rebuilt.entry(*device).or_default();
            for slot in slots {
                let placed = match slot_position(slot.index) {
                    Ok(pos) if table[pos].is_none() => {
                        let duplicate = table.iter().flatten().any(|h| {
                            h.contact == slot.contact
                                || normalize_number(&h.phone) == normalize_number(&slot.phone)
                        });
                        if !duplicate {
                            table[pos] = Some(Holder {
                                contact: slot.contact,
                                phone: slot.phone.clone(),
                            });
                        }
                        !duplicate
                    }
                    _ => false,
                };
                if !placed {
                    rejected.push((*device, slot.clone()));
                }
            }
        }
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = rebuilt;
        rejected
    }
}

fn slot_position(index: u8) -> Result<usize, SlotError> {
    if (1..=SLOT_CAPACITY).contains(&index) {
        Ok(index as usize - 1)
    } else {
        Err(SlotError::InvalidSlot(index))
    }
}

fn assignments(table: &Table) -> Vec<SlotAssignment> {
    table
        .iter()
        .enumerate()
        .filter_map(|(pos, slot)| {
            slot.as_ref().map(|h| SlotAssignment {
                index: pos as u8 + 1,
                contact: h.contact,
                phone: h.phone.clone(),
            })
        })
        .collect()
}

/// Contact role, as spelled by the cane firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactRole {
    #[default]
    Famille,
    Ami,
    Soignant,
    Urgence,
    Autre,
}

impl ContactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactRole::Famille => "FAMILLE",
            ContactRole::Ami => "AMI",
            ContactRole::Soignant => "SOIGNANT",
            ContactRole::Urgence => "URGENCE",
            ContactRole::Autre => "AUTRE",
        }
    }
}

impl fmt::Display for ContactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed CONF command: {0}")]
pub struct ConfParseError(pub String);

impl FromStr for ContactRole {
    type Err = ConfParseError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FAMILLE" => Ok(ContactRole::Famille),
            "AMI" => Ok(ContactRole::Ami),
            "SOIGNANT" => Ok(ContactRole::Soignant),
            "URGENCE" => Ok(ContactRole::Urgence),
            "AUTRE" => Ok(ContactRole::Autre),
            other => Err(ConfParseError(format!("unknown role {}", other))),
        }
    }
}

/// `CONF:<slotIndex>:<role>:<phoneNumber>`, tells the cane to store a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfCommand {
    pub index: u8,
    pub role: ContactRole,
    pub phone: String,
}

impl fmt::Display for ConfCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CONF:{}:{}:{}", self.index, self.role, self.phone)
    }
}

impl FromStr for ConfCommand {
    type Err = ConfParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(4, ':');
        if parts.next() != Some("CONF") {
            return Err(ConfParseError(s.to_string()));
        }
        let index: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .filter(|i| (1..=SLOT_CAPACITY).contains(i))
            .ok_or_else(|| ConfParseError(s.to_string()))?;
        let role = parts
            .next()
            .ok_or_else(|| ConfParseError(s.to_string()))?
            .parse()?;
        let phone = parts
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfParseError(s.to_string()))?;
        Ok(ConfCommand {
            index,
            role,
            phone: phone.to_string(),
        })
    }
}
