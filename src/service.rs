//! Entry point for collaborators.
//!
//! [`CaneService`] combines the slot allocator, storage and dispatcher into the
//! flows the rest of the system needs: registering a contact (slot allocation,
//! `CONF:` command, dispatch), removing one, sending a raw command and retiring
//! a device. Logical faults (unknown device, duplicate contact, full memory)
//! are returned synchronously; delivery faults surface later on the job.
//!
//! [`LinkRuntime::from_config`] assembles the whole stack from a [`Config`].

use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::dispatch::{
    start_dispatcher, DispatchContext, DispatchError, DispatchHandle, DispatcherSettings, JobId,
    PortLocks,
};
use crate::poller::InboundPoller;
use crate::protocol::AtProtocol;
use crate::serial::LinkOpener;
use crate::slots::{ConfCommand, ContactRole, SlotAllocator, SlotAssignment, SlotError};
use crate::storage::{ContactId, Device, DeviceId, Storage, StorageError};

#[derive(Debug, Error)]
pub enum CaneError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a contact registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRegistration {
    pub device: DeviceId,
    pub contact: ContactId,
    pub index: u8,
    pub command: ConfCommand,
    pub job: JobId,
}

#[derive(Clone)]
pub struct CaneService {
    storage: Storage,
    slots: Arc<SlotAllocator>,
    dispatch: DispatchHandle,
}

impl CaneService {
    /// Build the service, restoring slot tables persisted in `storage`.
    pub async fn new(storage: Storage, dispatch: DispatchHandle) -> Self {
        let (slots, rejected) = SlotAllocator::from_snapshot(&storage.slot_tables().await);
        for (device, slot) in rejected {
            warn!(
                "Dropping inconsistent slot {} of device {} (contact {})",
                slot.index, device, slot.contact
            );
        }
        Self {
            storage,
            slots: Arc::new(slots),
            dispatch,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn dispatcher(&self) -> &DispatchHandle {
        &self.dispatch
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    pub async fn add_device(&self, id: DeviceId, phone: &str) -> Result<Device, CaneError> {
        let mut device = self.storage.device(id).await.unwrap_or_else(|| Device::new(id, phone));
        device.phone = phone.trim().to_string();
        self.storage.upsert_device(device.clone()).await?;
        Ok(device)
    }

    /// Give `contact` a slot on `device` and send the `CONF:` command storing it.
    ///
    /// The slot stays assigned whatever the delivery outcome; the returned job
    /// reports whether the cane received it.
    pub async fn register_contact(
        &self,
        device: DeviceId,
        contact: ContactId,
        role: ContactRole,
        phone: &str,
    ) -> Result<ContactRegistration, CaneError> {
        if self.storage.device(device).await.is_none() {
            return Err(CaneError::DeviceNotFound(device));
        }
        let index = self.slots.allocate(device, contact, phone)?;
        let command = ConfCommand {
            index,
            role,
            phone: phone.trim().to_string(),
        };
        let job = match self.dispatch.submit(device, &command.to_string()) {
            Ok(job) => job,
            Err(e) => {
                self.slots.release(device, index)?;
                return Err(e.into());
            }
        };
        self.persist_slots().await?;
        info!(
            "Contact {} registered on device {} at slot {} (job {})",
            contact, device, index, job
        );
        Ok(ContactRegistration {
            device,
            contact,
            index,
            command,
            job,
        })
    }

    /// Free the slot of `contact`, returning its index.
    pub async fn remove_contact(&self, device: DeviceId, contact: ContactId) -> Result<u8, CaneError> {
        let index = self
            .slots
            .release_contact(device, contact)
            .ok_or(SlotError::NotAssigned { device, contact })?;
        self.persist_slots().await?;
        info!("Contact {} removed from device {}, slot {} free", contact, device, index);
        Ok(index)
    }

    /// Queue a raw command for `device`.
    pub fn send_command(&self, device: DeviceId, payload: &str) -> Result<JobId, CaneError> {
        Ok(self.dispatch.submit(device, payload)?)
    }

    pub fn contacts(&self, device: DeviceId) -> Vec<SlotAssignment> {
        self.slots.occupied(device)
    }

    /// Forget `device`: cancel its pending jobs, free its slots, delete the record.
    pub async fn remove_device(&self, device: DeviceId) -> Result<Vec<JobId>, CaneError> {
        let cancelled = self.dispatch.cancel_device(device).await?;
        let freed = self.slots.clear_device(device);
        self.persist_slots().await?;
        let removed = self.storage.remove_device(device).await?;
        if removed.is_none() {
            return Err(CaneError::DeviceNotFound(device));
        }
        info!(
            "Device {} removed ({} job(s) cancelled, {} slot(s) freed)",
            device,
            cancelled.len(),
            freed
        );
        Ok(cancelled)
    }

    async fn persist_slots(&self) -> Result<(), CaneError> {
        self.storage.save_slot_tables(self.slots.snapshot()).await?;
        Ok(())
    }
}

/// The assembled link: service facade plus the inbound poller.
pub struct LinkRuntime {
    pub service: CaneService,
    pub poller: InboundPoller,
    pub locks: PortLocks,
}

impl LinkRuntime {
    /// Open storage and start the dispatcher for `config`. The poller is built but
    /// not started.
    pub async fn from_config(config: &Config, opener: Arc<dyn LinkOpener>) -> Result<Self, CaneError> {
        let storage = Storage::open(&config.storage.data_dir, config.storage.log_cache_limit).await?;
        Ok(Self::with_storage(config, opener, storage).await)
    }

    pub async fn with_storage(config: &Config, opener: Arc<dyn LinkOpener>, storage: Storage) -> Self {
        let protocol = AtProtocol::new(
            opener,
            config.gsm.baud_rate,
            config.gsm.timing(),
            config.gsm.simulate_when_absent,
        );
        if config.gsm.simulate_when_absent {
            info!("Simulation fallback enabled: a missing GSM module reports simulated deliveries");
        }
        let locks = PortLocks::new();
        let ports = config.gsm.port_map();
        let ctx = DispatchContext {
            protocol: protocol.clone(),
            storage: storage.clone(),
            locks: locks.clone(),
            ports: ports.clone(),
            policy: config.dispatch.retry_policy(),
        };
        let dispatch = start_dispatcher(ctx, DispatcherSettings::from(&config.dispatch));
        let service = CaneService::new(storage.clone(), dispatch).await;
        let poller = InboundPoller::new(protocol, storage, locks.clone(), ports);
        Self {
            service,
            poller,
            locks,
        }
    }
}
