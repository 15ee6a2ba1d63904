mod common;

use std::sync::Arc;

use canelink::dispatch::{JobOutcome, JobState};
use canelink::serial::mock::MockModem;
use canelink::service::{CaneError, LinkRuntime};
use canelink::slots::{ConfCommand, ContactRole, SlotError};
use canelink::storage::{LogStatus, Storage};
use common::{test_config, PORT};

async fn runtime(modem: &MockModem, dir: &str) -> LinkRuntime {
    let config = test_config(dir);
    let storage = Storage::open(dir, None).await.expect("open storage");
    LinkRuntime::with_storage(&config, Arc::new(modem.clone()), storage).await
}

#[tokio::test]
async fn contact_registration_sends_conf_and_reuses_freed_slots() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_str().unwrap();
    let modem = MockModem::new();
    let rt = runtime(&modem, dir).await;
    let svc = &rt.service;
    svc.add_device(1, "+237699999999").await.unwrap();

    let mut jobs = Vec::new();
    for (contact, phone) in [
        (10, "+237600000001"),
        (11, "+237600000002"),
        (12, "+237600000003"),
        (13, "+237600000004"),
        (14, "+237600000005"),
    ] {
        let reg = svc
            .register_contact(1, contact, ContactRole::Famille, phone)
            .await
            .unwrap();
        assert_eq!(reg.index as u64, contact - 9);
        jobs.push(reg.job);
    }

    let sixth = svc
        .register_contact(1, 15, ContactRole::Ami, "+237600000006")
        .await;
    assert!(matches!(sixth, Err(CaneError::Slot(SlotError::SlotTableFull { device: 1 }))));

    assert_eq!(svc.remove_contact(1, 12).await.unwrap(), 3);
    let reg = svc
        .register_contact(1, 15, ContactRole::Urgence, "+237600000006")
        .await
        .unwrap();
    assert_eq!(reg.index, 3);
    assert_eq!(reg.command.to_string(), "CONF:3:URGENCE:+237600000006");
    jobs.push(reg.job);

    for job in jobs {
        let done = svc.dispatcher().wait(job).await.unwrap();
        assert_eq!(done.outcome(), Some(JobOutcome::Success { simulated: false }));
        assert!(done.payload.parse::<ConfCommand>().is_ok());
    }
    assert!(modem.written_text(PORT).contains("CONF:3:URGENCE:+237600000006"));
    svc.dispatcher().shutdown().await;
}

#[tokio::test]
async fn duplicate_and_unknown_registrations_are_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    let rt = runtime(&modem, tmp.path().to_str().unwrap()).await;
    let svc = &rt.service;

    assert!(matches!(
        svc.register_contact(9, 1, ContactRole::Ami, "+237600000001").await,
        Err(CaneError::DeviceNotFound(9))
    ));

    svc.add_device(1, "+237699999999").await.unwrap();
    let first = svc
        .register_contact(1, 1, ContactRole::Ami, "+237600000001")
        .await
        .unwrap();
    assert!(matches!(
        svc.register_contact(1, 2, ContactRole::Ami, "+237 600 000 001").await,
        Err(CaneError::Slot(SlotError::DuplicateContact { device: 1, index: 1 }))
    ));
    assert!(matches!(
        svc.remove_contact(1, 99).await,
        Err(CaneError::Slot(SlotError::NotAssigned { device: 1, contact: 99 }))
    ));
    svc.dispatcher().wait(first.job).await.unwrap();
    assert_eq!(svc.contacts(1).len(), 1);
}

#[tokio::test]
async fn state_survives_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_str().unwrap();
    let modem = MockModem::new();

    {
        let rt = runtime(&modem, dir).await;
        rt.service.add_device(1, "+237699999999").await.unwrap();
        let reg = rt
            .service
            .register_contact(1, 10, ContactRole::Soignant, "+237600000001")
            .await
            .unwrap();
        rt.service.dispatcher().wait(reg.job).await.unwrap();
        let raw = rt.service.send_command(1, "STATUS?").unwrap();
        rt.service.dispatcher().wait(raw).await.unwrap();
        rt.service.dispatcher().shutdown().await;
    }

    let rt = runtime(&modem, dir).await;
    let device = rt.service.storage().device(1).await.unwrap();
    assert_eq!(device.phone, "+237699999999");
    assert!(device.last_contact.is_some());

    let contacts = rt.service.contacts(1);
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].index, 1);
    assert_eq!(contacts[0].contact, 10);

    let entries = rt.service.storage().entries_for(1).await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == LogStatus::Sent));
    assert_eq!(entries[1].content, "STATUS?");

    // The restored table keeps index 1 taken.
    let next = rt
        .service
        .register_contact(1, 11, ContactRole::Autre, "+237600000002")
        .await
        .unwrap();
    assert_eq!(next.index, 2);
    rt.service.dispatcher().wait(next.job).await.unwrap();
}

#[tokio::test]
async fn removing_a_device_cancels_its_jobs_and_frees_slots() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_str().unwrap();
    let modem = MockModem::new();
    let mut config = test_config(dir);
    config.dispatch.workers = Some(1);
    let storage = Storage::open(dir, None).await.unwrap();
    let rt = LinkRuntime::with_storage(&config, Arc::new(modem.clone()), storage).await;
    rt.service.add_device(1, "+237699999999").await.unwrap();

    // The single worker blocks on the held port lock, so the second job stays queued.
    let held = rt.locks.acquire(PORT).await;
    let reg = rt
        .service
        .register_contact(1, 10, ContactRole::Famille, "+237600000001")
        .await
        .unwrap();
    let queued = rt.service.send_command(1, "PING").unwrap();
    for _ in 0..200 {
        let running = rt.service.dispatcher().job(reg.job).await.unwrap().map(|j| j.state);
        if running == Some(JobState::Running) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let cancelled = rt.service.remove_device(1).await.unwrap();
    drop(held);

    assert_eq!(cancelled, vec![queued]);
    assert_eq!(
        rt.service.dispatcher().wait(queued).await.unwrap().outcome(),
        Some(JobOutcome::Cancelled)
    );
    rt.service.dispatcher().wait(reg.job).await.unwrap();
    assert!(rt.service.contacts(1).is_empty());
    assert!(rt.service.storage().device(1).await.is_none());
    assert!(rt.service.storage().slot_tables().await.get(&1).is_none());
    assert!(matches!(
        rt.service.remove_device(1).await,
        Err(CaneError::DeviceNotFound(1))
    ));
}
