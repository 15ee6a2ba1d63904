mod common;

use canelink::dispatch::{JobOutcome, JobState};
use canelink::serial::mock::{MockModem, TerminatorReply};
use canelink::storage::LogStatus;
use common::{add_device, rig, PORT};

#[tokio::test]
async fn confirmed_delivery_updates_log_and_last_contact() {
    let modem = MockModem::new();
    let r = rig(&modem, true, 2);
    add_device(&r.storage, 1, "+237699999999").await;

    let id = r.dispatch.submit(1, "CONF:1:FAMILLE:+237600000000").unwrap();
    let job = r.dispatch.wait(id).await.unwrap();

    assert_eq!(job.state, JobState::Finished(JobOutcome::Success { simulated: false }));
    assert_eq!(job.attempts, 1);
    assert!(job.finished_at.is_some());
    let entry = r.storage.entry(job.log_entry.unwrap()).await.unwrap();
    assert_eq!(entry.status, LogStatus::Sent);
    assert_eq!(entry.attempts, 1);
    assert!(!entry.simulated);
    assert_eq!(entry.content, "CONF:1:FAMILLE:+237600000000");
    assert!(r.storage.device(1).await.unwrap().last_contact.is_some());
    assert!(modem
        .written_text(PORT)
        .contains("AT+CMGS=\"+237699999999\"\rCONF:1:FAMILLE:+237600000000"));
}

#[tokio::test]
async fn silent_module_exhausts_all_attempts() {
    let modem = MockModem::silent();
    let r = rig(&modem, true, 2);
    add_device(&r.storage, 1, "+237699999999").await;

    let id = r.dispatch.submit(1, "PING").unwrap();
    let job = r.dispatch.wait(id).await.unwrap();

    assert_eq!(job.outcome(), Some(JobOutcome::Exhausted));
    assert_eq!(job.attempts, 3);
    assert_eq!(modem.terminators_sent(PORT), 3);
    let entry = r.storage.entry(job.log_entry.unwrap()).await.unwrap();
    assert_eq!(entry.status, LogStatus::Error);
    assert_eq!(entry.attempts, 3);
    assert!(entry.error.is_some());
    assert!(r.storage.device(1).await.unwrap().last_contact.is_none());

    let stats = r.dispatch.snapshot().await.unwrap();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.retries, 2);
}

#[tokio::test]
async fn recovers_after_module_error_and_silence() {
    let modem = MockModem::new();
    modem.queue_reply(TerminatorReply::Failed("+CMS ERROR: 500".into()));
    modem.queue_reply(TerminatorReply::Silent);
    let r = rig(&modem, true, 1);
    add_device(&r.storage, 1, "+237699999999").await;

    let job = r.dispatch.wait(r.dispatch.submit(1, "PING").unwrap()).await.unwrap();
    assert!(job.outcome().unwrap().is_success());
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error, None);
}

#[tokio::test]
async fn unknown_device_is_not_found_without_attempts() {
    let modem = MockModem::new();
    let r = rig(&modem, true, 2);

    let id = r.dispatch.submit(42, "PING").unwrap();
    let job = r.dispatch.wait(id).await.unwrap();

    assert_eq!(job.outcome(), Some(JobOutcome::NotFound));
    assert_eq!(job.attempts, 0);
    assert_eq!(job.log_entry, None);
    assert!(r.storage.entries_for(42).await.is_empty());
    assert_eq!(modem.open_count(), 0);
}

#[tokio::test]
async fn missing_module_is_simulated_when_enabled() {
    let modem = MockModem::absent();
    let r = rig(&modem, true, 2);
    add_device(&r.storage, 1, "+237699999999").await;

    let job = r.dispatch.wait(r.dispatch.submit(1, "PING").unwrap()).await.unwrap();

    assert_eq!(job.outcome(), Some(JobOutcome::Success { simulated: true }));
    assert_eq!(job.attempts, 1);
    let entry = r.storage.entry(job.log_entry.unwrap()).await.unwrap();
    assert_eq!(entry.status, LogStatus::Sent);
    assert!(entry.simulated);
    assert!(modem.written(PORT).is_empty());
}

#[tokio::test]
async fn missing_module_is_a_hardware_error_when_simulation_is_off() {
    let modem = MockModem::absent();
    let r = rig(&modem, false, 2);
    add_device(&r.storage, 1, "+237699999999").await;

    let job = r.dispatch.wait(r.dispatch.submit(1, "PING").unwrap()).await.unwrap();

    assert_eq!(job.outcome(), Some(JobOutcome::HardwareError));
    assert_eq!(job.attempts, 3);
    let entry = r.storage.entry(job.log_entry.unwrap()).await.unwrap();
    assert_eq!(entry.status, LogStatus::Error);
    assert!(entry.error.unwrap().contains("GSM module absent"));
    assert_eq!(r.dispatch.snapshot().await.unwrap().hardware_errors, 1);
}

#[tokio::test]
async fn text_mode_refusal_is_retried_then_exhausted() {
    let modem = MockModem::new();
    modem.set_reject_text_mode(true);
    let r = rig(&modem, true, 2);
    add_device(&r.storage, 1, "+237699999999").await;

    let job = r.dispatch.wait(r.dispatch.submit(1, "PING").unwrap()).await.unwrap();

    assert_eq!(job.outcome(), Some(JobOutcome::Exhausted));
    assert_eq!(job.attempts, 3);
    assert_eq!(modem.terminators_sent(PORT), 0);
    assert_eq!(modem.close_count(), modem.open_count());
}
