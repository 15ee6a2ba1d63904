mod common;

use std::time::Duration;

use canelink::dispatch::{JobOutcome, RetryPolicy};
use canelink::serial::mock::MockModem;
use canelink::serial::{LinkOpener, PortMap};
use common::{add_device, rig, rig_with, PORT};

#[tokio::test]
async fn concurrent_jobs_for_one_device_never_share_the_port() {
    let modem = MockModem::new();
    modem.set_hold(Duration::from_millis(2));
    let r = rig(&modem, true, 4);
    add_device(&r.storage, 1, "+237699999999").await;

    let ids: Vec<_> = (0..8)
        .map(|i| r.dispatch.submit(1, &format!("PING {i}")).unwrap())
        .collect();
    for id in ids {
        let job = r.dispatch.wait(id).await.unwrap();
        assert!(job.outcome().unwrap().is_success(), "job {} failed: {:?}", id, job.last_error);
        assert_eq!(job.attempts, 1);
    }

    assert_eq!(modem.peak_open(PORT), 1);
    assert_eq!(modem.busy_rejections(), 0);
    assert_eq!(modem.terminators_sent(PORT), 8);
    assert_eq!(modem.open_count(), modem.close_count());
    assert!(!modem.registry().is_held(PORT));
}

#[tokio::test]
async fn devices_sharing_a_module_wait_for_the_port() {
    let modem = MockModem::new();
    modem.set_hold(Duration::from_millis(1));
    let r = rig_with(
        &modem,
        true,
        4,
        RetryPolicy::fixed(3, Duration::from_millis(5)),
        PortMap::new(PORT),
    );
    for id in 1..=4 {
        add_device(&r.storage, id, &format!("+23769999999{id}")).await;
    }

    let ids: Vec<_> = (1..=4).map(|d| r.dispatch.submit(d, "PING").unwrap()).collect();
    for id in ids {
        assert!(r.dispatch.wait(id).await.unwrap().outcome().unwrap().is_success());
    }

    assert_eq!(modem.peak_open(PORT), 1);
    assert_eq!(modem.terminators_sent(PORT), 4);
    assert!(!modem.registry().is_held(PORT));
}

#[tokio::test]
async fn exchanges_longer_than_the_deadline_still_queue_on_a_shared_port() {
    let modem = MockModem::new();
    // Five writes of 10 ms each outlast the 40 ms command deadline.
    modem.set_hold(Duration::from_millis(10));
    let r = rig(&modem, true, 4);
    for id in 1..=4 {
        add_device(&r.storage, id, &format!("+23769999999{id}")).await;
    }

    let ids: Vec<_> = (1..=4).map(|d| r.dispatch.submit(d, "PING").unwrap()).collect();
    for id in ids {
        let job = r.dispatch.wait(id).await.unwrap();
        assert_eq!(job.outcome(), Some(JobOutcome::Success { simulated: false }));
        assert_eq!(job.attempts, 1, "job {} retried: {:?}", id, job.last_error);
    }
    assert_eq!(modem.busy_rejections(), 0);
    assert_eq!(modem.peak_open(PORT), 1);
    assert_eq!(r.dispatch.snapshot().await.unwrap().retries, 0);
}

#[tokio::test]
async fn port_held_elsewhere_defers_without_spending_attempts() {
    let modem = MockModem::new();
    let r = rig(&modem, true, 1);
    add_device(&r.storage, 1, "+237699999999").await;

    let foreign = modem.open(PORT, 9600, Duration::from_secs(1)).unwrap();
    let id = r.dispatch.submit(1, "PING").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(modem.busy_rejections() > 0);
    let pending = r.dispatch.job(id).await.unwrap().unwrap();
    assert_eq!(pending.attempts, 0);
    assert!(!pending.is_terminal());
    drop(foreign);

    let job = r.dispatch.wait(id).await.unwrap();
    assert_eq!(job.outcome(), Some(JobOutcome::Success { simulated: false }));
    assert_eq!(job.attempts, 1);
    assert_eq!(r.dispatch.snapshot().await.unwrap().retries, 0);
}

#[tokio::test]
async fn separate_ports_are_used_independently() {
    let modem = MockModem::new();
    let ports = PortMap::new("/dev/ttyA").with_override(2, "/dev/ttyB");
    let r = rig_with(&modem, true, 2, RetryPolicy::fixed(3, Duration::from_millis(5)), ports);
    add_device(&r.storage, 1, "+237699999991").await;
    add_device(&r.storage, 2, "+237699999992").await;

    let a = r.dispatch.submit(1, "A").unwrap();
    let b = r.dispatch.submit(2, "B").unwrap();
    r.dispatch.wait(a).await.unwrap();
    r.dispatch.wait(b).await.unwrap();

    assert!(modem.written_text("/dev/ttyA").contains("+237699999991"));
    assert!(modem.written_text("/dev/ttyB").contains("+237699999992"));
    assert_eq!(modem.terminators_sent("/dev/ttyA"), 1);
    assert_eq!(modem.terminators_sent("/dev/ttyB"), 1);
}

#[tokio::test]
async fn failed_writes_release_the_port() {
    let modem = MockModem::new();
    modem.set_fail_writes(true);
    let r = rig(&modem, true, 1);
    add_device(&r.storage, 1, "+237699999999").await;

    let job = r.dispatch.wait(r.dispatch.submit(1, "PING").unwrap()).await.unwrap();
    assert!(!job.outcome().unwrap().is_success());
    assert_eq!(job.attempts, 3);
    assert_eq!(modem.open_count(), 3);
    assert_eq!(modem.close_count(), 3);
    assert!(!modem.registry().is_held(PORT));
}
