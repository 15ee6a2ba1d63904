mod common;

use std::time::Duration;

use canelink::dispatch::{JobOutcome, RetryPolicy};
use canelink::poller::InboundPoller;
use canelink::protocol::RejectReason;
use canelink::serial::mock::MockModem;
use canelink::serial::PortMap;
use canelink::storage::{Direction, LogStatus};
use common::{add_device, protocol, rig_with};

const DEAD: &str = "/dev/ttyDEAD";
const LIVE: &str = "/dev/ttyLIVE";

fn split_ports() -> PortMap {
    PortMap::new(DEAD).with_override(2, LIVE)
}

#[tokio::test]
async fn a_dead_port_does_not_stop_the_cycle() {
    let modem = MockModem::new();
    modem.set_port_absent(DEAD);
    modem.set_inbox(
        LIVE,
        "+CMGL: 3,\"REC UNREAD\",\"+237699999992\",\"\",\"24/05/01,10:15:02+04\"\r\nSOS\r\n",
    );
    let r = rig_with(
        &modem,
        false,
        2,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
        split_ports(),
    );
    add_device(&r.storage, 1, "+237699999991").await;
    add_device(&r.storage, 2, "+237699999992").await;

    let poller = InboundPoller::new(protocol(&modem, false), r.storage.clone(), r.locks.clone(), split_ports());
    let report = poller.poll_once().await;

    assert_eq!(report.ports_polled, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].port, DEAD);
    assert_eq!(report.failures[0].devices, vec![1]);
    assert!(matches!(report.failures[0].reason, RejectReason::HardwareAbsent(_)));
    assert_eq!(report.received, vec![(2, "SOS".to_string())]);

    let inbound = r.storage.entries_for(2).await;
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].direction, Direction::Inbound);
    assert_eq!(inbound[0].status, LogStatus::Received);
    assert!(r.storage.entries_for(1).await.is_empty());
}

#[tokio::test]
async fn outbound_on_a_dead_port_does_not_block_other_devices() {
    let modem = MockModem::new();
    modem.set_port_absent(DEAD);
    let r = rig_with(
        &modem,
        false,
        2,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
        split_ports(),
    );
    add_device(&r.storage, 1, "+237699999991").await;
    add_device(&r.storage, 2, "+237699999992").await;

    let dead = r.dispatch.submit(1, "PING").unwrap();
    let live = r.dispatch.submit(2, "PING").unwrap();

    assert_eq!(r.dispatch.wait(dead).await.unwrap().outcome(), Some(JobOutcome::HardwareError));
    assert_eq!(
        r.dispatch.wait(live).await.unwrap().outcome(),
        Some(JobOutcome::Success { simulated: false })
    );
    assert!(r.storage.device(2).await.unwrap().last_contact.is_some());
    assert!(r.storage.device(1).await.unwrap().last_contact.is_none());
}

#[tokio::test]
async fn poller_waits_for_a_port_in_use() {
    let modem = MockModem::new();
    modem.set_inbox(LIVE, "+CMGL: 1,\"REC UNREAD\",\"+237699999992\",,\"\"\r\nBAT:15\r\n");
    let r = rig_with(
        &modem,
        true,
        1,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
        split_ports(),
    );
    add_device(&r.storage, 2, "+237699999992").await;

    let held = r.locks.acquire(LIVE).await;
    let poller = InboundPoller::new(protocol(&modem, true), r.storage.clone(), r.locks.clone(), split_ports());
    let cycle = tokio::spawn(async move { poller.poll_once().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!cycle.is_finished());
    assert_eq!(modem.open_count(), 0);

    drop(held);
    let report = cycle.await.unwrap();
    assert_eq!(report.received, vec![(2, "BAT:15".to_string())]);
}
