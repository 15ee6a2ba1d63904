//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use canelink::config::{Config, DispatchConfig, GsmConfig, LoggingConfig, PollerConfig, StorageConfig};
use canelink::dispatch::{
    start_dispatcher, DispatchContext, DispatchHandle, DispatcherSettings, PortLocks, RetryPolicy,
};
use canelink::protocol::{AtProtocol, ExchangeTiming};
use canelink::serial::mock::MockModem;
use canelink::serial::PortMap;
use canelink::storage::{Device, Storage};

pub const PORT: &str = "/dev/ttyMOCK";

/// Protocol over `modem` with zero settle windows and a short deadline.
pub fn protocol(modem: &MockModem, simulate: bool) -> AtProtocol {
    AtProtocol::new(
        Arc::new(modem.clone()),
        9600,
        ExchangeTiming::immediate(Duration::from_millis(40)),
        simulate,
    )
}

pub struct Rig {
    pub dispatch: DispatchHandle,
    pub storage: Storage,
    pub locks: PortLocks,
    pub modem: MockModem,
}

/// Dispatcher over `modem` with three attempts a few ms apart.
pub fn rig(modem: &MockModem, simulate: bool, workers: usize) -> Rig {
    rig_with(modem, simulate, workers, RetryPolicy::fixed(3, Duration::from_millis(5)), PortMap::new(PORT))
}

pub fn rig_with(modem: &MockModem, simulate: bool, workers: usize, policy: RetryPolicy, ports: PortMap) -> Rig {
    let storage = Storage::in_memory();
    let locks = PortLocks::new();
    let ctx = DispatchContext {
        protocol: protocol(modem, simulate),
        storage: storage.clone(),
        locks: locks.clone(),
        ports,
        policy,
    };
    let settings = DispatcherSettings {
        workers,
        history_limit: 64,
        stats_interval: None,
    };
    Rig {
        dispatch: start_dispatcher(ctx, settings),
        storage,
        locks,
        modem: modem.clone(),
    }
}

pub async fn add_device(storage: &Storage, id: u64, phone: &str) {
    storage
        .upsert_device(Device::new(id, phone))
        .await
        .expect("upsert device");
}

/// Config tuned for tests: no settle windows, 1 s deadline, no retry delay.
pub fn test_config(data_dir: &str) -> Config {
    Config {
        gsm: GsmConfig {
            port: PORT.into(),
            baud_rate: 9600,
            timeout_secs: 1,
            device_ports: Default::default(),
            simulate_when_absent: true,
            open_settle_ms: Some(0),
            step_settle_ms: Some(0),
            busy_poll_ms: Some(1),
        },
        dispatch: DispatchConfig {
            max_attempts: 3,
            retry_delay_secs: 0,
            workers: Some(2),
            ..DispatchConfig::default()
        },
        poller: PollerConfig {
            enabled: false,
            interval_secs: 60,
        },
        storage: StorageConfig {
            data_dir: data_dir.to_string(),
            log_cache_limit: None,
        },
        logging: LoggingConfig {
            level: "debug".into(),
            file: None,
        },
    }
}
