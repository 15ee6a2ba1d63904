//! # Canelink - GSM Command Link for Smart Canes
//!
//! Canelink drives a GSM module over a serial line to exchange SMS commands with
//! "smart cane" wearables: it configures the emergency contacts stored on each
//! cane, retries deliveries when the radio or the hardware fails, and collects
//! the messages canes send back.
//!
//! ## Features
//!
//! - **AT Protocol State Machine**: explicit states for the text-mode SMS sequence,
//!   deadline-bounded reads, success/failure token parsing.
//! - **Exclusive Serial Access**: one open handle per port, released on every exit path.
//! - **Retrying Dispatcher**: tokio scheduler with a bounded worker pool, per-port
//!   mutual exclusion and a configurable retry policy.
//! - **Inbound Polling**: periodic `AT+CMGL` reads routed to the sending device.
//! - **Slot Allocation**: the cane's 5-entry contact memory mirrored per device.
//! - **Simulation Mode**: explicit fallback when no module is attached.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use canelink::config::Config;
//! use canelink::serial::SystemOpener;
//! use canelink::service::LinkRuntime;
//! use canelink::slots::ContactRole;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let runtime = LinkRuntime::from_config(&config, Arc::new(SystemOpener::new())).await?;
//!
//!     runtime.service.add_device(1, "+237699999999").await?;
//!     let reg = runtime
//!         .service
//!         .register_contact(1, 42, ContactRole::Famille, "+237600000000")
//!         .await?;
//!     let job = runtime.service.dispatcher().wait(reg.job).await?;
//!     println!("slot {} -> {:?}", reg.index, job.outcome());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`serial`] - byte transport, port registry, scripted mock modem
//! - [`protocol`] - AT command encoding, exchange state machine, inbox parsing
//! - [`slots`] - contact slot allocator and `CONF:` command format
//! - [`dispatch`] - job scheduler, retry policy, port locks
//! - [`poller`] - periodic inbound reads
//! - [`storage`] - devices, exchange log, slot table persistence
//! - [`service`] - collaborator facade and runtime assembly
//! - [`config`] - configuration file and environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CaneService    │ ← contact flows, raw commands
//! └─────────────────┘
//!          │
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Dispatcher    │     │ Inbound Poller  │
//! └─────────────────┘     └─────────────────┘
//!          │    port locks    │
//! ┌─────────────────────────────────────────┐
//! │          AT Protocol / Serial Link      │ ← GSM module
//! └─────────────────────────────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Storage      │ ← devices, exchange log, slots
//! └─────────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod logutil;
pub mod metrics;
pub mod poller;
pub mod protocol;
pub mod serial;
pub mod service;
pub mod slots;
pub mod storage;
