//! Binary entrypoint for the canelink CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the dispatcher and the inbound poller until Ctrl-C
//! - `init` - create a starter `config.toml` and the data directory
//! - `send --device <id> [--number <gsm>] <payload>` - send one command and wait for the outcome
//! - `contact --device <id> --contact <id> --role <role> --phone <number>` - register a contact on a cane
//! - `probe [--port <path>] [-b <baud>] [--timeout <s>]` - check that a GSM module answers
//! - `status` - print devices, contact slots and recent exchanges
//!
//! See the library crate docs for module-level details: `canelink::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use canelink::config::Config;
use canelink::dispatch::CommandJob;
use canelink::protocol::AtProtocol;
use canelink::serial::SystemOpener;
use canelink::service::LinkRuntime;
use canelink::slots::ContactRole;
use canelink::storage::{DeviceId, Storage};

#[derive(Parser)]
#[command(name = "canelink")]
#[command(about = "GSM/SMS command link for smart cane devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher and inbound poller
    Start {
        /// GSM module serial port (e.g., /dev/ttyUSB0); overrides config and GSM_PORT
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a starter configuration
    Init,
    /// Send one command to a device and wait for the outcome
    Send {
        #[arg(short, long)]
        device: DeviceId,
        /// GSM number of the device; registers or updates it first
        #[arg(short, long)]
        number: Option<String>,
        /// Raw command text
        payload: String,
    },
    /// Register an emergency contact on a device
    Contact {
        #[arg(short, long)]
        device: DeviceId,
        /// Collaborator-side contact id
        #[arg(long)]
        contact: u64,
        /// FAMILLE, AMI, SOIGNANT, URGENCE or AUTRE
        #[arg(short, long)]
        role: ContactRole,
        #[arg(long)]
        phone: String,
    },
    /// Check that the GSM module answers AT
    Probe {
        /// Serial port; defaults to the configured port
        #[arg(short, long)]
        port: Option<String>,
        /// Baud rate; defaults to the configured rate
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Seconds to wait for the answer
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },
    /// Show devices, slots and recent exchanges
    Status {
        /// Number of exchange log entries to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        info!("Initializing new canelink configuration");
        Config::create_default(&cli.config).await?;
        let cfg = Config::default();
        tokio::fs::create_dir_all(&cfg.storage.data_dir).await?;
        info!("Configuration file created at {}", cli.config);
        info!("Data directory ready at {}", cfg.storage.data_dir);
        return Ok(());
    }

    let mut config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Start { port } => {
            if let Some(port) = port {
                config.gsm.port = port;
            }
            info!("Starting canelink v{}", env!("CARGO_PKG_VERSION"));
            info!(
                "GSM module on {} @ {} baud (timeout {}s)",
                config.gsm.port, config.gsm.baud_rate, config.gsm.timeout_secs
            );
            let runtime = LinkRuntime::from_config(&config, Arc::new(SystemOpener::new())).await?;
            let poller = if config.poller.enabled {
                Some(runtime.poller.clone().spawn(config.poller.interval()))
            } else {
                info!("Inbound poller disabled");
                None
            };

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            if let Some(poller) = poller {
                poller.stop().await;
            }
            if let Some(stats) = runtime.service.dispatcher().snapshot().await {
                info!(
                    "Dispatcher totals: succeeded={} simulated={} exhausted={} hardware_errors={} cancelled={} retries={}",
                    stats.succeeded, stats.simulated, stats.exhausted, stats.hardware_errors, stats.cancelled, stats.retries
                );
            }
            let m = canelink::metrics::snapshot();
            info!(
                "Link totals: sent={} simulated={} failed_attempts={} inbound={} poll_failures={} avg_exchange_ms={}",
                m.sms_sent,
                m.sms_simulated,
                m.failed_attempts,
                m.inbound_received,
                m.poll_failures,
                m.exchange_latency_avg_ms
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            runtime.service.dispatcher().shutdown().await;
        }
        Commands::Send {
            device,
            number,
            payload,
        } => {
            let runtime = LinkRuntime::from_config(&config, Arc::new(SystemOpener::new())).await?;
            if let Some(number) = number {
                runtime.service.add_device(device, &number).await?;
            }
            let id = runtime.service.send_command(device, &payload)?;
            info!("Job {} submitted for device {}", id, device);
            let job = runtime.service.dispatcher().wait(id).await?;
            runtime.service.dispatcher().shutdown().await;
            print_job(&job)?;
            std::process::exit(if job.outcome().is_some_and(|o| o.is_success()) { 0 } else { 1 });
        }
        Commands::Contact {
            device,
            contact,
            role,
            phone,
        } => {
            let runtime = LinkRuntime::from_config(&config, Arc::new(SystemOpener::new())).await?;
            let registration = runtime
                .service
                .register_contact(device, contact, role, &phone)
                .await?;
            info!(
                "Contact {} assigned slot {}; sending {}",
                contact, registration.index, registration.command
            );
            let job = runtime.service.dispatcher().wait(registration.job).await?;
            runtime.service.dispatcher().shutdown().await;
            print_job(&job)?;
            std::process::exit(if job.outcome().is_some_and(|o| o.is_success()) { 0 } else { 1 });
        }
        Commands::Probe {
            port,
            baud,
            timeout,
        } => {
            let port = port.unwrap_or_else(|| config.gsm.port.clone());
            let baud = baud.unwrap_or(config.gsm.baud_rate);
            let mut timing = config.gsm.timing();
            timing.command_timeout = Duration::from_secs(timeout.max(1));
            let protocol = AtProtocol::new(Arc::new(SystemOpener::new()), baud, timing, false);
            info!("Probing GSM module on {} @ {} baud", port, baud);
            let target = port.clone();
            let result = tokio::task::spawn_blocking(move || protocol.probe(&target))
                .await
                .map_err(|e| anyhow!("probe task failed: {}", e))?;
            let payload = match &result {
                Ok(answer) => serde_json::json!({
                    "status": "ok",
                    "port": port,
                    "baud": baud,
                    "answer": answer.trim(),
                }),
                Err(reason) => {
                    warn!("Probe failed: {}", reason);
                    serde_json::json!({
                        "status": "failed",
                        "port": port,
                        "baud": baud,
                        "reason": reason.to_string(),
                    })
                }
            };
            println!("{}", payload);
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Commands::Status { limit } => {
            let storage = Storage::open(&config.storage.data_dir, config.storage.log_cache_limit).await?;
            show_status(&config, &storage, limit).await;
        }
    }

    Ok(())
}

fn print_job(job: &CommandJob) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    if let Some(err) = &job.last_error {
        if !job.outcome().is_some_and(|o| o.is_success()) {
            error!("Job {} failed: {}", job.id, err);
        }
    }
    Ok(())
}

async fn show_status(config: &Config, storage: &Storage, limit: usize) {
    let ports = config.gsm.port_map();
    let devices = storage.devices().await;
    let slots = storage.slot_tables().await;
    println!("canelink v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "GSM: {} @ {} baud, timeout {}s, simulation {}",
        config.gsm.port,
        config.gsm.baud_rate,
        config.gsm.timeout_secs,
        if config.gsm.simulate_when_absent { "on" } else { "off" }
    );
    println!("Devices: {}", devices.len());
    for device in &devices {
        let last = device
            .last_contact
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "never".to_string());
        let used = slots.get(&device.id).map(|s| s.len()).unwrap_or(0);
        println!(
            "  #{} {} {:?} port={} last_contact={} slots={}/{}",
            device.id,
            device.phone,
            device.status,
            ports.port_for(device.id),
            last,
            used,
            canelink::slots::SLOT_CAPACITY
        );
    }
    let recent = storage.recent_entries(limit).await;
    println!("Recent exchanges: {}", recent.len());
    for entry in recent {
        println!(
            "  {} #{} {:?} {:?} {}{}",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.device,
            entry.direction,
            entry.status,
            canelink::logutil::escape_log(&entry.content),
            entry
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs mirror the file to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
