//! usbtiny-hotplug daemon
//!
//! Loads the USBtinyISP driver into an in-process bus fed by libusb hot-plug events,
//! and keeps a `usbtiny<N>` node registered for every programmer that is plugged in.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{DriverEvent, HostBridge, HostCommand, create_host_bridge, setup_logging};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use usbtiny::config::DaemonConfig;
use usbtiny::driver::identity::{USBTINY_DEV_NAME, table_matches};
use usbtiny::usb::spawn_host_worker;
use usbtiny::{USBTINY_MODULE, UsbBus, UsbDriver};

#[derive(Parser, Debug)]
#[command(name = "usbtiny-hotplug")]
#[command(
    author,
    version,
    about = "USBtinyISP hot-plug daemon - register a node per attached programmer"
)]
#[command(long_about = "
Watches the USB bus for USBtinyISP programmers (1781:0c9f). Each attached
programmer gets a device object and a usbtiny<N> node with a minor number
from 192 upwards; the node is removed again when the programmer is unplugged.

EXAMPLES:
    # Run with default config
    usbtiny-hotplug

    # Publish node descriptors under /run/usbtiny (set node_dir in config)
    usbtiny-hotplug --config /etc/usbtiny-hotplug/daemon.toml

    # Show connected devices and which ones would be claimed
    usbtiny-hotplug --list-devices

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbtiny-hotplug/daemon.toml
    3. /etc/usbtiny-hotplug/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    setup_logging(log_level, config.daemon.log_targets).context("Failed to setup logging")?;

    info!("usbtiny-hotplug v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config);
    }

    let (bridge, worker) = create_host_bridge();
    let bus = Arc::new(UsbBus::with_events(worker.event_sink()));

    // Unloaded when `module` drops, including on the error returns below.
    let module = USBTINY_MODULE
        .load(&bus, &config.driver)
        .context("Failed to load USBtinyISP driver")?;

    let worker_handle = spawn_host_worker(
        worker,
        Arc::clone(&bus),
        Arc::clone(module.driver()),
        config.usb.clone(),
    )
    .context("Failed to spawn USB worker thread")?;

    let result = run_daemon(bridge.clone(), &worker_handle).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(HostCommand::Shutdown).await {
        // The worker is already gone, most likely because libusb failed to start.
        warn!("Failed to send Shutdown command: {}", e);
    }
    match worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    module
        .unload()
        .context("Failed to unload USBtinyISP driver")?;

    result
}

/// List USB devices, marking the ones the driver would claim, and exit
fn list_devices_mode(config: &DaemonConfig) -> Result<()> {
    let driver = usbtiny::UsbTinyDriver::new(&config.driver);
    let context = rusb::Context::new().context("Failed to create USB context")?;
    let devices = usbtiny::usb::enumerate(&context).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for (connection, identity) in devices {
        let claimed = table_matches(driver.id_table(), &identity);
        println!(
            "  {} {}{}",
            connection,
            identity,
            if claimed {
                format!("  <- {}", USBTINY_DEV_NAME)
            } else {
                String::new()
            }
        );
    }

    Ok(())
}

/// Report lifecycle events until Ctrl+C or until the worker thread exits
async fn run_daemon<T>(bridge: HostBridge, worker: &std::thread::JoinHandle<T>) -> Result<()> {
    initial_scan(&bridge).await;
    info!("Waiting for {} devices, press Ctrl+C to stop", USBTINY_DEV_NAME);
    let mut watchdog = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = watchdog.tick() => {
                if worker.is_finished() {
                    return Err(anyhow!("USB worker stopped unexpectedly"));
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = bridge.recv_event() => {
                match event {
                    Ok(event) => report_event(&bridge, event).await,
                    Err(e) => return Err(anyhow!("USB worker stopped: {}", e)),
                }
            }
        }
    }
}

/// Reconcile the bus once the worker is up and report what is connected
async fn initial_scan(bridge: &HostBridge) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if let Err(e) = bridge.send_command(HostCommand::Rescan { response: tx }).await {
        warn!("Failed to request initial scan: {}", e);
        return;
    }
    match rx.await {
        Ok(Ok(count)) => info!("{} USB device(s) present", count),
        Ok(Err(e)) => warn!("Initial scan failed: {}", e),
        // The worker exited before answering; the watchdog reports it.
        Err(_) => {}
    }
}

async fn report_event(bridge: &HostBridge, event: DriverEvent) {
    match event {
        DriverEvent::Attached { driver, connection } => {
            info!("{} bound to {}", driver, connection);
            let (tx, rx) = tokio::sync::oneshot::channel();
            if bridge
                .send_command(HostCommand::ListNodes { response: tx })
                .await
                .is_ok()
                && let Ok(nodes) = rx.await
            {
                info!("{} node(s) registered", nodes.len());
            }
        }
        DriverEvent::Detached { driver, connection } => {
            info!("{} released {}", driver, connection);
        }
        DriverEvent::AttachFailed {
            driver,
            connection,
            identity,
            errno,
        } => {
            warn!(
                "{} could not attach {} at {} ({}); replug the device to retry",
                driver, identity, connection, errno
            );
        }
    }
}
