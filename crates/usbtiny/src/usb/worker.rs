//! USB worker thread
//!
//! Dedicated thread running the libusb event loop. Hot-plug callbacks, and with them
//! every probe and disconnect, execute here. Commands from the Tokio runtime are
//! polled between bounded `handle_events` waits.

use crate::bus::UsbBus;
use crate::config::UsbSettings;
use crate::driver::UsbTinyDriver;
use crate::usb::host::UsbHost;
use common::{HostCommand, HostWorker};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// USB worker thread
///
/// Owns the host adapter and serves commands from the Tokio runtime.
pub struct HostWorkerThread {
    host: UsbHost,
    driver: Arc<UsbTinyDriver>,
    worker: HostWorker,
    settings: UsbSettings,
}

impl HostWorkerThread {
    /// Create the host adapter and report devices already connected
    pub fn new(
        worker: HostWorker,
        bus: Arc<UsbBus>,
        driver: Arc<UsbTinyDriver>,
        settings: UsbSettings,
    ) -> Result<Self, rusb::Error> {
        let mut host = UsbHost::new(bus)?;
        host.initialize()?;

        Ok(Self {
            host,
            driver,
            worker,
            settings,
        })
    }

    /// Run the event loop until a Shutdown command arrives
    ///
    /// Each iteration drains pending commands, waits for libusb events for at most
    /// `event_timeout`, and rescans when polling instead of using hot-plug.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");
        let mut last_scan = Instant::now();

        'event_loop: loop {
            while let Some(cmd) = self.worker.try_recv_command() {
                if matches!(cmd, HostCommand::Shutdown) {
                    info!("USB worker shutting down");
                    break 'event_loop;
                }
                self.handle_command(cmd);
            }

            match self
                .host
                .context()
                .handle_events(Some(self.settings.event_timeout()))
            {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }

            if !self.host.uses_hotplug() && last_scan.elapsed() >= self.settings.poll_interval() {
                if let Err(e) = self.host.rescan() {
                    warn!("Periodic rescan failed: {}", e);
                }
                last_scan = Instant::now();
            }
        }

        // Dropping the host deregisters the hot-plug callback before the driver unloads.
        drop(self.host);
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: HostCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::ListNodes { response } => {
                let nodes = self.driver.nodes();
                debug!("Listing {} nodes", nodes.len());
                let _ = response.send(nodes);
            }

            HostCommand::Rescan { response } => {
                let result = self
                    .host
                    .rescan()
                    .map_err(|e| common::Error::Usb(e.to_string()));
                let _ = response.send(result);
            }

            HostCommand::Shutdown => {
                // Handled in the event loop
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or the host fails to start.
pub fn spawn_host_worker(
    worker: HostWorker,
    bus: Arc<UsbBus>,
    driver: Arc<UsbTinyDriver>,
    settings: UsbSettings,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = HostWorkerThread::new(worker, bus, driver, settings)?;
            worker_thread.run()
        })
}
