//! libusb host adapter
//!
//! Turns libusb hot-plug notifications into bus arrivals and removals. When the
//! platform's libusb has no hot-plug support, the device list is diffed on every
//! rescan instead. This module runs in the worker thread.

use crate::bus::UsbBus;
use common::{ConnectionId, DeviceIdentity};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Devices the adapter has reported to the bus as present
type PresentDevices = Arc<Mutex<BTreeMap<ConnectionId, DeviceIdentity>>>;

/// Owns the libusb context and feeds the bus
pub struct UsbHost {
    context: Context,
    bus: Arc<UsbBus>,
    present: PresentDevices,
    /// Hot-plug registration; dropping it deregisters the callback
    hotplug_registration: Option<Registration<Context>>,
}

impl UsbHost {
    pub fn new(bus: Arc<UsbBus>) -> Result<Self, rusb::Error> {
        let context = Context::new()?;

        Ok(Self {
            context,
            bus,
            present: Arc::new(Mutex::new(BTreeMap::new())),
            hotplug_registration: None,
        })
    }

    /// Report already-connected devices and start watching for changes
    ///
    /// This should be called once after creating the host.
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        if rusb::has_hotplug() {
            self.register_hotplug()?;
        } else {
            warn!("libusb has no hot-plug support, falling back to polling");
            self.rescan()?;
        }

        info!(
            "USB host initialized with {} devices present",
            lock(&self.present).len()
        );
        Ok(())
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        let callback = HotplugForwarder {
            bus: Arc::clone(&self.bus),
            present: Arc::clone(&self.present),
        };

        // enumerate(true) delivers an arrival for every device already connected.
        let registration = HotplugBuilder::new()
            .enumerate(true)
            .register(&self.context, Box::new(callback))?;

        self.hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    pub fn uses_hotplug(&self) -> bool {
        self.hotplug_registration.is_some()
    }

    /// Enumerate the bus and reconcile with what was reported before
    ///
    /// Returns the number of devices present after the scan.
    pub fn rescan(&self) -> Result<usize, rusb::Error> {
        let current: BTreeMap<ConnectionId, DeviceIdentity> =
            enumerate(&self.context)?.into_iter().collect();
        Ok(reconcile(&self.bus, &self.present, &current))
    }

    /// Devices currently reported present
    pub fn present(&self) -> Vec<(ConnectionId, DeviceIdentity)> {
        lock(&self.present)
            .iter()
            .map(|(c, i)| (*c, *i))
            .collect()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// List connected devices with their identities
///
/// Devices whose descriptor cannot be read are skipped.
pub fn enumerate<T: UsbContext>(
    context: &T,
) -> Result<Vec<(ConnectionId, DeviceIdentity)>, rusb::Error> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        match identify(&device) {
            Ok(identity) => found.push((connection_of(&device), identity)),
            Err(e) => debug!(
                "Skipping device bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
    found.sort();
    Ok(found)
}

fn connection_of<T: UsbContext>(device: &Device<T>) -> ConnectionId {
    ConnectionId::new(device.bus_number(), device.address())
}

fn identify<T: UsbContext>(device: &Device<T>) -> Result<DeviceIdentity, rusb::Error> {
    let desc = device.device_descriptor()?;
    Ok(DeviceIdentity::new(desc.vendor_id(), desc.product_id()))
}

/// Bring the bus in line with a fresh scan
///
/// Connections missing from `current` are removed first, so a reused address is seen
/// as a departure followed by an arrival. Returns the number of devices in the scan.
fn reconcile(
    bus: &UsbBus,
    present: &PresentDevices,
    current: &BTreeMap<ConnectionId, DeviceIdentity>,
) -> usize {
    let previous: Vec<(ConnectionId, DeviceIdentity)> =
        lock(present).iter().map(|(c, i)| (*c, *i)).collect();

    for (connection, identity) in previous {
        if current.get(&connection) != Some(&identity) {
            device_left(bus, present, connection);
        }
    }
    for (connection, identity) in current {
        device_arrived(bus, present, *connection, *identity);
    }

    current.len()
}

fn device_arrived(
    bus: &UsbBus,
    present: &PresentDevices,
    connection: ConnectionId,
    identity: DeviceIdentity,
) {
    // Only new connections are offered; a rescan re-sees every present device.
    if lock(present).insert(connection, identity).is_some() {
        return;
    }
    debug!("Device arrived: {} ({})", connection, identity);
    bus.device_added(connection, identity);
}

fn device_left(bus: &UsbBus, present: &PresentDevices, connection: ConnectionId) {
    if lock(present).remove(&connection).is_none() {
        return;
    }
    debug!("Device left: {}", connection);
    bus.device_removed(connection);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hot-plug callback handler
///
/// libusb invokes it from `handle_events` on the worker thread, so dispatch into
/// the bus happens there too.
struct HotplugForwarder {
    bus: Arc<UsbBus>,
    present: PresentDevices,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        match identify(&device) {
            Ok(identity) => {
                device_arrived(&self.bus, &self.present, connection_of(&device), identity)
            }
            Err(e) => warn!(
                "Hot-plug arrival without readable descriptor (bus={}, addr={}): {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        device_left(&self.bus, &self.present, connection_of(&device));
    }
}
