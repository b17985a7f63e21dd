//! In-process USB bus
//!
//! Plays the part of the host bus framework: drivers register with it, and it offers
//! each arriving device to the first driver whose id table matches. Removal is routed
//! only to the driver that claimed the connection. Dispatch is serialized, so a
//! detach is never handled while the attach for the same connection is running.

use crate::driver::identity::table_matches;
use crate::error::{DriverError, Result};
use common::{ConnectionId, DeviceIdentity, DriverEvent, EventSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// A driver as seen by the bus
pub trait UsbDriver: Send + Sync {
    /// Unique driver name
    fn name(&self) -> &str;

    /// Sentinel-terminated table of identities this driver claims
    fn id_table(&self) -> &[DeviceIdentity];

    /// Bind to a newly arrived device; an error leaves the device unclaimed
    fn probe(&self, connection: ConnectionId, identity: DeviceIdentity) -> Result<()>;

    /// The claimed device went away
    fn disconnect(&self, connection: ConnectionId);
}

/// Result of offering an arrived device to the registered drivers
#[derive(Debug)]
pub enum ProbeOutcome {
    /// A driver bound to the device
    Claimed { driver: String },
    /// No driver's id table matched
    Unmatched,
    /// The connection is already claimed; duplicate arrival ignored
    AlreadyClaimed,
    /// The matching driver's probe failed
    Failed { driver: String, error: DriverError },
}

/// Registered drivers and the connections they claimed
pub struct UsbBus {
    drivers: Mutex<Vec<Arc<dyn UsbDriver>>>,
    /// Also serializes dispatch: held across every probe and disconnect call
    claims: Mutex<HashMap<ConnectionId, Arc<dyn UsbDriver>>>,
    events: Option<EventSink>,
}

impl UsbBus {
    pub fn new() -> Self {
        Self {
            drivers: Mutex::new(Vec::new()),
            claims: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Bus that reports lifecycle events through `events`
    pub fn with_events(events: EventSink) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    /// Make a driver's id table visible for matching
    ///
    /// Devices that arrived earlier are not re-offered; the host adapter rescans
    /// after load.
    pub fn register_driver(&self, driver: Arc<dyn UsbDriver>) -> Result<()> {
        let mut drivers = lock(&self.drivers);
        if drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(DriverError::DriverAlreadyRegistered(driver.name().to_string()));
        }

        info!("Registered USB driver {}", driver.name());
        drivers.push(driver);
        Ok(())
    }

    /// Remove a driver, disconnecting every connection it claimed
    ///
    /// Returns false if no driver by that name was registered.
    pub fn deregister_driver(&self, name: &str) -> bool {
        let removed = {
            let mut drivers = lock(&self.drivers);
            let before = drivers.len();
            drivers.retain(|d| d.name() != name);
            drivers.len() != before
        };
        if !removed {
            return false;
        }

        let mut claims = lock(&self.claims);
        let mut owned: Vec<ConnectionId> = claims
            .iter()
            .filter(|(_, d)| d.name() == name)
            .map(|(c, _)| *c)
            .collect();
        owned.sort();

        for connection in owned {
            if let Some(driver) = claims.remove(&connection) {
                driver.disconnect(connection);
                self.emit(DriverEvent::Detached {
                    driver: name.to_string(),
                    connection,
                });
            }
        }

        info!("Deregistered USB driver {}", name);
        true
    }

    /// Offer a newly arrived device to the registered drivers
    pub fn device_added(&self, connection: ConnectionId, identity: DeviceIdentity) -> ProbeOutcome {
        let mut claims = lock(&self.claims);
        if claims.contains_key(&connection) {
            debug!("{} already claimed, ignoring arrival", connection);
            return ProbeOutcome::AlreadyClaimed;
        }

        let Some(driver) = self.find_driver(&identity) else {
            debug!("No driver for {} ({})", connection, identity);
            return ProbeOutcome::Unmatched;
        };
        let name = driver.name().to_string();

        match driver.probe(connection, identity) {
            Ok(()) => {
                claims.insert(connection, driver);
                self.emit(DriverEvent::Attached {
                    driver: name.clone(),
                    connection,
                });
                ProbeOutcome::Claimed { driver: name }
            }
            Err(e) => {
                error!(
                    "{}: probe of {} ({}) failed with error {}",
                    name,
                    connection,
                    identity,
                    e.errno()
                );
                self.emit(DriverEvent::AttachFailed {
                    driver: name.clone(),
                    connection,
                    identity,
                    errno: e.errno(),
                });
                ProbeOutcome::Failed {
                    driver: name,
                    error: e,
                }
            }
        }
    }

    /// A device went away; returns true if a driver had claimed it
    pub fn device_removed(&self, connection: ConnectionId) -> bool {
        let mut claims = lock(&self.claims);
        let Some(driver) = claims.remove(&connection) else {
            debug!("Unclaimed {} removed", connection);
            return false;
        };

        driver.disconnect(connection);
        self.emit(DriverEvent::Detached {
            driver: driver.name().to_string(),
            connection,
        });
        true
    }

    /// Name of the driver bound to `connection`
    pub fn claimed_by(&self, connection: ConnectionId) -> Option<String> {
        lock(&self.claims)
            .get(&connection)
            .map(|d| d.name().to_string())
    }

    pub fn claimed_count(&self) -> usize {
        lock(&self.claims).len()
    }

    pub fn driver_names(&self) -> Vec<String> {
        lock(&self.drivers)
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Whether any registered driver would be offered `identity`
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.find_driver(identity).is_some()
    }

    fn find_driver(&self, identity: &DeviceIdentity) -> Option<Arc<dyn UsbDriver>> {
        lock(&self.drivers)
            .iter()
            .find(|d| table_matches(d.id_table(), identity))
            .cloned()
    }

    fn emit(&self, event: DriverEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl Default for UsbBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
