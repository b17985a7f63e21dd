//! Attach/detach lifecycle
//!
//! The controller owns the association between a connection and its device object.
//! Per connection it moves through `Unbound -> Attaching -> Bound -> Detaching ->
//! Unbound`; a later attach of the same unit starts over with a fresh object.

use crate::driver::device::{DevicePhase, DeviceRef, DeviceTracker, IspDevice};
use crate::driver::identity::USBTINY_DEV_NAME;
use crate::driver::registrar::{NodeHandle, NodeRegistrar};
use crate::error::{DriverError, Result};
use common::{ConnectionId, DeviceIdentity, NodeInfo};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Binding state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Attaching,
    Bound,
    Detaching,
}

/// Controller's reference on a bound device
#[derive(Debug)]
struct Binding {
    device: DeviceRef,
    node: NodeInfo,
}

#[derive(Debug)]
enum Association {
    Attaching,
    Bound(Binding),
    Detaching,
}

impl Association {
    fn state(&self) -> BindState {
        match self {
            Association::Attaching => BindState::Attaching,
            Association::Bound(_) => BindState::Bound,
            Association::Detaching => BindState::Detaching,
        }
    }
}

/// Probe/disconnect handlers and the connection-to-object association table
pub struct LifecycleController {
    tracker: DeviceTracker,
    registrar: NodeRegistrar,
    control_buffer_size: usize,
    associations: Mutex<HashMap<ConnectionId, Association>>,
}

impl LifecycleController {
    pub fn new(registrar: NodeRegistrar, control_buffer_size: usize) -> Self {
        Self {
            tracker: DeviceTracker::new(),
            registrar,
            control_buffer_size,
            associations: Mutex::new(HashMap::new()),
        }
    }

    /// Attach handler
    ///
    /// Creates the device object, registers its node and binds it to `connection`.
    /// On failure the partially built object is released before the error is
    /// returned, so nothing outlives a failed attach.
    pub fn probe(&self, connection: ConnectionId, identity: DeviceIdentity) -> Result<NodeInfo> {
        {
            let mut associations = self.lock_associations();
            if let Some(existing) = associations.get(&connection) {
                warn!(
                    "Attach for {} while {:?}, rejecting",
                    connection,
                    existing.state()
                );
                return Err(DriverError::AlreadyBound(connection));
            }
            associations.insert(connection, Association::Attaching);
        }

        let result = self.bind(connection, identity);

        let mut associations = self.lock_associations();
        match result {
            Ok(binding) => {
                binding.device.set_phase(DevicePhase::Active);
                let node = binding.node.clone();
                associations.insert(connection, Association::Bound(binding));
                drop(associations);

                info!(
                    "{} device now attached to {}",
                    USBTINY_DEV_NAME,
                    node.path.display()
                );
                Ok(node)
            }
            Err(e) => {
                associations.remove(&connection);
                Err(e)
            }
        }
    }

    fn bind(&self, connection: ConnectionId, identity: DeviceIdentity) -> Result<Binding> {
        let device = IspDevice::create(
            &self.tracker,
            connection,
            identity,
            self.control_buffer_size,
        )
        .inspect_err(|_| error!("Out of memory"))?;

        match self.registrar.register(&device) {
            Ok(node) => Ok(Binding { device, node }),
            Err(e) => {
                error!("Not able to get a minor for this device: {}", e);
                // Last reference: this destroys the object.
                drop(device);
                Err(e)
            }
        }
    }

    /// Detach handler
    ///
    /// Clears the association and deregisters the node in one step, then drops the
    /// controller's reference. The object itself lives on while node handles are
    /// still open. Never fails.
    pub fn disconnect(&self, connection: ConnectionId) {
        let binding = {
            let mut associations = self.lock_associations();
            let Some(slot) = associations.get_mut(&connection) else {
                debug!("Disconnect for unbound {}, ignoring", connection);
                return;
            };

            match std::mem::replace(slot, Association::Detaching) {
                Association::Bound(binding) => {
                    binding.device.set_phase(DevicePhase::Unregistering);
                    self.registrar.deregister(binding.node.minor);
                    binding
                }
                other => {
                    warn!(
                        "Disconnect for {} while {:?}, ignoring",
                        connection,
                        other.state()
                    );
                    *slot = other;
                    return;
                }
            }
        };

        let minor = binding.node.minor;
        // Release the controller's reference; destroys the object unless a handle
        // still holds it.
        drop(binding);

        self.lock_associations().remove(&connection);

        info!("{} #{} now disconnected", USBTINY_DEV_NAME, minor);
    }

    pub fn bind_state(&self, connection: ConnectionId) -> BindState {
        self.lock_associations()
            .get(&connection)
            .map_or(BindState::Unbound, Association::state)
    }

    /// Retain the device object bound to `connection`
    pub fn device(&self, connection: ConnectionId) -> Option<DeviceRef> {
        match self.lock_associations().get(&connection) {
            Some(Association::Bound(binding)) => Some(DeviceRef::clone(&binding.device)),
            _ => None,
        }
    }

    /// Connections currently bound
    pub fn bound(&self) -> Vec<ConnectionId> {
        let mut bound: Vec<_> = self
            .lock_associations()
            .iter()
            .filter(|(_, a)| matches!(a, Association::Bound(_)))
            .map(|(c, _)| *c)
            .collect();
        bound.sort();
        bound
    }

    pub fn bound_count(&self) -> usize {
        self.lock_associations()
            .values()
            .filter(|a| matches!(a, Association::Bound(_)))
            .count()
    }

    /// Open a registered node
    pub fn open(&self, minor: u8) -> Result<NodeHandle> {
        self.registrar.open(minor)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.registrar.nodes()
    }

    pub fn registrar(&self) -> &NodeRegistrar {
        &self.registrar
    }

    pub fn tracker(&self) -> &DeviceTracker {
        &self.tracker
    }

    fn lock_associations(&self) -> MutexGuard<'_, HashMap<ConnectionId, Association>> {
        self.associations.lock().unwrap_or_else(|e| e.into_inner())
    }
}
