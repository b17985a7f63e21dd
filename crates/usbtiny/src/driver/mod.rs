//! USBtinyISP driver
//!
//! Claims the USBtinyISP programmer (1781:0c9f), creates one device object per
//! attachment and exposes it as a `usbtiny<N>` node with a minor from 192 upwards.
//! The programming protocol itself plugs in through [`device::ControlProtocol`].

pub mod device;
pub mod identity;
pub mod lifecycle;
pub mod module;
pub mod registrar;

use crate::bus::UsbDriver;
use crate::config::DriverSettings;
use crate::error::Result;
use common::{ConnectionId, DeviceIdentity, NodeInfo};
use device::DeviceTracker;
use identity::{IdTable, USBTINY_DEV_NAME, USBTINY_ID_TABLE};
use lifecycle::LifecycleController;
use registrar::{ClassDriver, NodeRegistrar, USBTINY_NODE_PREFIX};
use tracing::warn;

pub use device::{ControlProtocol, DevicePhase, DeviceRef, IspDevice};
pub use lifecycle::BindState;
pub use module::{DriverModule, LoadedModule, USBTINY_MODULE};
pub use registrar::NodeHandle;

/// The driver registered with the bus
pub struct UsbTinyDriver {
    ids: IdTable,
    controller: LifecycleController,
}

impl UsbTinyDriver {
    pub fn new(settings: &DriverSettings) -> Self {
        let extra: Vec<DeviceIdentity> = settings
            .extra_ids
            .iter()
            .filter_map(|s| {
                let id = DeviceIdentity::parse(s);
                if id.is_none() {
                    warn!("Ignoring invalid device id '{}'", s);
                }
                id
            })
            .collect();

        let class = ClassDriver::new(
            USBTINY_NODE_PREFIX,
            settings.minor_base,
            settings.minor_count,
        );
        let registrar = NodeRegistrar::new(class, settings.resolved_node_dir());

        Self {
            ids: IdTable::new(&USBTINY_ID_TABLE, &extra),
            controller: LifecycleController::new(registrar, settings.control_buffer_size),
        }
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn tracker(&self) -> &DeviceTracker {
        self.controller.tracker()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.controller.nodes()
    }

    pub fn open(&self, minor: u8) -> Result<NodeHandle> {
        self.controller.open(minor)
    }
}

impl Default for UsbTinyDriver {
    fn default() -> Self {
        Self::new(&DriverSettings::default())
    }
}

impl UsbDriver for UsbTinyDriver {
    fn name(&self) -> &str {
        USBTINY_DEV_NAME
    }

    fn id_table(&self) -> &[DeviceIdentity] {
        self.ids.as_slice()
    }

    fn probe(&self, connection: ConnectionId, identity: DeviceIdentity) -> Result<()> {
        self.controller.probe(connection, identity).map(|_| ())
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.controller.disconnect(connection)
    }
}
