//! Node registrar
//!
//! Hands out minors from a driver's reserved range and makes each registered device
//! object discoverable as a named node. The registrar only keeps weak references:
//! registering does not extend an object's life, while opening a node does.

use crate::driver::device::{DevicePhase, DeviceRef, IspDevice};
use crate::error::{DriverError, Result};
use common::NodeInfo;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// First minor of the USBtinyISP range
pub const USBTINY_MINOR_BASE: u8 = 192;
/// Size of the USB class minor space
pub const MAX_USB_MINORS: u16 = 256;
/// Node name prefix; the ordinal is `minor - minor_base`
pub const USBTINY_NODE_PREFIX: &str = "usbtiny";

const DEFAULT_DEV_DIR: &str = "/dev";

/// Naming and numbering for a driver's nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDriver {
    pub name_prefix: String,
    pub minor_base: u8,
    /// Number of minors reserved from `minor_base`
    pub minor_count: u16,
}

impl ClassDriver {
    /// Clamp `minor_count` so the range stays within the USB minor space
    pub fn new(name_prefix: impl Into<String>, minor_base: u8, minor_count: u16) -> Self {
        let available = MAX_USB_MINORS - minor_base as u16;
        Self {
            name_prefix: name_prefix.into(),
            minor_base,
            minor_count: minor_count.min(available),
        }
    }
}

impl Default for ClassDriver {
    fn default() -> Self {
        Self::new(
            USBTINY_NODE_PREFIX,
            USBTINY_MINOR_BASE,
            MAX_USB_MINORS - USBTINY_MINOR_BASE as u16,
        )
    }
}

struct Slot {
    device: Weak<IspDevice>,
    info: NodeInfo,
}

/// Allocates minors and publishes nodes for one class driver
pub struct NodeRegistrar {
    class: ClassDriver,
    /// Directory receiving node descriptors; `None` keeps nodes in-process only
    node_dir: Option<PathBuf>,
    slots: Mutex<Vec<Option<Slot>>>,
}

impl NodeRegistrar {
    pub fn new(class: ClassDriver, node_dir: Option<PathBuf>) -> Self {
        let slots = (0..class.minor_count).map(|_| None).collect();
        Self {
            class,
            node_dir,
            slots: Mutex::new(slots),
        }
    }

    pub fn class(&self) -> &ClassDriver {
        &self.class
    }

    /// Reserve the lowest free minor and expose `device` under it
    ///
    /// On failure nothing stays registered: the minor is only taken once the node is
    /// published.
    pub fn register(&self, device: &DeviceRef) -> Result<NodeInfo> {
        let mut slots = self.lock_slots();

        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(DriverError::NoMinorAvailable {
                base: self.class.minor_base,
                count: self.class.minor_count,
            })?;

        // index < minor_count <= 256 - minor_base, so this stays within u8.
        let minor = self.class.minor_base + index as u8;
        let name = format!("{}{}", self.class.name_prefix, index);
        let info = NodeInfo {
            path: self.node_path(&name),
            name,
            minor,
            connection: device.connection(),
            identity: device.identity(),
        };

        if let Some(dir) = &self.node_dir {
            publish_node(dir, &info).map_err(|source| DriverError::NodePublish {
                path: info.path.clone(),
                source,
            })?;
        }

        slots[index] = Some(Slot {
            device: Arc::downgrade(device),
            info: info.clone(),
        });
        device.assign_minor(minor);
        device.set_phase(DevicePhase::Registered);

        debug!("Registered {} (minor {}) for {}", info.name, minor, info.connection);
        Ok(info)
    }

    /// Remove the node at `minor` and free the minor for reuse
    ///
    /// Never fails; problems removing a published descriptor are only logged.
    pub fn deregister(&self, minor: u8) {
        let mut slots = self.lock_slots();

        let Some(slot) = self.index_of(minor).and_then(|i| slots[i].take()) else {
            warn!("Deregistering minor {} which is not registered", minor);
            return;
        };

        if self.node_dir.is_some() {
            match fs::remove_file(&slot.info.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove node descriptor {}: {}",
                    slot.info.path.display(),
                    e
                ),
            }
        }

        debug!("Deregistered {} (minor {})", slot.info.name, minor);
    }

    /// Open the node at `minor`, taking a reference on its device object
    pub fn open(&self, minor: u8) -> Result<NodeHandle> {
        let slots = self.lock_slots();

        let device = self
            .index_of(minor)
            .and_then(|i| slots[i].as_ref())
            .and_then(|slot| slot.device.upgrade())
            .ok_or(DriverError::NoSuchNode(minor))?;

        debug!("Opened minor {} ({})", minor, device.connection());
        Ok(NodeHandle { device, minor })
    }

    /// Live nodes in minor order
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.lock_slots()
            .iter()
            .flatten()
            .map(|slot| slot.info.clone())
            .collect()
    }

    /// Number of minors currently taken
    pub fn registered(&self) -> usize {
        self.lock_slots().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_registered(&self, minor: u8) -> bool {
        self.index_of(minor)
            .is_some_and(|i| self.lock_slots()[i].is_some())
    }

    fn index_of(&self, minor: u8) -> Option<usize> {
        let index = minor.checked_sub(self.class.minor_base)? as usize;
        (index < self.class.minor_count as usize).then_some(index)
    }

    fn node_path(&self, name: &str) -> PathBuf {
        match &self.node_dir {
            Some(dir) => dir.join(name),
            None => Path::new(DEFAULT_DEV_DIR).join(name),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Slot>>> {
        // Slots are only mutated by single assignments, so they are consistent even
        // if a holder panicked.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Write the descriptor next to its final name, then rename it into place so readers
/// never see a partial file.
fn publish_node(dir: &Path, info: &NodeInfo) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let content = serde_json::to_vec_pretty(info)?;
    let staging = dir.join(format!(".{}.tmp", info.name));
    fs::write(&staging, content)?;
    fs::rename(&staging, &info.path).inspect_err(|_| {
        let _ = fs::remove_file(&staging);
    })
}

/// An open node; holds one reference on the device object until closed
#[derive(Debug)]
pub struct NodeHandle {
    device: DeviceRef,
    minor: u8,
}

impl NodeHandle {
    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Close the handle, releasing its reference
    pub fn close(self) {}
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        debug!("Closed minor {} ({})", self.minor, self.device.connection());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::device::DeviceTracker;
    use crate::driver::identity::USBTINY_IDENTITY;
    use common::ConnectionId;

    fn device(tracker: &DeviceTracker, address: u8) -> DeviceRef {
        IspDevice::create(tracker, ConnectionId::new(1, address), USBTINY_IDENTITY, 0).unwrap()
    }

    #[test]
    fn test_class_driver_clamped_to_minor_space() {
        let class = ClassDriver::new("usbtiny", 250, 64);
        assert_eq!(class.minor_count, 6);
        assert_eq!(ClassDriver::default().minor_count, 64);
    }

    #[test]
    fn test_register_assigns_from_base() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let dev = device(&tracker, 2);

        let node = registrar.register(&dev).unwrap();
        assert_eq!(node.minor, USBTINY_MINOR_BASE);
        assert_eq!(node.name, "usbtiny0");
        assert_eq!(node.path, PathBuf::from("/dev/usbtiny0"));
        assert_eq!(dev.minor(), Some(USBTINY_MINOR_BASE));
        assert_eq!(dev.phase(), DevicePhase::Registered);
        // Registration does not take a reference.
        assert_eq!(Arc::strong_count(&dev), 1);
    }

    #[test]
    fn test_lowest_free_minor_is_reused() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let a = device(&tracker, 2);
        let b = device(&tracker, 3);
        let c = device(&tracker, 4);

        let na = registrar.register(&a).unwrap();
        let nb = registrar.register(&b).unwrap();
        assert_eq!(nb.minor, 193);

        registrar.deregister(na.minor);
        let nc = registrar.register(&c).unwrap();
        assert_eq!(nc.minor, na.minor);
        assert_eq!(nc.name, "usbtiny0");
    }

    #[test]
    fn test_exhaustion() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::new("usbtiny", 192, 1), None);
        let a = device(&tracker, 2);
        let b = device(&tracker, 3);

        registrar.register(&a).unwrap();
        let err = registrar.register(&b).unwrap_err();
        assert!(matches!(
            err,
            DriverError::NoMinorAvailable {
                base: 192,
                count: 1
            }
        ));
        assert_eq!(b.minor(), None);
        assert_eq!(registrar.registered(), 1);
    }

    #[test]
    fn test_open_takes_reference_until_closed() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let dev = device(&tracker, 2);
        let node = registrar.register(&dev).unwrap();

        let handle = registrar.open(node.minor).unwrap();
        assert_eq!(Arc::strong_count(&dev), 2);
        assert_eq!(handle.minor(), node.minor);

        handle.close();
        assert_eq!(Arc::strong_count(&dev), 1);
    }

    #[test]
    fn test_open_after_deregister_fails() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let dev = device(&tracker, 2);
        let node = registrar.register(&dev).unwrap();

        registrar.deregister(node.minor);
        assert!(matches!(
            registrar.open(node.minor),
            Err(DriverError::NoSuchNode(192))
        ));
        assert!(matches!(registrar.open(10), Err(DriverError::NoSuchNode(10))));
    }

    #[test]
    fn test_open_after_object_dropped_fails() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let dev = device(&tracker, 2);
        let node = registrar.register(&dev).unwrap();

        drop(dev);
        assert!(registrar.open(node.minor).is_err());
    }

    #[test]
    fn test_deregister_unknown_is_ignored() {
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        registrar.deregister(192);
        registrar.deregister(3);
        assert_eq!(registrar.registered(), 0);
    }

    #[test]
    fn test_publish_and_remove_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("nodes");
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), Some(node_dir.clone()));
        let dev = device(&tracker, 5);

        let node = registrar.register(&dev).unwrap();
        assert_eq!(node.path, node_dir.join("usbtiny0"));

        let content = fs::read_to_string(&node.path).unwrap();
        let published: NodeInfo = serde_json::from_str(&content).unwrap();
        assert_eq!(published, node);

        registrar.deregister(node.minor);
        assert!(!node.path.exists());
    }

    #[test]
    fn test_publish_failure_leaves_no_registration() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the node directory should be.
        let blocker = dir.path().join("nodes");
        fs::write(&blocker, b"").unwrap();

        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), Some(blocker));
        let dev = device(&tracker, 5);

        let err = registrar.register(&dev).unwrap_err();
        assert!(matches!(err, DriverError::NodePublish { .. }));
        assert_eq!(registrar.registered(), 0);
        assert_eq!(dev.minor(), None);
        assert_eq!(dev.phase(), DevicePhase::Allocated);
    }

    #[test]
    fn test_nodes_listing() {
        let tracker = DeviceTracker::new();
        let registrar = NodeRegistrar::new(ClassDriver::default(), None);
        let a = device(&tracker, 2);
        let b = device(&tracker, 3);
        registrar.register(&a).unwrap();
        registrar.register(&b).unwrap();

        let nodes = registrar.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].connection, ConnectionId::new(1, 2));
        assert_eq!(nodes[1].minor, 193);
        assert!(registrar.is_registered(193));
        assert!(!registrar.is_registered(194));
    }
}
