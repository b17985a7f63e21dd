//! Per-attachment device object
//!
//! One [`IspDevice`] exists per live physical connection. It is shared as a
//! [`DeviceRef`] (`Arc<IspDevice>`): the controller's association holds one reference
//! and each open node handle holds another. The object is destroyed when the last
//! reference is dropped, on whichever thread dropped it.

use crate::error::{DriverError, Result};
use common::{ConnectionId, DeviceIdentity};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::debug;

/// Shared, reference-counted handle to a device object
pub type DeviceRef = Arc<IspDevice>;

/// Where a device object is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DevicePhase {
    /// Created, no node yet
    Allocated = 0,
    /// Node assigned
    Registered = 1,
    /// Associated with its connection and reachable from user space
    Active = 2,
    /// Detach in progress, node reclaimed
    Unregistering = 3,
}

impl DevicePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DevicePhase::Allocated,
            1 => DevicePhase::Registered,
            2 => DevicePhase::Active,
            3 => DevicePhase::Unregistering,
            _ => unreachable!("invalid device phase {}", v),
        }
    }
}

/// Vendor control-transfer protocol for the programmer
///
/// The lifecycle core never drives the target chip itself; an implementation of this
/// trait is attached to a device object by whoever owns the programming protocol.
pub trait ControlProtocol: Send + Sync {
    /// Power the target and enter programming mode
    fn power_on(&self, device: &IspDevice) -> Result<()>;

    /// Release the target
    fn power_off(&self, device: &IspDevice) -> Result<()>;
}

/// Counts device objects that have not yet been destroyed
///
/// Every object created through a tracker holds a guard that is released in `Drop`,
/// so `live()` reaching zero proves nothing leaked.
#[derive(Debug, Clone, Default)]
pub struct DeviceTracker {
    inner: Arc<TrackerCounts>,
}

#[derive(Debug, Default)]
struct TrackerCounts {
    live: AtomicUsize,
    created: AtomicU64,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects currently alive
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Objects ever created
    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::Acquire)
    }

    fn enter(&self) -> (TrackerGuard, u64) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let instance = self.inner.created.fetch_add(1, Ordering::AcqRel) + 1;
        (
            TrackerGuard {
                counts: Arc::clone(&self.inner),
            },
            instance,
        )
    }
}

#[derive(Debug)]
struct TrackerGuard {
    counts: Arc<TrackerCounts>,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.counts.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Device object for one attached USBtinyISP
pub struct IspDevice {
    instance: u64,
    connection: ConnectionId,
    identity: DeviceIdentity,
    phase: AtomicU8,
    minor: OnceLock<u8>,
    /// Scratch space for control transfers, reserved at creation
    control: Mutex<Vec<u8>>,
    protocol: OnceLock<Box<dyn ControlProtocol>>,
    _guard: TrackerGuard,
}

impl IspDevice {
    /// Allocate a device object with a single reference
    ///
    /// Fails with [`DriverError::OutOfMemory`] if the control buffer cannot be
    /// reserved; nothing is left allocated in that case.
    pub fn create(
        tracker: &DeviceTracker,
        connection: ConnectionId,
        identity: DeviceIdentity,
        control_buffer_size: usize,
    ) -> Result<DeviceRef> {
        let mut control = Vec::new();
        control
            .try_reserve_exact(control_buffer_size)
            .map_err(|_| DriverError::OutOfMemory)?;

        let (guard, instance) = tracker.enter();

        debug!(
            "Created device object #{} for {} ({})",
            instance, connection, identity
        );

        Ok(Arc::new(Self {
            instance,
            connection,
            identity,
            phase: AtomicU8::new(DevicePhase::Allocated as u8),
            minor: OnceLock::new(),
            control: Mutex::new(control),
            protocol: OnceLock::new(),
            _guard: guard,
        }))
    }

    /// Tracker-unique instance number; a replug yields a new one
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn phase(&self) -> DevicePhase {
        DevicePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: DevicePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Minor assigned at registration, if any
    pub fn minor(&self) -> Option<u8> {
        self.minor.get().copied()
    }

    pub(crate) fn assign_minor(&self, minor: u8) {
        let assigned = self.minor.set(minor).is_ok();
        debug_assert!(assigned, "device object registered twice");
    }

    /// Reserved control-transfer buffer capacity
    pub fn control_capacity(&self) -> usize {
        self.control_buffer().capacity()
    }

    /// Exclusive access to the control-transfer scratch buffer
    pub fn control_buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        // Buffer contents carry no invariant, so a poisoned lock is still usable.
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the programming protocol; only the first install wins
    pub fn install_protocol(&self, protocol: Box<dyn ControlProtocol>) -> bool {
        self.protocol.set(protocol).is_ok()
    }

    pub fn protocol(&self) -> Option<&dyn ControlProtocol> {
        self.protocol.get().map(|p| p.as_ref())
    }
}

impl std::fmt::Debug for IspDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IspDevice")
            .field("instance", &self.instance)
            .field("connection", &self.connection)
            .field("identity", &self.identity)
            .field("phase", &self.phase())
            .field("minor", &self.minor())
            .field("protocol", &self.protocol.get().is_some())
            .finish()
    }
}

impl Drop for IspDevice {
    fn drop(&mut self) {
        debug!(
            "Released device object #{} for {}",
            self.instance, self.connection
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::identity::USBTINY_IDENTITY;
    use std::sync::atomic::AtomicUsize;

    fn create(tracker: &DeviceTracker) -> DeviceRef {
        IspDevice::create(tracker, ConnectionId::new(1, 4), USBTINY_IDENTITY, 64).unwrap()
    }

    #[test]
    fn test_create_starts_with_one_reference() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);

        assert_eq!(Arc::strong_count(&dev), 1);
        assert_eq!(dev.phase(), DevicePhase::Allocated);
        assert_eq!(dev.minor(), None);
        assert!(dev.control_capacity() >= 64);
        assert_eq!(tracker.live(), 1);
    }

    #[test]
    fn test_release_last_reference_destroys() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);
        let extra = Arc::clone(&dev);
        assert_eq!(Arc::strong_count(&dev), 2);

        drop(dev);
        assert_eq!(tracker.live(), 1);
        assert_eq!(Arc::strong_count(&extra), 1);

        drop(extra);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.created(), 1);
    }

    #[test]
    fn test_create_out_of_memory() {
        let tracker = DeviceTracker::new();
        let result = IspDevice::create(&tracker, ConnectionId::new(1, 4), USBTINY_IDENTITY, usize::MAX);

        assert!(matches!(result, Err(DriverError::OutOfMemory)));
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.created(), 0);
    }

    #[test]
    fn test_concurrent_release_destroys_once() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&dev);
                std::thread::spawn(move || drop(r))
            })
            .collect();
        drop(dev);
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_instances_are_distinct() {
        let tracker = DeviceTracker::new();
        let a = create(&tracker);
        let first = a.instance();
        drop(a);
        let b = create(&tracker);
        assert_ne!(first, b.instance());
    }

    #[test]
    fn test_minor_assigned_once() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);
        dev.assign_minor(192);
        assert_eq!(dev.minor(), Some(192));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registered twice")]
    fn test_second_minor_assignment_panics() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);
        dev.assign_minor(192);
        dev.assign_minor(193);
    }

    #[test]
    fn test_phase_transitions_are_stored() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);
        for phase in [
            DevicePhase::Registered,
            DevicePhase::Active,
            DevicePhase::Unregistering,
            DevicePhase::Allocated,
        ] {
            dev.set_phase(phase);
            assert_eq!(dev.phase(), phase);
        }
    }

    #[test]
    #[should_panic(expected = "invalid device phase")]
    fn test_unknown_phase_byte_panics() {
        DevicePhase::from_u8(4);
    }

    struct CountingProtocol {
        calls: Arc<AtomicUsize>,
    }

    impl ControlProtocol for CountingProtocol {
        fn power_on(&self, device: &IspDevice) -> Result<()> {
            device.control_buffer().extend_from_slice(&[0x01]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn power_off(&self, _device: &IspDevice) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_protocol_extension_point() {
        let tracker = DeviceTracker::new();
        let dev = create(&tracker);
        assert!(dev.protocol().is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        assert!(dev.install_protocol(Box::new(CountingProtocol {
            calls: Arc::clone(&calls)
        })));
        assert!(!dev.install_protocol(Box::new(CountingProtocol {
            calls: Arc::clone(&calls)
        })));

        let protocol = dev.protocol().unwrap();
        protocol.power_on(&dev).unwrap();
        protocol.power_off(&dev).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dev.control_buffer().as_slice(), &[0x01]);
    }
}
