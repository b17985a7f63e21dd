//! Common utilities for usbtiny-hotplug
//!
//! Shared USB identity types, error handling, logging setup, and the async channel
//! bridge between the Tokio runtime and the libusb worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{DriverEvent, EventSink, HostBridge, HostCommand, HostWorker, create_host_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{ConnectionId, DeviceIdentity, NodeInfo};
