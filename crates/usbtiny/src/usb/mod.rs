//! USB subsystem
//!
//! Bridges libusb to the in-process bus: the host adapter turns hot-plug
//! notifications into arrivals and removals, and the worker runs the libusb event
//! loop on a dedicated thread so the Tokio runtime never blocks on it.

pub mod host;
pub mod worker;

pub use host::{UsbHost, enumerate};
pub use worker::{HostWorkerThread, spawn_host_worker};
