//! USBtinyISP attach/detach lifecycle
//!
//! Recognizes the USBtinyISP programmer on the USB bus, keeps one reference-counted
//! device object per attachment, and exposes each as a numbered `usbtiny<N>` node.
//!
//! - [`bus`]: driver registration and hot-plug dispatch
//! - [`driver`]: identity filter, device object, node registrar, lifecycle, module
//! - [`usb`]: libusb host adapter and worker thread
//! - [`config`]: daemon configuration

pub mod bus;
pub mod config;
pub mod driver;
pub mod error;
pub mod usb;

pub use bus::{ProbeOutcome, UsbBus, UsbDriver};
pub use driver::{BindState, DriverModule, USBTINY_MODULE, UsbTinyDriver};
pub use error::{DriverError, Result};
