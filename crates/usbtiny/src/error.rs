//! Driver error types

use common::ConnectionId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the attach path and by driver/module registration
#[derive(Debug, Error)]
pub enum DriverError {
    /// Device object storage could not be allocated
    #[error("Out of memory")]
    OutOfMemory,

    /// Every minor in the reserved range is in use
    #[error("No minor available (base {base}, {count} minors)")]
    NoMinorAvailable { base: u8, count: u16 },

    /// The node descriptor could not be written
    #[error("Failed to publish node at {}: {source}", .path.display())]
    NodePublish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The connection already has a device object
    #[error("Connection {0} is already bound")]
    AlreadyBound(ConnectionId),

    /// No live node at this minor
    #[error("No node registered at minor {0}")]
    NoSuchNode(u8),

    /// The bus already knows a driver by this name
    #[error("Driver '{0}' is already registered")]
    DriverAlreadyRegistered(String),

    /// Module init was called twice
    #[error("Module is already loaded")]
    AlreadyLoaded,

    /// Module exit was called without a matching init
    #[error("Module is not loaded")]
    NotLoaded,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;
const ENODEV: i32 = 19;
const EXFULL: i32 = 54;

impl DriverError {
    /// Negative errno reported to the bus, kernel style
    pub fn errno(&self) -> i32 {
        -match self {
            DriverError::OutOfMemory => ENOMEM,
            DriverError::NoMinorAvailable { .. } => EXFULL,
            DriverError::NodePublish { .. } => EIO,
            DriverError::AlreadyBound(_) => EBUSY,
            DriverError::NoSuchNode(_) => ENODEV,
            DriverError::DriverAlreadyRegistered(_) => EBUSY,
            DriverError::AlreadyLoaded => EEXIST,
            DriverError::NotLoaded => ENOENT,
            DriverError::Usb(_) => EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
