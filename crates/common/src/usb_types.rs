//! USB identity and attachment types shared by the driver and the daemon

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Vendor/product pair a driver claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Empty entry terminating an id table
    pub const SENTINEL: DeviceIdentity = DeviceIdentity::new(0, 0);

    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub const fn is_sentinel(&self) -> bool {
        self.vendor_id == 0 && self.product_id == 0
    }

    /// Parse an exact `0xVVVV:0xPPPP` identity
    ///
    /// Wildcards are not accepted; an id table only holds exact matches.
    pub fn parse(s: &str) -> Option<Self> {
        let (vid, pid) = s.split_once(':')?;
        Some(Self::new(parse_hex_u16(vid)?, parse_hex_u16(pid)?))
    }
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))?;
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// One physical attachment as seen by the host (bus number, device address)
///
/// libusb reuses addresses only after the previous device on that address is gone,
/// so the pair is unique among live attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    pub bus: u8,
    pub address: u8,
}

impl ConnectionId {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{:03}", self.bus, self.address)
    }
}

/// A registered node as exposed to user space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name, e.g. `usbtiny0`
    pub name: String,
    /// Minor number drawn from the driver's reserved range
    pub minor: u8,
    /// Where user space finds the node
    pub path: PathBuf,
    pub connection: ConnectionId,
    pub identity: DeviceIdentity,
}
