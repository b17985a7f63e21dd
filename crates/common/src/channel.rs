//! Async channel bridge between Tokio runtime and the libusb worker thread

use crate::usb_types::{ConnectionId, DeviceIdentity, NodeInfo};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Commands from Tokio runtime to the worker thread
#[derive(Debug)]
pub enum HostCommand {
    /// List nodes currently registered by the driver
    ListNodes {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<NodeInfo>>,
    },

    /// Re-enumerate the bus and reconcile arrivals/removals
    Rescan {
        /// Number of attached devices seen by the scan
        response: tokio::sync::oneshot::Sender<crate::Result<usize>>,
    },

    /// Shutdown the worker thread gracefully
    Shutdown,
}

/// Lifecycle notices raised while dispatching hot-plug events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A matching device was probed and its node registered
    Attached {
        /// Driver that claimed the connection
        driver: String,
        /// Connection the driver claimed
        connection: ConnectionId,
    },

    /// A claimed device went away and its driver was disconnected
    Detached {
        /// Driver that released the connection
        driver: String,
        /// Connection that disappeared
        connection: ConnectionId,
    },

    /// Probe failed; the device stays unusable until replugged
    AttachFailed {
        /// Driver whose probe failed
        driver: String,
        /// Connection that was offered
        connection: ConnectionId,
        /// Identity that matched the driver's table
        identity: DeviceIdentity,
        /// Negative errno returned by the probe
        errno: i32,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct HostBridge {
    cmd_tx: Sender<HostCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl HostBridge {
    /// Send a command to the worker thread
    pub async fn send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive a lifecycle event
    pub async fn recv_event(&self) -> crate::Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the worker thread (blocking)
pub struct HostWorker {
    pub(crate) cmd_rx: Receiver<HostCommand>,
    event_tx: EventSink,
}

impl HostWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<HostCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<HostCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Sink for lifecycle events, to be handed to the bus
    pub fn event_sink(&self) -> EventSink {
        self.event_tx.clone()
    }
}

/// Non-blocking sender for [`DriverEvent`]s
///
/// Hot-plug handlers must complete in bounded time, so a full or closed channel drops
/// the event instead of waiting for the consumer.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<DriverEvent>,
}

impl EventSink {
    /// Create a standalone sink and the receiver draining it
    pub fn new(capacity: usize) -> (Self, Receiver<DriverEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event; returns false if it was dropped
    pub fn emit(&self, event: DriverEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Create the channel bridge between Tokio and the worker thread
///
/// Returns (HostBridge for Tokio, HostWorker for the worker thread)
pub fn create_host_bridge() -> (HostBridge, HostWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = EventSink::new(256);

    (
        HostBridge { cmd_tx, event_rx },
        HostWorker { cmd_rx, event_tx },
    )
}
