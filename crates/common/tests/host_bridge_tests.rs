//! Host bridge integration tests
//!
//! Tests for the channel bridge between the Tokio runtime and the libusb worker thread.
//!
//! # Test Scenarios
//! - Command/response flow across the thread boundary
//! - Lifecycle events raised from the worker side
//! - Shutdown and channel closure
//! - Event backpressure never blocking the worker
//!
//! Run with: `cargo test -p common --test host_bridge_tests`

use common::{
    ConnectionId, DeviceIdentity, DriverEvent, HostCommand, NodeInfo, create_host_bridge,
};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

fn node(minor: u8) -> NodeInfo {
    NodeInfo {
        name: format!("usbtiny{}", minor - 192),
        minor,
        path: PathBuf::from(format!("/dev/usbtiny{}", minor - 192)),
        connection: ConnectionId::new(1, minor - 180),
        identity: DeviceIdentity::new(0x1781, 0x0c9f),
    }
}

fn attached(address: u8) -> DriverEvent {
    DriverEvent::Attached {
        driver: "USBTinyISP".to_string(),
        connection: ConnectionId::new(1, address),
    }
}

// ============================================================================
// Command flow
// ============================================================================

#[tokio::test]
async fn test_list_nodes_round_trip() {
    let (bridge, worker) = create_host_bridge();

    let handle = thread::spawn(move || {
        if let Ok(HostCommand::ListNodes { response }) = worker.recv_command() {
            let _ = response.send(vec![node(192), node(193)]);
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(HostCommand::ListNodes { response: tx })
        .await
        .expect("Failed to send command");

    let nodes = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("Timed out waiting for response")
        .expect("Response dropped");

    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name, "usbtiny0");
    assert_eq!(nodes[1].minor, 193);
    handle.join().unwrap();
}

#[tokio::test]
async fn test_rescan_error_is_reported() {
    let (bridge, worker) = create_host_bridge();

    let handle = thread::spawn(move || {
        if let Ok(HostCommand::Rescan { response }) = worker.recv_command() {
            let _ = response.send(Err(common::Error::Usb("Access denied".to_string())));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(HostCommand::Rescan { response: tx })
        .await
        .unwrap();

    let result = rx.await.unwrap();
    assert!(matches!(result, Err(common::Error::Usb(msg)) if msg.contains("denied")));
    handle.join().unwrap();
}

#[tokio::test]
async fn test_worker_loop_until_shutdown() {
    let (bridge, worker) = create_host_bridge();

    let handle = thread::spawn(move || {
        let mut served = 0;
        while let Ok(cmd) = worker.recv_command() {
            match cmd {
                HostCommand::ListNodes { response } => {
                    let _ = response.send(Vec::new());
                    served += 1;
                }
                HostCommand::Rescan { response } => {
                    let _ = response.send(Ok(0));
                    served += 1;
                }
                HostCommand::Shutdown => break,
            }
        }
        served
    });

    for _ in 0..5 {
        let (tx, rx) = oneshot::channel();
        bridge
            .send_command(HostCommand::ListNodes { response: tx })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_empty());
    }
    bridge.send_command(HostCommand::Shutdown).await.unwrap();

    assert_eq!(handle.join().unwrap(), 5);
}

#[tokio::test]
async fn test_send_fails_once_worker_is_gone() {
    let (bridge, worker) = create_host_bridge();
    drop(worker);

    let result = bridge.send_command(HostCommand::Shutdown).await;
    assert!(matches!(result, Err(common::Error::Channel(_))));
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, worker) = create_host_bridge();
    let sink = worker.event_sink();

    let handle = thread::spawn(move || {
        assert!(sink.emit(attached(4)));
        assert!(sink.emit(DriverEvent::AttachFailed {
            driver: "USBTinyISP".to_string(),
            connection: ConnectionId::new(1, 5),
            identity: DeviceIdentity::new(0x1781, 0x0c9f),
            errno: -54,
        }));
        assert!(sink.emit(DriverEvent::Detached {
            driver: "USBTinyISP".to_string(),
            connection: ConnectionId::new(1, 4),
        }));
    });
    handle.join().unwrap();

    assert_eq!(bridge.recv_event().await.unwrap(), attached(4));
    assert!(matches!(
        bridge.recv_event().await.unwrap(),
        DriverEvent::AttachFailed { errno: -54, .. }
    ));
    assert!(matches!(
        bridge.recv_event().await.unwrap(),
        DriverEvent::Detached { .. }
    ));
}

#[tokio::test]
async fn test_event_stream_ends_with_worker() {
    let (bridge, worker) = create_host_bridge();
    let sink = worker.event_sink();
    sink.emit(attached(2));
    drop(sink);
    drop(worker);

    assert_eq!(bridge.recv_event().await.unwrap(), attached(2));
    assert!(bridge.recv_event().await.is_err());
}

#[test]
fn test_full_event_channel_does_not_block() {
    let (_bridge, worker) = create_host_bridge();
    let sink = worker.event_sink();

    let handle = thread::spawn(move || {
        let mut accepted = 0;
        for i in 0..1000u32 {
            if sink.emit(attached((i % 200) as u8)) {
                accepted += 1;
            }
        }
        accepted
    });

    // Returns promptly even though nobody drains the channel.
    let accepted = handle.join().unwrap();
    assert_eq!(accepted, 256);
}
