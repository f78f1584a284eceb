//! Bridge between the dedicated libusb event-handling thread and the Tokio
//! runtime that drives everything else.
//!
//! libusb needs a thread that calls `handle_events` (or
//! `handle_events_timeout`) in a loop for hotplug callbacks and completed
//! async transfers to be delivered at all. Per-request bulk/control I/O does
//! not go through this channel: it runs as `tokio::task::spawn_blocking`
//! calls directly against a cloned `rusb::DeviceHandle`, same as any other
//! blocking syscall wrapped for an async context. This bridge exists purely
//! to ferry hotplug arrival/removal notifications out of the libusb thread.

use async_channel::{Receiver, Sender, bounded};

/// A hotplug notification produced by the libusb event thread.
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device matching our watch filters was plugged in.
    DeviceArrived {
        bus_number: u8,
        address: u8,
        vendor_id: u16,
        product_id: u16,
    },

    /// A previously-seen device was unplugged.
    DeviceLeft { bus_number: u8, address: u8 },
}

/// Instruction sent from the async side to the libusb event thread.
#[derive(Debug)]
pub enum UsbCommand {
    /// Ask the event thread to stop calling `handle_events` and exit.
    Shutdown,
}

/// Handle held by the Tokio runtime side of the bridge.
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Ask the libusb event thread to shut down.
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send(UsbCommand::Shutdown)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next hotplug event, async.
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle held by the libusb event thread (blocking, no Tokio involved).
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Non-blocking poll for a shutdown request; called between
    /// `handle_events_timeout` ticks.
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Forward a hotplug event to the async side, blocking.
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between the Tokio runtime and the libusb event thread.
///
/// Returns `(UsbBridge for async callers, UsbWorker for the event thread)`.
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(8);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_reaches_worker() {
        let (bridge, worker) = create_usb_bridge();

        let handle = std::thread::spawn(move || {
            loop {
                if let Some(UsbCommand::Shutdown) = worker.try_recv_command() {
                    return true;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        });

        bridge.shutdown().await.unwrap();
        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn event_round_trip() {
        let (bridge, worker) = create_usb_bridge();

        worker
            .send_event(UsbEvent::DeviceArrived {
                bus_number: 1,
                address: 2,
                vendor_id: 0x03f0,
                product_id: 0x1234,
            })
            .unwrap();

        match bridge.recv_event().await.unwrap() {
            UsbEvent::DeviceArrived { vendor_id, .. } => assert_eq!(vendor_id, 0x03f0),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
