//! The PnP controller: the single task that owns every live device
//! instance and reconciles them against what's actually plugged in, via a
//! hotplug-diff loop (enumerate, diff against the previous address set,
//! act on added/removed) under a retry and permanent-blacklist policy.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rusb::Context;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{info, warn};

use crate::config::{LoggingConfig, NetworkConfig};
use crate::ctrl::StatusHandle;
use crate::device_instance::DeviceInstance;
use crate::quirks::QuirksDb;
use crate::usb::backend;
use crate::usb::descriptors::{UsbAddr, UsbDeviceDesc};
use common::UsbBridge;

/// How long to wait before retrying a transient init failure. An
/// implementation choice, recorded in DESIGN.md.
const DEV_INIT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Stand-in for "retry in ~1 000 000 h": a permanently-failed device is
/// never retried in any process lifetime.
const PERMANENT_RETRY_INTERVAL: Duration = Duration::from_secs(1_000_000 * 3600);

/// Bound on the fan-out shutdown at process exit.
const DEV_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub enum ExitReason {
    Signal,
    Idle,
}

struct RetryState {
    desc: UsbDeviceDesc,
    next_attempt: Instant,
    permanent: bool,
}

pub struct PnpController {
    context: Context,
    bridge: UsbBridge,
    quirks_db: QuirksDb,
    network: NetworkConfig,
    logging: LoggingConfig,
    state_dir: PathBuf,
    log_dir: PathBuf,
    exit_when_idle: bool,
    status: StatusHandle,
    devices: HashMap<UsbAddr, DeviceInstance>,
    retries: HashMap<UsbAddr, RetryState>,
}

impl PnpController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Context,
        bridge: UsbBridge,
        quirks_db: QuirksDb,
        network: NetworkConfig,
        logging: LoggingConfig,
        state_dir: PathBuf,
        log_dir: PathBuf,
        exit_when_idle: bool,
        status: StatusHandle,
    ) -> Self {
        PnpController {
            context,
            bridge,
            quirks_db,
            network,
            logging,
            state_dir,
            log_dir,
            exit_when_idle,
            status,
            devices: HashMap::new(),
            retries: HashMap::new(),
        }
    }

    /// Refreshes the shared snapshot the control socket serves.
    fn refresh_status(&self) {
        let lines = self.devices.values().map(DeviceInstance::status_line).collect();
        if let Ok(mut guard) = self.status.lock() {
            *guard = lines;
        }
    }

    /// Runs the reconcile loop until a shutdown signal arrives or (when
    /// `exit_when_idle`) no devices remain, tearing every live Device
    /// instance down before returning.
    pub async fn run(mut self) -> ExitReason {
        self.reconcile().await;

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sighup = signal(SignalKind::hangup()).ok();
        let mut ticker = tokio::time::interval(DEV_INIT_RETRY_INTERVAL / 4);
        ticker.tick().await; // first tick fires immediately; consume it

        let reason = loop {
            if self.exit_when_idle && self.devices.is_empty() && self.retries.is_empty() {
                info!("no IPP-USB devices present, exiting");
                break ExitReason::Idle;
            }

            tokio::select! {
                event = self.bridge.recv_event() => {
                    match event {
                        Ok(_) => self.reconcile().await,
                        Err(e) => {
                            warn!("USB hotplug bridge closed: {e}");
                            break ExitReason::Idle;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.retries.is_empty() {
                        self.retry_due().await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break ExitReason::Signal;
                }
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, shutting down");
                    break ExitReason::Signal;
                }
                _ = recv_signal(&mut sighup) => {
                    info!("received SIGHUP, shutting down");
                    break ExitReason::Signal;
                }
            }
        };

        self.shutdown_all().await;
        reason
    }

    async fn reconcile(&mut self) {
        let enumerated = match backend::enumerate_ipp_usb_devices(&self.context) {
            Ok(v) => v,
            Err(e) => {
                warn!("USB enumeration failed: {e}");
                return;
            }
        };
        let current: HashSet<UsbAddr> = enumerated.iter().map(|d| d.addr).collect();

        let removed: Vec<UsbAddr> =
            self.devices.keys().copied().filter(|a| !current.contains(a)).collect();
        for addr in removed {
            if let Some(instance) = self.devices.remove(&addr) {
                info!("{addr}: device removed");
                instance.on_removed().await;
            }
        }
        self.retries.retain(|addr, _| current.contains(addr));

        let added: Vec<UsbDeviceDesc> = enumerated
            .into_iter()
            .filter(|d| !self.devices.contains_key(&d.addr) && !self.retries.contains_key(&d.addr))
            .collect();

        for desc in added {
            self.try_init(desc).await;
        }
        self.refresh_status();
    }

    async fn try_init(&mut self, desc: UsbDeviceDesc) {
        let addr = desc.addr;
        match DeviceInstance::spawn(
            &self.context,
            &desc,
            &self.quirks_db,
            &self.network,
            &self.logging,
            &self.state_dir,
            &self.log_dir,
        )
        .await
        {
            Ok(instance) => {
                info!("{addr}: device instance initialized ({})", instance.ident());
                self.devices.insert(addr, instance);
            }
            Err(e) if e.is_permanent() => {
                warn!("{addr}: permanent init failure, will not retry: {e}");
                self.retries.insert(
                    addr,
                    RetryState { desc, next_attempt: Instant::now() + PERMANENT_RETRY_INTERVAL, permanent: true },
                );
            }
            Err(e) => {
                warn!("{addr}: init failed, retrying in {DEV_INIT_RETRY_INTERVAL:?}: {e}");
                if e.requires_reset_before_retry() {
                    self.force_reset(addr);
                }
                self.retries.insert(
                    addr,
                    RetryState { desc, next_attempt: Instant::now() + DEV_INIT_RETRY_INTERVAL, permanent: false },
                );
            }
        }
    }

    /// Forces a hard reset on a device that isn't held by any transport
    /// right now, used when the previous attempt's failure demands a reset
    /// before the next try.
    fn force_reset(&self, addr: UsbAddr) {
        let Ok(device) = backend::find_device(&self.context, addr) else { return };
        let Ok(handle) = device.open() else { return };
        if let Err(e) = handle.reset() {
            warn!("{addr}: pre-retry reset failed: {e}");
        }
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let due: Vec<UsbAddr> = self
            .retries
            .iter()
            .filter(|(_, r)| !r.permanent && r.next_attempt <= now)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in due {
            if let Some(state) = self.retries.remove(&addr) {
                self.try_init(state.desc).await;
            }
        }
        self.refresh_status();
    }

    async fn shutdown_all(&mut self) {
        let devices: Vec<DeviceInstance> = self.devices.drain().map(|(_, d)| d).collect();
        let handles: Vec<_> = devices
            .into_iter()
            .map(|d| tokio::spawn(d.shutdown(DEV_SHUTDOWN_TIMEOUT)))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.refresh_status();
        if let Err(e) = self.bridge.shutdown().await {
            warn!("failed to stop USB hotplug thread: {e}");
        }
    }
}

async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_retry_interval_dwarfs_transient_one() {
        assert!(PERMANENT_RETRY_INTERVAL > DEV_INIT_RETRY_INTERVAL * 1000);
    }
}
