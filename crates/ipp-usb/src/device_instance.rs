//! Device instance composition and its bounded initialization sequence:
//! build the transport, read/allocate its persistent state, probe its
//! capabilities, publish DNS-SD, and start the HTTP proxy that serves it.
//! Every failure path after the transport opens routes through one
//! `close()` call so a half-initialized device never leaks claimed USB
//! interfaces.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusb::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Interface, LoggingConfig, NetworkConfig};
use crate::device_state::{self, DevState};
use crate::dnssd::{DnsSdService, DnsSdTxtItem, Publisher};
use crate::error::{Error, Result};
use crate::metrics::DeviceMetrics;
use crate::probe;
use crate::proxy;
use crate::quirks::{Quirks, QuirksDb};
use crate::usb::backend;
use crate::usb::descriptors::{Capabilities, UsbAddr, UsbDeviceDesc, UsbDeviceInfo};
use crate::usb::UsbTransport;
use common::RotatingLogFile;

/// Per-request deadline armed on every round-trip, held only while a
/// channel is in use. Not the same duration as `init-timeout`, which
/// bounds the whole sequence below; this value is an implementation
/// choice (see DESIGN.md).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on any single probe so a slow device can't eat the entire
/// `init-timeout` budget on one request.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DeviceInstance {
    addr: UsbAddr,
    ident: String,
    info: UsbDeviceInfo,
    port: u16,
    transport: Arc<UsbTransport>,
    publisher: Option<Publisher>,
    persist_task: JoinHandle<()>,
    proxy_cancel: CancellationToken,
    proxy_task: JoinHandle<()>,
    device_log: Arc<RotatingLogFile>,
    metrics: Arc<DeviceMetrics>,
}

impl DeviceInstance {
    /// Build a fully running device instance for `desc`. On any failure
    /// after the transport is open, the transport is closed (resetting
    /// the device iff the failing error `requires_reset_before_retry`)
    /// before the error is returned.
    pub async fn spawn(
        context: &Context,
        desc: &UsbDeviceDesc,
        quirks_db: &QuirksDb,
        network: &NetworkConfig,
        logging: &LoggingConfig,
        state_dir: &Path,
        log_dir: &Path,
    ) -> Result<Self> {
        let start = Instant::now();
        let device = backend::find_device(context, desc.addr)?;
        let port_number = device.port_number();

        let (transport, info) =
            UsbTransport::open(&device, desc, quirks_db, port_number, DEFAULT_REQUEST_TIMEOUT)?;
        let transport = Arc::new(transport);
        let quirks = transport.quirks().clone();
        let init_timeout = quirks.init_timeout;

        match Self::init_sequence(
            desc.addr, &transport, &info, &quirks, network, logging, state_dir, log_dir, start,
            init_timeout,
        )
        .await
        {
            Ok(instance) => Ok(instance),
            Err(e) => {
                transport.close(e.requires_reset_before_retry()).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn init_sequence(
        addr: UsbAddr,
        transport: &Arc<UsbTransport>,
        info: &UsbDeviceInfo,
        quirks: &Quirks,
        network: &NetworkConfig,
        logging: &LoggingConfig,
        state_dir: &Path,
        log_dir: &Path,
        start: Instant,
        init_timeout: Duration,
    ) -> Result<Self> {
        let ident = info.ident();
        let remaining = |start: Instant| -> Result<Duration> {
            init_timeout
                .checked_sub(start.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or(Error::InitTimedOut(init_timeout))
        };

        let log_path = log_dir.join(format!("{ident}.log"));
        let device_log = Arc::new(
            RotatingLogFile::open(&log_path, logging.max_file_size, logging.max_backup_files)
                .map_err(Error::StdIo)?,
        );
        device_log.write_line(&format!(
            "initializing {} ({ident})",
            info.make_and_model()
        ));

        // Read/create device state, allocate (and persist) an HTTP port.
        let mut state = device_state::load(state_dir, &ident);
        let taken = device_state::all_claimed_ports(state_dir, &ident);
        let preferred = state
            .http_port
            .filter(|p| *p >= network.http_min_port && *p <= network.http_max_port);
        let (port, listener) =
            proxy::allocate_port(network.http_min_port, network.http_max_port, preferred, &taken)
                .ok_or_else(|| Error::Io("no free HTTP port available in configured range".into()))?;
        if state.http_port != Some(port) {
            state.http_port = Some(port);
            device_state::save(state_dir, &ident, &state)?;
        }

        // Probe IPP and eSCL, each bounded by the remaining init budget.
        let probe_timeout = remaining(start)?.min(MAX_PROBE_TIMEOUT);
        let printer_probe = probe::probe_ipp(transport, quirks, probe_timeout).await;
        let probe_timeout = remaining(start)?.min(MAX_PROBE_TIMEOUT);
        let scanner_probe = probe::probe_escl(transport, probe_timeout).await;

        let capabilities = info.capabilities;
        if !capabilities.intersects(Capabilities::PRINT | Capabilities::SCAN) {
            return Err(Error::Unusable);
        }

        let ipp_probe_empty = printer_probe.dns_sd_name.is_none()
            && printer_probe.uuid.is_none()
            && printer_probe.document_formats.is_empty();
        let ipp_partial = capabilities.contains(Capabilities::PRINT) && ipp_probe_empty;
        let escl_partial = capabilities.contains(Capabilities::SCAN) && scanner_probe.is_none();
        if (ipp_partial || escl_partial) && !quirks.init_retry_partial {
            return Err(Error::PartialInit(format!(
                "ipp_ok={} escl_ok={}",
                !ipp_partial, !escl_partial
            )));
        }
        if ipp_partial || escl_partial {
            warn!("{ident}: proceeding with partial init data (init-retry-partial=true)");
        }

        let synthesized_name = format!("IPP-USB Printer ({ident})");
        let dns_sd_name = state
            .dns_sd_override
            .clone()
            .or_else(|| printer_probe.dns_sd_name.clone())
            .unwrap_or(synthesized_name);
        let uuid = printer_probe
            .uuid
            .clone()
            .unwrap_or_else(|| synth_uuid(&ident));

        let services = assemble_services(info, &printer_probe, &scanner_probe, &uuid, port, quirks);

        // Start the DNS-SD publisher unless it's disabled in config.
        let (name_tx, mut name_rx) = mpsc::channel(1);
        let publisher = if network.dns_sd {
            let host_fqdn = "localhost.".to_string();
            let loopback_only = matches!(network.interface, Interface::Loopback);
            let candidate = state.dns_sd_override.clone().unwrap_or(dns_sd_name.clone());
            Some(Publisher::start(
                host_fqdn,
                loopback_only,
                candidate,
                services,
                name_tx,
            )?)
        } else {
            None
        };

        let persist_state_dir = state_dir.to_path_buf();
        let persist_ident = ident.clone();
        let persist_task = tokio::spawn(async move {
            if let Some(name) = name_rx.recv().await {
                let mut s = device_state::load(&persist_state_dir, &persist_ident);
                if s.dns_sd_override.as_deref() != Some(name.as_str()) {
                    s.dns_sd_override = Some(name);
                    let _ = device_state::save(&persist_state_dir, &persist_ident, &s);
                }
            }
        });

        // Start the HTTP proxy on the allocated listener.
        let proxy_cancel = CancellationToken::new();
        let device_host = format!("localhost:{port}");
        let proxy_transport = transport.clone();
        let proxy_cancel_clone = proxy_cancel.clone();
        let proxy_ident = ident.clone();
        let proxy_task = tokio::spawn(async move {
            if let Err(e) = proxy::serve(listener, proxy_transport, device_host, proxy_cancel_clone).await
            {
                warn!("proxy server for {proxy_ident} exited: {e}");
            }
        });

        info!("{ident}: device instance ready on 127.0.0.1:{port} ({})", info.make_and_model());
        device_log.write_line(&format!("listening on 127.0.0.1:{port}"));

        Ok(DeviceInstance {
            addr,
            ident,
            info: info.clone(),
            port,
            transport: transport.clone(),
            publisher,
            persist_task,
            proxy_cancel,
            proxy_task,
            device_log,
            metrics: Arc::new(DeviceMetrics::default()),
        })
    }

    pub fn addr(&self) -> UsbAddr {
        self.addr
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metrics(&self) -> &Arc<DeviceMetrics> {
        &self.metrics
    }

    /// One line of `GET /status` output on the control socket.
    pub fn status_line(&self) -> String {
        format!(
            "{} [{}] 127.0.0.1:{} {}",
            self.ident,
            self.info.make_and_model(),
            self.port,
            self.metrics.summary()
        )
    }

    /// Tears the instance down without a reset: the device is already
    /// unplugged, so there's nothing on the bus left to reset.
    pub async fn on_removed(self) {
        self.teardown(false, Duration::from_secs(5)).await;
    }

    /// Tears the instance down as part of process shutdown.
    pub async fn shutdown(self, timeout: Duration) {
        self.teardown(false, timeout).await;
    }

    async fn teardown(self, reset: bool, timeout: Duration) {
        self.proxy_cancel.cancel();
        let _ = tokio::time::timeout(timeout, self.proxy_task).await;
        if let Some(publisher) = self.publisher {
            let _ = tokio::time::timeout(timeout, publisher.unpublish()).await;
        }
        self.persist_task.abort();
        self.transport.close(reset).await;
        self.device_log.write_line("device instance shut down");
    }
}

fn assemble_services(
    info: &UsbDeviceInfo,
    printer_probe: &probe::PrinterProbe,
    scanner_probe: &Option<probe::ScannerProbe>,
    uuid: &str,
    port: u16,
    quirks: &Quirks,
) -> Vec<DnsSdService> {
    let make_and_model = info.make_and_model();
    let mut services = vec![
        DnsSdService {
            service_type: "_http._tcp".into(),
            port,
            txt: vec![],
            sub_types: vec![],
        },
        DnsSdService {
            service_type: "_printer._tcp".into(),
            port,
            txt: vec![
                txt("txtvers", "1"),
                txt("ty", &make_and_model),
            ],
            sub_types: vec![],
        },
    ];

    if info.capabilities.contains(Capabilities::PRINT) {
        let pdl = if printer_probe.document_formats.is_empty() {
            "application/pdf".to_string()
        } else {
            printer_probe.document_formats.join(",")
        };
        let mut ipp_txt = vec![
            txt("txtvers", "1"),
            txt("rp", "ipp/print"),
            txt("ty", &make_and_model),
            txt("pdl", &pdl),
            txt("UUID", uuid),
            txt("Color", &printer_probe.color_supported.to_string()),
            txt("Duplex", &printer_probe.duplex_supported.to_string()),
        ];
        if let Some(url) = &printer_probe.admin_url {
            ipp_txt.push(DnsSdTxtItem { key: "adminurl".into(), value: url.clone(), is_url: true });
        }
        if let Some(url) = &printer_probe.icon_url {
            ipp_txt.push(DnsSdTxtItem { key: "representation".into(), value: url.clone(), is_url: true });
        }
        services.push(DnsSdService {
            service_type: "_ipp._tcp".into(),
            port,
            txt: ipp_txt,
            sub_types: vec!["_print._sub._ipp._tcp".into()],
        });

        if !quirks.disable_fax && info.capabilities.contains(Capabilities::FAX) {
            services.push(DnsSdService {
                service_type: "_fax-ipp._tcp".into(),
                port,
                txt: vec![txt("txtvers", "1"), txt("rp", "ipp/faxout"), txt("UUID", uuid)],
                sub_types: vec![],
            });
        }
    }

    if info.capabilities.contains(Capabilities::SCAN) {
        if let Some(scanner) = scanner_probe {
            let pdl = if scanner.document_formats.is_empty() {
                "application/pdf".to_string()
            } else {
                scanner.document_formats.join(",")
            };
            let cs = if scanner.color_modes.is_empty() {
                "color,grayscale".to_string()
            } else {
                scanner.color_modes.join(",")
            };
            let is = match (scanner.platen_supported, scanner.adf_supported) {
                (true, true) => "platen,adf",
                (true, false) => "platen",
                (false, true) => "adf",
                (false, false) => "platen",
            };
            services.push(DnsSdService {
                service_type: "_uscan._tcp".into(),
                port,
                txt: vec![
                    txt("txtvers", "1"),
                    txt("rs", "eSCL"),
                    txt("vers", scanner.version.as_deref().unwrap_or("2.6")),
                    txt("pdl", &pdl),
                    txt("cs", &cs),
                    txt("is", is),
                    txt("duplex", &scanner.duplex_supported.to_string()),
                    txt("UUID", uuid),
                ],
                sub_types: vec![],
            });
        }
    }

    services
}

fn txt(key: &str, value: &str) -> DnsSdTxtItem {
    DnsSdTxtItem { key: key.to_string(), value: value.to_string(), is_url: false }
}

/// A stable, deterministic stand-in UUID for devices that didn't answer
/// Get-Printer-Attributes usefully. Not a real UUIDv4/v5, just a
/// fixed-shape hash-derived string unique per device ident.
fn synth_uuid(ident: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in ident.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!(
        "{:08x}-{:04x}-4{:03x}-8{:03x}-{:012x}",
        (hash >> 32) as u32,
        (hash >> 16) as u16 & 0xffff,
        hash as u16 & 0x0fff,
        (hash >> 48) as u16 & 0x0fff,
        hash & 0xffff_ffff_ffff,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synth_uuid_is_stable_and_well_formed() {
        let a = synth_uuid("0483-1234-ABC-Example");
        let b = synth_uuid("0483-1234-ABC-Example");
        let c = synth_uuid("0483-1234-XYZ-Example");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        assert_eq!(a.as_bytes()[14], b'4');
    }

    #[test]
    fn txt_item_builder_is_never_url() {
        let item = txt("txtvers", "1");
        assert!(!item.is_url);
        assert_eq!(item.key, "txtvers");
        assert_eq!(item.value, "1");
    }
}
