//! The per-device open sequence: kernel driver detach/reattach, claiming
//! only the IPP-USB interfaces (honoring `usb-max-interfaces`), with the
//! quirk-driven reset and soft-reset handshake.

use std::sync::Arc;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle};

use crate::error::{Error, Result};
use crate::quirks::{HwId, Quirks, QuirksDb, ResetMethod};
use crate::usb::descriptors::{Capabilities, UsbDeviceDesc, UsbDeviceInfo, UsbIfAddr, parse_capabilities};

const SET_CONFIGURATION_SETTLE: Duration = Duration::from_millis(250);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Class-specific soft reset request, issued once per claimed interface.
const SOFT_RESET_REQUEST: u8 = 2;
const SOFT_RESET_REQUEST_TYPE_OUT: u8 = 0x21;
const SOFT_RESET_REQUEST_TYPE_IN: u8 = 0xA2;

pub struct OpenedDevice {
    pub handle: Arc<DeviceHandle<Context>>,
    pub info: UsbDeviceInfo,
    pub quirks: Quirks,
    /// Channels claimed and ready to wrap as `usbConn`s, in pool order.
    pub channels: Vec<UsbIfAddr>,
    pub did_hard_reset: bool,
}

/// Run the open sequence against `desc`. `port_number` comes from the
/// enumeration pass since rusb exposes it on `Device`, not in our
/// descriptor snapshot.
pub fn open(
    device: &Device<Context>,
    desc: &UsbDeviceDesc,
    quirks_db: &QuirksDb,
    port_number: u8,
) -> Result<OpenedDevice> {
    let handle = device.open()?;

    let hwid = HwId {
        vendor_id: desc.vendor_id,
        product_id: desc.product_id,
    };

    let mut quirks = quirks_db.resolve_by_hwid(hwid);
    if quirks.blacklist {
        return Err(Error::Blacklisted(format!("{:04x}:{:04x}", hwid.vendor_id, hwid.product_id)));
    }

    let mut did_hard_reset = false;
    if quirks.init_reset == ResetMethod::Hard {
        handle.reset()?;
        did_hard_reset = true;
    }

    let strings = read_device_strings(device, &handle);
    let strings = match strings {
        Some(s) if !s.0.is_empty() && !s.1.is_empty() && !s.2.is_empty() => s,
        _ if !did_hard_reset => {
            handle.reset()?;
            did_hard_reset = true;
            read_device_strings(device, &handle)
                .filter(|s| !s.0.is_empty() && !s.1.is_empty() && !s.2.is_empty())
                .ok_or_else(|| Error::Io("missing manufacturer/product/serial string descriptors after reset".into()))?
        }
        _ => {
            return Err(Error::Io(
                "missing manufacturer/product/serial string descriptors".into(),
            ));
        }
    };
    let (manufacturer, product, serial_number) = strings;

    let capabilities = read_capabilities(device, desc);

    let info = UsbDeviceInfo {
        vendor_id: desc.vendor_id,
        product_id: desc.product_id,
        manufacturer,
        product,
        serial_number,
        usb_port_number: port_number,
        capabilities,
    };

    quirks = quirks_db.resolve(hwid, &info.make_and_model());
    if quirks.blacklist {
        return Err(Error::Blacklisted(info.make_and_model()));
    }
    if quirks.init_reset == ResetMethod::Hard && !did_hard_reset {
        handle.reset()?;
        did_hard_reset = true;
    }

    detach_kernel_drivers_and_select_config(&handle, desc)?;

    let max_interfaces = if quirks.usb_max_interfaces == 0 {
        desc.ipp_usb_interfaces.len()
    } else {
        (quirks.usb_max_interfaces as usize).min(desc.ipp_usb_interfaces.len())
    };

    let mut channels = Vec::with_capacity(max_interfaces);
    for if_addr in desc.ipp_usb_interfaces.iter().take(max_interfaces) {
        handle.claim_interface(if_addr.interface_number)?;
        if if_addr.alt_setting != 0 {
            handle.set_alternate_setting(if_addr.interface_number, if_addr.alt_setting)?;
        }
        if quirks.init_reset == ResetMethod::Soft {
            soft_reset(&handle, if_addr.interface_number);
        }
        channels.push(*if_addr);
    }

    Ok(OpenedDevice {
        handle: Arc::new(handle),
        info,
        quirks,
        channels,
        did_hard_reset,
    })
}

fn detach_kernel_drivers_and_select_config(
    handle: &DeviceHandle<Context>,
    desc: &UsbDeviceDesc,
) -> Result<()> {
    for iface in desc.all_interfaces.iter().map(|i| i.interface_number) {
        match handle.kernel_driver_active(iface) {
            Ok(true) => {
                if let Err(e) = handle.detach_kernel_driver(iface) {
                    tracing::debug!("could not detach kernel driver on interface {iface}: {e}");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("kernel_driver_active unsupported on interface {iface}: {e}"),
        }
    }
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.set_active_configuration(desc.config_number)?;
    std::thread::sleep(SET_CONFIGURATION_SETTLE);
    Ok(())
}

fn soft_reset(handle: &DeviceHandle<Context>, interface_number: u8) {
    let index = interface_number as u16;
    if let Err(e) = handle.write_control(
        SOFT_RESET_REQUEST_TYPE_OUT,
        SOFT_RESET_REQUEST,
        0,
        index,
        &[],
        CONTROL_TIMEOUT,
    ) {
        tracing::debug!("soft reset (out) on interface {interface_number} failed: {e}");
    }
    let mut status = [0u8; 1];
    if let Err(e) = handle.read_control(
        SOFT_RESET_REQUEST_TYPE_IN,
        SOFT_RESET_REQUEST,
        0,
        index,
        &mut status,
        CONTROL_TIMEOUT,
    ) {
        tracing::debug!("soft reset (in) on interface {interface_number} failed: {e}");
    }
}

fn read_device_strings(
    device: &Device<Context>,
    handle: &DeviceHandle<Context>,
) -> Option<(String, String, String)> {
    let desc = device.device_descriptor().ok()?;
    let manufacturer = desc
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        .unwrap_or_default();
    let product = desc
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        .unwrap_or_default();
    let serial_number = desc
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        .unwrap_or_default();
    Some((manufacturer, product, serial_number))
}

fn read_capabilities(device: &Device<Context>, desc: &UsbDeviceDesc) -> Capabilities {
    let Ok(config) = device.active_config_descriptor() else {
        return Capabilities::empty();
    };
    for interface in config.interfaces() {
        for if_desc in interface.descriptors() {
            if if_desc.interface_number() == desc.ipp_usb_interfaces[0].interface_number {
                return parse_capabilities(if_desc.extra());
            }
        }
    }
    Capabilities::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_interfaces_caps_channel_count() {
        // usb-max-interfaces = 0 means "unbounded", exercised indirectly
        // through quirks.rs's own default-value test; this just documents
        // the min() relationship used above.
        let available = 4usize;
        let quirk_cap = 2usize;
        assert_eq!(available.min(quirk_cap), 2);
    }
}
