//! Enumeration: turning `rusb` descriptors into [`UsbDeviceDesc`]. Walks
//! `context.devices()` and keeps only devices exposing at least one
//! IPP-USB bulk-endpoint-pair interface.

use rusb::{Context, Device, TransferType as RusbTransferType, UsbContext};

use crate::error::{Error, Result};
use crate::usb::descriptors::{
    InterfaceDescriptorInfo, UsbAddr, UsbDeviceDesc, UsbIfAddr, is_ipp_usb_interface,
};

/// Re-locate the live `rusb::Device` for a previously-enumerated `UsbAddr`.
///
/// `UsbDeviceDesc` only stores the lightweight address, not the `Device`
/// handle itself (that would pin a libusb device list alive for no reason);
/// the PnP controller re-resolves it at the point it actually needs to open
/// the device.
pub fn find_device(context: &Context, addr: UsbAddr) -> Result<Device<Context>> {
    let devices = context.devices()?;
    devices
        .iter()
        .find(|d| d.bus_number() as u16 == addr.bus && d.address() as u16 == addr.address)
        .ok_or_else(|| Error::Io(format!("device {addr} no longer present")))
}

pub fn enumerate_ipp_usb_devices(context: &Context) -> Result<Vec<UsbDeviceDesc>> {
    let devices = context.devices()?;
    let mut found = Vec::new();

    for device in devices.iter() {
        match describe_device(&device) {
            Ok(desc) if desc.is_ipp_usb_capable() => found.push(desc),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    "skipping device bus={} addr={}: {e}",
                    device.bus_number(),
                    device.address()
                );
            }
        }
    }

    Ok(found)
}

pub fn describe_device(device: &Device<Context>) -> Result<UsbDeviceDesc> {
    let addr = UsbAddr {
        bus: device.bus_number() as u16,
        address: device.address() as u16,
    };
    let device_desc = device.device_descriptor()?;
    let vendor_id = device_desc.vendor_id();
    let product_id = device_desc.product_id();

    let config = device
        .active_config_descriptor()
        .map_err(|e| Error::Io(format!("no active config descriptor: {e}")))?;
    let config_number = config.number();

    let mut all_interfaces = Vec::new();
    let mut ipp_usb_interfaces = Vec::new();

    for interface in config.interfaces() {
        for if_desc in interface.descriptors() {
            let info = InterfaceDescriptorInfo {
                interface_number: if_desc.interface_number(),
                alt_setting: if_desc.setting_number(),
                class: if_desc.class_code(),
                subclass: if_desc.sub_class_code(),
                protocol: if_desc.protocol_code(),
            };
            all_interfaces.push(info);

            if !is_ipp_usb_interface(vendor_id, info.class, info.subclass, info.protocol) {
                continue;
            }

            let mut in_endpoint = None;
            let mut out_endpoint = None;
            for ep in if_desc.endpoint_descriptors() {
                if ep.transfer_type() != RusbTransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    rusb::Direction::In => in_endpoint.get_or_insert(ep.address()),
                    rusb::Direction::Out => out_endpoint.get_or_insert(ep.address()),
                };
            }

            if let (Some(in_endpoint), Some(out_endpoint)) = (in_endpoint, out_endpoint) {
                ipp_usb_interfaces.push(UsbIfAddr {
                    addr,
                    interface_number: info.interface_number,
                    alt_setting: info.alt_setting,
                    in_endpoint,
                    out_endpoint,
                });
            }
        }
    }

    Ok(UsbDeviceDesc {
        addr,
        vendor_id,
        product_id,
        config_number,
        ipp_usb_interfaces,
        all_interfaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::descriptors::Capabilities;

    // describe_device/enumerate_ipp_usb_devices need real hardware (or a
    // mock libusb backend) to exercise; covered at the descriptor-matching
    // level by usb::descriptors's own tests. This just pins the bitflag
    // that None-yet-discovered capability state compares as expected.
    #[test]
    fn empty_capabilities_is_default() {
        assert_eq!(Capabilities::empty().bits(), 0);
    }
}
