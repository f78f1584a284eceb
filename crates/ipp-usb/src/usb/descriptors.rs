//! USB addressing and descriptor data model: caches a `Device`'s
//! descriptor and derives IPP-USB identity information from it (the
//! `ident` key, the capability bitmask read out of the class-specific
//! descriptor).

use std::fmt;

/// Interface class/subclass/protocol recognized as "IPP-over-USB".
const IPP_USB_CLASS: u8 = 7;
const IPP_USB_SUBCLASS: u8 = 1;
const IPP_USB_PROTOCOL: u8 = 4;

/// HP's pre-standard variant of the IPP-USB interface class.
const HP_VENDOR_ID: u16 = 0x03f0;
const HP_CLASS: u8 = 255;
const HP_SUBCLASS: u8 = 9;
const HP_PROTOCOL: u8 = 1;

pub fn is_ipp_usb_interface(vendor_id: u16, class: u8, subclass: u8, protocol: u8) -> bool {
    (class == IPP_USB_CLASS && subclass == IPP_USB_SUBCLASS && protocol == IPP_USB_PROTOCOL)
        || (vendor_id == HP_VENDOR_ID
            && class == HP_CLASS
            && subclass == HP_SUBCLASS
            && protocol == HP_PROTOCOL)
}

/// Identifies a device only while it remains plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsbAddr {
    pub bus: u16,
    pub address: u16,
}

impl fmt::Display for UsbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

/// One bulk IN/OUT endpoint pair: a single IPP-USB "channel".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIfAddr {
    pub addr: UsbAddr,
    pub interface_number: u8,
    pub alt_setting: u8,
    pub in_endpoint: u8,
    pub out_endpoint: u8,
}

/// Raw interface descriptor info kept around for logging and quirk matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptorInfo {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// A device recognized as IPP-USB-capable: at least two channel-worthy
/// interface pairs sharing one configuration.
#[derive(Debug, Clone)]
pub struct UsbDeviceDesc {
    pub addr: UsbAddr,
    pub vendor_id: u16,
    pub product_id: u16,
    pub config_number: u8,
    pub ipp_usb_interfaces: Vec<UsbIfAddr>,
    pub all_interfaces: Vec<InterfaceDescriptorInfo>,
}

impl UsbDeviceDesc {
    pub fn is_ipp_usb_capable(&self) -> bool {
        self.ipp_usb_interfaces.len() >= 2
    }
}

bitflags::bitflags! {
    /// Bit assignment is this crate's own convention; see DESIGN.md.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const PRINT    = 0b0000_0001;
        const SCAN     = 0b0000_0010;
        const FAX      = 0b0000_0100;
        const OTHER    = 0b0000_1000;
        const ANY_HTTP = 0b0001_0000;
    }
}

/// Read the 16-bit little-endian capability field at offset 6 of the
/// class-specific IPP-USB functional descriptor.
pub fn parse_capabilities(class_specific_descriptor: &[u8]) -> Capabilities {
    if class_specific_descriptor.len() < 8 {
        return Capabilities::empty();
    }
    let raw = u16::from_le_bytes([
        class_specific_descriptor[6],
        class_specific_descriptor[7],
    ]);
    Capabilities::from_bits_truncate(raw)
}

/// Per-device information used for identity, quirk matching and DNS-SD TXT
/// records.
#[derive(Debug, Clone)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub usb_port_number: u8,
    pub capabilities: Capabilities,
}

impl UsbDeviceInfo {
    /// "make and model": product name, prefixed with manufacturer unless
    /// the product string already starts with it.
    pub fn make_and_model(&self) -> String {
        if self.manufacturer.is_empty()
            || self
                .product
                .to_ascii_lowercase()
                .starts_with(&self.manufacturer.to_ascii_lowercase())
        {
            self.product.clone()
        } else {
            format!("{} {}", self.manufacturer, self.product)
        }
    }

    /// `vvvv-pppp-serial-make-model`, ASCII-sanitized to `[0-9A-Za-z_-]`;
    /// the persistent state-file key.
    pub fn ident(&self) -> String {
        let raw = format!(
            "{:04x}-{:04x}-{}-{}",
            self.vendor_id,
            self.product_id,
            self.serial_number,
            self.make_and_model()
        );
        sanitize_ident(&raw)
    }
}

fn sanitize_ident(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_standard_and_hp_variants() {
        assert!(is_ipp_usb_interface(0x1234, 7, 1, 4));
        assert!(is_ipp_usb_interface(HP_VENDOR_ID, 255, 9, 1));
        assert!(!is_ipp_usb_interface(0x1234, 255, 9, 1));
        assert!(!is_ipp_usb_interface(0x1234, 7, 1, 5));
    }

    #[test]
    fn ident_sanitizes_non_ascii_punctuation() {
        let info = UsbDeviceInfo {
            vendor_id: 0x03f0,
            product_id: 0x1234,
            manufacturer: "HP".into(),
            product: "HP LaserJet MFP M28-M31".into(),
            serial_number: "ABC/123:XYZ".into(),
            usb_port_number: 1,
            capabilities: Capabilities::PRINT | Capabilities::SCAN,
        };
        let ident = info.ident();
        assert!(ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        assert!(ident.starts_with("03f0-1234-"));
    }

    #[test]
    fn make_and_model_avoids_duplicate_manufacturer_prefix() {
        let info = UsbDeviceInfo {
            vendor_id: 1,
            product_id: 1,
            manufacturer: "HP".into(),
            product: "HP LaserJet MFP M28-M31".into(),
            serial_number: "x".into(),
            usb_port_number: 1,
            capabilities: Capabilities::empty(),
        };
        assert_eq!(info.make_and_model(), "HP LaserJet MFP M28-M31");

        let info2 = UsbDeviceInfo {
            manufacturer: "Canon".into(),
            product: "PIXMA MG3620".into(),
            ..info
        };
        assert_eq!(info2.make_and_model(), "Canon PIXMA MG3620");
    }

    #[test]
    fn parses_capability_bitmask_at_offset_six() {
        let mut descriptor = vec![0u8; 8];
        descriptor[6] = 0b0000_0011; // little-endian low byte
        descriptor[7] = 0b0000_0000;
        let caps = parse_capabilities(&descriptor);
        assert!(caps.contains(Capabilities::PRINT));
        assert!(caps.contains(Capabilities::SCAN));
        assert!(!caps.contains(Capabilities::FAX));
    }
}
