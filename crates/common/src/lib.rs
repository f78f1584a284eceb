//! Shared plumbing for `ipp-usb`: the error taxonomy boundary, logging
//! bootstrap, per-device rotating log files and the sync/async thread
//! bridge used to get hotplug events out of the libusb event thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::{RotatingLogFile, setup_logging};
