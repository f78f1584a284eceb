//! USB subsystem: enumeration, hotplug, the per-device open sequence, the
//! channel pool, and the multiplexed transport built on top of them.
//!
//! Bulk I/O stays synchronous (libusb is a blocking C library); every
//! blocking call runs via `tokio::task::spawn_blocking`. A single
//! process-wide `rusb::Context` drives hotplug events on a dedicated
//! thread (`worker`), forwarding arrivals/removals to the PnP controller
//! through `common::channel`.

pub mod backend;
pub mod descriptors;
pub mod device;
pub mod io;
pub mod pool;
pub mod transport;
pub mod worker;

pub use descriptors::{UsbAddr, UsbDeviceDesc, UsbDeviceInfo, UsbIfAddr};
pub use pool::{ChannelPool, PooledConn, UsbConn};
pub use transport::{ChannelBody, UsbTransport};
