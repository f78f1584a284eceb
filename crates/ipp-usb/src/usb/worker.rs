//! Global libusb context and hotplug-event pump thread: a dedicated
//! thread looping on `context.handle_events()` so libusb's hotplug
//! callbacks fire, forwarding what they report. Per-request I/O happens
//! inline via `tokio::task::spawn_blocking` against each device's own
//! handle (see `usb::transport`) rather than through this thread, since
//! there is no single shared device to serialize access to.

use std::time::Duration;

use common::{UsbCommand, UsbEvent, UsbWorker};
use rusb::{Context, Hotplug, HotplugBuilder, UsbContext};
use tracing::{debug, info, warn};

struct HotplugForwarder {
    worker: std::sync::Arc<UsbWorker>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        if let Ok(desc) = device.device_descriptor() {
            let _ = self.worker.send_event(UsbEvent::DeviceArrived {
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        let _ = self.worker.send_event(UsbEvent::DeviceLeft {
            bus_number: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Drives `context`'s hotplug callbacks and forwards arrivals/removals over
/// `worker` until a `Shutdown` command is received or the channel closes.
pub fn run(context: Context, worker: UsbWorker) -> Result<(), rusb::Error> {
    let worker = std::sync::Arc::new(worker);

    let _registration = if rusb::has_hotplug() {
        match HotplugBuilder::new()
            .enumerate(true)
            .register(&context, Box::new(HotplugForwarder { worker: worker.clone() }))
        {
            Ok(reg) => Some(reg),
            Err(e) => {
                warn!("hotplug registration failed, falling back to polling only: {e}");
                None
            }
        }
    } else {
        warn!("libusb built without hotplug support; device arrival/removal will not be detected live");
        None
    };

    info!("USB hotplug thread started");
    loop {
        if worker.try_recv_command().is_some_and(|c| matches!(c, UsbCommand::Shutdown)) {
            info!("USB hotplug thread shutting down");
            break;
        }

        match context.handle_events(Some(Duration::from_millis(200))) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("hotplug event handling interrupted"),
            Err(e) => {
                warn!("error handling USB hotplug events: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Spawn the hotplug pump on its own OS thread.
pub fn spawn(context: Context, worker: UsbWorker) -> std::thread::JoinHandle<Result<(), rusb::Error>> {
    std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || run(context, worker))
        .expect("failed to spawn USB hotplug thread")
}
