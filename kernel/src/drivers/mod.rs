//! Device drivers: the PCI bus, virtio transports, and the USB structural
//! stub.
//!
//! `init` enumerates PCI once (`pci::enumerate`) and hands the resulting
//! `DeviceInfo` records to each in-tree driver's `probe`. This kernel links
//! its drivers statically rather than loading ELF modules at runtime, but
//! every driver still goes through the same `Probe`/`Bind` shape a loaded
//! module would export (see `nexus_driver_common::Driver`), so the dispatch
//! here is the in-tree stand-in for what a module loader would otherwise do.

pub mod pci;
pub mod usb;
pub mod virtio;

pub use pci::{MmioArena, PciBus, PciDevice};
pub use usb::{UsbBus, UsbDevice};

use nexus_driver_common::DeviceInfo;

fn virtio_blk_probe(info: &DeviceInfo) -> bool {
    info.vendor_id == self::virtio::VIRTIO_VENDOR_ID
        && (info.device_id == self::virtio::VIRTIO_BLK_DEVICE_ID_LEGACY
            || info.device_id == self::virtio::VIRTIO_BLK_DEVICE_ID_MODERN)
}

/// Bind every PCI device in `devices` to whichever in-tree driver claims it.
pub fn init(devices: &[DeviceInfo]) {
    crate::println!("[DRIVERS] Initializing device drivers...");

    usb::init();

    if devices.iter().any(virtio_blk_probe) {
        virtio::blk::init();
    } else {
        crate::println!("[DRIVERS] No virtio-blk device present, skipping bind");
    }

    crate::println!("[DRIVERS] Device drivers initialized");
}
