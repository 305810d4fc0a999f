//! USB bus structure.
//!
//! This models the host-controller/device/endpoint shape (address
//! assignment, port/device bookkeeping, the transfer vocabulary a
//! controller driver would implement) without wiring up a concrete
//! controller or any per-class binding logic -- UHCI/XHCI register access
//! and class drivers (HID, mass storage, ...) are out of scope here.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use spin::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

#[allow(dead_code)]
pub mod usb_classes {
    pub const AUDIO: u8 = 0x01;
    pub const CDC: u8 = 0x02;
    pub const HID: u8 = 0x03;
    pub const IMAGE: u8 = 0x06;
    pub const PRINTER: u8 = 0x07;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const CDC_DATA: u8 = 0x0A;
    pub const VIDEO: u8 = 0x0E;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDirection {
    Out = 0,
    In = 1,
}

#[derive(Debug, Clone)]
pub struct UsbEndpoint {
    pub address: u8,
    pub direction: UsbDirection,
    pub endpoint_type: UsbEndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl UsbEndpoint {
    pub fn new(address: u8) -> Self {
        Self {
            address: address & 0x7F,
            direction: if address & 0x80 != 0 { UsbDirection::In } else { UsbDirection::Out },
            endpoint_type: UsbEndpointType::Control,
            max_packet_size: 8,
            interval: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsbInterface {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

#[derive(Debug, Clone)]
pub struct UsbConfiguration {
    pub value: u8,
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub interfaces: Vec<UsbInterface>,
}

#[derive(Debug, Clone)]
pub struct UsbDeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size: u8,
    pub manufacturer: String,
    pub product: String,
    pub configurations: Vec<UsbConfiguration>,
}

#[derive(Debug, Clone)]
pub struct UsbDevice {
    pub address: u8,
    pub port: u8,
    pub speed: UsbSpeed,
    pub descriptor: UsbDeviceDescriptor,
    pub current_configuration: Option<u8>,
}

impl UsbDevice {
    pub fn new(address: u8, port: u8, speed: UsbSpeed) -> Self {
        Self {
            address,
            port,
            speed,
            descriptor: UsbDeviceDescriptor {
                vendor_id: 0,
                product_id: 0,
                class: 0,
                subclass: 0,
                protocol: 0,
                max_packet_size: 8,
                manufacturer: String::new(),
                product: String::new(),
                configurations: Vec::new(),
            },
            current_configuration: None,
        }
    }
}

/// A request a controller driver would service; framing only, no transport.
#[derive(Debug, Clone)]
pub enum UsbTransfer {
    Setup { request_type: u8, request: u8, value: u16, index: u16, data: Vec<u8> },
    In { endpoint: u8, length: usize },
    Out { endpoint: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
pub struct UsbPortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub speed: UsbSpeed,
}

/// Shape a concrete host controller driver would implement against.
pub trait UsbHostController: Send + Sync {
    fn name(&self) -> &str;
    fn port_count(&self) -> u8;
    fn port_status(&self, port: u8) -> Result<UsbPortStatus, &'static str>;
    fn transfer(&mut self, device_address: u8, transfer: UsbTransfer) -> Result<Vec<u8>, &'static str>;
}

/// Address allocation and device bookkeeping, independent of any one
/// controller implementation.
pub struct UsbBus {
    devices: RwLock<BTreeMap<u8, UsbDevice>>,
    next_address: core::sync::atomic::AtomicU8,
}

impl UsbBus {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            next_address: core::sync::atomic::AtomicU8::new(1),
        }
    }

    /// Assign the next free USB address (1..127, 0 is reserved for
    /// not-yet-addressed devices) and register the device under it.
    pub fn attach(&self, port: u8, speed: UsbSpeed) -> u8 {
        let address = self.next_address.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        self.devices.write().insert(address, UsbDevice::new(address, port, speed));
        address
    }

    pub fn detach(&self, address: u8) {
        self.devices.write().remove(&address);
    }

    pub fn get_device(&self, address: u8) -> Option<UsbDevice> {
        self.devices.read().get(&address).cloned()
    }

    pub fn list_devices(&self) -> Vec<UsbDevice> {
        self.devices.read().values().cloned().collect()
    }
}

impl Default for UsbBus {
    fn default() -> Self {
        Self::new()
    }
}

static USB_BUS: spin::Once<UsbBus> = spin::Once::new();

/// No host controller is probed here; this only brings up the shared
/// address/device table a controller driver would attach devices to.
pub fn init() {
    USB_BUS.call_once(UsbBus::new);
}

pub fn get_usb_bus() -> &'static UsbBus {
    USB_BUS.get().expect("USB bus not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_address_allocation_is_sequential() {
        let bus = UsbBus::new();
        let a = bus.attach(1, UsbSpeed::High);
        let b = bus.attach(2, UsbSpeed::Full);
        assert_eq!(b, a + 1);
        assert_eq!(bus.list_devices().len(), 2);
    }

    #[test_case]
    fn test_detach_removes_device() {
        let bus = UsbBus::new();
        let addr = bus.attach(1, UsbSpeed::Full);
        bus.detach(addr);
        assert!(bus.get_device(addr).is_none());
    }
}
