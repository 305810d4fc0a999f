//! PCI bus enumeration, BAR programming, and the MMIO arena.
//!
//! Enumeration walks every bus/device/function via the legacy 0xCF8/0xCFC
//! configuration mechanism. For each BAR the probe-with-all-ones trick
//! recovers its size; unassigned memory BARs (firmware left them at zero)
//! are handed an address out of [`MmioArena`] and written back, after which
//! the command register's memory/IO-space-enable bits are turned on. The
//! resulting devices are exposed two ways: the legacy [`PciBus`] table used
//! by in-tree drivers that still want raw `PciDevice`/`PciBar` access, and
//! [`enumerate`], which produces the stable `nexus_driver_common::DeviceInfo`
//! records a loaded driver's `Probe`/`Bind` pair actually consumes.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use nexus_driver_common::{BarFlags, BarInfo, DeviceInfo};

/// PCI configuration space registers.
#[repr(u16)]
#[allow(dead_code)]
pub enum PciConfigRegister {
    VendorId = 0x00,
    DeviceId = 0x02,
    Command = 0x04,
    Status = 0x06,
    RevisionId = 0x08,
    ProgIf = 0x09,
    Subclass = 0x0A,
    ClassCode = 0x0B,
    CacheLineSize = 0x0C,
    LatencyTimer = 0x0D,
    HeaderType = 0x0E,
    Bist = 0x0F,
    Bar0 = 0x10,
    Bar1 = 0x14,
    Bar2 = 0x18,
    Bar3 = 0x1C,
    Bar4 = 0x20,
    Bar5 = 0x24,
    CardbusCisPointer = 0x28,
    SubsystemVendorId = 0x2C,
    SubsystemId = 0x2E,
    ExpansionRomBase = 0x30,
    CapabilitiesPointer = 0x34,
    InterruptLine = 0x3C,
    InterruptPin = 0x3D,
    MinGrant = 0x3E,
    MaxLatency = 0x3F,
}

#[allow(dead_code)]
pub mod class_codes {
    pub const UNCLASSIFIED: u8 = 0x00;
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const MULTIMEDIA: u8 = 0x04;
    pub const MEMORY: u8 = 0x05;
    pub const BRIDGE: u8 = 0x06;
    pub const COMMUNICATION: u8 = 0x07;
    pub const SYSTEM: u8 = 0x08;
    pub const INPUT: u8 = 0x09;
    pub const DOCKING: u8 = 0x0A;
    pub const PROCESSOR: u8 = 0x0B;
    pub const SERIAL_BUS: u8 = 0x0C;
    pub const WIRELESS: u8 = 0x0D;
    pub const INTELLIGENT: u8 = 0x0E;
    pub const SATELLITE: u8 = 0x0F;
    pub const ENCRYPTION: u8 = 0x10;
    pub const DATA_ACQUISITION: u8 = 0x11;
    pub const COPROCESSOR: u8 = 0xFF;
}

#[allow(dead_code)]
pub mod command_flags {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// PCI device location (bus:device:function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciLocation {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }

    /// Mechanism #1 configuration address, register bits masked off.
    pub fn to_config_address(&self) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
    }
}

/// One decoded Base Address Register.
#[derive(Debug, Clone, Copy)]
pub enum PciBar {
    Memory { address: u64, size: u64, prefetchable: bool, is_64bit: bool },
    Io { address: u32, size: u32 },
    None,
}

impl PciBar {
    pub fn get_memory_address(&self) -> Option<u64> {
        match self {
            PciBar::Memory { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub fn get_io_address(&self) -> Option<u32> {
        match self {
            PciBar::Io { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, PciBar::Memory { .. })
    }

    pub fn is_io(&self) -> bool {
        matches!(self, PciBar::Io { .. })
    }

    fn to_bar_info(self) -> BarInfo {
        match self {
            PciBar::Memory { address, size, prefetchable, is_64bit } => {
                let mut flags = BarFlags::PRESENT;
                if is_64bit {
                    flags |= BarFlags::MEM_64;
                }
                if prefetchable {
                    flags |= BarFlags::PREFETCHABLE;
                }
                BarInfo { base: address, size, flags }
            }
            PciBar::Io { address, size } => BarInfo {
                base: address as u64,
                size: size as u64,
                flags: BarFlags::PRESENT | BarFlags::IO,
            },
            PciBar::None => BarInfo::EMPTY,
        }
    }
}

/// A fully probed PCI function.
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub bars: Vec<PciBar>,
}

impl PciDevice {
    fn new(location: PciLocation) -> Self {
        Self {
            location,
            vendor_id: 0,
            device_id: 0,
            class_code: 0,
            subclass: 0,
            prog_if: 0,
            revision: 0,
            header_type: 0,
            interrupt_line: 0,
            interrupt_pin: 0,
            bars: Vec::new(),
        }
    }

    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }

    /// Project onto the stable DDK device record a driver module's `Probe`
    /// and `Bind` entry points actually see.
    pub fn to_device_info(&self) -> DeviceInfo {
        let mut bars = [BarInfo::EMPTY; 6];
        for (slot, bar) in bars.iter_mut().zip(self.bars.iter()) {
            *slot = bar.to_bar_info();
        }
        DeviceInfo {
            bus: self.location.bus,
            device: self.location.device,
            function: self.location.function,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            class: self.class_code,
            subclass: self.subclass,
            revision: self.revision,
            bars,
        }
    }
}

/// Monotonic MMIO address-space allocator for BARs the firmware left
/// unassigned. Addresses are handed out aligned to the BAR's own size, as
/// PCI requires, and never reclaimed -- driver unbind does not free MMIO
/// space in this kernel.
pub struct MmioArena {
    cursor: AtomicU64,
}

impl MmioArena {
    const BASE: u64 = 0xC000_0000;

    pub const fn new() -> Self {
        Self { cursor: AtomicU64::new(Self::BASE) }
    }

    /// Reserve `size` bytes, naturally aligned, and return the base address.
    pub fn alloc(&self, size: u64) -> u64 {
        let size = size.max(0x1000);
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let aligned = (current + size - 1) & !(size - 1);
            let next = aligned + size;
            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return aligned,
                Err(_) => continue,
            }
        }
    }
}

impl Default for MmioArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Table of enumerated devices, keyed by bus:device:function.
pub struct PciBus {
    devices: spin::RwLock<BTreeMap<PciLocation, PciDevice>>,
    enumerated: core::sync::atomic::AtomicBool,
}

impl PciBus {
    pub fn new() -> Self {
        Self {
            devices: spin::RwLock::new(BTreeMap::new()),
            enumerated: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Walk every bus/device/function, probing function 0 first and
    /// descending into functions 1..8 only when the header marks the device
    /// multifunction. Idempotent: a second call is a no-op.
    pub fn enumerate_devices(&self) {
        if self.enumerated.load(core::sync::atomic::Ordering::Acquire) {
            return;
        }

        crate::println!("[PCI] Enumerating PCI devices...");
        let mut device_count = 0;

        for bus in 0..=255u16 {
            let bus = bus as u8;
            for device in 0..32 {
                let location = PciLocation::new(bus, device, 0);
                let Some(mut pci_device) = self.probe_device(location) else {
                    continue;
                };
                self.read_device_config(&mut pci_device);
                self.assign_bars(&mut pci_device);
                crate::println!(
                    "[PCI] {}:{}:{} - {:04x}:{:04x} (class {:02x}.{:02x})",
                    bus,
                    device,
                    0,
                    pci_device.vendor_id,
                    pci_device.device_id,
                    pci_device.class_code,
                    pci_device.subclass,
                );
                let is_multifunction = pci_device.is_multifunction();
                self.devices.write().insert(location, pci_device);
                device_count += 1;

                if is_multifunction {
                    for function in 1..8 {
                        let func_location = PciLocation::new(bus, device, function);
                        let Some(mut func_device) = self.probe_device(func_location) else {
                            continue;
                        };
                        self.read_device_config(&mut func_device);
                        self.assign_bars(&mut func_device);
                        crate::println!(
                            "[PCI] {}:{}:{} - {:04x}:{:04x} (class {:02x}.{:02x})",
                            bus,
                            device,
                            function,
                            func_device.vendor_id,
                            func_device.device_id,
                            func_device.class_code,
                            func_device.subclass,
                        );
                        self.devices.write().insert(func_location, func_device);
                        device_count += 1;
                    }
                }
            }
        }

        self.enumerated.store(true, core::sync::atomic::Ordering::Release);
        crate::println!("[PCI] enumeration complete: {} device(s)", device_count);
    }

    fn probe_device(&self, location: PciLocation) -> Option<PciDevice> {
        let vendor_id = self.read_config_word(location, PciConfigRegister::VendorId);
        if vendor_id == 0xFFFF {
            return None;
        }
        let mut device = PciDevice::new(location);
        device.vendor_id = vendor_id;
        device.device_id = self.read_config_word(location, PciConfigRegister::DeviceId);
        Some(device)
    }

    fn read_device_config(&self, device: &mut PciDevice) {
        let location = device.location;
        device.class_code = self.read_config_byte(location, PciConfigRegister::ClassCode);
        device.subclass = self.read_config_byte(location, PciConfigRegister::Subclass);
        device.prog_if = self.read_config_byte(location, PciConfigRegister::ProgIf);
        device.revision = self.read_config_byte(location, PciConfigRegister::RevisionId);
        device.header_type = self.read_config_byte(location, PciConfigRegister::HeaderType);
        device.interrupt_line = self.read_config_byte(location, PciConfigRegister::InterruptLine);
        device.interrupt_pin = self.read_config_byte(location, PciConfigRegister::InterruptPin);
        device.bars = self.read_bars(location, device.header_type & 0x7F);
    }

    /// Probe-with-all-ones sizing: write all 1s, read back the mask, restore
    /// the original value. `size = (!mask & ~flag_bits) + 1`.
    fn read_bars(&self, location: PciLocation, header_type: u8) -> Vec<PciBar> {
        let mut bars = Vec::new();
        let bar_count = if header_type == 0 { 6 } else { 2 };

        let mut bar_index = 0u16;
        while bar_index < bar_count {
            let bar_offset = PciConfigRegister::Bar0 as u16 + bar_index * 4;
            let bar_value = self.read_config_dword(location, bar_offset);

            if bar_value == 0 {
                bars.push(PciBar::None);
                bar_index += 1;
                continue;
            }

            if bar_value & 1 == 0 {
                let is_64bit = (bar_value >> 1) & 3 == 2;
                let prefetchable = (bar_value >> 3) & 1 != 0;

                self.write_config_dword(location, bar_offset, 0xFFFF_FFFF);
                let size_mask = self.read_config_dword(location, bar_offset);
                self.write_config_dword(location, bar_offset, bar_value);

                let size = (!size_mask).wrapping_add(1) & 0xFFFF_FFF0;
                let mut address = (bar_value & 0xFFFF_FFF0) as u64;

                if is_64bit && bar_index + 1 < bar_count {
                    let upper_offset = bar_offset + 4;
                    let upper_value = self.read_config_dword(location, upper_offset);
                    address |= (upper_value as u64) << 32;

                    bars.push(PciBar::Memory { address, size: size as u64, prefetchable, is_64bit: true });
                    bars.push(PciBar::None);
                    bar_index += 2;
                } else {
                    bars.push(PciBar::Memory { address, size: size as u64, prefetchable, is_64bit: false });
                    bar_index += 1;
                }
            } else {
                self.write_config_dword(location, bar_offset, 0xFFFF_FFFF);
                let size_mask = self.read_config_dword(location, bar_offset);
                self.write_config_dword(location, bar_offset, bar_value);

                let size = (!size_mask).wrapping_add(1) & 0xFFFF_FFFC;
                let address = bar_value & 0xFFFF_FFFC;

                bars.push(PciBar::Io { address, size });
                bar_index += 1;
            }
        }

        bars
    }

    /// Program an address out of the MMIO arena into any memory BAR the
    /// firmware left at zero, then flip on the command register's
    /// space-enable bits for whatever BAR kinds are now present.
    fn assign_bars(&self, device: &mut PciDevice) {
        let mut has_memory = false;
        let mut has_io = false;

        let mut i = 0;
        while i < device.bars.len() {
            match device.bars[i] {
                PciBar::Memory { address, size, prefetchable, is_64bit } => {
                    has_memory = true;
                    if address == 0 && size > 0 {
                        let assigned = crate::bootstrap::core().mmio_arena.alloc(size);
                        let bar_offset = PciConfigRegister::Bar0 as u16 + (i as u16) * 4;
                        let low = (assigned & 0xFFFF_FFF0) as u32
                            | if is_64bit { 0b100 } else { 0b000 }
                            | if prefetchable { 0b1000 } else { 0 };
                        self.write_config_dword(device.location, bar_offset, low);
                        if is_64bit {
                            let high = (assigned >> 32) as u32;
                            self.write_config_dword(device.location, bar_offset + 4, high);
                        }
                        device.bars[i] = PciBar::Memory { address: assigned, size, prefetchable, is_64bit };
                    }
                }
                PciBar::Io { .. } => has_io = true,
                PciBar::None => {}
            }
            i += 1;
        }

        if has_memory || has_io {
            let command = self.read_config_word(device.location, PciConfigRegister::Command);
            let mut new_command = command;
            if has_memory {
                new_command |= command_flags::MEMORY_SPACE;
            }
            if has_io {
                new_command |= command_flags::IO_SPACE;
            }
            if new_command != command {
                self.write_config_word(device.location, PciConfigRegister::Command, new_command);
            }
        }
    }

    fn read_config_byte(&self, location: PciLocation, register: PciConfigRegister) -> u8 {
        let offset = register as u16;
        let dword = self.read_config_dword(location, offset & !3);
        ((dword >> ((offset & 3) * 8)) & 0xFF) as u8
    }

    fn read_config_word(&self, location: PciLocation, register: PciConfigRegister) -> u16 {
        let offset = register as u16;
        let dword = self.read_config_dword(location, offset & !3);
        ((dword >> ((offset & 3) * 8)) & 0xFFFF) as u16
    }

    fn write_config_word(&self, location: PciLocation, register: PciConfigRegister, value: u16) {
        let offset = register as u16;
        let shift = (offset & 3) * 8;
        let current = self.read_config_dword(location, offset & !3);
        let mask = !(0xFFFFu32 << shift);
        let new_value = (current & mask) | ((value as u32) << shift);
        self.write_config_dword(location, offset & !3, new_value);
    }

    fn read_config_dword(&self, location: PciLocation, offset: u16) -> u32 {
        let address = location.to_config_address() | (offset as u32 & 0xFC);
        // SAFETY: 0xCF8/0xCFC are the architecturally-defined Mechanism #1
        // configuration address/data ports.
        unsafe {
            crate::arch::outl(0xCF8, address);
            crate::arch::inl(0xCFC)
        }
    }

    fn write_config_dword(&self, location: PciLocation, offset: u16, value: u32) {
        let address = location.to_config_address() | (offset as u32 & 0xFC);
        // SAFETY: see read_config_dword.
        unsafe {
            crate::arch::outl(0xCF8, address);
            crate::arch::outl(0xCFC, value);
        }
    }

    /// Raw byte-offset config space read, for callers (the export ABI) that
    /// address registers by offset rather than by [`PciConfigRegister`].
    pub fn read_config_u8(&self, location: PciLocation, offset: u8) -> u8 {
        let dword = self.read_config_dword(location, (offset & !3) as u16);
        ((dword >> ((offset & 3) * 8)) & 0xFF) as u8
    }

    pub fn read_config_u16(&self, location: PciLocation, offset: u8) -> u16 {
        let dword = self.read_config_dword(location, (offset & !3) as u16);
        ((dword >> ((offset & 3) * 8)) & 0xFFFF) as u16
    }

    pub fn read_config_u32(&self, location: PciLocation, offset: u8) -> u32 {
        self.read_config_dword(location, (offset & !3) as u16)
    }

    pub fn write_config_u8(&self, location: PciLocation, offset: u8, value: u8) {
        let shift = (offset & 3) * 8;
        let current = self.read_config_dword(location, (offset & !3) as u16);
        let mask = !(0xFFu32 << shift);
        self.write_config_dword(location, (offset & !3) as u16, (current & mask) | ((value as u32) << shift));
    }

    pub fn write_config_u16(&self, location: PciLocation, offset: u8, value: u16) {
        let shift = (offset & 3) * 8;
        let current = self.read_config_dword(location, (offset & !3) as u16);
        let mask = !(0xFFFFu32 << shift);
        self.write_config_dword(location, (offset & !3) as u16, (current & mask) | ((value as u32) << shift));
    }

    pub fn write_config_u32(&self, location: PciLocation, offset: u8, value: u32) {
        self.write_config_dword(location, (offset & !3) as u16, value);
    }

    /// Re-probe a BAR's size with the all-ones trick, without committing the
    /// address. Used by the export ABI's BAR-size group; enumeration already
    /// records the committed size in [`PciDevice::bars`] for the common case.
    pub fn probe_bar_size(&self, location: PciLocation, bar_index: u8) -> u64 {
        let bar_offset = PciConfigRegister::Bar0 as u16 + (bar_index as u16) * 4;
        let original = self.read_config_dword(location, bar_offset);
        self.write_config_dword(location, bar_offset, 0xFFFF_FFFF);
        let mask = self.read_config_dword(location, bar_offset);
        self.write_config_dword(location, bar_offset, original);
        if original & 1 == 0 {
            ((!mask).wrapping_add(1) & 0xFFFF_FFF0) as u64
        } else {
            ((!mask).wrapping_add(1) & 0xFFFF_FFFC) as u64
        }
    }

    /// Walk the PCI capability list, returning each capability's `(cap_id,
    /// offset)` pair in list order. Empty if the device's status register
    /// doesn't advertise a capability list at all.
    pub fn capability_list(&self, location: PciLocation) -> Vec<(u8, u8)> {
        const STATUS_CAP_LIST: u16 = 1 << 4;

        let status = self.read_config_word(location, PciConfigRegister::Status);
        if status & STATUS_CAP_LIST == 0 {
            return Vec::new();
        }

        let mut caps = Vec::new();
        let mut ptr = self.read_config_u8(location, PciConfigRegister::CapabilitiesPointer as u8) & 0xFC;
        let mut visited = 0;
        while ptr != 0 && visited < 64 {
            let cap_id = self.read_config_u8(location, ptr);
            let next = self.read_config_u8(location, ptr + 1);
            caps.push((cap_id, ptr));
            ptr = next & 0xFC;
            visited += 1;
        }
        caps
    }

    /// Set the command register's memory-space-enable bit.
    pub fn enable_memory_space(&self, location: PciLocation) {
        let command = self.read_config_word(location, PciConfigRegister::Command);
        self.write_config_word(location, PciConfigRegister::Command, command | command_flags::MEMORY_SPACE);
    }

    /// Set the command register's bus-master-enable bit.
    pub fn enable_bus_master(&self, location: PciLocation) {
        let command = self.read_config_word(location, PciConfigRegister::Command);
        self.write_config_word(location, PciConfigRegister::Command, command | command_flags::BUS_MASTER);
    }

    pub fn get_device(&self, location: PciLocation) -> Option<PciDevice> {
        self.devices.read().get(&location).cloned()
    }

    pub fn get_all_devices(&self) -> Vec<PciDevice> {
        self.devices.read().values().cloned().collect()
    }

    pub fn find_devices_by_class(&self, class_code: u8) -> Vec<PciDevice> {
        self.devices.read().values().filter(|dev| dev.class_code == class_code).cloned().collect()
    }

    pub fn find_devices_by_id(&self, vendor_id: u16, device_id: u16) -> Vec<PciDevice> {
        self.devices
            .read()
            .values()
            .filter(|dev| dev.vendor_id == vendor_id && dev.device_id == device_id)
            .cloned()
            .collect()
    }
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

static PCI_BUS: spin::Once<spin::Mutex<PciBus>> = spin::Once::new();

pub fn init() {
    PCI_BUS.call_once(|| spin::Mutex::new(PciBus::new()));
    get_pci_bus().lock().enumerate_devices();
}

pub fn is_pci_initialized() -> bool {
    PCI_BUS.get().is_some()
}

pub fn get_pci_bus() -> &'static spin::Mutex<PciBus> {
    PCI_BUS.get().expect("PCI bus not initialized")
}

/// Enumerate the bus (if not already done) and return the DDK-stable device
/// records that `drivers::init` hands to each driver's `Probe`.
pub fn enumerate() -> Vec<DeviceInfo> {
    init();
    get_pci_bus().lock().get_all_devices().iter().map(PciDevice::to_device_info).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_config_address_encoding() {
        let loc = PciLocation::new(1, 2, 3);
        let addr = loc.to_config_address();
        assert_eq!(addr & 0x8000_0000, 0x8000_0000);
        assert_eq!((addr >> 16) & 0xFF, 1);
        assert_eq!((addr >> 11) & 0x1F, 2);
        assert_eq!((addr >> 8) & 0x07, 3);
    }

    #[test_case]
    fn test_mmio_arena_monotonic_and_aligned() {
        let arena = MmioArena::new();
        let a = arena.alloc(0x1000);
        let b = arena.alloc(0x2000);
        assert!(b >= a + 0x1000);
        assert_eq!(b % 0x2000, 0);
    }

    #[test_case]
    fn test_bar_info_conversion() {
        let bar = PciBar::Memory { address: 0xFEBC_0000, size: 0x1000, prefetchable: false, is_64bit: false };
        let info = bar.to_bar_info();
        assert!(info.flags.contains(BarFlags::PRESENT));
        assert!(!info.flags.contains(BarFlags::MEM_64));
        assert_eq!(info.base, 0xFEBC_0000);
    }
}
