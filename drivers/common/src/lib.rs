//! Stable Driver Development Kit (DDK) surface.
//!
//! This crate is the contract shared between the kernel's driver loader and
//! every loaded driver module. A driver module exports three well-known
//! C-ABI symbols — `Probe`, `Bind`, `GetDevice` — with the signatures named
//! here; the loader resolves them by name once at load time and never
//! performs general reflection afterward.

#![no_std]

/// Bus/device/function address plus identification, handed to a driver at
/// bind time. Mirrors the kernel's internal `PciDevice` minus anything the
/// driver side has no business touching (BAR programming already happened).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DeviceInfo {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub revision: u8,
    pub bars: [BarInfo; 6],
}

/// One programmed Base Address Register, as handed down by the PCI binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BarInfo {
    pub base: u64,
    pub size: u64,
    pub flags: BarFlags,
}

impl BarInfo {
    pub const EMPTY: BarInfo = BarInfo {
        base: 0,
        size: 0,
        flags: BarFlags::empty(),
    };
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BarFlags: u8 {
        const IO           = 0b0000_0001;
        const MEM_64        = 0b0000_0010;
        const PREFETCHABLE = 0b0000_0100;
        const PRESENT      = 0b0000_1000;
    }
}

/// Driver-facing error set. Distinct from the kernel's internal
/// `KernelError`: a driver only ever sees the subset relevant to probing and
/// servicing I/O requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    DeviceNotSupported,
    InitFailed,
    IoError,
    InvalidParameter,
    NotSupported,
    Busy,
    Timeout,
    WriteProtected,
}

/// The entry points every loaded driver module exports by name.
///
/// `Probe` answers whether this driver claims the device; `Bind` performs
/// one-time initialization (queue setup, feature negotiation, ...); the
/// resulting object is then reachable through `GetDevice` for the lifetime
/// of the driver.
pub trait Driver: Send + Sync {
    fn probe(info: &DeviceInfo) -> bool
    where
        Self: Sized;

    fn bind(info: &DeviceInfo) -> Result<Self, DriverError>
    where
        Self: Sized;

    fn device(&self) -> &DeviceInfo;
}

/// Block device driver trait, implemented by virtio-blk and any future
/// block transport. Request framing (three-descriptor chains) lives below
/// this trait, in the transport-specific crate.
pub trait BlockDriver: Driver {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn read_blocks(
        &mut self,
        start_block: u64,
        num_blocks: u32,
        buffer: &mut [u8],
    ) -> Result<(), DriverError>;

    fn write_blocks(&mut self, start_block: u64, num_blocks: u32, data: &[u8])
        -> Result<(), DriverError>;

    fn flush(&mut self) -> Result<(), DriverError>;
}

/// An MMIO register window, already mapped through the kernel's identity
/// direct-physical-map. All accesses are volatile; the driver never
/// constructs one of these itself — it is handed down from `DeviceInfo`'s
/// resolved BAR base plus a capability offset.
#[derive(Debug, Clone, Copy)]
pub struct MmioWindow {
    base: *mut u8,
    len: usize,
}

// SAFETY: `base` points at MMIO space that is valid and live for the
// lifetime of the window (guaranteed by `MmioWindow::new`'s safety
// contract); all accesses go through volatile reads/writes, so sharing
// or transferring the window across threads is sound.
unsafe impl Send for MmioWindow {}
// SAFETY: see `Send` impl above — all accesses are volatile.
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// # Safety
    /// `base` must point at `len` bytes of valid, live MMIO space for the
    /// lifetime of the returned window.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// `offset + size_of::<T>()` must be within bounds and correctly aligned
    /// for `T`.
    pub unsafe fn read<T: Copy>(&self, offset: usize) -> T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        // SAFETY: caller guarantees offset/alignment validity.
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const T) }
    }

    /// # Safety
    /// `offset + size_of::<T>()` must be within bounds and correctly aligned
    /// for `T`.
    pub unsafe fn write<T: Copy>(&self, offset: usize, value: T) {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        // SAFETY: caller guarantees offset/alignment validity.
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut T, value) };
    }
}
