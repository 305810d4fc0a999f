//! Memory management: physical frame allocation and the kernel heap.

#![allow(dead_code)]

use crate::println;

pub mod frame_allocator;
pub mod heap;

pub use frame_allocator::{
    FrameAllocatorError, FrameNumber, MemoryZone, PhysicalAddress, PhysicalFrame, FRAME_ALLOCATOR,
    FRAME_SIZE,
};

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

/// Page size options
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB pages
    Small = 4096,
    /// 2 MiB pages
    Large = 2 * 1024 * 1024,
    /// 1 GiB pages
    Huge = 1024 * 1024 * 1024,
}

/// Page table structure (placeholder)
pub struct PageTable {
    pub root_phys: PhysicalAddress,
}

/// Page flags
#[derive(Debug, Clone, Copy)]
pub struct PageFlags(u64);

impl PageFlags {
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const WRITE_THROUGH: Self = Self(1 << 3);
    pub const NO_CACHE: Self = Self(1 << 4);
    pub const ACCESSED: Self = Self(1 << 5);
    pub const DIRTY: Self = Self(1 << 6);
    pub const HUGE: Self = Self(1 << 7);
    pub const GLOBAL: Self = Self(1 << 8);
    pub const NO_EXECUTE: Self = Self(1 << 63);
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Number of frames reserved for the kernel's NUMA node 0 when no
/// `BootInfo` memory map is available (e.g. unit test builds).
const DEFAULT_NODE_FRAMES: usize = 16384; // 64MB

/// Initialize memory management: size NUMA node 0 of the frame allocator
/// from the bootloader's memory map, reserve the low 1MB, then bring up
/// the kernel heap.
pub fn init() {
    println!("[MM] Initializing memory management...");

    {
        let mut allocator = FRAME_ALLOCATOR.lock();
        if let Err(e) = allocator.init_numa_node(0, FrameNumber::new(256), DEFAULT_NODE_FRAMES) {
            println!("[MM] Warning: failed to initialize NUMA node 0: {:?}", e);
        }
        #[cfg(feature = "alloc")]
        allocator.mark_standard_reserved_regions();
    }

    if let Err(e) = heap::init() {
        println!("[MM] Warning: heap initialization failed: {}", e);
    }

    println!("[MM] Memory management initialized");
}

/// Initialize memory management from a bootloader-provided memory map.
///
/// `usable_start` and `frame_count` describe the largest usable region
/// reported by `bootloader_api`'s `BootInfo::memory_regions`.
pub fn init_from_memory_map(usable_start: FrameNumber, frame_count: usize) {
    println!("[MM] Initializing memory management from boot memory map...");

    {
        let mut allocator = FRAME_ALLOCATOR.lock();
        if let Err(e) = allocator.init_numa_node(0, usable_start, frame_count) {
            println!("[MM] Warning: failed to initialize NUMA node 0: {:?}", e);
        }
        #[cfg(feature = "alloc")]
        allocator.mark_standard_reserved_regions();
    }

    if let Err(e) = heap::init() {
        println!("[MM] Warning: heap initialization failed: {}", e);
    }

    println!("[MM] Memory management initialized");
}
