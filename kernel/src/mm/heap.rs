//! Kernel heap allocator
//!
//! Initializes the global `linked_list_allocator`-backed heap over a
//! statically reserved region of kernel memory.

#![allow(dead_code)]

use crate::println;

// Static heap storage - 4MB should be enough for initial testing
static mut HEAP_MEMORY: [u8; 4 * 1024 * 1024] = [0; 4 * 1024 * 1024];

/// Kernel heap size
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Initialize the kernel heap
#[cfg(target_os = "none")]
pub fn init() -> Result<(), &'static str> {
    println!("[HEAP] Initializing kernel heap ({} MB)", HEAP_SIZE / (1024 * 1024));

    unsafe {
        let heap_start = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        let mut allocator = crate::get_allocator().lock();
        allocator.init(heap_start, HEAP_SIZE);
        drop(allocator);

        println!(
            "[HEAP] Heap initialized at {:#x}",
            core::ptr::addr_of!(HEAP_MEMORY) as usize
        );
    }

    Ok(())
}

/// Host test builds run on `std::alloc::System`, which needs no setup.
#[cfg(not(target_os = "none"))]
pub fn init() -> Result<(), &'static str> {
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec::Vec};

    #[test]
    fn test_heap_allocation() {
        let x = Box::new(42);
        assert_eq!(*x, 42);

        let mut v = Vec::new();
        for i in 0..100 {
            v.push(i);
        }
        assert_eq!(v.len(), 100);
    }
}
