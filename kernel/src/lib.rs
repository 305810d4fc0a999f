//! Nexus kernel library.
//!
//! This library hosts the core kernel substrate — PCI/virtio, VFS, the
//! cancellation/task primitives, and the DDK export surface — and exports
//! the pieces the bare-metal binary and the in-tree test harness both need.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target (x86_64-unknown-linux-gnu): delegate to the system allocator
// so unit tests exercising Vec/String/alloc logic compile and run off-target.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

mod intrinsics;

pub mod abi;
pub mod arch;
pub mod bootstrap;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod irq;
pub mod mm;
pub mod net;
pub mod raii;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod utils;

mod test_framework;

#[cfg(test)]
mod raii_tests;

pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};
#[cfg(test)]
pub use test_framework::test_runner;

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
