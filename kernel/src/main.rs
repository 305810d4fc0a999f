#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(nexus_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;

use nexus_kernel::{
    arch, bootstrap, drivers, fs, irq,
    mm::{self, frame_allocator::FrameNumber},
    net, println, syscall, timer,
    utils::version,
};

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[kernel panic] {}", info);
    nexus_kernel::serial_println!("[kernel panic] {}", info);
    arch::halt();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    nexus_kernel::test_panic_handler(info)
}

entry_point!(kernel_main);

/// Find the largest usable region in the bootloader's memory map and
/// convert it into the `(start_frame, frame_count)` pair the frame
/// allocator's NUMA node 0 is sized from.
fn largest_usable_region(boot_info: &BootInfo) -> (FrameNumber, usize) {
    use bootloader_api::info::MemoryRegionKind;

    const FRAME_SIZE: u64 = 4096;

    boot_info
        .memory_regions
        .iter()
        .filter(|region| region.kind == MemoryRegionKind::Usable)
        .map(|region| {
            let start = FrameNumber::new(region.start / FRAME_SIZE);
            let frames = ((region.end - region.start) / FRAME_SIZE) as usize;
            (start, frames)
        })
        .max_by_key(|&(_, frames)| frames)
        .unwrap_or((FrameNumber::new(256), 16384))
}

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let build = version::get_version_info();
    println!(
        "nexus-kernel v{}.{}.{}",
        build.major, build.minor, build.patch
    );

    if let Some(offset) = boot_info.physical_memory_offset.into_option() {
        arch::x86_64::msr::set_phys_mem_offset(offset);
    }
    arch::init();

    let (start_frame, frame_count) = largest_usable_region(boot_info);
    mm::init_from_memory_map(start_frame, frame_count);

    irq::init();
    timer::init();

    fs::init();
    let pci_devices = drivers::pci::enumerate();
    println!("pci: {} device(s) found", pci_devices.len());
    drivers::init(&pci_devices);

    if let Err(e) = net::init() {
        println!("net: initialization failed: {:?}", e);
    }

    syscall::init();

    #[cfg(test)]
    test_main();

    println!("nexus-kernel initialized");
    bootstrap::idle_loop();
}
