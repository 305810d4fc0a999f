//! C-ABI export surface consumed by loaded driver modules.
//!
//! Every export here is a fixed-name `extern "C"` function, grouped exactly
//! as the groups below: atomics (`Interlocked_*`), interrupt control, PCI
//! config space, timers/delays, physical memory, kernel threads, syscall
//! handler registration (thin re-exports of [`crate::syscall::filesystem`]),
//! and the reflection/loader group. Pointer parameters are raw and
//! ownership never crosses this boundary.
//!
//! This kernel links its drivers in-tree rather than loading ELF modules at
//! runtime (see [`crate::drivers`]), so the reflection group's `LoadedDriver`
//! registry is populated by [`register_driver`] instead of a module loader
//! resolving `Probe`/`Bind`/`GetDevice` out of a freshly mapped image. The
//! three well-known symbol names and their signatures are identical either
//! way; only how the function pointers are obtained differs.

#![allow(non_snake_case)]
#![allow(dead_code)]

extern crate alloc;

use core::ffi::c_void;
use core::sync::atomic::{AtomicI32, AtomicI64, AtomicIsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use nexus_driver_common::DeviceInfo;

use crate::{
    arch::x86_64::apic,
    bootstrap,
    drivers::pci::{self, PciLocation},
    irq,
    mm::frame_allocator::{FrameNumber, FRAME_ALLOCATOR, FRAME_SIZE},
};

// ---------------------------------------------------------------------------
// Atomic ops (Interlocked_*)
// ---------------------------------------------------------------------------

macro_rules! atomic_group {
    ($atomic:ty, $int:ty, $inc:ident, $dec:ident, $xchg:ident, $cas:ident, $add:ident) => {
        /// # Safety
        /// `target` must be valid, properly aligned for `$int`, and not
        /// concurrently accessed through a non-atomic read or write.
        #[no_mangle]
        pub unsafe extern "C" fn $inc(target: *mut $int) -> $int {
            unsafe { <$atomic>::from_ptr(target) }.fetch_add(1, Ordering::SeqCst) + 1
        }

        /// # Safety
        /// Same safety requirement as the increment variant above.
        #[no_mangle]
        pub unsafe extern "C" fn $dec(target: *mut $int) -> $int {
            unsafe { <$atomic>::from_ptr(target) }.fetch_sub(1, Ordering::SeqCst) - 1
        }

        /// Returns the previous value.
        ///
        /// # Safety
        /// Same safety requirement as the increment variant above.
        #[no_mangle]
        pub unsafe extern "C" fn $xchg(target: *mut $int, value: $int) -> $int {
            unsafe { <$atomic>::from_ptr(target) }.swap(value, Ordering::SeqCst)
        }

        /// Returns the previous value whether or not the exchange took
        /// place, matching the `Interlocked*` convention.
        ///
        /// # Safety
        /// Same safety requirement as the increment variant above.
        #[no_mangle]
        pub unsafe extern "C" fn $cas(target: *mut $int, comparand: $int, value: $int) -> $int {
            let atomic = unsafe { <$atomic>::from_ptr(target) };
            match atomic.compare_exchange(comparand, value, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(prev) | Err(prev) => prev,
            }
        }

        /// # Safety
        /// Same safety requirement as the increment variant above.
        #[no_mangle]
        pub unsafe extern "C" fn $add(target: *mut $int, value: $int) -> $int {
            unsafe { <$atomic>::from_ptr(target) }.fetch_add(value, Ordering::SeqCst) + value
        }
    };
}

atomic_group!(
    AtomicI32,
    i32,
    Interlocked_Increment32,
    Interlocked_Decrement32,
    Interlocked_Exchange32,
    Interlocked_CompareExchange32,
    Interlocked_Add32
);
atomic_group!(
    AtomicI64,
    i64,
    Interlocked_Increment64,
    Interlocked_Decrement64,
    Interlocked_Exchange64,
    Interlocked_CompareExchange64,
    Interlocked_Add64
);
atomic_group!(
    AtomicIsize,
    isize,
    Interlocked_IncrementPtr,
    Interlocked_DecrementPtr,
    Interlocked_ExchangePtr,
    Interlocked_CompareExchangePtr,
    Interlocked_AddPtr
);

// ---------------------------------------------------------------------------
// Interrupt control
// ---------------------------------------------------------------------------

/// Opaque interrupt frame passed to a registered handler. Aliased to the
/// architecture's real stack frame type rather than redefined, since the
/// handler table below dispatches straight into it.
#[cfg(target_arch = "x86_64")]
pub type FrameContext = x86_64::structures::idt::InterruptStackFrame;

pub type InterruptHandler = extern "C" fn(*mut FrameContext);

/// Handlers for the dynamically-assigned vector range `[48, 80)` -- the
/// same range [`irq::IrqBitmap`] hands out. Indexed by `vector -
/// IRQ_VECTOR_BASE`. A concrete CPU interrupt-entry stub calls
/// [`dispatch_vector`] once it decodes the firing vector; wiring that stub
/// for the full dynamic range is future work, this registry and
/// [`dispatch_vector`] are what it will call into.
static VECTOR_HANDLERS: Mutex<[Option<InterruptHandler>; 32]> = Mutex::new([None; 32]);

fn vector_slot(vector: u8) -> Option<usize> {
    if (irq::IRQ_VECTOR_BASE..irq::IRQ_VECTOR_END).contains(&vector) {
        Some((vector - irq::IRQ_VECTOR_BASE) as usize)
    } else {
        None
    }
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterInterruptHandler(vector: u8, handler: InterruptHandler) -> bool {
    match vector_slot(vector) {
        Some(slot) => {
            VECTOR_HANDLERS.lock()[slot] = Some(handler);
            true
        }
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn Kernel_UnregisterInterruptHandler(vector: u8) -> bool {
    match vector_slot(vector) {
        Some(slot) => {
            VECTOR_HANDLERS.lock()[slot] = None;
            true
        }
        None => false,
    }
}

/// Dispatch to whatever handler is currently registered for `vector`, if
/// any. Spurious or unregistered vectors are silently dropped.
pub fn dispatch_vector(vector: u8, frame: *mut FrameContext) {
    if let Some(slot) = vector_slot(vector) {
        if let Some(handler) = VECTOR_HANDLERS.lock()[slot] {
            handler(frame);
        }
    }
}

#[no_mangle]
pub extern "C" fn Kernel_SendEOI() {
    apic::send_eoi();
}

#[no_mangle]
pub extern "C" fn Kernel_EnableInterrupts() {
    crate::arch::x86_64::enable_interrupts();
}

#[no_mangle]
pub extern "C" fn Kernel_DisableInterrupts() {
    core::mem::forget(crate::arch::x86_64::disable_interrupts());
}

#[no_mangle]
pub extern "C" fn Kernel_InterruptsEnabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

/// Claim a vector from the dynamic pool. Returns `-1` once exhausted.
#[no_mangle]
pub extern "C" fn Kernel_AllocateIRQ() -> i32 {
    bootstrap::core()
        .irq_bitmap
        .allocate()
        .map(|v| v as i32)
        .unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn Kernel_FreeIRQ(vector: u8) {
    bootstrap::core().irq_bitmap.free(vector);
    let _ = Kernel_UnregisterInterruptHandler(vector);
}

/// APIC affinity is expressed as a single LAPIC destination ID in the I/O
/// APIC redirection entry, not a CPU bitmask; `cpu_mask`'s lowest set bit is
/// used as that destination.
#[no_mangle]
pub extern "C" fn Kernel_SetIRQAffinity(irq: u8, vector: u8, cpu_mask: u32) -> bool {
    let dest = cpu_mask.trailing_zeros().min(255) as u8;
    apic::set_irq_route(irq, vector, dest).is_ok()
}

// ---------------------------------------------------------------------------
// PCI config
// ---------------------------------------------------------------------------

fn loc(bus: u8, device: u8, function: u8) -> PciLocation {
    PciLocation::new(bus, device, function)
}

#[no_mangle]
pub extern "C" fn Kernel_PciReadConfig8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    pci::get_pci_bus().lock().read_config_u8(loc(bus, device, function), offset)
}

#[no_mangle]
pub extern "C" fn Kernel_PciReadConfig16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    pci::get_pci_bus().lock().read_config_u16(loc(bus, device, function), offset)
}

#[no_mangle]
pub extern "C" fn Kernel_PciReadConfig32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    pci::get_pci_bus().lock().read_config_u32(loc(bus, device, function), offset)
}

#[no_mangle]
pub extern "C" fn Kernel_PciWriteConfig8(bus: u8, device: u8, function: u8, offset: u8, value: u8) {
    pci::get_pci_bus().lock().write_config_u8(loc(bus, device, function), offset, value);
}

#[no_mangle]
pub extern "C" fn Kernel_PciWriteConfig16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    pci::get_pci_bus().lock().write_config_u16(loc(bus, device, function), offset, value);
}

#[no_mangle]
pub extern "C" fn Kernel_PciWriteConfig32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    pci::get_pci_bus().lock().write_config_u32(loc(bus, device, function), offset, value);
}

#[no_mangle]
pub extern "C" fn Kernel_PciGetBarAddress(bus: u8, device: u8, function: u8, bar_index: u8) -> u64 {
    let Some(dev) = pci::get_pci_bus().lock().get_device(loc(bus, device, function)) else {
        return 0;
    };
    match dev.bars.get(bar_index as usize) {
        Some(pci::PciBar::Memory { address, .. }) => *address,
        Some(pci::PciBar::Io { address, .. }) => *address as u64,
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn Kernel_PciGetBarSize(bus: u8, device: u8, function: u8, bar_index: u8) -> u64 {
    pci::get_pci_bus().lock().probe_bar_size(loc(bus, device, function), bar_index)
}

#[no_mangle]
pub extern "C" fn Kernel_PciEnableMemorySpace(bus: u8, device: u8, function: u8) {
    pci::get_pci_bus().lock().enable_memory_space(loc(bus, device, function));
}

#[no_mangle]
pub extern "C" fn Kernel_PciEnableBusMaster(bus: u8, device: u8, function: u8) {
    pci::get_pci_bus().lock().enable_bus_master(loc(bus, device, function));
}

// ---------------------------------------------------------------------------
// Timers and delays
// ---------------------------------------------------------------------------

/// The interrupt entry stub stamps one tick per millisecond into both the
/// architecture tick counter and [`crate::timer`]'s uptime counter; there is
/// no separate HPET driver in this kernel, so HPET reads use the same
/// millisecond source scaled to the unit HPET would report in.
#[no_mangle]
pub extern "C" fn Kernel_GetUptimeNs() -> u64 {
    crate::timer::get_uptime_ms().saturating_mul(1_000_000)
}

#[no_mangle]
pub extern "C" fn Kernel_GetUptimeMs() -> u64 {
    crate::timer::get_uptime_ms()
}

#[no_mangle]
pub extern "C" fn Kernel_GetUptimeS() -> u64 {
    crate::timer::get_uptime_ms() / 1000
}

/// Nominal HPET-equivalent frequency: 1 tick/ms reported in Hz.
#[no_mangle]
pub extern "C" fn Kernel_GetHPETFrequency() -> u64 {
    1000
}

#[no_mangle]
pub extern "C" fn Kernel_GetHPETCounter() -> u64 {
    crate::timer::get_uptime_ms()
}

#[cfg(target_arch = "x86_64")]
#[no_mangle]
pub extern "C" fn Kernel_ReadTSC() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no memory side effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Calibrated once against the software tick counter over a short busy
/// window; cached after the first call since the TSC rate does not change
/// at runtime on a fixed-frequency core.
#[cfg(target_arch = "x86_64")]
#[no_mangle]
pub extern "C" fn Kernel_GetTSCFrequency() -> u64 {
    static CACHED: Mutex<Option<u64>> = Mutex::new(None);
    let mut cached = CACHED.lock();
    if let Some(hz) = *cached {
        return hz;
    }
    let start_tick = crate::arch::x86_64::timer::get_ticks();
    let start_tsc = Kernel_ReadTSC();
    while crate::arch::x86_64::timer::get_ticks() < start_tick + 10 {
        core::hint::spin_loop();
    }
    let elapsed_tsc = Kernel_ReadTSC() - start_tsc;
    // 10 ticks at the nominal 1ms/tick rate is 10ms.
    let hz = elapsed_tsc.saturating_mul(100);
    *cached = Some(hz);
    hz
}

#[no_mangle]
pub extern "C" fn Kernel_BusyWaitUs(microseconds: u64) {
    Kernel_BusyWaitMs(microseconds / 1000 + if microseconds % 1000 != 0 { 1 } else { 0 });
}

#[no_mangle]
pub extern "C" fn Kernel_BusyWaitMs(milliseconds: u64) {
    let target = crate::timer::get_uptime_ms().saturating_add(milliseconds);
    while crate::timer::get_uptime_ms() < target {
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn Kernel_AllocatePages(count: u64) -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .allocate_frames(count as usize, None)
        .map(|frame| frame.as_addr().as_u64())
        .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn Kernel_FreePages(address: u64, count: u64) {
    let frame = FrameNumber::new(address / FRAME_SIZE as u64);
    let _ = FRAME_ALLOCATOR.lock().free_frames(frame, count as usize);
}

/// This kernel maps all physical memory 1:1, so both directions are the
/// identity function.
#[no_mangle]
pub extern "C" fn Kernel_PhysicalToVirtual(phys: u64) -> u64 {
    phys
}

#[no_mangle]
pub extern "C" fn Kernel_VirtualToPhysical(virt: u64) -> u64 {
    virt
}

#[no_mangle]
pub extern "C" fn Kernel_MapMmio(phys: u64, _size: u64) -> u64 {
    phys
}

#[no_mangle]
pub extern "C" fn Kernel_GetTotalMemory() -> u64 {
    FRAME_ALLOCATOR.lock().get_stats().total_frames * FRAME_SIZE as u64
}

#[no_mangle]
pub extern "C" fn Kernel_GetFreeMemory() -> u64 {
    FRAME_ALLOCATOR.lock().get_stats().free_frames * FRAME_SIZE as u64
}

#[no_mangle]
pub extern "C" fn Kernel_GetPageSize() -> u64 {
    FRAME_SIZE as u64
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------
//
// There is no pre-emptive scheduler in this kernel (SMP scheduling fairness
// is explicitly out of scope), so this models the thread lifecycle a real
// scheduler would implement -- handle allocation, exit codes, state -- with
// run-to-completion semantics instead of real context switching: `Create`
// invokes `entry` synchronously on the calling thread before returning a
// handle to its already-terminal record. Good enough for driver init paths
// that spawn a worker and immediately join it; not a substitute for
// concurrency.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ThreadState {
    Running,
    Suspended,
    Exited,
}

struct ThreadRecord {
    id: u64,
    state: ThreadState,
    exit_code: i32,
}

static THREADS: Mutex<Vec<ThreadRecord>> = Mutex::new(Vec::new());
static NEXT_THREAD_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);
static CURRENT_THREAD_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

pub type ThreadEntry = extern "C" fn(*mut c_void);

#[no_mangle]
pub extern "C" fn Kernel_ThreadCreate(entry: ThreadEntry, arg: *mut c_void) -> u64 {
    let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    let previous = CURRENT_THREAD_ID.swap(id, Ordering::SeqCst);
    entry(arg);
    CURRENT_THREAD_ID.store(previous, Ordering::SeqCst);
    THREADS.lock().push(ThreadRecord {
        id,
        state: ThreadState::Exited,
        exit_code: 0,
    });
    id
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadExit(exit_code: i32) {
    let current = CURRENT_THREAD_ID.load(Ordering::SeqCst);
    let mut threads = THREADS.lock();
    if let Some(t) = threads.iter_mut().find(|t| t.id == current) {
        t.state = ThreadState::Exited;
        t.exit_code = exit_code;
    }
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadCurrentId() -> u64 {
    CURRENT_THREAD_ID.load(Ordering::SeqCst)
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadCurrentHandle() -> u64 {
    Kernel_ThreadCurrentId()
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadSleep(milliseconds: u64) {
    Kernel_BusyWaitMs(milliseconds);
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadYield() {
    core::hint::spin_loop();
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadGetExitCode(handle: u64) -> i32 {
    THREADS
        .lock()
        .iter()
        .find(|t| t.id == handle)
        .map(|t| t.exit_code)
        .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadGetState(handle: u64) -> i32 {
    THREADS
        .lock()
        .iter()
        .find(|t| t.id == handle)
        .map(|t| t.state as i32)
        .unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadSuspend(handle: u64) -> bool {
    let mut threads = THREADS.lock();
    match threads.iter_mut().find(|t| t.id == handle) {
        Some(t) if t.state == ThreadState::Running => {
            t.state = ThreadState::Suspended;
            true
        }
        _ => false,
    }
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadResume(handle: u64) -> bool {
    let mut threads = THREADS.lock();
    match threads.iter_mut().find(|t| t.id == handle) {
        Some(t) if t.state == ThreadState::Suspended => {
            t.state = ThreadState::Running;
            true
        }
        _ => false,
    }
}

#[no_mangle]
pub extern "C" fn Kernel_ThreadCount() -> u64 {
    THREADS.lock().len() as u64
}

// ---------------------------------------------------------------------------
// Syscall handler registration
// ---------------------------------------------------------------------------
//
// Thin re-exports under the fixed `Kernel_Register*Handler` names; the real
// registration logic lives in `syscall::filesystem` and is shared with the
// in-tree default handlers installed at boot.

#[no_mangle]
pub extern "C" fn Kernel_RegisterMkdirHandler(handler: crate::syscall::filesystem::MkdirHandler) {
    crate::syscall::register_mkdir_handler(handler);
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterRmdirHandler(handler: crate::syscall::filesystem::RmdirHandler) {
    crate::syscall::register_rmdir_handler(handler);
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterUnlinkHandler(handler: crate::syscall::filesystem::UnlinkHandler) {
    crate::syscall::register_unlink_handler(handler);
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterGetdentsHandler(handler: crate::syscall::filesystem::GetdentsHandler) {
    crate::syscall::register_getdents_handler(handler);
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterAccessHandler(handler: crate::syscall::filesystem::AccessHandler) {
    crate::syscall::register_access_handler(handler);
}

#[no_mangle]
pub extern "C" fn Kernel_RegisterRenameHandler(handler: crate::syscall::filesystem::RenameHandler) {
    crate::syscall::register_rename_handler(handler);
}

// ---------------------------------------------------------------------------
// Reflection and loader
// ---------------------------------------------------------------------------

pub type ProbeFn = extern "C" fn(*const DeviceInfo) -> bool;
pub type BindFn = extern "C" fn(*const DeviceInfo) -> *mut c_void;
pub type GetDeviceFn = extern "C" fn(*mut c_void) -> *const DeviceInfo;

/// One driver's resolved entry points, keyed by name. For an in-tree driver
/// these are ordinary function pointers to its `probe`/`bind`/`device`
/// wrappers; a real module loader would instead resolve them out of a
/// freshly mapped ELF image's symbol table.
struct LoadedDriver {
    name: &'static str,
    probe: ProbeFn,
    bind: BindFn,
    get_device: GetDeviceFn,
}

static LOADED_DRIVERS: Mutex<Vec<LoadedDriver>> = Mutex::new(Vec::new());

/// Register an in-tree driver's resolved `Probe`/`Bind`/`GetDevice` triple
/// under `name`, making it reachable through the reflection exports below.
pub fn register_driver(name: &'static str, probe: ProbeFn, bind: BindFn, get_device: GetDeviceFn) {
    LOADED_DRIVERS.lock().push(LoadedDriver {
        name,
        probe,
        bind,
        get_device,
    });
}

const METHOD_PROBE: i32 = 0;
const METHOD_BIND: i32 = 1;
const METHOD_GET_DEVICE: i32 = 2;

/// Returns a 1-based handle into the loaded-driver table, or `0` if no
/// driver with this name is registered.
#[no_mangle]
pub extern "C" fn Reflection_FindEntryType(name: *const u8, name_len: usize) -> u64 {
    if name.is_null() {
        return 0;
    }
    // SAFETY: caller guarantees `name` is valid for `name_len` bytes.
    let bytes = unsafe { core::slice::from_raw_parts(name, name_len) };
    let Ok(needle) = core::str::from_utf8(bytes) else {
        return 0;
    };
    LOADED_DRIVERS
        .lock()
        .iter()
        .position(|d| d.name == needle)
        .map(|i| (i + 1) as u64)
        .unwrap_or(0)
}

/// Resolves one of the three fixed method names to a method id usable with
/// [`Reflection_Invoke`]. Unknown names return `-1`; this is a closed set,
/// not a general symbol table.
#[no_mangle]
pub extern "C" fn Reflection_FindMethod(entry_handle: u64, method_name: *const u8, method_len: usize) -> i32 {
    if entry_handle == 0 || method_name.is_null() {
        return -1;
    }
    // SAFETY: caller guarantees `method_name` is valid for `method_len` bytes.
    let bytes = unsafe { core::slice::from_raw_parts(method_name, method_len) };
    match core::str::from_utf8(bytes) {
        Ok("Probe") => METHOD_PROBE,
        Ok("Bind") => METHOD_BIND,
        Ok("GetDevice") => METHOD_GET_DEVICE,
        _ => -1,
    }
}

/// Invoke a previously resolved method. `arg` is interpreted according to
/// `method_id`: a `*const DeviceInfo` for `Probe`/`Bind`, a driver handle
/// (opaque, driver-defined) for `GetDevice`. The return value is likewise
/// method-dependent and must be reinterpreted by the caller.
#[no_mangle]
pub extern "C" fn Reflection_Invoke(entry_handle: u64, method_id: i32, arg: *mut c_void) -> *mut c_void {
    if entry_handle == 0 {
        return core::ptr::null_mut();
    }
    let drivers = LOADED_DRIVERS.lock();
    let Some(driver) = drivers.get((entry_handle - 1) as usize) else {
        return core::ptr::null_mut();
    };
    match method_id {
        METHOD_PROBE => (driver.probe)(arg as *const DeviceInfo) as usize as *mut c_void,
        METHOD_BIND => (driver.bind)(arg as *const DeviceInfo),
        METHOD_GET_DEVICE => (driver.get_device)(arg) as *mut c_void,
        _ => core::ptr::null_mut(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn interlocked_increment32_returns_new_value() {
        let mut x: i32 = 41;
        let result = unsafe { Interlocked_Increment32(&mut x as *mut i32) };
        assert_eq!(result, 42);
        assert_eq!(x, 42);
    }

    #[test]
    fn interlocked_compare_exchange32_swaps_on_match() {
        let mut x: i32 = 5;
        let prev = unsafe { Interlocked_CompareExchange32(&mut x as *mut i32, 5, 9) };
        assert_eq!(prev, 5);
        assert_eq!(x, 9);
    }

    #[test]
    fn interlocked_compare_exchange32_leaves_value_on_mismatch() {
        let mut x: i32 = 5;
        let prev = unsafe { Interlocked_CompareExchange32(&mut x as *mut i32, 1, 9) };
        assert_eq!(prev, 5);
        assert_eq!(x, 5);
    }

    #[test]
    fn allocate_irq_stays_in_dynamic_range() {
        let vector = Kernel_AllocateIRQ();
        assert!(vector >= 0);
        assert!((irq::IRQ_VECTOR_BASE as i32..irq::IRQ_VECTOR_END as i32).contains(&vector));
        Kernel_FreeIRQ(vector as u8);
    }

    #[test]
    fn page_size_matches_frame_size() {
        assert_eq!(Kernel_GetPageSize(), FRAME_SIZE as u64);
    }

    extern "C" fn probe_always(_: *const DeviceInfo) -> bool {
        true
    }
    extern "C" fn bind_noop(_: *const DeviceInfo) -> *mut c_void {
        core::ptr::null_mut()
    }
    extern "C" fn get_device_noop(_: *mut c_void) -> *const DeviceInfo {
        core::ptr::null()
    }

    #[test]
    fn reflection_round_trip() {
        register_driver("test-driver", probe_always, bind_noop, get_device_noop);
        let handle = Reflection_FindEntryType(b"test-driver".as_ptr(), 11);
        assert_ne!(handle, 0);
        let method = Reflection_FindMethod(handle, b"Probe".as_ptr(), 5);
        assert_eq!(method, METHOD_PROBE);
        let result = Reflection_Invoke(handle, method, core::ptr::null_mut());
        assert_eq!(result as usize, true as usize);
    }

    #[test]
    fn reflection_unknown_name_returns_zero_handle() {
        assert_eq!(Reflection_FindEntryType(b"nope".as_ptr(), 4), 0);
    }
}
