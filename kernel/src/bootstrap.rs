//! Kernel-wide singleton state and the post-init idle loop.
//!
//! Per the design note on global state: the MMIO arena cursor, the IRQ
//! bitmap, the mount table, and the loaded-driver registry are process-wide
//! singletons with an idempotent `init()` and no teardown. Rather than
//! scatter four independent statics, they are grouped behind one
//! `KernelCore` accessed through a `OnceLock`, consistent with how the rest
//! of this kernel publishes global state (`sync::once_lock`).

use crate::drivers::pci::MmioArena;
use crate::irq::IrqBitmap;
use crate::sync::once_lock::OnceLock;

/// Aggregate of the kernel's process-wide singletons.
pub struct KernelCore {
    pub mmio_arena: MmioArena,
    pub irq_bitmap: IrqBitmap,
}

impl KernelCore {
    const fn new() -> Self {
        Self {
            mmio_arena: MmioArena::new(),
            irq_bitmap: IrqBitmap::new(),
        }
    }
}

static CORE: OnceLock<KernelCore> = OnceLock::new();

/// Idempotent: later calls observe the already-initialized core.
pub fn core() -> &'static KernelCore {
    CORE.get_or_init(KernelCore::new)
}

/// Entered once all subsystems in `main::_start` have initialized. Kernel
/// threads are pre-emptive, so this just parks the boot thread; interrupt
/// handlers and driver polling loops do the real work from here on.
pub fn idle_loop() -> ! {
    loop {
        crate::arch::halt();
    }
}
