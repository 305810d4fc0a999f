//! IRQ lines and dynamically-assigned vectors.
//!
//! Two distinct things live here. [`IrqManager`] is the fixed-line side:
//! legacy IRQ numbers (timer, keyboard, ...) with a handler table and
//! enable/disable/eoi delegated to the Local APIC + I/O APIC. [`IrqBitmap`]
//! is the dynamic side: a 32-bit pool of interrupt *vectors* `[48, 80)`
//! handed out to drivers that need their own vector (virtio, future PCI
//! devices) and released when the driver unbinds. The bitmap is owned by
//! `KernelCore`, not by this module, since it has no other state to
//! synchronize against.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sync::once_lock::GlobalState,
};

// ---------------------------------------------------------------------------
// Dynamic vector allocator
// ---------------------------------------------------------------------------

/// First vector the allocator hands out.
pub const IRQ_VECTOR_BASE: u8 = 48;
/// One past the last vector the allocator hands out (exclusive).
pub const IRQ_VECTOR_END: u8 = 80;

/// Bitmap over vectors `[48, 80)`. Bit `i` set means vector `48 + i` is
/// allocated. Bits are only ever flipped via compare-and-swap.
pub struct IrqBitmap {
    bits: AtomicU32,
}

impl IrqBitmap {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Claim the lowest free vector, or `None` once all 32 are taken. The
    /// CAS loop only retries on a lost race against another allocating CPU;
    /// it never retries because the pool is exhausted, so it carries no
    /// iteration budget.
    pub fn allocate(&self) -> Option<u8> {
        loop {
            let current = self.bits.load(Ordering::Acquire);
            let free = !current;
            if free == 0 {
                return None;
            }
            let bit = free.trailing_zeros();
            let mask = 1u32 << bit;
            match self.bits.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(IRQ_VECTOR_BASE + bit as u8),
                Err(_) => continue,
            }
        }
    }

    /// Release a previously allocated vector. Out-of-range vectors are
    /// ignored rather than panicking, since callers pass back whatever
    /// `allocate` gave them.
    pub fn free(&self, vector: u8) {
        if !(IRQ_VECTOR_BASE..IRQ_VECTOR_END).contains(&vector) {
            return;
        }
        let bit = (vector - IRQ_VECTOR_BASE) as u32;
        self.bits.fetch_and(!(1u32 << bit), Ordering::AcqRel);
    }
}

impl Default for IrqBitmap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// IRQ number newtype
// ---------------------------------------------------------------------------

/// Legacy/fixed IRQ line number, distinct from the dynamic vector space
/// above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u32);

impl IrqNumber {
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for IrqNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<IrqNumber> for u32 {
    fn from(irq: IrqNumber) -> u32 {
        irq.0
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// Handler invoked by [`dispatch`] when its IRQ fires.
pub type IrqHandler = fn(IrqNumber);

const MAX_IRQ: u32 = 256;

/// Handler table plus dispatch counter for fixed IRQ lines.
struct IrqManager {
    #[cfg(feature = "alloc")]
    handlers: BTreeMap<u32, IrqHandler>,
    dispatch_count: u64,
}

impl IrqManager {
    fn new() -> Self {
        Self {
            #[cfg(feature = "alloc")]
            handlers: BTreeMap::new(),
            dispatch_count: 0,
        }
    }

    #[cfg(feature = "alloc")]
    fn register(&mut self, irq: IrqNumber, handler: IrqHandler) -> KernelResult<()> {
        if irq.0 >= MAX_IRQ {
            return Err(KernelError::InvalidArgument {
                name: "irq",
                value: "exceeds maximum IRQ line",
            });
        }
        if self.handlers.contains_key(&irq.0) {
            return Err(KernelError::ResourceExhausted {
                resource: "IRQ handler slot",
            });
        }
        self.handlers.insert(irq.0, handler);
        Ok(())
    }

    #[cfg(feature = "alloc")]
    fn unregister(&mut self, irq: IrqNumber) -> KernelResult<()> {
        self.handlers
            .remove(&irq.0)
            .map(|_| ())
            .ok_or(KernelError::InvalidArgument {
                name: "irq",
                value: "no handler registered",
            })
    }

    #[cfg(feature = "alloc")]
    fn dispatch(&mut self, irq: IrqNumber) {
        self.dispatch_count += 1;
        if let Some(&handler) = self.handlers.get(&irq.0) {
            handler(irq);
        }
    }

    fn dispatch_count(&self) -> u64 {
        self.dispatch_count
    }
}

static IRQ_MANAGER: GlobalState<Mutex<IrqManager>> = GlobalState::new();

#[cfg(target_arch = "x86_64")]
fn arch_enable_irq(irq: u32) -> KernelResult<()> {
    crate::arch::x86_64::apic::unmask_irq(irq as u8)
}

#[cfg(target_arch = "x86_64")]
fn arch_disable_irq(irq: u32) -> KernelResult<()> {
    crate::arch::x86_64::apic::mask_irq(irq as u8)
}

#[cfg(target_arch = "x86_64")]
fn arch_eoi(_irq: u32) -> KernelResult<()> {
    crate::arch::x86_64::apic::send_eoi();
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn arch_set_priority(_irq: u32, _priority: u8) -> KernelResult<()> {
    // The Local APIC has no per-vector priority register; TPR governs a
    // whole class of vectors at once, so this is a no-op here.
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn arch_is_pending(_irq: u32) -> KernelResult<bool> {
    Ok(false)
}

/// Initialize the fixed-line IRQ manager. Idempotent.
pub fn init() {
    let _ = IRQ_MANAGER.init(Mutex::new(IrqManager::new()));
}

#[cfg(feature = "alloc")]
pub fn register_handler(irq: IrqNumber, handler: IrqHandler) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().register(irq, handler))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

#[cfg(feature = "alloc")]
pub fn unregister_handler(irq: IrqNumber) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().unregister(irq))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

/// Called by the architecture's interrupt entry stub. Spurious (unregistered)
/// IRQs are silently dropped.
#[cfg(feature = "alloc")]
pub fn dispatch(irq: IrqNumber) {
    IRQ_MANAGER.with_mut(|mtx| mtx.lock().dispatch(irq));
}

pub fn enable_irq(irq: IrqNumber) -> KernelResult<()> {
    arch_enable_irq(irq.0)
}

pub fn disable_irq(irq: IrqNumber) -> KernelResult<()> {
    arch_disable_irq(irq.0)
}

pub fn eoi(irq: IrqNumber) -> KernelResult<()> {
    arch_eoi(irq.0)
}

pub fn set_priority(irq: IrqNumber, priority: u8) -> KernelResult<()> {
    arch_set_priority(irq.0, priority)
}

pub fn is_pending(irq: IrqNumber) -> KernelResult<bool> {
    arch_is_pending(irq.0)
}

pub fn dispatch_count() -> u64 {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().dispatch_count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_allocate_32_distinct_then_exhaust() {
        let bitmap = IrqBitmap::new();
        let mut seen: alloc::vec::Vec<u8> = alloc::vec::Vec::new();
        for _ in 0..32 {
            let v = bitmap.allocate().expect("should have a free vector");
            assert!(!seen.contains(&v));
            seen.push(v);
        }
        assert!(bitmap.allocate().is_none());
    }

    #[test_case]
    fn test_free_then_reallocate() {
        let bitmap = IrqBitmap::new();
        let v = bitmap.allocate().unwrap();
        bitmap.free(v);
        let v2 = bitmap.allocate().unwrap();
        assert_eq!(v, v2);
    }

    #[test_case]
    fn test_vector_range() {
        let bitmap = IrqBitmap::new();
        for _ in 0..32 {
            let v = bitmap.allocate().unwrap();
            assert!((IRQ_VECTOR_BASE..IRQ_VECTOR_END).contains(&v));
        }
    }
}
