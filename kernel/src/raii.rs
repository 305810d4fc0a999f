//! RAII (Resource Acquisition Is Initialization) patterns for kernel resources
//!
//! This module provides RAII wrappers for various kernel resources to ensure
//! proper cleanup when resources go out of scope.

use core::ops::{Deref, DerefMut};

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

// Stub Vec for no-alloc builds
#[cfg(not(feature = "alloc"))]
struct Vec<T> {
    _phantom: core::marker::PhantomData<T>,
}

#[cfg(not(feature = "alloc"))]
impl<T> Vec<T> {
    fn len(&self) -> usize {
        0
    }
    fn clone(&self) -> Self {
        Self {
            _phantom: core::marker::PhantomData,
        }
    }
}

use spin::MutexGuard;

use crate::{mm::PhysicalFrame, println};

/// RAII wrapper for physical frames
///
/// Automatically returns frames to the global frame allocator when dropped
pub struct FrameGuard {
    frame: PhysicalFrame,
}

impl FrameGuard {
    /// Create a new frame guard
    pub fn new(frame: PhysicalFrame) -> Self {
        Self { frame }
    }

    /// Get the physical frame address
    pub fn addr(&self) -> usize {
        self.frame.addr()
    }

    /// Release ownership of the frame without deallocating
    pub fn leak(self) -> PhysicalFrame {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Return the frame to the allocator
        unsafe {
            crate::mm::frame_allocator::free_frame(self.frame);
        }
        println!("[RAII] Released frame at {:#x}", self.frame.addr());
    }
}

impl Deref for FrameGuard {
    type Target = PhysicalFrame;

    fn deref(&self) -> &Self::Target {
        &self.frame
    }
}

/// RAII wrapper for multiple frames
pub struct FramesGuard {
    frames: Vec<PhysicalFrame>,
    #[allow(dead_code)]
    count: usize,
}

impl FramesGuard {
    /// Create a new frames guard
    pub fn new(frames: Vec<PhysicalFrame>) -> Self {
        let count = frames.len();
        Self { frames, count }
    }

    /// Release ownership of the frames without deallocating
    pub fn leak(self) -> Vec<PhysicalFrame> {
        let frames = self.frames.clone();
        core::mem::forget(self);
        frames
    }
}

impl Drop for FramesGuard {
    fn drop(&mut self) {
        // Return all frames to the allocator
        for frame in &self.frames {
            unsafe {
                crate::mm::frame_allocator::free_frame(*frame);
            }
        }
        println!("[RAII] Released {} frames", self.count);
    }
}

/// RAII wrapper for a dynamically-assigned IRQ vector.
///
/// Claims a vector from [`crate::irq::IrqBitmap`] on construction and
/// returns it to the pool on drop, so a driver that binds to a PCI/virtio
/// device never has to remember to release its vector on every error path.
pub struct IrqVectorGuard {
    vector: u8,
}

impl IrqVectorGuard {
    /// Claim the lowest free vector from the kernel's dynamic IRQ pool.
    pub fn allocate() -> Result<Self, crate::error::KernelError> {
        let vector = crate::bootstrap::core()
            .irq_bitmap
            .allocate()
            .ok_or(crate::error::KernelError::ResourceExhausted {
                resource: "irq_vector",
            })?;
        Ok(Self { vector })
    }

    /// The claimed vector number.
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Release ownership of the vector without returning it to the pool.
    pub fn leak(self) -> u8 {
        let vector = self.vector;
        core::mem::forget(self);
        vector
    }
}

impl Drop for IrqVectorGuard {
    fn drop(&mut self) {
        crate::bootstrap::core().irq_bitmap.free(self.vector);
        println!("[RAII] Released IRQ vector {}", self.vector);
    }
}

/// RAII lock guard that logs acquisition and release
pub struct TrackedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[allow(dead_code)]
    name: &'static str,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    /// Create a new tracked mutex guard
    pub fn new(guard: MutexGuard<'a, T>, name: &'static str) -> Self {
        println!("[RAII] Acquired lock: {}", name);
        Self { guard, name }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        println!("[RAII] Released lock: {}", self.name);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Macro to create RAII scope guards
#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

/// Generic scope guard that runs cleanup code on drop
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Create a new scope guard
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Cancel the cleanup
    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_guard() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| {
                cleaned = true;
            });
        }
        assert!(cleaned);
    }

    #[test]
    fn test_scope_guard_cancel() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| {
                cleaned = true;
            });
            guard.cancel();
        }
        assert!(!cleaned);
    }
}
