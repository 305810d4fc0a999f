//! Cancellation sources and tokens.
//!
//! A [`CancellationSource`] owns a flag, a lock, and a list of callbacks.
//! A [`CancellationToken`] is a lightweight handle borrowed from a source.
//! Linked sources form a DAG: a linked source registers a forwarding
//! callback with each of its input tokens, so the first input to cancel
//! transitions the linked source too.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{AsyncError, KernelError};

type Callback = Box<dyn FnOnce() + Send>;

/// A cancellation flag shared between a source and the tokens derived from
/// it.
///
/// Once [`CancellationSource::cancel`] sets the flag it never clears: the
/// only transition is armed → canceled.
pub struct CancellationSource {
    canceled: AtomicBool,
    disposed: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub const fn new() -> Self {
        Self {
            canceled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Borrow a token for this source.
    pub fn token(&self) -> CancellationToken<'_> {
        CancellationToken { source: self }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Set the flag, snapshot the callback list under the lock, then run
    /// every callback unlocked so a callback registering a new callback
    /// cannot deadlock against this call.
    ///
    /// Idempotent: a second call is a no-op and returns `Ok(())`.
    pub fn cancel(&self) -> Result<(), KernelError> {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let callbacks = core::mem::take(&mut *self.callbacks.lock());
        let mut failures = 0usize;
        for cb in callbacks {
            cb();
            let _ = &mut failures; // callbacks are infallible; kept for future fail-fast policy
        }
        Ok(())
    }

    /// Register a callback to run when this source cancels.
    ///
    /// If the source is already canceled, `cb` runs inline before this
    /// call returns.
    pub fn register(&self, cb: impl FnOnce() + Send + 'static) -> Result<(), KernelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(KernelError::AsyncError(AsyncError::ObjectDisposed));
        }
        if self.is_canceled() {
            cb();
            return Ok(());
        }
        self.callbacks.lock().push(Box::new(cb));
        Ok(())
    }

    /// Release all pending callbacks without running them and mark the
    /// source disposed. Subsequent `register`/`cancel` calls fault.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.callbacks.lock().clear();
    }

    /// Build a source that transitions to canceled the first time any of
    /// `tokens` does.
    pub fn linked(tokens: &[CancellationToken<'_>]) -> LinkedSource {
        let source = Box::leak(Box::new(CancellationSource::new()));

        // Wrapper to carry the raw pointer across the `Send + 'static`
        // closure bound required by `register`.
        struct SendPtr(*const CancellationSource);
        // SAFETY: `source` is leaked for the lifetime of the returned
        // `LinkedSource`, which owns the raw pointer and reconstructs
        // the box on drop.
        unsafe impl Send for SendPtr {}

        for token in tokens {
            let target = SendPtr(&*source as *const CancellationSource);
            let _ = token.source.register(move || {
                let target = target;
                unsafe {
                    let _ = (*target.0).cancel();
                }
            });
        }
        LinkedSource { source }
    }
}

/// A lightweight, borrowed handle to a [`CancellationSource`].
#[derive(Clone, Copy)]
pub struct CancellationToken<'a> {
    source: &'a CancellationSource,
}

impl<'a> CancellationToken<'a> {
    pub fn is_canceled(&self) -> bool {
        self.source.is_canceled()
    }

    pub fn register(&self, cb: impl FnOnce() + Send + 'static) -> Result<(), KernelError> {
        self.source.register(cb)
    }
}

/// An owned [`CancellationSource`] created by [`CancellationSource::linked`].
///
/// Frees the underlying leaked source on drop. Cancellation-linked sources
/// form a DAG, not a cycle: callbacks flow from input token to linked
/// source only, never back.
pub struct LinkedSource {
    source: &'static CancellationSource,
}

impl LinkedSource {
    pub fn token(&self) -> CancellationToken<'_> {
        self.source.token()
    }

    pub fn cancel(&self) -> Result<(), KernelError> {
        self.source.cancel()
    }

    pub fn is_canceled(&self) -> bool {
        self.source.is_canceled()
    }
}

impl Drop for LinkedSource {
    fn drop(&mut self) {
        // SAFETY: `source` was produced by `Box::leak` in `linked` and is
        // not referenced anywhere else once this `LinkedSource` drops.
        unsafe {
            drop(Box::from_raw(self.source as *const CancellationSource as *mut CancellationSource));
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cancel_runs_registered_callbacks_once() {
        let source = CancellationSource::new();
        let calls = alloc::sync::Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        source.register(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
        source.cancel().unwrap();
        source.cancel().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_cancel_runs_inline() {
        let source = CancellationSource::new();
        source.cancel().unwrap();

        let ran = alloc::sync::Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        source.register(move || { r.fetch_add(1, Ordering::SeqCst); }).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn linked_source_cancels_with_input() {
        let s1 = CancellationSource::new();
        let s2 = CancellationSource::new();
        let linked = CancellationSource::linked(&[s1.token(), s2.token()]);

        assert!(!linked.is_canceled());
        s2.cancel().unwrap();
        assert!(linked.is_canceled());
    }

    #[test]
    fn dispose_rejects_further_registration() {
        let source = CancellationSource::new();
        source.dispose();
        let err = source.register(|| {}).unwrap_err();
        assert_eq!(err, KernelError::AsyncError(AsyncError::ObjectDisposed));
    }
}
