//! Cooperative tasks with continuations.
//!
//! A [`Task`] carries a status word and a continuation list. Completion is
//! idempotent and runs every continuation exactly once; a panicking
//! continuation is not caught here (the kernel export layer catches panics
//! at the ABI boundary, not within this module), but one continuation's
//! failure never poisons another's since each just sees the same terminal
//! status.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::error::{AsyncError, KernelError};

/// Status word for a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Pending = 0,
    RanToCompletion = 1,
    Faulted = 2,
    Canceled = 3,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskStatus::RanToCompletion,
            2 => TaskStatus::Faulted,
            3 => TaskStatus::Canceled,
            _ => TaskStatus::Pending,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// The terminal outcome a task completes with.
pub enum TaskResult<T> {
    Completed(T),
    Faulted(KernelError),
    Canceled,
}

type Continuation = Box<dyn FnOnce() + Send>;

/// A cooperative task: single-threaded scheduling at the point continuations
/// fire — a continuation runs on the thread that completed the task, there
/// is no separate scheduling pass.
pub struct Task<T> {
    status: AtomicU8,
    result: Mutex<Option<TaskResult<T>>>,
    continuations: Mutex<Vec<Continuation>>,
}

impl<T> Default for Task<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Task<T> {
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(TaskStatus::Pending as u8),
            result: Mutex::new(None),
            continuations: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    /// Transition to a terminal state and run every continuation exactly
    /// once. Subsequent calls are no-ops.
    pub fn complete_with(&self, result: TaskResult<T>) {
        let status = match &result {
            TaskResult::Completed(_) => TaskStatus::RanToCompletion,
            TaskResult::Faulted(_) => TaskStatus::Faulted,
            TaskResult::Canceled => TaskStatus::Canceled,
        };

        if self
            .status
            .compare_exchange(
                TaskStatus::Pending as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        *self.result.lock() = Some(result);

        let continuations = core::mem::take(&mut *self.continuations.lock());
        for cb in continuations {
            cb();
        }
    }

    /// Register a continuation. If the task is already terminal, `cb` runs
    /// inline.
    pub fn add_continuation(&self, cb: impl FnOnce() + Send + 'static) {
        if self.is_completed() {
            cb();
            return;
        }
        self.continuations.lock().push(Box::new(cb));
    }

    /// The awaitable's terminal read: returns the value on success,
    /// re-throws the task's exception on fault, and re-throws a
    /// cancellation error on cancel.
    ///
    /// Returns `None` while the task is still pending.
    pub fn get_result(&self) -> Option<Result<T, KernelError>>
    where
        T: Clone,
    {
        let guard = self.result.lock();
        match guard.as_ref()? {
            TaskResult::Completed(v) => Some(Ok(v.clone())),
            TaskResult::Faulted(e) => Some(Err(*e)),
            TaskResult::Canceled => Some(Err(KernelError::AsyncError(AsyncError::TaskCanceled))),
        }
    }

    /// Busy-spin until the task reaches a terminal state.
    ///
    /// Reserved for initialization paths; the kernel has no futex-like
    /// primitive to block a thread on a status word yet, so this degrades
    /// to a spin loop with an occasional yield.
    pub fn wait(&self) {
        let mut spins = 0u32;
        while !self.is_completed() {
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn complete_is_idempotent_and_runs_continuations_once() {
        let task: Task<u32> = Task::new();
        let calls = alloc::sync::Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        task.add_continuation(move || { c.fetch_add(1, Ordering::SeqCst); });

        task.complete_with(TaskResult::Completed(7));
        task.complete_with(TaskResult::Completed(9));

        assert!(task.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.get_result().unwrap().unwrap(), 7);
    }

    #[test]
    fn continuation_after_completion_runs_inline() {
        let task: Task<u32> = Task::new();
        task.complete_with(TaskResult::Completed(1));

        let ran = alloc::sync::Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        task.add_continuation(move || { r.fetch_add(1, Ordering::SeqCst); });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn faulted_task_reports_error_on_get_result() {
        let task: Task<u32> = Task::new();
        task.complete_with(TaskResult::Faulted(KernelError::NotImplemented {
            feature: "test",
        }));

        assert_eq!(task.status(), TaskStatus::Faulted);
        assert!(task.get_result().unwrap().is_err());
    }
}
