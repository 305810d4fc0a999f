//! Synchronization Primitives
//!
//! Safe synchronization and global state management for Rust 2024 edition.

pub mod cancellation;
pub mod once_lock;
pub mod task;

pub use cancellation::{CancellationSource, CancellationToken, LinkedSource};
pub use once_lock::{OnceLock, LazyLock, GlobalState};
pub use task::{Task, TaskResult, TaskStatus};
