//! Syscall bridge between loaded drivers and the VFS.
//!
//! A driver module registers a handler per filesystem operation
//! (`mkdir`, `rmdir`, `unlink`, `getdents`, `access`, `rename`); the
//! kernel dispatches to the most recently registered handler for each
//! slot. Handlers take raw C-ABI pointers and return a negative errno on
//! failure, mirroring the `Kernel_Register*Handler` export group.

#![allow(dead_code)]

pub mod filesystem;

pub use filesystem::{
    register_access_handler, register_getdents_handler, register_mkdir_handler,
    register_rename_handler, register_rmdir_handler, register_unlink_handler,
};

/// Register the kernel's own VFS-backed handlers as the default
/// implementation for every syscall bridge slot.
pub fn init() {
    crate::println!("[syscall] Registering default filesystem handlers");
    filesystem::register_default_handlers();
}
