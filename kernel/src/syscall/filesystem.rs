//! VFS-backed handlers for the filesystem syscall bridge.
//!
//! Each handler converts between a null-terminated UTF-8 path pointer
//! (bounded to 4095 bytes) and the internal path string, then maps the
//! VFS's [`FsError`] to a negative Linux-style errno per the closed
//! mapping in [`FsError::to_errno`]. Only the most recently registered
//! handler for a given slot is ever called.

extern crate alloc;

use alloc::{string::String, vec::Vec};

use spin::Mutex;

use crate::{
    error::FsError,
    fs::{self, NodeType, Permissions},
};

const PATH_MAX: usize = 4095;

/// `Kernel_RegisterMkdirHandler(handler: fn(path:*const u8, mode:i32) -> i32)`
pub type MkdirHandler = fn(path: *const u8, mode: i32) -> i32;
pub type RmdirHandler = fn(path: *const u8) -> i32;
pub type UnlinkHandler = fn(path: *const u8) -> i32;
/// `Kernel_RegisterGetdentsHandler(handler: fn(path:*const u8, buf:*mut u8, count:i32, offset:*mut i64) -> i32)`
pub type GetdentsHandler = fn(path: *const u8, buf: *mut u8, count: i32, offset: *mut i64) -> i32;
pub type AccessHandler = fn(path: *const u8, mode: i32) -> i32;
pub type RenameHandler = fn(old_path: *const u8, new_path: *const u8) -> i32;

static MKDIR_HANDLER: Mutex<Option<MkdirHandler>> = Mutex::new(None);
static RMDIR_HANDLER: Mutex<Option<RmdirHandler>> = Mutex::new(None);
static UNLINK_HANDLER: Mutex<Option<UnlinkHandler>> = Mutex::new(None);
static GETDENTS_HANDLER: Mutex<Option<GetdentsHandler>> = Mutex::new(None);
static ACCESS_HANDLER: Mutex<Option<AccessHandler>> = Mutex::new(None);
static RENAME_HANDLER: Mutex<Option<RenameHandler>> = Mutex::new(None);

macro_rules! register_fn {
    ($fn_name:ident, $slot:ident, $handler_ty:ty) => {
        pub fn $fn_name(handler: $handler_ty) {
            *$slot.lock() = Some(handler);
        }
    };
}

register_fn!(register_mkdir_handler, MKDIR_HANDLER, MkdirHandler);
register_fn!(register_rmdir_handler, RMDIR_HANDLER, RmdirHandler);
register_fn!(register_unlink_handler, UNLINK_HANDLER, UnlinkHandler);
register_fn!(register_getdents_handler, GETDENTS_HANDLER, GetdentsHandler);
register_fn!(register_access_handler, ACCESS_HANDLER, AccessHandler);
register_fn!(register_rename_handler, RENAME_HANDLER, RenameHandler);

pub fn dispatch_mkdir(path: *const u8, mode: i32) -> i32 {
    match *MKDIR_HANDLER.lock() {
        Some(h) => h(path, mode),
        None => FsError::NotSupported.to_errno(),
    }
}

pub fn dispatch_rmdir(path: *const u8) -> i32 {
    match *RMDIR_HANDLER.lock() {
        Some(h) => h(path),
        None => FsError::NotSupported.to_errno(),
    }
}

pub fn dispatch_unlink(path: *const u8) -> i32 {
    match *UNLINK_HANDLER.lock() {
        Some(h) => h(path),
        None => FsError::NotSupported.to_errno(),
    }
}

pub fn dispatch_getdents(path: *const u8, buf: *mut u8, count: i32, offset: *mut i64) -> i32 {
    match *GETDENTS_HANDLER.lock() {
        Some(h) => h(path, buf, count, offset),
        None => FsError::NotSupported.to_errno(),
    }
}

pub fn dispatch_access(path: *const u8, mode: i32) -> i32 {
    match *ACCESS_HANDLER.lock() {
        Some(h) => h(path, mode),
        None => FsError::NotSupported.to_errno(),
    }
}

pub fn dispatch_rename(old_path: *const u8, new_path: *const u8) -> i32 {
    match *RENAME_HANDLER.lock() {
        Some(h) => h(old_path, new_path),
        None => FsError::NotSupported.to_errno(),
    }
}

/// Read a null-terminated UTF-8 path from a raw pointer, bounded to
/// [`PATH_MAX`] bytes.
///
/// # Safety
///
/// `ptr` must point to a null-terminated, readable byte sequence.
unsafe fn read_path(ptr: *const u8) -> Result<String, FsError> {
    if ptr.is_null() {
        return Err(FsError::InvalidPath);
    }

    let mut bytes = Vec::new();
    let mut cursor = ptr;
    loop {
        let byte = *cursor;
        if byte == 0 {
            break;
        }
        if bytes.len() >= PATH_MAX {
            return Err(FsError::NameTooLong);
        }
        bytes.push(byte);
        cursor = cursor.add(1);
    }

    String::from_utf8(bytes).map_err(|_| FsError::InvalidPath)
}

fn map_vfs_err(e: &'static str) -> FsError {
    match e {
        "Path not mounted" | "Root filesystem not mounted" => FsError::NotFound,
        "Path already mounted" | "Root filesystem already mounted" => FsError::AlreadyExists,
        "Invalid path" => FsError::InvalidPath,
        "Not a directory" => FsError::NotADirectory,
        "Rename across mounts is not supported" | "Directory rename is not supported" => {
            FsError::NotSupported
        }
        // The VFS layer otherwise reports opaque `&'static str` reasons
        // from filesystem backends; anything not distinguished above
        // collapses to I/O error per the catch-all in `FsError::to_errno`.
        _ => FsError::IoError,
    }
}

fn default_mkdir(path: *const u8, mode: i32) -> i32 {
    let result = (|| -> Result<(), FsError> {
        let path = unsafe { read_path(path)? };
        let vfs = fs::get_vfs().write();
        vfs.mkdir(&path, Permissions::from_mode(mode as u32))
            .map_err(map_vfs_err)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn default_rmdir(path: *const u8) -> i32 {
    let result = (|| -> Result<(), FsError> {
        let path = unsafe { read_path(path)? };
        let vfs = fs::get_vfs().write();
        let node = vfs.resolve_path(&path).map_err(map_vfs_err)?;
        if node.metadata().map_err(map_vfs_err)?.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        if !node.readdir().map_err(map_vfs_err)?.is_empty() {
            return Err(FsError::NotEmpty);
        }
        vfs.unlink(&path).map_err(map_vfs_err)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn default_unlink(path: *const u8) -> i32 {
    let result = (|| -> Result<(), FsError> {
        let path = unsafe { read_path(path)? };
        let vfs = fs::get_vfs().write();
        let node = vfs.resolve_path(&path).map_err(map_vfs_err)?;
        if node.metadata().map_err(map_vfs_err)?.node_type == NodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        vfs.unlink(&path).map_err(map_vfs_err)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn default_access(path: *const u8, _mode: i32) -> i32 {
    let result = (|| -> Result<(), FsError> {
        let path = unsafe { read_path(path)? };
        fs::get_vfs()
            .read()
            .resolve_path(&path)
            .map(|_| ())
            .map_err(map_vfs_err)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn default_rename(old_path: *const u8, new_path: *const u8) -> i32 {
    let result = (|| -> Result<(), FsError> {
        let old_path = unsafe { read_path(old_path)? };
        let new_path = unsafe { read_path(new_path)? };
        fs::get_vfs()
            .write()
            .rename(&old_path, &new_path)
            .map_err(map_vfs_err)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// DT_* directory entry types, per the getdents record layout (§4.7).
mod dt {
    pub const UNKNOWN: u8 = 0;
    pub const FIFO: u8 = 1;
    pub const CHR: u8 = 2;
    pub const DIR: u8 = 4;
    pub const BLK: u8 = 6;
    pub const REG: u8 = 8;
    pub const LNK: u8 = 10;
    pub const SOCK: u8 = 12;
}

fn dirent_type(node_type: NodeType) -> u8 {
    match node_type {
        NodeType::Directory => dt::DIR,
        NodeType::File => dt::REG,
        NodeType::Symlink => dt::LNK,
        NodeType::BlockDevice => dt::BLK,
        NodeType::CharDevice => dt::CHR,
        NodeType::Pipe => dt::FIFO,
        NodeType::Socket => dt::SOCK,
    }
}

/// A 31-multiplicative hash of the entry name, used as the synthetic
/// inode number in getdents records (this VFS has no stable inode
/// allocator shared across filesystem backends).
fn name_hash(name: &str) -> u64 {
    let mut hash: u64 = 0;
    for byte in name.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    hash
}

/// Round `n` up to the next multiple of 8.
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn default_getdents(path: *const u8, buf: *mut u8, count: i32, offset: *mut i64) -> i32 {
    if buf.is_null() || offset.is_null() || count < 0 {
        return FsError::InvalidPath.to_errno();
    }

    let result = (|| -> Result<i32, FsError> {
        let path = unsafe { read_path(path)? };
        let vfs = fs::get_vfs().read();
        let node = vfs.resolve_path(&path).map_err(map_vfs_err)?;
        let entries = node.readdir().map_err(map_vfs_err)?;

        let start = unsafe { *offset } as usize;
        let capacity = count as usize;
        let out = unsafe { core::slice::from_raw_parts_mut(buf, capacity) };

        let mut written = 0usize;
        let mut index = start;
        while index < entries.len() {
            let entry = &entries[index];
            let name_len = entry.name.len() + 1; // + null terminator
            let record_len = align8(8 + 8 + 2 + 1 + name_len);
            if written + record_len > capacity {
                break;
            }

            let rec = &mut out[written..written + record_len];
            rec[0..8].copy_from_slice(&name_hash(&entry.name).to_le_bytes());
            let next_offset = (index + 1) as u64;
            rec[8..16].copy_from_slice(&next_offset.to_le_bytes());
            rec[16..18].copy_from_slice(&(record_len as u16).to_le_bytes());
            rec[18] = dirent_type(entry.node_type);
            rec[19..19 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
            rec[19 + entry.name.len()] = 0;

            written += record_len;
            index += 1;
        }

        unsafe { *offset = index as i64 };
        Ok(written as i32)
    })();

    match result {
        Ok(n) => n,
        Err(e) => e.to_errno(),
    }
}

/// Register the kernel's own VFS-backed handlers for every slot.
pub fn register_default_handlers() {
    register_mkdir_handler(default_mkdir);
    register_rmdir_handler(default_rmdir);
    register_unlink_handler(default_unlink);
    register_getdents_handler(default_getdents);
    register_access_handler(default_access);
    register_rename_handler(default_rename);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn name_hash_matches_multiplicative_definition() {
        let mut expected: u64 = 0;
        for b in "etc".bytes() {
            expected = expected.wrapping_mul(31).wrapping_add(b as u64);
        }
        assert_eq!(name_hash("etc"), expected);
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }
}
