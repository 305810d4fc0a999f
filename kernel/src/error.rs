//! Kernel error types.
//!
//! One sum type at the crate root, with each subsystem contributing a
//! nested variant. ABI boundaries (the syscall bridge, the DDK exports)
//! convert through `to_errno` / a boolean rather than ever unwinding.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors.
    OutOfMemory { requested: usize, available: usize },
    InvalidAddress { addr: usize },
    UnmappedMemory { addr: usize },

    /// Filesystem errors (§7 storage/filesystem taxonomy).
    FsError(FsError),

    /// Block I/O errors (§7 block I/O taxonomy).
    BlockError(BlockError),

    /// Network errors (§7 network taxonomy).
    NetError(NetError),

    /// Cancellation / task errors (§7 concurrency taxonomy).
    AsyncError(AsyncError),

    /// Hardware and bus errors (PCI, virtio, IRQ allocator).
    HardwareError { device: &'static str, code: u32 },

    /// Generic errors.
    InvalidArgument { name: &'static str, value: &'static str },
    OperationNotSupported { operation: &'static str },
    ResourceExhausted { resource: &'static str },
    PermissionDenied { operation: &'static str },
    Timeout { operation: &'static str, duration_ms: u64 },
    NotInitialized { subsystem: &'static str },
    AlreadyExists { resource: &'static str, id: u64 },
    NotFound { resource: &'static str, id: u64 },
    InvalidState { expected: &'static str, actual: &'static str },
    NotImplemented { feature: &'static str },
    WouldBlock,
}

/// Storage/filesystem errors (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    Success,
    NotFound,
    AlreadyExists,
    AccessDenied,
    InvalidPath,
    NotEmpty,
    NoSpace,
    IoError,
    ReadOnly,
    NotADirectory,
    IsADirectory,
    TooManyOpenFiles,
    NameTooLong,
    InvalidHandle,
    NotSupported,
}

impl FsError {
    /// Errno mapping, §4.7. Closed, total function; anything not matched
    /// above this function's catch-all falls through to `-5` (I/O error).
    pub const fn to_errno(self) -> i32 {
        match self {
            FsError::Success => 0,
            FsError::NotFound => -2,
            FsError::AlreadyExists => -17,
            FsError::AccessDenied => -13,
            FsError::InvalidPath => -22,
            FsError::NotEmpty => -39,
            FsError::NoSpace => -28,
            FsError::IoError => -5,
            FsError::ReadOnly => -30,
            FsError::NotADirectory => -20,
            FsError::IsADirectory => -21,
            FsError::TooManyOpenFiles => -24,
            FsError::NameTooLong => -36,
            FsError::InvalidHandle => -9,
            FsError::NotSupported => -38,
            #[allow(unreachable_patterns)]
            _ => -5,
        }
    }
}

/// Block I/O errors (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    InvalidParameter,
    NotReady,
    IoError,
    MediaChanged,
    NoMedia,
    WriteProtected,
    Timeout,
    DeviceRemoved,
}

/// Network errors (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    NoLink,
    NoBuffer,
    PacketTooLarge,
    IoError,
    NotReady,
    Busy,
}

/// Cancellation/task errors (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncError {
    TaskCanceled,
    ObjectDisposed,
    AlreadyCompleted,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "invalid address: 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::BlockError(e) => write!(f, "block I/O error: {:?}", e),
            Self::NetError(e) => write!(f, "network error: {:?}", e),
            Self::AsyncError(e) => write!(f, "async error: {:?}", e),
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code 0x{:x}", device, code)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::Timeout { operation, duration_ms } => {
                write!(f, "timeout during {}: {} ms", operation, duration_ms)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} already exists (id {})", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} not found (id {})", resource, id),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::NotImplemented { feature } => write!(f, "not implemented: {}", feature),
            Self::WouldBlock => write!(f, "operation would block"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl From<BlockError> for KernelError {
    fn from(err: BlockError) -> Self {
        Self::BlockError(err)
    }
}

impl From<NetError> for KernelError {
    fn from(err: NetError) -> Self {
        Self::NetError(err)
    }
}

impl From<AsyncError> for KernelError {
    fn from(err: AsyncError) -> Self {
        Self::AsyncError(err)
    }
}
