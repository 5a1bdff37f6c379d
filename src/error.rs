//! Error types for the RDMA connection-lifecycle core.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, RdmaError>;

/// Error kinds produced by the connection core (spec §7).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RdmaError {
    /// Address resolution failed.
    #[error("address resolution failed: {0}")]
    AddrError(String),

    /// Route resolution failed.
    #[error("route resolution failed: {0}")]
    RouteError(String),

    /// Generic connect failure during the CM handshake.
    #[error("connect failed: {0}")]
    ConnectError(String),

    /// Peer unreachable.
    #[error("peer unreachable")]
    Unreachable,

    /// Peer rejected the connection with a CM rejection reason.
    #[error("connection refused, reason={0}")]
    Refused(u32),

    /// The device/port referenced by a CM event is not in the registry.
    #[error("no such device: {0}")]
    NoDevice(String),

    /// Any allocation (slabs, pools, CQ grow, registration tables) failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// `alloc_slots` could not satisfy the request and could not grow.
    #[error("completion queue overflow")]
    CqOverflow,

    /// A DMA map or unmap call failed.
    #[error("DMA map error: {0}")]
    MapError(String),

    /// Peer remote-key not found in the translation table.
    #[error("unknown rkey: {0:#x}")]
    RkeyUnknown(u32),

    /// Optional feature requested on a device without the required capability.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A failure inside a CM handler that leaves the connection unusable.
    #[error("fatal connection error: {0}")]
    Fatal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RdmaError {
    /// Converts to an errno value for the CM-framework FFI boundary.
    #[inline]
    #[must_use]
    #[allow(clippy::wildcard_enum_match_arm)]
    pub fn to_errno(&self) -> i32 {
        match *self {
            RdmaError::AddrError(_) | RdmaError::RouteError(_) => libc::EHOSTUNREACH,
            RdmaError::ConnectError(_) => libc::ECONNREFUSED,
            RdmaError::Unreachable => libc::EHOSTUNREACH,
            RdmaError::Refused(_) => libc::ECONNREFUSED,
            RdmaError::NoDevice(_) => libc::ENODEV,
            RdmaError::OutOfMemory(_) => libc::ENOMEM,
            RdmaError::CqOverflow => libc::ENOSPC,
            RdmaError::MapError(_) => libc::EFAULT,
            RdmaError::RkeyUnknown(_) => libc::EINVAL,
            RdmaError::NotSupported(_) => libc::EOPNOTSUPP,
            RdmaError::Fatal(_) => libc::EIO,
            RdmaError::IoError(ref e) => e.raw_os_error().unwrap_or(libc::EIO),
            RdmaError::Config(_) => libc::EINVAL,
        }
    }

    /// Maps this error to the observer-facing error kind used in `ERROR(kind)` notifications.
    #[inline]
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match *self {
            RdmaError::AddrError(_) => "AddrError",
            RdmaError::RouteError(_) => "RouteError",
            RdmaError::ConnectError(_) => "ConnectError",
            RdmaError::Unreachable => "Unreachable",
            RdmaError::Refused(_) => "Refused",
            RdmaError::NoDevice(_) => "NoDevice",
            RdmaError::OutOfMemory(_) => "OutOfMemory",
            RdmaError::CqOverflow => "CqOverflow",
            RdmaError::MapError(_) => "MapError",
            RdmaError::RkeyUnknown(_) => "RkeyUnknown",
            RdmaError::NotSupported(_) => "NotSupported",
            RdmaError::Fatal(_) => "Fatal",
            RdmaError::IoError(_) => "IoError",
            RdmaError::Config(_) => "Config",
        }
    }
}
