//! Wire-visible error kinds shared by every NFSv2 and MOUNT procedure.
//!
//! Each variant maps 1:1 to an NFSv2 `nfsstat` wire code (RFC 1094 §2.3.4).
//! Internal layers (the handle cache, the export database, the identity
//! map) return [`Stat`] directly rather than a richer error type, because
//! every failure surfaced to a client must already be one of these kinds;
//! anything else collapses to [`Stat::IoError`] with a logged diagnostic
//! (spec §7).

use num_derive::{FromPrimitive, ToPrimitive};

/// NFSv2 status codes (RFC 1094 §2.3.4), plus the handful of MOUNT-specific
/// values used by the mount procedures (§4.L, §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Stat {
    Ok = 0,
    /// Not owner: caller is neither root nor the object's owner.
    Perm = 1,
    /// No such file or directory.
    NoEnt = 2,
    /// Hard I/O error.
    IoError = 5,
    /// No such device or address.
    NxIo = 6,
    /// Permission denied (distinct from [`Stat::Perm`]: any caller, not just owner/root).
    Access = 13,
    /// File already exists.
    Exist = 17,
    /// No such device.
    NoDev = 19,
    /// Not a directory.
    NotDir = 20,
    /// Is a directory.
    IsDir = 21,
    /// Invalid or unsupported argument.
    Inval = 22,
    /// File too large.
    FBig = 27,
    /// No space left on device.
    NoSpc = 28,
    /// Read-only file system.
    RoFs = 30,
    /// Filename too long.
    NameTooLong = 63,
    /// Directory not empty.
    NotEmpty = 66,
    /// Disk quota exceeded.
    DQuot = 69,
    /// Stale file handle.
    Stale = 70,
    /// Write-cache-size request would exceed server's remote-transfer-size limit.
    WfLush = 99,
}

impl Stat {
    /// Translate an OS-level error into the closest wire status, collapsing
    /// anything unrecognized to [`Stat::IoError`] (spec §7: "Unknown
    /// underlying errors collapse to *io* with a logged diagnostic.").
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Stat::NoEnt,
            PermissionDenied => Stat::Access,
            AlreadyExists => Stat::Exist,
            InvalidInput | InvalidData => Stat::Inval,
            _ => match err.raw_os_error() {
                Some(libc_code) => Self::from_errno(libc_code),
                None => {
                    tracing::error!(error = %err, "unmapped I/O error, collapsing to IO");
                    Stat::IoError
                }
            },
        }
    }

    #[cfg(unix)]
    fn from_errno(errno: i32) -> Self {
        match errno {
            libc_sys::EPERM => Stat::Perm,
            libc_sys::ENOENT => Stat::NoEnt,
            libc_sys::ENXIO => Stat::NxIo,
            libc_sys::EACCES => Stat::Access,
            libc_sys::EEXIST => Stat::Exist,
            libc_sys::ENODEV => Stat::NoDev,
            libc_sys::ENOTDIR => Stat::NotDir,
            libc_sys::EISDIR => Stat::IsDir,
            libc_sys::EINVAL => Stat::Inval,
            libc_sys::EFBIG => Stat::FBig,
            libc_sys::ENOSPC => Stat::NoSpc,
            libc_sys::EROFS => Stat::RoFs,
            libc_sys::ENAMETOOLONG => Stat::NameTooLong,
            libc_sys::ENOTEMPTY => Stat::NotEmpty,
            libc_sys::EDQUOT => Stat::DQuot,
            other => {
                tracing::error!(errno = other, "unmapped errno, collapsing to IO");
                Stat::IoError
            }
        }
    }

    #[cfg(not(unix))]
    fn from_errno(_errno: i32) -> Self {
        Stat::IoError
    }
}

/// Thin re-export so callers don't need to depend on `libc` directly just
/// to match on errno constants.
#[cfg(unix)]
mod libc_sys {
    pub use libc::{
        EACCES, EDQUOT, EEXIST, EFBIG, EINVAL, EISDIR, ENAMETOOLONG, ENODEV, ENOENT, ENOSPC,
        ENOTDIR, ENOTEMPTY, ENXIO, EPERM, EROFS,
    };
}

/// Result alias used throughout the core engines.
pub type Result<T> = std::result::Result<T, Stat>;
