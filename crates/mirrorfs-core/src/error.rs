// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for MirrorFS Core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("stale node handle")]
    StaleHandle,
    #[error("bad file handle")]
    BadFileHandle,
    #[error("unsupported")]
    Unsupported,
    #[error("not implemented")]
    NotImplemented,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Capture `errno` from the last failed platform call.
    pub fn last_os_error() -> Self {
        FsError::Io(io::Error::last_os_error())
    }

    /// Wrap a raw platform error code.
    pub fn from_raw_os_error(code: i32) -> Self {
        FsError::Io(io::Error::from_raw_os_error(code))
    }

    /// The platform error code reported to the transport.
    ///
    /// OS failures propagate verbatim; everything else maps to the closest
    /// errno, with EIO as the fallback.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::OperationNotPermitted => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::StaleHandle | FsError::BadFileHandle => libc::EBADF,
            FsError::Unsupported => libc::EOPNOTSUPP,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_code_passes_through() {
        let err = FsError::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(err.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_non_os_io_error_reports_eio() {
        let err = FsError::Io(io::Error::new(io::ErrorKind::Other, "synthetic"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_stale_handle_is_ebadf() {
        assert_eq!(FsError::StaleHandle.errno(), libc::EBADF);
    }
}
