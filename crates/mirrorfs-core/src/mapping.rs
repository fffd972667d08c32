// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DAX mapping bridge
//!
//! Translates map/unmap requests into mapping messages for the
//! memory-mapped I/O transport. The transport itself sits behind a trait
//! so the core stays independent of the virtio plumbing that actually
//! installs the windows.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::warn;

use mirrorfs_proto::{DaxMappingMsg, DAX_MAP_FLAG_R, DAX_MAP_FLAG_W};

use crate::error::{FsError, FsResult};
use crate::registry::InodeEntry;

/// Submits mapping messages to the host-side shared-memory window.
#[cfg_attr(test, mockall::automock)]
pub trait DaxTransport: Send + Sync {
    /// Install the ranges in `msg`, reading them from `fd`. `Err(())`
    /// means the transport rejected the request.
    fn map(&self, msg: &DaxMappingMsg, fd: RawFd) -> Result<(), ()>;
    /// Tear the ranges in `msg` down.
    fn unmap(&self, msg: &DaxMappingMsg) -> Result<(), ()>;
}

impl DaxTransport for Box<dyn DaxTransport> {
    fn map(&self, msg: &DaxMappingMsg, fd: RawFd) -> Result<(), ()> {
        (**self).map(msg, fd)
    }

    fn unmap(&self, msg: &DaxMappingMsg) -> Result<(), ()> {
        (**self).unmap(msg)
    }
}

pub struct MappingBridge<T: DaxTransport> {
    transport: T,
}

impl<T: DaxTransport> MappingBridge<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Map `len` bytes of the object at `file_offset` into the shared
    /// window at `target_offset`.
    ///
    /// With an already-open descriptor (`open_fd`) the mapping reuses it;
    /// otherwise the entry's path-only descriptor is reopened read-write
    /// through proc and closed again after submission.
    pub fn setup(
        &self,
        entry: &InodeEntry,
        open_fd: Option<RawFd>,
        file_offset: u64,
        len: u64,
        target_offset: u64,
        writable: bool,
    ) -> FsResult<()> {
        let mut flags = DAX_MAP_FLAG_R;
        if writable {
            flags |= DAX_MAP_FLAG_W;
        }
        let msg = DaxMappingMsg::single(file_offset, len, target_offset, flags);

        let adhoc;
        let fd = match open_fd {
            Some(fd) => fd,
            None => {
                adhoc = reopen_rdwr(entry)?;
                adhoc.as_raw_fd()
            }
        };

        if self.transport.map(&msg, fd).is_err() {
            warn!(
                dev = entry.key.dev,
                ino = entry.key.ino,
                target_offset,
                "mapping transport rejected map request"
            );
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// Remove a previously installed window.
    pub fn remove(&self, target_offset: u64, len: u64) -> FsResult<()> {
        let msg = DaxMappingMsg::single(0, len, target_offset, 0);
        if self.transport.unmap(&msg).is_err() {
            warn!(target_offset, len, "mapping transport rejected unmap request");
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}

fn reopen_rdwr(entry: &InodeEntry) -> FsResult<OwnedFd> {
    let path = std::ffi::CString::new(format!("/proc/self/fd/{}", entry.raw_fd())).unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd == -1 {
        return Err(FsError::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InodeRegistry;
    use crate::types::{InodeKey, NodeHandle};
    use crate::versions::VersionClient;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;

    fn registry_with_file() -> (tempfile::TempDir, InodeRegistry, NodeHandle) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let root_fd = {
            let c = std::ffi::CString::new(dir.path().to_str().unwrap()).unwrap();
            let fd = unsafe { libc::open(c.as_ptr(), libc::O_PATH) };
            assert!(fd >= 0);
            unsafe { OwnedFd::from_raw_fd(fd) }
        };
        let meta = std::fs::metadata(dir.path()).unwrap();
        let registry = InodeRegistry::new(
            root_fd,
            InodeKey {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            Arc::new(VersionClient::disabled()),
        );
        let file = dir.path().join("f");
        let fmeta = std::fs::metadata(&file).unwrap();
        let key = InodeKey {
            dev: fmeta.dev(),
            ino: fmeta.ino(),
        };
        let (reg, _) = registry
            .find_or_create(key, || {
                let c = std::ffi::CString::new(file.to_str().unwrap()).unwrap();
                let fd = unsafe { libc::open(c.as_ptr(), libc::O_PATH) };
                assert!(fd >= 0);
                Ok((unsafe { OwnedFd::from_raw_fd(fd) }, false))
            })
            .unwrap();
        let node = reg.node;
        (dir, registry, node)
    }

    #[test]
    fn test_setup_builds_writable_message() {
        let (_dir, registry, node) = registry_with_file();
        let entry = registry.get(node).unwrap();

        let mut transport = MockDaxTransport::new();
        transport
            .expect_map()
            .withf(|msg, fd| {
                msg.fd_offset[0] == 4096
                    && msg.len[0] == 8192
                    && msg.cache_offset[0] == 1 << 20
                    && msg.flags[0] == (DAX_MAP_FLAG_R | DAX_MAP_FLAG_W)
                    && *fd >= 0
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let bridge = MappingBridge::new(transport);
        bridge
            .setup(&entry, None, 4096, 8192, 1 << 20, true)
            .unwrap();
        registry.release(node, 1);
    }

    #[test]
    fn test_setup_reuses_open_descriptor() {
        let (_dir, registry, node) = registry_with_file();
        let entry = registry.get(node).unwrap();

        let mut transport = MockDaxTransport::new();
        transport
            .expect_map()
            .withf(|msg, fd| msg.flags[0] == DAX_MAP_FLAG_R && *fd == 42)
            .times(1)
            .returning(|_, _| Ok(()));

        let bridge = MappingBridge::new(transport);
        bridge.setup(&entry, Some(42), 0, 4096, 0, false).unwrap();
        registry.release(node, 1);
    }

    #[test]
    fn test_transport_rejection_is_invalid_argument() {
        let (_dir, registry, node) = registry_with_file();
        let entry = registry.get(node).unwrap();

        let mut transport = MockDaxTransport::new();
        transport.expect_map().returning(|_, _| Err(()));
        transport.expect_unmap().returning(|_| Err(()));

        let bridge = MappingBridge::new(transport);
        let err = bridge.setup(&entry, Some(3), 0, 4096, 0, false).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        let err = bridge.remove(0, 4096).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        registry.release(node, 1);
    }

    #[test]
    fn test_unmap_message_carries_range() {
        let mut transport = MockDaxTransport::new();
        transport
            .expect_unmap()
            .withf(|msg| msg.cache_offset[0] == 0x8000 && msg.len[0] == 0x1000 && msg.flags[0] == 0)
            .times(1)
            .returning(|_| Ok(()));
        let bridge = MappingBridge::new(transport);
        bridge.remove(0x8000, 0x1000).unwrap();
    }
}
