// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for MirrorFS

use std::time::Duration;

/// Backing-store identity: (device id, inode number)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn from_stat(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev,
            ino: st.st_ino,
        }
    }
}

/// Generation-checked registry handle; the identity value handed to the
/// transport in place of a raw pointer.
///
/// Low 32 bits index the registry arena, high 32 bits carry the slot
/// generation, so a recycled slot invalidates stale handles instead of
/// aliasing them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    /// The registry root; index 1 at generation 0, numerically equal to
    /// FUSE_ROOT_ID.
    pub const ROOT: NodeHandle = NodeHandle(1);

    pub(crate) fn pack(index: u32, generation: u32) -> Self {
        NodeHandle(((generation as u64) << 32) | index as u64)
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Open file identifier handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Open directory stream identifier handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DirId(pub u64);

/// Resolved identity returned by lookup-style operations.
///
/// Carries one registry reference that the transport must eventually
/// return through forget.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub node: NodeHandle,
    pub attr: libc::stat,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
    /// Version counter captured at resolution time; 0 when untracked.
    pub initial_version: i64,
    /// Slot index in the shared version table; 0 when untracked.
    pub version_slot: u64,
}

/// Per-open cache directives returned alongside a file identifier,
/// mapped by the transport onto FOPEN_DIRECT_IO / FOPEN_KEEP_CACHE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenHints {
    pub direct_io: bool,
    pub keep_cache: bool,
}

/// Caller identity for object-creation operations.
#[derive(Clone, Copy, Debug)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Timestamp update selector for setattr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetTime {
    Now,
    Time { sec: i64, nsec: i64 },
}

/// Attribute changes requested by setattr; `None` fields are untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

/// One directory entry produced by `read_dir`.
pub struct DirEntryRecord {
    pub name: std::ffi::OsString,
    /// Raw backing inode number (what a plain listing reports).
    pub ino: u64,
    /// File type bits as `d_type << 12`, matching `st_mode >> 12`.
    pub type_bits: u32,
    /// Absolute offset of the *next* entry, usable for resume.
    pub offset: i64,
    /// Full identity+attributes in plus mode, except for dot entries.
    pub entry: Option<Entry>,
}

/// Output buffer abstraction for directory enumeration.
///
/// The transport owns the byte budget: `push` returns false when the
/// serialized entry would overflow it, in which case the entry has not
/// been delivered.
pub trait DirSink {
    fn push(&mut self, record: &DirEntryRecord) -> bool;
}

/// Result of a size-probing xattr operation.
#[derive(Debug)]
pub enum XattrReply {
    /// Value bytes (request carried a non-zero size budget).
    Data(Vec<u8>),
    /// Required buffer size (request probed with size 0).
    Size(u64),
}
