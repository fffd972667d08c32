// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MirrorFS core
//!
//! Passthrough filesystem core: a reference-counted inode registry over
//! O_PATH descriptors, an optional cross-process version protocol for
//! cache coherence between cooperating daemons, and the operation
//! dispatch surface a transport adapter drives. The core is
//! transport-agnostic; the FUSE host crate maps it onto the kernel
//! interface.

pub mod config;
pub mod cred;
pub mod dirstream;
pub mod error;
pub mod mapping;
pub mod passthrough;
pub mod path_recovery;
pub mod registry;
pub mod types;
pub mod versions;

pub use config::{CachePolicy, Config, SharedConfig};
pub use error::{FsError, FsResult};
pub use mapping::{DaxTransport, MappingBridge};
pub use passthrough::PassthroughFs;
pub use types::{
    Caller, DirEntryRecord, DirId, DirSink, Entry, FileId, InodeKey, NodeHandle, OpenHints,
    SetAttrs, SetTime, XattrReply,
};
pub use versions::{VersionClient, VersionTable};
