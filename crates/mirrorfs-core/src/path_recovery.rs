// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Parent and name recovery for pure-descriptor entries
//!
//! Registry entries hold no path string, but a few operations (symlink
//! timestamp updates, hard links on kernels without AT_EMPTY_PATH link)
//! need a real (parent directory, leaf name) anchor. The kernel's
//! /proc/self/fd symlink gives the descriptor's current path; a rename on
//! another thread or process can invalidate it between the readlink and
//! its use, so the result is verified by re-statting the leaf under the
//! resolved parent and comparing identities. The whole sequence retries a
//! bounded number of times before giving up with EIO.

use std::ffi::{CString, OsString};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStringExt;

use scopeguard::ScopeGuard;
use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::registry::{InodeEntry, InodeRegistry, Registered};
use crate::types::InodeKey;

/// Rename races get this many extra attempts before the EIO.
const RECOVERY_RETRIES: u32 = 2;

enum Attempt {
    /// Transient (likely a concurrent rename); worth another pass.
    Retry,
    /// Broken beyond retrying (readlink failure, overflow, bad path).
    Fatal,
}

/// Recover `(parent, leaf name)` for `entry`. The returned parent carries
/// one registry reference the caller must release.
pub fn recover_parent(
    registry: &InodeRegistry,
    entry: &InodeEntry,
) -> FsResult<(Registered, OsString)> {
    for attempt in 0..=RECOVERY_RETRIES {
        let last = attempt == RECOVERY_RETRIES;
        match recover_once(registry, entry, last) {
            Ok(found) => return Ok(found),
            Err(Attempt::Retry) if !last => continue,
            Err(_) => break,
        }
    }
    Err(FsError::from_raw_os_error(libc::EIO))
}

fn recover_once(
    registry: &InodeRegistry,
    entry: &InodeEntry,
    log_failures: bool,
) -> Result<(Registered, OsString), Attempt> {
    let proc_path = CString::new(format!("/proc/self/fd/{}", entry.raw_fd())).unwrap();
    let mut buf = [0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::readlink(
            proc_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if len < 0 {
        warn!(error = %io::Error::last_os_error(), "path recovery: readlink failed");
        return Err(Attempt::Fatal);
    }
    let len = len as usize;
    if len >= buf.len() {
        warn!("path recovery: readlink overflowed");
        return Err(Attempt::Fatal);
    }
    let path = &buf[..len];

    let Some(split) = path.iter().rposition(|&b| b == b'/') else {
        warn!("path recovery: non-absolute path from proc");
        return Err(Attempt::Fatal);
    };
    let name = &path[split + 1..];

    let parent = if split == 0 {
        let root = registry.root();
        registry
            .find(root.key)
            .expect("root entry missing from registry")
    } else {
        let parent_path = CString::new(&path[..split]).map_err(|_| Attempt::Fatal)?;
        let mut st = MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::stat(parent_path.as_ptr(), st.as_mut_ptr()) };
        if rc == -1 {
            if log_failures {
                warn!(error = %io::Error::last_os_error(), "path recovery: failed to stat parent");
            }
            return Err(Attempt::Retry);
        }
        let st = unsafe { st.assume_init() };
        match registry.find(InodeKey::from_stat(&st)) {
            Some(p) => p,
            None => {
                if log_failures {
                    warn!("path recovery: parent not resident");
                }
                return Err(Attempt::Retry);
            }
        }
    };

    // Drops the parent reference unless defused by a verified match.
    let parent = scopeguard::guard(parent, |p| registry.release(p.node, 1));

    let name_c = CString::new(name).map_err(|_| Attempt::Fatal)?;
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe {
        libc::fstatat(
            parent.entry.raw_fd(),
            name_c.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == -1 {
        if log_failures {
            warn!(error = %io::Error::last_os_error(), "path recovery: failed to stat leaf");
        }
        return Err(Attempt::Retry);
    }
    let st = unsafe { st.assume_init() };
    if InodeKey::from_stat(&st) != entry.key {
        if log_failures {
            warn!("path recovery: leaf moved during recovery");
        }
        return Err(Attempt::Retry);
    }

    Ok((
        ScopeGuard::into_inner(parent),
        OsString::from_vec(name.to_vec()),
    ))
}
