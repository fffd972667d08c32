// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Thread-scoped credential switching
//!
//! Object creation must happen with the caller's uid/gid so ownership and
//! permission checks come out right. The switch goes through raw
//! `setresuid`/`setresgid` syscalls: the libc wrappers broadcast the
//! change to every thread in the process, while the bare syscalls affect
//! only the calling thread, which is exactly the scope one request needs.

use std::io;

use tracing::error;

use crate::error::{FsError, FsResult};
use crate::types::Caller;

fn setresgid_thread(rgid: libc::gid_t, egid: libc::gid_t, sgid: libc::gid_t) -> io::Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_setresgid, rgid, egid, sgid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn setresuid_thread(ruid: libc::uid_t, euid: libc::uid_t, suid: libc::uid_t) -> io::Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_setresuid, ruid, euid, suid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

const KEEP: libc::uid_t = libc::uid_t::MAX;

/// RAII guard holding the calling thread's effective ids switched to a
/// request's caller. Dropping it restores the daemon's own ids; a failed
/// restore aborts the process rather than let later requests run with
/// borrowed credentials.
pub struct ScopedCred {
    saved_uid: libc::uid_t,
    saved_gid: libc::gid_t,
    switched_uid: bool,
    switched_gid: bool,
}

impl ScopedCred {
    /// Switch this thread's effective uid/gid to `caller`. Ids already
    /// matching are left alone. The gid changes first; once the uid has
    /// dropped, the thread may no longer have the privilege to change it.
    pub fn switch(caller: Caller) -> FsResult<Self> {
        let saved_uid = unsafe { libc::geteuid() };
        let saved_gid = unsafe { libc::getegid() };
        let mut guard = ScopedCred {
            saved_uid,
            saved_gid,
            switched_uid: false,
            switched_gid: false,
        };

        if caller.gid != saved_gid {
            setresgid_thread(KEEP, caller.gid, KEEP).map_err(FsError::Io)?;
            guard.switched_gid = true;
        }
        if caller.uid != saved_uid {
            if let Err(e) = setresuid_thread(KEEP, caller.uid, KEEP) {
                // guard's Drop rolls the gid back
                return Err(FsError::Io(e));
            }
            guard.switched_uid = true;
        }
        Ok(guard)
    }
}

impl Drop for ScopedCred {
    fn drop(&mut self) {
        if self.switched_uid {
            if let Err(e) = setresuid_thread(KEEP, self.saved_uid, KEEP) {
                error!(error = %e, "failed to restore thread uid, aborting");
                std::process::abort();
            }
        }
        if self.switched_gid {
            if let Err(e) = setresgid_thread(KEEP, self.saved_gid, KEEP) {
                error!(error = %e, "failed to restore thread gid, aborting");
                std::process::abort();
            }
        }
    }
}
