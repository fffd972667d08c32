// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stateful directory iteration
//!
//! One `DirStream` per open directory handle; never shared between
//! handles. Wraps the libc `DIR*` cursor and adds the two things
//! enumeration needs on top of it: reseek when the requested offset does
//! not match the last-served one, and a single-entry lookahead so an
//! entry that did not fit the reply budget can be pushed back and
//! re-served by the next call.

use std::ffi::{CStr, OsString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;

/// One raw entry as read from the OS cursor.
pub struct RawDirEntry {
    pub name: OsString,
    pub ino: u64,
    /// `d_type`, shifted into the high mode bits by the consumer.
    pub d_type: u8,
    /// Offset at which enumeration resumes after this entry.
    pub next_offset: i64,
}

impl RawDirEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// File type bits positioned like the `st_mode` type nibble.
    pub fn type_bits(&self) -> u32 {
        (self.d_type as u32) << 12
    }
}

pub struct DirStream {
    dir: *mut libc::DIR,
    lookahead: Option<RawDirEntry>,
    /// Offset the next read is expected to request.
    pos: i64,
    /// Value `pos` had before the last `next`, for push-back.
    prev_pos: i64,
}

// The DIR* is confined to whichever thread holds the stream; streams are
// per-handle and never aliased.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Open an iteration cursor over the directory behind `dirfd`. The
    /// descriptor is only used as an anchor; the stream owns a fresh one.
    pub fn open(dirfd: RawFd) -> io::Result<Self> {
        let fd = unsafe {
            libc::openat(
                dirfd,
                b".\0".as_ptr() as *const libc::c_char,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let dir = unsafe { libc::fdopendir(fd) };
        if dir.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self {
            dir,
            lookahead: None,
            pos: 0,
            prev_pos: 0,
        })
    }

    pub fn position(&self) -> i64 {
        self.pos
    }

    /// Descriptor backing the cursor; stays owned by the stream.
    pub fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir) }
    }

    /// Reposition the cursor; discards the lookahead.
    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dir, offset) };
        self.lookahead = None;
        self.pos = offset;
        self.prev_pos = offset;
    }

    /// Fetch the next entry, serving the lookahead first. `Ok(None)`
    /// marks the end of the directory.
    pub fn next_entry(&mut self) -> io::Result<Option<RawDirEntry>> {
        if let Some(entry) = self.lookahead.take() {
            self.prev_pos = self.pos;
            self.pos = entry.next_offset;
            return Ok(Some(entry));
        }

        // readdir reports errors only through errno.
        unsafe { *libc::__errno_location() = 0 };
        let dent = unsafe { libc::readdir(self.dir) };
        if dent.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(io::Error::from_raw_os_error(errno));
            }
            return Ok(None);
        }

        let dent = unsafe { &*dent };
        let name = unsafe { CStr::from_ptr(dent.d_name.as_ptr()) };
        let entry = RawDirEntry {
            name: OsString::from_vec(name.to_bytes().to_vec()),
            ino: dent.d_ino,
            d_type: dent.d_type,
            next_offset: dent.d_off,
        };
        self.prev_pos = self.pos;
        self.pos = entry.next_offset;
        Ok(Some(entry))
    }

    /// Return an undelivered entry to the stream. The next read at the
    /// pre-fetch offset serves it again without touching the cursor.
    pub fn push_back(&mut self, entry: RawDirEntry) {
        assert!(self.lookahead.is_none(), "double push_back");
        self.pos = self.prev_pos;
        self.lookahead = Some(entry);
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn open_dir_path_fd(path: &Path) -> RawFd {
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_PATH) };
        assert!(fd >= 0);
        fd
    }

    fn collect_names(stream: &mut DirStream) -> Vec<OsString> {
        let mut names = Vec::new();
        while let Some(entry) = stream.next_entry().unwrap() {
            names.push(entry.name);
        }
        names
    }

    #[test]
    fn test_enumerates_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let fd = open_dir_path_fd(dir.path());
        let mut stream = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };

        let names: BTreeSet<_> = collect_names(&mut stream).into_iter().collect();
        let expected: BTreeSet<OsString> =
            [".", "..", "a", "b", "c"].iter().map(OsString::from).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_resume_at_offset_skips_served_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let fd = open_dir_path_fd(dir.path());
        let mut first = DirStream::open(fd).unwrap();

        // Serve two entries and remember where the second one resumes.
        let e1 = first.next_entry().unwrap().unwrap();
        let e2 = first.next_entry().unwrap().unwrap();
        let rest: Vec<_> = collect_names(&mut first);

        let mut second = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };
        second.seek(e2.next_offset);
        let resumed = collect_names(&mut second);

        assert_eq!(resumed, rest);
        let mut all = vec![e1.name, e2.name];
        all.extend(resumed);
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_push_back_reserves_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fd = open_dir_path_fd(dir.path());
        let mut stream = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };

        let before = stream.position();
        let entry = stream.next_entry().unwrap().unwrap();
        let name = entry.name.clone();
        stream.push_back(entry);
        assert_eq!(stream.position(), before);

        let again = stream.next_entry().unwrap().unwrap();
        assert_eq!(again.name, name);
    }
}
