// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation dispatch surface
//!
//! `PassthroughFs` owns the registry, the version client, and the open
//! file/directory tables, and exposes one method per filesystem
//! operation. The transport adapter translates wire requests into these
//! calls and errno values back out. Entries never retain a path: every
//! operation that needs one goes through the entry's descriptor, the
//! /proc/self/fd reopen trick, or parent recovery.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::cred::ScopedCred;
use crate::dirstream::DirStream;
use crate::error::{FsError, FsResult};
use crate::mapping::{DaxTransport, MappingBridge};
use crate::path_recovery::recover_parent;
use crate::registry::{InodeEntry, InodeRegistry, Registered};
use crate::types::{
    Caller, DirEntryRecord, DirId, DirSink, Entry, FileId, InodeKey, NodeHandle, OpenHints,
    SetAttrs, SetTime, XattrReply,
};
use crate::versions::VersionClient;

fn cvt(rc: libc::c_int) -> FsResult<libc::c_int> {
    if rc == -1 {
        Err(FsError::last_os_error())
    } else {
        Ok(rc)
    }
}

fn cvt_ssize(rc: libc::ssize_t) -> FsResult<usize> {
    if rc == -1 {
        Err(FsError::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).unwrap()
}

fn cstr(name: &OsStr) -> FsResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| FsError::InvalidArgument)
}

/// fstatat with an empty path, the stat that works on O_PATH descriptors.
fn stat_fd(fd: RawFd) -> FsResult<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe {
        libc::fstatat(
            fd,
            b"\0".as_ptr() as *const libc::c_char,
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(unsafe { st.assume_init() })
}

const UTIME_OMIT_SPEC: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: libc::UTIME_OMIT,
};

fn timespec_of(t: Option<SetTime>) -> libc::timespec {
    match t {
        None => UTIME_OMIT_SPEC,
        Some(SetTime::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(SetTime::Time { sec, nsec }) => libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        },
    }
}

struct OpenFile {
    fd: OwnedFd,
}

pub struct PassthroughFs {
    config: Config,
    registry: InodeRegistry,
    versions: Arc<VersionClient>,
    files: Mutex<HashMap<u64, OpenFile>>,
    dirs: Mutex<HashMap<u64, Arc<Mutex<DirStream>>>>,
    next_file: AtomicU64,
    next_dir: AtomicU64,
    mapping: Option<MappingBridge<Box<dyn DaxTransport>>>,
}

impl PassthroughFs {
    /// Open the backing root and wire up shared tracking if configured.
    /// A configured but unreachable coordinator is a hard error.
    pub fn new(config: Config, transport: Option<Box<dyn DaxTransport>>) -> FsResult<Self> {
        let versions = match &config.shared {
            Some(shared) => Arc::new(VersionClient::connect(shared)?),
            None => Arc::new(VersionClient::disabled()),
        };
        Self::with_version_client(config, versions, transport)
    }

    /// Like `new`, with an already-built version client. Lets embedders
    /// and tests supply their own coordinator channel.
    pub fn with_version_client(
        config: Config,
        versions: Arc<VersionClient>,
        transport: Option<Box<dyn DaxTransport>>,
    ) -> FsResult<Self> {
        let root_path = cstr(config.source.as_os_str())?;
        let root_fd = cvt(unsafe { libc::open(root_path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) })?;
        let root_fd = unsafe { OwnedFd::from_raw_fd(root_fd) };
        let root_st = stat_fd(root_fd.as_raw_fd())?;

        let registry = InodeRegistry::new(
            root_fd,
            InodeKey::from_stat(&root_st),
            Arc::clone(&versions),
        );
        info!(source = %config.source.display(), shared = config.shared.is_some(), "mirror root opened");

        Ok(Self {
            config,
            registry,
            versions,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_file: AtomicU64::new(1),
            next_dir: AtomicU64::new(1),
            mapping: transport.map(MappingBridge::new),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn entry(&self, node: NodeHandle) -> FsResult<Arc<InodeEntry>> {
        self.registry.get(node)
    }

    fn file_fd(&self, file: FileId) -> FsResult<RawFd> {
        let files = self.files.lock().unwrap();
        files
            .get(&file.0)
            .map(|f| f.fd.as_raw_fd())
            .ok_or(FsError::BadFileHandle)
    }

    fn bump(&self, entry: &InodeEntry) {
        self.versions.bump(entry.version_slot);
    }

    fn timeout(&self) -> Duration {
        self.config.effective_timeout()
    }

    /// Assemble the reply record for a freshly referenced entry.
    fn entry_reply(&self, reg: &Registered) -> FsResult<Entry> {
        let initial_version = self.versions.current(reg.entry.version_slot);
        let attr = stat_fd(reg.entry.raw_fd())?;
        Ok(Entry {
            node: reg.node,
            attr,
            attr_timeout: self.timeout(),
            entry_timeout: self.timeout(),
            initial_version,
            version_slot: reg.entry.version_slot,
        })
    }

    /// Resolve `name` under `parent`, registering the identity on first
    /// sight. The returned entry carries one registry reference.
    pub fn lookup(&self, parent: NodeHandle, name: &OsStr) -> FsResult<Entry> {
        let dir = self.entry(parent)?;
        let name_c = cstr(name)?;

        let key;
        let reg = {
            let fd = cvt(unsafe {
                libc::openat(
                    dir.raw_fd(),
                    name_c.as_ptr(),
                    libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
                )
            })?;
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let st = stat_fd(fd.as_raw_fd())?;
            key = InodeKey::from_stat(&st);
            let is_symlink = (st.st_mode & libc::S_IFMT) == libc::S_IFLNK;
            let (reg, _created) = self
                .registry
                .find_or_create(key, move || Ok((fd, is_symlink)))?;
            reg
        };

        match self.entry_reply(&reg) {
            Ok(entry) => {
                debug!(dev = key.dev, ino = key.ino, node = entry.node.0, "lookup");
                Ok(entry)
            }
            Err(e) => {
                self.registry.release(reg.node, 1);
                Err(e)
            }
        }
    }

    /// Drop `n` transport references from `node`.
    pub fn forget(&self, node: NodeHandle, n: u64) {
        if node == NodeHandle::ROOT {
            return;
        }
        self.registry.release(node, n);
    }

    pub fn forget_multi(&self, items: &[(NodeHandle, u64)]) {
        for &(node, n) in items {
            self.forget(node, n);
        }
    }

    pub fn getattr(&self, node: NodeHandle) -> FsResult<(libc::stat, Duration)> {
        let entry = self.entry(node)?;
        Ok((stat_fd(entry.raw_fd())?, self.timeout()))
    }

    pub fn setattr(
        &self,
        node: NodeHandle,
        changes: &SetAttrs,
        file: Option<FileId>,
    ) -> FsResult<(libc::stat, Duration)> {
        let entry = self.entry(node)?;
        let fh = file.map(|f| self.file_fd(f)).transpose()?;

        if let Some(mode) = changes.mode {
            match fh {
                Some(fd) => cvt(unsafe { libc::fchmod(fd, mode as libc::mode_t) })?,
                None => {
                    let path = proc_self_fd(entry.raw_fd());
                    cvt(unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) })?
                }
            };
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            let uid = changes.uid.unwrap_or(libc::uid_t::MAX);
            let gid = changes.gid.unwrap_or(libc::gid_t::MAX);
            cvt(unsafe {
                libc::fchownat(
                    entry.raw_fd(),
                    b"\0".as_ptr() as *const libc::c_char,
                    uid,
                    gid,
                    libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                )
            })?;
        }

        if let Some(size) = changes.size {
            match fh {
                Some(fd) => cvt(unsafe { libc::ftruncate(fd, size as libc::off_t) })?,
                None => {
                    let path = proc_self_fd(entry.raw_fd());
                    cvt(unsafe { libc::truncate(path.as_ptr(), size as libc::off_t) })?
                }
            };
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            let tv = [timespec_of(changes.atime), timespec_of(changes.mtime)];
            match fh {
                Some(fd) => cvt(unsafe { libc::futimens(fd, tv.as_ptr()) })?,
                None => {
                    self.utimensat_empty(&entry, &tv)?;
                    0
                }
            };
        }

        self.bump(&entry);
        Ok((stat_fd(entry.raw_fd())?, self.timeout()))
    }

    /// Timestamp update for an entry with no open handle. Symlinks have
    /// no reopenable path, so they try the empty-path form first and then
    /// fall back to parent recovery unless `norace` forbids it.
    fn utimensat_empty(&self, entry: &InodeEntry, tv: &[libc::timespec; 2]) -> FsResult<()> {
        if entry.is_symlink {
            let rc = unsafe {
                libc::utimensat(
                    entry.raw_fd(),
                    b"\0".as_ptr() as *const libc::c_char,
                    tv.as_ptr(),
                    libc::AT_EMPTY_PATH,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = FsError::last_os_error();
            if err.errno() != libc::EINVAL {
                return Err(err);
            }
            if self.config.norace {
                return Err(FsError::OperationNotPermitted);
            }
            let (parent, name) = recover_parent(&self.registry, entry)?;
            let name_c = cstr(&name)?;
            let res = cvt(unsafe {
                libc::utimensat(
                    parent.entry.raw_fd(),
                    name_c.as_ptr(),
                    tv.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            });
            self.registry.release(parent.node, 1);
            return res.map(|_| ());
        }
        let path = proc_self_fd(entry.raw_fd());
        cvt(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), tv.as_ptr(), 0) })?;
        Ok(())
    }

    pub fn readlink(&self, node: NodeHandle) -> FsResult<OsString> {
        let entry = self.entry(node)?;
        let mut buf = [0u8; libc::PATH_MAX as usize + 1];
        let len = cvt_ssize(unsafe {
            libc::readlinkat(
                entry.raw_fd(),
                b"\0".as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        })?;
        if len == buf.len() {
            return Err(FsError::NameTooLong);
        }
        Ok(OsString::from_vec(buf[..len].to_vec()))
    }

    fn create_object<F>(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        caller: Caller,
        make: F,
    ) -> FsResult<Entry>
    where
        F: FnOnce(RawFd, &CString) -> libc::c_int,
    {
        let dir = self.entry(parent)?;
        let name_c = cstr(name)?;
        {
            // Created objects inherit the caller's ownership.
            let _cred = ScopedCred::switch(caller)?;
            cvt(make(dir.raw_fd(), &name_c))?;
        }
        self.bump(&dir);
        self.lookup(parent, name)
    }

    pub fn mknod(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        mode: u32,
        rdev: u64,
        caller: Caller,
    ) -> FsResult<Entry> {
        self.create_object(parent, name, caller, |dirfd, name_c| unsafe {
            libc::mknodat(
                dirfd,
                name_c.as_ptr(),
                mode as libc::mode_t,
                rdev as libc::dev_t,
            )
        })
    }

    pub fn mkdir(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        mode: u32,
        caller: Caller,
    ) -> FsResult<Entry> {
        self.create_object(parent, name, caller, |dirfd, name_c| unsafe {
            libc::mkdirat(dirfd, name_c.as_ptr(), mode as libc::mode_t)
        })
    }

    pub fn symlink(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        target: &OsStr,
        caller: Caller,
    ) -> FsResult<Entry> {
        let target_c = cstr(target)?;
        self.create_object(parent, name, caller, |dirfd, name_c| unsafe {
            libc::symlinkat(target_c.as_ptr(), dirfd, name_c.as_ptr())
        })
    }

    pub fn link(&self, node: NodeHandle, parent: NodeHandle, name: &OsStr) -> FsResult<Entry> {
        let entry = self.entry(node)?;
        let dir = self.entry(parent)?;
        let name_c = cstr(name)?;

        self.link_empty_nofollow(&entry, dir.raw_fd(), &name_c)?;

        let attr = stat_fd(entry.raw_fd())?;
        self.registry.retain(node, 1)?;
        self.bump(&entry);
        self.bump(&dir);
        Ok(Entry {
            node,
            attr,
            attr_timeout: self.timeout(),
            entry_timeout: self.timeout(),
            initial_version: self.versions.current(entry.version_slot),
            version_slot: entry.version_slot,
        })
    }

    /// Hard link without following the source. Regular objects link via
    /// their proc path; symlinks try the empty-path form and fall back to
    /// parent recovery when the kernel lacks it.
    fn link_empty_nofollow(
        &self,
        entry: &InodeEntry,
        dirfd: RawFd,
        name_c: &CString,
    ) -> FsResult<()> {
        if entry.is_symlink {
            let rc = unsafe {
                libc::linkat(
                    entry.raw_fd(),
                    b"\0".as_ptr() as *const libc::c_char,
                    dirfd,
                    name_c.as_ptr(),
                    libc::AT_EMPTY_PATH,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = FsError::last_os_error();
            if err.errno() != libc::ENOENT && err.errno() != libc::EINVAL {
                return Err(err);
            }
            if self.config.norace {
                return Err(FsError::OperationNotPermitted);
            }
            let (parent, name) = recover_parent(&self.registry, entry)?;
            let leaf_c = cstr(&name)?;
            let res = cvt(unsafe {
                libc::linkat(parent.entry.raw_fd(), leaf_c.as_ptr(), dirfd, name_c.as_ptr(), 0)
            });
            self.registry.release(parent.node, 1);
            return res.map(|_| ());
        }
        let path = proc_self_fd(entry.raw_fd());
        cvt(unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                path.as_ptr(),
                dirfd,
                name_c.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        })?;
        Ok(())
    }

    /// Stat-only resolution of a directory child against the registry;
    /// used to find the target of unlink/rmdir/rename for version bumps.
    fn resolve_child(&self, dir: &InodeEntry, name_c: &CString) -> Option<Registered> {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe {
            libc::fstatat(
                dir.raw_fd(),
                name_c.as_ptr(),
                st.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc == -1 {
            return None;
        }
        let st = unsafe { st.assume_init() };
        self.registry.find(InodeKey::from_stat(&st))
    }

    pub fn unlink(&self, parent: NodeHandle, name: &OsStr) -> FsResult<()> {
        self.remove_child(parent, name, 0)
    }

    pub fn rmdir(&self, parent: NodeHandle, name: &OsStr) -> FsResult<()> {
        self.remove_child(parent, name, libc::AT_REMOVEDIR)
    }

    fn remove_child(&self, parent: NodeHandle, name: &OsStr, flags: libc::c_int) -> FsResult<()> {
        let dir = self.entry(parent)?;
        let name_c = cstr(name)?;
        // The target must be resident so its counter can be bumped after
        // the unlink; a miss means the kernel never looked it up here.
        let target = self
            .resolve_child(&dir, &name_c)
            .ok_or(FsError::from_raw_os_error(libc::EIO))?;

        let res = cvt(unsafe { libc::unlinkat(dir.raw_fd(), name_c.as_ptr(), flags) });
        if res.is_ok() {
            self.bump(&target.entry);
            self.bump(&dir);
        }
        self.registry.release(target.node, 1);
        res.map(|_| ())
    }

    pub fn rename(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        newparent: NodeHandle,
        newname: &OsStr,
        flags: u32,
    ) -> FsResult<()> {
        let dir = self.entry(parent)?;
        let newdir = self.entry(newparent)?;
        let name_c = cstr(name)?;
        let newname_c = cstr(newname)?;

        let old = self
            .resolve_child(&dir, &name_c)
            .ok_or(FsError::from_raw_os_error(libc::EIO))?;
        let existing = self.resolve_child(&newdir, &newname_c);

        let res = if flags != 0 {
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_renameat2,
                    dir.raw_fd(),
                    name_c.as_ptr(),
                    newdir.raw_fd(),
                    newname_c.as_ptr(),
                    flags,
                )
            };
            if rc == -1 {
                let err = FsError::last_os_error();
                if err.errno() == libc::ENOSYS {
                    Err(FsError::InvalidArgument)
                } else {
                    Err(err)
                }
            } else {
                Ok(())
            }
        } else {
            cvt(unsafe {
                libc::renameat(
                    dir.raw_fd(),
                    name_c.as_ptr(),
                    newdir.raw_fd(),
                    newname_c.as_ptr(),
                )
            })
            .map(|_| ())
        };

        if res.is_ok() {
            self.bump(&old.entry);
            if let Some(existing) = &existing {
                self.bump(&existing.entry);
            }
            self.bump(&dir);
            self.bump(&newdir);
        }
        self.registry.release(old.node, 1);
        if let Some(existing) = existing {
            self.registry.release(existing.node, 1);
        }
        res
    }

    fn adjust_open_flags(&self, flags: i32) -> i32 {
        let mut flags = flags;
        // O_WRONLY descriptors cannot back a PROT_WRITE mmap; promote.
        if flags & libc::O_ACCMODE == libc::O_WRONLY {
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        // With writeback caching the kernel tracks the file size itself;
        // an O_APPEND descriptor would fight its positioning.
        if self.config.writeback && flags & libc::O_APPEND != 0 {
            flags &= !libc::O_APPEND;
        }
        flags
    }

    fn open_hints(&self) -> OpenHints {
        OpenHints {
            direct_io: matches!(self.config.cache, crate::config::CachePolicy::None),
            keep_cache: matches!(self.config.cache, crate::config::CachePolicy::Always),
        }
    }

    fn insert_file(&self, fd: OwnedFd) -> FileId {
        let id = self.next_file.fetch_add(1, Ordering::Relaxed);
        self.files.lock().unwrap().insert(id, OpenFile { fd });
        FileId(id)
    }

    pub fn open(&self, node: NodeHandle, flags: i32) -> FsResult<(FileId, OpenHints)> {
        let entry = self.entry(node)?;
        let flags = self.adjust_open_flags(flags);
        let path = proc_self_fd(entry.raw_fd());
        let fd = cvt(unsafe {
            libc::open(path.as_ptr(), (flags & !libc::O_NOFOLLOW) | libc::O_CLOEXEC)
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok((self.insert_file(fd), self.open_hints()))
    }

    pub fn create(
        &self,
        parent: NodeHandle,
        name: &OsStr,
        mode: u32,
        flags: i32,
        caller: Caller,
    ) -> FsResult<(Entry, FileId, OpenHints)> {
        let dir = self.entry(parent)?;
        let name_c = cstr(name)?;
        let flags = self.adjust_open_flags(flags);

        let fd = {
            let _cred = ScopedCred::switch(caller)?;
            cvt(unsafe {
                libc::openat(
                    dir.raw_fd(),
                    name_c.as_ptr(),
                    ((flags | libc::O_CREAT) & !libc::O_NOFOLLOW) | libc::O_CLOEXEC,
                    mode as libc::mode_t,
                )
            })?
        };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        self.bump(&dir);
        let entry = self.lookup(parent, name)?;
        Ok((entry, self.insert_file(fd), self.open_hints()))
    }

    pub fn read(&self, file: FileId, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let fd = self.file_fd(file)?;
        let mut buf = vec![0u8; size as usize];
        let n = cvt_ssize(unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, node: NodeHandle, file: FileId, offset: i64, data: &[u8]) -> FsResult<usize> {
        let entry = self.entry(node)?;
        let fd = self.file_fd(file)?;
        let mut written = 0usize;
        while written < data.len() {
            let n = cvt_ssize(unsafe {
                libc::pwrite(
                    fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                    offset as libc::off_t + written as libc::off_t,
                )
            });
            match n {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if written == 0 => return Err(e),
                Err(_) => break,
            }
        }
        self.bump(&entry);
        Ok(written)
    }

    pub fn flush(&self, file: FileId) -> FsResult<()> {
        let fd = self.file_fd(file)?;
        let dup = cvt(unsafe { libc::dup(fd) })?;
        cvt(unsafe { libc::close(dup) })?;
        Ok(())
    }

    pub fn fsync(&self, node: NodeHandle, file: Option<FileId>, datasync: bool) -> FsResult<()> {
        let adhoc;
        let fd = match file {
            Some(f) => self.file_fd(f)?,
            None => {
                let entry = self.entry(node)?;
                let path = proc_self_fd(entry.raw_fd());
                let fd = cvt(unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) })?;
                adhoc = unsafe { OwnedFd::from_raw_fd(fd) };
                adhoc.as_raw_fd()
            }
        };
        cvt(unsafe {
            if datasync {
                libc::fdatasync(fd)
            } else {
                libc::fsync(fd)
            }
        })?;
        Ok(())
    }

    pub fn fallocate(&self, node: NodeHandle, file: FileId, mode: i32, offset: i64, length: i64) -> FsResult<()> {
        if mode != 0 {
            return Err(FsError::Unsupported);
        }
        let entry = self.entry(node)?;
        let fd = self.file_fd(file)?;
        let err = unsafe { libc::posix_fallocate(fd, offset as libc::off_t, length as libc::off_t) };
        if err != 0 {
            return Err(FsError::from_raw_os_error(err));
        }
        self.bump(&entry);
        Ok(())
    }

    pub fn flock(&self, file: FileId, op: i32) -> FsResult<()> {
        if !self.config.flock {
            return Err(FsError::Unsupported);
        }
        let fd = self.file_fd(file)?;
        cvt(unsafe { libc::flock(fd, op) })?;
        Ok(())
    }

    pub fn release_file(&self, file: FileId) -> FsResult<()> {
        self.files
            .lock()
            .unwrap()
            .remove(&file.0)
            .map(|_| ())
            .ok_or(FsError::BadFileHandle)
    }

    pub fn opendir(&self, node: NodeHandle) -> FsResult<(DirId, OpenHints)> {
        let entry = self.entry(node)?;
        let stream = DirStream::open(entry.raw_fd()).map_err(FsError::Io)?;
        let id = self.next_dir.fetch_add(1, Ordering::Relaxed);
        self.dirs
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(stream)));
        let hints = OpenHints {
            direct_io: false,
            keep_cache: matches!(self.config.cache, crate::config::CachePolicy::Always),
        };
        Ok((DirId(id), hints))
    }

    fn dir_stream(&self, dir: DirId) -> FsResult<Arc<Mutex<DirStream>>> {
        self.dirs
            .lock()
            .unwrap()
            .get(&dir.0)
            .cloned()
            .ok_or(FsError::BadFileHandle)
    }

    /// Enumerate `dir` starting at `offset` into `sink`.
    ///
    /// In plus mode every non-dot entry is resolved through the registry,
    /// handing the transport a reference per delivered record. A record
    /// the sink rejects is undone: its reference is released and the raw
    /// entry pushed back so the next call re-serves it. Errors after the
    /// first delivered record truncate silently; the references already
    /// handed out must stay accounted.
    pub fn read_dir(
        &self,
        node: NodeHandle,
        dir: DirId,
        offset: i64,
        plus: bool,
        sink: &mut dyn DirSink,
    ) -> FsResult<()> {
        let stream = self.dir_stream(dir)?;
        let mut stream = stream.lock().unwrap();
        if offset != stream.position() {
            stream.seek(offset);
        }

        let mut served = false;
        loop {
            let raw = match stream.next_entry() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) if served => {
                    debug!(error = %e, "truncating listing after enumeration error");
                    break;
                }
                Err(e) => return Err(FsError::Io(e)),
            };

            let resolved = if plus && !raw.is_dot() {
                match self.lookup(node, &raw.name) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        stream.push_back(raw);
                        if served {
                            debug!(error = %e, "truncating plus listing after lookup error");
                            break;
                        }
                        return Err(e);
                    }
                }
            } else {
                None
            };

            let record = DirEntryRecord {
                name: raw.name.clone(),
                ino: raw.ino,
                type_bits: raw.type_bits(),
                offset: raw.next_offset,
                entry: resolved,
            };
            if !sink.push(&record) {
                // Not delivered: the reference acquired for it must not
                // leak, and the cursor must not move past the entry.
                if let Some(entry) = &record.entry {
                    self.registry.release(entry.node, 1);
                }
                stream.push_back(raw);
                break;
            }
            served = true;
        }
        Ok(())
    }

    pub fn releasedir(&self, dir: DirId) -> FsResult<()> {
        self.dirs
            .lock()
            .unwrap()
            .remove(&dir.0)
            .map(|_| ())
            .ok_or(FsError::BadFileHandle)
    }

    pub fn fsyncdir(&self, dir: DirId, datasync: bool) -> FsResult<()> {
        let stream = self.dir_stream(dir)?;
        let fd = stream.lock().unwrap().raw_fd();
        cvt(unsafe {
            if datasync {
                libc::fdatasync(fd)
            } else {
                libc::fsync(fd)
            }
        })?;
        Ok(())
    }

    pub fn statfs(&self, node: NodeHandle) -> FsResult<libc::statvfs> {
        let entry = self.entry(node)?;
        let mut st = MaybeUninit::<libc::statvfs>::uninit();
        cvt(unsafe { libc::fstatvfs(entry.raw_fd(), st.as_mut_ptr()) })?;
        Ok(unsafe { st.assume_init() })
    }

    /// Guard shared by the xattr family: feature switch, then the
    /// symlink hole (no race-free xattr access through a symlink fd).
    fn xattr_target(&self, node: NodeHandle) -> FsResult<Arc<InodeEntry>> {
        if !self.config.xattr {
            return Err(FsError::NotImplemented);
        }
        let entry = self.entry(node)?;
        if entry.is_symlink {
            return Err(FsError::OperationNotPermitted);
        }
        Ok(entry)
    }

    pub fn getxattr(&self, node: NodeHandle, name: &OsStr, size: u32) -> FsResult<XattrReply> {
        let entry = self.xattr_target(node)?;
        let path = proc_self_fd(entry.raw_fd());
        let name_c = cstr(name)?;
        if size == 0 {
            let len = cvt_ssize(unsafe {
                libc::getxattr(path.as_ptr(), name_c.as_ptr(), std::ptr::null_mut(), 0)
            })?;
            return Ok(XattrReply::Size(len as u64));
        }
        let mut buf = vec![0u8; size as usize];
        let len = cvt_ssize(unsafe {
            libc::getxattr(
                path.as_ptr(),
                name_c.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        })?;
        buf.truncate(len);
        Ok(XattrReply::Data(buf))
    }

    pub fn listxattr(&self, node: NodeHandle, size: u32) -> FsResult<XattrReply> {
        let entry = self.xattr_target(node)?;
        let path = proc_self_fd(entry.raw_fd());
        if size == 0 {
            let len =
                cvt_ssize(unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) })?;
            return Ok(XattrReply::Size(len as u64));
        }
        let mut buf = vec![0u8; size as usize];
        let len = cvt_ssize(unsafe {
            libc::listxattr(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        })?;
        buf.truncate(len);
        Ok(XattrReply::Data(buf))
    }

    pub fn setxattr(&self, node: NodeHandle, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
        let entry = self.xattr_target(node)?;
        let path = proc_self_fd(entry.raw_fd());
        let name_c = cstr(name)?;
        cvt(unsafe {
            libc::setxattr(
                path.as_ptr(),
                name_c.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        })?;
        self.bump(&entry);
        Ok(())
    }

    pub fn removexattr(&self, node: NodeHandle, name: &OsStr) -> FsResult<()> {
        let entry = self.xattr_target(node)?;
        let path = proc_self_fd(entry.raw_fd());
        let name_c = cstr(name)?;
        cvt(unsafe { libc::removexattr(path.as_ptr(), name_c.as_ptr()) })?;
        self.bump(&entry);
        Ok(())
    }

    pub fn setup_mapping(
        &self,
        node: NodeHandle,
        file: Option<FileId>,
        file_offset: u64,
        len: u64,
        target_offset: u64,
        writable: bool,
    ) -> FsResult<()> {
        let bridge = self.mapping.as_ref().ok_or(FsError::Unsupported)?;
        let entry = self.entry(node)?;
        let open_fd = file.map(|f| self.file_fd(f)).transpose()?;
        bridge.setup(&entry, open_fd, file_offset, len, target_offset, writable)
    }

    pub fn remove_mapping(&self, target_offset: u64, len: u64) -> FsResult<()> {
        let bridge = self.mapping.as_ref().ok_or(FsError::Unsupported)?;
        bridge.remove(target_offset, len)
    }

    /// Live registry entries, the root included. Exposed for shutdown
    /// accounting.
    pub fn live_inodes(&self) -> usize {
        self.registry.live_count()
    }
}
