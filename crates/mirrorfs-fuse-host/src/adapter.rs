// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MirrorFS FUSE adapter
//!
//! Maps kernel FUSE requests onto the MirrorFS core surface and errno
//! values back out. Inode numbers on the wire are the core's node
//! handles; file and directory handles are the core's open-table ids.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use fuser::{
    consts::{
        FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE, FUSE_DO_READDIRPLUS, FUSE_FLOCK_LOCKS,
        FUSE_WRITEBACK_CACHE,
    },
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use mirrorfs_core::{
    CachePolicy, Caller, DirEntryRecord, DirId, DirSink, Entry, FileId, FsResult, NodeHandle,
    PassthroughFs, SetAttrs, SetTime, XattrReply,
};

pub struct MirrorFsFuse {
    fs: PassthroughFs,
}

impl MirrorFsFuse {
    pub fn new(fs: PassthroughFs) -> Self {
        Self { fs }
    }
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller {
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn file_type_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0)
    }
}

fn attr_of(st: &libc::stat) -> FileAttr {
    FileAttr {
        ino: st.st_ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_of(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn set_time_of(t: TimeOrNow) -> SetTime {
    match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => SetTime::Time {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos() as i64,
            },
            Err(_) => SetTime::Time { sec: 0, nsec: 0 },
        },
    }
}

fn reply_entry(reply: ReplyEntry, entry: &Entry) {
    // The node handle already encodes the slot generation.
    reply.entry(&entry.entry_timeout, &wire_attr(entry), 0);
}

/// Attribute record as sent for a resolved entry. The kernel reuses the
/// attr's ino as the nodeid of every follow-up request, so it must carry
/// the node handle; the raw backing inode number only appears in plain
/// readdir records.
fn wire_attr(entry: &Entry) -> FileAttr {
    let mut attr = attr_of(&entry.attr);
    attr.ino = entry.node.0;
    attr
}

fn open_flags(hints: mirrorfs_core::OpenHints) -> u32 {
    let mut flags = 0;
    if hints.direct_io {
        flags |= FOPEN_DIRECT_IO;
    }
    if hints.keep_cache {
        flags |= FOPEN_KEEP_CACHE;
    }
    flags
}

/// Plain-mode sink over the kernel reply buffer.
struct PlainSink<'a> {
    reply: &'a mut ReplyDirectory,
}

impl DirSink for PlainSink<'_> {
    fn push(&mut self, record: &DirEntryRecord) -> bool {
        // add() returns true when the buffer is full.
        !self.reply.add(
            record.ino,
            record.offset,
            file_type_of(record.type_bits),
            &record.name,
        )
    }
}

/// Plus-mode sink; dot entries carry a synthesized minimal attr.
struct PlusSink<'a> {
    reply: &'a mut ReplyDirectoryPlus,
}

impl DirSink for PlusSink<'_> {
    fn push(&mut self, record: &DirEntryRecord) -> bool {
        let full = match &record.entry {
            Some(entry) => self.reply.add(
                entry.node.0,
                record.offset,
                &record.name,
                &entry.entry_timeout,
                &wire_attr(entry),
                0,
            ),
            None => {
                let attr = FileAttr {
                    ino: record.ino,
                    size: 0,
                    blocks: 0,
                    atime: UNIX_EPOCH,
                    mtime: UNIX_EPOCH,
                    ctime: UNIX_EPOCH,
                    crtime: UNIX_EPOCH,
                    kind: file_type_of(record.type_bits),
                    perm: 0,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    blksize: 0,
                    flags: 0,
                };
                self.reply
                    .add(record.ino, record.offset, &record.name, &Duration::ZERO, &attr, 0)
            }
        };
        !full
    }
}

macro_rules! try_reply {
    ($reply:expr, $res:expr) => {
        match $res {
            Ok(v) => v,
            Err(e) => {
                $reply.error(e.errno());
                return;
            }
        }
    };
}

fn empty_result(reply: ReplyEmpty, res: FsResult<()>) {
    match res {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}

impl fuser::Filesystem for MirrorFsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if self.fs.config().writeback {
            if let Err(missing) = config.add_capabilities(FUSE_WRITEBACK_CACHE) {
                warn!(missing, "kernel lacks writeback cache support");
            }
        }
        if self.fs.config().flock {
            if let Err(missing) = config.add_capabilities(FUSE_FLOCK_LOCKS) {
                warn!(missing, "kernel lacks flock support");
            }
        }
        // Plus-mode readdir stays off under cache=none and in shared mode;
        // the kernel falls back to plain readdir.
        let fs_config = self.fs.config();
        if fs_config.cache != CachePolicy::None && fs_config.shared.is_none() {
            if let Err(missing) = config.add_capabilities(FUSE_DO_READDIRPLUS) {
                warn!(missing, "kernel lacks readdirplus support");
            }
        }
        debug!("kernel session initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let entry = try_reply!(reply, self.fs.lookup(NodeHandle(parent), name));
        reply_entry(reply, &entry);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(NodeHandle(ino), nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        let items: Vec<_> = nodes
            .iter()
            .map(|n| (NodeHandle(n.nodeid), n.nlookup))
            .collect();
        self.fs.forget_multi(&items);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let (st, ttl) = try_reply!(reply, self.fs.getattr(NodeHandle(ino)));
        // st_ino reported to userspace must match what entry replies carry.
        let mut attr = attr_of(&st);
        attr.ino = ino;
        reply.attr(&ttl, &attr);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttrs {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(set_time_of),
            mtime: mtime.map(set_time_of),
        };
        let (st, ttl) = try_reply!(
            reply,
            self.fs.setattr(NodeHandle(ino), &changes, fh.map(FileId))
        );
        let mut attr = attr_of(&st);
        attr.ino = ino;
        reply.attr(&ttl, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        use std::os::unix::ffi::OsStrExt;
        let target = try_reply!(reply, self.fs.readlink(NodeHandle(ino)));
        reply.data(target.as_os_str().as_bytes());
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let entry = try_reply!(
            reply,
            self.fs
                .mknod(NodeHandle(parent), name, mode, rdev as u64, caller_of(req))
        );
        reply_entry(reply, &entry);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let entry = try_reply!(
            reply,
            self.fs.mkdir(NodeHandle(parent), name, mode, caller_of(req))
        );
        reply_entry(reply, &entry);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        empty_result(reply, self.fs.unlink(NodeHandle(parent), name));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        empty_result(reply, self.fs.rmdir(NodeHandle(parent), name));
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let entry = try_reply!(
            reply,
            self.fs
                .symlink(NodeHandle(parent), link_name, target.as_os_str(), caller_of(req))
        );
        reply_entry(reply, &entry);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        empty_result(
            reply,
            self.fs
                .rename(NodeHandle(parent), name, NodeHandle(newparent), newname, flags),
        );
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let entry = try_reply!(
            reply,
            self.fs.link(NodeHandle(ino), NodeHandle(newparent), newname)
        );
        reply_entry(reply, &entry);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let (file, hints) = try_reply!(reply, self.fs.open(NodeHandle(ino), flags));
        reply.opened(file.0, open_flags(hints));
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (entry, file, hints) = try_reply!(
            reply,
            self.fs
                .create(NodeHandle(parent), name, mode, flags, caller_of(req))
        );
        reply.created(
            &entry.entry_timeout,
            &wire_attr(&entry),
            0,
            file.0,
            open_flags(hints),
        );
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let data = try_reply!(reply, self.fs.read(FileId(fh), offset, size));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let written = try_reply!(reply, self.fs.write(NodeHandle(ino), FileId(fh), offset, data));
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        empty_result(reply, self.fs.flush(FileId(fh)));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        empty_result(reply, self.fs.release_file(FileId(fh)));
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        empty_result(reply, self.fs.fsync(NodeHandle(ino), Some(FileId(fh)), datasync));
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let (dir, hints) = try_reply!(reply, self.fs.opendir(NodeHandle(ino)));
        reply.opened(dir.0, open_flags(hints));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mut sink = PlainSink { reply: &mut reply };
        match self
            .fs
            .read_dir(NodeHandle(ino), DirId(fh), offset, false, &mut sink)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let mut sink = PlusSink { reply: &mut reply };
        match self
            .fs
            .read_dir(NodeHandle(ino), DirId(fh), offset, true, &mut sink)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        empty_result(reply, self.fs.releasedir(DirId(fh)));
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        empty_result(reply, self.fs.fsyncdir(DirId(fh), datasync));
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let st = try_reply!(reply, self.fs.statfs(NodeHandle(ino)));
        reply.statfs(
            st.f_blocks,
            st.f_bfree,
            st.f_bavail,
            st.f_files,
            st.f_ffree,
            st.f_bsize as u32,
            st.f_namemax as u32,
            st.f_frsize as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        empty_result(reply, self.fs.setxattr(NodeHandle(ino), name, value, flags));
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.fs.getxattr(NodeHandle(ino), name, size) {
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Ok(XattrReply::Size(len)) => reply.size(len as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(NodeHandle(ino), size) {
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Ok(XattrReply::Size(len)) => reply.size(len as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        empty_result(reply, self.fs.removexattr(NodeHandle(ino), name));
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        empty_result(
            reply,
            self.fs.fallocate(NodeHandle(ino), FileId(fh), mode, offset, length),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_core::{Config, FsError};

    #[test]
    fn test_entry_reply_ino_is_the_node_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), b"payload").unwrap();
        let fs = PassthroughFs::new(Config::new(dir.path()), None).unwrap();

        let entry = fs.lookup(NodeHandle(1), OsStr::new("data.txt")).unwrap();
        let attr = wire_attr(&entry);

        // The kernel sends attr.ino back as the nodeid of every follow-up
        // request, so it must round-trip through the registry.
        assert_eq!(attr.ino, entry.node.0);
        assert!(fs.getattr(NodeHandle(attr.ino)).is_ok());

        // The raw backing ino is not a node handle. Skip the check in the
        // unlikely event it collides with a live handle.
        let raw = entry.attr.st_ino;
        if raw != entry.node.0 && raw != 1 {
            assert!(matches!(
                fs.getattr(NodeHandle(raw)),
                Err(FsError::StaleHandle)
            ));
        }
        fs.forget(entry.node, 1);
    }

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(file_type_of(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(file_type_of(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(file_type_of(libc::S_IFREG | 0o644), FileType::RegularFile);
        // Directory-entry form: d_type shifted into the mode position.
        assert_eq!(file_type_of((libc::DT_DIR as u32) << 12), FileType::Directory);
    }

    #[test]
    fn test_attr_conversion_preserves_identity() {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_ino = 42;
        st.st_mode = libc::S_IFREG | 0o640;
        st.st_size = 1234;
        st.st_uid = 1000;
        st.st_gid = 100;
        st.st_nlink = 2;
        st.st_mtime = 1_700_000_000;

        let attr = attr_of(&st);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.size, 1234);
        assert_eq!(attr.nlink, 2);
        assert_eq!(
            attr.mtime,
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_set_time_conversion() {
        assert_eq!(set_time_of(TimeOrNow::Now), SetTime::Now);
        let t = UNIX_EPOCH + Duration::new(77, 5);
        assert_eq!(
            set_time_of(TimeOrNow::SpecificTime(t)),
            SetTime::Time { sec: 77, nsec: 5 }
        );
    }
}
