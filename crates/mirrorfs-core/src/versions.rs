// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared version tracking
//!
//! Multiple daemon instances mirroring the same backing tree detect each
//! other's modifications through a memory-mapped table of 64-bit counters.
//! Slots are leased from an out-of-process coordinator over a SEQPACKET
//! socket; counters themselves are plain per-slot atomics, shared across
//! process boundaries with no further locking.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, warn};

use mirrorfs_proto::{CoordinatorReply, CoordinatorRequest, COORD_RECORD_LEN};

use crate::config::SharedConfig;
use crate::error::{FsError, FsResult};
use crate::types::InodeKey;

/// Memory-mapped array of version counters shared between daemons.
pub struct VersionTable {
    base: *mut i64,
    slots: usize,
    map_len: usize,
}

// The mapping is immutable after construction; slot access goes through
// atomics.
unsafe impl Send for VersionTable {}
unsafe impl Sync for VersionTable {}

impl VersionTable {
    /// Map the coordinator's counter file.
    pub fn open(path: &Path) -> FsResult<Self> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| FsError::InvalidArgument)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(FsError::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } < 0 {
            return Err(FsError::last_os_error());
        }
        let map_len = st.st_size as usize;
        if map_len < std::mem::size_of::<i64>() {
            return Err(FsError::InvalidArgument);
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(FsError::last_os_error());
        }

        Ok(Self {
            base: addr as *mut i64,
            slots: map_len / std::mem::size_of::<i64>(),
            map_len,
        })
    }

    /// Anonymous shared mapping, used by tests standing in for the
    /// coordinator's counter file.
    pub fn anonymous(slots: usize) -> FsResult<Self> {
        let map_len = slots * std::mem::size_of::<i64>();
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(FsError::last_os_error());
        }
        Ok(Self {
            base: addr as *mut i64,
            slots,
            map_len,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    fn slot(&self, index: u64) -> Option<&AtomicI64> {
        if index == 0 || index as usize >= self.slots {
            return None;
        }
        // In-bounds slot of a live shared mapping.
        Some(unsafe { &*(self.base.add(index as usize) as *const AtomicI64) })
    }
}

impl Drop for VersionTable {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

/// Slot lease granted by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAssignment {
    pub slot: u64,
    pub refid: u64,
}

enum PromiseState {
    Waiting,
    Fulfilled(SlotAssignment),
    Failed,
}

/// Per-request reply promise, fulfilled exactly once by the reader thread.
struct Promise {
    state: Mutex<PromiseState>,
    ready: Condvar,
}

impl Promise {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PromiseState::Waiting),
            ready: Condvar::new(),
        })
    }

    fn fulfill(&self, assignment: Option<SlotAssignment>) {
        let mut state = self.state.lock().unwrap();
        *state = match assignment {
            Some(a) => PromiseState::Fulfilled(a),
            None => PromiseState::Failed,
        };
        self.ready.notify_one();
    }

    fn wait(&self) -> Option<SlotAssignment> {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                PromiseState::Waiting => state = self.ready.wait(state).unwrap(),
                PromiseState::Fulfilled(a) => return Some(a),
                PromiseState::Failed => return None,
            }
        }
    }
}

type PendingMap = Mutex<HashMap<u64, Arc<Promise>>>;

struct ClientInner {
    sock: OwnedFd,
    table: VersionTable,
    pending: Arc<PendingMap>,
    next_handle: AtomicU64,
    channel_down: Arc<std::sync::atomic::AtomicBool>,
}

/// Client side of the shared version protocol.
///
/// A disabled client is a set of no-ops: entries stay untracked and
/// `current` always reports the 0 sentinel.
pub struct VersionClient {
    inner: Option<ClientInner>,
}

impl VersionClient {
    /// Shared tracking off; every entry stays untracked.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Connect to the coordinator and map the counter table. Both the
    /// socket and the table are mandatory here; the caller asked for
    /// shared tracking explicitly.
    pub fn connect(shared: &SharedConfig) -> FsResult<Self> {
        let sock = connect_seqpacket(&shared.socket)?;
        let table = VersionTable::open(&shared.table)?;
        Self::from_parts(sock, table)
    }

    /// Build a client from an already-connected socket and table. Used by
    /// `connect` and by tests running a scripted coordinator over a
    /// socketpair.
    pub fn from_parts(sock: OwnedFd, table: VersionTable) -> FsResult<Self> {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let channel_down = Arc::new(std::sync::atomic::AtomicBool::new(false));
        // The reader gets its own descriptor so a dropped client can never
        // leave it reading from a recycled fd number.
        let reader_fd = sock.try_clone()?;
        spawn_reader(reader_fd, Arc::clone(&pending), Arc::clone(&channel_down));
        Ok(Self {
            inner: Some(ClientInner {
                sock,
                table,
                pending,
                next_handle: AtomicU64::new(1),
                channel_down,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Lease a version slot for a newly discovered object.
    ///
    /// Blocks the calling thread until the coordinator replies. Channel
    /// failures degrade to `None`: the entry simply stays untracked.
    pub fn acquire(&self, key: InodeKey) -> Option<SlotAssignment> {
        let inner = self.inner.as_ref()?;

        let handle = inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let promise = Promise::new();
        inner.pending.lock().unwrap().insert(handle, Arc::clone(&promise));

        let req = CoordinatorRequest::Get {
            handle,
            dev: key.dev,
            ino: key.ino,
        };
        if let Err(e) = send_record(&inner.sock, &req.to_bytes()) {
            warn!("coordinator GET failed: {e}");
            inner.pending.lock().unwrap().remove(&handle);
            return None;
        }
        // The reader marks the channel down before failing waiters; a
        // request registered after that point would otherwise wait forever.
        if inner.channel_down.load(Ordering::SeqCst) {
            inner.pending.lock().unwrap().remove(&handle);
            return None;
        }

        let assignment = promise.wait();
        if let Some(a) = assignment {
            debug!(dev = key.dev, ino = key.ino, slot = a.slot, "version slot leased");
        }
        assignment
    }

    /// Return a slot lease to the coordinator. Fire and forget.
    pub fn put(&self, refid: u64) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let req = CoordinatorRequest::Put { refid };
        if let Err(e) = send_record(&inner.sock, &req.to_bytes()) {
            warn!("coordinator PUT failed: {e}");
        }
    }

    /// Record a locally observed mutation of the tracked object.
    pub fn bump(&self, slot: u64) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        match inner.table.slot(slot) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            None if slot != 0 => warn!(slot, "version slot out of range"),
            None => {}
        }
    }

    /// Current counter value; 0 sentinel for untracked objects.
    pub fn current(&self, slot: u64) -> i64 {
        let Some(inner) = self.inner.as_ref() else {
            return 0;
        };
        inner.table.slot(slot).map_or(0, |c| c.load(Ordering::SeqCst))
    }
}

fn connect_seqpacket(path: &Path) -> FsResult<OwnedFd> {
    let sock = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
    if sock < 0 {
        return Err(FsError::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(FsError::NameTooLong);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let res = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(FsError::last_os_error());
    }
    Ok(sock)
}

fn send_record(sock: &OwnedFd, record: &[u8; COORD_RECORD_LEN]) -> std::io::Result<()> {
    // MSG_NOSIGNAL: a torn-down coordinator must surface as EPIPE, not kill
    // the daemon with SIGPIPE.
    let res = unsafe {
        libc::send(
            sock.as_raw_fd(),
            record.as_ptr() as *const libc::c_void,
            record.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if res as usize != record.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short write to coordinator: {res}"),
        ));
    }
    Ok(())
}

/// Sole consumer of coordinator replies. Matches each reply to its waiting
/// request by correlation handle; on channel failure fails all waiters and
/// exits, leaving the feature degraded.
fn spawn_reader(
    sock: OwnedFd,
    pending: Arc<PendingMap>,
    channel_down: Arc<std::sync::atomic::AtomicBool>,
) {
    thread::Builder::new()
        .name("mirrorfs-ireg".into())
        .spawn(move || {
            let mut buf = [0u8; 128];
            loop {
                let res = unsafe {
                    libc::read(sock.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if res <= 0 {
                    if res < 0 {
                        warn!("coordinator read failed: {}", std::io::Error::last_os_error());
                    } else {
                        warn!("disconnected from coordinator");
                    }
                    break;
                }
                let reply = match CoordinatorReply::parse(&buf[..res as usize]) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("bad coordinator reply: {e}");
                        continue;
                    }
                };
                match pending.lock().unwrap().remove(&reply.handle) {
                    Some(promise) => promise.fulfill(Some(SlotAssignment {
                        slot: reply.slot,
                        refid: reply.refid,
                    })),
                    None => warn!(handle = reply.handle, "unmatched coordinator reply"),
                }
            }
            channel_down.store(true, Ordering::SeqCst);
            // Wake everything still waiting; their objects stay untracked.
            let mut map = pending.lock().unwrap();
            for (_, promise) in map.drain() {
                promise.fulfill(None);
            }
        })
        .expect("failed to spawn coordinator reader thread");
}


#[cfg(test)]
mod tests {
    use super::testutil::{scripted_client as test_client, socketpair};
    use super::*;

    #[test]
    fn test_disabled_client_is_untracked() {
        let client = VersionClient::disabled();
        assert!(!client.is_enabled());
        assert!(client.acquire(InodeKey { dev: 1, ino: 2 }).is_none());
        client.bump(5);
        assert_eq!(client.current(5), 0);
        assert_eq!(client.current(0), 0);
    }

    #[test]
    fn test_acquire_assigns_distinct_slots() {
        let client = test_client(Arc::new(Mutex::new(Vec::new())));
        let a = client.acquire(InodeKey { dev: 1, ino: 10 }).unwrap();
        let b = client.acquire(InodeKey { dev: 1, ino: 11 }).unwrap();
        assert_ne!(a.slot, b.slot);
        assert_ne!(a.refid, b.refid);
    }

    #[test]
    fn test_bump_is_visible_and_monotonic() {
        let client = test_client(Arc::new(Mutex::new(Vec::new())));
        let a = client.acquire(InodeKey { dev: 1, ino: 10 }).unwrap();
        assert_eq!(client.current(a.slot), 0);
        client.bump(a.slot);
        assert_eq!(client.current(a.slot), 1);
        client.bump(a.slot);
        assert_eq!(client.current(a.slot), 2);
    }

    #[test]
    fn test_concurrent_bumps_are_counted_exactly() {
        let client = Arc::new(test_client(Arc::new(Mutex::new(Vec::new()))));
        let a = client.acquire(InodeKey { dev: 1, ino: 42 }).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = Arc::clone(&client);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    client.bump(a.slot);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(client.current(a.slot), 4000);
    }

    #[test]
    fn test_put_reaches_coordinator() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let client = test_client(Arc::clone(&puts));
        let a = client.acquire(InodeKey { dev: 9, ino: 9 }).unwrap();
        client.put(a.refid);
        // The PUT is fire-and-forget; give the fake coordinator a moment.
        for _ in 0..100 {
            if !puts.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(puts.lock().unwrap().as_slice(), &[a.refid]);
    }

    #[test]
    fn test_disconnect_degrades_acquire() {
        let (ours, theirs) = socketpair();
        drop(theirs);
        let client = VersionClient::from_parts(ours, VersionTable::anonymous(8).unwrap()).unwrap();
        // Reader sees EOF; sends may also fail. Either way acquire must
        // come back untracked instead of hanging.
        assert!(client.acquire(InodeKey { dev: 1, ino: 1 }).is_none());
    }

    #[test]
    fn test_from_parts_reports_dead_descriptor() {
        // A descriptor number that cannot be open; the reader dup fails
        // with EBADF and the error must surface instead of panicking.
        let bogus = unsafe { OwnedFd::from_raw_fd(i32::MAX) };
        let res = VersionClient::from_parts(bogus, VersionTable::anonymous(8).unwrap());
        assert!(res.is_err());
    }

    #[test]
    fn test_out_of_range_slot_reads_zero() {
        let client = test_client(Arc::new(Mutex::new(Vec::new())));
        assert_eq!(client.current(9999), 0);
        client.bump(9999); // must not crash
    }
}
