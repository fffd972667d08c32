// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode identity registry
//!
//! Reference-counted cache mapping backing-store identity (dev, ino) to an
//! open O_PATH descriptor. Entries live in a generation-checked arena; the
//! handle handed to the transport encodes (index, generation), so a
//! recycled slot turns stale handles into errors instead of aliases.
//!
//! One mutex guards the arena, the key map, and all reference counts. It
//! is never held across a system call or a coordinator wait: descriptor
//! opening happens before insertion (re-checked under the lock), and
//! destruction side effects run after removal.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::types::{InodeKey, NodeHandle};
use crate::versions::VersionClient;

/// Root reference count; large enough that release traffic can never
/// reach zero.
const ROOT_REFCOUNT: u64 = u64::MAX / 2;

/// Cached descriptor and metadata for one live identity.
#[derive(Debug)]
pub struct InodeEntry {
    fd: OwnedFd,
    pub key: InodeKey,
    /// Symlink objects take different code paths everywhere a normal
    /// reopen would follow the link; fixed at creation.
    pub is_symlink: bool,
    /// Slot in the shared version table; 0 when untracked.
    pub version_slot: u64,
    /// Coordinator reference id used to release the slot.
    pub refid: u64,
}

impl InodeEntry {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

struct Slot {
    generation: u32,
    refcount: u64,
    entry: Arc<InodeEntry>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    /// Recycled indices with the generation to assign on reuse.
    free: Vec<(u32, u32)>,
    by_key: HashMap<InodeKey, u32>,
}

/// A resolved registry reference. `node` carries one reference count that
/// the holder must eventually return via `release`.
#[derive(Debug)]
pub struct Registered {
    pub node: NodeHandle,
    pub entry: Arc<InodeEntry>,
}

pub struct InodeRegistry {
    inner: Mutex<Inner>,
    versions: Arc<VersionClient>,
}

impl InodeRegistry {
    /// Seed the registry with the root descriptor. Leases the root's
    /// version slot when shared tracking is on.
    pub fn new(root_fd: OwnedFd, root_key: InodeKey, versions: Arc<VersionClient>) -> Self {
        let assignment = versions.acquire(root_key);
        let root = Slot {
            generation: 0,
            refcount: ROOT_REFCOUNT,
            entry: Arc::new(InodeEntry {
                fd: root_fd,
                key: root_key,
                is_symlink: false,
                version_slot: assignment.map_or(0, |a| a.slot),
                refid: assignment.map_or(0, |a| a.refid),
            }),
        };
        let mut by_key = HashMap::new();
        by_key.insert(root_key, 1u32);
        Self {
            // Index 0 stays unused so the root lands on handle 1.
            inner: Mutex::new(Inner {
                slots: vec![None, Some(root)],
                free: Vec::new(),
                by_key,
            }),
            versions: Arc::clone(&versions),
        }
    }

    pub fn root(&self) -> Arc<InodeEntry> {
        let inner = self.inner.lock().unwrap();
        Arc::clone(&inner.slots[1].as_ref().expect("root slot missing").entry)
    }

    /// Resolve a handle without touching reference counts.
    pub fn get(&self, node: NodeHandle) -> FsResult<Arc<InodeEntry>> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .get(node.index() as usize)
            .and_then(|s| s.as_ref())
            .filter(|s| s.generation == node.generation())
            .map(|s| Arc::clone(&s.entry))
            .ok_or(FsError::StaleHandle)
    }

    /// Stat-only resolution: look up a known identity and take one
    /// reference. Never opens anything.
    pub fn find(&self, key: InodeKey) -> Option<Registered> {
        let mut inner = self.inner.lock().unwrap();
        let index = *inner.by_key.get(&key)?;
        let slot = inner.slots[index as usize].as_mut().expect("keyed slot missing");
        assert!(slot.refcount > 0, "live entry with zero refcount");
        slot.refcount += 1;
        Some(Registered {
            node: NodeHandle::pack(index, slot.generation),
            entry: Arc::clone(&slot.entry),
        })
    }

    /// Look up `key`, creating the entry from `open` on a miss.
    ///
    /// `open` runs outside the lock and produces the descriptor plus the
    /// symlink flag; the miss is re-checked on insertion, and a raced
    /// duplicate is discarded (descriptor dropped, slot lease returned).
    /// Returns the reference plus whether this call created the entry.
    pub fn find_or_create<F>(&self, key: InodeKey, open: F) -> FsResult<(Registered, bool)>
    where
        F: FnOnce() -> FsResult<(OwnedFd, bool)>,
    {
        if let Some(existing) = self.find(key) {
            return Ok((existing, false));
        }

        let (fd, is_symlink) = open()?;
        let assignment = self.versions.acquire(key);
        let entry = Arc::new(InodeEntry {
            fd,
            key,
            is_symlink,
            version_slot: assignment.map_or(0, |a| a.slot),
            refid: assignment.map_or(0, |a| a.refid),
        });

        let registered = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&index) = inner.by_key.get(&key) {
                // Lost the race; adopt the winner's entry.
                let slot = inner.slots[index as usize].as_mut().expect("keyed slot missing");
                slot.refcount += 1;
                let existing = Registered {
                    node: NodeHandle::pack(index, slot.generation),
                    entry: Arc::clone(&slot.entry),
                };
                drop(inner);
                if let Some(a) = assignment {
                    self.versions.put(a.refid);
                }
                return Ok((existing, false));
            }

            let (index, generation) = match inner.free.pop() {
                Some(slot) => slot,
                None => {
                    inner.slots.push(None);
                    ((inner.slots.len() - 1) as u32, 0)
                }
            };
            let node = NodeHandle::pack(index, generation);
            inner.slots[index as usize] = Some(Slot {
                generation,
                refcount: 1,
                entry: Arc::clone(&entry),
            });
            inner.by_key.insert(key, index);
            Registered { node, entry }
        };

        debug!(
            dev = key.dev,
            ino = key.ino,
            node = registered.node.0,
            "registered inode"
        );
        Ok((registered, true))
    }

    /// Add `n` references; used for link creation and plus-mode lookups.
    pub fn retain(&self, node: NodeHandle, n: u64) -> FsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(node.index() as usize)
            .and_then(|s| s.as_mut())
            .filter(|s| s.generation == node.generation())
            .ok_or(FsError::StaleHandle)?;
        slot.refcount += n;
        Ok(())
    }

    /// Drop `n` references. Destroys the entry on zero: removal happens
    /// under the lock, descriptor close and slot release after it.
    ///
    /// Reference underflow and stale handles are caller defects and panic.
    pub fn release(&self, node: NodeHandle, n: u64) {
        let destroyed = {
            let mut inner = self.inner.lock().unwrap();
            let index = node.index() as usize;
            let slot = inner
                .slots
                .get_mut(index)
                .and_then(|s| s.as_mut())
                .filter(|s| s.generation == node.generation())
                .unwrap_or_else(|| panic!("release of stale node handle {:#x}", node.0));
            assert!(
                slot.refcount >= n,
                "refcount underflow on node {:#x}: {} - {}",
                node.0,
                slot.refcount,
                n
            );
            slot.refcount -= n;
            if slot.refcount > 0 {
                return;
            }
            let slot = inner.slots[index].take().expect("slot vanished");
            inner.by_key.remove(&slot.entry.key);
            inner.free.push((index as u32, slot.generation.wrapping_add(1)));
            slot.entry
        };

        debug!(
            dev = destroyed.key.dev,
            ino = destroyed.key.ino,
            node = node.0,
            "destroying inode"
        );
        let refid = destroyed.refid;
        let tracked = destroyed.version_slot != 0;
        // Last registry reference: the descriptor closes here unless an
        // in-flight operation still holds the Arc for the syscall it is in.
        drop(destroyed);
        if tracked {
            self.versions.put(refid);
        }
    }

    /// Number of live entries, the pre-seeded root included.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::FromRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn open_path_fd(path: &Path) -> OwnedFd {
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_PATH) };
        assert!(fd >= 0, "open({}) failed", path.display());
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    fn key_of(path: &Path) -> InodeKey {
        let meta = std::fs::metadata(path).unwrap();
        use std::os::unix::fs::MetadataExt;
        InodeKey {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    fn test_registry(root: &Path) -> InodeRegistry {
        InodeRegistry::new(
            open_path_fd(root),
            key_of(root),
            Arc::new(VersionClient::disabled()),
        )
    }

    #[test]
    fn test_root_is_handle_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        assert_eq!(registry.live_count(), 1);
        let root = registry.get(NodeHandle::ROOT).unwrap();
        assert_eq!(root.key, key_of(dir.path()));
    }

    #[test]
    fn test_entry_lives_while_refcount_positive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let registry = test_registry(dir.path());
        let file = dir.path().join("f");
        let key = key_of(&file);

        let (reg, created) = registry
            .find_or_create(key, || Ok((open_path_fd(&file), false)))
            .unwrap();
        assert!(created);
        assert_eq!(registry.live_count(), 2);

        // Second resolution reuses the entry and bumps the count.
        let (reg2, created2) = registry
            .find_or_create(key, || panic!("must not reopen a cached identity"))
            .unwrap();
        assert!(!created2);
        assert_eq!(reg.node, reg2.node);

        registry.release(reg.node, 1);
        assert_eq!(registry.live_count(), 2);
        registry.release(reg2.node, 1);
        assert_eq!(registry.live_count(), 1);
        assert!(matches!(registry.get(reg.node), Err(FsError::StaleHandle)));
    }

    #[test]
    fn test_find_is_stat_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let registry = test_registry(dir.path());
        let file = dir.path().join("f");
        let key = key_of(&file);

        assert!(registry.find(key).is_none());
        let (reg, _) = registry.find_or_create(key, || Ok((open_path_fd(&file), false))).unwrap();
        let found = registry.find(key).unwrap();
        assert_eq!(found.node, reg.node);
        registry.release(reg.node, 2);
        assert!(registry.find(key).is_none());
    }

    #[test]
    fn test_concurrent_create_opens_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let registry = Arc::new(test_registry(dir.path()));
        let file = dir.path().join("f");
        let key = key_of(&file);
        let opens = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let opens = Arc::clone(&opens);
            let file = file.clone();
            handles.push(thread::spawn(move || {
                let (reg, _) = registry
                    .find_or_create(key, || {
                        opens.fetch_add(1, Ordering::SeqCst);
                        Ok((open_path_fd(&file), false))
                    })
                    .unwrap();
                reg.node
            }));
        }
        let nodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // All callers resolved the same handle and exactly one entry is
        // live; losers' descriptors were discarded on insert.
        assert!(nodes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.live_count(), 2);

        registry.release(nodes[0], 8);
        assert_eq!(registry.live_count(), 1);
        // Raced factories may each have opened, but every surplus
        // descriptor was dropped; only the winner's was retained.
        assert!(opens.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_recycled_slot_rejects_stale_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"x").unwrap();
        let registry = test_registry(dir.path());

        let a = dir.path().join("a");
        let (reg_a, _) =
            registry.find_or_create(key_of(&a), || Ok((open_path_fd(&a), false))).unwrap();
        let stale = reg_a.node;
        registry.release(stale, 1);

        // The freed slot is reused with a bumped generation.
        let b = dir.path().join("b");
        let (reg_b, _) =
            registry.find_or_create(key_of(&b), || Ok((open_path_fd(&b), false))).unwrap();
        assert_eq!(reg_b.node.index(), stale.index());
        assert_ne!(reg_b.node.generation(), stale.generation());
        assert!(matches!(registry.get(stale), Err(FsError::StaleHandle)));
        registry.release(reg_b.node, 1);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_overrelease_panics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let registry = test_registry(dir.path());
        let file = dir.path().join("f");
        let (reg, _) = registry
            .find_or_create(key_of(&file), || Ok((open_path_fd(&file), false)))
            .unwrap();
        registry.release(reg.node, 2);
    }

    #[test]
    fn test_retain_supports_batched_forget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let registry = test_registry(dir.path());
        let file = dir.path().join("f");
        let (reg, _) = registry
            .find_or_create(key_of(&file), || Ok((open_path_fd(&file), false)))
            .unwrap();
        registry.retain(reg.node, 4).unwrap();
        registry.release(reg.node, 5);
        assert_eq!(registry.live_count(), 1);
    }
}
