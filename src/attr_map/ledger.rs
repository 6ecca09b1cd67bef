//! The shared table of slots, mapped by every process using the same pinned
//! directory.
//!
//! Layout (native endian, all fields naturally aligned):
//!
//! ```text
//! header  (64 bytes)  magic u64 | version u32 | capacity u32 | holders u32 | reserved
//! entry   (32 bytes)  state u32 | refs u32 | fingerprint u64 | cgroup u64 | reserved u64
//! holder  (32 bytes)  pid u32 | entry u32 | refs u32 | pad u32 | start time u64 | reserved u64
//! ```
//!
//! `capacity` entries follow the header, then `holders` holder rows. An entry
//! is one slot: a fingerprint, counted system-wide (`cgroup` 0) or in one
//! cgroup. A holder row records how many of an entry's references one
//! process holds, so the references of a process that died without releasing
//! them can be found and dropped. A holder's `entry` is the entry index plus
//! one, zero marking a free row.
//!
//! Counts change only through atomic operations on the mapped memory, and
//! every change happens under [`Ledger::lock`]: an exclusive `flock(2)` on the
//! pinned directory against other processes, plus a mutex against other
//! threads sharing this mapping.

use std::fs::{self, File};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use memmap2::MmapMut;
use tracing::{debug, info, trace, warn};

use super::SlotKey;
use crate::cgroup::CgroupId;
use crate::error::{new_error, Error, ErrorKind};
use crate::event::Fingerprint;

const MAGIC: u64 = u64::from_le_bytes(*b"BPRFATTR");
const HEADER_SIZE: usize = 64;
const ENTRY_SIZE: usize = 32;
const HOLDER_SIZE: usize = 32;

/// Holder rows allotted per entry when a ledger is created.
const HOLDERS_PER_ENTRY: u32 = 4;

const FREE: u32 = 0;
const LIVE: u32 = 1;

#[repr(C)]
struct Header {
    magic: u64,
    version: u32,
    capacity: u32,
    holders: u32,
}

#[repr(C)]
struct RawEntry {
    state: AtomicU32,
    refs: AtomicU32,
    fingerprint: AtomicU64,
    cgroup: AtomicU64,
    _reserved: u64,
}

#[repr(C)]
struct RawHolder {
    pid: AtomicU32,
    entry: AtomicU32,
    refs: AtomicU32,
    _pad: u32,
    start: AtomicU64,
    _reserved: u64,
}

/// A point-in-time copy of a live ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Position in the ledger.
    pub index: usize,
    /// The slot this entry stands for.
    pub key: SlotKey,
    /// References held across every process.
    pub refs: u32,
    /// Processes holding at least one reference.
    pub holders: u32,
}

/// Identifies a process across pid reuse: its pid and its start time in
/// clock ticks since boot, as found in `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Holder {
    pub(crate) pid: u32,
    pub(crate) start: u64,
}

lazy_static! {
    static ref CURRENT: Holder = {
        let pid = std::process::id();
        Holder {
            pid,
            start: process_start(pid).unwrap_or(0),
        }
    };
}

impl Holder {
    /// This process.
    pub(crate) fn current() -> Holder {
        *CURRENT
    }

    /// A process that has already exited.
    #[cfg(test)]
    pub(crate) fn exited() -> Holder {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        Holder {
            pid,
            start: u64::MAX,
        }
    }

    fn is_alive(&self) -> bool {
        match process_start(self.pid) {
            Some(start) => self.start == 0 || start == self.start,
            None => false,
        }
    }
}

/// Field 22 of `/proc/<pid>/stat`, or `None` if there is no such process.
fn process_start(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name is parenthesised and may itself contain spaces or
    // parentheses; fields are counted from the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[derive(Debug)]
struct FileLock<'a>(&'a File);

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(FileLock(file));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl<'a> Drop for FileLock<'a> {
    fn drop(&mut self) {
        unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Create or map the regular file at `path` as ledger storage, sizing a new
/// file to `len` bytes.
#[cfg(test)]
pub(crate) fn map_file(path: &Path, len: usize) -> Result<MmapMut, Error> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)?;
    if file.metadata()?.len() == 0 {
        file.set_len(len as u64)?;
    }
    Ok(unsafe { memmap2::MmapOptions::new().map_mut(&file)? })
}

#[derive(Debug)]
pub(crate) struct Ledger {
    dir: File,
    map: MmapMut,
    capacity: usize,
    holders: usize,
    me: Holder,
    lock: Mutex<()>,
}

impl Ledger {
    /// Open the ledger kept in the directory `dir`, creating it with
    /// `capacity` entries if it does not exist yet. An existing ledger keeps
    /// its own capacity.
    ///
    /// `storage` maps the ledger memory. It is called with the directory
    /// locked and the size a new ledger needs, and returns either a fresh
    /// zeroed mapping of that size or the existing one.
    pub(crate) fn open<F>(
        dir: &Path,
        version: u32,
        capacity: u32,
        me: Holder,
        storage: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce(usize) -> Result<MmapMut, Error>,
    {
        if capacity == 0 {
            return Err(Error::with_context(
                ErrorKind::Config,
                "attribute map capacity must be non-zero",
            ));
        }

        fs::create_dir_all(dir)?;
        let lock_file = File::open(dir)?;
        let lock = FileLock::exclusive(&lock_file)?;

        let holders = capacity * HOLDERS_PER_ENTRY;
        let mut map = storage(Self::len_for(capacity as usize, holders as usize))?;
        if map.len() < HEADER_SIZE {
            return Err(Error::with_context(
                ErrorKind::IncompatibleMap,
                format!("{} is too short", dir.display()),
            ));
        }

        let fresh = map.iter().all(|b| *b == 0);
        // SAFETY: the mapping is page aligned and holds at least a header.
        let header = unsafe { &mut *(map.as_mut_ptr() as *mut Header) };
        if fresh {
            if map.len() != Self::len_for(capacity as usize, holders as usize) {
                return Err(Error::with_context(
                    ErrorKind::IncompatibleMap,
                    format!("{} has unexpected length {}", dir.display(), map.len()),
                ));
            }
            header.version = version;
            header.capacity = capacity;
            header.holders = holders;
            header.magic = MAGIC;
            debug!(path = %dir.display(), capacity, holders, "created attribute map");
        } else if header.magic != MAGIC || header.version != version {
            return Err(Error::with_context(
                ErrorKind::IncompatibleMap,
                format!(
                    "{} has magic {:#x} version {}",
                    dir.display(),
                    header.magic,
                    header.version
                ),
            ));
        }

        let capacity = header.capacity as usize;
        let holders = header.holders as usize;
        if map.len() != Self::len_for(capacity, holders) {
            return Err(Error::with_context(
                ErrorKind::IncompatibleMap,
                format!("{} has unexpected length {}", dir.display(), map.len()),
            ));
        }
        drop(lock);

        Ok(Self {
            dir: lock_file,
            map,
            capacity,
            holders,
            me,
            lock: Mutex::new(()),
        })
    }

    fn len_for(capacity: usize, holders: usize) -> usize {
        HEADER_SIZE + capacity * ENTRY_SIZE + holders * HOLDER_SIZE
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn entry(&self, index: usize) -> &RawEntry {
        assert!(index < self.capacity);
        debug_assert_eq!(mem::size_of::<RawEntry>(), ENTRY_SIZE);
        // SAFETY: index is in bounds of the mapping, which lives as long as
        // self; entries are 8-byte aligned and only accessed through atomics.
        unsafe { &*(self.map.as_ptr().add(HEADER_SIZE + index * ENTRY_SIZE) as *const RawEntry) }
    }

    fn holder(&self, row: usize) -> &RawHolder {
        assert!(row < self.holders);
        debug_assert_eq!(mem::size_of::<RawHolder>(), HOLDER_SIZE);
        let offset = HEADER_SIZE + self.capacity * ENTRY_SIZE + row * HOLDER_SIZE;
        // SAFETY: as for entry().
        unsafe { &*(self.map.as_ptr().add(offset) as *const RawHolder) }
    }

    fn key_of(e: &RawEntry) -> SlotKey {
        let cgroup = e.cgroup.load(Ordering::SeqCst);
        SlotKey {
            fingerprint: Fingerprint(e.fingerprint.load(Ordering::SeqCst)),
            cgroup: (cgroup != 0).then_some(CgroupId(cgroup)),
        }
    }

    /// Serialise changes against every other user of the ledger.
    pub(crate) fn lock(&self) -> Result<Locked<'_>, Error> {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let flock = FileLock::exclusive(&self.dir)?;
        Ok(Locked {
            ledger: self,
            _flock: flock,
            _guard: guard,
        })
    }

    /// Copy out every live entry.
    pub(crate) fn entries(&self) -> Vec<LedgerEntry> {
        (0..self.capacity)
            .filter_map(|index| {
                let e = self.entry(index);
                if e.state.load(Ordering::SeqCst) != LIVE {
                    return None;
                }
                let tag = index as u32 + 1;
                let holders = (0..self.holders)
                    .filter(|&row| self.holder(row).entry.load(Ordering::SeqCst) == tag)
                    .count() as u32;
                Some(LedgerEntry {
                    index,
                    key: Self::key_of(e),
                    refs: e.refs.load(Ordering::SeqCst),
                    holders,
                })
            })
            .filter(|e| e.refs > 0)
            .collect()
    }
}

/// Exclusive access to a [`Ledger`]. Dropping it unlocks.
pub(crate) struct Locked<'a> {
    ledger: &'a Ledger,
    _flock: FileLock<'a>,
    _guard: MutexGuard<'a, ()>,
}

impl Locked<'_> {
    /// The live entry for `key`.
    pub(crate) fn find(&self, key: &SlotKey) -> Option<usize> {
        let l = self.ledger;
        (0..l.capacity).find(|&index| {
            let e = l.entry(index);
            e.state.load(Ordering::SeqCst) == LIVE
                && e.refs.load(Ordering::SeqCst) > 0
                && Ledger::key_of(e) == *key
        })
    }

    /// Take another reference on the live entry `index`. Returns the new
    /// count.
    pub(crate) fn reference(&self, index: usize) -> Result<u32, Error> {
        let e = self.ledger.entry(index);
        if e.state.load(Ordering::SeqCst) != LIVE {
            return Err(new_error(ErrorKind::State));
        }
        self.hold(index)?;
        let refs = e.refs.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(index, refs, "referenced attribute map entry");
        Ok(refs)
    }

    /// Claim a free entry for `key` with one reference held by this process.
    pub(crate) fn claim(&self, key: &SlotKey) -> Result<usize, Error> {
        let l = self.ledger;
        let index = (0..l.capacity)
            .find(|&index| l.entry(index).state.load(Ordering::SeqCst) == FREE)
            .ok_or_else(|| {
                Error::with_context(
                    ErrorKind::ResourceExhausted,
                    format!("all {} attribute map entries in use", l.capacity),
                )
            })?;

        self.hold(index)?;
        let e = l.entry(index);
        e.fingerprint.store(key.fingerprint.0, Ordering::SeqCst);
        e.cgroup
            .store(key.cgroup.map_or(0, |id| id.0), Ordering::SeqCst);
        e.refs.store(1, Ordering::SeqCst);
        e.state.store(LIVE, Ordering::SeqCst);
        debug!(index, %key, "claimed attribute map entry");
        Ok(index)
    }

    /// Drop one of this process's references on `index`, freeing the entry
    /// when it was the last reference anywhere. Returns the remaining count.
    pub(crate) fn release(&self, index: usize) -> Result<u32, Error> {
        let l = self.ledger;
        if index >= l.capacity || l.entry(index).state.load(Ordering::SeqCst) != LIVE {
            return Err(new_error(ErrorKind::State));
        }
        self.unhold(index)?;
        Ok(self.unref(index, 1))
    }

    /// Drop every reference held by processes that have exited. Returns the
    /// keys of the entries this freed.
    pub(crate) fn reclaim(&self) -> Vec<SlotKey> {
        let l = self.ledger;
        if l.me.start == 0 {
            // Without /proc every other process would look dead.
            warn!("cannot tell which processes are alive, not reclaiming");
            return vec![];
        }

        let mut freed = vec![];
        for row in 0..l.holders {
            let h = l.holder(row);
            let tag = h.entry.load(Ordering::SeqCst);
            if tag == 0 {
                continue;
            }
            let holder = Holder {
                pid: h.pid.load(Ordering::SeqCst),
                start: h.start.load(Ordering::SeqCst),
            };
            if holder == l.me || holder.is_alive() {
                continue;
            }

            let index = tag as usize - 1;
            let refs = h.refs.swap(0, Ordering::SeqCst);
            h.entry.store(0, Ordering::SeqCst);
            if index >= l.capacity {
                continue;
            }

            let key = Ledger::key_of(l.entry(index));
            let remaining = self.unref(index, refs);
            info!(
                index,
                %key,
                pid = holder.pid,
                refs,
                remaining,
                "reclaimed references of exited process"
            );
            if remaining == 0 {
                freed.push(key);
            }
        }
        freed
    }

    // Count one more reference of this process on `index`.
    fn hold(&self, index: usize) -> Result<(), Error> {
        let l = self.ledger;
        let tag = index as u32 + 1;
        let mut free = None;
        for row in 0..l.holders {
            let h = l.holder(row);
            let entry = h.entry.load(Ordering::SeqCst);
            if entry == 0 {
                free = free.or(Some(row));
                continue;
            }
            if entry == tag
                && h.pid.load(Ordering::SeqCst) == l.me.pid
                && h.start.load(Ordering::SeqCst) == l.me.start
            {
                h.refs.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }

        let row = free.ok_or_else(|| {
            Error::with_context(
                ErrorKind::ResourceExhausted,
                format!("all {} attribute map holder rows in use", l.holders),
            )
        })?;
        let h = l.holder(row);
        h.pid.store(l.me.pid, Ordering::SeqCst);
        h.start.store(l.me.start, Ordering::SeqCst);
        h.refs.store(1, Ordering::SeqCst);
        h.entry.store(tag, Ordering::SeqCst);
        Ok(())
    }

    fn unhold(&self, index: usize) -> Result<(), Error> {
        let l = self.ledger;
        let tag = index as u32 + 1;
        for row in 0..l.holders {
            let h = l.holder(row);
            if h.entry.load(Ordering::SeqCst) != tag
                || h.pid.load(Ordering::SeqCst) != l.me.pid
                || h.start.load(Ordering::SeqCst) != l.me.start
            {
                continue;
            }
            if h.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
                h.entry.store(0, Ordering::SeqCst);
            }
            return Ok(());
        }
        Err(Error::with_context(
            ErrorKind::State,
            format!("this process holds no reference on entry {}", index),
        ))
    }

    // Subtract `n` from the count of `index`, freeing the entry at zero.
    fn unref(&self, index: usize, n: u32) -> u32 {
        let e = self.ledger.entry(index);
        let mut refs = e.refs.load(Ordering::SeqCst);
        let remaining = loop {
            let next = refs.saturating_sub(n);
            match e
                .refs
                .compare_exchange(refs, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break next,
                Err(actual) => refs = actual,
            }
        };

        if remaining == 0 {
            e.state.store(FREE, Ordering::SeqCst);
            debug!(index, "freed attribute map entry");
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_as(dir: &tempfile::TempDir, capacity: u32, me: Holder) -> Ledger {
        let path = dir.path().join("map");
        let file = path.join("ledger");
        Ledger::open(&path, 1, capacity, me, |len| map_file(&file, len)).unwrap()
    }

    fn ledger(dir: &tempfile::TempDir, capacity: u32) -> Ledger {
        open_as(dir, capacity, Holder::current())
    }

    fn key(fp: u64) -> SlotKey {
        SlotKey::global(Fingerprint(fp))
    }

    fn acquire(l: &Ledger, k: SlotKey) -> Result<usize, Error> {
        let locked = l.lock()?;
        match locked.find(&k) {
            Some(index) => locked.reference(index).map(|_| index),
            None => locked.claim(&k),
        }
    }

    #[test]
    fn test_dedup_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(&dir, 4);

        let a = acquire(&l, key(1)).unwrap();
        let b = acquire(&l, key(1)).unwrap();
        let c = acquire(&l, key(2)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(l.entries().len(), 2);

        let locked = l.lock().unwrap();
        assert_eq!(locked.release(a).unwrap(), 1);
        assert_eq!(locked.release(b).unwrap(), 0);
        assert_eq!(locked.release(a).unwrap_err().kind(), &ErrorKind::State);
        drop(locked);
        assert_eq!(l.entries().len(), 1);
    }

    #[test]
    fn test_cgroup_keys_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(&dir, 4);

        let global = acquire(&l, key(1)).unwrap();
        let scoped = acquire(&l, SlotKey::cgroup(Fingerprint(1), CgroupId(42))).unwrap();
        assert_ne!(global, scoped);

        let entries = l.entries();
        assert_eq!(entries[1].key.cgroup, Some(CgroupId(42)));
        assert_eq!(entries[1].key.fingerprint, Fingerprint(1));
    }

    #[test]
    fn test_full() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(&dir, 2);

        acquire(&l, key(1)).unwrap();
        let idx = acquire(&l, key(2)).unwrap();
        let err = acquire(&l, key(3)).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ResourceExhausted);

        // Freed entries are reused.
        l.lock().unwrap().release(idx).unwrap();
        assert_eq!(acquire(&l, key(3)).unwrap(), idx);
    }

    #[test]
    fn test_shared_between_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let a = ledger(&dir, 4);
        // A second mapping stands in for a second process; capacity comes from
        // the existing ledger.
        let b = open_as(&dir, 16, Holder::exited());
        assert_eq!(b.capacity(), 4);

        let i = acquire(&a, key(7)).unwrap();
        let j = acquire(&b, key(7)).unwrap();
        assert_eq!(i, j);

        let entry = a.entries()[0];
        assert_eq!(entry.refs, 2);
        assert_eq!(entry.holders, 2);

        a.lock().unwrap().release(i).unwrap();
        b.lock().unwrap().release(j).unwrap();
        assert!(a.entries().is_empty());
    }

    #[test]
    fn test_release_of_unheld_reference() {
        let dir = tempfile::tempdir().unwrap();
        let a = ledger(&dir, 4);
        let b = open_as(&dir, 4, Holder::exited());

        let i = acquire(&a, key(7)).unwrap();
        let err = b.lock().unwrap().release(i).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::State);
        assert_eq!(a.entries()[0].refs, 1);
    }

    #[test]
    fn test_reclaim_exited_holder() {
        let dir = tempfile::tempdir().unwrap();
        let live = ledger(&dir, 2);
        let dead = open_as(&dir, 2, Holder::exited());

        // The exited process shared one entry and held another alone.
        let shared = acquire(&live, key(1)).unwrap();
        assert_eq!(acquire(&dead, key(1)).unwrap(), shared);
        acquire(&dead, key(1)).unwrap();
        acquire(&dead, key(2)).unwrap();
        assert_eq!(
            acquire(&live, key(3)).unwrap_err().kind(),
            &ErrorKind::ResourceExhausted
        );

        let freed = live.lock().unwrap().reclaim();
        assert_eq!(freed, vec![key(2)]);

        let entries = live.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].refs, 1);
        assert_eq!(entries[0].holders, 1);
        acquire(&live, key(3)).unwrap();
    }

    #[test]
    fn test_reclaim_keeps_live_holders() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(&dir, 2);
        acquire(&l, key(1)).unwrap();
        acquire(&l, key(2)).unwrap();

        assert!(l.lock().unwrap().reclaim().is_empty());
        assert_eq!(l.entries().len(), 2);
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        let file = path.join("ledger");
        let me = Holder::current();
        Ledger::open(&path, 1, 4, me, |len| map_file(&file, len)).unwrap();

        let err = Ledger::open(&path, 2, 4, me, |len| map_file(&file, len)).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::IncompatibleMap);
    }

    #[test]
    fn test_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        let file = path.join("ledger");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(&file, b"not a map").unwrap();

        let err = Ledger::open(&path, 1, 4, Holder::current(), |len| map_file(&file, len))
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::IncompatibleMap);
    }

    #[test]
    fn test_concurrent_acquire_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let l = Arc::new(ledger(&dir, 8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let l = Arc::clone(&l);
                std::thread::spawn(move || acquire(&l, key(42)).unwrap())
            })
            .collect();
        let indexes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(indexes.iter().all(|&i| i == indexes[0]));
        let entry = l.entries()[0];
        assert_eq!(entry.refs, 8);
        assert_eq!(entry.holders, 1);
    }

    #[test]
    fn test_debug() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(&dir, 2);
        let s = format!("{:?}", l);
        assert!(s.starts_with("Ledger"), "{}", s);
        assert!(s.contains("capacity: 2"), "{}", s);
    }

    #[test]
    fn test_process_start() {
        let me = Holder::current();
        assert_eq!(me.pid, std::process::id());
        assert_ne!(me.start, 0);
        assert!(me.is_alive());
        assert!(!Holder::exited().is_alive());
    }
}
