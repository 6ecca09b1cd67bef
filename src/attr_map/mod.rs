//! The shared attribute map: one counting slot per distinct event
//! configuration, however many groups or processes ask for it.
//!
//! A map is a directory, pinned at `<pin_dir>/bperf_attr_map_v<N>`. It holds
//! the [ledger], which every process sharing the directory maps and which
//! records the slots and who references them, plus each slot's counters,
//! pinned under the slot's [`SlotKey`] name. The first reference to a key
//! starts the counters and pins them; later references, from this process or
//! any other, attach to the pinned counters; the last release stops and
//! unpins them.
//!
//! A slot scoped to a cgroup is a slot of its own, keyed by the event's
//! fingerprint and the cgroup id, so a cgroup attached by several processes
//! is also counted once.
//!
//! [ledger]: ledger/index.html

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{CountingSlot, PerfBackend, SlotBackend};
use crate::cgroup::{Cgroup, CgroupId};
use crate::config::AttrMapConfig;
use crate::error::{new_error, Error, ErrorKind};
use crate::event::{EventConfig, Fingerprint, PerfAttr};
use crate::reading::CounterReading;
use crate::scope::Scope;

pub mod ledger;
pub(crate) use self::ledger::Holder;
use self::ledger::{Ledger, LedgerEntry, Locked};

/// Directory name prefix of the pinned map.
pub const ATTR_MAP_PREFIX: &str = "bperf_attr_map_v";

/// Bumped whenever the ledger layout changes incompatibly.
pub const ATTR_MAP_VERSION: u32 = 1;

/// Names one slot: an event fingerprint, counted system-wide or in a single
/// cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// The counted event.
    pub fingerprint: Fingerprint,
    /// The cgroup counted, or `None` for every task.
    pub cgroup: Option<CgroupId>,
}

impl SlotKey {
    /// The system-wide slot for `fingerprint`.
    pub fn global(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            cgroup: None,
        }
    }

    /// The slot counting `fingerprint` in cgroup `id` only.
    pub fn cgroup(fingerprint: Fingerprint, id: CgroupId) -> Self {
        Self {
            fingerprint,
            cgroup: Some(id),
        }
    }

    /// The file name the slot's counters are pinned under.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cgroup {
            Some(id) => write!(f, "{}_cg{}", self.fingerprint, id),
            None => write!(f, "{}", self.fingerprint),
        }
    }
}

struct LocalSlot<S> {
    key: SlotKey,
    slot: Arc<S>,
    refs: usize,
}

/// Maps event fingerprints to shared counting slots.
///
/// Construct one per process (or per pin directory) and share it between
/// groups with `Arc`.
pub struct AttrMap<B: SlotBackend = PerfBackend> {
    path: PathBuf,
    ledger: Ledger,
    backend: B,
    slots: Mutex<HashMap<usize, LocalSlot<B::Slot>>>,
}

impl AttrMap<PerfBackend> {
    /// Open the map described by `config`, counting with `perf_event_open(2)`.
    pub fn open(config: AttrMapConfig) -> Result<Arc<Self>, Error> {
        let backend = match config.cpus() {
            Some(cpus) => PerfBackend::with_cpus(cpus.to_vec()),
            None => PerfBackend::new(),
        };
        Self::with_backend(config, backend)
    }
}

impl<B: SlotBackend> AttrMap<B> {
    /// Open the map described by `config`, with `backend` creating the
    /// counters.
    ///
    /// References left behind by processes that exited without releasing
    /// them are dropped here.
    pub fn with_backend(config: AttrMapConfig, backend: B) -> Result<Arc<Self>, Error> {
        Self::open_as(config, backend, Holder::current())
    }

    pub(crate) fn open_as(
        config: AttrMapConfig,
        backend: B,
        me: Holder,
    ) -> Result<Arc<Self>, Error> {
        let path = config.path();
        let capacity = config.capacity_or_default();
        let ledger = Ledger::open(&path, ATTR_MAP_VERSION, capacity, me, |len| {
            backend.ledger(&path, len)
        })?;
        info!(path = %path.display(), capacity = ledger.capacity(), "opened attribute map");

        let map = Self {
            path,
            ledger,
            backend,
            slots: Mutex::new(HashMap::new()),
        };
        map.reclaim(&map.ledger.lock()?);
        Ok(Arc::new(map))
    }

    /// The pinned path of this map.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backend creating this map's counters.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Live entries across every process sharing the pinned map.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger.entries()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, LocalSlot<B::Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reference the system-wide slot for `config`, starting its counters if
    /// no process has yet.
    ///
    /// The returned handle releases its reference when dropped.
    pub fn acquire(self: &Arc<Self>, config: &EventConfig) -> Result<SlotHandle<B>, Error> {
        let key = SlotKey::global(config.fingerprint());
        self.acquire_key(key, config.perf_attr(), None)
            .map_err(|e| {
                warn!(%key, event = %config, error = %e, "cannot acquire slot");
                e
            })
    }

    fn acquire_key(
        self: &Arc<Self>,
        key: SlotKey,
        attr: PerfAttr,
        cgroup: Option<&Cgroup>,
    ) -> Result<SlotHandle<B>, Error> {
        let mut slots = self.lock();
        let ledger = self.ledger.lock()?;

        let (index, created) = match self.reference(&ledger, &key, &attr, cgroup) {
            Err(e) if e.kind() == &ErrorKind::ResourceExhausted && self.reclaim(&ledger) > 0 => {
                self.reference(&ledger, &key, &attr, cgroup)
            }
            r => r,
        }?;

        let slot = if let Some(slot) = created {
            info!(index, %key, "created slot");
            Arc::new(slot)
        } else if let Some(local) = slots.get_mut(&index) {
            debug_assert_eq!(local.key, key);
            local.refs += 1;
            Arc::clone(&local.slot)
        } else {
            match self.backend.open(&self.path, &key) {
                Ok(slot) => {
                    debug!(index, %key, "attached to pinned slot");
                    Arc::new(slot)
                }
                Err(e) => {
                    self.unref(&ledger, index, &key);
                    return Err(e);
                }
            }
        };
        slots.entry(index).or_insert_with(|| LocalSlot {
            key,
            slot: Arc::clone(&slot),
            refs: 1,
        });

        Ok(SlotHandle {
            map: Arc::clone(self),
            index,
            key,
            attr,
            slot,
            cgroups: vec![],
            released: false,
        })
    }

    // Reference the live entry for `key`, or claim one and start counting.
    // Leaves the ledger unchanged on error.
    fn reference(
        &self,
        ledger: &Locked<'_>,
        key: &SlotKey,
        attr: &PerfAttr,
        cgroup: Option<&Cgroup>,
    ) -> Result<(usize, Option<B::Slot>), Error> {
        if let Some(index) = ledger.find(key) {
            ledger.reference(index)?;
            return Ok((index, None));
        }

        let index = ledger.claim(key)?;
        match self.backend.create(&self.path, key, attr, cgroup) {
            Ok(slot) => Ok((index, Some(slot))),
            Err(e) => {
                if let Err(e) = ledger.release(index) {
                    warn!(index, %key, error = %e, "cannot release attribute map entry");
                }
                Err(e)
            }
        }
    }

    // Drop references of exited processes, stopping the slots nobody else
    // holds. Returns how many slots were freed.
    fn reclaim(&self, ledger: &Locked<'_>) -> usize {
        let freed = ledger.reclaim();
        for key in &freed {
            if let Err(e) = self.backend.destroy(&self.path, key) {
                warn!(%key, error = %e, "cannot destroy reclaimed slot");
            }
        }
        freed.len()
    }

    fn unref(&self, ledger: &Locked<'_>, index: usize, key: &SlotKey) {
        match ledger.release(index) {
            Ok(0) => {
                info!(index, %key, "destroying slot");
                if let Err(e) = self.backend.destroy(&self.path, key) {
                    warn!(index, %key, error = %e, "cannot destroy slot");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(index, %key, error = %e, "cannot release attribute map entry"),
        }
    }

    fn release(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.lock();
        let local = slots
            .get_mut(&index)
            .ok_or_else(|| new_error(ErrorKind::State))?;
        let key = local.key;
        local.refs -= 1;
        if local.refs == 0 {
            // Closes this process's view of the counters, not the counters.
            slots.remove(&index);
        }

        let ledger = self.ledger.lock()?;
        if ledger.release(index)? == 0 {
            info!(index, %key, "destroying slot");
            self.backend.destroy(&self.path, &key)?;
        }
        Ok(())
    }
}

/// A counted reference to one slot of an [`AttrMap`].
///
/// A handle can additionally reference the slot's per-cgroup twins, one per
/// attached cgroup. Dropping the handle releases all of them.
pub struct SlotHandle<B: SlotBackend = PerfBackend> {
    map: Arc<AttrMap<B>>,
    index: usize,
    key: SlotKey,
    attr: PerfAttr,
    slot: Arc<B::Slot>,
    cgroups: Vec<(CgroupId, SlotHandle<B>)>,
    released: bool,
}

impl<B: SlotBackend> SlotHandle<B> {
    /// Position of the slot in the ledger.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The slot's key.
    pub fn key(&self) -> SlotKey {
        self.key
    }

    /// Fingerprint of the counted event.
    pub fn fingerprint(&self) -> Fingerprint {
        self.key.fingerprint
    }

    /// Cgroups attached through this handle.
    pub fn cgroups(&self) -> impl Iterator<Item = CgroupId> + '_ {
        self.cgroups.iter().map(|(id, _)| *id)
    }

    /// Count the slot's event in `cgroup` too, readable with
    /// [`Scope::Cgroup`]. The cgroup's counters are shared like any other
    /// slot. Attaching twice does nothing.
    ///
    /// [`Scope::Cgroup`]: enum.Scope.html#variant.Cgroup
    pub fn attach_cgroup(&mut self, cgroup: &Cgroup) -> Result<(), Error> {
        let id = cgroup.id();
        if self.cgroups.iter().any(|(c, _)| *c == id) {
            return Ok(());
        }

        let key = SlotKey::cgroup(self.key.fingerprint, id);
        let handle = self.map.acquire_key(key, self.attr, Some(cgroup))?;
        debug!(index = self.index, cgroup = %id, "attached cgroup to slot");
        self.cgroups.push((id, handle));
        Ok(())
    }

    /// Stop counting in cgroup `id` through this handle. Detaching a cgroup
    /// that is not attached does nothing.
    pub fn detach_cgroup(&mut self, id: CgroupId) -> Result<(), Error> {
        let pos = match self.cgroups.iter().position(|(c, _)| *c == id) {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let (_, handle) = self.cgroups.swap_remove(pos);
        debug!(index = self.index, cgroup = %id, "detached cgroup from slot");
        handle.release()
    }

    /// Read the slot's current totals for `scope`. A cgroup not attached
    /// through this handle reads zero.
    pub fn read(&self, scope: Scope) -> Result<CounterReading, Error> {
        match scope {
            Scope::Global => self.slot.read(),
            Scope::Cgroup(id) => match self.cgroups.iter().find(|(c, _)| *c == id) {
                Some((_, handle)) => handle.slot.read(),
                None => Ok(CounterReading::default()),
            },
        }
    }

    /// Detach every cgroup and drop the reference, reporting the first
    /// failure.
    pub fn release(mut self) -> Result<(), Error> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut result = Ok(());
        for (_, handle) in self.cgroups.drain(..) {
            if let Err(e) = handle.release() {
                result = result.and(Err(e));
            }
        }
        let released = self.map.release(self.index);
        result.and(released)
    }
}

impl<B: SlotBackend> Drop for SlotHandle<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(index = self.index, key = %self.key, error = %e, "failed to release slot");
        }
    }
}

impl<B: SlotBackend> fmt::Debug for SlotHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("cgroups", &self.cgroups().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::fake::FakeBackend;
    use crate::catalog::{Catalog, GenericCatalog};
    use crate::event::EventExtraAttr;

    fn config(dir: &tempfile::TempDir, capacity: u32) -> AttrMapConfig {
        AttrMapConfig::default()
            .pin_dir(dir.path())
            .capacity(capacity)
    }

    fn map(dir: &tempfile::TempDir, capacity: u32) -> (Arc<AttrMap<FakeBackend>>, FakeBackend) {
        let fake = FakeBackend::new();
        (AttrMap::with_backend(config(dir, capacity), fake.clone()).unwrap(), fake)
    }

    // A map opened by a process that has since exited.
    fn exited_map(dir: &tempfile::TempDir, fake: &FakeBackend) -> Arc<AttrMap<FakeBackend>> {
        AttrMap::open_as(config(dir, 4), fake.clone(), Holder::exited()).unwrap()
    }

    fn conf(event: &str) -> EventConfig {
        GenericCatalog::new()
            .find_device_by_name("generic_hardware")
            .unwrap()
            .make_config(event, EventExtraAttr::default(), Default::default())
            .unwrap()
    }

    #[test]
    fn test_path() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = map(&dir, 4);
        assert_eq!(m.path(), dir.path().join("bperf_attr_map_v1"));
        assert!(m.path().is_dir());
    }

    #[test]
    fn test_slot_key_names() {
        let fp = Fingerprint(0xab);
        assert_eq!(SlotKey::global(fp).name(), "00000000000000ab");
        assert_eq!(
            SlotKey::cgroup(fp, CgroupId(7)).name(),
            "00000000000000ab_cg7"
        );
    }

    #[test]
    fn test_identical_configs_share_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fake) = map(&dir, 4);

        let a = m.acquire(&conf("cycles")).unwrap();
        let b = m.acquire(&conf("cpu_cycles")).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(fake.created(), 1);
        assert_eq!(m.entries()[0].refs, 2);

        drop(a);
        assert_eq!(fake.live(), 1);
        drop(b);
        assert_eq!(fake.live(), 0);
        assert!(m.entries().is_empty());
    }

    #[test]
    fn test_maps_on_one_pin_dir_share_counters() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeBackend::new();
        // Two maps on one directory behave like two processes.
        let first = AttrMap::with_backend(config(&dir, 4), fake.clone()).unwrap();
        let second = AttrMap::with_backend(config(&dir, 4), fake.clone()).unwrap();

        let a = first.acquire(&conf("cycles")).unwrap();
        fake.tick(100);
        let b = second.acquire(&conf("cycles")).unwrap();
        fake.tick(1);

        assert_eq!(fake.created(), 1);
        assert_eq!(fake.opened(), 1);
        assert_eq!(a.read(Scope::Global).unwrap().counter, 101);
        assert_eq!(
            a.read(Scope::Global).unwrap(),
            b.read(Scope::Global).unwrap()
        );
        assert_eq!(first.entries()[0].refs, 2);

        // The creator leaving does not stop the counters.
        drop(a);
        fake.tick(1);
        assert_eq!(b.read(Scope::Global).unwrap().counter, 102);
        drop(b);
        assert_eq!(fake.live(), 0);
        assert_eq!(fake.destroyed(), 1);
    }

    #[test]
    fn test_ledger_full() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fake) = map(&dir, 1);

        let _a = m.acquire(&conf("cycles")).unwrap();
        let err = m.acquire(&conf("instructions")).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ResourceExhausted);
        assert_eq!(fake.created(), 1);
    }

    #[test]
    fn test_exited_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeBackend::new();
        let crashed = exited_map(&dir, &fake);
        std::mem::forget(crashed.acquire(&conf("cycles")).unwrap());
        std::mem::forget(crashed.acquire(&conf("instructions")).unwrap());

        let m = AttrMap::with_backend(config(&dir, 4), fake.clone()).unwrap();
        assert!(m.entries().is_empty());
        assert_eq!(fake.destroyed(), 2);
        assert_eq!(fake.live(), 0);
    }

    #[test]
    fn test_reclaim_before_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeBackend::new();
        let m = AttrMap::with_backend(config(&dir, 1), fake.clone()).unwrap();
        // The crash happens after this map was opened.
        let crashed = exited_map(&dir, &fake);
        std::mem::forget(crashed.acquire(&conf("cycles")).unwrap());

        let h = m.acquire(&conf("instructions")).unwrap();
        assert_eq!(fake.destroyed(), 1);
        assert_eq!(m.entries()[0].key, h.key());
    }

    #[test]
    fn test_backend_failure_releases_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fake) = map(&dir, 4);
        fake.fail_after(0, ErrorKind::Permission);

        let err = m.acquire(&conf("cycles")).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Permission);
        assert!(m.entries().is_empty());
    }

    #[test]
    fn test_cgroup_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let cg = Cgroup::open(cg_dir.path()).unwrap();
        let (m, fake) = map(&dir, 4);

        let mut a = m.acquire(&conf("cycles")).unwrap();
        let mut b = m.acquire(&conf("cycles")).unwrap();
        a.attach_cgroup(&cg).unwrap();
        a.attach_cgroup(&cg).unwrap();
        b.attach_cgroup(&cg).unwrap();
        assert_eq!(fake.created(), 2);
        assert_eq!(m.entries().len(), 2);

        fake.tick(5);
        a.detach_cgroup(cg.id()).unwrap();
        fake.tick(5);

        // b keeps the cgroup attached, so its accumulation carries on.
        assert_eq!(b.read(Scope::Cgroup(cg.id())).unwrap().counter, 10);
        assert_eq!(a.read(Scope::Cgroup(cg.id())).unwrap(), CounterReading::default());

        b.detach_cgroup(cg.id()).unwrap();
        assert_eq!(b.read(Scope::Cgroup(cg.id())).unwrap(), CounterReading::default());
        assert_eq!(fake.live(), 1);
    }

    #[test]
    fn test_release_detaches_cgroups() {
        let dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let cg = Cgroup::open(cg_dir.path()).unwrap();
        let (m, fake) = map(&dir, 4);

        let mut a = m.acquire(&conf("cycles")).unwrap();
        a.attach_cgroup(&cg).unwrap();
        a.release().unwrap();

        assert_eq!(fake.live(), 0);
        assert!(m.entries().is_empty());
    }
}
