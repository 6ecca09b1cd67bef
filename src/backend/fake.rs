//! An in-memory backend whose counters only move when told to.
//!
//! Slots are kept per pin directory and key, like pinned kernel objects, so
//! several maps sharing one directory and one `FakeBackend` see the same
//! counters the way several processes would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::MmapMut;

use super::{CountingSlot, SlotBackend};
use crate::attr_map::ledger::map_file;
use crate::attr_map::SlotKey;
use crate::cgroup::Cgroup;
use crate::error::{new_error, Error, ErrorKind};
use crate::event::PerfAttr;
use crate::reading::CounterReading;

// Allows `budget` more calls, then fails with `kind`.
#[derive(Debug, Clone, Copy)]
struct Budget {
    budget: usize,
    kind: ErrorKind,
}

impl Budget {
    fn spend(slot: &mut Option<Budget>) -> Result<(), Error> {
        match slot {
            Some(b) if b.budget == 0 => Err(new_error(b.kind)),
            Some(b) => {
                b.budget -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<(PathBuf, SlotKey), CounterReading>,
    created: usize,
    opened: usize,
    destroyed: usize,
    create: Option<Budget>,
    attach: Option<Budget>,
    fail_read: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Advance every live slot by `n`.
    pub(crate) fn tick(&self, n: u64) {
        let delta = CounterReading {
            counter: n,
            enabled: n,
            running: n,
        };
        for c in self.lock().objects.values_mut() {
            *c += delta;
        }
    }

    /// Allow `n` more system-wide slots to be created, then fail with `kind`.
    pub(crate) fn fail_after(&self, n: usize, kind: ErrorKind) {
        self.lock().create = Some(Budget { budget: n, kind });
    }

    /// Allow `n` more cgroup slots to be created, then fail with `kind`.
    pub(crate) fn fail_attach_after(&self, n: usize, kind: ErrorKind) {
        self.lock().attach = Some(Budget { budget: n, kind });
    }

    pub(crate) fn fail_read(&self, kind: Option<ErrorKind>) {
        self.lock().fail_read = kind;
    }

    pub(crate) fn live(&self) -> usize {
        self.lock().objects.len()
    }

    pub(crate) fn created(&self) -> usize {
        self.lock().created
    }

    pub(crate) fn opened(&self) -> usize {
        self.lock().opened
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.lock().destroyed
    }
}

impl SlotBackend for FakeBackend {
    type Slot = FakeSlot;

    fn ledger(&self, dir: &Path, len: usize) -> Result<MmapMut, Error> {
        map_file(&dir.join("ledger"), len)
    }

    fn create(
        &self,
        dir: &Path,
        key: &SlotKey,
        _attr: &PerfAttr,
        cgroup: Option<&Cgroup>,
    ) -> Result<FakeSlot, Error> {
        let mut state = self.lock();
        match cgroup {
            Some(cgroup) => {
                assert_eq!(key.cgroup, Some(cgroup.id()));
                Budget::spend(&mut state.attach)?;
            }
            None => Budget::spend(&mut state.create)?,
        }

        let id = (dir.to_path_buf(), *key);
        assert!(!state.objects.contains_key(&id), "{} created twice", key);
        state.objects.insert(id.clone(), CounterReading::default());
        state.created += 1;

        Ok(FakeSlot {
            id,
            backend: self.clone(),
        })
    }

    fn open(&self, dir: &Path, key: &SlotKey) -> Result<FakeSlot, Error> {
        let mut state = self.lock();
        let id = (dir.to_path_buf(), *key);
        if !state.objects.contains_key(&id) {
            return Err(new_error(ErrorKind::Config));
        }
        state.opened += 1;

        Ok(FakeSlot {
            id,
            backend: self.clone(),
        })
    }

    fn destroy(&self, dir: &Path, key: &SlotKey) -> Result<(), Error> {
        let mut state = self.lock();
        match state.objects.remove(&(dir.to_path_buf(), *key)) {
            Some(_) => {
                state.destroyed += 1;
                Ok(())
            }
            None => Err(new_error(ErrorKind::Config)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FakeSlot {
    id: (PathBuf, SlotKey),
    backend: FakeBackend,
}

impl CountingSlot for FakeSlot {
    fn read(&self) -> Result<CounterReading, Error> {
        let state = self.backend.lock();
        if let Some(kind) = state.fail_read {
            return Err(new_error(kind));
        }
        state
            .objects
            .get(&self.id)
            .copied()
            .ok_or_else(|| new_error(ErrorKind::State))
    }
}
