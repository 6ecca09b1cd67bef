use std::path::Path;

use memmap2::MmapMut;
use tracing::{debug, warn};

use super::{CountingSlot, SlotBackend};
use crate::attr_map::SlotKey;
#[cfg(target_os = "linux")]
use crate::bpf::{ledger_map, EventArray, Reader};
use crate::cgroup::Cgroup;
use crate::counter::{online_cpus, CounterSet};
use crate::error::Error;
use crate::event::PerfAttr;
use crate::reading::CounterReading;
#[cfg(not(target_os = "linux"))]
use crate::stubs::{ledger_map, EventArray, Reader};

const LEDGER_NAME: &str = "ledger";

/// Counts with `perf_event_open(2)`, one event per CPU, and keeps the events
/// in a perf event array pinned in the map's bpffs directory.
///
/// The pinned array holds the events after every descriptor is closed, so a
/// slot outlives the process that created it and other processes attach to
/// the same counters.
#[derive(Debug, Clone)]
pub struct PerfBackend {
    cpus: Vec<i32>,
}

impl PerfBackend {
    /// Count on every online CPU.
    pub fn new() -> Self {
        Self::with_cpus(online_cpus().to_vec())
    }

    /// Count on `cpus` only.
    pub fn with_cpus(cpus: Vec<i32>) -> Self {
        Self { cpus }
    }

    /// The CPUs new slots count on and reads sum over.
    pub fn cpus(&self) -> &[i32] {
        &self.cpus
    }

    fn attach(&self, events: &EventArray) -> Result<PerfSlot, Error> {
        Ok(PerfSlot {
            reader: events.reader()?,
            cpus: self.cpus.clone(),
        })
    }
}

impl Default for PerfBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBackend for PerfBackend {
    type Slot = PerfSlot;

    fn ledger(&self, dir: &Path, len: usize) -> Result<MmapMut, Error> {
        ledger_map(&dir.join(LEDGER_NAME), len)
    }

    fn create(
        &self,
        dir: &Path,
        key: &SlotKey,
        attr: &PerfAttr,
        cgroup: Option<&Cgroup>,
    ) -> Result<PerfSlot, Error> {
        // The descriptors close when `set` drops; the array keeps the events.
        let set = CounterSet::open(attr, cgroup, &self.cpus)?;
        let events = EventArray::create(set.iter())?;
        let slot = self.attach(&events)?;

        let path = dir.join(key.name());
        if path.exists() {
            // No ledger entry refers to it, so it is left over from a lost map.
            warn!(path = %path.display(), "replacing stale pinned counters");
            EventArray::destroy(&path)?;
        }
        events.pin(&path)?;
        debug!(
            path = %path.display(),
            cpus = self.cpus.len(),
            cgroup = ?cgroup.map(|c| c.path()),
            ?attr,
            "pinned counters"
        );
        Ok(slot)
    }

    fn open(&self, dir: &Path, key: &SlotKey) -> Result<PerfSlot, Error> {
        let events = EventArray::open(&dir.join(key.name()))?;
        debug!(%key, "attached to pinned counters");
        self.attach(&events)
    }

    fn destroy(&self, dir: &Path, key: &SlotKey) -> Result<(), Error> {
        EventArray::destroy(&dir.join(key.name()))
    }
}

/// This process's reader of one pinned slot.
#[derive(Debug)]
pub struct PerfSlot {
    reader: Reader,
    cpus: Vec<i32>,
}

impl CountingSlot for PerfSlot {
    fn read(&self) -> Result<CounterReading, Error> {
        self.reader.read(&self.cpus)
    }
}
