//! Kernel-resident counting objects.
//!
//! A backend turns a [`PerfAttr`] into a slot: counters that run from
//! creation, system-wide or in one cgroup, and that stay readable by any
//! process until they are destroyed. The attribute map decides *when* slots
//! are created, attached to and destroyed; backends only carry it out.
//!
//! Slots live in the map's pinned directory under their [`SlotKey`] name, so
//! creating, opening and destroying are all addressed by directory and key
//! rather than by an in-process object.

use std::path::Path;

use memmap2::MmapMut;

use crate::attr_map::SlotKey;
use crate::cgroup::Cgroup;
use crate::error::Error;
use crate::event::PerfAttr;
use crate::reading::CounterReading;

mod perf;
pub use self::perf::{PerfBackend, PerfSlot};

#[cfg(test)]
pub(crate) mod fake;

/// Creates, attaches to and destroys pinned counting slots.
pub trait SlotBackend: Send + Sync + 'static {
    /// This process's view of one slot.
    type Slot: CountingSlot;

    /// Map the attribute map's ledger kept in `dir`, creating it zeroed and
    /// `len` bytes long if it does not exist yet.
    fn ledger(&self, dir: &Path, len: usize) -> Result<MmapMut, Error>;

    /// Start counting `attr`, in `cgroup` only if set, and pin the counters
    /// in `dir` as `key`.
    fn create(
        &self,
        dir: &Path,
        key: &SlotKey,
        attr: &PerfAttr,
        cgroup: Option<&Cgroup>,
    ) -> Result<Self::Slot, Error>;

    /// Attach to counters pinned in `dir` as `key`, by this or another
    /// process.
    fn open(&self, dir: &Path, key: &SlotKey) -> Result<Self::Slot, Error>;

    /// Stop the counters pinned in `dir` as `key` and unpin them.
    fn destroy(&self, dir: &Path, key: &SlotKey) -> Result<(), Error>;
}

/// One slot's counters.
pub trait CountingSlot: Send + Sync + 'static {
    /// Current totals, summed over every CPU.
    fn read(&self) -> Result<CounterReading, Error>;
}
