//! `bperf` counts hardware and software performance events in groups that
//! share their underlying counters.
//!
//! Programming a PMU is expensive and the number of physical counters is
//! small. When several tools ask for the same event (say, `cycles` counted in
//! user mode) they should not each get their own counter. `bperf` keeps one
//! counting slot per distinct event configuration in an [`AttrMap`] pinned at
//! a well-known bpffs path (by default `/sys/fs/bpf/bperf_attr_map_v1`),
//! reference counted across every [`EventGroup`] and every process using the
//! same map.
//!
//! A slot's counters live in a pinned BPF perf event array, so they keep
//! running after the process that started them exits, for as long as any
//! group anywhere holds the slot. References left by processes that died
//! without releasing them are reclaimed.
//!
//! Every slot counts system-wide on all online CPUs. A group can additionally
//! attach [cgroups](struct.Cgroup.html) and read per-cgroup totals alongside
//! the global ones.
//!
//! Disabling a group freezes what that group reads, even while other groups
//! keep the shared counter running:
//!
//! ```no_run
//! use bperf::*;
//!
//! let catalog = GenericCatalog::new();
//! let metric = MetricDesc {
//!     id: "ipc".to_string(),
//!     brief: "Instructions per cycle".to_string(),
//!     description: String::new(),
//!     event_refs: vec![
//!         EventRef::new("inst", PmuType::GenericHardware, "instructions"),
//!         EventRef::new("cycles", PmuType::GenericHardware, "cycles"),
//!     ],
//! };
//!
//! let map = AttrMap::open(AttrMapConfig::from_env()?)?;
//! let mut group = EventGroup::from_metric("ipc", &metric, &catalog, map)?;
//! group.open()?;
//! group.enable()?;
//!
//! // ... do some work ...
//!
//! group.disable()?;
//! let values = group.read_global_vec();
//! println!("ipc: {:.2}", values[0].scaled() as f64 / values[1].scaled() as f64);
//! #
//! # Ok::<(), bperf::error::Error>(())
//! ```
//!
//! Counters are opened with [`perf_event_open(2)`] and shared through
//! [`bpf(2)`]. Both need `CAP_PERFMON` and `CAP_BPF` (or root), and the pin
//! directory must be on a mounted bpffs.
//!
//! [`perf_event_open(2)`]: https://man7.org/linux/man-pages/man2/perf_event_open.2.html
//! [`bpf(2)`]: https://man7.org/linux/man-pages/man2/bpf.2.html

#![warn(missing_docs)]

pub mod error;

mod scope;
pub use self::scope::Scope;

mod reading;
pub use self::reading::CounterReading;

mod event;
pub use self::event::{
    EventConfig, EventDef, EventExtraAttr, EventValueTransforms, Fingerprint, PerfAttr,
};

mod catalog;
pub use self::catalog::{
    Catalog, EventRef, GenericCatalog, MetricDesc, PmuDevice, PmuType, StaticPmu,
};

mod cgroup;
pub use self::cgroup::{Cgroup, CgroupId};

#[cfg(target_os = "linux")]
mod bpf;
#[cfg(target_os = "linux")]
mod sys;
#[cfg(not(target_os = "linux"))]
mod stubs;

mod counter;
pub use self::counter::online_cpus;

pub mod backend;

pub mod attr_map;
pub use self::attr_map::{AttrMap, SlotHandle, SlotKey};

mod config;
pub use self::config::{
    AttrMapConfig, CAPACITY_ENV, DEFAULT_CAPACITY, DEFAULT_PIN_DIR, PIN_DIR_ENV,
};

mod group;
pub use self::group::{EventGroup, State};

/// The most events a single [`EventGroup`] may hold.
pub const MAX_GROUP_SIZE: usize = 8;
