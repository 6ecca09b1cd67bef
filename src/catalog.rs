//! Event resolution.
//!
//! The catalog of PMUs and their events is owned by the caller and injected
//! through the [`Catalog`] and [`PmuDevice`] traits. [`GenericCatalog`]
//! covers the kernel's generic hardware and software events, which exist on
//! every CPU that supports perf at all.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::event::{EventConfig, EventDef, EventExtraAttr, EventValueTransforms};

/// Looks up PMUs and event definitions by name.
pub trait Catalog {
    /// The PMU called `name`, e.g. `generic_hardware` or `cpu`.
    fn find_device_by_name(&self, name: &str) -> Option<Arc<dyn PmuDevice>>;

    /// The first event called `name` on any PMU.
    fn find_event_def(&self, name: &str) -> Option<Arc<EventDef>>;
}

/// A PMU able to turn one of its event ids into an [`EventConfig`].
pub trait PmuDevice: Send + Sync {
    /// The PMU's name, as matched by [`Catalog::find_device_by_name`].
    ///
    /// [`Catalog::find_device_by_name`]: trait.Catalog.html#tymethod.find_device_by_name
    fn name(&self) -> &str;

    /// Resolve `event_id` on this PMU.
    ///
    /// Fails with [`ErrorKind::Config`] if the event does not exist on this
    /// device or if `extra_attr` is self-contradictory.
    ///
    /// [`ErrorKind::Config`]: ../error/enum.ErrorKind.html#variant.Config
    fn make_config(
        &self,
        event_id: &str,
        extra_attr: EventExtraAttr,
        transforms: EventValueTransforms,
    ) -> Result<EventConfig, Error>;
}

/// PMU families understood by [`EventRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuType {
    /// `PERF_TYPE_HARDWARE`: cycles, instructions, cache and branch events.
    GenericHardware,
    /// `PERF_TYPE_SOFTWARE`: kernel maintained counters such as task clock.
    GenericSoftware,
}

impl PmuType {
    /// The PMU name the generic catalog publishes this family under.
    pub fn name(&self) -> &'static str {
        match self {
            PmuType::GenericHardware => "generic_hardware",
            PmuType::GenericSoftware => "generic_software",
        }
    }

    /// The `perf_event_attr.type` value for this PMU.
    pub fn perf_type(&self) -> u32 {
        match self {
            PmuType::GenericHardware => 0, // PERF_TYPE_HARDWARE
            PmuType::GenericSoftware => 1, // PERF_TYPE_SOFTWARE
        }
    }
}

impl fmt::Display for PmuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event within a [`MetricDesc`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventRef {
    /// Name of the event within the metric, e.g. `inst`.
    pub nickname: String,
    /// PMU to resolve `event_id` on.
    pub pmu: PmuType,
    /// Event name or alias on `pmu`.
    pub event_id: String,
    /// Modifiers applied to the resolved event.
    pub extra_attr: EventExtraAttr,
    /// Post processing applied to its readings.
    pub transforms: EventValueTransforms,
}

impl EventRef {
    /// Reference `event_id` on `pmu` with default modifiers and transforms.
    pub fn new(nickname: impl Into<String>, pmu: PmuType, event_id: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            pmu,
            event_id: event_id.into(),
            extra_attr: EventExtraAttr::default(),
            transforms: EventValueTransforms::default(),
        }
    }

    /// Replace the modifiers.
    pub fn with_extra_attr(self, extra_attr: EventExtraAttr) -> Self {
        Self { extra_attr, ..self }
    }
}

/// A named metric: the set of events that must be counted together to
/// compute it.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    /// Short identifier, e.g. `ipc`.
    pub id: String,
    /// One line description.
    pub brief: String,
    /// Longer description, possibly empty.
    pub description: String,
    /// The events, in the order groups built from this metric report them.
    pub event_refs: Vec<EventRef>,
}

impl MetricDesc {
    /// Resolve every event reference against `catalog`.
    ///
    /// Either every reference resolves or an error naming the first one that
    /// did not is returned.
    pub fn resolve(&self, catalog: &dyn Catalog) -> Result<Vec<EventConfig>, Error> {
        self.event_refs
            .iter()
            .map(|r| {
                let pmu = catalog.find_device_by_name(r.pmu.name()).ok_or_else(|| {
                    Error::with_context(
                        ErrorKind::Config,
                        format!("metric {}: no PMU named {}", self.id, r.pmu),
                    )
                })?;
                pmu.make_config(&r.event_id, r.extra_attr, r.transforms)
                    .map_err(|e| {
                        let msg = format!(
                            "metric {}: event {} ({}): {}",
                            self.id, r.nickname, r.event_id, e
                        );
                        Error::with_context(*e.kind(), msg)
                    })
            })
            .collect()
    }
}

/// A PMU backed by a fixed table of definitions.
#[derive(Debug)]
pub struct StaticPmu {
    name: String,
    events: HashMap<String, Arc<EventDef>>,
}

impl StaticPmu {
    /// An empty PMU called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: HashMap::new(),
        }
    }

    /// Register `def` under its own id and each of `aliases`.
    pub fn add(&mut self, def: EventDef, aliases: &[&str]) {
        let def = Arc::new(def);
        for alias in aliases {
            self.events.insert(alias.to_string(), Arc::clone(&def));
        }
        self.events.insert(def.id.clone(), def);
    }

    /// The definition registered as `event_id`.
    pub fn get(&self, event_id: &str) -> Option<&Arc<EventDef>> {
        self.events.get(event_id)
    }
}

impl PmuDevice for StaticPmu {
    fn name(&self) -> &str {
        &self.name
    }

    fn make_config(
        &self,
        event_id: &str,
        extra_attr: EventExtraAttr,
        transforms: EventValueTransforms,
    ) -> Result<EventConfig, Error> {
        let def = self.events.get(event_id).ok_or_else(|| {
            Error::with_context(
                ErrorKind::Config,
                format!("event {} not found on {}", event_id, self.name),
            )
        })?;
        EventConfig::new(Arc::clone(def), extra_attr, transforms)
    }
}

/// The kernel's generic events, available wherever perf is.
pub struct GenericCatalog {
    devices: Vec<Arc<StaticPmu>>,
}

impl Default for GenericCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericCatalog {
    /// The generic hardware and software PMUs with their common aliases.
    pub fn new() -> Self {
        let hw = PmuType::GenericHardware;
        let mut hardware = StaticPmu::new(hw.name());
        let hw_events: &[(&str, u64, &[&str], &str)] = &[
            ("cycles", 0, &["cpu_cycles"], "CPU cycles"),
            ("instructions", 1, &["retired_instructions"], "Retired instructions"),
            ("cache_references", 2, &[], "Last level cache accesses"),
            ("cache_misses", 3, &[], "Last level cache misses"),
            ("branch_instructions", 4, &["branches"], "Retired branch instructions"),
            ("branch_misses", 5, &[], "Mispredicted branch instructions"),
            ("bus_cycles", 6, &[], "Bus cycles"),
            ("stalled_cycles_frontend", 7, &[], "Cycles stalled in the frontend"),
            ("stalled_cycles_backend", 8, &[], "Cycles stalled in the backend"),
            ("ref_cycles", 9, &["ref_cpu_cycles"], "Cycles unaffected by frequency scaling"),
        ];
        for (id, config, aliases, brief) in hw_events {
            hardware.add(
                EventDef::new(*id, hw.name(), hw.perf_type(), *config).with_brief(*brief),
                aliases,
            );
        }

        let sw = PmuType::GenericSoftware;
        let mut software = StaticPmu::new(sw.name());
        let sw_events: &[(&str, u64, &[&str], &str)] = &[
            ("cpu_clock", 0, &[], "High resolution per-CPU timer"),
            ("task_clock", 1, &[], "Clock count specific to the task that is running"),
            ("page_faults", 2, &["faults"], "Page faults"),
            ("context_switches", 3, &["cs"], "Context switches"),
            ("cpu_migrations", 4, &["migrations"], "Migrations between CPUs"),
        ];
        for (id, config, aliases, brief) in sw_events {
            software.add(
                EventDef::new(*id, sw.name(), sw.perf_type(), *config).with_brief(*brief),
                aliases,
            );
        }

        Self {
            devices: vec![Arc::new(hardware), Arc::new(software)],
        }
    }
}

impl Catalog for GenericCatalog {
    fn find_device_by_name(&self, name: &str) -> Option<Arc<dyn PmuDevice>> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .map(|d| Arc::clone(d) as Arc<dyn PmuDevice>)
    }

    fn find_event_def(&self, name: &str) -> Option<Arc<EventDef>> {
        self.devices.iter().find_map(|d| d.get(name).cloned())
    }
}
