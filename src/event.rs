use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;

use crate::error::{Error, ErrorKind};
use crate::reading::CounterReading;

/// One countable event type on one PMU, as published by a [`Catalog`].
///
/// `pmu_type` is the value the kernel expects in `perf_event_attr.type`, which
/// for dynamic PMUs is the number found in
/// `/sys/bus/event_source/devices/<pmu>/type`.
///
/// [`Catalog`]: trait.Catalog.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    /// Name of the event within its PMU, e.g. `cycles`.
    pub id: String,
    /// Name of the PMU publishing the event.
    pub pmu_name: String,
    /// `perf_event_attr.type`.
    pub pmu_type: u32,
    /// `perf_event_attr.config`.
    pub config: u64,
    /// `perf_event_attr.config1`, used by some PMUs for extended encodings.
    pub config1: u64,
    /// `perf_event_attr.config2`.
    pub config2: u64,
    /// One line description for humans.
    pub brief: String,
}

impl EventDef {
    /// A definition with zero `config1` and `config2` and no description.
    pub fn new(
        id: impl Into<String>,
        pmu_name: impl Into<String>,
        pmu_type: u32,
        config: u64,
    ) -> Self {
        Self {
            id: id.into(),
            pmu_name: pmu_name.into(),
            pmu_type,
            config,
            config1: 0,
            config2: 0,
            brief: String::new(),
        }
    }

    /// Set the human readable description.
    pub fn with_brief(self, brief: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            ..self
        }
    }

    /// Set `config1` and `config2`.
    pub fn with_extra_config(self, config1: u64, config2: u64) -> Self {
        Self {
            config1,
            config2,
            ..self
        }
    }
}

/// Modifiers applied on top of an [`EventDef`].
///
/// The default counts in every privilege level with no sampling.
///
/// Slots are read by counting, so a sampling period or frequency only sets
/// how often the kernel takes an overflow interrupt. It is still part of the
/// programmed counter, and two configs that differ in it get separate slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventExtraAttr {
    /// Do not count in user space.
    pub exclude_user: bool,
    /// Do not count in the kernel.
    pub exclude_kernel: bool,
    /// Do not count in the hypervisor.
    pub exclude_hv: bool,
    /// Do not count while the CPU is idle.
    pub exclude_idle: bool,
    /// Keep the event on the PMU at all times, never multiplexing it.
    pub pinned: bool,
    /// Overflow every `n` events.
    pub sample_period: Option<u64>,
    /// Overflow `n` times a second. Conflicts with `sample_period`.
    pub sample_freq: Option<u64>,
}

impl EventExtraAttr {
    /// Count in every privilege level.
    pub fn all() -> Self {
        Self::default()
    }

    /// Count user space only, excluding kernel and hypervisor.
    pub fn user_only() -> Self {
        Self {
            exclude_kernel: true,
            exclude_hv: true,
            ..Self::default()
        }
    }

    /// Count kernel space only.
    pub fn kernel_only() -> Self {
        Self {
            exclude_user: true,
            exclude_hv: true,
            ..Self::default()
        }
    }

    /// Returns an error naming the first conflicting modifier, if any.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_period.is_some() && self.sample_freq.is_some() {
            return Err(Error::with_context(
                ErrorKind::Config,
                "sample_period and sample_freq are mutually exclusive",
            ));
        }
        if self.exclude_user && self.exclude_kernel && self.exclude_hv {
            return Err(Error::with_context(
                ErrorKind::Config,
                "event excludes user, kernel and hypervisor and would never count",
            ));
        }
        Ok(())
    }
}

/// Post-read derivation applied to a raw [`CounterReading`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventValueTransforms {
    /// Multiplier applied last, e.g. to turn a count into bytes.
    pub scale: f64,
    /// Extrapolate over the enabled time when the counter was multiplexed.
    pub multiplex_correction: bool,
}

impl Default for EventValueTransforms {
    fn default() -> Self {
        Self {
            scale: 1.0,
            multiplex_correction: true,
        }
    }
}

impl EventValueTransforms {
    /// The derived value of `reading`.
    pub fn apply(&self, reading: &CounterReading) -> f64 {
        let raw = if self.multiplex_correction {
            reading.scaled()
        } else {
            reading.counter
        };
        raw as f64 * self.scale
    }
}

/// The physical description of a counter, the subset of `perf_event_attr`
/// this crate programs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerfAttr {
    /// `type`: the PMU.
    pub pmu_type: u32,
    /// The event on that PMU.
    pub config: u64,
    /// PMU specific extension of `config`.
    pub config1: u64,
    /// PMU specific extension of `config1`.
    pub config2: u64,
    /// `sample_period`, or `sample_freq` when `freq` is set.
    pub sample: u64,
    /// Whether `sample` is a frequency.
    pub freq: bool,
    /// Do not count user space.
    pub exclude_user: bool,
    /// Do not count the kernel.
    pub exclude_kernel: bool,
    /// Do not count the hypervisor.
    pub exclude_hv: bool,
    /// Do not count while idle.
    pub exclude_idle: bool,
    /// Always keep the event on the PMU.
    pub pinned: bool,
}

impl PerfAttr {
    /// A hash of every programmed field, identical in every process.
    pub fn fingerprint(&self) -> Fingerprint {
        let flags = (self.exclude_user as u8)
            | (self.exclude_kernel as u8) << 1
            | (self.exclude_hv as u8) << 2
            | (self.exclude_idle as u8) << 3
            | (self.pinned as u8) << 4
            | (self.freq as u8) << 5;

        // The ledger is shared between processes, so the hash input is laid
        // out explicitly rather than relying on derived Hash.
        let mut h = FnvHasher::default();
        h.write(&self.pmu_type.to_le_bytes());
        h.write(&self.config.to_le_bytes());
        h.write(&self.config1.to_le_bytes());
        h.write(&self.config2.to_le_bytes());
        h.write(&self.sample.to_le_bytes());
        h.write_u8(flags);
        Fingerprint(h.finish())
    }
}

/// Identifies an [`EventConfig`] for deduplication in the attribute map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A fully resolved event: the definition, its modifiers and how to post
/// process its value.
///
/// Built by [`PmuDevice::make_config`] and immutable afterwards.
///
/// [`PmuDevice::make_config`]: trait.PmuDevice.html#tymethod.make_config
#[derive(Debug, Clone, PartialEq)]
pub struct EventConfig {
    def: Arc<EventDef>,
    extra: EventExtraAttr,
    transforms: EventValueTransforms,
}

impl EventConfig {
    /// Combine a definition with its modifiers, rejecting conflicting flags.
    pub fn new(
        def: Arc<EventDef>,
        extra: EventExtraAttr,
        transforms: EventValueTransforms,
    ) -> Result<Self, Error> {
        extra.validate()?;
        Ok(Self {
            def,
            extra,
            transforms,
        })
    }

    /// The event definition.
    pub fn def(&self) -> &EventDef {
        &self.def
    }

    /// The modifiers.
    pub fn extra_attr(&self) -> &EventExtraAttr {
        &self.extra
    }

    /// How values read for this event are post processed.
    pub fn transforms(&self) -> &EventValueTransforms {
        &self.transforms
    }

    /// The counter this config programs.
    pub fn perf_attr(&self) -> PerfAttr {
        let (sample, freq) = match (self.extra.sample_period, self.extra.sample_freq) {
            (_, Some(hz)) => (hz, true),
            (Some(period), None) => (period, false),
            (None, None) => (0, false),
        };
        PerfAttr {
            pmu_type: self.def.pmu_type,
            config: self.def.config,
            config1: self.def.config1,
            config2: self.def.config2,
            sample,
            freq,
            exclude_user: self.extra.exclude_user,
            exclude_kernel: self.extra.exclude_kernel,
            exclude_hv: self.extra.exclude_hv,
            exclude_idle: self.extra.exclude_idle,
            pinned: self.extra.pinned,
        }
    }

    /// Transforms do not take part: two configs that program the same
    /// counter share one slot.
    pub fn fingerprint(&self) -> Fingerprint {
        self.perf_attr().fingerprint()
    }
}

impl fmt::Display for EventConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.def.pmu_name, self.def.id)?;
        if self.extra.exclude_kernel && !self.extra.exclude_user {
            write!(f, ":u")?;
        } else if self.extra.exclude_user && !self.extra.exclude_kernel {
            write!(f, ":k")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycles() -> Arc<EventDef> {
        Arc::new(EventDef::new("cycles", "generic_hardware", 0, 0))
    }

    #[test]
    fn test_identical_configs_share_fingerprint() {
        let a = EventConfig::new(cycles(), EventExtraAttr::default(), Default::default())
            .unwrap();
        let b = EventConfig::new(
            cycles(),
            EventExtraAttr::default(),
            EventValueTransforms {
                scale: 2.0,
                multiplex_correction: false,
            },
        )
        .unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_modifiers_change_fingerprint() {
        let all = EventConfig::new(cycles(), EventExtraAttr::all(), Default::default()).unwrap();
        let user = EventConfig::new(cycles(), EventExtraAttr::user_only(), Default::default())
            .unwrap();
        let instr = EventConfig::new(
            Arc::new(EventDef::new("instructions", "generic_hardware", 0, 1)),
            EventExtraAttr::all(),
            Default::default(),
        )
        .unwrap();

        assert_ne!(all.fingerprint(), user.fingerprint());
        assert_ne!(all.fingerprint(), instr.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        // Every process sharing a map must derive these exact values.
        assert_eq!(PerfAttr::default().fingerprint(), Fingerprint(0x26de9286e55e50cf));

        let user = EventExtraAttr::user_only();
        let user_cycles = EventConfig::new(cycles(), user, Default::default()).unwrap();
        assert_eq!(user_cycles.fingerprint(), Fingerprint(0x26de9086e55e4d69));
    }

    #[test]
    fn test_sampling_is_programmed() {
        let period = EventExtraAttr {
            sample_period: Some(1000),
            ..Default::default()
        };
        let freq = EventExtraAttr {
            sample_freq: Some(1000),
            ..Default::default()
        };
        let period = EventConfig::new(cycles(), period, Default::default()).unwrap();
        let freq = EventConfig::new(cycles(), freq, Default::default()).unwrap();
        let plain = EventConfig::new(cycles(), EventExtraAttr::default(), Default::default())
            .unwrap();

        assert_eq!(period.perf_attr().sample, 1000);
        assert!(!period.perf_attr().freq);
        assert_eq!(freq.perf_attr().sample, 1000);
        assert!(freq.perf_attr().freq);

        assert_ne!(period.fingerprint(), freq.fingerprint());
        assert_ne!(period.fingerprint(), plain.fingerprint());
    }

    #[test]
    fn test_conflicting_sampling() {
        let extra = EventExtraAttr {
            sample_period: Some(1000),
            sample_freq: Some(99),
            ..Default::default()
        };
        let err = EventConfig::new(cycles(), extra, Default::default()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Config);
    }

    #[test]
    fn test_excludes_everything() {
        let extra = EventExtraAttr {
            exclude_user: true,
            exclude_kernel: true,
            exclude_hv: true,
            ..Default::default()
        };
        let err = EventConfig::new(cycles(), extra, Default::default()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Config);
    }

    #[test]
    fn test_transforms() {
        let r = CounterReading {
            counter: 10,
            enabled: 100,
            running: 50,
        };

        assert_eq!(EventValueTransforms::default().apply(&r), 20.0);
        let raw = EventValueTransforms {
            scale: 0.5,
            multiplex_correction: false,
        };
        assert_eq!(raw.apply(&r), 5.0);
    }

    #[test]
    fn test_display() {
        let c = EventConfig::new(cycles(), EventExtraAttr::user_only(), Default::default())
            .unwrap();
        assert_eq!(c.to_string(), "generic_hardware/cycles:u");
    }
}
