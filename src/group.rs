use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::attr_map::{AttrMap, SlotHandle};
use crate::backend::{PerfBackend, SlotBackend};
use crate::catalog::{Catalog, MetricDesc};
use crate::cgroup::{Cgroup, CgroupId};
use crate::config::AttrMapConfig;
use crate::error::{new_error, Error, ErrorKind};
use crate::event::EventConfig;
use crate::reading::CounterReading;
use crate::scope::Scope;
use crate::MAX_GROUP_SIZE;

/// Lifecycle of an [`EventGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Built, holding no slots.
    Unopened,
    /// Holding its slots. Reads follow the live counters.
    Opened,
    /// Reads follow the live counters.
    Enabled,
    /// Reads return what was seen when the group was disabled.
    Disabled,
    /// Released. A closed group cannot be reopened.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unopened => "unopened",
            State::Opened => "opened",
            State::Enabled => "enabled",
            State::Disabled => "disabled",
            State::Closed => "closed",
        };
        f.write_str(s)
    }
}

// Readings as of the last disable().
#[derive(Debug, Default)]
struct Frozen {
    global: Vec<CounterReading>,
    cgroups: HashMap<CgroupId, Vec<CounterReading>>,
}

/// A bounded, ordered set of events counted together, backed by shared slots
/// in an [`AttrMap`].
///
/// Any number of groups, in this or other processes, may request the same
/// event: they all read the same slot, and the hardware is programmed once.
///
/// ```no_run
/// use std::{sync::Arc, thread, time::Duration};
/// use bperf::*;
///
/// let catalog = GenericCatalog::new();
/// let pmu = catalog.find_device_by_name("generic_hardware").unwrap();
/// let cycles = pmu.make_config("cycles", EventExtraAttr::default(), Default::default())?;
///
/// let map = AttrMap::open(AttrMapConfig::default())?;
/// let mut group = EventGroup::new("cycles", vec![cycles], map)?;
/// group.open()?;
/// group.enable()?;
///
/// thread::sleep(Duration::from_millis(100));
///
/// let mut buf = [CounterReading::default(); MAX_GROUP_SIZE];
/// let n = group.read_global(&mut buf);
/// println!("cycles: {}", buf[..n][0].counter);
/// #
/// # Ok::<(), bperf::error::Error>(())
/// ```
pub struct EventGroup<B: SlotBackend = PerfBackend> {
    name: String,
    configs: Vec<EventConfig>,
    attr_map: Arc<AttrMap<B>>,
    state: State,
    slots: Vec<SlotHandle<B>>,
    cgroups: Vec<CgroupId>,
    frozen: Option<Frozen>,
}

impl EventGroup<PerfBackend> {
    /// The default pinned path of the attribute map, for diagnostics.
    pub fn attr_map_path() -> PathBuf {
        AttrMapConfig::default().path()
    }
}

impl<B: SlotBackend> EventGroup<B> {
    /// Build an unopened group counting `configs`, in order.
    ///
    /// Fails if `configs` is empty or holds more than [`MAX_GROUP_SIZE`]
    /// entries.
    ///
    /// [`MAX_GROUP_SIZE`]: constant.MAX_GROUP_SIZE.html
    pub fn new(
        name: impl Into<String>,
        configs: Vec<EventConfig>,
        attr_map: Arc<AttrMap<B>>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if configs.is_empty() {
            return Err(Error::with_context(
                ErrorKind::Config,
                format!("group {} has no events", name),
            ));
        }
        if configs.len() > MAX_GROUP_SIZE {
            return Err(Error::with_context(
                ErrorKind::TooManyEvents,
                format!(
                    "group {} has {} events, at most {} allowed",
                    name,
                    configs.len(),
                    MAX_GROUP_SIZE
                ),
            ));
        }

        Ok(Self {
            name,
            configs,
            attr_map,
            state: State::Unopened,
            slots: vec![],
            cgroups: vec![],
            frozen: None,
        })
    }

    /// Build a group from a metric description, resolving every event through
    /// `catalog`.
    ///
    /// Nothing is built unless every event resolves.
    pub fn from_metric(
        name: impl Into<String>,
        metric: &MetricDesc,
        catalog: &dyn Catalog,
        attr_map: Arc<AttrMap<B>>,
    ) -> Result<Self, Error> {
        let configs = metric.resolve(catalog)?;
        Self::new(name, configs, attr_map)
    }

    /// The group's name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the group is in its lifecycle.
    pub fn state(&self) -> State {
        self.state
    }

    /// The group's events, in read order.
    pub fn configs(&self) -> &[EventConfig] {
        &self.configs
    }

    /// The number of events.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Always false for a built group.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Cgroups attached through this group.
    pub fn cgroups(&self) -> &[CgroupId] {
        &self.cgroups
    }

    /// True while the group holds its slots.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Opened | State::Enabled | State::Disabled)
    }

    /// Acquire a shared slot for every event.
    ///
    /// Either every slot is acquired or, on error, none is held and the group
    /// stays unopened. Opening an open group does nothing.
    pub fn open(&mut self) -> Result<(), Error> {
        match self.state {
            State::Unopened => {}
            State::Closed => return Err(new_error(ErrorKind::State)),
            _ => return Ok(()),
        }

        // Handles acquired before a failure are dropped here, which releases
        // them.
        let slots = self
            .configs
            .iter()
            .map(|c| self.attr_map.acquire(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!(group = %self.name, error = %e, "failed to open group");
                e
            })?;

        self.slots = slots;
        self.state = State::Opened;
        info!(group = %self.name, events = self.slots.len(), "opened group");
        Ok(())
    }

    /// Start counting. Does nothing when already enabled.
    ///
    /// Every slot counts from the moment it is created, for as long as any
    /// group holds it, so enabling only makes reads follow the live counters
    /// again. Each slot is read once first; on error the group keeps its
    /// previous state.
    pub fn enable(&mut self) -> Result<(), Error> {
        match self.state {
            State::Unopened | State::Closed => return Err(new_error(ErrorKind::NotOpen)),
            State::Enabled => return Ok(()),
            State::Opened | State::Disabled => {}
        }

        let scopes = [Scope::Global]
            .into_iter()
            .chain(self.cgroups.iter().map(|&id| Scope::Cgroup(id)));
        for scope in scopes {
            for (slot, config) in self.slots.iter().zip(&self.configs) {
                if let Err(e) = slot.read(scope) {
                    warn!(
                        group = %self.name,
                        event = %config,
                        ?scope,
                        error = %e,
                        "failed to enable"
                    );
                    return Err(e);
                }
            }
        }

        self.frozen = None;
        self.state = State::Enabled;
        debug!(group = %self.name, "enabled group");
        Ok(())
    }

    /// Stop counting through this group. Does nothing unless enabled.
    ///
    /// The shared counters keep running for other groups, but reads through
    /// this group return the values seen at this call until [`enable`] runs
    /// again.
    ///
    /// [`enable`]: #method.enable
    pub fn disable(&mut self) -> Result<(), Error> {
        match self.state {
            State::Unopened | State::Closed => return Err(new_error(ErrorKind::NotOpen)),
            State::Opened | State::Disabled => return Ok(()),
            State::Enabled => {}
        }

        let mut frozen = Frozen {
            global: self.read_live(Scope::Global),
            cgroups: HashMap::new(),
        };
        for &id in &self.cgroups {
            frozen.cgroups.insert(id, self.read_live(Scope::Cgroup(id)));
        }
        self.frozen = Some(frozen);
        self.state = State::Disabled;
        debug!(group = %self.name, "disabled group");
        Ok(())
    }

    /// Account `cgroup` separately in every slot of this group.
    ///
    /// Attaching an already attached cgroup does nothing.
    pub fn add_cgroup(&mut self, cgroup: &Cgroup) -> Result<(), Error> {
        if !self.is_open() {
            return Err(new_error(ErrorKind::NotOpen));
        }
        let id = cgroup.id();
        if self.cgroups.contains(&id) {
            return Ok(());
        }

        for i in 0..self.slots.len() {
            if let Err(e) = self.slots[i].attach_cgroup(cgroup) {
                warn!(group = %self.name, cgroup = %id, error = %e, "failed to attach cgroup");
                for slot in &mut self.slots[..i] {
                    if let Err(e) = slot.detach_cgroup(id) {
                        warn!(
                            group = %self.name,
                            cgroup = %id,
                            error = %e,
                            "failed to roll back attach"
                        );
                    }
                }
                return Err(e);
            }
        }
        self.cgroups.push(id);

        if self.frozen.is_some() {
            let values = self.read_live(Scope::Cgroup(id));
            if let Some(frozen) = self.frozen.as_mut() {
                frozen.cgroups.insert(id, values);
            }
        }

        info!(
            group = %self.name,
            cgroup = %id,
            path = %cgroup.path().display(),
            "attached cgroup"
        );
        Ok(())
    }

    /// Stop accounting `id` through this group.
    pub fn remove_cgroup(&mut self, id: CgroupId) -> Result<(), Error> {
        if !self.is_open() {
            return Err(new_error(ErrorKind::NotOpen));
        }
        let pos = match self.cgroups.iter().position(|c| *c == id) {
            Some(pos) => pos,
            None => return Ok(()),
        };

        let mut result = Ok(());
        for slot in &mut self.slots {
            if let Err(e) = slot.detach_cgroup(id) {
                result = result.and(Err(e));
            }
        }
        self.cgroups.remove(pos);
        if let Some(frozen) = self.frozen.as_mut() {
            frozen.cgroups.remove(&id);
        }
        result
    }

    /// Write one system-wide reading per event, in group order, and return how
    /// many were written.
    ///
    /// Returns 0 if the group is not open.
    pub fn read_global(&self, buf: &mut [CounterReading]) -> usize {
        self.read(Scope::Global, buf)
    }

    /// Like [`read_global`], scoped to one cgroup. A cgroup not attached to
    /// this group reads as zero.
    ///
    /// [`read_global`]: #method.read_global
    pub fn read_cgroup(&self, buf: &mut [CounterReading], id: CgroupId) -> usize {
        self.read(Scope::Cgroup(id), buf)
    }

    /// [`read_global`] into a new vector.
    ///
    /// [`read_global`]: #method.read_global
    pub fn read_global_vec(&self) -> Vec<CounterReading> {
        let mut buf = vec![CounterReading::default(); self.slots.len()];
        let n = self.read_global(&mut buf);
        buf.truncate(n);
        buf
    }

    /// [`read_cgroup`] into a new vector.
    ///
    /// [`read_cgroup`]: #method.read_cgroup
    pub fn read_cgroup_vec(&self, id: CgroupId) -> Vec<CounterReading> {
        let mut buf = vec![CounterReading::default(); self.slots.len()];
        let n = self.read_cgroup(&mut buf, id);
        buf.truncate(n);
        buf
    }

    fn read(&self, scope: Scope, buf: &mut [CounterReading]) -> usize {
        if !self.is_open() {
            return 0;
        }

        let n = buf.len().min(self.slots.len());
        if let Scope::Cgroup(id) = scope {
            if !self.cgroups.contains(&id) {
                buf[..n].fill(CounterReading::default());
                return n;
            }
        }

        if let Some(frozen) = &self.frozen {
            let values = match scope {
                Scope::Global => Some(&frozen.global),
                Scope::Cgroup(id) => frozen.cgroups.get(&id),
            };
            let values = values.map(Vec::as_slice).unwrap_or(&[]);
            let n = n.min(values.len());
            buf[..n].copy_from_slice(&values[..n]);
            return n;
        }

        self.read_into(scope, &mut buf[..n])
    }

    fn read_into(&self, scope: Scope, buf: &mut [CounterReading]) -> usize {
        for (i, (slot, out)) in self.slots.iter().zip(buf.iter_mut()).enumerate() {
            match slot.read(scope) {
                Ok(r) => *out = r,
                Err(e) => {
                    warn!(
                        group = %self.name,
                        event = %self.configs[i],
                        ?scope,
                        error = %e,
                        "read failed"
                    );
                    return i;
                }
            }
        }
        buf.len().min(self.slots.len())
    }

    fn read_live(&self, scope: Scope) -> Vec<CounterReading> {
        let mut buf = vec![CounterReading::default(); self.slots.len()];
        let n = self.read_into(scope, &mut buf);
        buf.truncate(n);
        buf
    }

    /// Release every slot. Closing twice does nothing; dropping the group
    /// closes it.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }

        for slot in self.slots.drain(..) {
            if let Err(e) = slot.release() {
                warn!(group = %self.name, error = %e, "failed to release slot");
            }
        }
        self.cgroups.clear();
        self.frozen = None;
        self.state = State::Closed;
        debug!(group = %self.name, "closed group");
    }
}

impl<B: SlotBackend> Drop for EventGroup<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: SlotBackend> fmt::Debug for EventGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGroup")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("configs", &self.configs)
            .field("cgroups", &self.cgroups)
            .finish()
    }
}
