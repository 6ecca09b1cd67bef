use crate::cgroup::CgroupId;

/// `Scope` selects which share of a slot's accumulation a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// `Global` readings cover every process on every CPU counted by the slot.
    Global,

    /// `Cgroup` readings cover only tasks running inside the given cgroup.
    ///
    /// The cgroup must have been [attached] to the group, otherwise reads
    /// return zero.
    ///
    /// [attached]: struct.EventGroup.html#method.add_cgroup
    Cgroup(CgroupId),
}
