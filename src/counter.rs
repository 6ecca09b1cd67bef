use std::fs::{self, File};
use std::os::unix::io::AsRawFd;

use lazy_static::lazy_static;
use tracing::warn;

#[cfg(not(target_os = "linux"))]
use crate::stubs::open_event;
#[cfg(target_os = "linux")]
use crate::sys::open_event;

use crate::cgroup::Cgroup;
use crate::error::{Error, ErrorKind};
use crate::event::PerfAttr;

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

lazy_static! {
    static ref ONLINE_CPUS: Vec<i32> = match fs::read_to_string(ONLINE_CPUS_PATH) {
        Ok(list) => parse_cpu_list(&list).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, path = ONLINE_CPUS_PATH, "cannot read online cpus");
            vec![]
        }
    };
}

/// The CPUs currently online, read once per process.
pub fn online_cpus() -> &'static [i32] {
    &ONLINE_CPUS
}

/// Parse a kernel cpu list such as `0-3,8,10-11`.
pub(crate) fn parse_cpu_list(list: &str) -> Option<Vec<i32>> {
    let mut cpus = vec![];
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: i32 = lo.parse().ok()?;
                let hi: i32 = hi.parse().ok()?;
                if hi < lo {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    Some(cpus)
}

/// One counting event per CPU, all sharing the same attributes and target,
/// counting from the moment they are opened.
///
/// Dropping the set closes the descriptors. The kernel frees the counters
/// once nothing else, such as a pinned perf event array, refers to them.
#[derive(Debug)]
pub(crate) struct CounterSet {
    events: Vec<(i32, File)>,
}

impl CounterSet {
    /// Open `attr` on each of `cpus`, counting everything or, with `cgroup`
    /// set, only tasks in that cgroup.
    ///
    /// Either every CPU is opened or none is.
    pub(crate) fn open(
        attr: &PerfAttr,
        cgroup: Option<&Cgroup>,
        cpus: &[i32],
    ) -> Result<Self, Error> {
        if cpus.is_empty() {
            return Err(Error::with_context(
                ErrorKind::Unsupported,
                "no online cpus to count on",
            ));
        }

        let cgroup_fd = cgroup.map(|c| c.as_raw_fd());
        let events = cpus
            .iter()
            .map(|&cpu| Ok((cpu, open_event(attr, cgroup_fd, cpu)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { events })
    }

    /// Each CPU with its event.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (i32, &File)> + '_ {
        self.events.iter().map(|(cpu, file)| (*cpu, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0\n"), Some(vec![0]));
        assert_eq!(parse_cpu_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpu_list("0-1,4,6-7\n"), Some(vec![0, 1, 4, 6, 7]));
        assert_eq!(parse_cpu_list(""), Some(vec![]));
    }

    #[test]
    fn test_parse_cpu_list_invalid() {
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a"), None);
        assert_eq!(parse_cpu_list("0-"), None);
    }

    #[test]
    fn test_empty_cpu_set() {
        let attr = PerfAttr {
            pmu_type: 1,
            ..Default::default()
        };
        let err = CounterSet::open(&attr, None, &[]).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
    }
}
