//! `perf_event_open(2)`.

use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, RawFd};

use perf_event_open_sys::bindings as sys;
use perf_event_open_sys::perf_event_open;

use crate::event::PerfAttr;

/// Open one counting event on `cpu`, counting from the moment it is opened.
///
/// With `cgroup` set, only tasks in that cgroup are counted; otherwise every
/// task on the CPU is.
pub(crate) fn open_event(attr: &PerfAttr, cgroup: Option<RawFd>, cpu: i32) -> io::Result<File> {
    let mut raw = sys::perf_event_attr {
        size: mem::size_of::<sys::perf_event_attr>() as u32,
        type_: attr.pmu_type,
        config: attr.config,
        read_format: (sys::PERF_FORMAT_TOTAL_TIME_ENABLED | sys::PERF_FORMAT_TOTAL_TIME_RUNNING)
            as u64,
        ..sys::perf_event_attr::default()
    };
    raw.__bindgen_anon_1.sample_period = attr.sample;
    raw.__bindgen_anon_3.config1 = attr.config1;
    raw.__bindgen_anon_4.config2 = attr.config2;
    raw.set_freq(attr.freq as u64);
    raw.set_exclude_user(attr.exclude_user as u64);
    raw.set_exclude_kernel(attr.exclude_kernel as u64);
    raw.set_exclude_hv(attr.exclude_hv as u64);
    raw.set_exclude_idle(attr.exclude_idle as u64);
    raw.set_pinned(attr.pinned as u64);

    let (pid, flags) = match cgroup {
        Some(fd) => (fd, sys::PERF_FLAG_FD_CLOEXEC | sys::PERF_FLAG_PID_CGROUP),
        None => (-1, sys::PERF_FLAG_FD_CLOEXEC),
    };

    let fd = unsafe { perf_event_open(&mut raw, pid, cpu, -1, flags as libc::c_ulong) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fd was just returned by the kernel and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}
