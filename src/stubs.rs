#![allow(dead_code)]

use std::fs::File;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::Error;
use crate::event::PerfAttr;
use crate::reading::CounterReading;

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOSYS)
}

pub(crate) fn open_event(_attr: &PerfAttr, _cgroup: Option<RawFd>, _cpu: i32) -> io::Result<File> {
    Err(unsupported())
}

pub(crate) fn possible_cpus() -> Result<usize, Error> {
    Err(unsupported().into())
}

pub(crate) fn ledger_map(_path: &Path, _len: usize) -> Result<MmapMut, Error> {
    Err(unsupported().into())
}

#[derive(Debug)]
pub(crate) struct EventArray;

impl EventArray {
    pub(crate) fn create<'a>(
        _events: impl Iterator<Item = (i32, &'a File)>,
    ) -> Result<Self, Error> {
        Err(unsupported().into())
    }

    pub(crate) fn pin(&self, _path: &Path) -> Result<(), Error> {
        Err(unsupported().into())
    }

    pub(crate) fn open(_path: &Path) -> Result<Self, Error> {
        Err(unsupported().into())
    }

    pub(crate) fn destroy(_path: &Path) -> Result<(), Error> {
        Err(unsupported().into())
    }

    pub(crate) fn reader(&self) -> Result<Reader, Error> {
        Err(unsupported().into())
    }
}

#[derive(Debug)]
pub(crate) struct Reader;

impl Reader {
    pub(crate) fn read(&self, _cpus: &[i32]) -> Result<CounterReading, Error> {
        Err(unsupported().into())
    }
}
