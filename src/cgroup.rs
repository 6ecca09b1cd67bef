use std::fmt;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// The kernel's identifier for a cgroup; on cgroup v2 this is the inode number
/// of the cgroup directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CgroupId(pub u64);

impl fmt::Display for CgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open cgroup directory.
///
/// The descriptor is what `perf_event_open(2)` wants for
/// `PERF_FLAG_PID_CGROUP`; it only needs to stay open until the cgroup has been
/// [attached](struct.EventGroup.html#method.add_cgroup).
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    dir: File,
    id: CgroupId,
}

impl Cgroup {
    /// Open the cgroup at `path`, e.g. `/sys/fs/cgroup/system.slice`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let dir = File::open(&path)?;
        let id = CgroupId(dir.metadata()?.ino());
        Ok(Self { path, dir, id })
    }

    /// The path this cgroup was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cgroup's id, the inode of its directory.
    pub fn id(&self) -> CgroupId {
        self.id
    }
}

impl AsRawFd for Cgroup {
    fn as_raw_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_open_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cg = Cgroup::open(dir.path()).unwrap();

        assert_eq!(cg.path(), dir.path());
        assert_eq!(cg.id().0, std::fs::metadata(dir.path()).unwrap().ino());
        assert!(cg.as_raw_fd() >= 0);
    }

    #[test]
    fn test_open_missing() {
        let err = Cgroup::open("/nonexistent/cgroup/path").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Config);
    }
}
