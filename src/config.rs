use std::env;
use std::path::{Path, PathBuf};

use crate::attr_map::{ATTR_MAP_PREFIX, ATTR_MAP_VERSION};
use crate::error::{Error, ErrorKind};

/// Where the attribute map is pinned unless configured otherwise. Must be on
/// a bpffs mount.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf";

/// Ledger entries created for a new map.
pub const DEFAULT_CAPACITY: u32 = 64;

/// Overrides the pin directory in [`AttrMapConfig::from_env`].
pub const PIN_DIR_ENV: &str = "BPERF_PIN_DIR";

/// Overrides the capacity in [`AttrMapConfig::from_env`].
pub const CAPACITY_ENV: &str = "BPERF_MAP_CAPACITY";

/// Configure the attribute map.
///
/// Unless specified, the map is pinned under [`DEFAULT_PIN_DIR`] with
/// [`DEFAULT_CAPACITY`] entries and counts on every online CPU.
///
/// ```no_run
/// # use bperf::{AttrMap, AttrMapConfig};
/// let map = AttrMap::open(AttrMapConfig::default().pin_dir("/sys/fs/bpf/tools").capacity(16))?;
/// #
/// # Ok::<(), bperf::error::Error>(())
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttrMapConfig {
    pin_dir: Option<PathBuf>,
    capacity: Option<u32>,
    cpus: Option<Vec<i32>>,
}

impl AttrMapConfig {
    /// Read overrides from `BPERF_PIN_DIR` and `BPERF_MAP_CAPACITY`.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(dir) = env::var_os(PIN_DIR_ENV) {
            config = config.pin_dir(dir);
        }
        if let Ok(cap) = env::var(CAPACITY_ENV) {
            let cap = cap.trim().parse().map_err(|e| {
                Error::with_context(
                    ErrorKind::Config,
                    format!("{}={:?}: {}", CAPACITY_ENV, cap, e),
                )
            })?;
            config = config.capacity(cap);
        }
        Ok(config)
    }

    /// bpffs directory the map is pinned in. Every process that should share
    /// counters must use the same directory.
    pub fn pin_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            pin_dir: Some(dir.into()),
            ..self
        }
    }

    /// Number of distinct slots the map can hold. Only used when the map is
    /// created.
    pub fn capacity(self, capacity: u32) -> Self {
        Self {
            capacity: Some(capacity),
            ..self
        }
    }

    /// Count on these CPUs instead of every online CPU.
    pub fn cpus(&self) -> Option<&[i32]> {
        self.cpus.as_deref()
    }

    /// Count on `cpus` only. Every process sharing the map should use the
    /// same set, since a slot counts on the CPUs of whoever created it.
    pub fn on_cpus(self, cpus: impl Into<Vec<i32>>) -> Self {
        Self {
            cpus: Some(cpus.into()),
            ..self
        }
    }

    pub(crate) fn capacity_or_default(&self) -> u32 {
        self.capacity.unwrap_or(DEFAULT_CAPACITY)
    }

    /// The full pinned path, `<pin_dir>/bperf_attr_map_v<N>`.
    pub fn path(&self) -> PathBuf {
        let dir = self
            .pin_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_PIN_DIR));
        dir.join(format!("{}{}", ATTR_MAP_PREFIX, ATTR_MAP_VERSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path() {
        assert_eq!(
            AttrMapConfig::default().path(),
            PathBuf::from("/sys/fs/bpf/bperf_attr_map_v1")
        );
    }

    #[test]
    fn test_builder() {
        let c = AttrMapConfig::default()
            .pin_dir("/sys/fs/bpf/tools")
            .capacity(8)
            .on_cpus(vec![0, 2]);

        assert_eq!(c.path(), PathBuf::from("/sys/fs/bpf/tools/bperf_attr_map_v1"));
        assert_eq!(c.capacity_or_default(), 8);
        assert_eq!(c.cpus(), Some(&[0, 2][..]));
    }

    #[test]
    fn test_defaults() {
        let c = AttrMapConfig::default();
        assert_eq!(c.capacity_or_default(), DEFAULT_CAPACITY);
        assert_eq!(c.cpus(), None);
    }
}
