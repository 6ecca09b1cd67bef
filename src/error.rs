//! Errors returned by this crate.

use std::{error, fmt, io};

/// The error type returned by all fallible operations in this crate.
///
/// Callers should match on [`kind`] to tell failures apart; the optional cause
/// carries the underlying OS error where there is one.
///
/// [`kind`]: #method.kind
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

/// The cause of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The event request does not resolve, or its modifiers conflict.
    #[error("invalid event configuration")]
    Config,

    /// More than [`MAX_GROUP_SIZE`] configurations were passed to a group.
    ///
    /// [`MAX_GROUP_SIZE`]: ../constant.MAX_GROUP_SIZE.html
    #[error("too many events for one group")]
    TooManyEvents,

    /// The caller lacks `CAP_PERFMON` or `CAP_BPF` (or `CAP_SYS_ADMIN`), or
    /// `perf_event_paranoid` forbids system-wide counting.
    #[error("permission denied, do we have CAP_PERFMON?")]
    Permission,

    /// No hardware counter or attribute map entry is free, even after
    /// reclaiming entries held by exited processes.
    #[error("no free counter or attribute map slot")]
    ResourceExhausted,

    /// The operation requires an opened group.
    #[error("event group is not open")]
    NotOpen,

    /// The requested lifecycle transition is invalid, i.e. reopening a closed
    /// group.
    #[error("invalid event group state transition")]
    State,

    /// Something exists at the pinned path but its layout is not the one
    /// this crate writes.
    #[error("pinned attribute map has an incompatible layout")]
    IncompatibleMap,

    /// Perf events are not available on this platform or kernel.
    #[error("perf events unsupported")]
    Unsupported,

    /// Any other OS error.
    #[error("i/o error")]
    Io,
}

impl Error {
    /// What went wrong.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn with_context(kind: ErrorKind, msg: impl fmt::Display) -> Error {
        Error {
            kind,
            cause: Some(msg.to_string().into()),
        }
    }
}

#[doc(hidden)]
impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind == other.kind
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => ErrorKind::Permission,
            Some(libc::EBUSY) | Some(libc::ENOSPC) | Some(libc::EMFILE)
            | Some(libc::ENFILE) => ErrorKind::ResourceExhausted,
            Some(libc::ENOENT) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => ErrorKind::Config,
            Some(libc::ENOSYS) | Some(libc::ENODEV) => ErrorKind::Unsupported,
            _ => ErrorKind::Io,
        };

        Error {
            kind,
            cause: Some(Box::new(err)),
        }
    }
}

#[cfg(target_os = "linux")]
impl From<libbpf_rs::Error> for Error {
    fn from(err: libbpf_rs::Error) -> Self {
        use libbpf_rs::ErrorKind as Bpf;

        let kind = match err.kind() {
            Bpf::PermissionDenied => ErrorKind::Permission,
            Bpf::OutOfMemory => ErrorKind::ResourceExhausted,
            Bpf::NotFound | Bpf::InvalidInput => ErrorKind::Config,
            Bpf::Unsupported => ErrorKind::Unsupported,
            _ => ErrorKind::Io,
        };

        Error {
            kind,
            cause: Some(Box::new(err)),
        }
    }
}

pub(crate) fn new_error(kind: ErrorKind) -> Error {
    Error { kind, cause: None }
}
