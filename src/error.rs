//! Loader error type. Every fallible operation in the crate funnels
//! into `Error` so that the service loop can stash a single pending
//! error and surface it through the frontend at the end of the
//! iteration that produced it.

use std::error;
use std::fmt;
use std::io;

use kernel::{make_result, KError, RL_PERMANENT, RM_LDR, RS_INVALIDARG};

/// Broad classification of a loader failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file is not a 3GX container
    InvalidContainer,
    /// The container version is older than the loader supports
    PluginOutdated,
    /// The container version is newer than the loader supports
    LoaderOutdated,
    /// The plugin doesn't target the current title
    Incompatible,
    /// Arena allocation failed
    OutOfMemory,
    /// Mapping memory into or out of a process failed
    MapFailure,
    /// Filesystem I/O failed
    IoFailure,
    /// No plugin file matches the title
    NotFound,
    /// The container contents don't make sense (bogus sizes, offsets
    /// out of range...)
    Malformed,
    Unknown,
}

/// A failure with its classification, the numeric result code handed
/// back over IPC and an optional human-readable message for the error
/// prompt.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    code: u32,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: u32) -> Error {
        Error {
            kind: kind,
            code: code,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(kind: ErrorKind,
                                         code: u32,
                                         message: S) -> Error {
        Error {
            kind: kind,
            code: code,
            message: Some(message.into()),
        }
    }

    /// Container magic/version failures carry the same result codes
    /// the loader module always used: description 1 for a bad magic, 2
    /// for an outdated plugin, 3 for an outdated loader.
    pub fn container(kind: ErrorKind) -> Error {
        let description =
            match kind {
                ErrorKind::InvalidContainer => 1,
                ErrorKind::PluginOutdated => 2,
                ErrorKind::LoaderOutdated => 3,
                _ => unreachable!(),
            };

        Error::new(kind,
                   make_result(RL_PERMANENT, RS_INVALIDARG,
                               RM_LDR, description))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_ref().map(|m| &**m)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message {
            Some(ref m) =>
                write!(f, "{:?} (0x{:08x}): {}", self.kind, self.code, m),
            None =>
                write!(f, "{:?} (0x{:08x})", self.kind, self.code),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match self.kind {
            ErrorKind::InvalidContainer => "not a 3GX container",
            ErrorKind::PluginOutdated => "plugin is outdated",
            ErrorKind::LoaderOutdated => "loader is outdated",
            ErrorKind::Incompatible => "plugin is not compatible",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::MapFailure => "memory mapping failed",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::NotFound => "no plugin found",
            ErrorKind::Malformed => "malformed container",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::with_message(ErrorKind::IoFailure, 0, err.to_string())
    }
}

impl From<KError> for Error {
    fn from(err: KError) -> Error {
        Error::new(ErrorKind::Unknown, err.0)
    }
}

#[test]
fn container_codes() {
    // Same packing as the C loader result macros
    assert!(Error::container(ErrorKind::InvalidContainer).code()
            == 0xd8e07401);
    assert!(Error::container(ErrorKind::PluginOutdated).code()
            == 0xd8e07402);
    assert!(Error::container(ErrorKind::LoaderOutdated).code()
            == 0xd8e07403);
}
