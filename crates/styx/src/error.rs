//! Error representations of this library.

use std::{fmt, io};

use crate::fcall::{Fcall, Protocol};

/// Errno constants, for returning POSIX error codes from `Filesystem`
/// handlers.
pub mod errno {
    pub use nix::errno::Errno;
    pub use nix::errno::Errno::*;
}

use errno::Errno;

/// The error type for 9P operations.
///
/// A `No` error reaches the client as an error response with the carried
/// errno; an `Io` error is mapped to the closest errno first.
#[derive(Debug)]
pub enum Error {
    /// A POSIX error code
    No(Errno),
    /// An I/O error of the underlying machinery
    Io(io::Error),
}

impl Error {
    /// The errno representing this error on the wire.
    pub fn errno(&self) -> Errno {
        match self {
            Error::No(errno) => *errno,
            Error::Io(io) => io
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    /// Build the error response for the negotiated protocol variant.
    ///
    /// 9P2000.L carries a bare errno; the older variants report a message
    /// string, with the errno appended under 9P2000.u.
    pub fn to_rfcall(&self, proto: Protocol) -> Fcall {
        let errno = self.errno();
        match proto {
            Protocol::Linux => Fcall::Rlerror {
                ecode: errno as u32,
            },
            Protocol::Unix | Protocol::Legacy => Fcall::Rerror {
                ename: errno.desc().to_owned(),
                ecode: errno as u32,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::No(errno) => write!(f, "{}", errno.desc()),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::No(_) => None,
            Error::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::No(errno)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(io::Error::other(err))
    }
}

/// The error string corresponding to an errno, used as the `ename` of
/// legacy error responses.
pub fn string(errno: Errno) -> &'static str {
    errno.desc()
}
