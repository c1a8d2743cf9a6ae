// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Status codes, runtime errors and fatal misuse.
//!
//! Ordinary synchronization outcomes are `Error` values handed back to the
//! waiting thread. Broken scheduling invariants are `Misuse` and abort the
//! process through [`fatal`].

use thiserror::Error;

use crate::action::ActionId;
use crate::parcel::Parcel;

/// Recoverable status returned to lightweight threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// Generic failure (unknown action, panicked thread).
    #[error("operation failed")]
    Failed,
    /// The target is not resolvable here yet; the caller must resend.
    #[error("target temporarily unavailable, resend")]
    Resend,
    /// Generic synchronization failure.
    #[error("lco error")]
    Lco,
    /// A channel had nothing to receive.
    #[error("lco channel empty")]
    ChanEmpty,
    /// A timed wait expired.
    #[error("lco timeout")]
    Timeout,
    /// The object was reset while the operation was outstanding.
    #[error("lco was reset")]
    Reset,
    #[error("out of memory")]
    OutOfMemory,
    /// Application-defined code, always `>= USER_BASE`.
    #[error("user error {0}")]
    User(i16),
}

/// Success or a recoverable error.
pub type Status = Result<(), Error>;

/// First code available to applications.
pub const USER_BASE: i16 = 127;

impl Error {
    /// Numeric status code, as carried in `LCO_ERROR` parcels.
    pub fn code(self) -> i16 {
        match self {
            Error::Failed => -1,
            Error::Resend => 1,
            Error::Lco => 2,
            Error::ChanEmpty => 3,
            Error::Timeout => 4,
            Error::Reset => 5,
            Error::OutOfMemory => 6,
            Error::User(code) => code.max(USER_BASE),
        }
    }

    /// Inverse of [`Error::code`]. `0` is success.
    pub fn from_code(code: i16) -> Status {
        match code {
            0 => Ok(()),
            1 => Err(Error::Resend),
            2 => Err(Error::Lco),
            3 => Err(Error::ChanEmpty),
            4 => Err(Error::Timeout),
            5 => Err(Error::Reset),
            6 => Err(Error::OutOfMemory),
            c if c >= USER_BASE => Err(Error::User(c)),
            _ => Err(Error::Failed),
        }
    }
}

/// Numeric code of a status, `0` for success.
pub fn status_code(status: Status) -> i16 {
    match status {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// A parcel the network could not deliver. The parcel is handed back so
/// the caller can retry.
#[derive(Debug, Error)]
#[error("parcel delivery failed: {error}")]
pub struct SendError {
    pub parcel: Parcel,
    pub error: Error,
}

/// Broken scheduling-layer invariants. Reaching one is a bug in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("cannot set an already set future")]
    AlreadySet,
    #[error("reset on an lco that has waiting threads")]
    ResetWithWaiters,
    #[error("{len} bytes do not fit a {size}-byte lco value")]
    Oversized { len: usize, size: usize },
    #[error("suspend called outside of a lightweight thread")]
    NotOnWorker,
    #[error("suspend called while another suspension is pending")]
    DoubleSuspend,
    #[error("a lightweight thread cannot be sent to rank {0}")]
    RemoteThread(u32),
}

/// Log the misuse and abort the process.
#[cold]
pub(crate) fn fatal(misuse: Misuse) -> ! {
    log::error!("fatal: {misuse}");
    eprintln!("parcelx: fatal: {misuse}");
    std::process::abort()
}

/// Environment or configuration problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("at least one rank is required")]
    NoRanks,
    #[error("{0} ranks exceed the 16-bit rank field")]
    TooManyRanks(u32),
    #[error("rank {rank} out of range for {ranks} ranks")]
    RankOutOfRange { rank: u32, ranks: u32 },
}

/// Failures surfaced to the host thread driving a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no action registered as {0:?}")]
    UnknownAction(ActionId),
    #[error("lightweight thread panicked: {0}")]
    Panicked(String),
    #[error("runtime is shut down")]
    ShutDown,
    #[error(transparent)]
    Send(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_status_table() {
        assert_eq!(Error::from_code(0), Ok(()));
        assert_eq!(Error::from_code(Error::Reset.code()), Err(Error::Reset));
        assert_eq!(Error::Failed.code(), -1);
        assert_eq!(status_code(Err(Error::Timeout)), 4);
    }

    #[test]
    fn user_codes_start_at_base() {
        assert_eq!(Error::from_code(200), Err(Error::User(200)));
        // Below the threshold nothing maps to a user code.
        assert_eq!(Error::from_code(42), Err(Error::Failed));
        assert_eq!(Error::User(3).code(), USER_BASE);
    }
}
