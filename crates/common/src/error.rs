//! Status codes and error types
//!
//! Driver-facing operations report failures with the kernel-style [`Errno`]
//! set. The exposure bridge is the single place where those are narrowed
//! into the small closed [`BridgeError`] set handed back to the host's
//! character-device facility.

use thiserror::Error;

/// Kernel-style status codes returned by driver-facing operations.
///
/// The raw values match the legacy numbering the hosted drivers assume,
/// so a driver comparing against a hard-coded code sees what it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Errno {
    /// Operation not permitted
    #[error("operation not permitted")]
    Perm,
    /// No such device unit
    #[error("no such entry")]
    NoEnt,
    /// Interrupted call
    #[error("interrupted")]
    Intr,
    /// Low-level I/O error
    #[error("input/output error")]
    Io,
    /// No such device or address
    #[error("no such device or address")]
    NxIo,
    /// Operation would block
    #[error("resource temporarily unavailable")]
    Again,
    /// Allocation or slot-table failure
    #[error("out of memory")]
    NoMem,
    /// Bad user buffer
    #[error("bad address")]
    Fault,
    /// Resource already claimed
    #[error("device or resource busy")]
    Busy,
    /// Underlying device is gone
    #[error("no such device")]
    NoDev,
    /// Contract violation in arguments
    #[error("invalid argument")]
    Inval,
    /// Bounded table exhausted
    #[error("no space left")]
    NoSpc,
    /// Endpoint stalled
    #[error("broken pipe")]
    Pipe,
    /// Operation not implemented by the device
    #[error("function not implemented")]
    NoSys,
    /// Transfer or wait deadline elapsed
    #[error("timed out")]
    TimedOut,
    /// Request was cancelled
    #[error("connection reset")]
    ConnReset,
    /// Asynchronous operation still pending
    #[error("operation in progress")]
    InProgress,
}

impl Errno {
    /// The signed status code a hosted driver sees for this value.
    pub fn to_raw(self) -> i32 {
        let code = match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Intr => 4,
            Errno::Io => 5,
            Errno::NxIo => 6,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Fault => 14,
            Errno::Busy => 16,
            Errno::NoDev => 19,
            Errno::Inval => 22,
            Errno::NoSpc => 28,
            Errno::Pipe => 32,
            Errno::NoSys => 38,
            Errno::ConnReset => 104,
            Errno::TimedOut => 110,
            Errno::InProgress => 115,
        };
        -code
    }

    /// Recover a status from a raw signed code.
    ///
    /// Unknown codes collapse to [`Errno::Io`]; drivers occasionally
    /// return values outside the set this layer itself produces.
    pub fn from_raw(raw: i32) -> Self {
        match raw.unsigned_abs() {
            1 => Errno::Perm,
            2 => Errno::NoEnt,
            4 => Errno::Intr,
            5 => Errno::Io,
            6 => Errno::NxIo,
            11 => Errno::Again,
            12 => Errno::NoMem,
            14 => Errno::Fault,
            16 => Errno::Busy,
            19 => Errno::NoDev,
            22 => Errno::Inval,
            28 => Errno::NoSpc,
            32 => Errno::Pipe,
            38 => Errno::NoSys,
            104 => Errno::ConnReset,
            110 => Errno::TimedOut,
            115 => Errno::InProgress,
            _ => Errno::Io,
        }
    }
}

/// The closed error set returned across the host character-device boundary.
///
/// Anything an internal component reports that has no direct counterpart
/// here collapses to [`BridgeError::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("busy")]
    Busy,
    #[error("would block")]
    WouldBlock,
    #[error("invalid request")]
    Invalid,
    #[error("no memory")]
    NoMemory,
    #[error("bad address")]
    Fault,
    #[error("interrupted")]
    Interrupted,
    #[error("error")]
    Other,
}

impl From<Errno> for BridgeError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::Busy => BridgeError::Busy,
            Errno::Again => BridgeError::WouldBlock,
            Errno::Inval => BridgeError::Invalid,
            Errno::NoMem | Errno::NoSpc => BridgeError::NoMemory,
            Errno::Fault => BridgeError::Fault,
            Errno::Intr => BridgeError::Interrupted,
            _ => BridgeError::Other,
        }
    }
}

/// General-purpose error for setup paths (config, logging).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        for errno in [
            Errno::Perm,
            Errno::NoEnt,
            Errno::Intr,
            Errno::Io,
            Errno::NxIo,
            Errno::Again,
            Errno::NoMem,
            Errno::Fault,
            Errno::Busy,
            Errno::NoDev,
            Errno::Inval,
            Errno::NoSpc,
            Errno::Pipe,
            Errno::NoSys,
            Errno::TimedOut,
            Errno::ConnReset,
            Errno::InProgress,
        ] {
            assert!(errno.to_raw() < 0);
            assert_eq!(Errno::from_raw(errno.to_raw()), errno);
        }
    }

    #[test]
    fn test_unknown_raw_collapses_to_io() {
        assert_eq!(Errno::from_raw(-999), Errno::Io);
        assert_eq!(Errno::from_raw(-77), Errno::Io);
    }

    #[test]
    fn test_boundary_narrowing() {
        assert_eq!(BridgeError::from(Errno::Busy), BridgeError::Busy);
        assert_eq!(BridgeError::from(Errno::Again), BridgeError::WouldBlock);
        assert_eq!(BridgeError::from(Errno::Inval), BridgeError::Invalid);
        assert_eq!(BridgeError::from(Errno::NoMem), BridgeError::NoMemory);
        assert_eq!(BridgeError::from(Errno::NoSpc), BridgeError::NoMemory);
        assert_eq!(BridgeError::from(Errno::Fault), BridgeError::Fault);
        assert_eq!(BridgeError::from(Errno::Intr), BridgeError::Interrupted);

        // Everything else falls through to Other
        assert_eq!(BridgeError::from(Errno::Pipe), BridgeError::Other);
        assert_eq!(BridgeError::from(Errno::NoDev), BridgeError::Other);
        assert_eq!(BridgeError::from(Errno::TimedOut), BridgeError::Other);
    }
}
