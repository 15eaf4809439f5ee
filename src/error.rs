//! The closed error taxonomy shared by every layer of the stack.
//!
//! Every fallible core operation returns `Result<T, Error>`. The taxonomy is
//! deliberately small and closed — callers match on it exhaustively rather
//! than stringly-typed causes.

use core::fmt;

/// A stack-wide error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocator exhausted (block pool or pktbuf pool).
    Mem,
    /// A fixed-capacity queue or table is full.
    Full,
    /// The operation would block and the caller asked not to wait.
    None,
    /// Malformed packet data.
    Format,
    /// A checksum did not verify.
    Chksum,
    /// No route/port/protocol handler for the destination.
    Unreach,
    /// Feature or protocol not supported.
    NotSupport,
    /// Connection actively refused (e.g. RST on connect).
    Refused,
    /// Remote server failure (DNS SERVFAIL and friends).
    ServerFailure,
    /// The named resource does not exist.
    NotExist,
    /// Operation invalid in the object's current state (e.g. TCP FSM state).
    State,
    /// Peer has closed its side of the connection.
    Close,
    /// Blocking operation timed out.
    Tmo,
    /// The resource being waited on was destroyed.
    Remove,
    /// Invalid argument.
    Param,
    /// Underlying host/platform failure.
    Sys,
    /// End of data (recv after peer FIN, once buffered data is drained).
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Mem => "out of memory",
            Error::Full => "queue full",
            Error::None => "would block",
            Error::Format => "malformed packet",
            Error::Chksum => "checksum mismatch",
            Error::Unreach => "destination unreachable",
            Error::NotSupport => "not supported",
            Error::Refused => "connection refused",
            Error::ServerFailure => "server failure",
            Error::NotExist => "no such resource",
            Error::State => "invalid state for operation",
            Error::Close => "connection closed by peer",
            Error::Tmo => "timed out",
            Error::Remove => "resource removed while waiting",
            Error::Param => "invalid parameter",
            Error::Sys => "system error",
            Error::Eof => "end of file",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
