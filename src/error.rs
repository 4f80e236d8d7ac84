//! Error taxonomy shared by every layer.
//!
//! A leaf store returns a typed error; routers forward remote errors
//! verbatim as their own result. `Remote` preserves peer-reported codes
//! that don't map onto a known kind.

use thiserror::Error;

/// Wire codes carried in `Rerror` messages. Loosely errno-flavored.
pub const ECODE_PERM: u32 = 1;
pub const ECODE_NOENT: u32 = 2;
pub const ECODE_IO: u32 = 5;
pub const ECODE_EXIST: u32 = 17;
pub const ECODE_INVAL: u32 = 22;
pub const ECODE_CONN: u32 = 104;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Create on an existing key.
    #[error("key exists")]
    Exists,

    /// Operation on a missing key, or a wait cut short by removal.
    #[error("key doesn't exist")]
    NoEntry,

    /// Write on a read-only virtual entry, or an operation the target
    /// doesn't implement.
    #[error("permission denied")]
    Permission,

    /// Malformed value lengths, unknown atomic op, bad configuration,
    /// decode failures.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The transport under an RPC closed.
    #[error("disconnected")]
    Disconnected,

    /// A peer-returned error that matches none of the kinds above.
    #[error("{descr} ({code})")]
    Remote { code: u32, descr: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Error {
        Error::Invalid(msg.into())
    }

    /// Numeric code used when this error crosses the wire in an `Rerror`.
    pub fn ecode(&self) -> u32 {
        match self {
            Error::Exists => ECODE_EXIST,
            Error::NoEntry => ECODE_NOENT,
            Error::Permission => ECODE_PERM,
            Error::Invalid(_) => ECODE_INVAL,
            Error::Disconnected => ECODE_CONN,
            Error::Remote { code, .. } => *code,
        }
    }

    /// Reconstructs an error from an `Rerror` body. Known codes map back to
    /// their canonical kind so callers can match on them; anything else is
    /// kept as `Remote`.
    pub fn from_wire(code: u32, descr: String) -> Error {
        match code {
            ECODE_EXIST => Error::Exists,
            ECODE_NOENT => Error::NoEntry,
            ECODE_PERM => Error::Permission,
            ECODE_INVAL => Error::Invalid(descr),
            ECODE_CONN => Error::Disconnected,
            _ => Error::Remote { code, descr },
        }
    }
}
