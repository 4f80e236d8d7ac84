//! The operation interface implemented by every layer.
//!
//! The store presents six operations: create, remove, get, set, test-and-set
//! and a family of atomic read-modify-write operations. The same trait is
//! implemented by the in-memory store, the routers, the cache and the RPC
//! client, which compose by delegation: a layer handles the keys it knows
//! about and forwards everything else to the layer it wraps.
//!
//! Every method defaults to `Err(Error::Permission)`, so a type implements
//! exactly the capabilities it supports and dispatchers probe capability
//! presence simply by calling through.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Version sentinels. Versions are 63-bit monotonic within an entry and
/// wrap from `HIGHEST` back to `LOWEST`.
pub mod version {
    /// "Don't care" on requests; also the version of a placeholder entry.
    pub const ANY: u64 = 0;
    /// First real version of an entry.
    pub const LOWEST: u64 = 1;
    /// Return the latest value immediately.
    pub const NEWEST: u64 = 0x7FFF_FFFF_FFFF_FFFF;
    /// Largest version an entry can carry; the next increment wraps.
    pub const HIGHEST: u64 = NEWEST - 1;
    /// Tombstone observed by waiters of a removed entry.
    pub const REMOVED: u64 = 0x8000_0000_0000_0000;
    /// Wait for the next version after the current one.
    pub const PAST_NEWEST: u64 = 0xFFFF_FFFF_FFFF_FFFF;
}

/// Atomic operation codes (`atomic`'s `op` argument). These are wire
/// constants rather than a closed enum: routers extend the space (the Chord
/// router defines `PRED_AND_NOTIFY = REPLACE + 1`).
pub mod atomic {
    /// Unsigned little-endian wrapping add; operand length must match the
    /// value length (1, 2, 4 or 8 bytes).
    pub const ADD: u16 = 0;
    /// As `ADD`, subtracting.
    pub const SUB: u16 = 1;
    /// With an operand: OR it in. Without: set the first zero bit and also
    /// return its index as 4 LE bytes.
    pub const BIT_SET: u16 = 2;
    /// With an operand: AND it in. Without: clear the first one bit and also
    /// return its index as 4 LE bytes.
    pub const BIT_CLEAR: u16 = 3;
    /// Append the operand to the value.
    pub const APPEND: u16 = 4;
    /// Delete all non-overlapping matches of the operand. No match leaves
    /// the entry (and its version) unchanged.
    pub const REMOVE: u16 = 5;
    /// Replace all matches of the first operand with the second.
    pub const REPLACE: u16 = 6;
}

/// The six-operation contract.
///
/// Operations returning `(version, value)` always return a value that was
/// associated with that version at some point in the entry's history.
#[async_trait]
pub trait Hop: Send + Sync {
    /// Adds a new entry with version [`version::LOWEST`]. The `flags`
    /// content is implementation dependent. Fails with `Exists` if the key
    /// is present and `Permission` if the key is reserved.
    async fn create(&self, _key: &str, _flags: &str, _value: &[u8]) -> Result<u64> {
        Err(Error::Permission)
    }

    /// Removes the entry, waking all waiters with [`version::REMOVED`].
    async fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::Permission)
    }

    /// Retrieves the value for the key. `ANY` and `NEWEST` return the
    /// current version immediately; a numeric version greater than the
    /// current one (or `PAST_NEWEST`) blocks the caller until the entry
    /// reaches it. Waiting on a key that gets removed returns `NoEntry`.
    async fn get(&self, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        Err(Error::Permission)
    }

    /// Stores a new value, returning the new version. Equivalent to
    /// `testset(key, ANY, None, value)`.
    async fn set(&self, _key: &str, _value: &[u8]) -> Result<u64> {
        Err(Error::Permission)
    }

    /// Atomically compares the entry's version (unless `oldversion` is
    /// `ANY`) and value (unless `oldvalue` is `None`) and replaces the value
    /// on a match. Mismatch is not an error: the returned version is the
    /// pre-existing one and the returned value is the post-call value.
    async fn testset(
        &self,
        _key: &str,
        _oldversion: u64,
        _oldvalue: Option<&[u8]>,
        _value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        Err(Error::Permission)
    }

    /// Executes an atomic read-modify-write operation on the entry's value.
    /// The number of operand and result values depends on `op`; when any
    /// values are returned, the first is the entry's new value.
    async fn atomic(&self, _key: &str, _op: u16, _values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        Err(Error::Permission)
    }
}
