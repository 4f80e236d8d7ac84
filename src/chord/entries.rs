//! Virtual entry handlers hosted by each Chord peer.
//!
//! | key | semantics |
//! |---|---|
//! | `#/chord/id` | this node's `<id_hex> <addr> <oncycle>` |
//! | `#/chord/successor[:HHHH]` | successor of this node (or of hash HHHH) |
//! | `#/chord/predecessor` | predecessor; `PredAndNotify` atomic lives here |
//! | `#/chord/finger` | finger table dump |
//! | `#/chord/ring` | ring walk |
//! | `#/chord/stack` | router state snapshot |

use std::sync::Weak;

use async_trait::async_trait;

use crate::chord::{ChordRouter, PRED_AND_NOTIFY};
use crate::error::{Error, Result};
use crate::ops::version;
use crate::store::{Entry, EntryOps};

fn router(weak: &Weak<ChordRouter>) -> Result<std::sync::Arc<ChordRouter>> {
    weak.upgrade().ok_or(Error::NoEntry)
}

pub(super) struct IdOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for IdOps {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let r = router(&self.router)?;
        Ok((version::LOWEST, r.selfnode().spec().into_bytes()))
    }
}

pub(super) struct SuccOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for SuccOps {
    async fn get(&self, _entry: &Entry, key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        router(&self.router)?.successor_value(key).await
    }
}

pub(super) struct PredOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for PredOps {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let r = router(&self.router)?;
        Ok((version::LOWEST, r.predecessor_value()))
    }

    async fn atomic(
        &self,
        _entry: &Entry,
        _key: &str,
        op: u16,
        values: &[Vec<u8>],
    ) -> Result<(u64, Vec<Vec<u8>>)> {
        if op != PRED_AND_NOTIFY {
            return Err(Error::invalid("invalid atomic operation"));
        }

        router(&self.router)?.pred_and_notify(values).await
    }
}

pub(super) struct FingerOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for FingerOps {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let r = router(&self.router)?;
        Ok((version::LOWEST, r.finger_dump().into_bytes()))
    }
}

pub(super) struct RingOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for RingOps {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let r = router(&self.router)?;
        Ok((version::LOWEST, r.ring_dump().await?.into_bytes()))
    }
}

pub(super) struct StackOps {
    pub(super) router: Weak<ChordRouter>,
}

#[async_trait]
impl EntryOps for StackOps {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let r = router(&self.router)?;
        Ok((version::LOWEST, r.debug_dump().into_bytes()))
    }
}
