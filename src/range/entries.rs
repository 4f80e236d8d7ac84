//! Virtual entry handlers hosted by the range router.

use std::sync::Weak;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::ops::atomic;
use crate::range::RangeRouter;
use crate::store::{Entry, EntryOps};

/// `#/conf`: reads serve the published configuration; on the master, the
/// `Append`/`Remove` atomics register and retire peers.
pub(super) struct ConfOps {
    pub(super) router: Weak<RangeRouter>,
}

#[async_trait]
impl EntryOps for ConfOps {
    async fn get(&self, entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        Ok(entry.snapshot())
    }

    async fn atomic(
        &self,
        entry: &Entry,
        _key: &str,
        op: u16,
        values: &[Vec<u8>],
    ) -> Result<(u64, Vec<Vec<u8>>)> {
        let router = self.router.upgrade().ok_or(Error::NoEntry)?;
        if !router.is_master() {
            return Err(Error::invalid("not a master"));
        }

        if values.len() != 1 {
            return Err(Error::invalid("invalid parameter number"));
        }

        let addr = std::str::from_utf8(&values[0])
            .map_err(|_| Error::invalid("bad peer address"))?;
        match op {
            atomic::APPEND => router.master_add_server(addr),
            atomic::REMOVE => router.master_remove_server(addr),
            _ => return Err(Error::Permission),
        }

        let (ver, val) = entry.snapshot();
        Ok((ver, vec![val]))
    }
}

/// `#/stack`: a snapshot of what this node is doing: configuration, route
/// table and connection liveness.
pub(super) struct StackOps {
    pub(super) router: Weak<RangeRouter>,
}

#[async_trait]
impl EntryOps for StackOps {
    async fn get(&self, entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let router = self.router.upgrade().ok_or(Error::NoEntry)?;
        Ok((entry.version(), router.debug_dump().into_bytes()))
    }
}
