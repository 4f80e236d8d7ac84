//! The `#/conf` configuration grammar, shared by master, peers and clients.
//!
//! ```text
//! <master_addr> <N>
//! <peer_addr> <start>:<end> [<start>:<end> ...]
//! ...
//! ```
//!
//! Bounds are 32-bit decimals or `0x...` hex. After sorting by `start`, the
//! ranges must not overlap; a well-formed configuration covers the whole
//! hash space, but a configuration published after a peer removal legally
//! contains holes; those parse (loudly) and routing into a hole fails.

use tracing::warn;

use crate::error::{Error, Result};

/// One contiguous slice of the 32-bit hash space owned by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub addr: String,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conf {
    /// Master's address.
    pub maddr: String,
    /// Advertised number of peers.
    pub srvnum: usize,
    /// Peers in configuration order; the order drives who dials whom.
    pub srvaddrs: Vec<String>,
    /// Route table, sorted by range start.
    pub routes: Vec<Range>,
}

fn parse_bound(s: &str) -> Result<u32> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };

    parsed.map_err(|_| Error::invalid(format!("bad range bound: '{}'", s)))
}

pub fn parse_conf(data: &[u8]) -> Result<Conf> {
    let text = std::str::from_utf8(data).map_err(|_| Error::invalid("conf is not utf-8"))?;
    let mut lines = text.lines();

    let first = lines.next().ok_or_else(|| Error::invalid("empty conf"))?;
    let mut conf = Conf::default();
    let mut declared: Option<usize> = None;
    match first.split_once(' ') {
        Some((maddr, n)) => {
            conf.maddr = maddr.to_string();
            declared = Some(
                n.trim()
                    .parse()
                    .map_err(|_| Error::invalid(format!("bad peer count: '{}'", n)))?,
            );
        }
        // tolerated: a line carrying only the master address
        None => conf.maddr = first.to_string(),
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(' ');
        let addr = fields
            .next()
            .ok_or_else(|| Error::invalid("invalid route description"))?;
        let mut got_range = false;
        for r in fields {
            let (start, end) = r
                .split_once(':')
                .ok_or_else(|| Error::invalid(format!("invalid range: '{}'", r)))?;
            conf.routes.push(Range {
                addr: addr.to_string(),
                start: parse_bound(start)?,
                end: parse_bound(end)?,
            });
            got_range = true;
        }

        if !got_range {
            return Err(Error::invalid("invalid route description"));
        }

        conf.srvaddrs.push(addr.to_string());
    }

    if conf.srvaddrs.is_empty() {
        return Err(Error::invalid("conf carries no routes"));
    }

    conf.srvnum = declared.unwrap_or(conf.srvaddrs.len());
    conf.routes.sort_by_key(|r| r.start);
    check_coverage(&conf.routes)?;
    Ok(conf)
}

/// Rejects overlapping ranges; holes are tolerated but reported.
fn check_coverage(routes: &[Range]) -> Result<()> {
    let mut expected: u32 = 0;
    for r in routes {
        if r.end < r.start {
            return Err(Error::invalid(format!(
                "inverted range: {:#x}:{:#x}",
                r.start, r.end
            )));
        }

        if r.start < expected {
            return Err(Error::invalid(format!(
                "overlapping ranges at {:#x}",
                r.start
            )));
        }

        if r.start > expected {
            warn!(
                "conf leaves hash range {:#x}..{:#x} uncovered",
                expected, r.start
            );
        }

        expected = r.end;
    }

    if expected < u32::MAX {
        warn!("conf leaves hash range {:#x}..{:#x} uncovered", expected, u32::MAX);
    }

    Ok(())
}

impl Conf {
    /// Serializes for publication under `#/conf`.
    pub fn format(&self) -> String {
        let mut out = format!("{} {}\n", self.maddr, self.routes.len());
        for r in &self.routes {
            out.push_str(&format!("{} {}:{}\n", r.addr, r.start, r.end));
        }

        out
    }

    /// True when the routes leave part of the hash space unowned.
    pub fn has_holes(&self) -> bool {
        let mut expected: u32 = 0;
        for r in &self.routes {
            if r.start > expected {
                return true;
            }

            expected = r.end;
        }

        expected < u32::MAX
    }
}

/// Finds the owner of `hash`: the first range whose `end` reaches it.
/// Routing into a hole left by a removed peer is an error, not a panic.
pub fn search(routes: &[Range], hash: u32) -> Result<&Range> {
    let idx = routes.partition_point(|r| r.end < hash);
    let r = routes
        .get(idx)
        .ok_or_else(|| Error::invalid(format!("hash {:#x} in uncovered range", hash)))?;

    if r.start > hash {
        return Err(Error::invalid(format!("hash {:#x} in uncovered range", hash)));
    }

    Ok(r)
}

/// Recomputes equal contiguous ranges over the peers in order; the last
/// range absorbs the remainder of the space.
pub fn rebalance(routes: &mut [Range]) {
    let n = routes.len();
    if n == 0 {
        return;
    }

    let rsz = (u32::MAX as usize) / n;
    for (i, r) in routes.iter_mut().enumerate() {
        r.start = (i * rsz) as u32;
        r.end = ((i + 1) * rsz) as u32;
    }

    routes[n - 1].end = u32::MAX;
}
