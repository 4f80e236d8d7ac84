use std::fmt;

use crate::ops::atomic;

/// "No tag": set on freshly built requests until the client assigns one.
pub const NOTAG: u16 = 0xFFFF;

/// Message type ids. Requests are odd, the matching response is `id + 1`.
pub const RERROR: u16 = 100;
pub const TGET: u16 = 101;
pub const RGET: u16 = 102;
pub const TSET: u16 = 103;
pub const RSET: u16 = 104;
pub const TCREATE: u16 = 105;
pub const RCREATE: u16 = 106;
pub const TREMOVE: u16 = 107;
pub const RREMOVE: u16 = 108;
pub const TTESTSET: u16 = 109;
pub const RTESTSET: u16 = 110;
pub const TATOMIC: u16 = 111;
pub const RATOMIC: u16 = 112;
pub const TLAST: u16 = 113;

/// One protocol message, request or response. Only the fields meaningful
/// for `mtype` are populated; the rest stay at their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub mtype: u16,
    pub tag: u16,

    pub key: String,
    pub version: u64,
    /// Main value payload. `None` encodes the nil blob.
    pub value: Option<Vec<u8>>,
    /// `Ttestset` comparison value; `None` means "don't compare".
    pub oldval: Option<Vec<u8>>,
    /// Operand/result list for the atomic operations.
    pub vals: Vec<Vec<u8>>,
    /// Atomic operation code.
    pub atmop: u16,
    /// Create flags.
    pub flags: String,
    pub ecode: u32,
    pub edescr: String,
}

impl Message {
    fn new(mtype: u16) -> Message {
        Message {
            mtype,
            tag: NOTAG,
            ..Message::default()
        }
    }

    pub fn tget(key: &str, version: u64) -> Message {
        Message {
            key: key.to_string(),
            version,
            ..Message::new(TGET)
        }
    }

    pub fn rget(version: u64, value: &[u8]) -> Message {
        Message {
            version,
            value: Some(value.to_vec()),
            ..Message::new(RGET)
        }
    }

    pub fn tset(key: &str, value: &[u8]) -> Message {
        Message {
            key: key.to_string(),
            value: Some(value.to_vec()),
            ..Message::new(TSET)
        }
    }

    pub fn rset(version: u64) -> Message {
        Message {
            version,
            ..Message::new(RSET)
        }
    }

    pub fn tcreate(key: &str, flags: &str, value: &[u8]) -> Message {
        Message {
            key: key.to_string(),
            flags: flags.to_string(),
            value: Some(value.to_vec()),
            ..Message::new(TCREATE)
        }
    }

    pub fn rcreate(version: u64) -> Message {
        Message {
            version,
            ..Message::new(RCREATE)
        }
    }

    pub fn tremove(key: &str) -> Message {
        Message {
            key: key.to_string(),
            ..Message::new(TREMOVE)
        }
    }

    pub fn rremove() -> Message {
        Message::new(RREMOVE)
    }

    pub fn ttestset(key: &str, oldversion: u64, oldvalue: Option<&[u8]>, value: &[u8]) -> Message {
        Message {
            key: key.to_string(),
            version: oldversion,
            oldval: oldvalue.map(|v| v.to_vec()),
            value: Some(value.to_vec()),
            ..Message::new(TTESTSET)
        }
    }

    pub fn rtestset(version: u64, value: &[u8]) -> Message {
        Message {
            version,
            value: Some(value.to_vec()),
            ..Message::new(RTESTSET)
        }
    }

    pub fn tatomic(op: u16, key: &str, values: &[Vec<u8>]) -> Message {
        Message {
            key: key.to_string(),
            atmop: op,
            vals: values.to_vec(),
            ..Message::new(TATOMIC)
        }
    }

    pub fn ratomic(version: u64, values: &[Vec<u8>]) -> Message {
        Message {
            version,
            vals: values.to_vec(),
            ..Message::new(RATOMIC)
        }
    }

    pub fn rerror(edescr: &str, ecode: u32) -> Message {
        Message {
            ecode,
            edescr: edescr.to_string(),
            ..Message::new(RERROR)
        }
    }

    /// True for request (T) messages, false for responses.
    pub fn is_request(&self) -> bool {
        self.mtype % 2 == 1
    }
}

fn atomic_name(op: u16) -> String {
    match op {
        atomic::ADD => "add".to_string(),
        atomic::SUB => "sub".to_string(),
        atomic::BIT_SET => "bitset".to_string(),
        atomic::BIT_CLEAR => "bitclear".to_string(),
        atomic::APPEND => "append".to_string(),
        atomic::REMOVE => "remove".to_string(),
        atomic::REPLACE => "replace".to_string(),
        n => n.to_string(),
    }
}

fn blen(val: &Option<Vec<u8>>) -> usize {
    val.as_ref().map_or(0, |v| v.len())
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mtype {
            RERROR => write!(
                f,
                "Rerror tag {} edescr '{}' ecode {}",
                self.tag, self.edescr, self.ecode
            ),
            TGET => write!(
                f,
                "Tget tag {} key '{}' version {}",
                self.tag, self.key, self.version
            ),
            RGET => write!(
                f,
                "Rget tag {} version {} datalen {}",
                self.tag,
                self.version,
                blen(&self.value)
            ),
            TSET => write!(
                f,
                "Tset tag {} key '{}' datalen {}",
                self.tag,
                self.key,
                blen(&self.value)
            ),
            RSET => write!(f, "Rset tag {} version {}", self.tag, self.version),
            TCREATE => write!(
                f,
                "Tcreate tag {} key '{}' flags '{}'",
                self.tag, self.key, self.flags
            ),
            RCREATE => write!(f, "Rcreate tag {} version {}", self.tag, self.version),
            TREMOVE => write!(f, "Tremove tag {} key '{}'", self.tag, self.key),
            RREMOVE => write!(f, "Rremove tag {}", self.tag),
            TTESTSET => write!(
                f,
                "Ttestset tag {} key '{}' oldlen {} version {} datalen {}",
                self.tag,
                self.key,
                blen(&self.oldval),
                self.version,
                blen(&self.value)
            ),
            RTESTSET => write!(
                f,
                "Rtestset tag {} version {} datalen {}",
                self.tag,
                self.version,
                blen(&self.value)
            ),
            TATOMIC => write!(
                f,
                "Tatomic tag {} op '{}' key '{}' valnum {}",
                self.tag,
                atomic_name(self.atmop),
                self.key,
                self.vals.len()
            ),
            RATOMIC => write!(
                f,
                "Ratomic tag {} version {} valnum {}",
                self.tag,
                self.version,
                self.vals.len()
            ),
            n => write!(f, "invalid message: {}", n),
        }
    }
}
