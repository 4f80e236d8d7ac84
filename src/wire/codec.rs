//! Pack/unpack of [`Message`] values to the on-the-wire byte layout.

use crate::error::{Error, Result};
use crate::wire::types::*;

/// Blob length marking a nil blob.
const NIL_BLOB: u32 = 0xFFFF_FFFF;

/// Minimum total size per message type, indexed by `mtype - RERROR`.
/// All messages start with `size[4] type[2] tag[2]`.
const MIN_SIZE: [u32; 13] = [
    14, // Rerror ecode[4] edescr[s]
    18, // Tget key[s] version[8]
    20, // Rget version[8] value[n]
    14, // Tset key[s] value[n]
    16, // Rset version[8]
    16, // Tcreate key[s] flags[s] value[n]
    16, // Rcreate version[8]
    10, // Tremove key[s]
    8,  // Rremove
    26, // Ttestset key[s] version[8] oldvalue[n] value[n]
    20, // Rtestset version[8] value[n]
    14, // Tatomic op[2] key[s] valnum[2] value[n] ...
    18, // Ratomic version[8] valnum[2] value[n] ...
];

pub(crate) fn put_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_str(buf: &mut Vec<u8>, val: &str) -> Result<()> {
    if val.len() > u16::MAX as usize {
        return Err(Error::invalid("string too long"));
    }

    put_u16(buf, val.len() as u16);
    buf.extend_from_slice(val.as_bytes());
    Ok(())
}

pub(crate) fn put_blob(buf: &mut Vec<u8>, val: Option<&[u8]>) -> Result<()> {
    match val {
        Some(v) => {
            if v.len() >= NIL_BLOB as usize {
                return Err(Error::invalid("blob too long"));
            }

            put_u32(buf, v.len() as u32);
            buf.extend_from_slice(v);
        }
        None => put_u32(buf, NIL_BLOB),
    }

    Ok(())
}

fn put_vals(buf: &mut Vec<u8>, vals: &[Vec<u8>]) -> Result<()> {
    if vals.len() > u16::MAX as usize {
        return Err(Error::invalid("too many values"));
    }

    put_u16(buf, vals.len() as u16);
    for v in vals {
        put_blob(buf, Some(v))?;
    }

    Ok(())
}

/// Sequential reader over one frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf }
    }

    /// Unconsumed remainder of the buffer.
    pub(crate) fn rest(&self) -> &'a [u8] {
        self.buf
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        if self.buf.len() < 2 {
            return Err(Error::invalid("buffer too short"));
        }

        let (head, rest) = self.buf.split_at(2);
        self.buf = rest;
        Ok(u16::from_le_bytes([head[0], head[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            return Err(Error::invalid("buffer too short"));
        }

        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        if self.buf.len() < 8 {
            return Err(Error::invalid("buffer too short"));
        }

        let (head, rest) = self.buf.split_at(8);
        self.buf = rest;
        let mut b = [0u8; 8];
        b.copy_from_slice(head);
        Ok(u64::from_le_bytes(b))
    }

    pub(crate) fn str(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        if self.buf.len() < n {
            return Err(Error::invalid("string exceeds message"));
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        String::from_utf8(head.to_vec()).map_err(|_| Error::invalid("string not utf-8"))
    }

    pub(crate) fn blob(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.u32()?;
        if n == NIL_BLOB {
            return Ok(None);
        }

        let n = n as usize;
        if self.buf.len() < n {
            return Err(Error::invalid("blob exceeds message"));
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(Some(head.to_vec()))
    }

    /// Atomic operand list. Nil list elements decode as empty values.
    fn vals(&mut self) -> Result<Vec<Vec<u8>>> {
        let n = self.u16()? as usize;
        let mut vals = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            vals.push(self.blob()?.unwrap_or_default());
        }

        Ok(vals)
    }

    fn done(&self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::invalid("trailing bytes in message"));
        }

        Ok(())
    }
}

impl Message {
    /// Packs the message into one wire frame, including the prelude.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        put_u32(&mut buf, 0); // size, patched below
        put_u16(&mut buf, self.mtype);
        put_u16(&mut buf, self.tag);

        match self.mtype {
            RERROR => {
                put_u32(&mut buf, self.ecode);
                put_str(&mut buf, &self.edescr)?;
            }
            TGET => {
                put_str(&mut buf, &self.key)?;
                put_u64(&mut buf, self.version);
            }
            RGET | RTESTSET => {
                put_u64(&mut buf, self.version);
                put_blob(&mut buf, self.value.as_deref())?;
            }
            TSET => {
                put_str(&mut buf, &self.key)?;
                put_blob(&mut buf, self.value.as_deref())?;
            }
            RSET | RCREATE => {
                put_u64(&mut buf, self.version);
            }
            TCREATE => {
                put_str(&mut buf, &self.key)?;
                put_str(&mut buf, &self.flags)?;
                put_blob(&mut buf, self.value.as_deref())?;
            }
            TREMOVE => {
                put_str(&mut buf, &self.key)?;
            }
            RREMOVE => {}
            TTESTSET => {
                put_str(&mut buf, &self.key)?;
                put_u64(&mut buf, self.version);
                put_blob(&mut buf, self.oldval.as_deref())?;
                put_blob(&mut buf, self.value.as_deref())?;
            }
            TATOMIC => {
                put_u16(&mut buf, self.atmop);
                put_str(&mut buf, &self.key)?;
                put_vals(&mut buf, &self.vals)?;
            }
            RATOMIC => {
                put_u64(&mut buf, self.version);
                put_vals(&mut buf, &self.vals)?;
            }
            n => return Err(Error::invalid(format!("invalid message type: {}", n))),
        }

        let size = buf.len() as u32;
        buf[0..4].copy_from_slice(&size.to_le_bytes());
        Ok(buf)
    }

    /// Unpacks one complete frame. The buffer must hold exactly one message.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < 8 {
            return Err(Error::invalid(format!("buffer too short: {}", buf.len())));
        }

        let mut r = Reader { buf };
        let size = r.u32()?;
        let mtype = r.u16()?;
        let tag = r.u16()?;

        if size as usize != buf.len() {
            return Err(Error::invalid(format!(
                "frame size mismatch: {} expected {}",
                buf.len(),
                size
            )));
        }

        if !(RERROR..TLAST).contains(&mtype) {
            return Err(Error::invalid(format!("invalid message type: {}", mtype)));
        }

        if size < MIN_SIZE[(mtype - RERROR) as usize] {
            return Err(Error::invalid("message too small for its type"));
        }

        let mut m = Message {
            mtype,
            tag,
            ..Message::default()
        };

        match mtype {
            RERROR => {
                m.ecode = r.u32()?;
                m.edescr = r.str()?;
            }
            TGET => {
                m.key = r.str()?;
                m.version = r.u64()?;
            }
            RGET | RTESTSET => {
                m.version = r.u64()?;
                m.value = r.blob()?;
            }
            TSET => {
                m.key = r.str()?;
                m.value = r.blob()?;
            }
            RSET | RCREATE => {
                m.version = r.u64()?;
            }
            TCREATE => {
                m.key = r.str()?;
                m.flags = r.str()?;
                m.value = r.blob()?;
            }
            TREMOVE => {
                m.key = r.str()?;
            }
            RREMOVE => {}
            TTESTSET => {
                m.key = r.str()?;
                m.version = r.u64()?;
                m.oldval = r.blob()?;
                m.value = r.blob()?;
            }
            TATOMIC => {
                m.atmop = r.u16()?;
                m.key = r.str()?;
                m.vals = r.vals()?;
            }
            RATOMIC => {
                m.version = r.u64()?;
                m.vals = r.vals()?;
            }
            _ => unreachable!(),
        }

        r.done()?;
        Ok(m)
    }
}
