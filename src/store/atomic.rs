//! Atomic read-modify-write operations on entry values.
//!
//! Each operation computes the entry's next value from its current one.
//! A `None` next value means the entry (and therefore its version) stays
//! unchanged; the returned value list is what goes back to the caller, with
//! the resulting value first.

use crate::error::{Error, Result};
use crate::ops::atomic::*;

/// Applies `op` to `oldval`. Returns the replacement value (if the entry
/// changed) and the operation's result values.
pub(crate) fn apply(
    op: u16,
    oldval: &[u8],
    values: &[Vec<u8>],
) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
    match op {
        ADD => {
            let val = wrapping_add(oldval, one_operand(values)?, false)?;
            Ok((Some(val.clone()), vec![val]))
        }
        SUB => {
            let val = wrapping_add(oldval, one_operand(values)?, true)?;
            Ok((Some(val.clone()), vec![val]))
        }
        BIT_SET => bit_set(oldval, values),
        BIT_CLEAR => bit_clear(oldval, values),
        APPEND => {
            let operand = one_operand(values)?;
            let mut val = Vec::with_capacity(oldval.len() + operand.len());
            val.extend_from_slice(oldval);
            val.extend_from_slice(operand);
            Ok((Some(val.clone()), vec![val]))
        }
        REMOVE => {
            let ret = replace_all(oldval, one_operand(values)?, &[])?;
            let changed = ret.len() != oldval.len();
            Ok((changed.then(|| ret.clone()), vec![ret]))
        }
        REPLACE => {
            if values.len() != 2 {
                return Err(Error::invalid("invalid parameter number"));
            }

            let ret = replace_all(oldval, &values[0], &values[1])?;
            let changed = ret != oldval;
            Ok((changed.then(|| ret.clone()), vec![ret]))
        }
        _ => Err(Error::invalid("invalid atomic operation")),
    }
}

fn one_operand(values: &[Vec<u8>]) -> Result<&[u8]> {
    if values.len() != 1 {
        return Err(Error::invalid("invalid parameter number"));
    }

    Ok(&values[0])
}

/// Unsigned little-endian wrapping add/subtract over 1, 2, 4 or 8 bytes.
fn wrapping_add(v: &[u8], n: &[u8], sub: bool) -> Result<Vec<u8>> {
    if v.len() != n.len() {
        return Err(Error::invalid("operand length mismatch"));
    }

    macro_rules! arith {
        ($ty:ty) => {{
            let mut vb = [0u8; std::mem::size_of::<$ty>()];
            let mut nb = vb;
            vb.copy_from_slice(v);
            nb.copy_from_slice(n);
            let (vv, nn) = (<$ty>::from_le_bytes(vb), <$ty>::from_le_bytes(nb));
            let res = if sub {
                vv.wrapping_sub(nn)
            } else {
                vv.wrapping_add(nn)
            };
            res.to_le_bytes().to_vec()
        }};
    }

    match v.len() {
        1 => Ok(arith!(u8)),
        2 => Ok(arith!(u16)),
        4 => Ok(arith!(u32)),
        8 => Ok(arith!(u64)),
        _ => Err(Error::invalid("invalid integer size")),
    }
}

/// With an operand: bitwise OR. Without: set the first zero bit and append
/// its index as 4 LE bytes to the result list.
fn bit_set(oldval: &[u8], values: &[Vec<u8>]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
    if !values.is_empty() {
        let mask = one_operand(values)?;
        let mut val = oldval.to_vec();
        for (b, m) in val.iter_mut().zip(mask) {
            *b |= m;
        }

        return Ok((Some(val.clone()), vec![val]));
    }

    let i = oldval
        .iter()
        .position(|&b| b != 0xff)
        .ok_or_else(|| Error::invalid("all bits already set"))?;

    let mut val = oldval.to_vec();
    let n = val[i].trailing_ones();
    val[i] |= 1 << n;
    let bitnum = (i as u32) * 8 + n;

    Ok((
        Some(val.clone()),
        vec![val, bitnum.to_le_bytes().to_vec()],
    ))
}

/// With an operand: bitwise AND. Without: clear the first one bit and append
/// its index as 4 LE bytes to the result list.
fn bit_clear(oldval: &[u8], values: &[Vec<u8>]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>)> {
    if !values.is_empty() {
        let mask = one_operand(values)?;
        let mut val = oldval.to_vec();
        for (b, m) in val.iter_mut().zip(mask) {
            *b &= m;
        }

        return Ok((Some(val.clone()), vec![val]));
    }

    let i = oldval
        .iter()
        .position(|&b| b != 0)
        .ok_or_else(|| Error::invalid("all bits already cleared"))?;

    let mut val = oldval.to_vec();
    let n = val[i].trailing_zeros();
    val[i] &= !(1 << n);
    let bitnum = (i as u32) * 8 + n;

    Ok((
        Some(val.clone()),
        vec![val, bitnum.to_le_bytes().to_vec()],
    ))
}

/// Replaces all non-overlapping matches of `needle` in `hay`.
fn replace_all(hay: &[u8], needle: &[u8], repl: &[u8]) -> Result<Vec<u8>> {
    if needle.is_empty() {
        return Err(Error::invalid("empty match pattern"));
    }

    let mut out = Vec::with_capacity(hay.len());
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        if &hay[i..i + needle.len()] == needle {
            out.extend_from_slice(repl);
            i += needle.len();
        } else {
            out.push(hay[i]);
            i += 1;
        }
    }

    out.extend_from_slice(&hay[i..]);
    Ok(out)
}
