//! msgpack-rpc envelopes.
//!
//! Request: `[0, msgid, method, params]`
//! Reply:   `[1, msgid, error, result]`

use rmp::Marker;
use rmpv::Value;

use crate::error::RpcError;

pub const MSG_REQUEST: u64 = 0;
pub const MSG_REPLY: u64 = 1;

/// A reply envelope, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub outcome: Result<Value, Value>,
}

pub fn encode_request(id: u64, method: &str, args: Vec<Value>) -> Result<Vec<u8>, RpcError> {
    let envelope = Value::Array(vec![
        Value::from(MSG_REQUEST),
        Value::from(id),
        Value::from(method),
        Value::Array(args),
    ]);
    let mut buf = Vec::with_capacity(32 + method.len());
    rmpv::encode::write_value(&mut buf, &envelope)
        .map_err(|e| RpcError::Decode(format!("encode request: {}", e)))?;
    Ok(buf)
}

/// Returns `None` unless `value` is a 4-element reply envelope with an
/// integer id.
pub fn parse_reply(value: Value) -> Option<Reply> {
    let Value::Array(mut items) = value else { return None; };
    if items.len() != 4 {
        return None;
    }
    if items[0].as_u64() != Some(MSG_REPLY) {
        return None;
    }
    let id = items[1].as_u64()?;
    let result = items.pop().unwrap_or(Value::Nil);
    let error = items.pop().unwrap_or(Value::Nil);
    let outcome = if error.is_nil() { Ok(result) } else { Err(error) };
    Some(Reply { id, outcome })
}

/// Incremental decoder: bytes go in as they arrive, complete top-level values
/// come out. Partial values stay buffered until the rest shows up.
///
/// Only headers are scanned while a value is incomplete; once a length
/// prefix says how big the value is, nothing is decoded until that many bytes
/// are buffered.
#[derive(Debug, Default)]
pub struct ValueStream {
    buf: Vec<u8>,
    /// Minimum buffer length before the next scan can make progress.
    need: usize,
    #[cfg(test)]
    scans: usize,
}

impl ValueStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.need = 0;
    }

    pub fn next_value(&mut self) -> Result<Option<Value>, RpcError> {
        if self.buf.is_empty() || self.buf.len() < self.need {
            return Ok(None);
        }
        #[cfg(test)]
        {
            self.scans += 1;
        }
        match encoded_len(&self.buf)? {
            Extent::Short(need) => {
                self.need = need;
                Ok(None)
            }
            Extent::Complete(len) => {
                self.need = 0;
                let value = rmpv::decode::read_value(&mut &self.buf[..len])
                    .map_err(|e| RpcError::Decode(e.to_string()))?;
                self.buf.drain(..len);
                Ok(Some(value))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Extent {
    /// The first value spans this many bytes.
    Complete(usize),
    /// At least this many bytes are needed to learn more.
    Short(usize),
}

/// How to get past one marker.
enum Step {
    Skip(usize),
    /// Length prefix of `width` bytes, then that many bytes plus `extra`.
    Sized { width: usize, extra: usize },
    Items(u64),
    /// Length prefix of `width` bytes counting entries of `per` values each.
    SizedItems { width: usize, per: u64 },
}

fn prefix(buf: &[u8], at: usize, width: usize) -> Option<usize> {
    let bytes = buf.get(at..at + width)?;
    Some(bytes.iter().fold(0usize, |n, b| (n << 8) | *b as usize))
}

/// Walks the markers and length prefixes of the first value in `buf`
/// without touching payload bytes.
fn encoded_len(buf: &[u8]) -> Result<Extent, RpcError> {
    let mut pos = 0usize;
    // values still to walk, counting nested array and map entries
    let mut remaining: u64 = 1;

    while remaining > 0 {
        let Some(&byte) = buf.get(pos) else {
            return Ok(Extent::Short(pos + 1));
        };
        pos += 1;
        remaining -= 1;

        let step = match Marker::from_u8(byte) {
            Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => Step::Skip(0),
            Marker::U8 | Marker::I8 => Step::Skip(1),
            Marker::U16 | Marker::I16 => Step::Skip(2),
            Marker::U32 | Marker::I32 | Marker::F32 => Step::Skip(4),
            Marker::U64 | Marker::I64 | Marker::F64 => Step::Skip(8),
            Marker::FixStr(n) => Step::Skip(n as usize),
            Marker::Str8 | Marker::Bin8 => Step::Sized { width: 1, extra: 0 },
            Marker::Str16 | Marker::Bin16 => Step::Sized { width: 2, extra: 0 },
            Marker::Str32 | Marker::Bin32 => Step::Sized { width: 4, extra: 0 },
            Marker::FixArray(n) => Step::Items(n as u64),
            Marker::Array16 => Step::SizedItems { width: 2, per: 1 },
            Marker::Array32 => Step::SizedItems { width: 4, per: 1 },
            Marker::FixMap(n) => Step::Items(2 * n as u64),
            Marker::Map16 => Step::SizedItems { width: 2, per: 2 },
            Marker::Map32 => Step::SizedItems { width: 4, per: 2 },
            // type byte plus fixed payload
            Marker::FixExt1 => Step::Skip(2),
            Marker::FixExt2 => Step::Skip(3),
            Marker::FixExt4 => Step::Skip(5),
            Marker::FixExt8 => Step::Skip(9),
            Marker::FixExt16 => Step::Skip(17),
            Marker::Ext8 => Step::Sized { width: 1, extra: 1 },
            Marker::Ext16 => Step::Sized { width: 2, extra: 1 },
            Marker::Ext32 => Step::Sized { width: 4, extra: 1 },
            Marker::Reserved => return Err(RpcError::Decode(format!("reserved msgpack marker 0x{:02x}", byte))),
        };

        match step {
            Step::Skip(n) => pos += n,
            Step::Sized { width, extra } => {
                let Some(len) = prefix(buf, pos, width) else {
                    return Ok(Extent::Short(pos + width));
                };
                pos += width + len + extra;
            }
            Step::Items(n) => remaining += n,
            Step::SizedItems { width, per } => {
                let Some(len) = prefix(buf, pos, width) else {
                    return Ok(Extent::Short(pos + width));
                };
                pos += width;
                remaining += per * len as u64;
            }
        }

        if pos > buf.len() {
            return Ok(Extent::Short(pos));
        }
    }
    Ok(Extent::Complete(pos))
}
