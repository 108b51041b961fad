//! Streaming MessagePack decoder.
//!
//! Output from the engine arrives in arbitrary chunks, so a value may be
//! split across several `push` calls. The decoder keeps an append-only
//! buffer and a cursor; a value whose declared length runs past the
//! buffered bytes fails with [`DecodeError::Incomplete`], which is not an
//! error to the caller: the bytes from the start of that value are kept
//! and decoding resumes on the next push.

use alloc::string::String;
use alloc::vec::Vec;

use crate::tag;
use crate::value::{dedup_entries, Value};
use crate::DecodeError;

/// Default nesting limit for arrays, maps and their contents.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Read position within a borrowed byte buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Incomplete);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Big-endian length of `width` bytes (1, 2 or 4).
    fn read_len(&mut self, width: usize) -> Result<usize, DecodeError> {
        let len = match width {
            1 => self.u8()? as u32,
            2 => u16::from_be_bytes(self.array()?) as u32,
            _ => u32::from_be_bytes(self.array()?),
        };
        Ok(len as usize)
    }
}

/// Decodes one value from the front of `bytes`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode(bytes: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut cursor = Cursor::new(bytes, 0);
    let value = read_value(&mut cursor, DEFAULT_MAX_DEPTH)?;
    Ok((value, cursor.pos))
}

fn read_value(cur: &mut Cursor<'_>, depth: usize) -> Result<Value, DecodeError> {
    let t = cur.u8()?;
    match t {
        0x00..=0x7f => Ok(Value::Integer(t as i64)),
        0x80..=0x8f => read_map(cur, (t & 0x0f) as usize, depth),
        0x90..=0x9f => read_array(cur, (t & 0x0f) as usize, depth),
        0xa0..=0xbf => read_str(cur, (t & 0x1f) as usize),
        0xe0..=0xff => Ok(Value::Integer(t as i8 as i64)),
        tag::NIL => Ok(Value::Nil),
        tag::FALSE => Ok(Value::Boolean(false)),
        tag::TRUE => Ok(Value::Boolean(true)),
        tag::BIN8 | tag::BIN16 | tag::BIN32 => {
            let len = cur.read_len(1 << (t - tag::BIN8))?;
            Ok(Value::Binary(cur.take(len)?.to_vec()))
        }
        tag::EXT8 | tag::EXT16 | tag::EXT32 => {
            let len = cur.read_len(1 << (t - tag::EXT8))?;
            read_ext(cur, len)
        }
        tag::FLOAT32 => Ok(Value::Float32(f32::from_be_bytes(cur.array()?))),
        tag::FLOAT64 => Ok(Value::Float64(f64::from_be_bytes(cur.array()?))),
        tag::UINT8 => Ok(Value::Integer(cur.u8()? as i64)),
        tag::UINT16 => Ok(Value::Integer(u16::from_be_bytes(cur.array()?) as i64)),
        tag::UINT32 => Ok(Value::Integer(u32::from_be_bytes(cur.array()?) as i64)),
        // Above i64::MAX this wraps into the negative range.
        tag::UINT64 => Ok(Value::Integer(u64::from_be_bytes(cur.array()?) as i64)),
        tag::INT8 => Ok(Value::Integer(cur.u8()? as i8 as i64)),
        tag::INT16 => Ok(Value::Integer(i16::from_be_bytes(cur.array()?) as i64)),
        tag::INT32 => Ok(Value::Integer(i32::from_be_bytes(cur.array()?) as i64)),
        tag::INT64 => Ok(Value::Integer(i64::from_be_bytes(cur.array()?))),
        tag::FIXEXT1..=tag::FIXEXT16 => read_ext(cur, 1 << (t - tag::FIXEXT1)),
        tag::STR8 | tag::STR16 | tag::STR32 => {
            let len = cur.read_len(1 << (t - tag::STR8))?;
            read_str(cur, len)
        }
        tag::ARRAY16 | tag::ARRAY32 => {
            let len = cur.read_len(2 << (t - tag::ARRAY16))?;
            read_array(cur, len, depth)
        }
        tag::MAP16 | tag::MAP32 => {
            let len = cur.read_len(2 << (t - tag::MAP16))?;
            read_map(cur, len, depth)
        }
        _ => Err(DecodeError::InvalidTag(t)),
    }
}

fn read_str(cur: &mut Cursor<'_>, len: usize) -> Result<Value, DecodeError> {
    let bytes = cur.take(len)?;
    Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn read_ext(cur: &mut Cursor<'_>, len: usize) -> Result<Value, DecodeError> {
    let ext_type = cur.u8()? as i8;
    Ok(Value::Ext(ext_type, cur.take(len)?.to_vec()))
}

fn read_array(cur: &mut Cursor<'_>, len: usize, depth: usize) -> Result<Value, DecodeError> {
    let depth = depth.checked_sub(1).ok_or(DecodeError::DepthLimit)?;
    // Every element takes at least one byte, so a header cannot make us
    // reserve more than what is buffered.
    let mut items = Vec::with_capacity(len.min(cur.remaining()));
    for _ in 0..len {
        items.push(read_value(cur, depth)?);
    }
    Ok(Value::Array(items))
}

fn read_map(cur: &mut Cursor<'_>, len: usize, depth: usize) -> Result<Value, DecodeError> {
    let depth = depth.checked_sub(1).ok_or(DecodeError::DepthLimit)?;
    let mut entries = Vec::with_capacity(len.min(cur.remaining() / 2));
    for _ in 0..len {
        let key = read_value(cur, depth)?;
        let value = read_value(cur, depth)?;
        entries.push((key, value));
    }
    Ok(Value::Map(dedup_entries(entries)))
}

/// Resumable decoder over a growing byte stream.
#[derive(Debug)]
pub struct Decoder {
    buffer: Vec<u8>,
    max_depth: usize,
    values_decoded: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Creates a decoder that rejects values nested deeper than `max_depth`.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_depth,
            values_decoded: 0,
        }
    }

    /// Appends `chunk` and emits every complete value, in stream order.
    ///
    /// Returns how many values were emitted by this call. A hard error
    /// leaves the decoder in an unspecified position; callers should drop
    /// it and start a new one.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_value: F) -> Result<usize, DecodeError>
    where
        F: FnMut(Value),
    {
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut emitted = 0;
        let result = loop {
            if consumed >= self.buffer.len() {
                break Ok(emitted);
            }
            let mut cursor = Cursor::new(&self.buffer, consumed);
            match read_value(&mut cursor, self.max_depth) {
                Ok(value) => {
                    consumed = cursor.pos;
                    emitted += 1;
                    on_value(value);
                }
                Err(DecodeError::Incomplete) => break Ok(emitted),
                Err(e) => {
                    log::debug!("decoder: {} at offset {}", e, consumed);
                    break Err(e);
                }
            }
        };

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        self.values_decoded += emitted as u64;
        #[cfg(feature = "debug")]
        log::trace!("decoder: {} values, {} bytes held back", emitted, self.buffer.len());
        result
    }

    /// Bytes held back waiting for the rest of a value.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total values emitted over the decoder's lifetime.
    pub fn values_decoded(&self) -> u64 {
        self.values_decoded
    }

    /// Drops any buffered partial value.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode, write_value};
    use alloc::vec;

    fn sample() -> Value {
        Value::Array(vec![
            Value::Integer(2),
            Value::from("redraw"),
            Value::Array(vec![Value::Array(vec![
                Value::from("grid_line"),
                Value::Array(vec![1.into(), 0.into(), 0.into(), Value::Nil]),
            ])]),
        ])
    }

    fn nested(depth: usize) -> Value {
        let mut v = Value::Map(vec![
            (Value::from("k"), Value::Ext(-1, vec![1, 2, 3, 4])),
            (Value::Integer(-5), Value::Binary(vec![0; 300])),
        ]);
        for i in 0..depth {
            v = Value::Array(vec![v, Value::Integer(i as i64 * 1_000_003), Value::Boolean(i % 2 == 0)]);
        }
        v
    }

    #[test]
    fn test_round_trip() {
        let values = [
            Value::Nil,
            Value::Boolean(true),
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
            Value::Integer((1i64 << 53) + 1),
            Value::Integer(-(1i64 << 53) - 1),
            Value::Integer(u32::MAX as i64),
            Value::Float32(-2.25),
            Value::Float64(1234.5678),
            Value::from("héllo"),
            Value::Ext(8, vec![0; 16]),
            Value::Ext(-128, vec![0; 300]),
            nested(8),
        ];
        for v in values {
            let bytes = encode(&v).unwrap();
            let (decoded, used) = decode(&bytes).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn test_unsigned_forms() {
        assert_eq!(decode(&[0xcc, 0xff]).unwrap().0, Value::Integer(255));
        assert_eq!(decode(&[0xce, 0xff, 0xff, 0xff, 0xff]).unwrap().0, Value::Integer(u32::MAX as i64));
        let mut big = vec![0xcf];
        big.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(decode(&big).unwrap().0, Value::Integer(-1));
    }

    #[test]
    fn test_fixext_and_ext_forms() {
        assert_eq!(decode(&[0xd5, 0xff, 1, 2]).unwrap().0, Value::Ext(-1, vec![1, 2]));
        assert_eq!(decode(&[0xc8, 0x00, 0x01, 0x05, 9]).unwrap().0, Value::Ext(5, vec![9]));
    }

    #[test]
    fn test_duplicate_map_keys_overwrite() {
        let bytes = [0x82, 0x01, 0xa1, b'a', 0x01, 0xa1, b'b'];
        let (v, _) = decode(&bytes).unwrap();
        assert_eq!(v, Value::Map(vec![(Value::Integer(1), Value::from("b"))]));
    }

    #[test]
    fn test_large_map_with_repeated_key() {
        let distinct = 60_000u16;
        let mut bytes = vec![tag::MAP16];
        bytes.extend_from_slice(&(distinct + 1).to_be_bytes());
        for key in 0..distinct {
            write_value(&Value::from(key), &mut bytes).unwrap();
            write_value(&Value::from(key as u32 * 2), &mut bytes).unwrap();
        }
        write_value(&Value::from(7), &mut bytes).unwrap();
        write_value(&Value::from("last"), &mut bytes).unwrap();

        let (v, used) = decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        let entries = v.as_map().unwrap();
        assert_eq!(entries.len(), distinct as usize);
        assert_eq!(entries[7], (Value::Integer(7), Value::from("last")));
        assert_eq!(entries[59_999], (Value::Integer(59_999), Value::Integer(119_998)));
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let (v, _) = decode(&[0xa2, 0xff, b'a']).unwrap();
        assert_eq!(v.as_str(), Some("\u{fffd}a"));
    }

    #[test]
    fn test_truncated_is_incomplete() {
        let bytes = encode(&sample()).unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode(&bytes[..cut]), Err(DecodeError::Incomplete));
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = encode(&sample()).unwrap();
        let mut decoder = Decoder::new();
        let mut out = Vec::new();

        for (i, b) in bytes.iter().enumerate() {
            let n = decoder.push(&[*b], |v| out.push(v)).unwrap();
            if i + 1 < bytes.len() {
                assert_eq!(n, 0);
                assert!(out.is_empty());
                assert_eq!(decoder.buffered(), i + 1);
            }
        }
        assert_eq!(out, vec![sample()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_values_per_chunk_in_order() {
        let mut stream = Vec::new();
        for i in 0..5 {
            stream.extend(encode(&Value::Array(vec![Value::Integer(2), Value::from("n"), Value::Integer(i)])).unwrap());
        }
        let split = stream.len() - 3;

        let mut decoder = Decoder::new();
        let mut out = Vec::new();
        assert_eq!(decoder.push(&stream[..split], |v| out.push(v)).unwrap(), 4);
        assert_eq!(decoder.buffered(), split - 4 * 5);
        assert_eq!(decoder.push(&stream[split..], |v| out.push(v)).unwrap(), 1);

        let order: Vec<i64> = out.iter().map(|v| v.as_array().unwrap()[2].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(decoder.values_decoded(), 5);
    }

    #[test]
    fn test_invalid_tag_is_hard_error() {
        let mut decoder = Decoder::new();
        let mut out = Vec::new();
        assert_eq!(decoder.push(&[0xc0, 0xc1, 0x01], |v| out.push(v)), Err(DecodeError::InvalidTag(0xc1)));
        assert_eq!(out, vec![Value::Nil]);

        // A fresh decoder picks up cleanly.
        let mut decoder = Decoder::new();
        let bytes = encode(&sample()).unwrap();
        out.clear();
        decoder.push(&bytes, |v| out.push(v)).unwrap();
        assert_eq!(out, vec![sample()]);
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = vec![0x91; 10];
        bytes.push(0xc0);
        let mut decoder = Decoder::with_max_depth(4);
        assert_eq!(decoder.push(&bytes, |_| {}), Err(DecodeError::DepthLimit));

        let mut decoder = Decoder::with_max_depth(10);
        let mut count = 0;
        decoder.push(&bytes, |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_huge_declared_length_waits() {
        let mut decoder = Decoder::new();
        let n = decoder.push(&[0xdd, 0xff, 0xff, 0xff, 0xff, 0xc0], |_| {}).unwrap();
        assert_eq!(n, 0);
        assert_eq!(decoder.buffered(), 6);
    }
}
