//! Canonical MessagePack encoder.
//!
//! Every value is written with the shortest header that can hold it:
//! fixint/fixstr/fixarray/fixmap first, then 8/16/32-bit length headers in
//! that order. Non-negative integers past the fixint range use the
//! unsigned 8/16/32-bit forms; anything wider or negative is written in
//! the smallest signed form that holds it, up to `int 64`.

use alloc::vec::Vec;

use crate::tag;
use crate::value::Value;
use crate::EncodeError;

/// Encodes a value into a fresh buffer.
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Appends the encoding of `value` to `out`.
///
/// On error `out` may hold a partial encoding and should be discarded.
pub fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match value {
        Value::Nil => out.push(tag::NIL),
        Value::Boolean(b) => out.push(if *b { tag::TRUE } else { tag::FALSE }),
        Value::Integer(n) => write_int(*n, out),
        Value::Float32(f) => {
            if !f.is_finite() {
                return Err(EncodeError::NonFiniteFloat);
            }
            out.push(tag::FLOAT32);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Float64(f) => {
            if !f.is_finite() {
                return Err(EncodeError::NonFiniteFloat);
            }
            out.push(tag::FLOAT64);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::String(s) => {
            let len = length(s.len())?;
            if len <= 0x1f {
                out.push(tag::FIXSTR | len as u8);
            } else if len <= 0xff {
                out.extend_from_slice(&[tag::STR8, len as u8]);
            } else if len <= 0xffff {
                out.push(tag::STR16);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(tag::STR32);
                out.extend_from_slice(&len.to_be_bytes());
            }
            out.extend_from_slice(s.as_bytes());
        }
        Value::Binary(bytes) => {
            write_sized_header(length(bytes.len())?, [tag::BIN8, tag::BIN16, tag::BIN32], out);
            out.extend_from_slice(bytes);
        }
        Value::Array(items) => {
            let len = length(items.len())?;
            if len <= 0x0f {
                out.push(tag::FIXARRAY | len as u8);
            } else {
                write_wide_header(len, tag::ARRAY16, tag::ARRAY32, out);
            }
            for item in items {
                write_value(item, out)?;
            }
        }
        Value::Map(entries) => {
            let len = length(entries.len())?;
            if len <= 0x0f {
                out.push(tag::FIXMAP | len as u8);
            } else {
                write_wide_header(len, tag::MAP16, tag::MAP32, out);
            }
            for (key, val) in entries {
                write_value(key, out)?;
                write_value(val, out)?;
            }
        }
        Value::Ext(ext_type, data) => {
            let len = length(data.len())?;
            match len {
                1 => out.push(tag::FIXEXT1),
                2 => out.push(tag::FIXEXT2),
                4 => out.push(tag::FIXEXT4),
                8 => out.push(tag::FIXEXT8),
                16 => out.push(tag::FIXEXT16),
                _ => write_sized_header(len, [tag::EXT8, tag::EXT16, tag::EXT32], out),
            }
            out.push(*ext_type as u8);
            out.extend_from_slice(data);
        }
    }
    Ok(())
}

fn write_int(n: i64, out: &mut Vec<u8>) {
    if (0..=0x7f).contains(&n) {
        out.push(n as u8);
    } else if (-32..0).contains(&n) {
        out.push(n as i8 as u8);
    } else if n > 0 {
        if n <= u8::MAX as i64 {
            out.extend_from_slice(&[tag::UINT8, n as u8]);
        } else if n <= u16::MAX as i64 {
            out.push(tag::UINT16);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        } else if n <= u32::MAX as i64 {
            out.push(tag::UINT32);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        } else {
            out.push(tag::INT64);
            out.extend_from_slice(&n.to_be_bytes());
        }
    } else if n >= i8::MIN as i64 {
        out.extend_from_slice(&[tag::INT8, n as i8 as u8]);
    } else if n >= i16::MIN as i64 {
        out.push(tag::INT16);
        out.extend_from_slice(&(n as i16).to_be_bytes());
    } else if n >= i32::MIN as i64 {
        out.push(tag::INT32);
        out.extend_from_slice(&(n as i32).to_be_bytes());
    } else {
        out.push(tag::INT64);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

/// Header for families that have 8, 16 and 32-bit length forms.
fn write_sized_header(len: u32, tags: [u8; 3], out: &mut Vec<u8>) {
    if len <= 0xff {
        out.extend_from_slice(&[tags[0], len as u8]);
    } else if len <= 0xffff {
        out.push(tags[1]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(tags[2]);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Header for arrays and maps past the fix range (no 8-bit form exists).
fn write_wide_header(len: u32, tag16: u8, tag32: u8, out: &mut Vec<u8>) {
    if len <= 0xffff {
        out.push(tag16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(tag32);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

fn length(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::LengthOverflow)
}
