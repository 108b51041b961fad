//! # EBB-WIRE: MessagePack Codec
//!
//! EBB-WIRE carries the msgpack-rpc stream between a suspended compute
//! engine and its host. The engine writes RPC traffic to its standard
//! output and reads requests from its standard input; both directions use
//! the compact, self-describing MessagePack encoding.
//!
//! ## Components
//!
//! - [`Value`]: the decoded value model (nil, booleans, 64-bit integers,
//!   floats, strings, binary, arrays, maps, extension types)
//! - [`encode`]: canonical, shortest-header encoder
//! - [`Decoder`]: resumable decoder over a chunked byte stream
//! - [`rpc`]: request / response / notification framing
//!
//! ## Example
//!
//! ```ignore
//! let bytes = rpc::Message::notification("ping", Vec::new()).encode()?;
//!
//! let mut decoder = Decoder::new();
//! decoder.push(&bytes, |value| {
//!     let msg = rpc::Message::from_value(value);
//! })?;
//! ```

#![no_std]

extern crate alloc;

pub mod decode;
pub mod encode;
pub mod rpc;
pub mod value;

pub use decode::{decode, Decoder};
pub use encode::{encode, write_value};
pub use value::Value;

/// Leading type bytes of the MessagePack format.
pub mod tag {
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
    pub const NIL: u8 = 0xc0;
    /// Never used by the format; always a hard decode error.
    pub const NEVER_USED: u8 = 0xc1;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const EXT8: u8 = 0xc7;
    pub const EXT16: u8 = 0xc8;
    pub const EXT32: u8 = 0xc9;
    pub const FLOAT32: u8 = 0xca;
    pub const FLOAT64: u8 = 0xcb;
    pub const UINT8: u8 = 0xcc;
    pub const UINT16: u8 = 0xcd;
    pub const UINT32: u8 = 0xce;
    pub const UINT64: u8 = 0xcf;
    pub const INT8: u8 = 0xd0;
    pub const INT16: u8 = 0xd1;
    pub const INT32: u8 = 0xd2;
    pub const INT64: u8 = 0xd3;
    pub const FIXEXT1: u8 = 0xd4;
    pub const FIXEXT2: u8 = 0xd5;
    pub const FIXEXT4: u8 = 0xd6;
    pub const FIXEXT8: u8 = 0xd7;
    pub const FIXEXT16: u8 = 0xd8;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
}

/// Encoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// NaN or infinite float
    NonFiniteFloat,
    /// String, binary or collection longer than a 32-bit length header allows
    LengthOverflow,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EncodeError::NonFiniteFloat => write!(f, "Cannot encode non-finite float"),
            EncodeError::LengthOverflow => write!(f, "Length exceeds 32-bit header"),
        }
    }
}

/// Decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends inside the current value; wait for more bytes
    Incomplete,
    /// Unrecognized leading type byte
    InvalidTag(u8),
    /// Nesting exceeded the decoder's depth limit
    DepthLimit,
}

impl DecodeError {
    /// True for the recoverable "need more bytes" case.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete)
    }
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::Incomplete => write!(f, "Incomplete msgpack buffer"),
            DecodeError::InvalidTag(t) => write!(f, "Unsupported msgpack type: 0x{:02x}", t),
            DecodeError::DepthLimit => write!(f, "Msgpack nesting too deep"),
        }
    }
}
