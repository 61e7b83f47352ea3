//! Wire protocol for trapsync.
//!
//! This crate defines how sync messages look on the wire:
//!
//! - **Types** ([`Code`], [`MessageId`], control bytes): the header
//!   vocabulary every message starts with.
//! - **Codec** ([`pack`], [`FrameParser`]): escaping, framing, chunk
//!   padding and incremental parsing with carry-over.
//! - **Payloads** ([`Hello`], [`ClientMark`], ...): the typed field
//!   layouts of each operation.
//! - **Errors** ([`ProtocolError`]): what can go wrong on the way.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Messager (request/reply)
//! ```

mod client;
mod codec;
mod error;
mod payload;
mod peer;
mod types;

pub use client::{CLIENT_RECORD_MIN_LEN, ClientRecord};
pub use codec::{Frame, FrameParser, combine, escape, fill_len, pack, pad, unescape};
pub use error::ProtocolError;
pub use payload::{
    ClientMark, ClientUnmark, Empty, Hello, HelloAccept, HelloConflict, PartnerChange, Payload,
    decode_duration, decode_i64, decode_u16, encode_duration, encode_i64, encode_u16, verify,
};
pub use peer::{ADDRESS_LEN, IP_LEN, PeerSet, decode_address, decode_ip, encode_address, encode_ip};
pub use types::{CHUNK_SIZE, Code, END, ESCAPE, MessageId, RESERVED, SEPARATOR, is_control};
