//! Core protocol types for the sync wire format.
//!
//! Everything here is wire-stable: the control bytes, the operation code
//! numbering and the fixed 256-byte chunk size must never change, or
//! nodes running different builds stop understanding each other.

use std::fmt;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Framing constants
// ---------------------------------------------------------------------------

/// Size of one read chunk and the padding boundary of the stream.
pub const CHUNK_SIZE: usize = 256;

/// Prefix that makes the following control byte literal.
pub const ESCAPE: u8 = 0;

/// Ends a message. Also used as stream padding.
pub const END: u8 = 1;

/// Separates two fields of one message.
pub const SEPARATOR: u8 = 2;

/// Reserved for future framing use; always escaped in payload data.
pub const RESERVED: u8 = 255;

/// Returns `true` for the four bytes that must be escaped in payloads.
pub fn is_control(byte: u8) -> bool {
    matches!(byte, ESCAPE | END | SEPARATOR | RESERVED)
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// One-byte correlation handle binding a request to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u8);

impl MessageId {
    /// Never handed out by the slot table's round-robin cursor.
    pub const RESERVED: MessageId = MessageId(0xFF);

    /// Slot index of this id.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// Operation selector carried in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Undefined = 0,
    Bye = 1,
    Heartbeat = 2,
    HeartbeatDenied = 3,
    Hello = 4,
    HelloAccept = 5,
    HelloDenied = 6,
    HelloConflict = 7,
    PartnerAdd = 8,
    PartnerAddAccept = 9,
    PartnerAddDenied = 10,
    PartnerRemove = 11,
    PartnerRemoveAccept = 12,
    PartnerRemoveDenied = 13,
    ClientMark = 14,
    ClientMarkAccept = 15,
    ClientMarkDenied = 16,
    ClientUnmark = 17,
    ClientUnmarkAccept = 18,
    ClientUnmarkDenied = 19,
}

impl Code {
    /// Every code, ordered by wire value.
    pub const ALL: [Code; 20] = [
        Code::Undefined,
        Code::Bye,
        Code::Heartbeat,
        Code::HeartbeatDenied,
        Code::Hello,
        Code::HelloAccept,
        Code::HelloDenied,
        Code::HelloConflict,
        Code::PartnerAdd,
        Code::PartnerAddAccept,
        Code::PartnerAddDenied,
        Code::PartnerRemove,
        Code::PartnerRemoveAccept,
        Code::PartnerRemoveDenied,
        Code::ClientMark,
        Code::ClientMarkAccept,
        Code::ClientMarkDenied,
        Code::ClientUnmark,
        Code::ClientUnmarkAccept,
        Code::ClientUnmarkDenied,
    ];

    /// The wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Code::Undefined => "UNDEFINED",
            Code::Bye => "BYE",
            Code::Heartbeat => "HEARTBEAT",
            Code::HeartbeatDenied => "HEARTBEAT_DENIED",
            Code::Hello => "HELLO",
            Code::HelloAccept => "HELLO_ACCEPT",
            Code::HelloDenied => "HELLO_DENIED",
            Code::HelloConflict => "HELLO_CONFLICT",
            Code::PartnerAdd => "PARTNER_ADD",
            Code::PartnerAddAccept => "PARTNER_ADD_ACCEPT",
            Code::PartnerAddDenied => "PARTNER_ADD_DENIED",
            Code::PartnerRemove => "PARTNER_REMOVE",
            Code::PartnerRemoveAccept => "PARTNER_REMOVE_ACCEPT",
            Code::PartnerRemoveDenied => "PARTNER_REMOVE_DENIED",
            Code::ClientMark => "CLIENT_MARK",
            Code::ClientMarkAccept => "CLIENT_MARK_ACCEPT",
            Code::ClientMarkDenied => "CLIENT_MARK_DENIED",
            Code::ClientUnmark => "CLIENT_UNMARK",
            Code::ClientUnmarkAccept => "CLIENT_UNMARK_ACCEPT",
            Code::ClientUnmarkDenied => "CLIENT_UNMARK_DENIED",
        }
    }
}

impl TryFrom<u8> for Code {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Code::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::UnknownCode(value))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =========================================================================
// Tests
// =========================================================================
