//! STUN (RFC 5389) subset: Binding requests, success/error responses, and
//! the (XOR-)MAPPED-ADDRESS attributes, over UDP.

use rand::Rng;
use thiserror::Error;

pub mod attributes;
pub mod client;
pub mod message;
pub mod server;

pub use attributes::find_mapped_address;
pub use client::Client;
pub use message::{Attribute, Message};
pub use server::Server;

#[derive(Error, Debug)]
pub enum Error {
    #[error("stun: io")]
    Io(#[from] std::io::Error),
    #[error("stun: not a stun message")]
    NotStun,
    #[error("stun: no mapped address in response")]
    NoMappedAddress,
    #[error("stun: received error response")]
    ErrorResponse,
    #[error("stun: timeout")]
    Timeout,
    #[error("stun: cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// RFC 5389 magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size in bytes.
pub const HEADER_LEN: usize = 20;

pub const METHOD_BINDING: u16 = 0x0001;

/// STUN message class, the C1/C0 bits of the message type.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> MessageClass {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Attribute types recognized by this implementation (RFC 5389).
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_SOFTWARE: u16 = 0x8022;

/// 96-bit identifier correlating requests and responses.
pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    let mut id = TransactionId::default();
    rand::rng().fill(&mut id[..]);
    id
}

/// Encodes method/class into the 16-bit STUN message type field.
///
/// RFC 5389 section 6 interleaves the twelve method bits around the class
/// bits, C0 at bit 4 and C1 at bit 8:
///
/// ```text
/// bits 0-3  : M0-M3
/// bit  4    : C0
/// bits 5-7  : M4-M6
/// bit  8    : C1
/// bits 9-13 : M7-M11
/// ```
pub fn stun_type(method: u16, class: MessageClass) -> u16 {
    let m = method & 0x0FFF;
    let c = class.bits();

    (m & 0x000F) | ((c & 0x01) << 4) | ((m & 0x0070) << 1) | ((c & 0x02) << 7) | ((m & 0x0F80) << 2)
}

/// Decodes a STUN message type into method/class. Reverse of [`stun_type`].
pub fn parse_type(t: u16) -> (u16, MessageClass) {
    let c0 = (t >> 4) & 0x1;
    let c1 = (t >> 8) & 0x1;
    let method = (t & 0x000F) | ((t >> 1) & 0x0070) | ((t >> 2) & 0x0F80);
    (method, MessageClass::from_bits(c0 | (c1 << 1)))
}
