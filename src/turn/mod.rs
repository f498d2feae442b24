//! TURN (RFC 5766) client subset over UDP: allocations, permissions,
//! channel bindings, and the Send/Data/ChannelData data plane, with
//! long-term credential authentication.

use thiserror::Error;

pub mod addr;
pub mod client;
pub mod integrity;
pub mod message;

pub use client::{Client, Credentials};
pub use message::{Attr, Message};

#[derive(Error, Debug)]
pub enum Error {
    #[error("turn: io")]
    Io(#[from] std::io::Error),
    #[error("turn: unauthorized (need auth or stale nonce)")]
    Unauthorized,
    #[error("turn: bad message")]
    BadMessage,
    #[error("turn: timeout")]
    Timeout,
    #[error("turn: no active allocation")]
    NoAllocation,
    #[error("turn: invalid address")]
    InvalidAddress,
    #[error("turn: cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

pub(crate) const MAGIC_COOKIE: u32 = 0x2112A442;

// STUN message classes as type-field masks (RFC 5389).
pub(crate) const CLASS_REQUEST: u16 = 0x0000;
pub(crate) const CLASS_INDICATION: u16 = 0x0010;
pub(crate) const CLASS_SUCCESS: u16 = 0x0100;
pub(crate) const CLASS_ERROR: u16 = 0x0110;

// TURN methods (RFC 5766).
pub(crate) const METHOD_ALLOCATE: u16 = 0x0003;
pub(crate) const METHOD_REFRESH: u16 = 0x0004;
pub(crate) const METHOD_SEND: u16 = 0x0006;
pub(crate) const METHOD_DATA: u16 = 0x0007;
pub(crate) const METHOD_CREATE_PERMISSION: u16 = 0x0008;
pub(crate) const METHOD_CHANNEL_BIND: u16 = 0x0009;

// STUN attributes used by TURN (partial).
pub(crate) const ATTR_USERNAME: u16 = 0x0006;
pub(crate) const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub(crate) const ATTR_ERROR_CODE: u16 = 0x0009;
pub(crate) const ATTR_CHANNEL_NUMBER: u16 = 0x000C;
pub(crate) const ATTR_LIFETIME: u16 = 0x000D;
pub(crate) const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub(crate) const ATTR_DATA: u16 = 0x0013;
pub(crate) const ATTR_REALM: u16 = 0x0014;
pub(crate) const ATTR_NONCE: u16 = 0x0015;
pub(crate) const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub(crate) const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
pub(crate) const ATTR_FINGERPRINT: u16 = 0x8028;

/// ChannelData channel number range (RFC 5766).
pub const CHANNEL_MIN: u16 = 0x4000;
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// Builds a STUN message type from method and class mask (RFC 5389 bit
/// interleaving; the class masks above already sit at C0/C1).
pub(crate) fn stun_type(method: u16, class: u16) -> u16 {
    let m = method & 0x0FFF;
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | (class & 0x0010) | (class & 0x0100)
}

pub(crate) fn is_success_response(msg_type: u16) -> bool {
    msg_type & 0x0110 == CLASS_SUCCESS
}

pub(crate) fn is_error_response(msg_type: u16) -> bool {
    msg_type & 0x0110 == CLASS_ERROR
}
