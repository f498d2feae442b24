//! Wire framing for the traversal data and control planes.
//!
//! Every datagram this crate emits or accepts carries a fixed header:
//! magic (4 bytes), version (1 byte), kind (1 byte). The payload is the
//! remainder of the datagram; UDP preserves message boundaries, so no
//! length field is needed.

use bytes::Bytes;

use crate::error::{Error, Result};

pub mod message;

/// Identifies frames belonging to this crate. Foreign datagrams are dropped.
pub const MAGIC: [u8; 4] = *b"NATP";

pub const VERSION: u8 = 1;

/// magic + version + kind
pub const HEADER_LEN: usize = 6;

/// On-wire kind byte. The values are part of the wire contract between
/// interoperating implementations and must not change.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0x01,
    Control = 0x02,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketKind::Data),
            0x02 => Ok(PacketKind::Control),
            _ => Err(Error::MalformedPacket),
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Bytes,
}

/// Frames `payload` for the wire with the fixed header.
pub fn encode_packet(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(HEADER_LEN + payload.len());
    wire.extend_from_slice(&MAGIC);
    wire.push(VERSION);
    wire.push(kind as u8);
    wire.extend_from_slice(payload);
    wire
}

/// Decodes a datagram into a [`Packet`].
///
/// A frame long enough to carry the magic but not matching it fails with
/// [`Error::NotOurPacket`]; anything shorter than the fixed header fails
/// with [`Error::MalformedPacket`].
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    if frame.len() >= MAGIC.len() && frame[..MAGIC.len()] != MAGIC {
        return Err(Error::NotOurPacket);
    }
    if frame.len() < HEADER_LEN {
        return Err(Error::MalformedPacket);
    }
    let kind = PacketKind::try_from(frame[5])?;
    Ok(Packet {
        kind,
        payload: Bytes::copy_from_slice(&frame[HEADER_LEN..]),
    })
}
