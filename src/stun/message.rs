//! STUN message header and attribute wire codec.

use super::{
    parse_type, stun_type, Error, MessageClass, Result, TransactionId, HEADER_LEN, MAGIC_COOKIE,
    METHOD_BINDING,
};

/// A single STUN TLV attribute. Values are stored at their logical length;
/// 32-bit padding exists only on the wire. Unknown attributes are preserved
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub typ: u16,
    pub value: Vec<u8>,
}

/// A STUN message: header plus ordered attributes.
#[derive(Debug, Clone)]
pub struct Message {
    pub method: u16,
    pub class: MessageClass,
    pub cookie: u32,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn binding_request(transaction_id: TransactionId) -> Message {
        Message {
            method: METHOD_BINDING,
            class: MessageClass::Request,
            cookie: MAGIC_COOKIE,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Serializes the message, padding each attribute to a 32-bit boundary.
    pub fn marshal(&self) -> Vec<u8> {
        let attr_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + ((a.value.len() + 3) & !3))
            .sum();

        let mut out = Vec::with_capacity(HEADER_LEN + attr_len);
        out.extend_from_slice(&stun_type(self.method, self.class).to_be_bytes());
        out.extend_from_slice(&(attr_len as u16).to_be_bytes());
        out.extend_from_slice(&self.cookie.to_be_bytes());
        out.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            out.extend_from_slice(&attr.typ.to_be_bytes());
            out.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&attr.value);
            let pad = (4 - (attr.value.len() % 4)) % 4;
            out.extend_from_slice(&[0u8; 3][..pad]);
        }
        out
    }

    /// Parses a raw datagram into a STUN message.
    pub fn parse(pkt: &[u8]) -> Result<Message> {
        if pkt.len() < HEADER_LEN {
            return Err(Error::NotStun);
        }
        // Per RFC 5389 the top two bits of the type are zero.
        if pkt[0] & 0xC0 != 0 {
            return Err(Error::NotStun);
        }

        let t = u16::from_be_bytes([pkt[0], pkt[1]]);
        let length = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;
        let cookie = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::NotStun);
        }
        if HEADER_LEN + length > pkt.len() {
            return Err(Error::NotStun);
        }

        let (method, class) = parse_type(t);
        let mut transaction_id = TransactionId::default();
        transaction_id.copy_from_slice(&pkt[8..20]);

        Ok(Message {
            method,
            class,
            cookie,
            transaction_id,
            attributes: parse_attributes(&pkt[HEADER_LEN..HEADER_LEN + length])?,
        })
    }

    /// Returns the first attribute with the given type.
    pub fn get_attribute(&self, typ: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.typ == typ)
    }
}

fn parse_attributes(mut b: &[u8]) -> Result<Vec<Attribute>> {
    let mut attrs = Vec::new();
    while b.len() >= 4 {
        let typ = u16::from_be_bytes([b[0], b[1]]);
        let vlen = u16::from_be_bytes([b[2], b[3]]) as usize;
        b = &b[4..];

        if vlen > b.len() {
            return Err(Error::NotStun);
        }
        attrs.push(Attribute {
            typ,
            value: b[..vlen].to_vec(),
        });

        // Skip the value and its 32-bit padding.
        let padded = (vlen + 3) & !3;
        b = &b[padded.min(b.len())..];
    }
    Ok(attrs)
}
