//! STUN/TURN message and attribute wire codec.

use rand::Rng;

use super::{Error, Result, MAGIC_COOKIE};

/// A STUN attribute TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub typ: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub typ: u16,
    pub transaction_id: [u8; 12],
    pub attrs: Vec<Attr>,
}

impl Message {
    /// Creates a message with a fresh random transaction id.
    pub fn new(msg_type: u16) -> Message {
        let mut transaction_id = [0u8; 12];
        rand::rng().fill(&mut transaction_id[..]);
        Message {
            typ: msg_type,
            transaction_id,
            attrs: Vec::new(),
        }
    }

    pub(crate) fn add_attr(&mut self, typ: u16, value: Vec<u8>) {
        self.attrs.push(Attr { typ, value });
    }

    /// Returns the first attribute with the given type.
    pub fn find_attr(&self, typ: u16) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.typ == typ)
    }

    /// Encodes header and attributes. MESSAGE-INTEGRITY and FINGERPRINT are
    /// appended by the [`integrity`](super::integrity) helpers since they
    /// cover the finalized bytes.
    pub fn encode(&self) -> Vec<u8> {
        let attrs = self.encode_attrs();
        let mut b = Vec::with_capacity(20 + attrs.len());
        b.extend_from_slice(&self.typ.to_be_bytes());
        b.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        b.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        b.extend_from_slice(&self.transaction_id);
        b.extend_from_slice(&attrs);
        b
    }

    fn encode_attrs(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for attr in &self.attrs {
            out.extend_from_slice(&attr.typ.to_be_bytes());
            out.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&attr.value);

            let pad = (4 - (attr.value.len() % 4)) % 4;
            out.extend_from_slice(&[0u8; 3][..pad]);
        }
        out
    }

    /// Parses message bytes into header + attributes.
    pub fn parse(p: &[u8]) -> Result<Message> {
        if p.len() < 20 {
            return Err(Error::BadMessage);
        }
        let msg_len = u16::from_be_bytes([p[2], p[3]]) as usize;
        if p.len() < 20 + msg_len {
            return Err(Error::BadMessage);
        }
        let mut msg = Message {
            typ: u16::from_be_bytes([p[0], p[1]]),
            transaction_id: [0u8; 12],
            attrs: Vec::new(),
        };
        msg.transaction_id.copy_from_slice(&p[8..20]);

        let mut i = 20;
        let end = 20 + msg_len;
        while i + 4 <= end {
            let typ = u16::from_be_bytes([p[i], p[i + 1]]);
            let len = u16::from_be_bytes([p[i + 2], p[i + 3]]) as usize;
            i += 4;
            if i + len > end {
                return Err(Error::BadMessage);
            }
            msg.attrs.push(Attr {
                typ,
                value: p[i..i + len].to_vec(),
            });
            i += len;
            i += (4 - (len % 4)) % 4;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{stun_type, ATTR_DATA, ATTR_LIFETIME, CLASS_REQUEST, METHOD_ALLOCATE};

    #[test]
    fn encode_parse_round_trip() {
        let mut msg = Message::new(stun_type(METHOD_ALLOCATE, CLASS_REQUEST));
        msg.add_attr(ATTR_LIFETIME, 600u32.to_be_bytes().to_vec());
        msg.add_attr(ATTR_DATA, b"payload".to_vec());

        let parsed = Message::parse(&msg.encode()).unwrap();
        assert_eq!(parsed.typ, msg.typ);
        assert_eq!(parsed.transaction_id, msg.transaction_id);
        assert_eq!(parsed.attrs, msg.attrs);
    }

    #[test]
    fn attrs_padded_on_wire_only() {
        let mut msg = Message::new(0x0003);
        msg.add_attr(ATTR_DATA, b"abcde".to_vec());
        let wire = msg.encode();
        // 20 header + 4 TLV header + 5 value + 3 pad
        assert_eq!(wire.len(), 32);
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(parsed.attrs[0].value, b"abcde");
    }

    #[test]
    fn parse_rejects_truncated() {
        assert!(matches!(Message::parse(&[0u8; 10]), Err(Error::BadMessage)));

        let mut msg = Message::new(0x0003);
        msg.add_attr(ATTR_DATA, vec![0u8; 32]);
        let wire = msg.encode();
        assert!(matches!(
            Message::parse(&wire[..wire.len() - 4]),
            Err(Error::BadMessage)
        ));
    }
}
