//! (XOR-)MAPPED-ADDRESS attribute codecs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{
    Attribute, Error, Message, Result, TransactionId, ATTR_MAPPED_ADDRESS,
    ATTR_XOR_MAPPED_ADDRESS, MAGIC_COOKIE,
};

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Decodes MAPPED-ADDRESS (RFC 5389 legacy form).
pub fn decode_mapped_address(attr: &Attribute) -> Result<SocketAddr> {
    decode_address(&attr.value, false, &TransactionId::default())
}

/// Decodes XOR-MAPPED-ADDRESS (RFC 5389).
pub fn decode_xor_mapped_address(attr: &Attribute, tid: &TransactionId) -> Result<SocketAddr> {
    decode_address(&attr.value, true, tid)
}

/// Attribute payload layout:
///
/// ```text
/// 0    : reserved
/// 1    : family (0x01 IPv4, 0x02 IPv6)
/// 2-3  : port
/// 4..  : address
/// ```
///
/// For the XOR variant the IPv4 address is XOR'ed with the magic cookie and
/// the IPv6 address with cookie||transaction-id; the port is XOR'ed with the
/// high 16 bits of the cookie.
fn decode_address(v: &[u8], xor: bool, tid: &TransactionId) -> Result<SocketAddr> {
    if v.len() < 4 {
        return Err(Error::NotStun);
    }
    let family = v[1];
    let mut port = u16::from_be_bytes([v[2], v[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    match family {
        FAMILY_IPV4 => {
            if v.len() < 8 {
                return Err(Error::NotStun);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&v[4..8]);
            if xor {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if v.len() < 20 {
                return Err(Error::NotStun);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&v[4..20]);
            if xor {
                let key = xor_key_v6(tid);
                for i in 0..16 {
                    octets[i] ^= key[i];
                }
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(Error::NotStun),
    }
}

/// Encodes XOR-MAPPED-ADDRESS for the given address.
pub fn build_xor_mapped_address(addr: SocketAddr, tid: &TransactionId) -> Attribute {
    let x_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    let value = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut v = vec![0u8; 8];
            v[1] = FAMILY_IPV4;
            v[2..4].copy_from_slice(&x_port.to_be_bytes());
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for (i, octet) in ip.octets().iter().enumerate() {
                v[4 + i] = octet ^ cookie[i];
            }
            v
        }
        IpAddr::V6(ip) => {
            let mut v = vec![0u8; 20];
            v[1] = FAMILY_IPV6;
            v[2..4].copy_from_slice(&x_port.to_be_bytes());
            let key = xor_key_v6(tid);
            for (i, octet) in ip.octets().iter().enumerate() {
                v[4 + i] = octet ^ key[i];
            }
            v
        }
    };
    Attribute {
        typ: ATTR_XOR_MAPPED_ADDRESS,
        value,
    }
}

/// cookie (4 bytes) || transaction id (12 bytes)
fn xor_key_v6(tid: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(tid);
    key
}

/// Extracts the mapped address from a response, preferring the XOR variant.
pub fn find_mapped_address(msg: &Message) -> Result<SocketAddr> {
    if let Some(attr) = msg.get_attribute(ATTR_XOR_MAPPED_ADDRESS) {
        return decode_xor_mapped_address(attr, &msg.transaction_id);
    }
    if let Some(attr) = msg.get_attribute(ATTR_MAPPED_ADDRESS) {
        return decode_mapped_address(attr);
    }
    Err(Error::NoMappedAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::new_transaction_id;

    #[test]
    fn xor_round_trip_ipv4() {
        let tid = new_transaction_id();
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let attr = build_xor_mapped_address(addr, &tid);
        assert_eq!(decode_xor_mapped_address(&attr, &tid).unwrap(), addr);
    }

    #[test]
    fn xor_round_trip_ipv6() {
        let tid = new_transaction_id();
        let addr: SocketAddr = "[2001:db8::7]:60000".parse().unwrap();
        let attr = build_xor_mapped_address(addr, &tid);
        assert_eq!(decode_xor_mapped_address(&attr, &tid).unwrap(), addr);
    }

    #[test]
    fn decode_plain_mapped_address() {
        // 192.0.2.1:8080, unobfuscated legacy layout.
        let attr = Attribute {
            typ: ATTR_MAPPED_ADDRESS,
            value: vec![0, FAMILY_IPV4, 0x1F, 0x90, 192, 0, 2, 1],
        };
        assert_eq!(
            decode_mapped_address(&attr).unwrap(),
            "192.0.2.1:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn find_prefers_xor_variant() {
        let tid = new_transaction_id();
        let xor_addr: SocketAddr = "198.51.100.20:60000".parse().unwrap();
        let mut msg = Message::binding_request(tid);
        msg.attributes.push(Attribute {
            typ: ATTR_MAPPED_ADDRESS,
            value: vec![0, FAMILY_IPV4, 0, 1, 10, 0, 0, 1],
        });
        msg.attributes.push(build_xor_mapped_address(xor_addr, &tid));
        assert_eq!(find_mapped_address(&msg).unwrap(), xor_addr);
    }

    #[test]
    fn find_without_address_attr_fails() {
        let msg = Message::binding_request(new_transaction_id());
        assert!(matches!(
            find_mapped_address(&msg),
            Err(Error::NoMappedAddress)
        ));
    }

    #[test]
    fn decode_rejects_bad_family() {
        let attr = Attribute {
            typ: ATTR_MAPPED_ADDRESS,
            value: vec![0, 0x03, 0, 1, 1, 2, 3, 4],
        };
        assert!(matches!(decode_mapped_address(&attr), Err(Error::NotStun)));
    }
}
