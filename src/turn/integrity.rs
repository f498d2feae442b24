//! Long-term credential integrity: MESSAGE-INTEGRITY and FINGERPRINT.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::message::Message;
use super::{ATTR_FINGERPRINT, ATTR_MESSAGE_INTEGRITY};

type HmacSha1 = Hmac<Sha1>;

const FINGERPRINT_XOR: u32 = 0x5354554E;

/// Derives the long-term credential key, `MD5(username ":" realm ":"
/// password)` per RFC 5389.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    md5::compute(format!("{username}:{realm}:{password}").as_bytes()).0
}

/// Appends MESSAGE-INTEGRITY computed over the message with the attribute
/// present at its position (value zeroed during the HMAC).
pub fn add_message_integrity(m: &mut Message, key: &[u8]) {
    m.add_attr(ATTR_MESSAGE_INTEGRITY, vec![0u8; 20]);

    let raw = m.encode();
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(&raw);
    let sum = mac.finalize().into_bytes();

    if let Some(attr) = m
        .attrs
        .iter_mut()
        .rev()
        .find(|a| a.typ == ATTR_MESSAGE_INTEGRITY)
    {
        attr.value.copy_from_slice(&sum);
    }
}

/// Appends FINGERPRINT: CRC32 of the message with the placeholder appended,
/// XOR `0x5354554E`.
pub fn add_fingerprint(m: &mut Message) {
    m.add_attr(ATTR_FINGERPRINT, vec![0u8; 4]);

    let raw = m.encode();
    let crc = crc32fast::hash(&raw) ^ FINGERPRINT_XOR;

    if let Some(attr) = m.attrs.iter_mut().rev().find(|a| a.typ == ATTR_FINGERPRINT) {
        attr.value.copy_from_slice(&crc.to_be_bytes());
    }
}
