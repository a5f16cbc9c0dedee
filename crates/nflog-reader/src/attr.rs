//! Attribute (TLV) decoding for nflog packet messages
//!
//! Each attribute is a native-endian `{u16 len, u16 type}` header followed by
//! `len - 4` payload bytes, padded to a 4-byte boundary. The decoder never
//! reads past the end of the input slice; any violation rejects the whole
//! attribute region.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Untrusted kernel buffers are bounds-checked
//! - SI-4: System Monitoring - Decoded records feed packet logging

use crate::error::{NflogError, Result};
use crate::types::{AttributeSet, NFULA_MAX};
use tracing::{debug, trace};

/// Size of `struct nlattr`
pub const NLA_HDRLEN: usize = 4;

/// Nested attribute flag, masked off the type field
pub const NLA_F_NESTED: u16 = 1 << 15;

/// Network byte order flag, masked off the type field
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;

const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Round `len` up to the netlink 4-byte alignment
#[inline]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Decode an attribute region into an [`AttributeSet`]
///
/// Rules:
/// - `len < 4`, or `len` running past the end of the buffer, is malformed
/// - 1 to 3 trailing bytes that cannot hold a header are malformed
/// - the padding of the final attribute may be cut short by the buffer end
/// - a repeated type replaces the earlier payload
/// - types above [`NFULA_MAX`] land in [`AttributeSet::unknown`]
pub fn decode_attributes(buf: &[u8]) -> Result<AttributeSet> {
    let mut attrs = AttributeSet::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let remaining = buf.len() - offset;
        if remaining < NLA_HDRLEN {
            return Err(NflogError::MalformedAttribute {
                offset,
                reason: format!("{remaining} trailing bytes cannot hold an attribute header"),
            });
        }

        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let raw_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        let attr_type = raw_type & NLA_TYPE_MASK;

        if len < NLA_HDRLEN {
            return Err(NflogError::MalformedAttribute {
                offset,
                reason: format!("length {len} is shorter than the header"),
            });
        }
        if len > remaining {
            return Err(NflogError::MalformedAttribute {
                offset,
                reason: format!("length {len} exceeds the {remaining} remaining bytes"),
            });
        }

        let payload = buf[offset + NLA_HDRLEN..offset + len].to_vec();
        if attr_type > NFULA_MAX {
            debug!(attr_type, len = payload.len(), "Keeping unknown nflog attribute");
        }
        if attrs.set(attr_type, payload).is_some() {
            trace!(attr_type, "Duplicate nflog attribute, keeping the last one");
        }

        // Short final padding is tolerated: stop at the buffer end.
        offset = offset.saturating_add(align4(len)).min(buf.len());
    }

    Ok(attrs)
}

/// Encode an [`AttributeSet`] back into its wire form
///
/// Attributes are written in ascending type order. Every attribute,
/// including the last, is padded.
pub fn encode_attributes(attrs: &AttributeSet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(attrs));
    for (attr_type, payload) in attrs.iter() {
        push_attribute(&mut buf, attr_type, payload);
    }
    buf
}

/// Append a single attribute with padding
pub fn push_attribute(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let len = NLA_HDRLEN + payload.len();
    // Payloads come from decoded u16-length attributes or small config values.
    let wire_len = u16::try_from(len).unwrap_or(u16::MAX);
    buf.extend_from_slice(&wire_len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + (align4(len) - len), 0);
}

fn encoded_len(attrs: &AttributeSet) -> usize {
    attrs
        .iter()
        .map(|(_, payload)| align4(NLA_HDRLEN + payload.len()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttrType;
    use pretty_assertions::assert_eq;

    fn attr(attr_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_attribute(&mut buf, attr_type, payload);
        buf
    }

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(13), 16);
    }

    #[test]
    fn test_decode_empty_region() {
        let attrs = decode_attributes(&[]).unwrap();
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_decode_indexes_by_type() {
        let mut buf = attr(AttrType::Payload as u16, b"hello");
        buf.extend(attr(AttrType::Mark as u16, &7u32.to_be_bytes()));

        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Payload), Some(&b"hello"[..]));
        assert_eq!(attrs.attr(AttrType::Mark), Some(&[0u8, 0, 0, 7][..]));
        for i in 0..=NFULA_MAX {
            if i != 2 && i != 9 {
                assert_eq!(attrs.get(i), None, "slot {i} should be absent");
            }
        }
    }

    #[test]
    fn test_decode_zero_length_payload_is_present() {
        let buf = attr(AttrType::Prefix as u16, &[]);
        assert_eq!(buf.len(), 4);
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Prefix), Some(&[][..]));
    }

    #[test]
    fn test_decode_masks_flag_bits() {
        let buf = attr(AttrType::Mark as u16 | NLA_F_NET_BYTEORDER, &[1, 2, 3, 4]);
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Mark), Some(&[1u8, 2, 3, 4][..]));

        let buf = attr(AttrType::Ct as u16 | NLA_F_NESTED, &[9; 8]);
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Ct), Some(&[9u8; 8][..]));
    }

    #[test]
    fn test_decode_duplicate_last_wins() {
        let mut buf = attr(AttrType::Uid as u16, &[0, 0, 0, 1]);
        buf.extend(attr(AttrType::Uid as u16, &[0, 0, 0, 2]));
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Uid), Some(&[0u8, 0, 0, 2][..]));
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_decode_unknown_type_kept() {
        let mut buf = attr(AttrType::Payload as u16, b"x");
        buf.extend(attr(37, b"future"));
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.unknown(), &[(37, b"future".to_vec())]);
        assert_eq!(attrs.attr(AttrType::Payload), Some(&b"x"[..]));
    }

    #[test]
    fn test_decode_final_padding_may_be_short() {
        let mut buf = attr(AttrType::Payload as u16, b"abcde");
        // Drop the three padding bytes of the last attribute.
        buf.truncate(9);
        let attrs = decode_attributes(&buf).unwrap();
        assert_eq!(attrs.attr(AttrType::Payload), Some(&b"abcde"[..]));
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut buf = attr(AttrType::Mark as u16, &[0; 4]);
        buf[0..2].copy_from_slice(&3u16.to_ne_bytes());
        match decode_attributes(&buf) {
            Err(NflogError::MalformedAttribute { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("expected MalformedAttribute, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_overlong_length() {
        let mut buf = attr(AttrType::Mark as u16, &[0; 4]);
        buf.extend(attr(AttrType::Uid as u16, &[0; 4]));
        buf[8..10].copy_from_slice(&200u16.to_ne_bytes());
        match decode_attributes(&buf) {
            Err(NflogError::MalformedAttribute { offset, reason }) => {
                assert_eq!(offset, 8);
                assert!(reason.contains("exceeds"));
            }
            other => panic!("expected MalformedAttribute, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_trailing_fragment() {
        let mut buf = attr(AttrType::Mark as u16, &[0; 4]);
        buf.extend_from_slice(&[1, 2]);
        assert!(matches!(
            decode_attributes(&buf),
            Err(NflogError::MalformedAttribute { offset: 8, .. })
        ));
    }

    #[test]
    fn test_decode_every_truncation_rejected() {
        let mut buf = attr(AttrType::PacketHdr as u16, &[0x08, 0x00, 3, 0]);
        buf.extend(attr(AttrType::Payload as u16, &[0xaa; 12]));

        // Cuts inside a header or inside a payload must fail; cuts on an
        // attribute boundary are a shorter valid region.
        for cut in 1..buf.len() {
            let result = decode_attributes(&buf[..cut]);
            if cut == 8 {
                assert!(result.is_ok());
            } else {
                assert!(
                    matches!(result, Err(NflogError::MalformedAttribute { .. })),
                    "cut at {cut} should be malformed"
                );
            }
        }
    }

    #[test]
    fn test_encode_matches_decode() {
        let attrs = AttributeSet::new()
            .with(AttrType::Payload as u16, b"0123456789".to_vec())
            .with(AttrType::Prefix as u16, b"drop\0".to_vec())
            .with(AttrType::HwType as u16, 1u16.to_be_bytes().to_vec())
            .with(42, vec![1, 2, 3]);

        let buf = encode_attributes(&attrs);
        assert_eq!(buf.len() % 4, 0);
        assert_eq!(decode_attributes(&buf).unwrap(), attrs);
    }
}
