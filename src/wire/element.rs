//! The self-describing element tree the wire protocol is built from (C1).
//!
//! Bit-exact interop with existing agents means the encoding can't be
//! "whatever serde_derive would produce" — it has to be the tagged,
//! BER-style element set the protocol actually uses: booleans, minimal
//! two's-complement big-endian integers, length-prefixed byte strings,
//! enumerations, and ordered/unordered collections of further elements.
//! Universal tag numbers follow the same small ASN.1 subset the original
//! protocol reuses (BOOLEAN/INTEGER/OCTET STRING/ENUMERATED/SEQUENCE/SET).

use crate::error::{CoreError, CoreResult};
use bytes::{Buf, BufMut, BytesMut};

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

/// One node of the decoded message tree. Every wire message is, at the
/// top level, a `Sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Boolean(bool),
    Integer(i64),
    OctetString(Vec<u8>),
    Enumerated(i64),
    Sequence(Vec<Element>),
    Set(Vec<Element>),
}

impl Element {
    pub fn utf8_string(s: impl Into<String>) -> Element {
        Element::OctetString(s.into().into_bytes())
    }

    pub fn as_boolean(&self) -> CoreResult<bool> {
        match self {
            Element::Boolean(b) => Ok(*b),
            other => Err(type_error("boolean", other)),
        }
    }

    pub fn as_integer(&self) -> CoreResult<i64> {
        match self {
            Element::Integer(i) => Ok(*i),
            other => Err(type_error("integer", other)),
        }
    }

    pub fn as_enumerated(&self) -> CoreResult<i64> {
        match self {
            Element::Enumerated(i) => Ok(*i),
            other => Err(type_error("enumerated", other)),
        }
    }

    pub fn as_octet_string(&self) -> CoreResult<&[u8]> {
        match self {
            Element::OctetString(bytes) => Ok(bytes),
            other => Err(type_error("octet string", other)),
        }
    }

    pub fn as_utf8_string(&self) -> CoreResult<String> {
        let bytes = self.as_octet_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn as_sequence(&self) -> CoreResult<&[Element]> {
        match self {
            Element::Sequence(elements) => Ok(elements),
            other => Err(type_error("sequence", other)),
        }
    }

    pub fn as_set(&self) -> CoreResult<&[Element]> {
        match self {
            Element::Set(elements) => Ok(elements),
            other => Err(type_error("set", other)),
        }
    }

    /// The universal tag number occupied by this element, used by
    /// `report-stat`'s dual-shape "done" sample detection (§4.6): the
    /// parser inspects the tag of the first variable-position field to
    /// tell the with-interval shape (an `Integer`) from the stat-done
    /// shape (an `Enumerated`) apart.
    pub fn tag(&self) -> u8 {
        match self {
            Element::Boolean(_) => TAG_BOOLEAN,
            Element::Integer(_) => TAG_INTEGER,
            Element::OctetString(_) => TAG_OCTET_STRING,
            Element::Enumerated(_) => TAG_ENUMERATED,
            Element::Sequence(_) => TAG_SEQUENCE,
            Element::Set(_) => TAG_SET,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Element::Boolean(b) => {
                out.put_u8(TAG_BOOLEAN);
                encode_length(out, 1);
                out.put_u8(if *b { 0xFF } else { 0x00 });
            }
            Element::Integer(i) => encode_scalar(out, TAG_INTEGER, *i),
            Element::Enumerated(i) => encode_scalar(out, TAG_ENUMERATED, *i),
            Element::OctetString(bytes) => {
                out.put_u8(TAG_OCTET_STRING);
                encode_length(out, bytes.len());
                out.put_slice(bytes);
            }
            Element::Sequence(elements) => {
                encode_collection(out, TAG_SEQUENCE, elements)
            }
            Element::Set(elements) => encode_collection(out, TAG_SET, elements),
        }
    }

    pub fn decode(buf: &mut BytesMut) -> CoreResult<Element> {
        let tag = read_u8(buf)?;
        let len = decode_length(buf)?;
        if buf.remaining() < len {
            return Err(CoreError::Protocol(
                "truncated element: declared length exceeds remaining bytes".into(),
            ));
        }
        let mut value = buf.split_to(len);
        match tag {
            TAG_BOOLEAN => {
                let b = read_u8(&mut value)?;
                Ok(Element::Boolean(b != 0))
            }
            TAG_INTEGER => Ok(Element::Integer(decode_signed_int(&value)?)),
            TAG_ENUMERATED => Ok(Element::Enumerated(decode_signed_int(&value)?)),
            TAG_OCTET_STRING => Ok(Element::OctetString(value.to_vec())),
            TAG_SEQUENCE => Ok(Element::Sequence(decode_all(&mut value)?)),
            TAG_SET => Ok(Element::Set(decode_all(&mut value)?)),
            other => Err(CoreError::Protocol(format!(
                "unknown element tag 0x{other:02X}"
            ))),
        }
    }
}

fn type_error(expected: &str, got: &Element) -> CoreError {
    CoreError::Protocol(format!(
        "expected {} element, got tag 0x{:02X}",
        expected,
        got.tag()
    ))
}

fn encode_scalar(out: &mut BytesMut, tag: u8, value: i64) {
    let bytes = minimal_two_complement(value);
    out.put_u8(tag);
    encode_length(out, bytes.len());
    out.put_slice(&bytes);
}

fn encode_collection(out: &mut BytesMut, tag: u8, elements: &[Element]) {
    let mut body = BytesMut::new();
    for element in elements {
        element.encode(&mut body);
    }
    out.put_u8(tag);
    encode_length(out, body.len());
    out.put_slice(&body);
}

/// Minimal two's-complement big-endian encoding: the shortest byte string
/// that round-trips through `decode_signed_int`, matching the wire
/// contract's "minimum-length encoding" (§6).
fn minimal_two_complement(value: i64) -> Vec<u8> {
    let full = value.to_be_bytes();
    let mut start = 0;
    while start < full.len() - 1 {
        let byte = full[start];
        let next = full[start + 1];
        let sign_extension_byte = if value < 0 { 0xFF } else { 0x00 };
        if byte != sign_extension_byte {
            break;
        }
        // stop trimming once trimming would flip the sign bit
        if (next & 0x80) != (sign_extension_byte & 0x80) {
            break;
        }
        start += 1;
    }
    full[start..].to_vec()
}

fn decode_signed_int(bytes: &[u8]) -> CoreResult<i64> {
    if bytes.is_empty() {
        return Err(CoreError::Protocol("empty integer encoding".into()));
    }
    if bytes.len() > 8 {
        return Err(CoreError::Protocol("integer encoding too wide".into()));
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut buf = [if negative { 0xFF } else { 0x00 }; 8];
    let offset = 8 - bytes.len();
    buf[offset..].copy_from_slice(bytes);
    Ok(i64::from_be_bytes(buf))
}

fn encode_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        let trimmed = &bytes[first_nonzero..];
        out.put_u8(0x80 | trimmed.len() as u8);
        out.put_slice(trimmed);
    }
}

fn decode_length(buf: &mut BytesMut) -> CoreResult<usize> {
    let first = read_u8(buf)?;
    if first & 0x80 == 0 {
        Ok(first as usize)
    } else {
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 8 {
            return Err(CoreError::Protocol("unsupported BER length form".into()));
        }
        if buf.remaining() < count {
            return Err(CoreError::Protocol("truncated length".into()));
        }
        let mut value: u64 = 0;
        for _ in 0..count {
            value = (value << 8) | read_u8(buf)? as u64;
        }
        Ok(value as usize)
    }
}

fn decode_all(buf: &mut BytesMut) -> CoreResult<Vec<Element>> {
    let mut out = Vec::new();
    while buf.has_remaining() {
        out.push(Element::decode(buf)?);
    }
    Ok(out)
}

fn read_u8(buf: &mut BytesMut) -> CoreResult<u8> {
    if !buf.has_remaining() {
        return Err(CoreError::Protocol("unexpected end of element".into()));
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(element: Element) {
        let mut buf = BytesMut::new();
        element.encode(&mut buf);
        let decoded = Element::decode(&mut buf).expect("decode should succeed");
        assert_eq!(decoded, element);
        assert!(buf.is_empty(), "encode/decode should consume exactly one element");
    }

    #[test]
    fn round_trips_scalars() {
        round_trip(Element::Boolean(true));
        round_trip(Element::Boolean(false));
        round_trip(Element::Integer(0));
        round_trip(Element::Integer(127));
        round_trip(Element::Integer(128));
        round_trip(Element::Integer(-1));
        round_trip(Element::Integer(i64::MIN));
        round_trip(Element::Integer(i64::MAX));
        round_trip(Element::Enumerated(3));
        round_trip(Element::utf8_string("loader-1"));
    }

    #[test]
    fn round_trips_nested_collections() {
        round_trip(Element::Sequence(vec![
            Element::Integer(1),
            Element::Enumerated(2),
            Element::Set(vec![Element::Boolean(true), Element::utf8_string("x")]),
        ]));
    }

    #[test]
    fn minimal_encoding_is_actually_minimal() {
        let mut buf = BytesMut::new();
        Element::Integer(1).encode(&mut buf);
        // tag + length + 1 byte of payload
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn long_form_length_round_trips() {
        let payload = vec![0xAB; 300];
        round_trip(Element::OctetString(payload));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x99, 0x01, 0x00]);
        assert!(Element::decode(&mut buf).is_err());
    }
}
