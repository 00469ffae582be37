// BER encoding/decoding for LDAP v3 messages.
// Only single-byte tags and definite lengths (up to 4 length octets) are supported,
// which covers everything RFC 4511 puts on the wire.

use thiserror::Error;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Largest content length accepted by the decoder (4 length octets).
const MAX_LENGTH_OCTETS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("BER truncated: {0}")]
    Truncated(&'static str),
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverrun { declared: usize, remaining: usize },
    #[error("invalid long-form length prefix 0x{0:02X}")]
    InvalidLengthPrefix(u8),
    #[error("indefinite length not supported")]
    IndefiniteLength,
    #[error("non-minimal long-form length (prefix 0x{0:02X})")]
    NonMinimalLength(u8),
    #[error("message of {declared} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { declared: usize, limit: usize },
    #[error("multi-byte tag numbers not supported (tag 0x{0:02X})")]
    MultiByteTag(u8),
    #[error("expected tag 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("expected {expected} elements, got {actual}")]
    ElementCount { expected: &'static str, actual: usize },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("{0} trailing bytes after element")]
    TrailingData(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl TagClass {
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::ContextSpecific => 0x80,
            TagClass::Private => 0xC0,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }
}

/// Compose a single tag byte.
pub fn make_tag(class: TagClass, constructed: bool, number: u8) -> u8 {
    debug_assert!(number < 0x1F, "tag number {} needs the multi-byte form", number);
    class.bits() | if constructed { 0x20 } else { 0x00 } | (number & 0x1F)
}

/// One TLV: tag byte plus raw content octets. Constructed elements keep their
/// children encoded in `value`; use [`BerElement::children`] to walk them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BerElement {
    tag: u8,
    value: Vec<u8>,
}

impl BerElement {
    pub fn new(tag: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn with_parts(class: TagClass, constructed: bool, number: u8, value: impl Into<Vec<u8>>) -> Self {
        Self::new(make_tag(class, constructed, number), value)
    }

    pub fn boolean(value: bool) -> Self {
        Self::boolean_with_tag(TAG_BOOLEAN, value)
    }

    pub fn boolean_with_tag(tag: u8, value: bool) -> Self {
        Self::new(tag, vec![if value { 0xFF } else { 0x00 }])
    }

    pub fn integer(value: i64) -> Self {
        Self::integer_with_tag(TAG_INTEGER, value)
    }

    pub fn integer_with_tag(tag: u8, value: i64) -> Self {
        Self::new(tag, encode_integer_value(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::integer_with_tag(TAG_ENUMERATED, value)
    }

    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        Self::new(TAG_OCTET_STRING, value)
    }

    pub fn octet_string_with_tag(tag: u8, value: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, value)
    }

    pub fn null() -> Self {
        Self::new(TAG_NULL, Vec::new())
    }

    pub fn sequence<I: IntoIterator<Item = BerElement>>(children: I) -> Self {
        Self::constructed(TAG_SEQUENCE, children)
    }

    pub fn set<I: IntoIterator<Item = BerElement>>(children: I) -> Self {
        Self::constructed(TAG_SET, children)
    }

    /// Constructed element with an arbitrary tag (e.g. `[APPLICATION 8]`).
    pub fn constructed<I: IntoIterator<Item = BerElement>>(tag: u8, children: I) -> Self {
        let mut value = Vec::new();
        for child in children {
            child.encode_into(&mut value);
        }
        Self { tag, value }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn tag_class(&self) -> TagClass {
        TagClass::from_tag(self.tag)
    }

    pub fn tag_number(&self) -> u8 {
        self.tag & 0x1F
    }

    pub fn is_constructed(&self) -> bool {
        self.tag & 0x20 != 0
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn encoded_len(&self) -> usize {
        1 + length_octets(self.value.len()) + self.value.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        encode_length(self.value.len(), out);
        out.extend_from_slice(&self.value);
    }

    /// Decode exactly one element; trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BerReader::new(data);
        let element = reader.read_element()?;
        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingData(reader.remaining()));
        }
        Ok(element)
    }

    pub fn expect_tag(&self, tag: u8) -> Result<&Self, DecodeError> {
        if self.tag != tag {
            return Err(DecodeError::UnexpectedTag {
                expected: tag,
                actual: self.tag,
            });
        }
        Ok(self)
    }

    /// Decode the content octets as a run of child elements.
    pub fn children(&self) -> Result<Vec<BerElement>, DecodeError> {
        let mut reader = BerReader::new(&self.value);
        let mut out = Vec::new();
        while reader.remaining() > 0 {
            out.push(reader.read_element()?);
        }
        Ok(out)
    }

    pub fn as_boolean(&self) -> Result<bool, DecodeError> {
        if self.value.len() != 1 {
            return Err(DecodeError::InvalidValue(format!(
                "boolean value must be 1 byte, got {}",
                self.value.len()
            )));
        }
        Ok(self.value[0] != 0)
    }

    pub fn as_integer(&self) -> Result<i64, DecodeError> {
        decode_integer_value(&self.value)
    }

    pub fn as_i32(&self) -> Result<i32, DecodeError> {
        let v = self.as_integer()?;
        i32::try_from(v).map_err(|_| DecodeError::InvalidValue(format!("integer {} out of range", v)))
    }

    pub fn as_string(&self) -> Result<String, DecodeError> {
        String::from_utf8(self.value.clone())
            .map_err(|_| DecodeError::InvalidValue("invalid UTF-8 string".to_string()))
    }
}

/// Sequential reader over concatenated TLVs.
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_byte(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::Truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_tag(&mut self) -> Result<u8, DecodeError> {
        let tag = self.read_byte("missing tag")?;
        if tag & 0x1F == 0x1F {
            return Err(DecodeError::MultiByteTag(tag));
        }
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize, DecodeError> {
        let first = self.read_byte("missing length")?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = long_form_octet_count(first)?;
        if self.remaining() < count {
            return Err(DecodeError::Truncated("length octets"));
        }
        let length = long_form_length(first, &self.data[self.pos..self.pos + count])?;
        self.pos += count;
        Ok(length)
    }

    pub fn read_element(&mut self) -> Result<BerElement, DecodeError> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        if self.remaining() < length {
            return Err(DecodeError::LengthOverrun {
                declared: length,
                remaining: self.remaining(),
            });
        }
        let value = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(BerElement { tag, value })
    }
}

/// Streaming encoder. Appends TLVs directly into one buffer; constructed
/// elements are opened with [`BerWriter::begin_sequence`] and closed with
/// [`BerWriter::end_sequence`], which back-patches the length. Output is
/// byte-identical to building the [`BerElement`] tree and encoding it.
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_element(&mut self, element: &BerElement) {
        element.encode_into(&mut self.buffer);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_primitive(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_primitive(TAG_INTEGER, &encode_integer_value(value));
    }

    pub fn write_enumerated(&mut self, value: i64) {
        self.write_primitive(TAG_ENUMERATED, &encode_integer_value(value));
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(TAG_OCTET_STRING, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_null(&mut self) {
        self.write_primitive(TAG_NULL, &[]);
    }

    pub fn write_primitive(&mut self, tag: u8, data: &[u8]) {
        self.buffer.push(tag);
        encode_length(data.len(), &mut self.buffer);
        self.buffer.extend_from_slice(data);
    }

    pub fn begin_sequence(&mut self) -> usize {
        self.begin_constructed(TAG_SEQUENCE)
    }

    /// Write `tag` and a one-byte length placeholder; returns the placeholder position.
    pub fn begin_constructed(&mut self, tag: u8) -> usize {
        self.buffer.push(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length at `pos` for everything written since the matching begin.
    pub fn end_sequence(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let mut len_bytes = Vec::with_capacity(5);
        encode_length(content_len, &mut len_bytes);
        self.buffer.splice(pos..pos + 1, len_bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn length_octets(len: usize) -> usize {
    if len < 128 {
        1
    } else {
        let mut n = 0;
        let mut l = len;
        while l > 0 {
            n += 1;
            l >>= 8;
        }
        1 + n
    }
}

/// Short form below 128, otherwise minimal long form.
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 128 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn encode_integer_value(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn decode_integer_value(bytes: &[u8]) -> Result<i64, DecodeError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(DecodeError::InvalidValue(format!(
            "integer must be 1..=8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

fn long_form_octet_count(first: u8) -> Result<usize, DecodeError> {
    if first == 0xFF {
        return Err(DecodeError::InvalidLengthPrefix(first));
    }
    match (first & 0x7F) as usize {
        0 => Err(DecodeError::IndefiniteLength),
        count if count > MAX_LENGTH_OCTETS => Err(DecodeError::InvalidLengthPrefix(first)),
        count => Ok(count),
    }
}

/// Long-form lengths must be minimal: no leading zero octet and no value the
/// short form could carry. The encoder only produces that form.
fn long_form_length(first: u8, octets: &[u8]) -> Result<usize, DecodeError> {
    if octets.first() == Some(&0) {
        return Err(DecodeError::NonMinimalLength(first));
    }
    let length = octets.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
    if length < 0x80 {
        return Err(DecodeError::NonMinimalLength(first));
    }
    Ok(length)
}

/// Total encoded size of the element whose header starts `buf`, or `None`
/// while the header itself is incomplete. Used to frame messages read from a
/// stream; the caller waits until `buf` holds that many bytes. A declared size
/// above `max_size` is rejected before anything is buffered for it.
pub fn frame_length(buf: &[u8], max_size: usize) -> Result<Option<usize>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[1];
    let total = if first & 0x80 == 0 {
        2 + first as usize
    } else {
        let count = long_form_octet_count(first)?;
        if buf.len() < 2 + count {
            return Ok(None);
        }
        2 + count + long_form_length(first, &buf[2..2 + count])?
    };
    if total > max_size {
        return Err(DecodeError::MessageTooLarge {
            declared: total,
            limit: max_size,
        });
    }
    Ok(Some(total))
}

/// Printable-ASCII heuristic. Only decides how values are rendered for humans.
pub fn is_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (0x20..=0x7E).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_long_length() {
        let short = BerElement::octet_string(vec![0u8; 127]).encode();
        assert_eq!(&short[..2], &[0x04, 0x7F]);

        let long = BerElement::octet_string(vec![0u8; 128]).encode();
        assert_eq!(&long[..3], &[0x04, 0x81, 0x80]);

        let longer = BerElement::octet_string(vec![0u8; 300]).encode();
        assert_eq!(&longer[..4], &[0x04, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn test_integer_encoding_is_minimal() {
        assert_eq!(BerElement::integer(0).encode(), vec![0x02, 0x01, 0x00]);
        assert_eq!(BerElement::integer(127).encode(), vec![0x02, 0x01, 0x7F]);
        assert_eq!(BerElement::integer(128).encode(), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(BerElement::integer(256).encode(), vec![0x02, 0x02, 0x01, 0x00]);
        assert_eq!(BerElement::integer(-1).encode(), vec![0x02, 0x01, 0xFF]);
        assert_eq!(BerElement::integer(-128).encode(), vec![0x02, 0x01, 0x80]);
        assert_eq!(BerElement::integer(-129).encode(), vec![0x02, 0x02, 0xFF, 0x7F]);
    }

    #[test]
    fn test_integer_decoding() {
        for v in [0i64, 1, -1, 127, 128, -128, -129, 65535, i32::MAX as i64, i32::MIN as i64, i64::MAX, i64::MIN] {
            let decoded = BerElement::decode(&BerElement::integer(v).encode()).unwrap();
            assert_eq!(decoded.as_integer().unwrap(), v);
        }
    }

    #[test]
    fn test_decode_encode_identity() {
        let tree = BerElement::sequence(vec![
            BerElement::integer(5),
            BerElement::constructed(
                0x68,
                vec![
                    BerElement::octet_string("cn=test,dc=example,dc=com"),
                    BerElement::sequence(vec![BerElement::sequence(vec![
                        BerElement::octet_string("description"),
                        BerElement::set(vec![BerElement::octet_string(vec![b'x'; 200])]),
                    ])]),
                ],
            ),
            BerElement::boolean(true),
            BerElement::null(),
        ]);
        let bytes = tree.encode();
        let decoded = BerElement::decode(&bytes).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_streaming_writer_matches_tree() {
        let tree = BerElement::sequence(vec![
            BerElement::integer(42),
            BerElement::constructed(
                0x66,
                vec![
                    BerElement::octet_string("uid=jdoe,ou=people"),
                    BerElement::sequence(vec![BerElement::sequence(vec![
                        BerElement::enumerated(2),
                        BerElement::sequence(vec![
                            BerElement::octet_string("description"),
                            BerElement::set(vec![BerElement::octet_string(vec![b'y'; 400])]),
                        ]),
                    ])]),
                ],
            ),
        ]);

        let mut w = BerWriter::new();
        let msg = w.begin_sequence();
        w.write_integer(42);
        let op = w.begin_constructed(0x66);
        w.write_string("uid=jdoe,ou=people");
        let changes = w.begin_sequence();
        let change = w.begin_sequence();
        w.write_enumerated(2);
        let attr = w.begin_sequence();
        w.write_string("description");
        let vals = w.begin_constructed(TAG_SET);
        w.write_octet_string(&[b'y'; 400]);
        w.end_sequence(vals);
        w.end_sequence(attr);
        w.end_sequence(change);
        w.end_sequence(changes);
        w.end_sequence(op);
        w.end_sequence(msg);

        assert_eq!(w.into_vec(), tree.encode());
    }

    #[test]
    fn test_decode_truncated_length_octets() {
        assert_eq!(
            BerElement::decode(&[0x04, 0x82, 0x01]),
            Err(DecodeError::Truncated("length octets"))
        );
        assert!(matches!(BerElement::decode(&[0x04]), Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn test_decode_length_overrun() {
        assert_eq!(
            BerElement::decode(&[0x04, 0x05, b'a', b'b']),
            Err(DecodeError::LengthOverrun { declared: 5, remaining: 2 })
        );
    }

    #[test]
    fn test_decode_reserved_length_prefix() {
        assert_eq!(
            BerElement::decode(&[0x04, 0xFF, 0x00]),
            Err(DecodeError::InvalidLengthPrefix(0xFF))
        );
        assert_eq!(BerElement::decode(&[0x30, 0x80, 0x00, 0x00]), Err(DecodeError::IndefiniteLength));
        assert_eq!(
            BerElement::decode(&[0x04, 0x85, 0, 0, 0, 0, 1, 0]),
            Err(DecodeError::InvalidLengthPrefix(0x85))
        );
    }

    #[test]
    fn test_decode_rejects_trailing_and_multibyte_tag() {
        assert_eq!(
            BerElement::decode(&[0x05, 0x00, 0x00]),
            Err(DecodeError::TrailingData(1))
        );
        assert_eq!(BerElement::decode(&[0x1F, 0x01, 0x00]), Err(DecodeError::MultiByteTag(0x1F)));
    }

    #[test]
    fn test_tag_parts() {
        let e = BerElement::with_parts(TagClass::Application, true, 8, Vec::new());
        assert_eq!(e.tag(), 0x68);
        assert_eq!(e.tag_class(), TagClass::Application);
        assert_eq!(e.tag_number(), 8);
        assert!(e.is_constructed());

        let p = BerElement::with_parts(TagClass::ContextSpecific, false, 7, "cn");
        assert_eq!(p.tag(), 0x87);
        assert!(!p.is_constructed());
    }

    #[test]
    fn test_expect_tag_and_children() {
        let seq = BerElement::sequence(vec![BerElement::integer(1), BerElement::octet_string("a")]);
        assert!(seq.expect_tag(TAG_SEQUENCE).is_ok());
        assert_eq!(
            seq.expect_tag(TAG_SET).unwrap_err(),
            DecodeError::UnexpectedTag { expected: TAG_SET, actual: TAG_SEQUENCE }
        );
        let children = seq.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].as_string().unwrap(), "a");
    }

    #[test]
    fn test_frame_length() {
        let bytes = BerElement::octet_string(vec![1u8; 300]).encode();
        assert_eq!(frame_length(&bytes[..1], usize::MAX).unwrap(), None);
        assert_eq!(frame_length(&bytes[..3], usize::MAX).unwrap(), None);
        assert_eq!(frame_length(&bytes[..4], usize::MAX).unwrap(), Some(bytes.len()));
        assert!(frame_length(&[0x30, 0xFF], usize::MAX).is_err());
    }

    #[test]
    fn test_frame_length_enforces_limit() {
        assert_eq!(
            frame_length(&[0x30, 0x84, 0xFF, 0xFF, 0xFF, 0xFF], 1024),
            Err(DecodeError::MessageTooLarge {
                declared: 6 + 0xFFFF_FFFF,
                limit: 1024
            })
        );
        assert_eq!(frame_length(&[0x30, 0x03], 5), Ok(Some(5)));
        assert!(frame_length(&[0x30, 0x04], 5).is_err());
        assert_eq!(
            frame_length(&[0x30, 0x82, 0x00, 0x05], usize::MAX),
            Err(DecodeError::NonMinimalLength(0x82))
        );
    }

    #[test]
    fn test_decode_rejects_non_minimal_lengths() {
        assert_eq!(
            BerElement::decode(&[0x04, 0x81, 0x03, b'a', b'b', b'c']),
            Err(DecodeError::NonMinimalLength(0x81))
        );
        assert_eq!(
            BerElement::decode(&[0x04, 0x82, 0x00, 0x05, b'a', b'b', b'c', b'd', b'e']),
            Err(DecodeError::NonMinimalLength(0x82))
        );
        assert_eq!(BerElement::decode(&[0x04, 0x81, 0x00]), Err(DecodeError::NonMinimalLength(0x81)));

        // nested elements are held to the same rule
        let inner = [0x04, 0x81, 0x01, b'x'];
        let mut outer = vec![0x30, inner.len() as u8];
        outer.extend_from_slice(&inner);
        let seq = BerElement::decode(&outer).unwrap();
        assert_eq!(seq.children(), Err(DecodeError::NonMinimalLength(0x81)));

        let minimal = BerElement::octet_string(vec![b'z'; 128]).encode();
        assert_eq!(BerElement::decode(&minimal).unwrap().encode(), minimal);
    }

    #[test]
    fn test_is_printable() {
        assert!(is_printable(b"cn=John Doe, ou=People"));
        assert!(!is_printable(&[0x00, 0x41]));
        assert!(!is_printable("привет".as_bytes()));
        assert!(is_printable(b""));
    }

    #[test]
    fn test_boolean_values() {
        let mut w = BerWriter::new();
        w.write_boolean(true);
        w.write_boolean(false);
        assert_eq!(w.into_vec(), vec![0x01, 0x01, 0xFF, 0x01, 0x01, 0x00]);
        assert!(BerElement::new(TAG_BOOLEAN, vec![0, 0]).as_boolean().is_err());
    }
}
