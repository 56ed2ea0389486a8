//! MessagePack-subset value codec.
//!
//! Encodes and decodes the value kinds LTX frames are built from:
//! unsigned integers, UTF-8 strings, binary blobs, nil, and arrays.
//! Only the shortest legal encoding of each value is ever produced, and
//! only the shortest legal encoding is ever accepted on decode — a wider
//! tag than necessary is a protocol violation, not "extra robustness".

use bytes::{BufMut, BytesMut};

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Uint(u64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

// -- Tag bytes --

const NIL: u8 = 0xc0;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;

const FIXINT_MAX: u64 = 0x7f;
const FIXSTR_MASK: u8 = 0xa0;
const FIXSTR_MAX_LEN: usize = 31;
const FIXARRAY_MASK: u8 = 0x90;
const FIXARRAY_MAX_LEN: usize = 15;

/// Outcome of attempting to decode one value from the front of a buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A complete value, and the number of bytes it consumed.
    Complete(Value, usize),
    /// Not enough bytes yet to determine or finish the value.
    Incomplete,
    /// The leading tag byte is not a recognized, canonical tag. Unlike
    /// `Incomplete`, more bytes will never fix this — it is a protocol
    /// violation, not a pause point.
    InvalidTag(u8),
    /// The tag byte is recognized, but a narrower tag could have encoded
    /// the same value — e.g. `UINT8` carrying a value that fits in a
    /// fixint. Same non-recoverable status as `InvalidTag`.
    NonCanonical(u8),
}

/// Encode a value onto the output buffer using the narrowest legal tag.
pub fn encode(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Nil => out.put_u8(NIL),
        Value::Uint(v) => encode_uint(*v, out),
        Value::Str(s) => encode_str(s, out),
        Value::Bin(b) => encode_bin(b, out),
        Value::Array(items) => {
            encode_array_header(items.len(), out);
            for item in items {
                encode(item, out);
            }
        }
    }
}

fn encode_uint(v: u64, out: &mut BytesMut) {
    if v <= FIXINT_MAX {
        out.put_u8(v as u8);
    } else if v <= u8::MAX as u64 {
        out.put_u8(UINT8);
        out.put_u8(v as u8);
    } else if v <= u16::MAX as u64 {
        out.put_u8(UINT16);
        out.put_u16(v as u16);
    } else if v <= u32::MAX as u64 {
        out.put_u8(UINT32);
        out.put_u32(v as u32);
    } else {
        out.put_u8(UINT64);
        out.put_u64(v);
    }
}

fn encode_str(s: &str, out: &mut BytesMut) {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len <= FIXSTR_MAX_LEN {
        out.put_u8(FIXSTR_MASK | len as u8);
    } else if len <= u8::MAX as usize {
        out.put_u8(STR8);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(STR16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(STR32);
        out.put_u32(len as u32);
    }
    out.put_slice(bytes);
}

fn encode_bin(b: &[u8], out: &mut BytesMut) {
    let len = b.len();
    if len <= u8::MAX as usize {
        out.put_u8(BIN8);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(BIN16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(BIN32);
        out.put_u32(len as u32);
    }
    out.put_slice(b);
}

/// Encode just an array length header (used by the framer to write
/// message headers without building an intermediate `Value::Array`).
pub fn encode_array_header(len: usize, out: &mut BytesMut) {
    if len <= FIXARRAY_MAX_LEN {
        out.put_u8(FIXARRAY_MASK | len as u8);
    } else {
        out.put_u8(ARRAY16);
        out.put_u16(len as u16);
    }
}

/// Decode one value from the front of `buf`. Never panics on short
/// input; returns [`Decoded::Incomplete`] instead.
pub fn decode(buf: &[u8]) -> Decoded {
    let Some(&tag) = buf.first() else {
        return Decoded::Incomplete;
    };

    match tag {
        NIL => Decoded::Complete(Value::Nil, 1),
        t if t <= FIXINT_MAX as u8 => Decoded::Complete(Value::Uint(t as u64), 1),
        UINT8 => canonical_uint(read_uint(buf, 1, 1, |b| b[0] as u64), tag, |v| v > FIXINT_MAX),
        UINT16 => canonical_uint(
            read_uint(buf, 1, 2, |b| u16::from_be_bytes([b[0], b[1]]) as u64),
            tag,
            |v| v > u8::MAX as u64,
        ),
        UINT32 => canonical_uint(
            read_uint(buf, 1, 4, |b| {
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
            }),
            tag,
            |v| v > u16::MAX as u64,
        ),
        UINT64 => canonical_uint(
            read_uint(buf, 1, 8, |b| {
                u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }),
            tag,
            |v| v > u32::MAX as u64,
        ),
        t if (FIXSTR_MASK..FIXSTR_MASK + 0x20).contains(&t) => {
            let len = (t & 0x1f) as usize;
            read_str(buf, 1, len)
        }
        STR8 => canonical_str(
            read_len_prefixed(buf, 1, 1, |b| b[0] as usize, |len, body| str_from(body, len)),
            tag,
            |len| len > FIXSTR_MAX_LEN,
        ),
        STR16 => canonical_str(
            read_len_prefixed(
                buf,
                1,
                2,
                |b| u16::from_be_bytes([b[0], b[1]]) as usize,
                |len, body| str_from(body, len),
            ),
            tag,
            |len| len > u8::MAX as usize,
        ),
        STR32 => canonical_str(
            read_len_prefixed(
                buf,
                1,
                4,
                |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize,
                |len, body| str_from(body, len),
            ),
            tag,
            |len| len > u16::MAX as usize,
        ),
        BIN8 => read_len_prefixed(buf, 1, 1, |b| b[0] as usize, |len, body| {
            Some(Value::Bin(body[..len].to_vec()))
        }),
        BIN16 => canonical_bin(
            read_len_prefixed(
                buf,
                1,
                2,
                |b| u16::from_be_bytes([b[0], b[1]]) as usize,
                |len, body| Some(Value::Bin(body[..len].to_vec())),
            ),
            tag,
            |len| len > u8::MAX as usize,
        ),
        BIN32 => canonical_bin(
            read_len_prefixed(
                buf,
                1,
                4,
                |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize,
                |len, body| Some(Value::Bin(body[..len].to_vec())),
            ),
            tag,
            |len| len > u16::MAX as usize,
        ),
        t if (FIXARRAY_MASK..FIXARRAY_MASK + 0x10).contains(&t) => {
            let len = (t & 0x0f) as usize;
            decode_array(buf, 1, len)
        }
        ARRAY16 => {
            if buf.len() < 3 {
                return Decoded::Incomplete;
            }
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if len <= FIXARRAY_MAX_LEN {
                return Decoded::NonCanonical(ARRAY16);
            }
            decode_array(buf, 3, len)
        }
        other => Decoded::InvalidTag(other),
    }
}

/// Demote a completed uint decode to [`Decoded::NonCanonical`] if a
/// narrower tag could have represented the same value.
fn canonical_uint(d: Decoded, tag: u8, is_canonical: impl Fn(u64) -> bool) -> Decoded {
    match d {
        Decoded::Complete(Value::Uint(v), _) if !is_canonical(v) => Decoded::NonCanonical(tag),
        other => other,
    }
}

/// Demote a completed str decode to [`Decoded::NonCanonical`] if a
/// narrower tag could have represented the same length.
fn canonical_str(d: Decoded, tag: u8, is_canonical: impl Fn(usize) -> bool) -> Decoded {
    match d {
        Decoded::Complete(Value::Str(ref s), _) if !is_canonical(s.len()) => {
            Decoded::NonCanonical(tag)
        }
        other => other,
    }
}

/// Demote a completed bin decode to [`Decoded::NonCanonical`] if a
/// narrower tag could have represented the same length.
fn canonical_bin(d: Decoded, tag: u8, is_canonical: impl Fn(usize) -> bool) -> Decoded {
    match d {
        Decoded::Complete(Value::Bin(ref b), _) if !is_canonical(b.len()) => {
            Decoded::NonCanonical(tag)
        }
        other => other,
    }
}

fn read_uint(buf: &[u8], header: usize, width: usize, f: impl Fn(&[u8]) -> u64) -> Decoded {
    if buf.len() < header + width {
        return Decoded::Incomplete;
    }
    Decoded::Complete(Value::Uint(f(&buf[header..header + width])), header + width)
}

fn read_str(buf: &[u8], header: usize, len: usize) -> Decoded {
    if buf.len() < header + len {
        return Decoded::Incomplete;
    }
    match str_from(&buf[header..], len) {
        Some(v) => Decoded::Complete(v, header + len),
        None => Decoded::Incomplete,
    }
}

fn str_from(body: &[u8], len: usize) -> Option<Value> {
    std::str::from_utf8(&body[..len]).ok().map(|s| Value::Str(s.to_owned()))
}

fn read_len_prefixed(
    buf: &[u8],
    header: usize,
    len_width: usize,
    len_of: impl Fn(&[u8]) -> usize,
    build: impl Fn(usize, &[u8]) -> Option<Value>,
) -> Decoded {
    if buf.len() < header + len_width {
        return Decoded::Incomplete;
    }
    let len = len_of(&buf[header..header + len_width]);
    let body_start = header + len_width;
    if buf.len() < body_start + len {
        return Decoded::Incomplete;
    }
    match build(len, &buf[body_start..]) {
        Some(v) => Decoded::Complete(v, body_start + len),
        None => Decoded::Incomplete,
    }
}

fn decode_array(buf: &[u8], header: usize, len: usize) -> Decoded {
    let mut items = Vec::with_capacity(len);
    let mut pos = header;
    for _ in 0..len {
        match decode(&buf[pos..]) {
            Decoded::Complete(v, n) => {
                items.push(v);
                pos += n;
            }
            Decoded::Incomplete => return Decoded::Incomplete,
            Decoded::InvalidTag(t) => return Decoded::InvalidTag(t),
            Decoded::NonCanonical(t) => return Decoded::NonCanonical(t),
        }
    }
    Decoded::Complete(Value::Array(items), pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let mut buf = BytesMut::new();
        encode(&v, &mut buf);
        match decode(&buf) {
            Decoded::Complete(decoded, n) => {
                assert_eq!(decoded, v);
                assert_eq!(n, buf.len());
            }
            other => panic!("expected complete decode of {v:?}, got a non-Complete result instead ({other:?})"),
        }
    }

    #[test]
    fn nil_roundtrip() {
        roundtrip(Value::Nil);
    }

    #[test]
    fn fixint_uses_single_byte() {
        let mut buf = BytesMut::new();
        encode(&Value::Uint(42), &mut buf);
        assert_eq!(buf.as_ref(), &[42]);
    }

    #[test]
    fn uint_picks_narrowest_tag() {
        let cases: &[(u64, u8)] = &[
            (0, 0),
            (127, 127),
            (128, UINT8),
            (255, UINT8),
            (256, UINT16),
            (65535, UINT16),
            (65536, UINT32),
            (u32::MAX as u64, UINT32),
            (u32::MAX as u64 + 1, UINT64),
            (u64::MAX, UINT64),
        ];
        for &(v, expected_tag) in cases {
            let mut buf = BytesMut::new();
            encode(&Value::Uint(v), &mut buf);
            if v <= FIXINT_MAX {
                assert_eq!(buf[0], expected_tag);
            } else {
                assert_eq!(buf[0], expected_tag);
            }
            roundtrip(Value::Uint(v));
        }
    }

    #[test]
    fn fixstr_boundary() {
        let s31 = "a".repeat(31);
        let s32 = "a".repeat(32);
        let mut buf = BytesMut::new();
        encode(&Value::Str(s31.clone()), &mut buf);
        assert_eq!(buf[0], FIXSTR_MASK | 31);

        let mut buf32 = BytesMut::new();
        encode(&Value::Str(s32.clone()), &mut buf32);
        assert_eq!(buf32[0], STR8);

        roundtrip(Value::Str(s31));
        roundtrip(Value::Str(s32));
    }

    #[test]
    fn bin_roundtrip() {
        roundtrip(Value::Bin(vec![1, 2, 3]));
        roundtrip(Value::Bin((0..=255).collect()));
    }

    #[test]
    fn array_roundtrip() {
        roundtrip(Value::Array(vec![
            Value::Uint(0),
            Value::Str("ping".into()),
            Value::Nil,
        ]));
    }

    #[test]
    fn fixarray_boundary() {
        let items15: Vec<Value> = (0..15).map(Value::Uint).collect();
        let items16: Vec<Value> = (0..16).map(Value::Uint).collect();
        let mut buf = BytesMut::new();
        encode(&Value::Array(items15.clone()), &mut buf);
        assert_eq!(buf[0], FIXARRAY_MASK | 15);

        let mut buf16 = BytesMut::new();
        encode(&Value::Array(items16.clone()), &mut buf16);
        assert_eq!(buf16[0], ARRAY16);

        roundtrip(Value::Array(items15));
        roundtrip(Value::Array(items16));
    }

    #[test]
    fn incomplete_on_truncated_header() {
        assert!(matches!(decode(&[UINT16, 0x01]), Decoded::Incomplete));
        assert!(matches!(decode(&[]), Decoded::Incomplete));
    }

    #[test]
    fn unrecognized_tag_is_invalid_not_incomplete() {
        // 0xc1 is unassigned in this value-kind subset.
        assert!(matches!(decode(&[0xc1]), Decoded::InvalidTag(0xc1)));
    }

    #[test]
    fn incomplete_on_truncated_body() {
        let mut buf = BytesMut::new();
        encode(&Value::Str("hello world".into()), &mut buf);
        let truncated = &buf[..buf.len() - 2];
        assert!(matches!(decode(truncated), Decoded::Incomplete));
    }

    #[test]
    fn non_canonical_uint8_is_rejected() {
        // UINT8 tag carrying 5, which fits in a fixint.
        assert!(matches!(
            decode(&[UINT8, 0x05]),
            Decoded::NonCanonical(UINT8)
        ));
    }

    #[test]
    fn non_canonical_uint16_is_rejected() {
        assert!(matches!(
            decode(&[UINT16, 0x00, 0xff]),
            Decoded::NonCanonical(UINT16)
        ));
    }

    #[test]
    fn non_canonical_str8_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(STR8);
        buf.put_u8(3);
        buf.put_slice(b"abc");
        assert!(matches!(decode(&buf), Decoded::NonCanonical(STR8)));
    }

    #[test]
    fn non_canonical_str16_is_rejected() {
        let s = "a".repeat(32);
        let mut buf = BytesMut::new();
        buf.put_u8(STR16);
        buf.put_u16(s.len() as u16);
        buf.put_slice(s.as_bytes());
        assert!(matches!(decode(&buf), Decoded::NonCanonical(STR16)));
    }

    #[test]
    fn non_canonical_bin16_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(BIN16);
        buf.put_u16(3);
        buf.put_slice(b"abc");
        assert!(matches!(decode(&buf), Decoded::NonCanonical(BIN16)));
    }

    #[test]
    fn bin8_has_no_narrower_alternative() {
        // There is no fixbin tag, so BIN8 is always canonical regardless
        // of how small the length is.
        let mut buf = BytesMut::new();
        buf.put_u8(BIN8);
        buf.put_u8(1);
        buf.put_slice(b"x");
        assert!(matches!(decode(&buf), Decoded::Complete(Value::Bin(_), _)));
    }

    #[test]
    fn non_canonical_array16_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(ARRAY16);
        buf.put_u16(2);
        encode(&Value::Uint(0), &mut buf);
        encode(&Value::Uint(1), &mut buf);
        assert!(matches!(decode(&buf), Decoded::NonCanonical(ARRAY16)));
    }

    #[test]
    fn non_canonical_nested_value_propagates_through_array() {
        let mut buf = BytesMut::new();
        encode_array_header(1, &mut buf);
        buf.put_u8(UINT8);
        buf.put_u8(1);
        assert!(matches!(decode(&buf), Decoded::NonCanonical(UINT8)));
    }

    #[test]
    fn s1_ping_bytes() {
        // A Ping frame is exactly `91 00`.
        let mut buf = BytesMut::new();
        encode(
            &Value::Array(vec![Value::Uint(0)]),
            &mut buf,
        );
        assert_eq!(buf.as_ref(), &[0x91, 0x00]);
    }
}
