//! Binary wire encoding of [`Value`]
//!
//! One tag byte followed by the payload, little-endian. Container counts and
//! string lengths are `u32`. Map and table entries are written in ascending key
//! order, and the decoder rejects any other order.
//!
//! Encoding measures first and writes nothing if the value does not fit or
//! nests deeper than [`MAX_DEPTH`]; decoding never returns a partially built
//! value. Anything the encoder accepts, the decoder accepts.

use crate::error::{LinkError, Result};
use crate::value::{Tag, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deepest container nesting the encoder and decoder accept
pub const MAX_DEPTH: usize = 128;

/// Encoded size, or [`LinkError::TooDeep`] for nesting the decoder would
/// refuse
pub fn checked_len(value: &Value) -> Result<usize> {
    measure(value, 0)
}

fn measure(value: &Value, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(LinkError::TooDeep(MAX_DEPTH));
    }
    let body = match value {
        Value::Map(d) | Value::Table(d) => {
            let mut n = 4;
            for (k, v) in d.iter() {
                n += 4 + k.len() + measure(v, depth + 1)?;
            }
            n
        }
        Value::Vector(s) | Value::Array(s) => {
            let mut n = 4;
            for v in s.iter() {
                n += measure(v, depth + 1)?;
            }
            n
        }
        scalar => return Ok(encoded_len(scalar)),
    };
    Ok(1 + body)
}

/// Exact number of bytes [`encode`] will produce for `value`
///
/// Does not check nesting depth.
pub fn encoded_len(value: &Value) -> usize {
    1 + match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Int8(_) | Value::UInt8(_) => 1,
        Value::Int16(_) | Value::UInt16(_) => 2,
        Value::Int32(_) | Value::UInt32(_) | Value::Float32(_) => 4,
        Value::Int64(_) | Value::UInt64(_) | Value::Float64(_) => 8,
        Value::String(s) => 4 + s.len(),
        Value::Map(d) | Value::Table(d) => {
            4 + d
                .iter()
                .map(|(k, v)| 4 + k.len() + encoded_len(v))
                .sum::<usize>()
        }
        Value::Vector(s) | Value::Array(s) => 4 + s.iter().map(encoded_len).sum::<usize>(),
        other => 4 * other.as_floats().map_or(0, <[f32]>::len),
    }
}

/// Encode into a new buffer
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(measure(value, 0)?);
    write_value(value, &mut out);
    Ok(out)
}

/// Encode into a fixed-capacity destination, returning the bytes written
pub fn encode_into(value: &Value, dst: &mut [u8]) -> Result<usize> {
    let needed = measure(value, 0)?;
    if needed > dst.len() {
        return Err(LinkError::BufferOverflow {
            max: dst.len(),
            got: needed,
        });
    }
    let mut out = SliceWriter { buf: dst, pos: 0 };
    write_value(value, &mut out);
    debug_assert_eq!(out.pos, needed);
    Ok(out.pos)
}

/// Decode exactly one value spanning all of `bytes`
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = reader.value(0)?;
    let rest = bytes.len() - reader.pos;
    if rest != 0 {
        return Err(LinkError::TrailingBytes(rest));
    }
    Ok(value)
}

/// Decode one value from the front of `bytes`, returning it with the number
/// of bytes consumed
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize)> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = reader.value(0)?;
    Ok((value, reader.pos))
}

trait Sink {
    fn put(&mut self, bytes: &[u8]);
}

impl Sink for Vec<u8> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Writer over a slice already checked to be large enough
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Sink for SliceWriter<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

fn put_str<S: Sink>(s: &str, out: &mut S) {
    out.put(&(s.len() as u32).to_le_bytes());
    out.put(s.as_bytes());
}

fn write_value<S: Sink>(value: &Value, out: &mut S) {
    out.put(&[value.tag() as u8]);
    match value {
        Value::Null => {}
        Value::Bool(b) => out.put(&[*b as u8]),
        Value::Int8(v) => out.put(&v.to_le_bytes()),
        Value::Int16(v) => out.put(&v.to_le_bytes()),
        Value::Int32(v) => out.put(&v.to_le_bytes()),
        Value::Int64(v) => out.put(&v.to_le_bytes()),
        Value::UInt8(v) => out.put(&v.to_le_bytes()),
        Value::UInt16(v) => out.put(&v.to_le_bytes()),
        Value::UInt32(v) => out.put(&v.to_le_bytes()),
        Value::UInt64(v) => out.put(&v.to_le_bytes()),
        Value::Float32(v) => out.put(&v.to_le_bytes()),
        Value::Float64(v) => out.put(&v.to_le_bytes()),
        Value::String(s) => put_str(s, out),
        Value::Map(d) | Value::Table(d) => {
            out.put(&(d.len() as u32).to_le_bytes());
            for (k, v) in d.iter() {
                put_str(k, out);
                write_value(v, out);
            }
        }
        Value::Vector(s) | Value::Array(s) => {
            out.put(&(s.len() as u32).to_le_bytes());
            for v in s.iter() {
                write_value(v, out);
            }
        }
        other => {
            for f in other.as_floats().unwrap_or(&[]) {
                out.put(&f.to_le_bytes());
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(LinkError::Truncated {
                offset: self.pos,
                needed: n,
            }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<&'a str> {
        let len = self.u32()? as usize;
        let start = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| LinkError::InvalidUtf8(start))
    }

    fn floats<const N: usize>(&mut self) -> Result<[f32; N]> {
        let mut out = [0f32; N];
        for f in out.iter_mut() {
            *f = f32::from_le_bytes(self.array()?);
        }
        Ok(out)
    }

    /// Count prefix, refusing counts the remaining input cannot possibly hold
    fn count(&mut self, min_entry: usize) -> Result<usize> {
        let at = self.pos;
        let n = self.u32()? as usize;
        let remaining = self.buf.len() - self.pos;
        if n.saturating_mul(min_entry) > remaining {
            return Err(LinkError::Truncated {
                offset: at,
                needed: n.saturating_mul(min_entry),
            });
        }
        Ok(n)
    }

    fn dict(&mut self, depth: usize) -> Result<BTreeMap<String, Value>> {
        let n = self.count(5)?;
        let mut entries: BTreeMap<String, Value> = BTreeMap::new();
        for _ in 0..n {
            let key = self.string()?;
            match entries.last_key_value() {
                Some((last, _)) if last.as_str() == key => {
                    return Err(LinkError::DuplicateKey(key.to_string()))
                }
                Some((last, _)) if last.as_str() > key => {
                    return Err(LinkError::UnorderedKeys(key.to_string()))
                }
                _ => {}
            }
            let value = self.value(depth + 1)?;
            entries.insert(key.to_string(), value);
        }
        Ok(entries)
    }

    fn seq(&mut self, depth: usize) -> Result<Vec<Value>> {
        let n = self.count(1)?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.value(depth + 1)?);
        }
        Ok(items)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(LinkError::TooDeep(MAX_DEPTH));
        }
        let [byte] = self.array::<1>()?;
        let tag = Tag::from_u8(byte).ok_or(LinkError::UnknownTag(byte))?;
        Ok(match tag {
            Tag::Null => Value::Null,
            Tag::Bool => Value::Bool(self.array::<1>()?[0] != 0),
            Tag::Int8 => Value::Int8(i8::from_le_bytes(self.array()?)),
            Tag::Int16 => Value::Int16(i16::from_le_bytes(self.array()?)),
            Tag::Int32 => Value::Int32(i32::from_le_bytes(self.array()?)),
            Tag::Int64 => Value::Int64(i64::from_le_bytes(self.array()?)),
            Tag::UInt8 => Value::UInt8(u8::from_le_bytes(self.array()?)),
            Tag::UInt16 => Value::UInt16(u16::from_le_bytes(self.array()?)),
            Tag::UInt32 => Value::UInt32(u32::from_le_bytes(self.array()?)),
            Tag::UInt64 => Value::UInt64(u64::from_le_bytes(self.array()?)),
            Tag::Float32 => Value::Float32(f32::from_le_bytes(self.array()?)),
            Tag::Float64 => Value::Float64(f64::from_le_bytes(self.array()?)),
            Tag::String => Value::from(self.string()?),
            Tag::Vec2 => Value::Vec2(self.floats()?),
            Tag::Vec3 => Value::Vec3(self.floats()?),
            Tag::Vec4 => Value::Vec4(self.floats()?),
            Tag::Mat3 => Value::Mat3(self.floats()?),
            Tag::Mat4x3 => Value::Mat4x3(self.floats()?),
            Tag::Mat4 => Value::Mat4(self.floats()?),
            Tag::Map => Value::Map(Arc::new(self.dict(depth)?)),
            Tag::Table => Value::Table(Arc::new(self.dict(depth)?)),
            Tag::Vector => Value::Vector(Arc::new(self.seq(depth)?)),
            Tag::Array => Value::Array(Arc::new(self.seq(depth)?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wire(v: &Value) -> Vec<u8> {
        encode(v).unwrap()
    }

    fn nested(levels: usize) -> Value {
        (0..levels).fold(Value::Null, |inner, _| vec![inner].into())
    }

    fn scene() -> Value {
        let mesh = Value::map()
            .with("name", "cube".into())
            .unwrap()
            .with("verts", Value::array(vec![Value::Vec3([0.0, 1.0, 2.0]); 3]))
            .unwrap()
            .with("xform", Value::Mat4x3([0.5; 12]))
            .unwrap();
        let meshes = Value::table().with("m1", mesh).unwrap();
        let layers: Value = vec![meshes, Value::Null, Value::Int8(-3)].into();
        Value::map().with("layers", layers).unwrap()
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(wire(&Value::Null), [0x00]);
        assert_eq!(wire(&Value::Int32(1)), [0x01, 1, 0, 0, 0]);
        assert_eq!(wire(&Value::Bool(true)), [0x04, 1]);
        assert_eq!(wire(&Value::from("hi")), [0x05, 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(wire(&Value::UInt16(0x0102)), [0x0E, 0x02, 0x01]);
        assert_eq!(wire(&Value::UInt64(1))[0], 0x16);
        assert_eq!(wire(&Value::Vec2([1.0, 2.0])).len(), 9);
        assert_eq!(wire(&Value::Mat4([0.0; 16])).len(), 65);

        let map: Value = [("a", Value::Null)].into_iter().collect();
        assert_eq!(
            wire(&map),
            [0x06, 1, 0, 0, 0, 1, 0, 0, 0, b'a', 0x00]
        );
    }

    #[test]
    fn test_nested_roundtrip() {
        let v = scene();
        let bytes = encode(&v).unwrap();
        assert_eq!(bytes.len(), encoded_len(&v));
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn test_encode_into_overflow_writes_nothing() {
        let v = scene();
        let mut small = vec![0xAAu8; encoded_len(&v) - 1];
        let err = encode_into(&v, &mut small).unwrap_err();
        assert!(matches!(err, LinkError::BufferOverflow { .. }));
        assert!(small.iter().all(|&b| b == 0xAA));

        let mut exact = vec![0u8; encoded_len(&v)];
        assert_eq!(encode_into(&v, &mut exact).unwrap(), exact.len());
        assert_eq!(decode(&exact).unwrap(), v);
    }

    #[test]
    fn test_truncated_and_bad_input() {
        let bytes = wire(&scene());
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(LinkError::Truncated { .. })
            ));
        }
        assert!(matches!(decode(&[0x42]), Err(LinkError::UnknownTag(0x42))));
        assert!(matches!(
            decode(&[0x05, 1, 0, 0, 0, 0xFF]),
            Err(LinkError::InvalidUtf8(5))
        ));
        assert!(matches!(decode(&[0x00, 0x00]), Err(LinkError::TrailingBytes(1))));
        // Claims a billion entries with nothing behind it
        assert!(matches!(
            decode(&[0x07, 0x00, 0xCA, 0x9A, 0x3B]),
            Err(LinkError::Truncated { .. })
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let bytes = [
            0x06, 2, 0, 0, 0, 1, 0, 0, 0, b'k', 0x00, 1, 0, 0, 0, b'k', 0x00,
        ];
        assert!(matches!(decode(&bytes), Err(LinkError::DuplicateKey(k)) if k == "k"));
    }

    #[test]
    fn test_descending_keys_rejected() {
        let bytes = [
            0x06, 2, 0, 0, 0, 1, 0, 0, 0, b'b', 0x00, 1, 0, 0, 0, b'a', 0x00,
        ];
        assert!(matches!(decode(&bytes), Err(LinkError::UnorderedKeys(k)) if k == "a"));
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_DEPTH + 1 {
            bytes.extend_from_slice(&[0x07, 1, 0, 0, 0]);
        }
        bytes.push(0x00);
        assert!(matches!(decode(&bytes), Err(LinkError::TooDeep(_))));
    }

    #[test]
    fn test_encoder_refuses_what_decoder_would() {
        let deepest = nested(MAX_DEPTH);
        assert_eq!(decode(&wire(&deepest)).unwrap(), deepest);

        let too_deep = nested(MAX_DEPTH + 1);
        assert!(matches!(encode(&too_deep), Err(LinkError::TooDeep(MAX_DEPTH))));
        let mut buf = vec![0xAAu8; encoded_len(&too_deep)];
        assert!(matches!(
            encode_into(&too_deep, &mut buf),
            Err(LinkError::TooDeep(_))
        ));
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_math_roundtrip() {
        let math: Value = vec![
            Value::Vec2([1.0, -2.0]),
            Value::Vec3([0.5, 1.5, 2.5]),
            Value::Vec4([1.0, 2.0, 3.0, 4.0]),
            Value::Mat3([3.0; 9]),
            Value::Mat4x3([4.0; 12]),
            Value::Mat4([5.0; 16]),
        ]
        .into();
        let bytes = wire(&math);
        assert_eq!(bytes.len(), 1 + 4 + 6 + 4 * (2 + 3 + 4 + 9 + 12 + 16));
        assert_eq!(decode(&bytes).unwrap(), math);
    }

    #[test]
    fn test_decode_prefix() {
        let mut bytes = wire(&Value::Int64(-9));
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let (v, used) = decode_prefix(&bytes).unwrap();
        assert_eq!(v, Value::Int64(-9));
        assert_eq!(used, 9);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i8>().prop_map(Value::Int8),
            any::<i16>().prop_map(Value::Int16),
            any::<i32>().prop_map(Value::Int32),
            any::<i64>().prop_map(Value::Int64),
            any::<u8>().prop_map(Value::UInt8),
            any::<u16>().prop_map(Value::UInt16),
            any::<u32>().prop_map(Value::UInt32),
            any::<u64>().prop_map(Value::UInt64),
            (-1e6f32..1e6).prop_map(Value::Float32),
            (-1e12f64..1e12).prop_map(Value::Float64),
            ".{0,12}".prop_map(Value::from),
            prop::array::uniform2(-1e3f32..1e3).prop_map(Value::Vec2),
            prop::array::uniform3(-1e3f32..1e3).prop_map(Value::Vec3),
            prop::array::uniform4(-1e3f32..1e3).prop_map(Value::Vec4),
            prop::array::uniform9(-1e3f32..1e3).prop_map(Value::Mat3),
            prop::array::uniform12(-1e3f32..1e3).prop_map(Value::Mat4x3),
            prop::array::uniform16(-1e3f32..1e3).prop_map(Value::Mat4),
        ];
        leaf.prop_recursive(4, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::array),
                prop::collection::btree_map("[a-z]{1,6}", inner.clone(), 0..5)
                    .prop_map(|m| Value::Map(Arc::new(m))),
                prop::collection::btree_map("[0-9a-f]{4}", inner, 0..5)
                    .prop_map(|m| Value::Table(Arc::new(m))),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(v in arb_value()) {
            let bytes = encode(&v).unwrap();
            prop_assert_eq!(bytes.len(), encoded_len(&v));
            prop_assert_eq!(decode(&bytes).unwrap(), v);
        }
    }
}
