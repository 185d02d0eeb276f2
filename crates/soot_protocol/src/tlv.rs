//! TLV (Type-Length-Value) binary codec.
//!
//! Typed, length-prefixed serialization for protocol payloads.
//!
//! Type codes:
//! ```text
//! 0x00  none    (no value bytes)
//! 0x01  bool    (1 byte: 0x00 or 0x01)
//! 0x05  int64   (8 bytes big-endian signed)
//! 0x06  float64 (8 bytes IEEE 754)
//! 0x10  bytes   (4-byte length + raw bytes)
//! 0x11  string  (4-byte length + UTF-8 bytes)
//! 0x20  list    (4-byte count + encoded elements)
//! 0x21  dict    (4-byte count + (string key, value) pairs)
//! ```
//!
//! Decoding is strict: truncated input, trailing bytes after the top-level
//! value, invalid UTF-8 and non-string dict keys are all errors.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::collections::BTreeMap;

use crate::error::ProtocolError;

pub const TYPE_NONE: u8 = 0x00;
pub const TYPE_BOOL: u8 = 0x01;
pub const TYPE_INT64: u8 = 0x05;
pub const TYPE_FLOAT64: u8 = 0x06;
pub const TYPE_BYTES: u8 = 0x10;
pub const TYPE_STRING: u8 = 0x11;
pub const TYPE_LIST: u8 = 0x20;
pub const TYPE_DICT: u8 = 0x21;

/// Hard cap for a single string or bytes value (64 MiB).
pub const MAX_STRING_SIZE: usize = 64 * 1024 * 1024;
/// Hard cap for list/dict cardinality.
pub const MAX_CONTAINER_LEN: usize = 1024 * 1024;

/// A TLV-representable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::Float(_) => "float64",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dict field access; `None` for non-dicts and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(map) => map.get(key),
            _ => None,
        }
    }

    /// An empty dict, the payload of zero-length frames.
    pub fn empty_dict() -> Value {
        Value::Dict(BTreeMap::new())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(map)
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Value::Dict(iter.into_iter().collect())
    }
}

/// Encode a value to TLV bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match value {
        Value::Null => buf.write_u8(TYPE_NONE)?,
        Value::Bool(b) => {
            buf.write_u8(TYPE_BOOL)?;
            buf.write_u8(if *b { 0x01 } else { 0x00 })?;
        }
        Value::Int(n) => {
            buf.write_u8(TYPE_INT64)?;
            buf.write_i64::<BigEndian>(*n)?;
        }
        Value::Float(f) => {
            buf.write_u8(TYPE_FLOAT64)?;
            buf.write_f64::<BigEndian>(*f)?;
        }
        Value::Bytes(b) => {
            if b.len() > MAX_STRING_SIZE {
                return Err(ProtocolError::ValueTooLarge {
                    what: "bytes",
                    size: b.len(),
                    max: MAX_STRING_SIZE,
                });
            }
            buf.write_u8(TYPE_BYTES)?;
            buf.write_u32::<BigEndian>(b.len() as u32)?;
            buf.extend_from_slice(b);
        }
        Value::Str(s) => {
            if s.len() > MAX_STRING_SIZE {
                return Err(ProtocolError::ValueTooLarge {
                    what: "string",
                    size: s.len(),
                    max: MAX_STRING_SIZE,
                });
            }
            buf.write_u8(TYPE_STRING)?;
            buf.write_u32::<BigEndian>(s.len() as u32)?;
            buf.extend_from_slice(s.as_bytes());
        }
        Value::List(items) => {
            if items.len() > MAX_CONTAINER_LEN {
                return Err(ProtocolError::ValueTooLarge {
                    what: "list",
                    size: items.len(),
                    max: MAX_CONTAINER_LEN,
                });
            }
            buf.write_u8(TYPE_LIST)?;
            buf.write_u32::<BigEndian>(items.len() as u32)?;
            for item in items {
                encode_into(item, buf)?;
            }
        }
        Value::Dict(map) => {
            if map.len() > MAX_CONTAINER_LEN {
                return Err(ProtocolError::ValueTooLarge {
                    what: "dict",
                    size: map.len(),
                    max: MAX_CONTAINER_LEN,
                });
            }
            buf.write_u8(TYPE_DICT)?;
            buf.write_u32::<BigEndian>(map.len() as u32)?;
            for (key, val) in map {
                encode_into(&Value::Str(key.clone()), buf)?;
                encode_into(val, buf)?;
            }
        }
    }
    Ok(())
}

/// Decode a complete TLV value, requiring all input to be consumed.
pub fn decode(data: &[u8]) -> Result<Value, ProtocolError> {
    let mut dec = Decoder { data, pos: 0 };
    let value = dec.value()?;
    if dec.pos != data.len() {
        return Err(ProtocolError::TrailingData {
            remaining: data.len() - dec.pos,
        });
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.data.len() {
            return Err(ProtocolError::Truncated { context });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self, context: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, context)?[0])
    }

    fn take_len(&mut self, context: &'static str) -> Result<usize, ProtocolError> {
        Ok(BigEndian::read_u32(self.take(4, context)?) as usize)
    }

    fn value(&mut self) -> Result<Value, ProtocolError> {
        let tag = self.take_u8("type tag")?;
        match tag {
            TYPE_NONE => Ok(Value::Null),
            TYPE_BOOL => Ok(Value::Bool(self.take_u8("bool value")? != 0x00)),
            TYPE_INT64 => Ok(Value::Int(BigEndian::read_i64(self.take(8, "int64")?))),
            TYPE_FLOAT64 => Ok(Value::Float(BigEndian::read_f64(self.take(8, "float64")?))),
            TYPE_BYTES => {
                let len = self.take_len("bytes length")?;
                if len > MAX_STRING_SIZE {
                    return Err(ProtocolError::ValueTooLarge {
                        what: "bytes",
                        size: len,
                        max: MAX_STRING_SIZE,
                    });
                }
                Ok(Value::Bytes(self.take(len, "bytes data")?.to_vec()))
            }
            TYPE_STRING => {
                let len = self.take_len("string length")?;
                if len > MAX_STRING_SIZE {
                    return Err(ProtocolError::ValueTooLarge {
                        what: "string",
                        size: len,
                        max: MAX_STRING_SIZE,
                    });
                }
                let raw = self.take(len, "string data")?.to_vec();
                Ok(Value::Str(String::from_utf8(raw)?))
            }
            TYPE_LIST => {
                let count = self.take_len("list count")?;
                if count > MAX_CONTAINER_LEN {
                    return Err(ProtocolError::ValueTooLarge {
                        what: "list",
                        size: count,
                        max: MAX_CONTAINER_LEN,
                    });
                }
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.value()?);
                }
                Ok(Value::List(items))
            }
            TYPE_DICT => {
                let count = self.take_len("dict count")?;
                if count > MAX_CONTAINER_LEN {
                    return Err(ProtocolError::ValueTooLarge {
                        what: "dict",
                        size: count,
                        max: MAX_CONTAINER_LEN,
                    });
                }
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = match self.value()? {
                        Value::Str(s) => s,
                        other => {
                            return Err(ProtocolError::NonStringKey {
                                found: other.type_name(),
                            })
                        }
                    };
                    let val = self.value()?;
                    map.insert(key, val);
                }
                Ok(Value::Dict(map))
            }
            other => Err(ProtocolError::UnknownTypeTag { found: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrip_scalars() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(0.0));
        roundtrip(Value::Float(-1.5e300));
        roundtrip(Value::Str(String::new()));
        roundtrip(Value::Bytes(vec![0x00, 0xff, 0x7f]));
    }

    #[test]
    fn roundtrip_nested() {
        let mut inner = BTreeMap::new();
        inner.insert("flag".to_string(), Value::Bool(false));
        inner.insert(
            "items".to_string(),
            Value::List(vec![Value::Int(1), Value::Null, Value::Str("x".into())]),
        );
        let mut outer = BTreeMap::new();
        outer.insert("nested".to_string(), Value::Dict(inner));
        outer.insert("bytes".to_string(), Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Dict(outer));
    }

    #[test]
    fn roundtrip_full_bmp() {
        // BMP scalars from several blocks, including the code points
        // bracketing the surrogate range.
        let s: String = ['a', 'é', 'あ', '中', '\u{FFFD}', '\u{D7FF}', '\u{E000}']
            .iter()
            .collect();
        roundtrip(Value::Str(s));
    }

    #[test]
    fn empty_containers() {
        roundtrip(Value::List(vec![]));
        roundtrip(Value::Dict(BTreeMap::new()));
    }

    #[test]
    fn truncated_input_rejected() {
        let encoded = encode(&Value::Int(42)).unwrap();
        for cut in 0..encoded.len() {
            let err = decode(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, ProtocolError::Truncated { .. }), "cut={cut}");
        }
    }

    #[test]
    fn trailing_data_rejected() {
        let mut encoded = encode(&Value::Bool(true)).unwrap();
        encoded.push(0x00);
        assert!(matches!(
            decode(&encoded),
            Err(ProtocolError::TrailingData { remaining: 1 })
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        // string tag, length 2, invalid continuation byte
        let raw = [TYPE_STRING, 0, 0, 0, 2, 0xc3, 0x28];
        assert!(matches!(
            decode(&raw),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn non_string_dict_key_rejected() {
        // dict tag, count 1, int key
        let mut raw = vec![TYPE_DICT, 0, 0, 0, 1];
        raw.extend_from_slice(&encode(&Value::Int(7)).unwrap());
        raw.extend_from_slice(&encode(&Value::Null).unwrap());
        assert!(matches!(
            decode(&raw),
            Err(ProtocolError::NonStringKey { found: "int64" })
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            decode(&[0x7e]),
            Err(ProtocolError::UnknownTypeTag { found: 0x7e })
        ));
    }

    #[test]
    fn oversize_declared_length_rejected() {
        let mut raw = vec![TYPE_STRING];
        raw.extend_from_slice(&((MAX_STRING_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(
            decode(&raw),
            Err(ProtocolError::ValueTooLarge { what: "string", .. })
        ));
    }

    #[test]
    fn oversize_encode_rejected() {
        let too_long = vec![Value::Null; MAX_CONTAINER_LEN + 1];
        assert!(matches!(
            encode(&Value::List(too_long)),
            Err(ProtocolError::ValueTooLarge { what: "list", .. })
        ));
    }

    #[test]
    fn bool_is_not_int() {
        let encoded = encode(&Value::Bool(true)).unwrap();
        assert_eq!(encoded, vec![TYPE_BOOL, 0x01]);
        let encoded = encode(&Value::Int(1)).unwrap();
        assert_eq!(encoded[0], TYPE_INT64);
    }
}
