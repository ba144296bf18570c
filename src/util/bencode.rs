//! Bencode, the self-delimiting encoding used for every structured message on the wire.
//!
//! Dictionaries are keyed by UTF-8 strings and always encoded in key order, so a given
//!  [Value] has exactly one encoding.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};

/// Nesting deeper than this is rejected when decoding, untrusted input must not be able to
///  exhaust the stack
pub const MAX_NESTING_DEPTH: usize = 32;

pub type Dict = BTreeMap<String, Value>;

#[derive(Clone, Eq, PartialEq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(Dict),
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Value::List(l) => f.debug_list().entries(l).finish(),
            Value::Dict(d) => f.debug_map().entries(d).finish(),
        }
    }
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// booleans travel as the integers 0 and 1
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}
impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}
impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(value as i64)
    }
}
impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(if value { 1 } else { 0 })
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}
impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}
impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}
impl From<Dict> for Value {
    fn from(value: Dict) -> Self {
        Value::Dict(value)
    }
}

/// Builds a [Dict] from `key => value` pairs, converting values via `Into<Value>`
#[macro_export]
macro_rules! dict {
    () => { $crate::util::bencode::Dict::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut d = $crate::util::bencode::Dict::new();
        $( d.insert($k.to_string(), $crate::util::bencode::Value::from($v)); )+
        d
    }};
}

pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.freeze()
}

pub fn encode_dict(dict: &Dict) -> Bytes {
    let mut buf = BytesMut::new();
    encode_dict_into(dict, &mut buf);
    buf.freeze()
}

pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Int(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::List(l) => {
            buf.put_u8(b'l');
            for v in l {
                encode_into(v, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(d) => encode_dict_into(d, buf),
    }
}

fn encode_dict_into(dict: &Dict, buf: &mut BytesMut) {
    buf.put_u8(b'd');
    for (k, v) in dict {
        encode_bytes(k.as_bytes(), buf);
        encode_into(v, buf);
    }
    buf.put_u8(b'e');
}

fn encode_bytes(b: &[u8], buf: &mut BytesMut) {
    buf.put_slice(b.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(b);
}

/// Decodes exactly one value, trailing bytes are an error
pub fn decode(buf: &[u8]) -> anyhow::Result<Value> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != buf.len() {
        bail!("{} trailing bytes after bencoded value", buf.len() - decoder.pos);
    }
    Ok(value)
}

pub fn decode_dict(buf: &[u8]) -> anyhow::Result<Dict> {
    match decode(buf)? {
        Value::Dict(d) => Ok(d),
        other => Err(anyhow!("expected a dictionary, was {:?}", other)),
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl <'a> Decoder<'a> {
    fn peek(&self) -> anyhow::Result<u8> {
        self.buf.get(self.pos)
            .copied()
            .ok_or_else(|| anyhow!("unexpected end of input at offset {}", self.pos))
    }

    fn value(&mut self, depth: usize) -> anyhow::Result<Value> {
        if depth > MAX_NESTING_DEPTH {
            bail!("nesting deeper than {} levels", MAX_NESTING_DEPTH);
        }

        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let i = self.int_until(b'e')?;
                Ok(Value::Int(i))
            }
            b'l' => {
                self.pos += 1;
                let mut result = Vec::new();
                while self.peek()? != b'e' {
                    result.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(result))
            }
            b'd' => {
                self.pos += 1;
                let mut result = Dict::new();
                let mut prev_key: Option<String> = None;
                while self.peek()? != b'e' {
                    let key = self.bytes()?;
                    let key = String::from_utf8(key.to_vec())
                        .map_err(|_| anyhow!("dictionary key is not valid UTF-8"))?;
                    if let Some(prev) = &prev_key {
                        if prev.as_bytes() >= key.as_bytes() {
                            bail!("dictionary keys are not strictly ordered: {:?} after {:?}", key, prev);
                        }
                    }
                    let value = self.value(depth + 1)?;
                    result.insert(key.clone(), value);
                    prev_key = Some(key);
                }
                self.pos += 1;
                Ok(Value::Dict(result))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?)),
            other => Err(anyhow!("unexpected byte {:?} at offset {}", other as char, self.pos)),
        }
    }

    fn bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.int_until(b':')?;
        if len < 0 {
            bail!("negative string length");
        }
        let len = len as usize;
        if self.buf.len() - self.pos < len {
            bail!("string of length {} exceeds input", len);
        }
        let result = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(result)
    }

    /// parses a decimal integer terminated by `terminator`, consuming the terminator
    fn int_until(&mut self, terminator: u8) -> anyhow::Result<i64> {
        let buf = self.buf;
        let start = self.pos;
        let end = buf[start..].iter()
            .position(|&b| b == terminator)
            .map(|offs| start + offs)
            .ok_or_else(|| anyhow!("unterminated integer at offset {}", start))?;

        let i = parse_canonical_int(std::str::from_utf8(&buf[start..end])?)?;
        self.pos = end + 1;
        Ok(i)
    }
}

/// leading zeros, `-0`, a leading `+` and the empty string are all malformed
fn parse_canonical_int(s: &str) -> anyhow::Result<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("malformed integer {:?}", s);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        bail!("integer with leading zero: {:?}", s);
    }
    if s == "-0" {
        bail!("negative zero");
    }
    Ok(s.parse::<i64>()?)
}
