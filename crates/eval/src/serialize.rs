//! Binary serialization of forced values
//!
//! The wire format behind the persistent cache. It is self-describing
//! (every value starts with a tag byte) and canonical: integers are
//! little-endian, strings are length-prefixed, attribute sets are written
//! sorted by name bytes with names as strings (symbol IDs are
//! session-local and never serialized).
//!
//! Code is not data: lambdas, partial applications, and external values
//! are rejected, as is anything not yet forced. A thunk's result may be
//! cached; the thunk itself may not.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::accessor::AccessorRef;
use crate::symbol::SymbolTable;
use crate::value::{Attr, AttrSet, Forced, StringValue, Value, ValuePtr, ValueState};

/// Type tags of the serialized format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SerializeTag {
    Null = 0x00,
    BoolFalse = 0x01,
    BoolTrue = 0x02,
    Int = 0x03,
    Float = 0x04,
    String = 0x05,
    Path = 0x06,
    Attrs = 0x07,
    List = 0x08,
}

impl SerializeTag {
    fn from_byte(b: u8) -> Option<SerializeTag> {
        match b {
            0x00 => Some(SerializeTag::Null),
            0x01 => Some(SerializeTag::BoolFalse),
            0x02 => Some(SerializeTag::BoolTrue),
            0x03 => Some(SerializeTag::Int),
            0x04 => Some(SerializeTag::Float),
            0x05 => Some(SerializeTag::String),
            0x06 => Some(SerializeTag::Path),
            0x07 => Some(SerializeTag::Attrs),
            0x08 => Some(SerializeTag::List),
            _ => None,
        }
    }
}

/// Error during value serialization or deserialization.
#[derive(Debug)]
pub enum SerializeError {
    /// The value (or a nested value) is still a thunk; force it first.
    NotForced,
    /// Functions contain closures over runtime environments.
    FunctionNotSerializable,
    /// External values are opaque embedder objects.
    ExternalNotSerializable,
    /// Input ended before the value did.
    Truncated,
    /// Input continued after the value ended.
    TrailingData(usize),
    /// Unknown type tag.
    BadTag(u8),
    /// A serialized string was not valid UTF-8.
    InvalidString(std::str::Utf8Error),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializeError::NotForced => {
                write!(f, "cannot serialize an unforced value - force it first")
            }
            SerializeError::FunctionNotSerializable => {
                write!(f, "cannot serialize a function - code is not data")
            }
            SerializeError::ExternalNotSerializable => {
                write!(f, "cannot serialize an external value")
            }
            SerializeError::Truncated => write!(f, "unexpected end of serialized data"),
            SerializeError::TrailingData(n) => {
                write!(f, "{} trailing bytes after serialized value", n)
            }
            SerializeError::BadTag(b) => write!(f, "unknown serialization tag {:#04x}", b),
            SerializeError::InvalidString(e) => write!(f, "invalid string data: {}", e),
        }
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializeError::InvalidString(e) => Some(e),
            _ => None,
        }
    }
}

struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buffer: Vec::new() }
    }

    fn tag(&mut self, tag: SerializeTag) {
        self.buffer.push(tag as u8);
    }

    fn u64(&mut self, v: u64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buffer.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u64(s.len() as u64);
        self.buffer.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8, SerializeError> {
        let b = *self.data.get(self.pos).ok_or(SerializeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u64(&mut self) -> Result<u64, SerializeError> {
        if self.remaining() < 8 {
            return Err(SerializeError::Truncated);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> Result<i64, SerializeError> {
        Ok(self.u64()? as i64)
    }

    fn f64(&mut self) -> Result<f64, SerializeError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn string(&mut self) -> Result<&'a str, SerializeError> {
        let len = self.u64()? as usize;
        if self.remaining() < len {
            return Err(SerializeError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        std::str::from_utf8(bytes).map_err(SerializeError::InvalidString)
    }
}

fn serialize_forced(
    out: &mut Writer,
    forced: &Forced,
    symbols: &SymbolTable,
) -> Result<(), SerializeError> {
    match forced {
        Forced::Null => out.tag(SerializeTag::Null),
        Forced::Bool(false) => out.tag(SerializeTag::BoolFalse),
        Forced::Bool(true) => out.tag(SerializeTag::BoolTrue),
        Forced::Int(n) => {
            out.tag(SerializeTag::Int);
            out.i64(*n);
        }
        Forced::Float(x) => {
            out.tag(SerializeTag::Float);
            out.f64(*x);
        }
        Forced::Str(s) => {
            out.tag(SerializeTag::String);
            out.string(&s.content);
            out.u64(s.context.len() as u64);
            for entry in s.context.iter() {
                out.string(entry);
            }
        }
        Forced::Path { path, .. } => {
            // The accessor stays behind: it belongs to this process. The
            // reader supplies its own.
            out.tag(SerializeTag::Path);
            out.string(path);
        }
        Forced::Attrs(set) => {
            out.tag(SerializeTag::Attrs);
            out.u64(set.len() as u64);
            for attr in set.iter() {
                out.string(&symbols.resolve(attr.name));
                serialize_value_ptr(out, &attr.value, symbols)?;
            }
        }
        Forced::List(elems) => {
            out.tag(SerializeTag::List);
            out.u64(elems.len() as u64);
            for elem in elems.iter() {
                serialize_value_ptr(out, elem, symbols)?;
            }
        }
        Forced::Lambda { .. } | Forced::PrimOp(_) | Forced::PrimOpApp { .. } => {
            return Err(SerializeError::FunctionNotSerializable);
        }
        Forced::External(_) => return Err(SerializeError::ExternalNotSerializable),
    }
    Ok(())
}

fn serialize_value_ptr(
    out: &mut Writer,
    v: &ValuePtr,
    symbols: &SymbolTable,
) -> Result<(), SerializeError> {
    match v.state() {
        ValueState::Forced(forced) => serialize_forced(out, &forced, symbols),
        _ => Err(SerializeError::NotForced),
    }
}

/// Serialize a forced value to bytes.
pub fn serialize_value(v: &ValuePtr, symbols: &SymbolTable) -> Result<Vec<u8>, SerializeError> {
    let mut out = Writer::new();
    serialize_value_ptr(&mut out, v, symbols)?;
    Ok(out.buffer)
}

fn deserialize_inner(
    reader: &mut Reader<'_>,
    symbols: &SymbolTable,
    accessor: Option<&AccessorRef>,
) -> Result<ValuePtr, SerializeError> {
    let raw = reader.byte()?;
    let tag = SerializeTag::from_byte(raw).ok_or(SerializeError::BadTag(raw))?;
    let forced = match tag {
        SerializeTag::Null => Forced::Null,
        SerializeTag::BoolFalse => Forced::Bool(false),
        SerializeTag::BoolTrue => Forced::Bool(true),
        SerializeTag::Int => Forced::Int(reader.i64()?),
        SerializeTag::Float => Forced::Float(reader.f64()?),
        SerializeTag::String => {
            let content = reader.string()?.to_string();
            let count = reader.u64()?;
            let mut context = BTreeSet::new();
            for _ in 0..count {
                context.insert(reader.string()?.to_string());
            }
            Forced::Str(StringValue::with_context(content, context))
        }
        SerializeTag::Path => Forced::Path {
            accessor: accessor.cloned(),
            path: reader.string()?.to_string(),
        },
        SerializeTag::Attrs => {
            let count = reader.u64()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = symbols.intern(reader.string()?);
                let value = deserialize_inner(reader, symbols, accessor)?;
                entries.push(Attr { name, value });
            }
            Forced::Attrs(AttrSet::build(symbols, entries))
        }
        SerializeTag::List => {
            let count = reader.u64()?;
            let mut elems = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elems.push(deserialize_inner(reader, symbols, accessor)?);
            }
            Forced::List(Arc::new(elems))
        }
    };
    Ok(Value::forced(forced))
}

/// Deserialize bytes produced by [`serialize_value`].
///
/// `accessor` is attached to every deserialized path; without one, paths
/// come back accessor-less and hash as raw strings.
pub fn deserialize_value(
    data: &[u8],
    symbols: &SymbolTable,
    accessor: Option<&AccessorRef>,
) -> Result<ValuePtr, SerializeError> {
    let mut reader = Reader::new(data);
    let value = deserialize_inner(&mut reader, symbols, accessor)?;
    if reader.remaining() > 0 {
        return Err(SerializeError::TrailingData(reader.remaining()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use crate::expr::Expr;

    fn symbols() -> SymbolTable {
        SymbolTable::new()
    }

    #[test]
    fn test_primitives_round_trip() {
        let syms = symbols();
        for v in [
            Value::forced(Forced::Null),
            Value::bool(true),
            Value::bool(false),
            Value::int(-12345),
            Value::forced(Forced::Float(2.5)),
            Value::string("hello"),
        ] {
            let bytes = serialize_value(&v, &syms).unwrap();
            let back = deserialize_value(&bytes, &syms, None).unwrap();
            let a = serialize_value(&back, &syms).unwrap();
            assert_eq!(a, bytes);
        }
    }

    #[test]
    fn test_attrs_round_trip_in_name_order() {
        let syms = symbols();
        let b = syms.intern("b");
        let a = syms.intern("a");
        let set = AttrSet::build(
            &syms,
            vec![
                Attr {
                    name: b,
                    value: Value::int(2),
                },
                Attr {
                    name: a,
                    value: Value::int(1),
                },
            ],
        );
        let v = Value::forced(Forced::Attrs(set));
        let bytes = serialize_value(&v, &syms).unwrap();

        let back = deserialize_value(&bytes, &syms, None).unwrap();
        let set = back.as_attrs().unwrap();
        assert_eq!(set.get(a).unwrap().as_int(), Some(1));
        assert_eq!(set.get(b).unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_string_context_survives() {
        let syms = symbols();
        let mut ctx = BTreeSet::new();
        ctx.insert("dep:one".to_string());
        ctx.insert("dep:two".to_string());
        let v = Value::forced(Forced::Str(StringValue::with_context("out", ctx.clone())));
        let bytes = serialize_value(&v, &syms).unwrap();
        let back = deserialize_value(&bytes, &syms, None).unwrap();
        match back.forced_ref().unwrap() {
            Forced::Str(s) => assert_eq!(*s.context, ctx),
            other => panic!("expected string, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_thunks_and_functions_rejected() {
        let syms = symbols();
        let thunk = Value::thunk(Env::root(0), Expr::int(1));
        assert!(matches!(
            serialize_value(&thunk, &syms),
            Err(SerializeError::NotForced)
        ));

        let lambda = Value::forced(Forced::Lambda {
            env: Env::root(0),
            expr: Expr::lambda(syms.intern("x"), Expr::int(1)),
        });
        assert!(matches!(
            serialize_value(&lambda, &syms),
            Err(SerializeError::FunctionNotSerializable)
        ));
    }

    #[test]
    fn test_malformed_input_rejected() {
        let syms = symbols();
        assert!(matches!(
            deserialize_value(&[0xEE], &syms, None),
            Err(SerializeError::BadTag(0xEE))
        ));
        assert!(matches!(
            deserialize_value(&[SerializeTag::Int as u8, 0x01], &syms, None),
            Err(SerializeError::Truncated)
        ));
        let mut ok = serialize_value(&Value::int(1), &syms).unwrap();
        ok.push(0);
        assert!(matches!(
            deserialize_value(&ok, &syms, None),
            Err(SerializeError::TrailingData(1))
        ));
    }
}
