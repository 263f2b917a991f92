//! Structure decoder: materialize one record of a [`Schema`] at an offset.
//!
//! Fields are read in layout order with a cursor that starts at the record
//! offset.  Every read is bounds-checked and every pointer is validated
//! before anything it points at is touched, so a decode attempt over
//! unrelated data usually fails on the first or second field.
//!
//! # Recursion
//!
//! Pointer fields with a sub-schema decode their target recursively.  The
//! offsets of all records on the active path are tracked for the duration
//! of one top-level call; a pointer back into that path, or an array
//! pointer whose run reaches a record on it, fails with
//! [`DecodeError::CyclicReference`].  [`DecodeLimits`] additionally bounds
//! the depth of acyclic chains and the element count of any one array.
//!
//! Decoding never mutates the buffer and never fails by panicking; every
//! failure is a [`DecodeError`] value.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::pointer::{self, PointerError, NULL_POINTER};
use crate::schema::{FieldKind, FieldName, Schema, SchemaRef, Terminator};

/// Default bound on nested record decodes per top-level call.
pub const DEFAULT_MAX_DEPTH:     usize = 64;
/// Default bound on elements in a single array.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 65_536;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Read of {width} byte(s) at 0x{at:x} overruns the {len}-byte buffer")]
    BufferOverrun { at: usize, width: usize, len: usize },
    #[error("Invalid pointer 0x{raw:08x} at 0x{at:x}: {reason}")]
    InvalidPointer { at: usize, raw: u32, reason: PointerError },
    #[error("Pointer at 0x{at:x} re-enters 0x{target:x}, which is already being decoded")]
    CyclicReference { at: usize, target: usize },
    #[error("Array `{field}` failed at element {index}: {source}")]
    TruncatedArray { field: String, index: usize, source: Box<DecodeError> },
    #[error("Schema `{0}` was referenced but never bound")]
    UnresolvedSchema(String),
    #[error("Nesting deeper than {limit} records at 0x{at:x}")]
    DepthExceeded { at: usize, limit: usize },
    #[error("Array `{field}` declares {count} elements (limit {limit})")]
    ArrayTooLong { field: String, count: usize, limit: usize },
    #[error("Array `{field}` starting at 0x{start:x} runs off the buffer before its terminator")]
    MissingTerminator { field: String, start: usize },
}

impl DecodeError {
    /// The innermost failure, looking through array element wrappers.
    pub fn root_cause(&self) -> &DecodeError {
        let mut err = self;
        while let DecodeError::TruncatedArray { source, .. } = err {
            err = source;
        }
        err
    }
}

// ── Limits ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_depth:     usize,
    pub max_array_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_depth:     DEFAULT_MAX_DEPTH,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

// ── Decoded values ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Byte(u8),
    Short(u16),
    Word(u32),
    /// Raw bytes of an `Unknown` field; serialized as hex.
    Unknown(#[serde(serialize_with = "as_hex")] Vec<u8>),
    /// A validated pointer.  `record` is present when the field names a sub-schema.
    Pointer {
        /// The word as stored, bank byte included.
        raw:    u32,
        /// Offset into the buffer.
        target: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        record: Option<Box<DecodedRecord>>,
    },
    /// A nullable pointer holding the null sentinel.
    Absent,
    /// Elements of an inline array.
    Array(Vec<DecodedRecord>),
    /// Elements read through a counted or terminated array pointer.
    ArrayPointer {
        raw:      u32,
        target:   usize,
        elements: Vec<DecodedRecord>,
    },
}

impl Value {
    /// Integer value of a byte, short or word field.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Byte(v)  => Some(*v as u32),
            Value::Short(v) => Some(*v as u32),
            Value::Word(v)  => Some(*v),
            _ => None,
        }
    }

    /// Resolved target offset of a pointer-like value.
    pub fn target(&self) -> Option<usize> {
        match self {
            Value::Pointer { target, .. } | Value::ArrayPointer { target, .. } => Some(*target),
            _ => None,
        }
    }
}

fn as_hex<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// One decoded record.  Only named fields are kept, in layout order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRecord {
    /// Absolute offset in the buffer.
    pub offset: usize,
    /// Bytes consumed at `offset` (pointed-to data not included).
    pub size:   usize,
    #[serde(serialize_with = "fields_as_map")]
    pub fields: Vec<(String, Value)>,
}

fn fields_as_map<S: Serializer>(fields: &[(String, Value)], s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(fields.iter().map(|(k, v)| (k, v)))
}

impl DecodedRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn integer(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(Value::as_u32)
    }

    /// The record a pointer field decoded into, if any.
    pub fn child(&self, name: &str) -> Option<&DecodedRecord> {
        match self.get(name)? {
            Value::Pointer { record, .. } => record.as_deref(),
            _ => None,
        }
    }

    /// Elements of an inline array or array pointer field.
    pub fn elements(&self, name: &str) -> Option<&[DecodedRecord]> {
        match self.get(name)? {
            Value::Array(elements) | Value::ArrayPointer { elements, .. } => Some(elements),
            _ => None,
        }
    }

    /// Named fields in layout order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// One past the last byte consumed inline.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    limits: DecodeLimits,
}

impl Decoder {
    /// A decoder with [`DecodeLimits::default`].
    pub fn new() -> Self { Self::default() }

    pub fn with_limits(limits: DecodeLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> DecodeLimits { self.limits }

    /// Decode one record of `schema` at `offset`.
    ///
    /// Fails without reading any field when fewer than `schema.min_size()`
    /// bytes remain.  The cycle guard covers this call only.
    pub fn decode(&self, buffer: &[u8], offset: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
        let need = schema.min_size();
        if offset.checked_add(need).map_or(true, |end| end > buffer.len()) {
            return Err(DecodeError::BufferOverrun { at: offset, width: need, len: buffer.len() });
        }
        Walk { buffer, limits: self.limits, path: Vec::new() }.record(offset, schema)
    }

    /// Decode `schema` at the target of the pointer stored at `location`.
    pub fn follow(&self, buffer: &[u8], location: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
        let walk = Walk { buffer, limits: self.limits, path: Vec::new() };
        let raw = walk.word(location)?;
        let target = walk.resolve(location, raw)?;
        self.decode(buffer, target, schema)
    }
}

/// Decode one record with default limits.
pub fn decode(buffer: &[u8], offset: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
    Decoder::default().decode(buffer, offset, schema)
}

/// Decode the record a stored pointer refers to, with default limits.
pub fn follow(buffer: &[u8], location: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
    Decoder::default().follow(buffer, location, schema)
}

/// State for one top-level decode.
struct Walk<'a> {
    buffer: &'a [u8],
    limits: DecodeLimits,
    /// Record offsets on the active recursion path.
    path:   Vec<usize>,
}

impl<'a> Walk<'a> {
    fn record(&mut self, offset: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
        if self.path.len() >= self.limits.max_depth {
            return Err(DecodeError::DepthExceeded { at: offset, limit: self.limits.max_depth });
        }
        self.path.push(offset);
        let result = self.fields(offset, schema);
        self.path.pop();
        result
    }

    fn fields(&mut self, offset: usize, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
        let mut cursor = offset;
        let mut fields: Vec<(String, Value)> = Vec::with_capacity(schema.fields().len());

        for spec in schema.fields() {
            let value = match &spec.kind {
                FieldKind::Byte => {
                    let v = self.bytes(cursor, 1)?[0];
                    cursor += 1;
                    Value::Byte(v)
                }
                FieldKind::Short => {
                    let v = LittleEndian::read_u16(self.bytes(cursor, 2)?);
                    cursor += 2;
                    Value::Short(v)
                }
                FieldKind::Word => {
                    let v = self.word(cursor)?;
                    cursor += 4;
                    Value::Word(v)
                }
                FieldKind::Unknown(width) => {
                    let v = self.bytes(cursor, *width)?.to_vec();
                    cursor += width;
                    Value::Unknown(v)
                }
                FieldKind::Pointer(target) => {
                    let raw = self.word(cursor)?;
                    let v = self.pointer(cursor, raw, target.as_ref())?;
                    cursor += 4;
                    v
                }
                FieldKind::NullablePointer(target) => {
                    let raw = self.word(cursor)?;
                    let v = if raw == NULL_POINTER {
                        Value::Absent
                    } else {
                        self.pointer(cursor, raw, target.as_ref())?
                    };
                    cursor += 4;
                    v
                }
                FieldKind::Array { count_field, element } => {
                    let count = count_of(&fields, count_field);
                    let (elements, end) = self.run(cursor, cursor, count, &spec.name, element)?;
                    cursor = end;
                    Value::Array(elements)
                }
                FieldKind::ArrayPointer { count_field, element } => {
                    let at = cursor;
                    let raw = self.word(at)?;
                    let target = self.resolve(at, raw)?;
                    let count = count_of(&fields, count_field);
                    let (elements, _) = self.run(at, target, count, &spec.name, element)?;
                    cursor += 4;
                    Value::ArrayPointer { raw, target, elements }
                }
                FieldKind::TerminatedArrayPointer { element, stride, end } => {
                    let at = cursor;
                    let raw = self.word(at)?;
                    let target = self.resolve(at, raw)?;
                    let elements = self.terminated(at, target, *stride, *end, &spec.name, element)?;
                    cursor += 4;
                    Value::ArrayPointer { raw, target, elements }
                }
            };

            if let FieldName::Named(name) = &spec.name {
                fields.push((name.clone(), value));
            }
        }

        Ok(DecodedRecord { offset, size: cursor - offset, fields })
    }

    fn pointer(&mut self, at: usize, raw: u32, target: Option<&SchemaRef>) -> Result<Value, DecodeError> {
        let offset = self.resolve(at, raw)?;
        let record = match target {
            None => None,
            Some(schema) => {
                self.check_cycle(at, offset)?;
                Some(Box::new(self.record(offset, resolved(schema)?)?))
            }
        };
        Ok(Value::Pointer { raw, target: offset, record })
    }

    /// Decode `count` consecutive elements starting at `start`; returns them
    /// with the offset just past the last one.  `origin` is where the array
    /// field sits, reported when an element re-enters the active path.
    fn run(
        &mut self,
        origin:  usize,
        start:   usize,
        count:   usize,
        field:   &FieldName,
        element: &SchemaRef,
    ) -> Result<(Vec<DecodedRecord>, usize), DecodeError> {
        if count > self.limits.max_array_len {
            return Err(DecodeError::ArrayTooLong {
                field: field.to_string(),
                count,
                limit: self.limits.max_array_len,
            });
        }
        if count == 0 {
            return Ok((Vec::new(), start));
        }
        let schema = resolved(element)?;
        let mut elements = Vec::with_capacity(count);
        let mut cursor = start;
        for index in 0..count {
            self.check_cycle(origin, cursor)?;
            let record = self.record(cursor, schema).map_err(|e| truncated(field, index, e))?;
            cursor = record.end();
            elements.push(record);
        }
        Ok((elements, cursor))
    }

    /// Decode elements every `stride` bytes from `start` until `end` stops the run.
    fn terminated(
        &mut self,
        origin:  usize,
        start:   usize,
        stride:  usize,
        end:     Terminator,
        field:   &FieldName,
        element: &SchemaRef,
    ) -> Result<Vec<DecodedRecord>, DecodeError> {
        let schema = resolved(element)?;
        let mut elements = Vec::new();
        let mut cursor = start;
        loop {
            if let Terminator::Byte(ender) = end {
                let marker = self.bytes(cursor, 1).map_err(|_| DecodeError::MissingTerminator {
                    field: field.to_string(),
                    start,
                })?;
                if marker[0] == ender {
                    break;
                }
            }
            if elements.len() >= self.limits.max_array_len {
                return Err(DecodeError::ArrayTooLong {
                    field: field.to_string(),
                    count: elements.len() + 1,
                    limit: self.limits.max_array_len,
                });
            }
            self.check_cycle(origin, cursor)?;
            match self.record(cursor, schema) {
                Ok(record) => elements.push(record),
                Err(_) if end == Terminator::FirstInvalid => break,
                Err(e) => return Err(truncated(field, elements.len(), e)),
            }
            cursor = cursor.saturating_add(stride);
        }
        Ok(elements)
    }

    fn check_cycle(&self, at: usize, target: usize) -> Result<(), DecodeError> {
        if self.path.contains(&target) {
            return Err(DecodeError::CyclicReference { at, target });
        }
        Ok(())
    }

    fn bytes(&self, at: usize, width: usize) -> Result<&'a [u8], DecodeError> {
        let buffer: &'a [u8] = self.buffer;
        at.checked_add(width)
            .filter(|&end| end <= buffer.len())
            .map(|end| &buffer[at..end])
            .ok_or(DecodeError::BufferOverrun { at, width, len: buffer.len() })
    }

    fn word(&self, at: usize) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.bytes(at, 4)?))
    }

    fn resolve(&self, at: usize, raw: u32) -> Result<usize, DecodeError> {
        pointer::validate(raw, self.buffer.len())
            .map_err(|reason| DecodeError::InvalidPointer { at, raw, reason })
    }
}

fn truncated(field: &FieldName, index: usize, source: DecodeError) -> DecodeError {
    DecodeError::TruncatedArray { field: field.to_string(), index, source: Box::new(source) }
}

fn resolved(schema: &SchemaRef) -> Result<&Schema, DecodeError> {
    schema.get().ok_or_else(|| DecodeError::UnresolvedSchema(schema.name().to_string()))
}

// The schema guarantees the count field is an earlier named integral field.
fn count_of(fields: &[(String, Value)], name: &str) -> usize {
    fields
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| v.as_u32())
        .unwrap_or(0) as usize
}
