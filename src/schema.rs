//! Schema model: ordered, typed record layouts.
//!
//! A [`Schema`] is an immutable list of [`FieldSpec`]s.  Field order is the
//! byte layout; there is no padding and no reordering.  Every multi-byte
//! field is little-endian.
//!
//! # Sharing and recursion
//!
//! Pointer and array fields name their sub-layout through a [`SchemaRef`],
//! a cheap clonable handle.  A ref is either bound on creation
//! ([`SchemaRef::new`]) or created empty ([`SchemaRef::deferred`]) and bound
//! exactly once later, which lets a layout point at itself or at a layout
//! that is defined after it:
//!
//! ```text
//! let node = SchemaRef::deferred("node");
//! node.bind(SchemaBuilder::new("node").word("value").nullable_pointer_to("next", &node).build()?)?;
//! ```
//!
//! A bound cycle of refs is never freed; schemas are built once per record
//! type and live for the whole program.
//!
//! # Construction rules
//!
//! An array's count field must be an earlier, named, integral
//! (`Byte`/`Short`/`Word`) sibling.  A terminated array needs a non-zero
//! stride.  Violations are [`SchemaError`]s raised by [`Schema::new`],
//! never at decode time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Schema `{schema}`: array `{array}` is counted by `{count}`, which is not an earlier field")]
    UnknownCountField { schema: String, array: String, count: String },
    #[error("Schema `{schema}`: count field `{count}` is not a byte, short or word")]
    CountFieldNotIntegral { schema: String, count: String },
    #[error("Schema `{schema}`: duplicate field `{field}`")]
    DuplicateField { schema: String, field: String },
    #[error("Schema `{schema}`: field `{field}` has zero width")]
    ZeroWidth { schema: String, field: String },
    #[error("Schema `{0}` is already bound")]
    AlreadyBound(String),
}

// ── Field names ──────────────────────────────────────────────────────────────

/// Name of a field within a schema.
///
/// Only `Named` fields are stored in decoded records.  Placeholders and
/// reserved fields still occupy their bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldName {
    Named(String),
    /// `?` or `?N`: unnamed, value discarded.
    Placeholder(u32),
    /// `_`: reserved / padding.
    Reserved,
}

impl FieldName {
    /// `_` is reserved, `?` and `?N` are placeholders, anything else is a name.
    pub fn parse(s: &str) -> Self {
        if s == "_" {
            return FieldName::Reserved;
        }
        if let Some(rest) = s.strip_prefix('?') {
            if rest.is_empty() {
                return FieldName::Placeholder(0);
            }
            if let Ok(n) = rest.parse() {
                return FieldName::Placeholder(n);
            }
        }
        FieldName::Named(s.to_string())
    }

    pub fn as_named(&self) -> Option<&str> {
        match self {
            FieldName::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for FieldName {
    fn from(s: &str) -> Self { FieldName::parse(s) }
}

impl From<String> for FieldName {
    fn from(s: String) -> Self { FieldName::parse(&s) }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldName::Named(name)    => f.write_str(name),
            FieldName::Placeholder(0) => f.write_str("?"),
            FieldName::Placeholder(n) => write!(f, "?{n}"),
            FieldName::Reserved       => f.write_str("_"),
        }
    }
}

// ── Field kinds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FieldKind {
    Byte,
    Short,
    Word,
    /// 4-byte ROM pointer; the target is decoded with the sub-schema if one is given.
    Pointer(Option<SchemaRef>),
    /// As `Pointer`, but a raw 0 means "absent".
    NullablePointer(Option<SchemaRef>),
    /// `count_field` consecutive elements stored inline.
    Array { count_field: String, element: SchemaRef },
    /// 4-byte ROM pointer to `count_field` consecutive elements.
    ArrayPointer { count_field: String, element: SchemaRef },
    /// 4-byte ROM pointer to elements spaced `stride` bytes apart, running
    /// until `end` says the run is over.
    TerminatedArrayPointer { element: SchemaRef, stride: usize, end: Terminator },
    /// Opaque bytes, kept raw.
    Unknown(usize),
}

/// How a terminated array finds its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// The run stops at the first slot whose leading byte equals this value.
    /// Reaching the end of the buffer first is a decode failure.
    Byte(u8),
    /// The run stops at the first slot that does not decode.
    FirstInvalid,
}

impl FieldKind {
    /// Bytes this field occupies inside its record, or `None` for inline
    /// arrays whose size depends on the data.
    pub fn inline_width(&self) -> Option<usize> {
        match self {
            FieldKind::Byte  => Some(1),
            FieldKind::Short => Some(2),
            FieldKind::Word
            | FieldKind::Pointer(_)
            | FieldKind::NullablePointer(_)
            | FieldKind::ArrayPointer { .. }
            | FieldKind::TerminatedArrayPointer { .. } => Some(4),
            FieldKind::Unknown(width) => Some(*width),
            FieldKind::Array { .. } => None,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, FieldKind::Byte | FieldKind::Short | FieldKind::Word)
    }

    fn probe(&self) -> Option<bool> {
        match self {
            FieldKind::Pointer(_)
            | FieldKind::ArrayPointer { .. }
            | FieldKind::TerminatedArrayPointer { .. } => Some(false),
            FieldKind::NullablePointer(_) => Some(true),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: FieldName,
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Pair a name (parsed with [`FieldName::parse`] when given as text) with a kind.
    pub fn new(name: impl Into<FieldName>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind }
    }
}

// ── Schema references ────────────────────────────────────────────────────────

struct Slot {
    name:   String,
    schema: OnceLock<Schema>,
}

/// Shared handle to a schema, possibly bound after creation.
#[derive(Clone)]
pub struct SchemaRef {
    slot: Arc<Slot>,
}

impl SchemaRef {
    /// A ref that is bound from the start.
    pub fn new(schema: Schema) -> Self {
        let cell = OnceLock::new();
        let name = schema.name.clone();
        let _ = cell.set(schema);
        Self { slot: Arc::new(Slot { name, schema: cell }) }
    }

    /// An empty ref to be filled in with [`SchemaRef::bind`].
    pub fn deferred(name: impl Into<String>) -> Self {
        Self { slot: Arc::new(Slot { name: name.into(), schema: OnceLock::new() }) }
    }

    /// Fill a deferred ref.  A ref binds once; a second bind is
    /// [`SchemaError::AlreadyBound`].
    pub fn bind(&self, schema: Schema) -> Result<(), SchemaError> {
        self.slot
            .schema
            .set(schema)
            .map_err(|_| SchemaError::AlreadyBound(self.slot.name.clone()))
    }

    /// The bound schema, or `None` while the ref is still deferred.
    pub fn get(&self) -> Option<&Schema> {
        self.slot.schema.get()
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_bound(&self) -> bool {
        self.slot.schema.get().is_some()
    }

    /// Whether both handles share one slot.
    pub fn ptr_eq(&self, other: &SchemaRef) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

// Name only: a recursive layout would otherwise print forever.
impl fmt::Debug for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaRef({})", self.slot.name)
    }
}

// ── Schema ───────────────────────────────────────────────────────────────────

/// Position of a pointer field inside a schema's fixed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Byte offset from the start of the record.
    pub at:       usize,
    /// Whether a raw 0 is acceptable.
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct Schema {
    name:       String,
    fields:     Vec<FieldSpec>,
    prefix_len: usize,
    min_size:   usize,
    probe:      Vec<Probe>,
}

impl Schema {
    /// Validate `fields` and derive the fixed prefix, minimum size and probe.
    ///
    /// Fails when an array's count field is missing, declared after the
    /// array or not integral, when two named fields collide, or when an
    /// `Unknown` width or terminated-array stride is zero.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        let name = name.into();
        let mut seen: HashMap<&str, &FieldKind> = HashMap::new();

        for spec in &fields {
            match &spec.kind {
                FieldKind::Array { count_field, .. } | FieldKind::ArrayPointer { count_field, .. } => {
                    match seen.get(count_field.as_str()) {
                        None => {
                            return Err(SchemaError::UnknownCountField {
                                schema: name.clone(),
                                array:  spec.name.to_string(),
                                count:  count_field.clone(),
                            })
                        }
                        Some(kind) if !kind.is_integral() => {
                            return Err(SchemaError::CountFieldNotIntegral {
                                schema: name.clone(),
                                count:  count_field.clone(),
                            })
                        }
                        Some(_) => {}
                    }
                }
                FieldKind::Unknown(0) | FieldKind::TerminatedArrayPointer { stride: 0, .. } => {
                    return Err(SchemaError::ZeroWidth {
                        schema: name.clone(),
                        field:  spec.name.to_string(),
                    })
                }
                _ => {}
            }

            if let Some(field) = spec.name.as_named() {
                if seen.insert(field, &spec.kind).is_some() {
                    return Err(SchemaError::DuplicateField {
                        schema: name.clone(),
                        field:  field.to_string(),
                    });
                }
            }
        }

        // Fixed prefix: everything before the first inline array.
        let mut prefix_len = 0usize;
        let mut probe = Vec::new();
        for spec in &fields {
            let Some(width) = spec.kind.inline_width() else { break };
            if let Some(nullable) = spec.kind.probe() {
                probe.push(Probe { at: prefix_len, nullable });
            }
            prefix_len += width;
        }
        let min_size = fields.iter().filter_map(|f| f.kind.inline_width()).sum();

        Ok(Self { name, fields, prefix_len, min_size, probe })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn fields(&self) -> &[FieldSpec] { &self.fields }

    /// Length of the leading run of fixed-width fields.
    pub fn fixed_prefix_len(&self) -> usize { self.prefix_len }

    /// Smallest number of bytes a record can occupy (every inline array empty).
    pub fn min_size(&self) -> usize { self.min_size }

    /// Pointer fields inside the fixed prefix, in layout order.
    pub fn probe(&self) -> &[Probe] { &self.probe }

    /// The exact record size when the schema has no inline arrays.
    pub fn fixed_size(&self) -> Option<usize> {
        (self.prefix_len == self.min_size
            && self.fields.iter().all(|f| f.kind.inline_width().is_some()))
        .then_some(self.min_size)
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Fluent construction of a [`Schema`]; validation happens in [`build`](Self::build).
#[derive(Debug)]
pub struct SchemaBuilder {
    name:   String,
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new() }
    }

    /// Append a field of any kind.
    pub fn field(mut self, name: impl Into<FieldName>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::new(name, kind));
        self
    }

    pub fn byte(self, name: impl Into<FieldName>) -> Self  { self.field(name, FieldKind::Byte) }
    pub fn short(self, name: impl Into<FieldName>) -> Self { self.field(name, FieldKind::Short) }
    pub fn word(self, name: impl Into<FieldName>) -> Self  { self.field(name, FieldKind::Word) }

    pub fn unknown(self, name: impl Into<FieldName>, width: usize) -> Self {
        self.field(name, FieldKind::Unknown(width))
    }

    pub fn pointer(self, name: impl Into<FieldName>) -> Self {
        self.field(name, FieldKind::Pointer(None))
    }

    pub fn pointer_to(self, name: impl Into<FieldName>, target: &SchemaRef) -> Self {
        self.field(name, FieldKind::Pointer(Some(target.clone())))
    }

    pub fn nullable_pointer(self, name: impl Into<FieldName>) -> Self {
        self.field(name, FieldKind::NullablePointer(None))
    }

    pub fn nullable_pointer_to(self, name: impl Into<FieldName>, target: &SchemaRef) -> Self {
        self.field(name, FieldKind::NullablePointer(Some(target.clone())))
    }

    /// Inline run of `element`, sized by the earlier field `count_field`.
    pub fn array(self, name: impl Into<FieldName>, count_field: &str, element: &SchemaRef) -> Self {
        self.field(name, FieldKind::Array {
            count_field: count_field.to_string(),
            element:     element.clone(),
        })
    }

    /// Pointer to a run of `element`, sized by the earlier field `count_field`.
    pub fn array_pointer(self, name: impl Into<FieldName>, count_field: &str, element: &SchemaRef) -> Self {
        self.field(name, FieldKind::ArrayPointer {
            count_field: count_field.to_string(),
            element:     element.clone(),
        })
    }

    /// Pointer to `stride`-spaced elements ending where `end` says.
    pub fn terminated_array_pointer(
        self,
        name:    impl Into<FieldName>,
        element: &SchemaRef,
        stride:  usize,
        end:     Terminator,
    ) -> Self {
        self.field(name, FieldKind::TerminatedArrayPointer { element: element.clone(), stride, end })
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        Schema::new(self.name, self.fields)
    }
}
