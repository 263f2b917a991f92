//! JSON schema definitions.
//!
//! A definition file declares a family of named schemas that may refer to
//! each other (and to themselves) by name, in any order:
//!
//! ```json
//! {
//!   "root": "node",
//!   "schemas": {
//!     "node": [
//!       { "name": "value", "kind": "word" },
//!       { "name": "next",  "kind": "nullable_pointer", "schema": "node" }
//!     ]
//!   }
//! }
//! ```
//!
//! Field kinds: `byte`, `short`, `word`, `pointer`, `nullable_pointer`
//! (optional `schema`), `array` and `array_pointer` (`count` + `schema`),
//! `terminated_array_pointer` (`schema` + `stride`, optional `ender` byte;
//! without one the run ends at the first element that fails to decode),
//! `unknown` (`width`).  Field names follow [`FieldName::parse`].

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{FieldKind, FieldName, FieldSpec, Schema, SchemaError, SchemaRef, Terminator};

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Field `{field}` of `{schema}` refers to unknown schema `{target}`")]
    UnknownSchema { schema: String, field: String, target: String },
    #[error("Field `{field}` of `{schema}` needs `{attribute}`")]
    MissingAttribute { schema: String, field: String, attribute: &'static str },
    #[error("No schema named `{0}`")]
    NoSuchSchema(String),
    #[error("No root schema declared")]
    NoRoot,
}

// ── On-disk form ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindTag {
    Byte,
    Short,
    Word,
    Pointer,
    NullablePointer,
    Array,
    ArrayPointer,
    TerminatedArrayPointer,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name:   String,
    pub kind:   KindTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count:  Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width:  Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ender:  Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root:    Option<String>,
    pub schemas: BTreeMap<String, Vec<FieldDef>>,
}

// ── Resolved definitions ─────────────────────────────────────────────────────

/// A resolved family of schemas, every reference bound.
#[derive(Debug)]
pub struct Definitions {
    schemas: BTreeMap<String, SchemaRef>,
    root:    Option<String>,
}

impl Definitions {
    /// Parse and resolve a definition document.
    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        Self::from_file(serde_json::from_str(text)?)
    }

    /// Read and resolve a definition file from disk.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Bind every named schema, so references may point forward, backward or at themselves.
    pub fn from_file(file: DefinitionFile) -> Result<Self, DefinitionError> {
        let schemas: BTreeMap<String, SchemaRef> = file
            .schemas
            .keys()
            .map(|name| (name.clone(), SchemaRef::deferred(name.clone())))
            .collect();

        for (name, defs) in &file.schemas {
            let fields = defs
                .iter()
                .map(|def| field_spec(name, def, &schemas))
                .collect::<Result<Vec<_>, _>>()?;
            schemas[name].bind(Schema::new(name.clone(), fields)?)?;
        }

        if let Some(root) = &file.root {
            if !schemas.contains_key(root) {
                return Err(DefinitionError::NoSuchSchema(root.clone()));
            }
        }
        Ok(Self { schemas, root: file.root })
    }

    pub fn get(&self, name: &str) -> Option<&SchemaRef> {
        self.schemas.get(name)
    }

    pub fn schema(&self, name: &str) -> Result<&Schema, DefinitionError> {
        self.schemas
            .get(name)
            .and_then(SchemaRef::get)
            .ok_or_else(|| DefinitionError::NoSuchSchema(name.to_string()))
    }

    /// The declared root, or the only schema when exactly one is defined.
    pub fn root(&self) -> Result<&Schema, DefinitionError> {
        match &self.root {
            Some(name) => self.schema(name),
            None if self.schemas.len() == 1 => {
                self.schemas.values().find_map(SchemaRef::get).ok_or(DefinitionError::NoRoot)
            }
            None => Err(DefinitionError::NoRoot),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

fn field_spec(
    schema:  &str,
    def:     &FieldDef,
    schemas: &BTreeMap<String, SchemaRef>,
) -> Result<FieldSpec, DefinitionError> {
    let missing = |attribute| DefinitionError::MissingAttribute {
        schema: schema.to_string(),
        field:  def.name.clone(),
        attribute,
    };
    let lookup = |target: &String| {
        schemas.get(target).cloned().ok_or_else(|| DefinitionError::UnknownSchema {
            schema: schema.to_string(),
            field:  def.name.clone(),
            target: target.clone(),
        })
    };
    let target = || def.schema.as_ref().map(lookup).transpose();
    let required = || def.schema.as_ref().ok_or_else(|| missing("schema")).and_then(lookup);
    let count = || def.count.clone().ok_or_else(|| missing("count"));

    let kind = match def.kind {
        KindTag::Byte            => FieldKind::Byte,
        KindTag::Short           => FieldKind::Short,
        KindTag::Word            => FieldKind::Word,
        KindTag::Pointer         => FieldKind::Pointer(target()?),
        KindTag::NullablePointer => FieldKind::NullablePointer(target()?),
        KindTag::Array           => FieldKind::Array { count_field: count()?, element: required()? },
        KindTag::ArrayPointer    => FieldKind::ArrayPointer { count_field: count()?, element: required()? },
        KindTag::TerminatedArrayPointer => FieldKind::TerminatedArrayPointer {
            element: required()?,
            stride:  def.stride.ok_or_else(|| missing("stride"))?,
            end:     def.ender.map_or(Terminator::FirstInvalid, Terminator::Byte),
        },
        KindTag::Unknown         => FieldKind::Unknown(def.width.ok_or_else(|| missing("width"))?),
    };
    Ok(FieldSpec::new(FieldName::parse(&def.name), kind))
}
