pub mod schema;
pub mod pointer;
pub mod decode;
pub mod scan;
pub mod definition;

pub use schema::{FieldKind, FieldName, FieldSpec, Schema, SchemaBuilder, SchemaError, SchemaRef, Terminator};
pub use pointer::{validate, PointerError};
pub use decode::{decode, follow, DecodeError, DecodeLimits, DecodedRecord, Decoder, Value};
pub use scan::{scan, CancelToken, Candidates, ScanOptions, ScanResult, ScanStats, Scanner};
pub use definition::{DefinitionError, Definitions};
