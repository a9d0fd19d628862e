use arrow_schema::ArrowError;
use thiserror::Error;

use crate::unify::FieldType;

#[derive(Error, Debug)]
pub enum Json2ArrowError {
    #[error("schema conflict at `{path}`: {existing} cannot unify with {incoming}")]
    SchemaConflict {
        path: String,
        existing: FieldType,
        incoming: FieldType,
    },

    #[error("sample record {ordinal} is not a JSON object")]
    NotAnObject { ordinal: u64 },

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Schema Codec Error: {0}")]
    Codec(#[from] CodecError),

    #[error("Decode Error: {0}")]
    Decode(#[from] DecodeError),

    #[error("rows per batch must be at least 1")]
    InvalidBatchSize,

    #[error("Batch Conversion Error: {0}")]
    BatchConversion(ArrowError),

    #[error("Io Error")]
    IoError(#[from] std::io::Error),
}

/// Persisted schema could not be restored. Never defaulted around.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed schema document: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unrecognised schema format tag {0:?}")]
    UnknownFormat(String),

    #[error("unsupported schema format version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid schema: {0}")]
    Invalid(String),

    #[error("couldn't write schema: {0}")]
    Io(#[from] std::io::Error),
}

/// A record in the production stream does not fit the active schema.
/// `ordinal` is the zero based position of the record among non-blank lines.
#[derive(Error, Debug)]
#[error("record {ordinal} rejected: {reason}")]
pub struct DecodeError {
    pub ordinal: u64,
    pub reason: DecodeReason,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeReason {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("expected a JSON object at `{0}`")]
    NotAnObject(String),

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("`{path}` expects {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: FieldType,
        found: String,
    },

    #[error("`{0}` is not nullable but no value was present")]
    UnexpectedNull(String),

    #[error("`{0}` has no column builder")]
    BuilderMismatch(String),
}

pub type Result<T> = core::result::Result<T, Json2ArrowError>;
