//! Unify sampled JSON records into one schema, persist it, and decode
//! newline delimited JSON into Apache Arrow RecordBatches with it.
//!

pub mod codec;
mod decoder;
mod errors;
mod ndjson;
mod record_conversion;
mod schema_conversion;
pub mod temporal;
mod unify;

pub use decoder::BatchDecoder;
pub use errors::{CodecError, DecodeError, DecodeReason, Json2ArrowError, Result};
pub use record_conversion::RecordConverter;
pub use schema_conversion::{to_arrow, to_arrow_fields};
pub use temporal::TimeUnit;
pub use unify::{
    infer_from_reader, FieldDescriptor, FieldType, InferenceOptions, UnifiedSchema, Unifier,
};

pub mod exports {
    pub use arrow_array::RecordBatch;
    pub use arrow_schema::SchemaRef;
    pub use {arrow_array, arrow_schema};
    pub use serde_json;
}

/// How the production stream is cut into batches
#[derive(Debug, Clone)]
pub struct DecoderProps {
    pub rows_per_batch: usize,
}

impl Default for DecoderProps {
    fn default() -> Self {
        Self {
            rows_per_batch: 1024,
        }
    }
}

impl DecoderProps {
    pub fn with_rows_per_batch(mut self, size: usize) -> Self {
        self.rows_per_batch = size;
        self
    }
}
