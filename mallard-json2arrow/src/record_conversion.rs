use arrow_array::builder::*;
use arrow_array::{RecordBatch, StructArray};
use arrow_schema::SchemaRef;
use serde_json::Value;

use crate::errors::DecodeReason;
use crate::unify::UnifiedSchema;
use crate::Result;

use self::builder_appending::append_all_fields;
use self::builder_creation::try_from_fields;

mod builder_appending;
mod builder_creation;

/// Accumulates JSON objects as rows and returns them as a RecordBatch
pub struct RecordConverter {
    unified: UnifiedSchema,
    schema: SchemaRef,
    capacity: usize,
    builder: StructBuilder, // fields align with schema
}

impl RecordConverter {
    pub fn try_new(unified: &UnifiedSchema, capacity: usize) -> Result<Self> {
        let schema = unified.arrow_schema();
        let builder = try_from_fields(schema.fields(), capacity)?;
        Ok(RecordConverter {
            unified: unified.clone(),
            schema,
            capacity,
            builder,
        })
    }

    /// Append one record. On error the builder may hold a partial row and
    /// must be [`reset`](Self::reset) before it is used again.
    pub fn append_value(&mut self, record: &Value) -> core::result::Result<(), DecodeReason> {
        let Value::Object(obj) = record else {
            return Err(DecodeReason::NotAnObject("$".to_owned()));
        };
        append_all_fields(
            self.unified.fields(),
            &mut self.builder,
            Some(obj),
            "",
            self.unified.options(),
        )
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Number of rows in this batch so far
    pub fn len(&self) -> usize {
        self.builder.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every row appended since the last batch, including partial ones
    pub fn reset(&mut self) -> Result<()> {
        self.builder = try_from_fields(self.schema.fields(), self.capacity)?;
        Ok(())
    }

    /// Finish the rows appended so far into a batch and start a new one
    pub fn records(&mut self) -> RecordBatch {
        RecordBatch::from(self)
    }
}

impl From<&mut RecordConverter> for RecordBatch {
    fn from(converter: &mut RecordConverter) -> Self {
        let struct_array: StructArray = converter.builder.finish();
        RecordBatch::from(struct_array)
    }
}
