//! Convert a unified schema into an Apache Arrow Schema.
//!

use std::sync::Arc;

use arrow_schema::{DataType, Field, Fields, Schema, SchemaRef};

use crate::unify::{FieldDescriptor, FieldType, UnifiedSchema};

impl UnifiedSchema {
    /// Arrow schema the decoder fills and the sink hands to the store
    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(to_arrow_fields(self.fields())))
    }
}

pub fn to_arrow_fields(fields: &[FieldDescriptor]) -> Fields {
    fields.iter().map(to_arrow).collect()
}

/// Convert a field descriptor to an arrow Field
pub fn to_arrow(f: &FieldDescriptor) -> Field {
    Field::new(&f.name, kind_to_type(&f.field_type), f.nullable)
}

fn kind_to_type(kind: &FieldType) -> DataType {
    match kind {
        FieldType::Boolean => DataType::Boolean,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::String => DataType::Utf8,
        // naive UTC, offsets are applied while decoding
        FieldType::Timestamp { unit } => DataType::Timestamp((*unit).into(), None),
        FieldType::List { element } => DataType::List(Arc::new(to_arrow(element))),
        FieldType::Record { fields } => DataType::Struct(to_arrow_fields(fields)),
        // never saw a value; keep the column so stored relations stay stable
        FieldType::Null => DataType::Utf8,
    }
}
