use arrow_array::builder::*;
use arrow_schema::{ArrowError, DataType, Field, Fields, TimeUnit};

use crate::errors::Result;
use crate::Json2ArrowError::BatchConversion;

pub fn try_from_fields(fields: &Fields, capacity: usize) -> Result<StructBuilder> {
    let field_builders: Vec<Box<dyn ArrayBuilder>> = fields
        .iter()
        .map(|f| make_builder(f, capacity))
        .collect::<Result<Vec<_>>>()?;
    Ok(StructBuilder::new(fields.clone(), field_builders))
}

/// Create the appropriate ArrayBuilder for the given field and capacity
fn make_builder(field: &Field, capacity: usize) -> Result<Box<dyn ArrayBuilder>> {
    Ok(match field.data_type() {
        DataType::Boolean => Box::new(BooleanBuilder::with_capacity(capacity)),
        DataType::Int64 => Box::new(Int64Builder::with_capacity(capacity)),
        DataType::Float64 => Box::new(Float64Builder::with_capacity(capacity)),
        DataType::Utf8 => Box::new(StringBuilder::with_capacity(capacity, 1024)),
        DataType::Timestamp(TimeUnit::Second, None) => {
            Box::new(TimestampSecondBuilder::with_capacity(capacity))
        }
        DataType::Timestamp(TimeUnit::Millisecond, None) => {
            Box::new(TimestampMillisecondBuilder::with_capacity(capacity))
        }
        DataType::Timestamp(TimeUnit::Microsecond, None) => {
            Box::new(TimestampMicrosecondBuilder::with_capacity(capacity))
        }
        DataType::Timestamp(TimeUnit::Nanosecond, None) => {
            Box::new(TimestampNanosecondBuilder::with_capacity(capacity))
        }
        // the item field carries the element nullability, the default "item" field would not
        DataType::List(inner) => Box::new(
            ListBuilder::with_capacity(make_builder(inner, capacity)?, capacity)
                .with_field(inner.clone()),
        ),
        DataType::Struct(fields) => Box::new(try_from_fields(fields, capacity)?),
        t => {
            return Err(BatchConversion(ArrowError::NotYetImplemented(format!(
                "no column builder for {t:?}"
            ))))
        }
    })
}
