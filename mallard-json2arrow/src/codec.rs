//! Persist a unified schema and restore it in a later run.
//!
//! The byte layout is one JSON document:
//! `{"format": "mallard.unified-schema", "version": 1, "options": {..}, "fields": [..]}`

use std::collections::HashSet;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::unify::{FieldDescriptor, FieldType, InferenceOptions, UnifiedSchema};

pub const FORMAT_TAG: &str = "mallard.unified-schema";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct Envelope<'a> {
    format: &'a str,
    version: u32,
    options: InferenceOptions,
    fields: &'a [FieldDescriptor],
}

/// Only the header, so unknown versions are reported as such rather than as
/// whatever field the newer layout happens to break on.
#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Deserialize)]
struct Body {
    options: InferenceOptions,
    fields: Vec<FieldDescriptor>,
}

/// Write `schema` to `sink`
pub fn export<W: Write>(schema: &UnifiedSchema, mut sink: W) -> Result<(), CodecError> {
    let envelope = Envelope {
        format: FORMAT_TAG,
        version: FORMAT_VERSION,
        options: schema.options(),
        fields: schema.fields(),
    };
    serde_json::to_writer_pretty(&mut sink, &envelope).map_err(CodecError::Malformed)?;
    sink.flush()?;
    Ok(())
}

pub fn export_to_vec(schema: &UnifiedSchema) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    export(schema, &mut bytes)?;
    Ok(bytes)
}

pub fn import_from_slice(bytes: &[u8]) -> Result<UnifiedSchema, CodecError> {
    let header: Header = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    if header.format != FORMAT_TAG {
        return Err(CodecError::UnknownFormat(header.format));
    }
    if header.version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(header.version));
    }

    let body: Body = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    validate(&body.fields, "")?;
    Ok(UnifiedSchema::from_parts(body.fields, body.options))
}

pub fn import<R: Read>(mut source: R) -> Result<UnifiedSchema, CodecError> {
    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes)?;
    import_from_slice(&bytes)
}

fn validate(fields: &[FieldDescriptor], path: &str) -> Result<(), CodecError> {
    let mut names = HashSet::with_capacity(fields.len());
    for field in fields {
        if field.name.is_empty() {
            return Err(CodecError::Invalid(format!("empty field name under `{path}`")));
        }
        if !names.insert(field.name.as_str()) {
            return Err(CodecError::Invalid(format!(
                "duplicate field `{}` under `{path}`",
                field.name
            )));
        }
        let mut inner = &field.field_type;
        while let FieldType::List { element } = inner {
            inner = &element.field_type;
        }
        if let FieldType::Record { fields } = inner {
            validate(fields, &format!("{path}/{}", field.name))?;
        }
    }
    Ok(())
}
