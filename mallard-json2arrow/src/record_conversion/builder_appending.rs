use arrow_array::builder::*;
use serde_json::{Map, Value};

use crate::errors::DecodeReason;
use crate::temporal::{epoch_unit, parse_datetime, rescale, ticks, TimeUnit};
use crate::unify::{FieldDescriptor, FieldType, InferenceOptions};

type Appended = core::result::Result<(), DecodeReason>;

/// Append one JSON object (or a null in its place) as a row of `builder`.
/// The i-th field builder must be the ArrayBuilder for the i-th descriptor.
pub fn append_all_fields(
    fields: &[FieldDescriptor],
    builder: &mut StructBuilder,
    obj: Option<&Map<String, Value>>,
    path: &str,
    opts: InferenceOptions,
) -> Appended {
    if let Some(obj) = obj {
        if let Some(unknown) = obj.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
            return Err(DecodeReason::UnknownField(child_path(path, unknown)));
        }
    }

    for (i, field) in fields.iter().enumerate() {
        let field_path = child_path(path, &field.name);
        let val = obj
            .and_then(|obj| obj.get(&field.name))
            .filter(|v| !v.is_null());

        // nulls under a null parent are masked, anywhere else they must be allowed
        if val.is_none() && obj.is_some() && !field.nullable {
            return Err(DecodeReason::UnexpectedNull(field_path));
        }

        let child = field_builder(builder, i, &field.field_type)
            .ok_or_else(|| DecodeReason::BuilderMismatch(field_path.clone()))?;
        append_value(field, child, val, &field_path, opts)?;
    }
    builder.append(obj.is_some());
    Ok(())
}

fn append_value(
    f: &FieldDescriptor,
    builder: &mut dyn ArrayBuilder,
    val: Option<&Value>,
    path: &str,
    opts: InferenceOptions,
) -> Appended {
    let mismatch = |v: &Value| DecodeReason::TypeMismatch {
        path: path.to_owned(),
        expected: f.field_type.clone(),
        found: describe(v),
    };

    match &f.field_type {
        FieldType::Boolean => downcast::<BooleanBuilder>(builder, path)?
            .append_option(parse_val(val, |v| as_bool(v, opts), mismatch)?),
        FieldType::Integer => downcast::<Int64Builder>(builder, path)?
            .append_option(parse_val(val, |v| as_i64(v, opts), mismatch)?),
        FieldType::Float => downcast::<Float64Builder>(builder, path)?
            .append_option(parse_val(val, |v| as_f64(v, opts), mismatch)?),
        FieldType::String => downcast::<StringBuilder>(builder, path)?
            .append_option(parse_val(val, Value::as_str, mismatch)?),
        FieldType::Null => downcast::<StringBuilder>(builder, path)?
            .append_option(parse_val(val, |_| None::<&str>, mismatch)?),
        FieldType::Timestamp { unit } => {
            let ticks = parse_val(val, |v| as_timestamp(v, *unit), mismatch)?;
            match unit {
                TimeUnit::Second => downcast::<TimestampSecondBuilder>(builder, path)?.append_option(ticks),
                TimeUnit::Millisecond => {
                    downcast::<TimestampMillisecondBuilder>(builder, path)?.append_option(ticks)
                }
                TimeUnit::Microsecond => {
                    downcast::<TimestampMicrosecondBuilder>(builder, path)?.append_option(ticks)
                }
                TimeUnit::Nanosecond => {
                    downcast::<TimestampNanosecondBuilder>(builder, path)?.append_option(ticks)
                }
            }
        }
        FieldType::List { element } => {
            let b = downcast::<ListBuilder<Box<dyn ArrayBuilder>>>(builder, path)?;
            match val {
                Some(Value::Array(items)) => {
                    let element_path = format!("{path}[]");
                    for item in items {
                        let item = Some(item).filter(|v| !v.is_null());
                        if item.is_none() && !element.nullable {
                            return Err(DecodeReason::UnexpectedNull(element_path));
                        }
                        append_value(element, b.values().as_mut(), item, &element_path, opts)?;
                    }
                    b.append(true);
                }
                Some(other) => return Err(mismatch(other)),
                None => b.append(false),
            }
        }
        FieldType::Record { fields } => {
            let b = downcast::<StructBuilder>(builder, path)?;
            match val {
                Some(Value::Object(obj)) => append_all_fields(fields, b, Some(obj), path, opts)?,
                Some(other) => return Err(mismatch(other)),
                None => append_all_fields(fields, b, None, path, opts)?,
            }
        }
    }
    Ok(())
}

/// The i-th child of a struct builder as the concrete builder its type implies
fn field_builder<'a>(
    builder: &'a mut StructBuilder,
    i: usize,
    kind: &FieldType,
) -> Option<&'a mut dyn ArrayBuilder> {
    fn erase<T: ArrayBuilder>(b: &mut T) -> &mut dyn ArrayBuilder {
        b
    }

    match kind {
        FieldType::Boolean => builder.field_builder::<BooleanBuilder>(i).map(erase),
        FieldType::Integer => builder.field_builder::<Int64Builder>(i).map(erase),
        FieldType::Float => builder.field_builder::<Float64Builder>(i).map(erase),
        FieldType::String | FieldType::Null => builder.field_builder::<StringBuilder>(i).map(erase),
        FieldType::Timestamp { unit } => match unit {
            TimeUnit::Second => builder.field_builder::<TimestampSecondBuilder>(i).map(erase),
            TimeUnit::Millisecond => builder
                .field_builder::<TimestampMillisecondBuilder>(i)
                .map(erase),
            TimeUnit::Microsecond => builder
                .field_builder::<TimestampMicrosecondBuilder>(i)
                .map(erase),
            TimeUnit::Nanosecond => builder
                .field_builder::<TimestampNanosecondBuilder>(i)
                .map(erase),
        },
        FieldType::List { .. } => builder
            .field_builder::<ListBuilder<Box<dyn ArrayBuilder>>>(i)
            .map(erase),
        FieldType::Record { .. } => builder.field_builder::<StructBuilder>(i).map(erase),
    }
}

fn downcast<'a, T: ArrayBuilder>(
    builder: &'a mut dyn ArrayBuilder,
    path: &str,
) -> core::result::Result<&'a mut T, DecodeReason> {
    builder
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| DecodeReason::BuilderMismatch(path.to_owned()))
}

fn parse_val<'val, R, F, M>(
    value: Option<&'val Value>,
    getter: F,
    mismatch: M,
) -> core::result::Result<Option<R>, DecodeReason>
where
    F: Fn(&'val Value) -> Option<R>,
    M: Fn(&Value) -> DecodeReason,
{
    value
        .map(|v| getter(v).ok_or_else(|| mismatch(v)))
        .transpose()
}

fn as_bool(v: &Value, opts: InferenceOptions) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) if opts.coerce_types => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_i64(v: &Value, opts: InferenceOptions) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if opts.coerce_types => s.parse().ok(),
        _ => None,
    }
}

fn as_f64(v: &Value, opts: InferenceOptions) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if opts.coerce_types => s.parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn as_timestamp(v: &Value, unit: TimeUnit) -> Option<i64> {
    match v {
        Value::String(s) => parse_datetime(s).and_then(|(dt, _)| ticks(&dt, unit)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            rescale(raw, epoch_unit(raw)?, unit)
        }
        _ => None,
    }
}

fn describe(v: &Value) -> String {
    let mut s = v.to_string();
    if s.len() > 40 {
        let mut cut = 40;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

fn child_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}
