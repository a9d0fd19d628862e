//! Incremental type unification of heterogeneous JSON records into one schema.
//!
//! Every record is first *observed* into a shape of its own, then *merged* into
//! the running state through a fixed promotion table:
//!
//! | existing \ incoming        | result                       |
//! |----------------------------|------------------------------|
//! | null, T / T, null          | T (field becomes nullable)   |
//! | T, T                       | T                            |
//! | integer, float             | float                        |
//! | timestamp(a), timestamp(b) | timestamp(finer of a and b)  |
//! | list(a), list(b)           | list(merge(a, b))            |
//! | record(a), record(b)       | record(merge(a, b))          |
//! | string, coerced text       | string                       |
//! | integer or float, epoch    | integer or float             |
//! | anything else              | `SchemaConflict`             |
//!
//! "Coerced text" is a boolean, number or timestamp read only from strings, and
//! "epoch" a timestamp read only from epoch-sized integers. Both fall back to
//! their literal JSON type as soon as a value that doesn't fit shows up.

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::temporal::{epoch_unit, parse_datetime, TimeUnit};
use crate::{Json2ArrowError, Result};

/// Switches that change how individual values are classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// `"123"` is an integer, `"1.5"` a float, `"true"` a boolean
    pub coerce_types: bool,
    /// datetime strings and epoch-sized integers become timestamps
    pub infer_time_units: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Timestamp { unit: TimeUnit },
    List { element: Box<FieldDescriptor> },
    Record { fields: Vec<FieldDescriptor> },
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Null => write!(f, "null"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::String => write!(f, "string"),
            FieldType::Timestamp { unit } => write!(f, "timestamp[{}]", unit.suffix()),
            FieldType::List { element } => write!(f, "list<{}>", element.field_type),
            FieldType::Record { .. } => write!(f, "record"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

/// The finished, read-only result of unification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedSchema {
    fields: Vec<FieldDescriptor>,
    options: InferenceOptions,
}

impl UnifiedSchema {
    pub(crate) fn from_parts(fields: Vec<FieldDescriptor>, options: InferenceOptions) -> Self {
        Self { fields, options }
    }

    /// Top level fields in first-seen order
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Options the schema was inferred with; decoding honours the same ones
    pub fn options(&self) -> InferenceOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for UnifiedSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn tree(f: &mut fmt::Formatter<'_>, fields: &[FieldDescriptor], depth: usize) -> fmt::Result {
            for field in fields {
                let null = if field.nullable { " (nullable)" } else { "" };
                writeln!(f, "{:indent$}{}: {}{}", "", field.name, field.field_type, null, indent = depth * 2)?;
                let mut inner = &field.field_type;
                while let FieldType::List { element } = inner {
                    inner = &element.field_type;
                }
                if let FieldType::Record { fields } = inner {
                    tree(f, fields, depth + 1)?;
                }
            }
            Ok(())
        }
        writeln!(f, "fields:")?;
        tree(f, &self.fields, 1)
    }
}

/// Folds sample records into a [`UnifiedSchema`].
#[derive(Debug, Clone, Default)]
pub struct Unifier {
    state: RecordState,
    options: InferenceOptions,
}

impl Unifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: InferenceOptions) -> Self {
        Self {
            state: RecordState::default(),
            options,
        }
    }

    pub fn with_type_coercion(mut self, enabled: bool) -> Self {
        self.options.coerce_types = enabled;
        self
    }

    pub fn with_time_unit_inference(mut self, enabled: bool) -> Self {
        self.options.infer_time_units = enabled;
        self
    }

    /// Merge one record. On error the running schema is left exactly as it was.
    pub fn unify(&mut self, record: &Value) -> Result<()> {
        let obj = record.as_object().ok_or(Json2ArrowError::NotAnObject {
            ordinal: self.state.seen,
        })?;

        let observed = observe_record(obj, "", self.options)?;
        let mut next = self.state.clone();
        merge_records(&mut next, observed, "")?;
        self.state = next;
        Ok(())
    }

    pub fn unify_json(&mut self, line: &str) -> Result<()> {
        let value: Value = serde_json::from_str(line)?;
        self.unify(&value)
    }

    pub fn records_seen(&self) -> u64 {
        self.state.seen
    }

    pub fn options(&self) -> InferenceOptions {
        self.options
    }

    /// Snapshot of the schema so far
    pub fn schema(&self) -> UnifiedSchema {
        UnifiedSchema::from_parts(self.state.descriptors(), self.options)
    }

    pub fn finish(self) -> UnifiedSchema {
        self.schema()
    }
}

/// Unify up to `sample_limit` non-blank lines of newline delimited JSON.
pub fn infer_from_reader<R: BufRead>(
    reader: R,
    options: InferenceOptions,
    sample_limit: Option<usize>,
) -> Result<UnifiedSchema> {
    let mut unifier = Unifier::with_options(options);
    let lines = reader
        .lines()
        .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
        .take(sample_limit.unwrap_or(usize::MAX));

    for line in lines {
        unifier.unify_json(&line?)?;
    }
    Ok(unifier.finish())
}

#[derive(Debug, Clone, Default)]
struct RecordState {
    fields: Vec<FieldState>,
    index: HashMap<String, usize>,
    /// number of objects observed at this path
    seen: u64,
}

#[derive(Debug, Clone)]
struct FieldState {
    name: String,
    shape: Shape,
    nullable: bool,
    /// number of observed objects that carried this field
    present: u64,
    origins: Origins,
}

/// Which kinds of JSON value a scalar shape was read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Origins {
    literal: bool,
    text: bool,
    epoch: bool,
}

impl Origins {
    const LITERAL: Self = Self {
        literal: true,
        text: false,
        epoch: false,
    };
    const TEXT: Self = Self {
        literal: false,
        text: true,
        epoch: false,
    };
    const EPOCH: Self = Self {
        literal: false,
        text: false,
        epoch: true,
    };

    fn union(self, other: Self) -> Self {
        Self {
            literal: self.literal || other.literal,
            text: self.text || other.text,
            epoch: self.epoch || other.epoch,
        }
    }
}

#[derive(Debug, Clone)]
enum Shape {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Timestamp(TimeUnit),
    List(Box<FieldState>),
    Record(RecordState),
}

impl RecordState {
    fn descriptors(&self) -> Vec<FieldDescriptor> {
        self.fields.iter().map(FieldState::descriptor).collect()
    }
}

impl FieldState {
    fn new(name: &str, shape: Shape, nullable: bool) -> Self {
        Self {
            name: name.to_owned(),
            shape,
            nullable,
            present: 1,
            origins: Origins::default(),
        }
    }

    fn descriptor(&self) -> FieldDescriptor {
        FieldDescriptor::new(&self.name, self.shape.field_type(), self.nullable)
    }
}

impl Shape {
    fn field_type(&self) -> FieldType {
        match self {
            Shape::Null => FieldType::Null,
            Shape::Boolean => FieldType::Boolean,
            Shape::Integer => FieldType::Integer,
            Shape::Float => FieldType::Float,
            Shape::String => FieldType::String,
            Shape::Timestamp(unit) => FieldType::Timestamp { unit: *unit },
            Shape::List(element) => FieldType::List {
                element: Box::new(element.descriptor()),
            },
            Shape::Record(record) => FieldType::Record {
                fields: record.descriptors(),
            },
        }
    }
}

fn child_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}

fn observe_record(obj: &Map<String, Value>, path: &str, opts: InferenceOptions) -> Result<RecordState> {
    let mut record = RecordState {
        seen: 1,
        ..Default::default()
    };
    for (name, value) in obj {
        let field = observe(name, value, &child_path(path, name), opts)?;
        record.index.insert(name.clone(), record.fields.len());
        record.fields.push(field);
    }
    Ok(record)
}

fn observe(name: &str, value: &Value, path: &str, opts: InferenceOptions) -> Result<FieldState> {
    let (shape, origins) = match value {
        Value::Null => return Ok(FieldState::new(name, Shape::Null, true)),
        Value::Bool(_) => (Shape::Boolean, Origins::LITERAL),
        Value::Number(n) => match n.as_i64() {
            Some(i) => match epoch_unit(i) {
                Some(unit) if opts.infer_time_units => (Shape::Timestamp(unit), Origins::EPOCH),
                _ => (Shape::Integer, Origins::LITERAL),
            },
            None => (Shape::Float, Origins::LITERAL),
        },
        Value::String(s) => classify_string(s, opts),
        Value::Array(items) => {
            let mut element = FieldState::new("item", Shape::Null, false);
            let element_path = format!("{path}[]");
            for item in items {
                let observed = observe("item", item, &element_path, opts)?;
                merge(&mut element, observed, &element_path)?;
            }
            (Shape::List(Box::new(element)), Origins::LITERAL)
        }
        Value::Object(obj) => (Shape::Record(observe_record(obj, path, opts)?), Origins::LITERAL),
    };
    Ok(FieldState {
        origins,
        ..FieldState::new(name, shape, false)
    })
}

fn classify_string(s: &str, opts: InferenceOptions) -> (Shape, Origins) {
    if opts.infer_time_units {
        if let Some((_, unit)) = parse_datetime(s) {
            return (Shape::Timestamp(unit), Origins::TEXT);
        }
    }
    if opts.coerce_types {
        if let Some(shape) = coerced_shape(s) {
            return (shape, Origins::TEXT);
        }
    }
    (Shape::String, Origins::LITERAL)
}

/// The more specific type a string unambiguously spells, if any
fn coerced_shape(s: &str) -> Option<Shape> {
    match s {
        "true" | "false" => Some(Shape::Boolean),
        _ if s.parse::<i64>().is_ok() => Some(Shape::Integer),
        _ => s
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && s.bytes().any(|b| b.is_ascii_digit()))
            .map(|_| Shape::Float),
    }
}

fn merge(existing: &mut FieldState, incoming: FieldState, path: &str) -> Result<()> {
    existing.nullable |= incoming.nullable;
    let (was, came) = (existing.origins, incoming.origins);
    existing.origins = was.union(came);
    let conflict = |existing: &Shape, incoming: &Shape| Json2ArrowError::SchemaConflict {
        path: path.to_owned(),
        existing: existing.field_type(),
        incoming: incoming.field_type(),
    };

    match (&mut existing.shape, incoming.shape) {
        (_, Shape::Null) => {}
        (shape @ Shape::Null, incoming) => *shape = incoming,
        (Shape::Boolean, Shape::Boolean)
        | (Shape::Integer, Shape::Integer)
        | (Shape::Float, Shape::Float)
        | (Shape::Float, Shape::Integer)
        | (Shape::String, Shape::String) => {}
        (shape @ Shape::Integer, Shape::Float) => *shape = Shape::Float,
        (Shape::Timestamp(unit), Shape::Timestamp(other)) => *unit = (*unit).max(other),
        (Shape::List(element), Shape::List(other)) => {
            merge(element, *other, &format!("{path}[]"))?;
        }
        (Shape::Record(record), Shape::Record(other)) => merge_records(record, other, path)?,
        (Shape::String, _) if came == Origins::TEXT => {}
        (shape, Shape::String) if was == Origins::TEXT => *shape = Shape::String,
        (Shape::Integer | Shape::Float, Shape::Timestamp(_)) if came == Origins::EPOCH => {}
        (shape @ Shape::Timestamp(_), incoming @ (Shape::Integer | Shape::Float))
            if was == Origins::EPOCH =>
        {
            *shape = incoming
        }
        (shape, incoming) => return Err(conflict(shape, &incoming)),
    }
    Ok(())
}

fn merge_records(existing: &mut RecordState, incoming: RecordState, path: &str) -> Result<()> {
    for field in incoming.fields {
        match existing.index.get(&field.name) {
            Some(&i) => {
                let current = &mut existing.fields[i];
                let present = field.present;
                let field_path = child_path(path, &field.name);
                merge(current, field, &field_path)?;
                current.present += present;
            }
            None => {
                existing.index.insert(field.name.clone(), existing.fields.len());
                existing.fields.push(field);
            }
        }
    }

    existing.seen += incoming.seen;
    for field in existing.fields.iter_mut() {
        if field.present < existing.seen {
            field.nullable = true;
        }
    }
    Ok(())
}
