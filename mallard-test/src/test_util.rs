use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use mallard_ingestor::{ConnectionPool, Deadline};
use mallard_json2arrow::{InferenceOptions, UnifiedSchema, Unifier};

const NAMES: [&str; 5] = ["Ada", "Grace", "Linus", "Barbara", "Ken"];
const WORDS: [&str; 6] = ["duck", "arrow", "batch", "quack", "column", "pond"];

/// 2023-05-01T00:00:00Z
const EPOCH_BASE: i64 = 1_682_899_200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Foo {
    pub str: String,
    pub int: i64,
    pub pointer: Option<i64>,
    pub name: String,
    pub sentence: String,
    pub rand_str: String,
    /// numeric, but spelled as a string
    pub number: String,
    pub regex: String,
    pub array: Vec<String>,
    pub array_range: Vec<String>,
    pub bar: Bar,
    /// never set
    pub skip: Option<String>,
    pub created: String,
    pub created_format: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bar {
    pub name: String,
    pub number: i64,
    pub float: f64,
    pub array_range: Vec<String>,
}

impl Foo {
    /// The `i`th record of a deterministic sample stream
    pub fn nth(i: usize) -> Self {
        let word = |k: usize| WORDS[(i + k) % WORDS.len()].to_owned();
        let created = Utc
            .timestamp_opt(EPOCH_BASE + 60 * i as i64, 123_000_000)
            .single()
            .unwrap_or_default();

        Foo {
            str: format!("str-{i}"),
            int: (i * 7) as i64,
            pointer: (i % 2 == 0).then_some(i as i64),
            name: NAMES[i % NAMES.len()].to_owned(),
            sentence: (0..3).map(word).collect::<Vec<_>>().join(" "),
            rand_str: if i % 3 == 0 { "hello" } else { "world" }.to_owned(),
            number: (1 + i % 10).to_string(),
            regex: (0..5)
                .map(|k| (b'a' + ((i + k) % 6) as u8) as char)
                .collect(),
            array: (0..2).map(word).collect(),
            array_range: (0..2 + i % 5).map(word).collect(),
            bar: Bar {
                name: NAMES[(i + 1) % NAMES.len()].to_owned(),
                number: i as i64,
                float: i as f64 + 0.25,
                array_range: (0..2 + (i + 3) % 5).map(word).collect(),
            },
            skip: None,
            created: created.to_rfc3339_opts(SecondsFormat::Millis, true),
            created_format: created.format("%Y-%m-%d").to_string(),
        }
    }
}

pub fn foos(n: usize) -> Vec<Foo> {
    (0..n).map(Foo::nth).collect()
}

pub fn to_values<T: Serialize>(records: &[T]) -> Result<Vec<Value>> {
    Ok(records
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<_>>()?)
}

/// Newline delimited JSON, one record per line
pub fn to_ndjson<T: Serialize>(records: &[T]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn unify_all(records: &[Value], options: InferenceOptions) -> Result<UnifiedSchema> {
    let mut unifier = Unifier::with_options(options);
    for record in records {
        unifier.unify(record)?;
    }
    Ok(unifier.finish())
}

pub fn all_options() -> InferenceOptions {
    InferenceOptions {
        coerce_types: true,
        infer_time_units: true,
    }
}

pub async fn count_rows(pool: &Arc<ConnectionPool>, table: &str) -> Result<i64> {
    let conn = pool.lease(Deadline::none()).await?;
    let count = conn.query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}
