//! Create-or-append ingestion of record batches into one DuckDB relation.
//!
//! The first batch to reach an absent relation creates it from the batch's
//! own schema; every later batch is appended by column name. Each write runs in
//! its own transaction together with the catalog checks it depends on, so a
//! batch is either fully stored or not at all.
//!
//! Creates through one sink run one at a time: a writer that finds the relation
//! absent waits for any create in flight, looks the relation up again and
//! appends if it lost.
//! A create that still fails because the relation appeared (another sink or
//! process got there first) is retried as an append.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use duckdb::Connection;
use itertools::Itertools;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::block_in_place;
use tokio::time::timeout_at;
use tracing::debug;

use crate::deadline::Deadline;
use crate::pool::ConnectionPool;
use crate::view::ArrowView;
use crate::{errors::IngestorError, Result};

/// How strictly batch columns must line up with an existing relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColumnMatching {
    /// every batch column must exist in the relation
    #[default]
    Subset,
    /// batch and relation columns must be the same set
    Exact,
}

/// Which path a batch took into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Created,
    Appended,
}

#[derive(Debug, Clone)]
pub struct SinkProps {
    pub table: String,
    pub column_matching: ColumnMatching,
    /// Retries after losing a create race outside this sink, for calls
    /// without a deadline. A deadline bounds the retries on its own.
    pub race_retries: u32,
    pub race_backoff: Duration,
}

impl SinkProps {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column_matching: ColumnMatching::default(),
            race_retries: 8,
            race_backoff: Duration::from_millis(5),
        }
    }

    pub fn with_column_matching(mut self, column_matching: ColumnMatching) -> Self {
        self.column_matching = column_matching;
        self
    }

    pub fn with_race_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.race_retries = retries;
        self.race_backoff = backoff;
        self
    }
}

/// Backoff stops growing after this many lost races
const MAX_BACKOFF_STEPS: u32 = 20;

enum Attempt {
    Landed(Landing),
    /// someone else created the relation between our lookup and our create
    LostRace(duckdb::Error),
}

pub struct DuckDbSink {
    pool: Arc<ConnectionPool>,
    schema: SchemaRef,
    props: SinkProps,
    quoted_table: String,
    creating: Mutex<()>,
}

impl DuckDbSink {
    pub fn new(pool: Arc<ConnectionPool>, schema: SchemaRef, props: SinkProps) -> Result<Self> {
        if props.table.is_empty() {
            return Err(IngestorError::InvalidConfig(
                "destination table name is empty".to_owned(),
            ));
        }
        let quoted_table = quote_identifier(&props.table);
        Ok(Self {
            pool,
            schema,
            props,
            quoted_table,
            creating: Mutex::new(()),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn table(&self) -> &str {
        &self.props.table
    }

    /// Write `batch` to the destination relation, creating it if it doesn't exist.
    ///
    /// Requires the multi-threaded runtime: store statements run in
    /// [`block_in_place`]. The leased connection is returned on every exit path.
    pub async fn ingest(&self, batch: RecordBatch, deadline: Deadline) -> Result<Landing> {
        if batch.schema() != self.schema {
            return Err(self.mismatch("batch schema differs from the sink schema".to_owned()));
        }

        let mut conn = self.pool.lease(deadline).await?;
        let view = ArrowView::new(batch);

        let mut lost = 0;
        loop {
            deadline.check()?;
            let pause = {
                if block_in_place(|| self.relation_exists(&conn))? {
                    block_in_place(|| self.append(&mut conn, &view, deadline))?;
                    return Ok(self.landed(&view, Landing::Appended));
                }

                let _creating = self.lock_creates(deadline).await?;
                match block_in_place(|| self.create_or_append(&mut conn, &view, deadline))? {
                    Attempt::Landed(landing) => return Ok(self.landed(&view, landing)),
                    Attempt::LostRace(e) => {
                        lost += 1;
                        if deadline.instant().is_none() && lost > self.props.race_retries {
                            return Err(IngestorError::Store(e));
                        }
                        debug!(table = %self.props.table, attempt = lost, error = %e, "lost create race, retrying as append");
                        self.props.race_backoff * lost.min(MAX_BACKOFF_STEPS)
                    }
                }
            };
            tokio::time::sleep(pause).await;
        }
    }

    fn landed(&self, view: &ArrowView, landing: Landing) -> Landing {
        debug!(table = %self.props.table, rows = view.num_rows(), ?landing, "ingested batch");
        landing
    }

    async fn lock_creates(&self, deadline: Deadline) -> Result<MutexGuard<'_, ()>> {
        match deadline.instant() {
            Some(at) => timeout_at(at, self.creating.lock())
                .await
                .map_err(|_| IngestorError::Cancelled),
            None => Ok(self.creating.lock().await),
        }
    }

    /// Runs with the create lock held, so a create in flight on this sink has
    /// committed by the time of the lookup.
    fn create_or_append(&self, conn: &mut Connection, view: &ArrowView, deadline: Deadline) -> Result<Attempt> {
        deadline.check()?;
        if self.relation_exists(conn)? {
            self.append(conn, view, deadline)?;
            return Ok(Attempt::Landed(Landing::Appended));
        }

        debug!(table = %self.props.table, "relation absent, creating");
        deadline.check()?;
        let tx = conn.transaction()?;
        let created = view
            .execute(&tx, &self.create_sql(), &self.append_sql())
            .and_then(|_| tx.commit());
        match created {
            Ok(()) => Ok(Attempt::Landed(Landing::Created)),
            Err(e) if lost_create_race(&e) => Ok(Attempt::LostRace(e)),
            Err(e) => Err(IngestorError::Store(e)),
        }
    }

    /// The column check and the insert share a transaction, so the insert only
    /// runs against a relation the check has seen.
    fn append(&self, conn: &mut Connection, view: &ArrowView, deadline: Deadline) -> Result<()> {
        deadline.check()?;
        let tx = conn.transaction()?;
        self.check_columns(&tx)?;
        deadline.check()?;
        let append = self.append_sql();
        view.execute(&tx, &append, &append)?;
        tx.commit()?;
        Ok(())
    }

    fn create_sql(&self) -> String {
        format!("CREATE TABLE {} AS SELECT * FROM {}", self.quoted_table, ArrowView::SCAN)
    }

    fn append_sql(&self) -> String {
        format!("INSERT INTO {} BY NAME SELECT * FROM {}", self.quoted_table, ArrowView::SCAN)
    }

    /// Catalog lookup, so an unreachable store is an error rather than "absent"
    fn relation_exists(&self, conn: &Connection) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = current_schema() AND lower(table_name) = lower(?)",
            [&self.props.table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn relation_columns(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND lower(table_name) = lower(?) \
             ORDER BY ordinal_position",
        )?;
        let columns = stmt
            .query_map([&self.props.table], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn check_columns(&self, conn: &Connection) -> Result<()> {
        let relation = self.relation_columns(conn)?;
        let batch = self.schema.fields().iter().map(|f| f.name().clone());

        let detail = match column_differences(batch, relation, self.props.column_matching) {
            (extra, _) if !extra.is_empty() => {
                format!("columns not in relation: {}", extra.iter().join(", "))
            }
            (_, missing) if !missing.is_empty() => {
                format!("relation columns missing from batch: {}", missing.iter().join(", "))
            }
            _ => return Ok(()),
        };
        Err(self.mismatch(detail))
    }

    fn mismatch(&self, detail: String) -> IngestorError {
        IngestorError::SchemaMismatch {
            table: self.props.table.clone(),
            detail,
        }
    }
}

/// Batch columns absent from the relation, and under `Exact` relation columns
/// absent from the batch. Names compare case-insensitively, as DuckDB does.
fn column_differences(
    batch: impl IntoIterator<Item = String>,
    relation: impl IntoIterator<Item = String>,
    matching: ColumnMatching,
) -> (Vec<String>, Vec<String>) {
    let batch: Vec<String> = batch.into_iter().collect();
    let relation: Vec<String> = relation.into_iter().collect();
    let lower = |names: &[String]| -> HashSet<String> {
        names.iter().map(|n| n.to_lowercase()).collect()
    };
    let (batch_set, relation_set) = (lower(&batch), lower(&relation));

    let extra = batch
        .into_iter()
        .filter(|n| !relation_set.contains(&n.to_lowercase()))
        .collect();
    let missing = match matching {
        ColumnMatching::Subset => vec![],
        ColumnMatching::Exact => relation
            .into_iter()
            .filter(|n| !batch_set.contains(&n.to_lowercase()))
            .collect(),
    };
    (extra, missing)
}

fn lost_create_race(e: &duckdb::Error) -> bool {
    let msg = e.to_string();
    msg.contains("already exists") || msg.contains("write-write conflict")
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use arrow_array::{Float64Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;
    use crate::PoolProps;

    fn batch_of(names: &[&str], rows: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(
            names
                .iter()
                .map(|n| Field::new(*n, DataType::Int64, false))
                .collect::<Vec<_>>(),
        ));
        let columns = names
            .iter()
            .map(|_| Arc::new(Int64Array::from_iter_values(0..rows)) as _)
            .collect();
        RecordBatch::try_new(schema, columns).unwrap()
    }

    async fn count_rows(pool: &ConnectionPool, table: &str) -> anyhow::Result<i64> {
        let conn = pool.lease(Deadline::none()).await?;
        let sql = format!("SELECT count(*) FROM {}", quote_identifier(table));
        Ok(conn.query_row(&sql, [], |r| r.get(0))?)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_batch_twice_creates_then_appends() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let batch = batch_of(&["a", "b"], 10);
        let sink = DuckDbSink::new(pool.clone(), batch.schema(), SinkProps::new("t1"))?;

        assert_eq!(sink.ingest(batch.clone(), Deadline::none()).await?, Landing::Created);
        assert_eq!(sink.ingest(batch, Deadline::none()).await?, Landing::Appended);
        assert_eq!(count_rows(&pool, "t1").await?, 20);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_first_writers() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let batch = batch_of(&["a"], 100);
        let sink = Arc::new(DuckDbSink::new(pool.clone(), batch.schema(), SinkProps::new("race"))?);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let (sink, batch) = (sink.clone(), batch.clone());
            tasks.spawn(async move { sink.ingest(batch, Deadline::none()).await });
        }
        let mut landings = vec![];
        while let Some(landing) = tasks.join_next().await {
            landings.push(landing??);
        }

        assert_eq!(landings.iter().filter(|l| **l == Landing::Created).count(), 1);
        assert_eq!(count_rows(&pool, "race").await?, 400);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_first_create_loses_no_rows() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let batch = batch_of(&["a", "b", "c"], 200_000);
        // losing a race would fail the batch outright
        let props = SinkProps::new("big").with_race_retries(0, Duration::ZERO);
        let sink = Arc::new(DuckDbSink::new(pool.clone(), batch.schema(), props)?);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let (sink, batch) = (sink.clone(), batch.clone());
            tasks.spawn(async move { sink.ingest(batch, Deadline::none()).await });
        }
        let mut landings = vec![];
        while let Some(landing) = tasks.join_next().await {
            landings.push(landing??);
        }

        assert_eq!(landings.iter().filter(|l| **l == Landing::Created).count(), 1);
        assert_eq!(count_rows(&pool, "big").await?, 800_000);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batches_over_one_scan_land_whole() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let batch = batch_of(&["a", "b"], 5000);
        let sink = DuckDbSink::new(pool.clone(), batch.schema(), SinkProps::new("wide"))?;

        assert_eq!(sink.ingest(batch.clone(), Deadline::none()).await?, Landing::Created);
        assert_eq!(count_rows(&pool, "wide").await?, 5000);
        assert_eq!(sink.ingest(batch, Deadline::none()).await?, Landing::Appended);

        let conn = pool.lease(Deadline::none()).await?;
        let (rows, distinct): (i64, i64) =
            conn.query_row("SELECT count(*), count(DISTINCT a) FROM wide", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
        assert_eq!((rows, distinct), (10_000, 5000));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_columns_absent_from_relation_are_rejected() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let narrow = batch_of(&["a"], 1);
        DuckDbSink::new(pool.clone(), narrow.schema(), SinkProps::new("t"))?
            .ingest(narrow, Deadline::none())
            .await?;

        let wide = batch_of(&["A", "b"], 1);
        let sink = DuckDbSink::new(pool.clone(), wide.schema(), SinkProps::new("t"))?;
        match sink.ingest(wide, Deadline::none()).await {
            Err(IngestorError::SchemaMismatch { table, detail }) => {
                assert_eq!(table, "t");
                assert_eq!(detail, "columns not in relation: b");
            }
            other => panic!("expected a schema mismatch, got {other:?}"),
        }
        assert_eq!(pool.available(), 10);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_must_match_sink_schema() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, true)]));
        let sink = DuckDbSink::new(pool, schema, SinkProps::new("t"))?;

        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)])),
            vec![Arc::new(Float64Array::from(vec![1.0]))],
        )?;
        assert!(matches!(
            sink.ingest(other, Deadline::none()).await,
            Err(IngestorError::SchemaMismatch { .. })
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expired_deadline_cancels_and_returns_lease() -> anyhow::Result<()> {
        let pool = Arc::new(ConnectionPool::open(PoolProps::default().with_max_open(1))?);
        let batch = batch_of(&["a"], 3);
        let sink = DuckDbSink::new(pool.clone(), batch.schema(), SinkProps::new("late"))?;

        let result = sink.ingest(batch, Deadline::after(Duration::ZERO)).await;
        assert!(matches!(result, Err(IngestorError::Cancelled)));
        assert_eq!(pool.available(), 1);

        let conn = pool.lease(Deadline::none()).await?;
        let tables: i64 = conn.query_row(
            "SELECT count(*) FROM information_schema.tables WHERE table_name = 'late'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(tables, 0);
        Ok(())
    }

    #[test]
    fn test_exact_matching_reports_missing_relation_columns() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let (extra, missing) = column_differences(
            names(&["ID", "name"]),
            names(&["id", "name", "score"]),
            ColumnMatching::Exact,
        );
        assert!(extra.is_empty());
        assert_eq!(missing, vec!["score"]);

        let (_, missing) = column_differences(
            names(&["id"]),
            names(&["id", "score"]),
            ColumnMatching::Subset,
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("t1"), "\"t1\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
