use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use mallard_json2arrow::{BatchDecoder, DecoderProps, Json2ArrowError, UnifiedSchema};
use tokio::task::{block_in_place, JoinError, JoinSet};
use tracing::{debug, warn};

use crate::deadline::Deadline;
use crate::sink::{DuckDbSink, Landing};
use crate::{errors::IngestorError, Result};

/// What to do with a batch the decoder rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeErrorPolicy {
    /// fail the whole run
    #[default]
    Abort,
    /// log it, count it and carry on with the next batch
    Skip,
}

#[derive(Debug, Clone)]
pub struct PipelineProps {
    pub decoder: DecoderProps,
    /// batches in flight at once
    pub workers: usize,
    pub on_decode_error: DecodeErrorPolicy,
    /// per batch, from hand-off to the sink until it is stored
    pub batch_timeout: Option<Duration>,
}

impl Default for PipelineProps {
    fn default() -> Self {
        Self {
            decoder: DecoderProps::default(),
            workers: 4,
            on_decode_error: DecodeErrorPolicy::default(),
            batch_timeout: None,
        }
    }
}

impl PipelineProps {
    pub fn with_rows_per_batch(mut self, size: usize) -> Self {
        self.decoder = self.decoder.with_rows_per_batch(size);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.on_decode_error = policy;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub records: u64,
    pub batches: u64,
    pub created: u64,
    pub appended: u64,
    pub skipped_batches: u64,
}

type Ingested = Result<(Landing, u64)>;

/// Decodes a newline delimited JSON stream and hands every batch to a sink,
/// with at most `workers` batches in flight.
pub struct IngestPipeline {
    sink: Arc<DuckDbSink>,
    props: PipelineProps,
}

impl IngestPipeline {
    pub fn new(sink: Arc<DuckDbSink>, props: PipelineProps) -> Result<Self> {
        if props.workers == 0 {
            return Err(IngestorError::InvalidConfig(
                "workers must be at least 1".to_owned(),
            ));
        }
        Ok(Self { sink, props })
    }

    /// Requires the multi-threaded runtime. Batches already handed to the sink
    /// when the run fails are abandoned.
    pub async fn run<R: BufRead>(&self, schema: &UnifiedSchema, reader: R) -> Result<IngestStats> {
        if schema.arrow_schema() != self.sink.schema() {
            return Err(IngestorError::SchemaMismatch {
                table: self.sink.table().to_owned(),
                detail: "decoder schema differs from the sink schema".to_owned(),
            });
        }

        let mut decoder = BatchDecoder::try_new(schema, reader, &self.props.decoder)?;
        let mut tasks: JoinSet<Ingested> = JoinSet::new();
        let mut stats = IngestStats::default();

        loop {
            let batch = match block_in_place(|| decoder.next_batch()) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(Json2ArrowError::Decode(e))
                    if self.props.on_decode_error == DecodeErrorPolicy::Skip =>
                {
                    warn!(ordinal = e.ordinal, reason = %e.reason, "skipping rejected batch");
                    stats.skipped_batches += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            while tasks.len() >= self.props.workers {
                if let Some(joined) = tasks.join_next().await {
                    tally(&mut stats, joined)?;
                }
            }

            let sink = self.sink.clone();
            let deadline = Deadline::from_timeout(self.props.batch_timeout);
            let rows = batch.num_rows() as u64;
            tasks.spawn(async move { Ok((sink.ingest(batch, deadline).await?, rows)) });
        }

        while let Some(joined) = tasks.join_next().await {
            tally(&mut stats, joined)?;
        }
        debug!(?stats, decoded = decoder.records_decoded(), "pipeline drained");
        Ok(stats)
    }
}

fn tally(stats: &mut IngestStats, joined: core::result::Result<Ingested, JoinError>) -> Result<()> {
    let (landing, rows) = joined??;
    stats.batches += 1;
    stats.records += rows;
    match landing {
        Landing::Created => stats.created += 1,
        Landing::Appended => stats.appended += 1,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ConnectionPool, PoolProps, SinkProps};
    use mallard_json2arrow::Unifier;

    fn setup(table: &str) -> anyhow::Result<(Arc<ConnectionPool>, Arc<DuckDbSink>, UnifiedSchema)> {
        let mut unifier = Unifier::new();
        unifier.unify(&json!({"id": 1, "tags": ["a"]}))?;
        let schema = unifier.finish();

        let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
        let sink = DuckDbSink::new(pool.clone(), schema.arrow_schema(), SinkProps::new(table))?;
        Ok((pool, Arc::new(sink), schema))
    }

    fn input(ids: impl Iterator<Item = i64>) -> String {
        ids.map(|id| format!("{}\n", json!({"id": id, "tags": ["x", "y"]})))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_lands_in_one_relation() -> anyhow::Result<()> {
        let (pool, sink, schema) = setup("events")?;
        let props = PipelineProps::default().with_rows_per_batch(7).with_workers(3);
        let pipeline = IngestPipeline::new(sink, props)?;

        let stats = pipeline.run(&schema, input(0..50).as_bytes()).await?;
        assert_eq!(stats.records, 50);
        assert_eq!(stats.batches, 8);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.appended, 7);

        let conn = pool.lease(Deadline::none()).await?;
        let (rows, max): (i64, i64) =
            conn.query_row("SELECT count(*), max(id) FROM events", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
        assert_eq!((rows, max), (50, 49));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_decode_error_policy() -> anyhow::Result<()> {
        let mut stream = input(0..4);
        stream.push_str("{\"id\": \"four\", \"tags\": []}\n");
        stream.push_str(&input(5..8));

        let (_, sink, schema) = setup("strict")?;
        let props = PipelineProps::default().with_rows_per_batch(2);
        let abort = IngestPipeline::new(sink, props.clone())?
            .run(&schema, stream.as_bytes())
            .await;
        assert!(matches!(
            abort,
            Err(IngestorError::Arrow(Json2ArrowError::Decode(_)))
        ));

        let (_, sink, schema) = setup("lenient")?;
        let skip = IngestPipeline::new(sink, props.with_decode_error_policy(DecodeErrorPolicy::Skip))?
            .run(&schema, stream.as_bytes())
            .await?;
        assert_eq!(skip.skipped_batches, 1);
        assert_eq!(skip.records, 6);
        Ok(())
    }

    #[test]
    fn test_zero_workers_is_invalid() -> anyhow::Result<()> {
        let (_, sink, _) = setup("unused")?;
        assert!(matches!(
            IngestPipeline::new(sink, PipelineProps::default().with_workers(0)),
            Err(IngestorError::InvalidConfig(_))
        ));
        Ok(())
    }
}
