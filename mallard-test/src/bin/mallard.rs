use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};

use mallard_ingestor::{
    ColumnMatching, ConnectionPool, DecodeErrorPolicy, DuckDbSink, IngestPipeline, PipelineProps,
    PoolProps, SinkProps,
};
use mallard_json2arrow::{codec, infer_from_reader, InferenceOptions, UnifiedSchema};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Command::Infer(args) => {
            infer(&args.sample, &args.schema_out, &args.inference)?;
        }
        Command::Ingest(args) => {
            let schema = import(&args.schema)?;
            ingest(&schema, &args.source, &args.ingest).await?;
        }
        Command::Run(args) => {
            infer(&args.source, &args.schema_out, &args.inference)?;
            let schema = import(&args.schema_out)?;
            ingest(&schema, &args.source, &args.ingest).await?;
        }
    }
    Ok(())
}

/// Unify JSON records into one schema and load them into DuckDB
#[derive(Parser, Debug)]
#[command(name = "mallard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// log at debug level
    #[arg(short, long, global = true, env = "MALLARD_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Infer a schema from sample records and write it out
    Infer(InferArgs),
    /// Decode a stream with a saved schema and ingest it
    Ingest(IngestArgs),
    /// Infer from the head of a stream, save the schema, then ingest the whole stream
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct InferArgs {
    #[arg(long, env = "MALLARD_SAMPLE")]
    sample: PathBuf,
    #[arg(long, env = "MALLARD_SCHEMA")]
    schema_out: PathBuf,
    #[command(flatten)]
    inference: InferenceArgs,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[arg(long, env = "MALLARD_SCHEMA")]
    schema: PathBuf,
    #[arg(long, env = "MALLARD_SOURCE")]
    source: PathBuf,
    #[command(flatten)]
    ingest: IngestOpts,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, env = "MALLARD_SOURCE")]
    source: PathBuf,
    #[arg(long, env = "MALLARD_SCHEMA", default_value = "schema.json")]
    schema_out: PathBuf,
    #[command(flatten)]
    inference: InferenceArgs,
    #[command(flatten)]
    ingest: IngestOpts,
}

#[derive(Args, Debug)]
struct InferenceArgs {
    /// treat numeric and boolean strings as numbers and booleans
    #[arg(long, env = "MALLARD_COERCE_TYPES")]
    coerce_types: bool,
    /// recognise datetime strings and epoch integers as timestamps
    #[arg(long, env = "MALLARD_INFER_TIME_UNITS")]
    infer_time_units: bool,
    /// unify at most this many sample lines
    #[arg(long, env = "MALLARD_SAMPLE_LIMIT")]
    sample_limit: Option<usize>,
}

#[derive(Args, Debug)]
struct IngestOpts {
    /// DuckDB database file, in-memory when omitted
    #[arg(long, env = "MALLARD_DB")]
    db: Option<PathBuf>,
    #[arg(long, env = "MALLARD_TABLE")]
    table: String,
    #[arg(long, env = "MALLARD_ROWS_PER_BATCH", default_value_t = 100)]
    rows_per_batch: usize,
    #[arg(long, env = "MALLARD_THREADS")]
    threads: Option<i64>,
    #[arg(long, env = "MALLARD_MAX_OPEN", default_value_t = 10)]
    max_open: usize,
    #[arg(long, env = "MALLARD_MAX_IDLE", default_value_t = 10)]
    max_idle: usize,
    #[arg(long, env = "MALLARD_WORKERS", default_value_t = 4)]
    workers: usize,
    /// log and drop batches holding records that don't fit the schema
    #[arg(long, env = "MALLARD_SKIP_BAD_BATCHES")]
    skip_bad_batches: bool,
    /// also reject relation columns missing from the batch
    #[arg(long, env = "MALLARD_STRICT_COLUMNS")]
    strict_columns: bool,
    #[arg(long, env = "MALLARD_BATCH_TIMEOUT_MS")]
    batch_timeout_ms: Option<u64>,
}

impl InferenceArgs {
    fn options(&self) -> InferenceOptions {
        InferenceOptions {
            coerce_types: self.coerce_types,
            infer_time_units: self.infer_time_units,
        }
    }
}

impl IngestOpts {
    fn pool_props(&self) -> PoolProps {
        let mut props = PoolProps::default()
            .with_max_open(self.max_open)
            .with_max_idle(self.max_idle);
        props.path = self.db.clone();
        props.threads = self.threads;
        props
    }

    fn sink_props(&self) -> SinkProps {
        SinkProps::new(&self.table).with_column_matching(if self.strict_columns {
            ColumnMatching::Exact
        } else {
            ColumnMatching::Subset
        })
    }

    fn pipeline_props(&self) -> PipelineProps {
        let mut props = PipelineProps::default()
            .with_rows_per_batch(self.rows_per_batch)
            .with_workers(self.workers);
        if self.skip_bad_batches {
            props = props.with_decode_error_policy(DecodeErrorPolicy::Skip);
        }
        if let Some(ms) = self.batch_timeout_ms {
            props = props.with_batch_timeout(Duration::from_millis(ms));
        }
        props
    }
}

fn open(path: &Path) -> anyhow::Result<impl BufRead> {
    Ok(BufReader::new(File::open(path)?))
}

fn infer(sample: &Path, schema_out: &Path, args: &InferenceArgs) -> anyhow::Result<()> {
    tracing::info!("inferring schema from {sample:#?}");
    let started = Instant::now();
    let schema = infer_from_reader(open(sample)?, args.options(), args.sample_limit)?;
    tracing::info!(
        fields = schema.len(),
        elapsed = ?started.elapsed(),
        "unified schema\n{schema}"
    );

    codec::export(&schema, BufWriter::new(File::create(schema_out)?))?;
    tracing::info!("wrote schema to {schema_out:#?}");
    Ok(())
}

fn import(path: &Path) -> anyhow::Result<UnifiedSchema> {
    let schema = codec::import(open(path)?)?;
    tracing::info!(fields = schema.len(), "read schema from {path:#?}\n{schema}");
    Ok(schema)
}

async fn ingest(schema: &UnifiedSchema, source: &Path, opts: &IngestOpts) -> anyhow::Result<()> {
    let pool = Arc::new(ConnectionPool::open(opts.pool_props())?);
    let sink = Arc::new(DuckDbSink::new(
        pool.clone(),
        schema.arrow_schema(),
        opts.sink_props(),
    )?);
    let pipeline = IngestPipeline::new(sink, opts.pipeline_props())?;

    tracing::info!("ingesting {source:#?} into {}", opts.table);
    let started = Instant::now();
    let result = pipeline.run(schema, open(source)?).await;
    pool.close();

    let stats = result?;
    tracing::info!(
        records = stats.records,
        batches = stats.batches,
        skipped = stats.skipped_batches,
        elapsed = ?started.elapsed(),
        "ingest complete"
    );
    Ok(())
}
