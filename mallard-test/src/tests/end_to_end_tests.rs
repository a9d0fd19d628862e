use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use mallard_ingestor::{
    ConnectionPool, DecodeErrorPolicy, DuckDbSink, IngestPipeline, PipelineProps, PoolProps,
    SinkProps,
};
use mallard_json2arrow::{
    codec, infer_from_reader, BatchDecoder, DecodeError, DecodeReason, DecoderProps,
    Json2ArrowError,
};

use crate::test_util::*;

#[test]
fn test_decoded_batch_sizes() -> Result<()> {
    let records = foos(250);
    let schema = unify_all(&to_values(&records)?, all_options())?;
    let ndjson = to_ndjson(&records)?;

    let decoder = BatchDecoder::try_new(
        &schema,
        ndjson.as_bytes(),
        &DecoderProps::default().with_rows_per_batch(100),
    )?;
    let sizes = decoder
        .map(|batch| batch.map(|b| b.num_rows()))
        .collect::<mallard_json2arrow::Result<Vec<_>>>()?;
    assert_eq!(sizes, vec![100, 100, 50]);
    Ok(())
}

#[test]
fn test_unknown_field_fails_its_batch_only() -> Result<()> {
    let records = foos(9);
    let schema = unify_all(&to_values(&records)?, all_options())?;

    let mut values = to_values(&records)?;
    values[4]["Bar"]["Surprise"] = serde_json::json!(1);
    let ndjson = to_ndjson(&values)?;

    let mut decoder = BatchDecoder::try_new(
        &schema,
        ndjson.as_bytes(),
        &DecoderProps::default().with_rows_per_batch(3),
    )?;
    assert_eq!(decoder.next_batch()?.map(|b| b.num_rows()), Some(3));
    match decoder.next_batch() {
        Err(Json2ArrowError::Decode(DecodeError { ordinal, reason })) => {
            assert_eq!(ordinal, 4);
            assert_eq!(reason, DecodeReason::UnknownField("Bar.Surprise".to_owned()));
        }
        other => panic!("expected the second window to fail, got {other:?}"),
    }
    assert_eq!(decoder.next_batch()?.map(|b| b.num_rows()), Some(3));
    assert!(decoder.next_batch()?.is_none());
    assert_eq!(decoder.records_decoded(), 6);
    Ok(())
}

/// Infer from a sample, persist the schema, restore it and ingest everything
#[tokio::test(flavor = "multi_thread")]
async fn test_infer_persist_ingest() -> Result<()> {
    let dir = tempdir()?;
    let source = to_ndjson(&foos(250))?;

    let inferred = infer_from_reader(source.as_bytes(), all_options(), Some(50))?;
    let schema_path = dir.path().join("schema.json");
    codec::export(&inferred, BufWriter::new(File::create(&schema_path)?))?;
    let schema = codec::import(BufReader::new(File::open(&schema_path)?))?;
    assert_eq!(schema, inferred);

    let pool = Arc::new(ConnectionPool::open(
        PoolProps::default()
            .with_path(dir.path().join("duck.db"))
            .with_threads(4),
    )?);
    let sink = Arc::new(DuckDbSink::new(
        pool.clone(),
        schema.arrow_schema(),
        SinkProps::new("t1"),
    )?);
    let pipeline = IngestPipeline::new(
        sink,
        PipelineProps::default().with_rows_per_batch(100).with_workers(2),
    )?;

    let stats = pipeline.run(&schema, source.as_bytes()).await?;
    assert_eq!(stats.records, 250);
    assert_eq!(stats.batches, 3);
    assert_eq!((stats.created, stats.appended), (1, 2));
    assert_eq!(count_rows(&pool, "t1").await?, 250);

    // same stream again appends only
    let again = pipeline.run(&schema, source.as_bytes()).await?;
    assert_eq!((again.created, again.appended), (0, 3));
    assert_eq!(count_rows(&pool, "t1").await?, 500);

    pool.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_skipping_bad_batches() -> Result<()> {
    let records = foos(30);
    let schema = unify_all(&to_values(&records)?, all_options())?;

    let mut values = to_values(&records)?;
    values[12]["Int"] = serde_json::json!("twelve");
    values[25]["Pointer"] = serde_json::json!([1]);
    let source = to_ndjson(&values)?;

    let pool = Arc::new(ConnectionPool::open(PoolProps::default())?);
    let sink = Arc::new(DuckDbSink::new(
        pool.clone(),
        schema.arrow_schema(),
        SinkProps::new("t1"),
    )?);
    let pipeline = IngestPipeline::new(
        sink,
        PipelineProps::default()
            .with_rows_per_batch(10)
            .with_decode_error_policy(DecodeErrorPolicy::Skip),
    )?;

    let stats = pipeline.run(&schema, source.as_bytes()).await?;
    assert_eq!(stats.skipped_batches, 2);
    assert_eq!(stats.records, 10);
    assert_eq!(count_rows(&pool, "t1").await?, 10);
    Ok(())
}
