//! Infer a schema from heterogeneous JSON records, persist it, and land
//! newline delimited JSON in DuckDB as Arrow record batches.

pub use mallard_ingestor::{
    ArrowView, ColumnMatching, ConnectionPool, Deadline, DecodeErrorPolicy, DuckDbSink,
    IngestPipeline, IngestStats, IngestorError, Landing, PipelineProps, PoolProps,
    PooledConnection, SinkProps,
};
pub use mallard_json2arrow::{
    codec, infer_from_reader, BatchDecoder, CodecError, DecodeError, DecodeReason, DecoderProps,
    FieldDescriptor, FieldType, InferenceOptions, Json2ArrowError, TimeUnit, UnifiedSchema,
    Unifier,
};

pub mod exports {
    pub use arrow_array;
    pub use arrow_schema;
    pub use duckdb;
}
