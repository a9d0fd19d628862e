use mallard_json2arrow::Json2ArrowError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum IngestorError {
    #[error("Json Conversion Error: {0}")]
    Arrow(#[from] Json2ArrowError),

    #[error("batch does not fit relation `{table}`: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] duckdb::Error),

    #[error("Store Error: {0}")]
    Store(#[from] duckdb::Error),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("deadline expired before the batch was written")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ingest Task Failed: {0}")]
    Task(#[from] JoinError),

    #[error("Io Error")]
    IoError(#[from] std::io::Error),
}
