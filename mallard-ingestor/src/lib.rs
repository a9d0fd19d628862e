//! Land Arrow record batches in DuckDB: a bounded connection pool, a zero-copy
//! view of a batch for SQL, and a sink that creates the destination relation on
//! first contact and appends to it afterwards.

mod deadline;
pub mod errors;
pub mod pipeline;
pub mod pool;
pub mod sink;
pub mod view;

pub use deadline::Deadline;
pub use errors::IngestorError;
pub use pipeline::{DecodeErrorPolicy, IngestPipeline, IngestStats, PipelineProps};
pub use pool::{ConnectionPool, PoolProps, PooledConnection};
pub use sink::{ColumnMatching, DuckDbSink, Landing, SinkProps};
pub use view::ArrowView;

pub type Result<T> = core::result::Result<T, errors::IngestorError>;
