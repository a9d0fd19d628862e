//! A bounded pool of DuckDB connections sharing one database instance.
//!
//! The root connection is opened and bootstrapped once in [`ConnectionPool::open`];
//! every leased connection is a clone of it, so extensions loaded and table
//! functions registered there are visible to all of them.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use duckdb::vtab::arrow::ArrowVTab;
use duckdb::{Config, Connection};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout_at;
use tracing::{info, trace};

use crate::deadline::Deadline;
use crate::view::ArrowView;
use crate::{errors::IngestorError, Result};

#[derive(Debug, Clone)]
pub struct PoolProps {
    /// `None` opens an in-memory database
    pub path: Option<PathBuf>,
    /// DuckDB worker threads, engine default when unset
    pub threads: Option<i64>,
    pub max_open: usize,
    pub max_idle: usize,
    pub extensions: Vec<String>,
}

impl Default for PoolProps {
    fn default() -> Self {
        Self {
            path: None,
            threads: None,
            max_open: 10,
            max_idle: 10,
            extensions: vec!["json".to_owned(), "parquet".to_owned()],
        }
    }
}

impl PoolProps {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_threads(mut self, threads: i64) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_max_open(mut self, max_open: usize) -> Self {
        self.max_open = max_open;
        self
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }
}

pub struct ConnectionPool {
    root: Mutex<Option<Connection>>,
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
    max_idle: usize,
}

impl ConnectionPool {
    /// Open the database and run the bootstrap. No connection is handed out
    /// before the bootstrap has succeeded.
    pub fn open(props: PoolProps) -> Result<Self> {
        if props.max_open == 0 {
            return Err(IngestorError::InvalidConfig(
                "max_open must be at least 1".to_owned(),
            ));
        }

        let mut config = Config::default();
        if let Some(threads) = props.threads {
            config = config
                .threads(threads)
                .map_err(IngestorError::StoreUnavailable)?;
        }
        let root = match &props.path {
            Some(path) => Connection::open_with_flags(path, config),
            None => Connection::open_in_memory_with_flags(config),
        }
        .map_err(IngestorError::StoreUnavailable)?;

        bootstrap(&root, &props.extensions).map_err(IngestorError::StoreUnavailable)?;
        info!(
            path = ?props.path,
            extensions = ?props.extensions,
            max_open = props.max_open,
            max_idle = props.max_idle,
            "DuckDB connection pool ready"
        );

        Ok(Self {
            root: Mutex::new(Some(root)),
            idle: Mutex::new(Vec::with_capacity(props.max_idle)),
            permits: Semaphore::new(props.max_open),
            max_idle: props.max_idle,
        })
    }

    /// Wait for a free slot, bounded by `deadline`, and lease a connection
    pub async fn lease(&self, deadline: Deadline) -> Result<PooledConnection<'_>> {
        let permit = match deadline.instant() {
            Some(at) => timeout_at(at, self.permits.acquire())
                .await
                .map_err(|_| IngestorError::Cancelled)?,
            None => self.permits.acquire().await,
        }
        .map_err(|_| IngestorError::PoolClosed)?;

        let idle = lock(&self.idle).pop();
        let conn = match idle {
            Some(conn) => conn,
            None => lock(&self.root)
                .as_ref()
                .ok_or(IngestorError::PoolClosed)?
                .try_clone()
                .map_err(IngestorError::StoreUnavailable)?,
        };
        trace!(available = self.permits.available_permits(), "leased connection");

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Connections that may still be leased without waiting
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Connections kept open between leases
    pub fn idle(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Drop all idle connections and the root connection. Outstanding leases
    /// stay usable and are closed when returned.
    pub fn close(&self) {
        self.permits.close();
        lock(&self.idle).clear();
        lock(&self.root).take();
        info!("DuckDB connection pool closed");
    }

    fn give_back(&self, conn: Connection) {
        let mut idle = lock(&self.idle);
        if !self.is_closed() && idle.len() < self.max_idle {
            idle.push(conn);
            trace!(idle = idle.len(), "returned connection");
        } else {
            trace!("closed surplus connection");
        }
    }
}

fn bootstrap(conn: &Connection, extensions: &[String]) -> duckdb::Result<()> {
    for extension in extensions {
        conn.execute_batch(&format!("LOAD {extension};"))?;
    }
    conn.register_table_function::<ArrowVTab>(ArrowView::SCAN_FUNCTION)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A leased connection. Goes back to the pool, or is closed, when dropped.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is only taken on drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is only taken on drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
