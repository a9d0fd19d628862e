use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use duckdb::vtab::arrow_recordbatch_to_query_params;
use duckdb::Connection;

/// A record batch exposed to SQL through the `arrow(?, ?)` table function.
///
/// Each statement gets a freshly exported C data interface pair, which the scan
/// takes ownership of when the statement binds it. Exporting shares the batch
/// buffers, nothing is copied. A statement that fails before binding its scan
/// never gives the pair back, so callers only run statements whose target has
/// already been resolved. Dropping the view releases the batch.
pub struct ArrowView {
    batch: RecordBatch,
}

impl ArrowView {
    /// Name the scan is registered under during pool bootstrap
    pub const SCAN_FUNCTION: &'static str = "arrow";
    /// Relation expression to select from in statements run through [`ArrowView::execute`]
    pub const SCAN: &'static str = "arrow(?, ?)";
    /// Rows one scan can emit, DuckDB's vector size
    pub const MAX_SCAN_ROWS: usize = 2048;

    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Run `first` over the leading slice of at most [`ArrowView::MAX_SCAN_ROWS`]
    /// rows and `rest` over every following slice. Both must reference
    /// [`ArrowView::SCAN`] exactly once. Run inside a transaction when the batch
    /// spans more than one slice. Returns the rows changed.
    pub fn execute(&self, conn: &Connection, first: &str, rest: &str) -> duckdb::Result<usize> {
        let rows = self.batch.num_rows();
        let mut changed = 0;
        for offset in (0..rows.max(1)).step_by(Self::MAX_SCAN_ROWS) {
            let sql = if offset == 0 { first } else { rest };
            let slice = self.batch.slice(offset, Self::MAX_SCAN_ROWS.min(rows - offset));
            changed += conn.execute(sql, arrow_recordbatch_to_query_params(slice))?;
        }
        Ok(changed)
    }
}
