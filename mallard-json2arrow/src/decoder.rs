//! Pull-style decoding of newline delimited JSON into fixed-schema RecordBatches.
//!
//! Batch `k` always covers the records with ordinals `[k*n, (k+1)*n)`. When one
//! record of a window is rejected the rest of the window is read and discarded,
//! so the caller can drop the failed batch and keep pulling.

use std::io::BufRead;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use serde_json::Value;

use crate::errors::{DecodeError, DecodeReason};
use crate::ndjson::{Line, NdjsonLines};
use crate::record_conversion::RecordConverter;
use crate::unify::UnifiedSchema;
use crate::{DecoderProps, Json2ArrowError, Result};

pub struct BatchDecoder<R: BufRead> {
    lines: NdjsonLines<R>,
    converter: RecordConverter,
    rows_per_batch: usize,
    records_decoded: u64,
}

impl<R: BufRead> BatchDecoder<R> {
    pub fn try_new(schema: &UnifiedSchema, reader: R, props: &DecoderProps) -> Result<Self> {
        if props.rows_per_batch == 0 {
            return Err(Json2ArrowError::InvalidBatchSize);
        }
        Ok(Self {
            lines: NdjsonLines::iterator(reader),
            converter: RecordConverter::try_new(schema, props.rows_per_batch)?,
            rows_per_batch: props.rows_per_batch,
            records_decoded: 0,
        })
    }

    /// Decode the next window of records. `Ok(None)` once the stream is exhausted.
    ///
    /// On any error the rows already buffered for the window are dropped.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match self.fill_window() {
            Ok(0) => Ok(None),
            Ok(_) => {
                let batch = self.converter.records();
                self.records_decoded += batch.num_rows() as u64;
                Ok(Some(batch))
            }
            Err(e) => {
                self.converter.reset()?;
                Err(e)
            }
        }
    }

    /// Records placed in batches returned so far
    pub fn records_decoded(&self) -> u64 {
        self.records_decoded
    }

    pub fn schema(&self) -> SchemaRef {
        self.converter.schema()
    }

    fn fill_window(&mut self) -> Result<usize> {
        let mut taken = 0;
        while taken < self.rows_per_batch {
            let Some(line) = self.lines.next().transpose()? else {
                break;
            };
            taken += 1;

            if let Err(reason) = self.append_line(&line) {
                self.discard(self.rows_per_batch - taken)?;
                return Err(DecodeError {
                    ordinal: line.ordinal,
                    reason,
                }
                .into());
            }
        }
        Ok(taken)
    }

    fn append_line(&mut self, line: &Line) -> core::result::Result<(), DecodeReason> {
        let value: Value = serde_json::from_slice(&line.bytes)
            .map_err(|e| DecodeReason::MalformedJson(e.to_string()))?;
        self.converter.append_value(&value)
    }

    fn discard(&mut self, remaining: usize) -> Result<()> {
        for _ in 0..remaining {
            if self.lines.next().transpose()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for BatchDecoder<R> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
