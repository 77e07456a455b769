//! Test helpers and utilities for executor unit tests.

use crate::{context::ExecContext, ExecCaps, Executor};
use common::{ChunkSizes, DbError, DbResult, Row, RowBatch, Schema, SchemaColumn};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use types::{SqlType, Value};

/// Call counters shared between a mock and the test that owns it.
#[derive(Clone, Debug, Default)]
pub struct Probe {
    opens: Arc<AtomicUsize>,
    nexts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Probe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn nexts(&self) -> usize {
        self.nexts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Mock executor for testing operators in isolation.
///
/// Returns its rows one batch at a time, bounded by the batch's required
/// rows, and allows error injection.
pub struct MockExecutor {
    rows: VecDeque<Row>,
    schema: Schema,
    caps: ExecCaps,
    chunk_sizes: ChunkSizes,
    next_error: Option<DbError>,
    close_error: Option<DbError>,
    probe: Probe,
}

impl MockExecutor {
    /// Create a mock executor with integer-typed columns.
    pub fn new(rows: Vec<Row>, columns: &[&str]) -> Self {
        Self {
            rows: rows.into(),
            schema: Schema::new(
                columns
                    .iter()
                    .map(|name| SchemaColumn::new(*name, SqlType::Int))
                    .collect(),
            ),
            caps: ExecCaps::default(),
            chunk_sizes: ChunkSizes::default(),
            next_error: None,
            close_error: None,
            probe: Probe::default(),
        }
    }

    pub fn with_next_error(mut self, error: DbError) -> Self {
        self.next_error = Some(error);
        self
    }

    pub fn with_close_error(mut self, error: DbError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn with_chunk_sizes(mut self, sizes: ChunkSizes) -> Self {
        self.chunk_sizes = sizes;
        self
    }

    pub fn writing(mut self) -> Self {
        self.caps.is_write = true;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

impl Executor for MockExecutor {
    fn open(&mut self, _ctx: &ExecContext) -> DbResult<()> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next(&mut self, _ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        self.probe.nexts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.next_error.take() {
            return Err(error);
        }
        while !batch.is_full() {
            let Some(row) = self.rows.pop_front() else {
                break;
            };
            batch.append_row(&row)?;
        }
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.close_error.take() {
            return Err(error);
        }
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn caps(&self) -> ExecCaps {
        self.caps
    }

    fn chunk_sizes(&self) -> ChunkSizes {
        self.chunk_sizes
    }
}

/// Single-column integer rows.
pub fn int_rows(values: &[i64]) -> Vec<Row> {
    values
        .iter()
        .map(|&v| Row::new(vec![Value::Int(v)]))
        .collect()
}
