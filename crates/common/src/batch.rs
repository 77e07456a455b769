//! Columnar row batches passed down the cursor chain.
//!
//! A batch with zero rows after `next` is the end-of-data signal. Partial
//! batches are allowed on any call, so callers must never treat "fewer rows
//! than capacity" as exhaustion.

use crate::{DbError, DbResult, Row};
use types::Value;

/// Capacity policy for the first batch and its growth ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSizes {
    pub init_cap: usize,
    pub max: usize,
}

impl Default for ChunkSizes {
    fn default() -> Self {
        Self {
            init_cap: 32,
            max: 1024,
        }
    }
}

/// Fixed-column, growable batch stored column by column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowBatch {
    columns: Vec<Vec<Value>>,
    num_rows: usize,
    capacity: usize,
    max_chunk_size: usize,
    required_rows: usize,
}

impl RowBatch {
    pub fn new(num_cols: usize, capacity: usize, max_chunk_size: usize) -> Self {
        let max_chunk_size = max_chunk_size.max(1);
        let capacity = capacity.clamp(1, max_chunk_size);
        Self {
            columns: (0..num_cols).map(|_| Vec::with_capacity(capacity)).collect(),
            num_rows: 0,
            capacity,
            max_chunk_size,
            required_rows: max_chunk_size,
        }
    }

    pub fn with_sizes(num_cols: usize, sizes: ChunkSizes) -> Self {
        Self::new(num_cols, sizes.init_cap, sizes.max)
    }

    /// Next batch in the growth sequence: capacity doubles up to `max_chunk_size`.
    pub fn renew(&self, max_chunk_size: usize) -> Self {
        let capacity = (self.capacity * 2).min(max_chunk_size.max(1));
        Self::new(self.columns.len(), capacity, max_chunk_size)
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn required_rows(&self) -> usize {
        self.required_rows
    }

    /// Ask producers to stop after `rows` rows; clamped to `[1, max_chunk_size]`.
    pub fn set_required_rows(&mut self, rows: usize) {
        self.required_rows = rows.clamp(1, self.max_chunk_size);
    }

    pub fn is_full(&self) -> bool {
        self.num_rows >= self.required_rows
    }

    /// Drop all rows, keep column layout and capacity.
    pub fn reset(&mut self) {
        for col in &mut self.columns {
            col.clear();
        }
        self.num_rows = 0;
    }

    pub fn append_row(&mut self, row: &Row) -> DbResult<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::Executor(format!(
                "row has {} columns, batch expects {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (col, value) in self.columns.iter_mut().zip(&row.values) {
            col.push(value.clone());
        }
        self.num_rows += 1;
        Ok(())
    }

    pub fn append_rows(&mut self, rows: &[Row]) -> DbResult<()> {
        rows.iter().try_for_each(|row| self.append_row(row))
    }

    /// Materialize row `idx`, or `None` past the end.
    pub fn row(&self, idx: usize) -> Option<Row> {
        if idx >= self.num_rows {
            return None;
        }
        Some(Row::new(
            self.columns.iter().map(|col| col[idx].clone()).collect(),
        ))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.num_rows).filter_map(|idx| self.row(idx))
    }

    pub fn column(&self, idx: usize) -> Option<&[Value]> {
        self.columns.get(idx).map(Vec::as_slice)
    }

    /// Approximate memory held by the values in this batch.
    pub fn mem_usage(&self) -> usize {
        self.columns
            .iter()
            .flat_map(|col| col.iter())
            .map(Value::mem_size)
            .sum()
    }
}

/// Allocation policy for batches handed to a result consumer.
pub trait ChunkAllocator {
    fn alloc(&self, num_cols: usize, init_cap: usize, max_chunk_size: usize) -> RowBatch;
}

/// Allocator that always creates a fresh batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct FreshAllocator;

impl ChunkAllocator for FreshAllocator {
    fn alloc(&self, num_cols: usize, init_cap: usize, max_chunk_size: usize) -> RowBatch {
        RowBatch::new(num_cols, init_cap, max_chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![Value::Int(id), Value::Text(name.into())])
    }

    #[test]
    fn append_and_read_back_rows() {
        let mut batch = RowBatch::new(2, 4, 8);
        batch.append_row(&row(1, "alice")).unwrap();
        batch.append_row(&row(2, "bob")).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.row(1), Some(row(2, "bob")));
        assert_eq!(batch.row(2), None);
        assert_eq!(batch.column(0), Some(&[Value::Int(1), Value::Int(2)][..]));
    }

    #[test]
    fn append_rejects_wrong_width() {
        let mut batch = RowBatch::new(2, 4, 8);
        let err = batch.append_row(&Row::new(vec![Value::Int(1)])).unwrap_err();
        assert!(err.to_string().contains("batch expects 2"));
        assert!(batch.is_empty());
    }

    #[test]
    fn reset_keeps_layout() {
        let mut batch = RowBatch::new(2, 4, 8);
        batch.append_row(&row(1, "alice")).unwrap();
        batch.reset();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_cols(), 2);
        assert_eq!(batch.capacity(), 4);
    }

    #[test]
    fn renew_doubles_until_max() {
        let batch = RowBatch::new(1, 32, 100);
        let second = batch.renew(100);
        let third = second.renew(100);
        assert_eq!(second.capacity(), 64);
        assert_eq!(third.capacity(), 100);
    }

    #[test]
    fn required_rows_drive_is_full() {
        let mut batch = RowBatch::new(2, 4, 8);
        batch.set_required_rows(1);
        assert!(!batch.is_full());
        batch.append_row(&row(1, "alice")).unwrap();
        assert!(batch.is_full());

        batch.set_required_rows(100);
        assert_eq!(batch.required_rows(), 8);
    }

    #[test]
    fn allocator_respects_requested_sizes() {
        let batch = FreshAllocator.alloc(3, 16, 64);
        assert_eq!(batch.num_cols(), 3);
        assert_eq!(batch.capacity(), 16);
        assert_eq!(batch.max_chunk_size(), 64);
    }
}
