//! Projection operator: selects and reorders columns.

use crate::{context::ExecContext, new_first_chunk, ExecCaps, Executor};
use common::{ChunkSizes, DbError, DbResult, Row, RowBatch, Schema, SchemaColumn};
use types::SqlType;

/// Produces rows with a subset of the input columns in a given order.
///
/// With `calculate_no_delay` set the projection is evaluated only for its
/// side effects (`DO 1, @a := 2`); its rows are never returned to the client.
pub struct ProjectionExec {
    input: Box<dyn Executor>,
    projections: Vec<(String, usize)>,
    schema: Schema,
    calculate_no_delay: bool,
    input_batch: Option<RowBatch>,
}

impl ProjectionExec {
    /// Create a projection over `input`; each projection is an
    /// `(output_name, input_column)` pair.
    pub fn new(input: Box<dyn Executor>, projections: Vec<(String, usize)>) -> Self {
        let input_schema = input.schema();
        let schema = Schema::new(
            projections
                .iter()
                .map(|(name, idx)| {
                    let ty = input_schema
                        .columns
                        .get(*idx)
                        .map_or(SqlType::Text, |col| col.ty);
                    SchemaColumn::new(name.clone(), ty)
                })
                .collect(),
        );
        Self {
            input,
            projections,
            schema,
            calculate_no_delay: false,
            input_batch: None,
        }
    }

    pub fn calculate_no_delay(mut self) -> Self {
        self.calculate_no_delay = true;
        self
    }

    fn project(&self, row: &Row) -> DbResult<Row> {
        let mut values = Vec::with_capacity(self.projections.len());
        for (_name, idx) in &self.projections {
            let value = row.values.get(*idx).ok_or_else(|| {
                DbError::Executor(format!(
                    "column index {} out of bounds (row has {} columns)",
                    idx,
                    row.len()
                ))
            })?;
            values.push(value.clone());
        }
        Ok(Row::new(values))
    }
}

impl Executor for ProjectionExec {
    fn open(&mut self, ctx: &ExecContext) -> DbResult<()> {
        self.input.open(ctx)?;
        self.input_batch = Some(new_first_chunk(self.input.as_ref()));
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        let mut input_batch = self
            .input_batch
            .take()
            .ok_or_else(|| DbError::Executor("projection used before open".into()))?;
        let result = crate::next(ctx, self.input.as_mut(), &mut input_batch).and_then(|()| {
            input_batch
                .rows()
                .try_for_each(|row| batch.append_row(&self.project(&row)?))
        });
        self.input_batch = Some(input_batch);
        result
    }

    fn close(&mut self) -> DbResult<()> {
        self.input_batch = None;
        self.input.close()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn caps(&self) -> ExecCaps {
        ExecCaps {
            calculate_no_delay: self.calculate_no_delay,
            no_delay_target: false,
            ..self.input.caps()
        }
    }

    fn chunk_sizes(&self) -> ChunkSizes {
        self.input.chunk_sizes()
    }
}
