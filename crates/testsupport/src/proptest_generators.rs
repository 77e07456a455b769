//! Property-based test generators using proptest.

use common::{DbError, Row};
use proptest::prelude::*;
use types::Value;

/// Strategy for generating random `Value` instances.
///
/// Generates a mix of Int, Text, Bool, and Null values.
pub fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        "[a-z]{1,20}".prop_map(Value::Text),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
    ]
}

/// Rows with exactly `len` columns.
pub fn arb_row_with_len(len: usize) -> impl Strategy<Value = Row> {
    prop::collection::vec(arb_value(), len).prop_map(Row::new)
}

/// Up to `max` integer rows of `width` columns.
pub fn arb_int_rows(width: usize, max: usize) -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec(
        prop::collection::vec(any::<i64>().prop_map(Value::Int), width).prop_map(Row::new),
        0..=max,
    )
}

/// Which retryable lock error to raise; `DbError` is not `Clone`, so
/// strategies produce this and tests materialize the error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    WriteConflict,
    LockWaitTimeout,
    DuplicateKey,
}

impl ConflictKind {
    pub fn to_error(self) -> DbError {
        match self {
            ConflictKind::WriteConflict => crate::fixtures::errors::write_conflict("t1_r01"),
            ConflictKind::LockWaitTimeout => DbError::LockWaitTimeout,
            ConflictKind::DuplicateKey => DbError::KeyExists("1".into()),
        }
    }
}

pub fn arb_conflict() -> impl Strategy<Value = ConflictKind> {
    prop_oneof![
        Just(ConflictKind::WriteConflict),
        Just(ConflictKind::LockWaitTimeout),
        Just(ConflictKind::DuplicateKey),
    ]
}

/// A run of lock conflicts of length `0..max` preceding success.
pub fn arb_conflict_run(max: usize) -> impl Strategy<Value = Vec<ConflictKind>> {
    prop::collection::vec(arb_conflict(), 0..max)
}
