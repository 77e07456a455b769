//! Rows, keys and errors shared by the statement tests.

use common::{DbError, Row, TableId};
use executor::Key;
use types::Value;

/// Build a row with integer values.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let row = int_row(&[1, 2, 3]);
/// assert_eq!(row.values.len(), 3);
/// ```
pub fn int_row(values: &[i64]) -> Row {
    Row::new(values.iter().map(|&v| Value::Int(v)).collect())
}

/// One single-column row per value.
pub fn int_rows(values: &[i64]) -> Vec<Row> {
    values.iter().map(|&v| int_row(&[v])).collect()
}

/// `count` two-column rows `(i, i * 10)`.
pub fn pair_rows(count: usize) -> Vec<Row> {
    (0..count as i64).map(|i| int_row(&[i, i * 10])).collect()
}

pub fn text_row(values: &[&str]) -> Row {
    Row::new(values.iter().map(|&v| Value::Text(v.to_string())).collect())
}

/// Row keys of `table` for integer handles.
pub fn int_keys(table: u64, handles: &[i64]) -> Vec<Key> {
    handles
        .iter()
        .map(|&handle| Key::from_int(TableId(table), handle))
        .collect()
}

/// Errors the lock client reports.
pub mod errors {
    use super::*;

    /// A retryable write conflict on `key`.
    pub fn write_conflict(key: &str) -> DbError {
        DbError::WriteConflict {
            start_ts: 10,
            conflict_start_ts: 11,
            conflict_commit_ts: 12,
            key: key.to_string(),
        }
    }

    /// The raw deadlock signal, before translation.
    pub fn kv_deadlock() -> DbError {
        DbError::KvDeadlock {
            lock_ts: 9,
            lock_key: "t1_r01".into(),
            deadlock_key_hash: 0xfeed,
        }
    }

    /// `n` retryable lock errors, cycling through the conflict kinds.
    pub fn lock_conflicts(n: usize) -> Vec<DbError> {
        (0..n)
            .map(|i| match i % 3 {
                0 => write_conflict("t1_r01"),
                1 => DbError::LockWaitTimeout,
                _ => DbError::KeyExists("1".into()),
            })
            .collect()
    }
}
