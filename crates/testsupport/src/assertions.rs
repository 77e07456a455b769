//! Assertion helpers for statement-level tests.

use common::{DbError, DbResult, ErrorKind, Row};
use executor::{ExecContext, RecordSet};

/// Pull every row out of `rs` without closing it.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
///
/// # fn example(rs: &mut dyn executor::RecordSet) {
/// let rows = drain(rs, &executor::ExecContext::new()).unwrap();
/// assert!(rows.is_empty());
/// # }
/// ```
pub fn drain<R: RecordSet + ?Sized>(rs: &mut R, ctx: &ExecContext) -> DbResult<Vec<Row>> {
    let mut rows = Vec::new();
    let mut batch = rs.new_batch(None);
    loop {
        rs.next(ctx, &mut batch)?;
        if batch.is_empty() {
            return Ok(rows);
        }
        rows.extend(batch.rows());
    }
}

/// Assert that an operation returns an error containing a specific substring.
pub fn assert_error_contains<T>(result: DbResult<T>, expected_msg: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{expected_msg}', but got Ok"),
        Err(e) => {
            let error_string = e.to_string();
            assert!(
                error_string.contains(expected_msg),
                "Expected error to contain '{expected_msg}', but got: {error_string}"
            );
        }
    }
}

/// Assert that `result` failed with an error of `kind`, returning the error.
pub fn assert_error_kind<T>(result: DbResult<T>, kind: ErrorKind) -> DbError {
    match result {
        Ok(_) => panic!("Expected {kind:?} error, but got Ok"),
        Err(e) => {
            assert_eq!(e.kind(), kind, "unexpected error: {e}");
            e
        }
    }
}

/// Order-insensitive row comparison.
pub fn assert_row_sets_equal(actual: &[Row], expected: &[Row]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Row count mismatch: expected {}, got {}",
        expected.len(),
        actual.len()
    );
    for row in expected {
        assert!(
            actual.contains(row),
            "Expected row {:?} not found in actual results",
            row.values
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::int_row;

    #[test]
    fn error_kind_is_returned() {
        let err = assert_error_kind::<()>(Err(DbError::Deadlock), ErrorKind::Deadlock);
        assert!(matches!(err, DbError::Deadlock));
    }

    #[test]
    #[should_panic(expected = "Expected row")]
    fn missing_row_fails() {
        assert_row_sets_equal(&[int_row(&[1])], &[int_row(&[2])]);
    }

    #[test]
    fn error_text_is_matched() {
        assert_error_contains::<()>(Err(DbError::LockWaitTimeout), "lock wait timeout");
    }
}
