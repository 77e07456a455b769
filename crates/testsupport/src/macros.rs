//! Shorthand for the row and key literals tests keep spelling out.

/// Build a `common::Row`.
///
/// ```
/// use testsupport::row;
/// use types::Value;
///
/// let r = row![int: 1, 2, 3];
/// assert_eq!(r.values[2], Value::Int(3));
///
/// let r = row![Value::Int(1), Value::Null];
/// assert_eq!(r.values.len(), 2);
/// ```
#[macro_export]
macro_rules! row {
    [int: $($val:expr),+ $(,)?] => {
        ::common::Row::new(vec![$(::types::Value::Int($val)),+])
    };
    [$($val:expr),+ $(,)?] => {
        ::common::Row::new(vec![$($val),+])
    };
}

/// Build a `Vec<executor::Key>` of integer handles in one table.
///
/// ```
/// use testsupport::keys;
///
/// let keys = keys![7 => 1, 2];
/// assert_eq!(keys.len(), 2);
/// assert_eq!(keys[0].to_string(), "t7_r0000000000000001");
/// ```
#[macro_export]
macro_rules! keys {
    [$table:expr => $($handle:expr),* $(,)?] => {
        vec![$(::executor::Key::from_int(::common::TableId($table), $handle)),*]
    };
}
