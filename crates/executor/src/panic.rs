//! Panic recovery at the statement boundary.

use common::{DbError, DbResult};
use std::{any::Any, backtrace::Backtrace, panic, thread};

/// Marker carried by panics raised when a memory quota action gives up.
/// Such panics are never turned into errors.
pub const PANIC_MEMORY_EXCEED: &str = "Out Of Memory Quota!";

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Convert a caught panic into `DbError::Internal`, logging it with the
/// statement text. Out-of-memory panics are re-raised.
pub(crate) fn recover<T>(
    result: thread::Result<DbResult<T>>,
    sql: impl FnOnce() -> String,
) -> DbResult<T> {
    match result {
        Ok(result) => result,
        Err(payload) => {
            let message = payload_message(payload.as_ref());
            if message.contains(PANIC_MEMORY_EXCEED) {
                panic::resume_unwind(payload);
            }
            let backtrace = Backtrace::force_capture().to_string();
            tracing::error!(sql = %sql(), error = %message, %backtrace, "execute sql panic");
            Err(DbError::Internal { message, backtrace })
        }
    }
}
