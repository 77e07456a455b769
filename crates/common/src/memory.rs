//! Hierarchical memory/disk usage trackers.
//!
//! A statement tracker is attached to a session-global parent while the
//! statement runs. Consumption propagates upward; detaching releases the
//! child's outstanding bytes from the parent exactly once.

use crate::{DbError, DbResult};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc,
};

#[derive(Debug)]
pub struct MemoryTracker {
    label: String,
    consumed: AtomicI64,
    max_consumed: AtomicI64,
    bytes_limit: AtomicI64,
    parent: Mutex<Option<Arc<MemoryTracker>>>,
    detached: AtomicBool,
    detach_count: AtomicU64,
}

impl MemoryTracker {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            consumed: AtomicI64::new(0),
            max_consumed: AtomicI64::new(0),
            bytes_limit: AtomicI64::new(-1),
            parent: Mutex::new(None),
            detached: AtomicBool::new(false),
            detach_count: AtomicU64::new(0),
        })
    }

    /// Create a child already attached to `parent`.
    pub fn child_of(label: impl Into<String>, parent: &Arc<MemoryTracker>) -> Arc<Self> {
        let tracker = Self::new(label);
        *tracker.parent.lock() = Some(Arc::clone(parent));
        tracker
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Quota in bytes; negative disables it.
    pub fn set_bytes_limit(&self, limit: i64) {
        self.bytes_limit.store(limit, Ordering::Relaxed);
    }

    pub fn consumed(&self) -> i64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn max_consumed(&self) -> i64 {
        self.max_consumed.load(Ordering::Relaxed)
    }

    /// Account `bytes` (negative to release). Exceeding the quota is reported
    /// as `ResourceExceeded`; the consumption is still recorded so a later
    /// release balances it.
    pub fn consume(&self, bytes: i64) -> DbResult<()> {
        let now = self.consumed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.max_consumed.fetch_max(now, Ordering::Relaxed);
        if let Some(parent) = self.parent.lock().as_ref() {
            parent.consume(bytes)?;
        }
        let limit = self.bytes_limit.load(Ordering::Relaxed);
        if limit >= 0 && now > limit {
            return Err(DbError::ResourceExceeded(format!(
                "{} consumed {now} bytes, quota is {limit}",
                self.label
            )));
        }
        Ok(())
    }

    /// Detach from the parent, returning the outstanding bytes to it.
    /// Subsequent calls are no-ops.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach_count.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = self.parent.lock().take() {
            let _ = parent.consume(-self.consumed());
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Number of effective detaches; at most one.
    pub fn detach_count(&self) -> u64 {
        self.detach_count.load(Ordering::Relaxed)
    }
}
