//! Per-statement execution context: cancellation, deadline, and the
//! details collected outside the operator tree.

use common::{DbError, DbResult, StmtExecDetails};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Handed to every blocking call of a statement. Cheap to clone; clones
/// share the cancellation token and the details record.
#[derive(Clone, Debug, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    details: Arc<Mutex<StmtExecDetails>>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context governed by an externally owned token (e.g. the connection's
    /// KILL handle).
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context: cancelled with the parent, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            details: Arc::clone(&self.details),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails once the statement was cancelled or ran past its deadline.
    pub fn check(&self) -> DbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DbError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn stmt_details(&self) -> StmtExecDetails {
        self.details.lock().clone()
    }

    pub(crate) fn shared_details(&self) -> Arc<Mutex<StmtExecDetails>> {
        Arc::clone(&self.details)
    }

    /// Add time spent writing result packets to the client.
    pub fn record_write_response(&self, elapsed: Duration) {
        self.details.lock().write_sql_resp_duration += elapsed;
    }

    /// Add KV/PD wait and backoff time reported by the storage client.
    pub fn record_kv_wait(&self, kv: Duration, pd: Duration, backoff: Duration) {
        let mut details = self.details.lock();
        details.wait_kv_resp_duration += kv;
        details.wait_pd_resp_duration += pd;
        details.backoff_duration += backoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_context_fails_check() {
        let ctx = ExecContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(DbError::Cancelled)));
    }

    #[test]
    fn expired_deadline_fails_check() {
        let ctx = ExecContext::new().with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(DbError::DeadlineExceeded)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn child_follows_parent_cancellation() {
        let parent = ExecContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn clones_share_details() {
        let ctx = ExecContext::new();
        let clone = ctx.clone();
        clone.record_write_response(Duration::from_millis(3));
        assert_eq!(
            ctx.stmt_details().write_sql_resp_duration,
            Duration::from_millis(3)
        );
    }

    #[test]
    fn kv_wait_accumulates() {
        let ctx = ExecContext::new();
        ctx.record_kv_wait(Duration::from_millis(2), Duration::from_millis(1), Duration::ZERO);
        ctx.record_kv_wait(Duration::from_millis(2), Duration::ZERO, Duration::from_millis(4));
        let details = ctx.stmt_details();
        assert_eq!(details.wait_kv_resp_duration, Duration::from_millis(4));
        assert_eq!(details.wait_pd_resp_duration, Duration::from_millis(1));
        assert_eq!(details.backoff_duration, Duration::from_millis(4));
    }
}
