//! Audit hook invoked once per statement attempt that reaches the client layer.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// What auditors see about a statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub conn_id: u64,
    pub user: String,
    pub db: String,
    /// Log-safe statement text (redacted or secure form when required).
    pub sql: String,
    pub stmt_label: String,
    pub succ: bool,
    pub error: Option<String>,
    pub affected_rows: u64,
    pub cost: Duration,
}

pub trait AuditSink: Send + Sync {
    fn on_general_event(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Collects events in memory; used by embedded deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAudit {
    fn on_general_event(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Deliver `event` to every sink; failures are logged and swallowed.
pub fn dispatch(sinks: &[std::sync::Arc<dyn AuditSink>], event: &AuditEvent) {
    for sink in sinks {
        if let Err(err) = sink.on_general_event(event) {
            tracing::warn!(error = %err, sql = %event.sql, "audit sink failed");
        }
    }
}
