//! The parsed statement as seen by execution: its kind, text, and the few
//! syntactic facts execution depends on.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StmtKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    LoadData,
    Ddl,
    Show,
    Do,
    Set,
    Prepare,
    Execute,
    Explain,
    Analyze,
    Begin,
    Commit,
    Rollback,
    CreateUser,
    AlterUser,
    SetPassword,
    Other,
}

impl StmtKind {
    /// Statement type label used by process lists, summaries, and metrics.
    pub fn label(self) -> &'static str {
        match self {
            StmtKind::Select => "Select",
            StmtKind::Insert => "Insert",
            StmtKind::Replace => "Replace",
            StmtKind::Update => "Update",
            StmtKind::Delete => "Delete",
            StmtKind::LoadData => "LoadData",
            StmtKind::Ddl => "DDL",
            StmtKind::Show => "Show",
            StmtKind::Do => "Do",
            StmtKind::Set => "Set",
            StmtKind::Prepare => "Prepare",
            StmtKind::Execute => "Execute",
            StmtKind::Explain => "Explain",
            StmtKind::Analyze => "Analyze",
            StmtKind::Begin => "Begin",
            StmtKind::Commit => "Commit",
            StmtKind::Rollback => "Rollback",
            StmtKind::CreateUser => "CreateUser",
            StmtKind::AlterUser => "AlterUser",
            StmtKind::SetPassword => "SetPwd",
            StmtKind::Other => "other",
        }
    }

    /// Statements whose text may carry credentials.
    pub fn is_sensitive(self) -> bool {
        matches!(
            self,
            StmtKind::CreateUser | StmtKind::AlterUser | StmtKind::SetPassword
        )
    }
}

impl fmt::Display for StmtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StmtNode {
    pub kind: StmtKind,
    pub text: String,
    /// Credential-free rendering for sensitive statements.
    pub secure_text: Option<String>,
    /// `SELECT ... FOR UPDATE` / `LOCK IN SHARE MODE`.
    pub for_update: bool,
    /// `EXPLAIN ANALYZE`.
    pub analyze: bool,
    /// Explained statement, or the prepared statement behind `EXECUTE`.
    pub inner: Option<Box<StmtNode>>,
}

impl StmtNode {
    pub fn new(kind: StmtKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            secure_text: None,
            for_update: false,
            analyze: false,
            inner: None,
        }
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn with_secure_text(mut self, text: impl Into<String>) -> Self {
        self.secure_text = Some(text.into());
        self
    }

    pub fn explain(inner: StmtNode, analyze: bool) -> Self {
        let text = if analyze {
            format!("explain analyze {}", inner.text)
        } else {
            format!("explain {}", inner.text)
        };
        Self {
            analyze,
            inner: Some(Box::new(inner)),
            ..Self::new(StmtKind::Explain, text)
        }
    }

    pub fn execute(text: impl Into<String>, prepared: StmtNode) -> Self {
        Self {
            inner: Some(Box::new(prepared)),
            ..Self::new(StmtKind::Execute, text)
        }
    }

    /// Kind of the statement that actually runs (through `EXECUTE`).
    pub fn effective_kind(&self) -> StmtKind {
        match (&self.kind, &self.inner) {
            (StmtKind::Execute, Some(inner)) => inner.effective_kind(),
            _ => self.kind,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.kind.is_sensitive()
    }

    /// Text safe to show in logs and process lists.
    pub fn secure_text(&self) -> &str {
        self.secure_text.as_deref().unwrap_or(&self.text)
    }

    pub fn is_read_only(&self) -> bool {
        match self.kind {
            StmtKind::Select => !self.for_update,
            StmtKind::Show | StmtKind::Do => true,
            StmtKind::Explain => {
                !self.analyze || self.inner.as_ref().is_none_or(|inner| inner.is_read_only())
            }
            StmtKind::Execute => self.inner.as_ref().is_some_and(|inner| inner.is_read_only()),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}
