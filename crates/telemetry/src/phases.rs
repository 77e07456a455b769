//! Phase-duration accounting for one statement.
//!
//! Each phase keeps two slots: the current attempt and the sum of all prior
//! attempts that ended in a lock error. A retry folds the current slot into
//! the prior slot, so once the statement finishes the current slot describes
//! only the final attempt.

use crate::metrics::{Metric, MetricsSink};
use common::CommitDetails;
use std::time::Duration;

pub const PHASE_BUILD_LOCKING: &str = "build:locking";
pub const PHASE_OPEN_LOCKING: &str = "open:locking";
pub const PHASE_NEXT_LOCKING: &str = "next:locking";
pub const PHASE_LOCK_LOCKING: &str = "lock:locking";
pub const PHASE_BUILD_FINAL: &str = "build:final";
pub const PHASE_OPEN_FINAL: &str = "open:final";
pub const PHASE_NEXT_FINAL: &str = "next:final";
pub const PHASE_LOCK_FINAL: &str = "lock:final";
pub const PHASE_COMMIT_PREWRITE: &str = "commit:prewrite";
pub const PHASE_COMMIT_COMMIT: &str = "commit:commit";
pub const PHASE_COMMIT_WAIT_COMMIT_TS: &str = "commit:wait:commit-ts";
pub const PHASE_COMMIT_WAIT_LATEST_TS: &str = "commit:wait:latest-ts";
pub const PHASE_COMMIT_WAIT_LATCH: &str = "commit:wait:local-latch";
pub const PHASE_COMMIT_WAIT_BINLOG: &str = "commit:wait:prewrite-binlog";
pub const PHASE_WRITE_RESPONSE: &str = "write-response";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Build,
    Open,
    Next,
    Lock,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Build, Phase::Open, Phase::Next, Phase::Lock];

    fn index(self) -> usize {
        match self {
            Phase::Build => 0,
            Phase::Open => 1,
            Phase::Next => 2,
            Phase::Lock => 3,
        }
    }

    pub fn final_label(self) -> &'static str {
        match self {
            Phase::Build => PHASE_BUILD_FINAL,
            Phase::Open => PHASE_OPEN_FINAL,
            Phase::Next => PHASE_NEXT_FINAL,
            Phase::Lock => PHASE_LOCK_FINAL,
        }
    }

    pub fn locking_label(self) -> &'static str {
        match self {
            Phase::Build => PHASE_BUILD_LOCKING,
            Phase::Open => PHASE_OPEN_LOCKING,
            Phase::Next => PHASE_NEXT_LOCKING,
            Phase::Lock => PHASE_LOCK_LOCKING,
        }
    }
}

/// `[current attempt, accumulated prior attempts]` for build/open/next/lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseDurations {
    slots: [[Duration; 2]; 4],
}

impl PhaseDurations {
    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        self.slots[phase.index()][0] += elapsed;
    }

    /// Time spent in `phase` during the current (or final) attempt.
    pub fn current(&self, phase: Phase) -> Duration {
        self.slots[phase.index()][0]
    }

    /// Time spent in `phase` across attempts that were retried.
    pub fn prior(&self, phase: Phase) -> Duration {
        self.slots[phase.index()][1]
    }

    pub fn total(&self, phase: Phase) -> Duration {
        self.current(phase) + self.prior(phase)
    }

    /// Fold the current attempt into the prior bucket and start a fresh attempt.
    pub fn fold_for_retry(&mut self) {
        for slot in &mut self.slots {
            slot[1] += slot[0];
            slot[0] = Duration::ZERO;
        }
    }

    /// Emit every non-zero phase, plus commit phases and response writing.
    pub fn observe(
        &self,
        metrics: &dyn MetricsSink,
        internal: bool,
        commit: Option<&CommitDetails>,
        write_response: Duration,
    ) {
        let emit = |phase: &'static str, d: Duration| {
            if d > Duration::ZERO {
                metrics.observe(
                    Metric::ExecPhaseDuration,
                    &[phase, internal_flag(internal)],
                    d.as_secs_f64(),
                );
            }
        };

        for phase in Phase::ALL {
            emit(phase.final_label(), self.current(phase));
            emit(phase.locking_label(), self.prior(phase));
        }
        if let Some(commit) = commit {
            emit(PHASE_COMMIT_PREWRITE, commit.prewrite_time);
            emit(PHASE_COMMIT_COMMIT, commit.commit_time);
            emit(PHASE_COMMIT_WAIT_COMMIT_TS, commit.get_commit_ts_time);
            emit(PHASE_COMMIT_WAIT_LATEST_TS, commit.get_latest_ts_time);
            emit(PHASE_COMMIT_WAIT_LATCH, commit.local_latch_time);
            emit(PHASE_COMMIT_WAIT_BINLOG, commit.wait_prewrite_binlog_time);
        }
        emit(PHASE_WRITE_RESPONSE, write_response);
    }
}

/// Label value separating internal statements from client statements.
pub fn internal_flag(internal: bool) -> &'static str {
    if internal { "1" } else { "0" }
}
