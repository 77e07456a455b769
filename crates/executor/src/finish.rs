//! Statement finalization: slow log, statement summary, audit, phase
//! metrics, tracker release.
//!
//! Everything here is observe-only. Sink failures are logged and dropped.

use crate::{ast::StmtKind, plan::PlanKind, stmt::ExecStmt};
use common::{DbError, StmtExecDetails, TableId};
use std::{sync::Arc, time::Duration};
use telemetry::{
    audit::dispatch, dedup_index_names, format_sql, AuditEvent, Metric, Phase, SlowQueryInfo,
    SlowQueryItems, StmtExecInfo,
};

fn run_label(internal: bool) -> &'static str {
    if internal {
        "internal"
    } else {
        "general"
    }
}

fn format_table_ids(ids: &[TableId]) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("[{}]", ids.join(","))
}

impl ExecStmt<'_> {
    /// Finish a statement that produced no record set (or failed before
    /// producing one).
    pub(crate) fn finalize(&mut self, txn_ts: u64, err: Option<&DbError>, has_more_results: bool) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.finish_execute_stmt(txn_ts, err.is_none(), has_more_results);
        self.detach_trackers();
    }

    /// Called by a record set on close. Runs once per statement.
    pub(crate) fn close_record_set(&mut self, txn_ts: u64, last_err: Option<String>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.finish_execute_stmt(txn_ts, last_err.is_none(), false);
        self.log_audit(last_err);
        self.detach_trackers();
    }

    pub(crate) fn detach_trackers(&mut self) {
        let stmt_ctx = &self.sctx.vars.stmt_ctx;
        stmt_ctx.disk_tracker.detach();
        stmt_ctx.mem_tracker.detach();
    }

    fn stmt_exec_details(&self) -> StmtExecDetails {
        self.stmt_details
            .as_ref()
            .map(|details| details.lock().clone())
            .unwrap_or_default()
    }

    /// Time spent retrying: everything after compile up to the start of the
    /// last attempt.
    fn retry_time(&self, cost: Duration) -> Duration {
        if self.retry_count == 0 {
            return Duration::ZERO;
        }
        let vars = &self.sctx.vars;
        let since_last = self
            .retry_start
            .map_or(Duration::ZERO, |start| start.elapsed());
        cost.saturating_sub(vars.duration_parse)
            .saturating_sub(vars.duration_compile)
            .saturating_sub(since_last)
    }

    fn result_rows(&self) -> u64 {
        let stmt_ctx = &self.sctx.vars.stmt_ctx;
        if self.plan.schema().is_empty() {
            stmt_ctx.affected_rows()
        } else {
            stmt_ctx.found_rows()
        }
    }

    /// Record the statement in the slow log, the statement summary, and the
    /// phase metrics, then remember it as the session's previous statement.
    pub(crate) fn finish_execute_stmt(&mut self, txn_ts: u64, succ: bool, has_more_results: bool) {
        self.sctx.vars.stmt_ctx.set_plan(Arc::clone(&self.plan));
        // Slow log and summary read the previous statement; record it after.
        self.log_slow_query(txn_ts, succ, has_more_results);
        self.summary_stmt(succ);

        let text = self.text_to_log();
        self.sctx.vars.prev_stmt = format_sql(&text, self.services.config.query_log_max_len);

        let metrics = Arc::clone(&self.services.observers.metrics);
        let internal = self.sctx.vars.in_restricted_sql;
        let commit = self
            .sctx
            .vars
            .stmt_ctx
            .exec_details()
            .commit_detail
            .clone()
            .or_else(|| self.sctx.txn().and_then(|txn| txn.commit_details()));
        let write_response = self.stmt_exec_details().write_sql_resp_duration;
        self.phases
            .observe(metrics.as_ref(), internal, commit.as_ref(), write_response);

        let vars = &mut self.sctx.vars;
        let execute = vars.start_time.elapsed().saturating_sub(vars.duration_compile);
        metrics.observe(
            Metric::SessionExecuteRunDuration,
            &[run_label(internal)],
            execute.as_secs_f64(),
        );

        // The next statement may arrive without a parse step.
        vars.duration_parse = Duration::ZERO;
        vars.stmt_ctx.is_staleness = false;
    }

    /// Write a slow-log entry when the statement ran past the threshold, or
    /// always when forced. Entries past the threshold also feed the slow
    /// query metrics and the recent-slow-query ring.
    pub(crate) fn log_slow_query(&mut self, txn_ts: u64, succ: bool, has_more_results: bool) {
        let services = Arc::clone(&self.services);
        let config = &services.config;
        let cost = self.sctx.vars.start_time.elapsed() + self.sctx.vars.duration_parse;
        if (!config.enable_slow_log || cost < config.slow_threshold) && !config.force_slow_log {
            return;
        }

        let sql = format_sql(&self.text_to_log(), config.query_log_max_len);
        let (_, digest) = self.sctx.vars.stmt_ctx.sql_digest();
        let plan_digest = self
            .sctx
            .vars
            .stmt_ctx
            .plan_digest()
            .map(|(_, digest)| digest.to_string())
            .unwrap_or_default();
        let details = self.stmt_exec_details();
        let vars = &self.sctx.vars;
        let stmt_ctx = &vars.stmt_ctx;
        let index_names = dedup_index_names(&stmt_ctx.index_names);

        let items = SlowQueryItems {
            txn_ts,
            sql,
            digest: digest.to_string(),
            time_total: cost,
            time_parse: vars.duration_parse,
            time_compile: vars.duration_compile,
            time_build: self.phases.total(Phase::Build),
            time_open: self.phases.total(Phase::Open),
            time_next: self.phases.total(Phase::Next),
            time_lock: self.phases.total(Phase::Lock),
            index_names: index_names.clone(),
            exec_detail: stmt_ctx.exec_details().clone(),
            mem_max: stmt_ctx.mem_tracker.max_consumed(),
            disk_max: stmt_ctx.disk_tracker.max_consumed(),
            succ,
            plan: if config.record_plan_in_slow_log {
                self.plan.explain()
            } else {
                String::new()
            },
            plan_digest,
            prepared: self.is_prepared,
            has_more_results,
            result_rows: self.result_rows(),
            exec_retry_count: self.retry_count,
            exec_retry_time: self.retry_time(cost),
            is_explicit_txn: vars.txn_ctx.is_explicit,
            is_internal: vars.in_restricted_sql,
            prev_stmt: (self.stmt_node.kind == StmtKind::Commit).then(|| vars.prev_stmt.clone()),
            write_sql_resp_total: details.write_sql_resp_duration,
            kv_total: details.wait_kv_resp_duration,
            pd_total: details.wait_pd_resp_duration,
            backoff_total: details.backoff_duration,
            user: vars.user.clone().unwrap_or_default(),
            db: vars.current_db.clone(),
            conn_id: vars.connection_id,
        };
        let rendered = items.format();
        if let Err(err) = services.observers.slow_log.write(&items, &rendered) {
            tracing::error!(error = %err, "write slow log failed");
        }

        if cost >= config.slow_threshold {
            let metrics = &services.observers.metrics;
            let label = [run_label(items.is_internal)];
            metrics.observe(Metric::QueryProcDuration, &label, cost.as_secs_f64());
            metrics.observe(
                Metric::CopProcDuration,
                &label,
                items.exec_detail.process_time.as_secs_f64(),
            );
            metrics.observe(
                Metric::CopWaitDuration,
                &label,
                items.exec_detail.wait_time.as_secs_f64(),
            );
            services.observers.slow_queries.push(SlowQueryInfo {
                sql: items.sql,
                digest: items.digest,
                duration: cost,
                succ,
                conn_id: items.conn_id,
                txn_ts,
                user: items.user,
                db: items.db,
                table_ids: format_table_ids(&stmt_ctx.table_ids),
                index_names,
                internal: items.is_internal,
                lock_keys: items.exec_detail.lock_keys_detail,
            });
        }
    }

    /// Add the statement to the digest summary.
    ///
    /// Internal statements still reset the previous-statement digest when
    /// they are not summarized, so a following `COMMIT` is not attributed to
    /// them.
    pub(crate) fn summary_stmt(&mut self, succ: bool) {
        let services = Arc::clone(&self.services);
        let summary = &services.observers.summary;
        let vars = &mut self.sctx.vars;
        let user = vars.user.clone().unwrap_or_default();
        if !summary.enabled()
            || ((vars.in_restricted_sql || user.is_empty()) && !summary.enabled_internal())
        {
            vars.set_prev_stmt_digest("");
            return;
        }
        if self.stmt_node.kind == StmtKind::Prepare {
            return;
        }
        if vars.stmt_ctx.stmt_type.is_empty() {
            vars.stmt_ctx.stmt_type = self.stmt_node.label().to_string();
        }

        let (normalized_sql, digest) = vars.stmt_ctx.sql_digest();
        let cost = vars.start_time.elapsed() + vars.duration_parse;
        let (prev_sql, prev_sql_digest) = if self.stmt_node.kind == StmtKind::Commit {
            // A COMMIT without a recorded predecessor carries no information.
            let prev_digest = vars.prev_stmt_digest().to_string();
            if prev_digest.is_empty() {
                return;
            }
            (vars.prev_stmt.clone(), prev_digest)
        } else {
            (String::new(), String::new())
        };
        vars.set_prev_stmt_digest(digest.to_string());

        let (plan, plan_digest) = vars
            .stmt_ctx
            .plan_digest()
            .map(|(normalized, digest)| (normalized, digest.to_string()))
            .unwrap_or_default();
        let sql = self.text_to_log();
        let vars = &self.sctx.vars;
        let stmt_ctx = &vars.stmt_ctx;
        let info = StmtExecInfo {
            schema_name: vars.current_db.to_lowercase(),
            original_sql: sql,
            normalized_sql,
            digest: digest.to_string(),
            prev_sql,
            prev_sql_digest,
            plan: if self.plan.kind() == PlanKind::PointGet {
                String::new()
            } else {
                plan
            },
            plan_digest,
            user,
            total_latency: cost,
            parse_latency: vars.duration_parse,
            compile_latency: vars.duration_compile,
            exec_detail: stmt_ctx.exec_details().clone(),
            mem_max: stmt_ctx.mem_tracker.max_consumed(),
            disk_max: stmt_ctx.disk_tracker.max_consumed(),
            start_time: vars.start_system_time,
            is_internal: vars.in_restricted_sql,
            succeed: succ,
            prepared: self.is_prepared,
            exec_retry_count: self.retry_count,
            exec_retry_time: self.retry_time(cost),
            result_rows: self.result_rows(),
            affected_rows: stmt_ctx.affected_rows(),
        };
        summary.add_statement(&info);
    }

    /// Report the statement to every audit sink. Internal statements are
    /// not audited.
    pub(crate) fn log_audit(&mut self, error: Option<String>) {
        if self.sctx.vars.in_restricted_sql || self.services.observers.audit.is_empty() {
            return;
        }
        let sql = self.text_to_log();
        let vars = &self.sctx.vars;
        let event = AuditEvent {
            conn_id: vars.connection_id,
            user: vars.user.clone().unwrap_or_default(),
            db: vars.current_db.clone(),
            sql,
            stmt_label: self.stmt_node.label().to_string(),
            succ: error.is_none(),
            error,
            affected_rows: vars.stmt_ctx.affected_rows(),
            cost: vars.start_time.elapsed(),
        };
        dispatch(&self.services.observers.audit, &event);
    }
}
