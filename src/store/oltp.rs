//! OLTP persistence: pipelines, scanners, executions, user budgets.
//! Embedded SQLite under WAL mode: `Arc<Mutex<Connection>>`, a schema
//! string run through `execute_batch`, document columns for large nested
//! structures. Every execution write is a compare-and-set on `version`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{
    Execution, ExecutionPhase, ExecutionStatus, Mode, Pipeline, Scanner, TriggerMode,
};
use crate::error::StoreError;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS pipelines (
    pipeline_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    trigger_mode TEXT NOT NULL,
    interval_minutes REAL NOT NULL,
    last_run_status TEXT,
    last_run_completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pipelines_active_periodic
    ON pipelines(is_active, trigger_mode);

CREATE TABLE IF NOT EXISTS scanners (
    scanner_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    tickers_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    execution_phase TEXT NOT NULL,
    version INTEGER NOT NULL,
    agent_states_json TEXT NOT NULL,
    result_json TEXT NOT NULL,
    pipeline_state_json TEXT,
    logs_json TEXT NOT NULL,
    reports_json TEXT NOT NULL,
    cost REAL NOT NULL,
    cost_breakdown_json TEXT NOT NULL,
    monitor_interval_minutes REAL NOT NULL,
    next_check_at TEXT,
    started_at TEXT,
    monitoring_started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    error_message TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_executions_pipeline_symbol_status
    ON executions(pipeline_id, symbol, status);
CREATE INDEX IF NOT EXISTS idx_executions_user_symbol_status
    ON executions(user_id, symbol, status);
CREATE INDEX IF NOT EXISTS idx_executions_status_next_check
    ON executions(status, next_check_at);
CREATE INDEX IF NOT EXISTS idx_executions_status_created
    ON executions(status, created_at);

CREATE TABLE IF NOT EXISTS user_budgets (
    user_id TEXT PRIMARY KEY,
    daily_spent REAL NOT NULL DEFAULT 0,
    daily_limit REAL NOT NULL,
    monthly_spent REAL NOT NULL DEFAULT 0,
    monthly_limit REAL NOT NULL,
    daily_reset_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub struct OltpStore {
    conn: Arc<Mutex<Connection>>,
}

impl OltpStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- pipelines ----

    pub fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let config_json = serde_json::to_string(pipeline)?;
        let trigger_mode = match pipeline.trigger_mode {
            TriggerMode::Signal => "signal",
            TriggerMode::Periodic => "periodic",
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipelines
                (pipeline_id, user_id, name, config_json, is_active, trigger_mode, interval_minutes, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
             ON CONFLICT(pipeline_id) DO UPDATE SET
                user_id = excluded.user_id,
                name = excluded.name,
                config_json = excluded.config_json,
                is_active = excluded.is_active,
                trigger_mode = excluded.trigger_mode,
                interval_minutes = excluded.interval_minutes,
                version = pipelines.version + 1",
            params![
                pipeline.pipeline_id.to_string(),
                pipeline.user_id.to_string(),
                pipeline.name,
                config_json,
                pipeline.is_active as i64,
                trigger_mode,
                pipeline.interval_minutes,
            ],
        )?;
        Ok(())
    }

    pub fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT config_json FROM pipelines WHERE pipeline_id = ?1")?;
        let mut rows = stmt.query(params![pipeline_id.to_string()])?;
        if let Some(row) = rows.next()? {
            let config_json: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&config_json)?))
        } else {
            Ok(None)
        }
    }

    pub fn active_signal_pipelines(&self) -> Result<Vec<Pipeline>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT config_json FROM pipelines WHERE is_active = 1 AND trigger_mode = 'signal'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn due_periodic_pipelines(&self, now: DateTime<Utc>) -> Result<Vec<Pipeline>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT config_json, interval_minutes, last_run_completed_at FROM pipelines
             WHERE is_active = 1 AND trigger_mode = 'periodic'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (config_json, interval_minutes, last_run) = row?;
            let due = match last_run.as_deref().and_then(|s| s.parse::<DateTime<Utc>>().ok()) {
                None => true,
                Some(last) => now - last >= chrono::Duration::minutes(interval_minutes as i64),
            };
            if due {
                out.push(serde_json::from_str(&config_json)?);
            }
        }
        Ok(out)
    }

    pub fn mark_pipeline_run(
        &self,
        pipeline_id: Uuid,
        status: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pipelines SET last_run_status = ?1, last_run_completed_at = ?2 WHERE pipeline_id = ?3",
            params![status, completed_at.to_rfc3339(), pipeline_id.to_string()],
        )?;
        Ok(())
    }

    // ---- scanners ----

    pub fn upsert_scanner(&self, scanner: &Scanner) -> Result<(), StoreError> {
        let tickers_json = serde_json::to_string(&scanner.tickers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scanners (scanner_id, user_id, name, tickers_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scanner_id) DO UPDATE SET
                name = excluded.name, tickers_json = excluded.tickers_json",
            params![
                scanner.scanner_id.to_string(),
                scanner.user_id.to_string(),
                scanner.name,
                tickers_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_scanner(&self, scanner_id: Uuid) -> Result<Option<Scanner>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT scanner_id, user_id, name, tickers_json FROM scanners WHERE scanner_id = ?1",
        )?;
        let mut rows = stmt.query(params![scanner_id.to_string()])?;
        if let Some(row) = rows.next()? {
            let tickers_json: String = row.get(3)?;
            Ok(Some(Scanner {
                scanner_id: row.get::<_, String>(0)?.parse().unwrap_or(Uuid::nil()),
                user_id: row.get::<_, String>(1)?.parse().unwrap_or(Uuid::nil()),
                name: row.get(2)?,
                tickers: serde_json::from_str(&tickers_json)?,
            }))
        } else {
            Ok(None)
        }
    }

    // ---- executions ----

    pub fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        Self::write_execution_row(&conn, execution, true)
    }

    fn write_execution_row(
        conn: &Connection,
        e: &Execution,
        insert: bool,
    ) -> Result<(), StoreError> {
        let agent_states_json = serde_json::to_string(&e.agent_states)?;
        let result_json = serde_json::to_string(&e.result)?;
        let pipeline_state_json = e
            .pipeline_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let logs_json = serde_json::to_string(&e.logs)?;
        let reports_json = serde_json::to_string(&e.reports)?;

        if insert {
            conn.execute(
                "INSERT INTO executions (
                    execution_id, pipeline_id, user_id, symbol, mode, status, execution_phase,
                    version, agent_states_json, result_json, pipeline_state_json, logs_json,
                    reports_json, cost, cost_breakdown_json, monitor_interval_minutes,
                    next_check_at, started_at, monitoring_started_at, completed_at, created_at,
                    error_message
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
                params![
                    e.execution_id.to_string(),
                    e.pipeline_id.to_string(),
                    e.user_id.to_string(),
                    e.symbol,
                    status_str(e.mode),
                    execution_status_str(e.status),
                    execution_phase_str(e.execution_phase),
                    e.version,
                    agent_states_json,
                    result_json,
                    pipeline_state_json,
                    logs_json,
                    reports_json,
                    e.cost,
                    e.cost_breakdown.to_string(),
                    e.monitor_interval_minutes,
                    e.next_check_at.map(|t| t.to_rfc3339()),
                    e.started_at.map(|t| t.to_rfc3339()),
                    e.monitoring_started_at.map(|t| t.to_rfc3339()),
                    e.completed_at.map(|t| t.to_rfc3339()),
                    e.created_at.to_rfc3339(),
                    e.error_message,
                ],
            )?;
        }
        Ok(())
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(Self::SELECT_EXECUTION)?;
        let mut rows = stmt.query(params![execution_id.to_string()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_execution(row)?))
        } else {
            Ok(None)
        }
    }

    const EXECUTION_COLUMNS: &'static str =
        "execution_id, pipeline_id, user_id, symbol, mode, status, execution_phase, version,
         agent_states_json, result_json, pipeline_state_json, logs_json, reports_json, cost,
         cost_breakdown_json, monitor_interval_minutes, next_check_at, started_at,
         monitoring_started_at, completed_at, created_at, error_message";

    const SELECT_EXECUTION: &'static str =
        "SELECT execution_id, pipeline_id, user_id, symbol, mode, status, execution_phase, version,
         agent_states_json, result_json, pipeline_state_json, logs_json, reports_json, cost,
         cost_breakdown_json, monitor_interval_minutes, next_check_at, started_at,
         monitoring_started_at, completed_at, created_at, error_message
         FROM executions WHERE execution_id = ?1";

    fn row_to_execution(row: &rusqlite::Row<'_>) -> Result<Execution, StoreError> {
        let mode_str: String = row.get(4)?;
        let status_str: String = row.get(5)?;
        let phase_str: String = row.get(6)?;
        let pipeline_state_json: Option<String> = row.get(10)?;
        Ok(Execution {
            execution_id: row.get::<_, String>(0)?.parse().unwrap_or(Uuid::nil()),
            pipeline_id: row.get::<_, String>(1)?.parse().unwrap_or(Uuid::nil()),
            user_id: row.get::<_, String>(2)?.parse().unwrap_or(Uuid::nil()),
            symbol: row.get(3)?,
            mode: parse_mode(&mode_str),
            status: parse_execution_status(&status_str),
            execution_phase: parse_execution_phase(&phase_str),
            version: row.get(7)?,
            agent_states: serde_json::from_str(&row.get::<_, String>(8)?)?,
            result: serde_json::from_str(&row.get::<_, String>(9)?)?,
            pipeline_state: pipeline_state_json
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            logs: serde_json::from_str(&row.get::<_, String>(11)?)?,
            reports: serde_json::from_str(&row.get::<_, String>(12)?)?,
            cost: row.get(13)?,
            cost_breakdown: serde_json::from_str(&row.get::<_, String>(14)?)
                .unwrap_or(serde_json::json!({})),
            monitor_interval_minutes: row.get(15)?,
            next_check_at: row
                .get::<_, Option<String>>(16)?
                .and_then(|s| s.parse().ok()),
            started_at: row
                .get::<_, Option<String>>(17)?
                .and_then(|s| s.parse().ok()),
            monitoring_started_at: row
                .get::<_, Option<String>>(18)?
                .and_then(|s| s.parse().ok()),
            completed_at: row
                .get::<_, Option<String>>(19)?
                .and_then(|s| s.parse().ok()),
            created_at: row.get::<_, String>(20)?.parse().unwrap_or_else(|_| Utc::now()),
            error_message: row.get(21)?,
        })
    }

    /// Compare-and-set write: succeeds only if the stored `version` equals
    /// `expected_version`, then bumps it by one. Retried by the caller (not
    /// here) on a zero-rows-affected outcome, per the optimistic-concurrency
    /// discipline used across the executor and monitoring task.
    pub fn update_execution_cas(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let agent_states_json = serde_json::to_string(&execution.agent_states)?;
        let result_json = serde_json::to_string(&execution.result)?;
        let pipeline_state_json = execution
            .pipeline_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let logs_json = serde_json::to_string(&execution.logs)?;
        let reports_json = serde_json::to_string(&execution.reports)?;

        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE executions SET
                status = ?1, execution_phase = ?2, version = ?3, agent_states_json = ?4,
                result_json = ?5, pipeline_state_json = ?6, logs_json = ?7, reports_json = ?8,
                cost = ?9, cost_breakdown_json = ?10, monitor_interval_minutes = ?11,
                next_check_at = ?12, started_at = ?13, monitoring_started_at = ?14,
                completed_at = ?15, error_message = ?16
             WHERE execution_id = ?17 AND version = ?18",
            params![
                execution_status_str(execution.status),
                execution_phase_str(execution.execution_phase),
                expected_version + 1,
                agent_states_json,
                result_json,
                pipeline_state_json,
                logs_json,
                reports_json,
                execution.cost,
                execution.cost_breakdown.to_string(),
                execution.monitor_interval_minutes,
                execution.next_check_at.map(|t| t.to_rfc3339()),
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.monitoring_started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.error_message,
                execution.execution_id.to_string(),
                expected_version,
            ],
        )?;
        if changed == 0 {
            warn!(
                execution_id = %execution.execution_id,
                expected_version,
                "optimistic concurrency conflict on execution update"
            );
        }
        Ok(changed > 0)
    }

    /// Minimal status-only recovery write used after a failed full commit —
    /// never overwrites the document columns.
    pub fn recover_status_only(
        &self,
        execution_id: Uuid,
        expected_version: i64,
        status: ExecutionStatus,
        phase: ExecutionPhase,
        next_check_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE executions SET status = ?1, execution_phase = ?2, version = ?3,
                next_check_at = ?4, completed_at = ?5
             WHERE execution_id = ?6 AND version = ?7",
            params![
                execution_status_str(status),
                execution_phase_str(phase),
                expected_version + 1,
                next_check_at.map(|t| t.to_rfc3339()),
                completed_at.map(|t| t.to_rfc3339()),
                execution_id.to_string(),
                expected_version,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Full CAS write, falling back to a status-only recovery write against
    /// the freshly-read version on conflict. Used by every caller that
    /// drives an execution forward (the executor, the monitoring task, the
    /// reconciliation task) instead of each reimplementing the retry.
    /// Bumps `execution.version` in place on success either way.
    pub fn commit_execution(&self, execution: &mut Execution) -> Result<(), StoreError> {
        let expected = execution.version;
        if self.update_execution_cas(execution, expected)? {
            execution.version = expected + 1;
        } else {
            let fresh = self.get_execution(execution.execution_id)?.ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: execution.execution_id.to_string(),
            })?;
            let recovered = self.recover_status_only(
                execution.execution_id,
                fresh.version,
                execution.status,
                execution.execution_phase,
                execution.next_check_at,
                execution.completed_at,
            )?;
            if !recovered {
                return Err(StoreError::VersionConflict {
                    entity: "execution",
                    id: execution.execution_id.to_string(),
                    expected: fresh.version,
                });
            }
            execution.version = fresh.version + 1;
        }

        // Periodic-mode scheduling reads this back to decide when a pipeline
        // is next due; every path that drives an execution to a terminal
        // status funnels through here, so this is the one place that needs
        // to touch it rather than every call site remembering to.
        if let Some(completed_at) = execution.completed_at {
            let status = match execution.status {
                ExecutionStatus::Completed => Some("COMPLETED"),
                ExecutionStatus::Failed => Some("FAILED"),
                _ => None,
            };
            if let Some(status) = status {
                self.mark_pipeline_run(execution.pipeline_id, status, completed_at)?;
            }
        }
        Ok(())
    }

    /// Executions for `(pipeline_id, symbol)` currently in one of `statuses`.
    pub fn active_for_pipeline_symbol(
        &self,
        pipeline_id: Uuid,
        symbol: &str,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| {
            e.pipeline_id == pipeline_id && e.symbol == symbol && statuses.contains(&e.status)
        })
    }

    /// Executions for `pipeline_id` currently in one of `statuses`, any
    /// symbol. Used by periodic-mode scheduling, which doesn't know its
    /// ticker until the executor resolves it from the pipeline's scanner.
    pub fn active_for_pipeline(
        &self,
        pipeline_id: Uuid,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| e.pipeline_id == pipeline_id && statuses.contains(&e.status))
    }

    pub fn active_for_user_symbol(
        &self,
        user_id: Uuid,
        symbol: &str,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| {
            e.user_id == user_id && e.symbol == symbol && statuses.contains(&e.status)
        })
    }

    pub fn executions_with_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| statuses.contains(&e.status))
    }

    pub fn executions_for_user_with_status(
        &self,
        user_id: Uuid,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| e.user_id == user_id && statuses.contains(&e.status))
    }

    pub fn distinct_users_with_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = self.filter_rows(|e| statuses.contains(&e.status))?;
        let mut users: Vec<Uuid> = rows.into_iter().map(|e| e.user_id).collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    pub fn stale_running_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        self.filter_rows(|e| {
            matches!(e.status, ExecutionStatus::Running | ExecutionStatus::Pending)
                && e.started_at.or(Some(e.created_at)).unwrap_or(e.created_at) < older_than
        })
    }

    pub fn delete_old_terminal_executions(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM executions WHERE status IN ('COMPLETED', 'FAILED')
             AND completed_at IS NOT NULL AND completed_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Scans every row and filters in Rust; acceptable at this crate's scale
    /// since executions are pruned daily by `delete_old_terminal_executions`
    /// and JSON document columns make targeted SQL predicates impractical.
    fn filter_rows(
        &self,
        predicate: impl Fn(&Execution) -> bool,
    ) -> Result<Vec<Execution>, StoreError> {
        let conn = self.conn.lock();
        let query = format!("SELECT {} FROM executions", Self::EXECUTION_COLUMNS);
        let mut stmt = conn.prepare_cached(&query)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let execution = Self::row_to_execution(row)?;
            if predicate(&execution) {
                out.push(execution);
            }
        }
        Ok(out)
    }

    // ---- user budgets ----

    pub fn ensure_budget(&self, user_id: Uuid, daily: f64, monthly: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO user_budgets (user_id, daily_limit, monthly_limit, daily_reset_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id.to_string(), daily, monthly, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn budget_exceeded(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(f64, f64, f64, f64)> = conn
            .query_row(
                "SELECT daily_spent, daily_limit, monthly_spent, monthly_limit
                 FROM user_budgets WHERE user_id = ?1",
                params![user_id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .ok();
        Ok(match row {
            Some((daily_spent, daily_limit, monthly_spent, monthly_limit)) => {
                daily_spent >= daily_limit || monthly_spent >= monthly_limit
            }
            None => false,
        })
    }

    pub fn record_spend(&self, user_id: Uuid, amount: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE user_budgets SET daily_spent = daily_spent + ?1, monthly_spent = monthly_spent + ?1
             WHERE user_id = ?2",
            params![amount, user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn reset_stale_daily_budgets(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let cutoff = now - chrono::Duration::hours(24);
        let changed = conn.execute(
            "UPDATE user_budgets SET daily_spent = 0, daily_reset_at = ?1 WHERE daily_reset_at < ?2",
            params![now.to_rfc3339(), cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }
}

fn status_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Live => "live",
        Mode::Paper => "paper",
        Mode::Simulation => "simulation",
        Mode::Validation => "validation",
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "live" => Mode::Live,
        "simulation" => Mode::Simulation,
        "validation" => Mode::Validation,
        _ => Mode::Paper,
    }
}

fn execution_status_str(s: ExecutionStatus) -> &'static str {
    match s {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Monitoring => "MONITORING",
        ExecutionStatus::Completed => "COMPLETED",
        ExecutionStatus::Failed => "FAILED",
        ExecutionStatus::Cancelled => "CANCELLED",
        ExecutionStatus::Paused => "PAUSED",
        ExecutionStatus::CommunicationError => "COMMUNICATION_ERROR",
        ExecutionStatus::NeedsReconciliation => "NEEDS_RECONCILIATION",
        ExecutionStatus::AwaitingApproval => "AWAITING_APPROVAL",
    }
}

fn parse_execution_status(s: &str) -> ExecutionStatus {
    match s {
        "RUNNING" => ExecutionStatus::Running,
        "MONITORING" => ExecutionStatus::Monitoring,
        "COMPLETED" => ExecutionStatus::Completed,
        "FAILED" => ExecutionStatus::Failed,
        "CANCELLED" => ExecutionStatus::Cancelled,
        "PAUSED" => ExecutionStatus::Paused,
        "COMMUNICATION_ERROR" => ExecutionStatus::CommunicationError,
        "NEEDS_RECONCILIATION" => ExecutionStatus::NeedsReconciliation,
        "AWAITING_APPROVAL" => ExecutionStatus::AwaitingApproval,
        _ => ExecutionStatus::Pending,
    }
}

fn execution_phase_str(p: ExecutionPhase) -> &'static str {
    match p {
        ExecutionPhase::Pending => "pending",
        ExecutionPhase::Running => "running",
        ExecutionPhase::Monitoring => "monitoring",
        ExecutionPhase::Completed => "completed",
        ExecutionPhase::NeedsReconciliation => "needs_reconciliation",
    }
}

fn parse_execution_phase(s: &str) -> ExecutionPhase {
    match s {
        "running" => ExecutionPhase::Running,
        "monitoring" => ExecutionPhase::Monitoring,
        "completed" => ExecutionPhase::Completed,
        "needs_reconciliation" => ExecutionPhase::NeedsReconciliation,
        _ => ExecutionPhase::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution() -> Execution {
        Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL".to_string(), Mode::Paper)
    }

    #[test]
    fn insert_and_fetch_roundtrips() {
        let store = OltpStore::in_memory().unwrap();
        let execution = sample_execution();
        store.insert_execution(&execution).unwrap();
        let fetched = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(fetched.symbol, "AAPL");
        assert_eq!(fetched.version, 0);
    }

    #[test]
    fn cas_update_rejects_stale_version() {
        let store = OltpStore::in_memory().unwrap();
        let mut execution = sample_execution();
        store.insert_execution(&execution).unwrap();

        execution.status = ExecutionStatus::Running;
        assert!(store.update_execution_cas(&execution, 0).unwrap());

        // Retrying with the same (now stale) expected_version must fail.
        execution.status = ExecutionStatus::Completed;
        assert!(!store.update_execution_cas(&execution, 0).unwrap());

        let fetched = store.get_execution(execution.execution_id).unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Running);
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn at_most_one_active_per_pipeline_symbol() {
        let store = OltpStore::in_memory().unwrap();
        let pipeline_id = Uuid::new_v4();
        let mut a = Execution::new_pending(pipeline_id, Uuid::new_v4(), "MSFT".to_string(), Mode::Paper);
        a.status = ExecutionStatus::Monitoring;
        store.insert_execution(&a).unwrap();

        let active = store
            .active_for_pipeline_symbol(
                pipeline_id,
                "MSFT",
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Monitoring,
                    ExecutionStatus::CommunicationError,
                ],
            )
            .unwrap();
        assert_eq!(active.len(), 1);
    }
}
