use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

use super::{
    clamp_limit, parse_max_age_days, CaseStatus, HistoryError, HistoryStore, Result, RunPage,
    RunQuery, RunStatus, TestCaseRunRecord, TestRunRecord, Trigger,
};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[Migration] = &[migration_001_initial, migration_002_schema_log];

fn migration_001_initial(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE test_runs (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            git_commit TEXT,
            git_branch TEXT,
            config_hash TEXT NOT NULL,
            trigger TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            flaky INTEGER NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX idx_test_runs_project_timestamp ON test_runs(project, timestamp_ms DESC);
        CREATE INDEX idx_test_runs_project_status ON test_runs(project, status);

        CREATE TABLE test_case_runs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
            suite_id TEXT NOT NULL,
            case_name TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            response_ms INTEGER,
            assertions INTEGER,
            error TEXT,
            snapshot TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_case_runs_run_id ON test_case_runs(run_id);
        CREATE INDEX idx_case_runs_suite_case ON test_case_runs(suite_id, case_name);
        CREATE INDEX idx_case_runs_name_created ON test_case_runs(case_name, created_at DESC);
        "#,
    )
}

/// Audit log of applied migrations; purely informational, added in a later
/// migration to demonstrate the ladder can evolve the schema non-trivially.
fn migration_002_schema_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
}

fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let current = current as usize;

    for (idx, migration) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = idx + 1;
        let tx = conn.transaction()?;
        migration(&tx)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at_ms) VALUES (?1, ?2)",
            params![version as i64, now_ms()],
        )
        .ok(); // table may not exist until migration 2 itself runs
        tx.pragma_update(None, "user_version", version as i64)?;
        tx.commit()?;
        info!(version, "applied history store migration");
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable, embedded-SQL history store with WAL and a numbered migration
/// ladder tracked via `PRAGMA user_version`.
pub struct SqliteHistoryStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<TestRunRecord> {
        let trigger_str: String = row.get("trigger")?;
        let status_str: String = row.get("status")?;
        Ok(TestRunRecord {
            id: row.get("id")?,
            project: row.get("project")?,
            timestamp_ms: row.get("timestamp_ms")?,
            git_commit: row.get("git_commit")?,
            git_branch: row.get("git_branch")?,
            config_hash: row.get("config_hash")?,
            trigger: Trigger::parse(&trigger_str).unwrap_or(Trigger::Cli),
            duration_ms: row.get("duration_ms")?,
            passed: row.get("passed")?,
            failed: row.get("failed")?,
            skipped: row.get("skipped")?,
            flaky: row.get("flaky")?,
            status: if status_str == "passed" {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
        })
    }

    fn row_to_case(row: &rusqlite::Row) -> rusqlite::Result<TestCaseRunRecord> {
        let status_str: String = row.get("status")?;
        Ok(TestCaseRunRecord {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            suite_id: row.get("suite_id")?,
            case_name: row.get("case_name")?,
            status: CaseStatus::parse(&status_str),
            duration_ms: row.get("duration_ms")?,
            attempts: row.get("attempts")?,
            response_ms: row.get("response_ms")?,
            assertions: row.get("assertions")?,
            error: row.get("error")?,
            snapshot: row.get("snapshot")?,
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save_run(&self, run: TestRunRecord, cases: Vec<TestCaseRunRecord>) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(HistoryError::Closed)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO test_runs (id, project, timestamp_ms, git_commit, git_branch, config_hash, trigger, duration_ms, passed, failed, skipped, flaky, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id,
                run.project,
                run.timestamp_ms,
                run.git_commit,
                run.git_branch,
                run.config_hash,
                run.trigger.as_str(),
                run.duration_ms,
                run.passed,
                run.failed,
                run.skipped,
                run.flaky,
                match run.status { RunStatus::Passed => "passed", RunStatus::Failed => "failed" },
            ],
        )?;

        for (i, case) in cases.iter().enumerate() {
            tx.execute(
                "INSERT INTO test_case_runs (id, run_id, suite_id, case_name, status, duration_ms, attempts, response_ms, assertions, error, snapshot, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    case.id,
                    case.run_id,
                    case.suite_id,
                    case.case_name,
                    case.status.as_str(),
                    case.duration_ms,
                    case.attempts,
                    case.response_ms,
                    case.assertions,
                    case.error,
                    case.snapshot,
                    run.timestamp_ms + i as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_run_by_id(&self, run_id: &str) -> Result<Option<(TestRunRecord, Vec<TestCaseRunRecord>)>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;

        let run = conn
            .query_row("SELECT * FROM test_runs WHERE id = ?1", params![run_id], Self::row_to_run)
            .optional()?;
        let Some(run) = run else { return Ok(None) };

        let mut stmt = conn.prepare(
            "SELECT * FROM test_case_runs WHERE run_id = ?1 ORDER BY created_at ASC",
        )?;
        let cases = stmt
            .query_map(params![run_id], Self::row_to_case)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some((run, cases)))
    }

    async fn get_runs(&self, project: &str, query: RunQuery) -> Result<RunPage> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;
        let limit = clamp_limit(query.limit);

        let status_filter = query.status.map(|s| match s {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        });
        let since_ms = query
            .days
            .map(|d| chrono::Utc::now().timestamp_millis() - d as i64 * 86_400_000);

        let mut where_clauses = vec!["project = ?1".to_string()];
        if status_filter.is_some() {
            where_clauses.push("status = ?2".to_string());
        }
        if since_ms.is_some() {
            where_clauses.push(format!("timestamp_ms >= ?{}", if status_filter.is_some() { 3 } else { 2 }));
        }
        let where_sql = where_clauses.join(" AND ");

        let total: i64 = {
            let sql = format!("SELECT COUNT(*) FROM test_runs WHERE {}", where_sql);
            let mut stmt = conn.prepare(&sql)?;
            bind_and_query_scalar(&mut stmt, project, status_filter, since_ms)?
        };

        let sql = format!(
            "SELECT * FROM test_runs WHERE {} ORDER BY timestamp_ms DESC LIMIT {} OFFSET {}",
            where_sql, limit, query.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let runs = bind_and_query_runs(&mut stmt, project, status_filter, since_ms)?;

        Ok(RunPage {
            runs,
            total: total as u64,
        })
    }

    async fn get_runs_in_date_range(
        &self,
        project: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<TestRunRecord>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM test_runs WHERE project = ?1 AND timestamp_ms BETWEEN ?2 AND ?3 ORDER BY timestamp_ms DESC",
        )?;
        let rows = stmt
            .query_map(params![project, start_ms, end_ms], Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_cases_for_run(&self, run_id: &str) -> Result<Vec<TestCaseRunRecord>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM test_case_runs WHERE run_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], Self::row_to_case)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_case_history(
        &self,
        case_name: &str,
        project: &str,
        limit: u32,
        suite_id: Option<&str>,
    ) -> Result<Vec<TestCaseRunRecord>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;
        let limit = clamp_limit(limit);

        let sql = if suite_id.is_some() {
            "SELECT tc.* FROM test_case_runs tc
             JOIN test_runs tr ON tr.id = tc.run_id
             WHERE tc.case_name = ?1 AND tr.project = ?2 AND tc.suite_id = ?3
             ORDER BY tr.timestamp_ms DESC, tc.created_at DESC LIMIT ?4"
        } else {
            "SELECT tc.* FROM test_case_runs tc
             JOIN test_runs tr ON tr.id = tc.run_id
             WHERE tc.case_name = ?1 AND tr.project = ?2
             ORDER BY tr.timestamp_ms DESC, tc.created_at DESC LIMIT ?3"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = if let Some(suite_id) = suite_id {
            stmt.query_map(params![case_name, project, suite_id, limit], Self::row_to_case)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![case_name, project, limit], Self::row_to_case)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    async fn get_distinct_case_names(
        &self,
        project: &str,
        suite_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<String>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(HistoryError::Closed)?;
        let limit = limit.unwrap_or(1000) as i64;

        let sql = if suite_id.is_some() {
            "SELECT DISTINCT tc.case_name FROM test_case_runs tc
             JOIN test_runs tr ON tr.id = tc.run_id
             WHERE tr.project = ?1 AND tc.suite_id = ?2 LIMIT ?3"
        } else {
            "SELECT DISTINCT tc.case_name FROM test_case_runs tc
             JOIN test_runs tr ON tr.id = tc.run_id
             WHERE tr.project = ?1 LIMIT ?2"
        };
        let mut stmt = conn.prepare(sql)?;
        let names = if let Some(suite_id) = suite_id {
            stmt.query_map(params![project, suite_id, limit], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![project, limit], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(names)
    }

    async fn cleanup(&self, project: &str, max_age: &str, max_runs: u32) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(HistoryError::Closed)?;
        let tx = conn.transaction()?;
        let mut deleted: u64 = 0;

        if let Some(days) = parse_max_age_days(max_age) {
            let cutoff = chrono::Utc::now().timestamp_millis() - days * 86_400_000;
            deleted += tx.execute(
                "DELETE FROM test_runs WHERE project = ?1 AND timestamp_ms < ?2",
                params![project, cutoff],
            )? as u64;
        }

        let keep_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM test_runs WHERE project = ?1 ORDER BY timestamp_ms DESC LIMIT ?2",
            )?;
            stmt.query_map(params![project, max_runs], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        if !keep_ids.is_empty() {
            let placeholders = keep_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "DELETE FROM test_runs WHERE project = ?1 AND id NOT IN ({})",
                placeholders
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![&project];
            for id in &keep_ids {
                bind_params.push(id);
            }
            deleted += stmt.execute(bind_params.as_slice())? as u64;
        } else {
            deleted += tx.execute("DELETE FROM test_runs WHERE project = ?1", params![project])? as u64;
        }

        tx.commit()?;
        Ok(deleted)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        guard.take();
        Ok(())
    }
}

fn bind_and_query_scalar(
    stmt: &mut rusqlite::Statement,
    project: &str,
    status: Option<&str>,
    since_ms: Option<i64>,
) -> rusqlite::Result<i64> {
    match (status, since_ms) {
        (Some(s), Some(t)) => stmt.query_row(params![project, s, t], |r| r.get(0)),
        (Some(s), None) => stmt.query_row(params![project, s], |r| r.get(0)),
        (None, Some(t)) => stmt.query_row(params![project, t], |r| r.get(0)),
        (None, None) => stmt.query_row(params![project], |r| r.get(0)),
    }
}

fn bind_and_query_runs(
    stmt: &mut rusqlite::Statement,
    project: &str,
    status: Option<&str>,
    since_ms: Option<i64>,
) -> rusqlite::Result<Vec<TestRunRecord>> {
    let rows = match (status, since_ms) {
        (Some(s), Some(t)) => stmt
            .query_map(params![project, s, t], SqliteHistoryStore::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        (Some(s), None) => stmt
            .query_map(params![project, s], SqliteHistoryStore::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        (None, Some(t)) => stmt
            .query_map(params![project, t], SqliteHistoryStore::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        (None, None) => stmt
            .query_map(params![project], SqliteHistoryStore::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run(id: &str, project: &str, ts: i64, failed: u32) -> (TestRunRecord, Vec<TestCaseRunRecord>) {
        let run = TestRunRecord {
            id: id.to_string(),
            project: project.to_string(),
            timestamp_ms: ts,
            git_commit: None,
            git_branch: None,
            config_hash: "abc".to_string(),
            trigger: Trigger::Cli,
            duration_ms: 100,
            passed: 2,
            failed,
            skipped: 0,
            flaky: 0,
            status: if failed > 0 { RunStatus::Failed } else { RunStatus::Passed },
        };
        let cases = vec![
            TestCaseRunRecord {
                id: format!("{id}-1"),
                run_id: id.to_string(),
                suite_id: "s1".to_string(),
                case_name: "case-a".to_string(),
                status: CaseStatus::Passed,
                duration_ms: 10,
                attempts: 1,
                response_ms: Some(5),
                assertions: Some(2),
                error: None,
                snapshot: None,
            },
            TestCaseRunRecord {
                id: format!("{id}-2"),
                run_id: id.to_string(),
                suite_id: "s1".to_string(),
                case_name: "case-b".to_string(),
                status: CaseStatus::Passed,
                duration_ms: 10,
                attempts: 1,
                response_ms: Some(5),
                assertions: Some(1),
                error: None,
                snapshot: None,
            },
            TestCaseRunRecord {
                id: format!("{id}-3"),
                run_id: id.to_string(),
                suite_id: "s1".to_string(),
                case_name: "case-c".to_string(),
                status: if failed > 0 { CaseStatus::Failed } else { CaseStatus::Passed },
                duration_ms: 10,
                attempts: 1,
                response_ms: Some(5),
                assertions: Some(1),
                error: if failed > 0 { Some("boom".into()) } else { None },
                snapshot: None,
            },
        ];
        (run, cases)
    }

    #[tokio::test]
    async fn save_then_query_run_round_trips_fields() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();
        let (run, cases) = sample_run("r1", "proj", 1_000, 1);
        store.save_run(run, cases).await.unwrap();

        let page = store
            .get_runs("proj", RunQuery { status: None, days: None, limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let (_, cases) = store.get_run_by_id("r1").await.unwrap().unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].case_name, "case-a");

        let deleted = store.cleanup("proj", "0d", 10).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn cleanup_keeps_only_max_runs() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();
        for i in 0..5 {
            let (run, cases) = sample_run(&format!("r{i}"), "proj", 1000 + i, 0);
            store.save_run(run, cases).await.unwrap();
        }
        let deleted = store.cleanup("proj", "nope", 2).await.unwrap();
        assert_eq!(deleted, 3);
        let page = store
            .get_runs("proj", RunQuery { status: None, days: None, limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn migrations_create_audit_table() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();
        let guard = store.conn.lock().await;
        let conn = guard.as_ref().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
