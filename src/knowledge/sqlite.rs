use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{builtin_seeds, FailurePattern, FixRecord, KnowledgeError, KnowledgeStore, PatternSource, Result};

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS failure_patterns (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            signature TEXT NOT NULL UNIQUE,
            signature_pattern TEXT NOT NULL,
            description TEXT NOT NULL,
            suggested_fix TEXT,
            confidence REAL NOT NULL,
            occurrences INTEGER NOT NULL,
            resolutions INTEGER NOT NULL,
            source TEXT NOT NULL,
            first_seen_ms INTEGER NOT NULL,
            last_seen_ms INTEGER NOT NULL,
            created_ms INTEGER NOT NULL,
            updated_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_patterns_signature ON failure_patterns(signature);

        CREATE TABLE IF NOT EXISTS fix_records (
            id TEXT PRIMARY KEY,
            pattern_id TEXT NOT NULL REFERENCES failure_patterns(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL,
            case_name TEXT NOT NULL,
            description TEXT NOT NULL,
            success INTEGER NOT NULL,
            created_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fix_pattern ON fix_records(pattern_id);
        "#,
    )
}

fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<FailurePattern> {
    let source: String = row.get("source")?;
    Ok(FailurePattern {
        id: row.get("id")?,
        category: row.get("category")?,
        signature: row.get("signature")?,
        signature_pattern: row.get("signature_pattern")?,
        description: row.get("description")?,
        suggested_fix: row.get("suggested_fix")?,
        confidence: row.get("confidence")?,
        occurrences: row.get("occurrences")?,
        resolutions: row.get("resolutions")?,
        source: if source == "built-in" { PatternSource::BuiltIn } else { PatternSource::Learned },
        first_seen_ms: row.get("first_seen_ms")?,
        last_seen_ms: row.get("last_seen_ms")?,
        created_ms: row.get("created_ms")?,
        updated_ms: row.get("updated_ms")?,
    })
}

fn row_to_fix(row: &rusqlite::Row) -> rusqlite::Result<FixRecord> {
    let success: i64 = row.get("success")?;
    Ok(FixRecord {
        id: row.get("id")?,
        pattern_id: row.get("pattern_id")?,
        run_id: row.get("run_id")?,
        case_name: row.get("case_name")?,
        description: row.get("description")?,
        success: success != 0,
        created_ms: row.get("created_ms")?,
    })
}

/// Embedded-SQL knowledge store.
pub struct SqliteKnowledgeStore {
    conn: Mutex<Connection>,
}

impl SqliteKnowledgeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn seed_builtins(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp_millis();
        for pattern in builtin_seeds(now) {
            conn.execute(
                "INSERT OR IGNORE INTO failure_patterns
                 (id, category, signature, signature_pattern, description, suggested_fix, confidence, occurrences, resolutions, source, first_seen_ms, last_seen_ms, created_ms, updated_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    pattern.id, pattern.category, pattern.signature, pattern.signature_pattern,
                    pattern.description, pattern.suggested_fix, pattern.confidence, pattern.occurrences,
                    pattern.resolutions, pattern.source.as_str(), pattern.first_seen_ms, pattern.last_seen_ms,
                    pattern.created_ms, pattern.updated_ms,
                ],
            )?;
        }
        Ok(())
    }

    async fn find_by_signature(&self, signature: &str) -> Result<Option<FailurePattern>> {
        let conn = self.conn.lock().await;
        let pattern = conn
            .query_row(
                "SELECT * FROM failure_patterns WHERE signature = ?1",
                params![signature],
                row_to_pattern,
            )
            .optional()?;
        Ok(pattern)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FailurePattern>> {
        let conn = self.conn.lock().await;
        let pattern = conn
            .query_row(
                "SELECT * FROM failure_patterns WHERE id = ?1",
                params![id],
                row_to_pattern,
            )
            .optional()?;
        Ok(pattern)
    }

    async fn insert_pattern(&self, pattern: FailurePattern) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO failure_patterns
             (id, category, signature, signature_pattern, description, suggested_fix, confidence, occurrences, resolutions, source, first_seen_ms, last_seen_ms, created_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                pattern.id, pattern.category, pattern.signature, pattern.signature_pattern,
                pattern.description, pattern.suggested_fix, pattern.confidence, pattern.occurrences,
                pattern.resolutions, pattern.source.as_str(), pattern.first_seen_ms, pattern.last_seen_ms,
                pattern.created_ms, pattern.updated_ms,
            ],
        )?;
        Ok(())
    }

    async fn update_pattern(&self, pattern: FailurePattern) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE failure_patterns SET confidence = ?1, occurrences = ?2, resolutions = ?3,
             suggested_fix = ?4, last_seen_ms = ?5, updated_ms = ?6 WHERE id = ?7",
            params![
                pattern.confidence, pattern.occurrences, pattern.resolutions,
                pattern.suggested_fix, pattern.last_seen_ms, pattern.updated_ms, pattern.id,
            ],
        )?;
        if changed == 0 {
            return Err(KnowledgeError::PatternNotFound(pattern.id));
        }
        Ok(())
    }

    async fn record_fix(&self, fix: FixRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fix_records (id, pattern_id, run_id, case_name, description, success, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![fix.id, fix.pattern_id, fix.run_id, fix.case_name, fix.description, fix.success as i64, fix.created_ms],
        )?;
        Ok(())
    }

    async fn fix_history(&self, pattern_id: &str) -> Result<Vec<FixRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM fix_records WHERE pattern_id = ?1 ORDER BY created_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![pattern_id], row_to_fix)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_builtins_is_idempotent() {
        let store = SqliteKnowledgeStore::open_in_memory().unwrap();
        store.seed_builtins().await.unwrap();
        store.seed_builtins().await.unwrap();
        let pattern = store
            .find_by_signature("builtin::CONNECTION_REFUSED")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pattern.occurrences, 0);
    }
}
