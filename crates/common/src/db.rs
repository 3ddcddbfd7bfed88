//! SQLite-backed result store

use crate::store::ResultStore;
use crate::{
    Error, MetricCategory, MetricRecord, NewTestResult, Result, TestResult, TestStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Result store persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;

        info!("Opened result database at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS test_results (
                id TEXT PRIMARY KEY,
                test_id TEXT NOT NULL UNIQUE,
                test_type TEXT NOT NULL,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                current_step TEXT,
                progress INTEGER,
                metrics TEXT NOT NULL DEFAULT 'null',
                summary TEXT NOT NULL DEFAULT '{}',
                config TEXT NOT NULL DEFAULT '{}',
                raw_output TEXT NOT NULL DEFAULT '',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_results_status ON test_results(status);
            CREATE INDEX IF NOT EXISTS idx_test_results_url ON test_results(url, test_type);

            -- Metric rows are appended per run; reruns of a test id add rows
            CREATE TABLE IF NOT EXISTS test_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_id TEXT NOT NULL,
                category TEXT NOT NULL,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_metrics_lookup ON test_metrics(test_id, category, name);
            "#,
        )?;

        debug!("Result schema initialized");
        Ok(())
    }

    fn write_result(conn: &Connection, result: &TestResult, replace: bool) -> Result<usize> {
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let changed = conn.execute(
            &format!(
                "{} INTO test_results (id, test_id, test_type, url, name, description, status,
                     current_step, progress, metrics, summary, config, raw_output, error,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                verb
            ),
            params![
                result.id,
                result.test_id,
                result.test_type,
                result.url,
                result.name,
                result.description,
                result.status.to_string(),
                result.current_step,
                result.progress,
                serde_json::to_string(&result.metrics)?,
                serde_json::to_string(&result.summary)?,
                serde_json::to_string(&result.config)?,
                result.raw_output,
                result.error,
                result.created_at.to_rfc3339(),
                result.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(changed)
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn create_initial_result(&self, new: NewTestResult) -> Result<TestResult> {
        let result = TestResult::from_new(new);
        let conn = self.conn.lock();
        Self::write_result(&conn, &result, true)?;
        debug!("Inserted result {} for test {}", result.id, result.test_id);
        Ok(result)
    }

    async fn update_result(&self, result: &TestResult) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE test_results SET status = ?1, current_step = ?2, progress = ?3, metrics = ?4,
                 summary = ?5, raw_output = ?6, error = ?7, updated_at = ?8
             WHERE test_id = ?9",
            params![
                result.status.to_string(),
                result.current_step,
                result.progress,
                serde_json::to_string(&result.metrics)?,
                serde_json::to_string(&result.summary)?,
                result.raw_output,
                result.error,
                result.updated_at.to_rfc3339(),
                result.test_id,
            ],
        )?;

        if changed == 0 {
            return Err(Error::test_not_found(&result.test_id));
        }

        debug!("Updated result for test {} ({})", result.test_id, result.status);
        Ok(())
    }

    async fn get_result_by_test_id(&self, test_id: &str) -> Result<Option<TestResult>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, test_id, test_type, url, name, description, status, current_step,
                        progress, metrics, summary, config, raw_output, error, created_at, updated_at
                 FROM test_results WHERE test_id = ?1",
                params![test_id],
                |row| {
                    Ok(RawResultRow {
                        id: row.get(0)?,
                        test_id: row.get(1)?,
                        test_type: row.get(2)?,
                        url: row.get(3)?,
                        name: row.get(4)?,
                        description: row.get(5)?,
                        status: row.get(6)?,
                        current_step: row.get(7)?,
                        progress: row.get(8)?,
                        metrics: row.get(9)?,
                        summary: row.get(10)?,
                        config: row.get(11)?,
                        raw_output: row.get(12)?,
                        error: row.get(13)?,
                        created_at: row.get(14)?,
                        updated_at: row.get(15)?,
                    })
                },
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    async fn save_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO test_metrics (test_id, category, name, value, unit, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.test_id,
                    record.category.to_string(),
                    record.name,
                    record.value,
                    record.unit,
                    record.description,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        debug!("Inserted {} metric rows", records.len());
        Ok(())
    }

    async fn metrics_for_test(&self, test_id: &str) -> Result<Vec<MetricRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT test_id, category, name, value, unit, description
             FROM test_metrics WHERE test_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![test_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (test_id, category, name, value, unit, description) = row?;
            let category = MetricCategory::parse(&category).ok_or_else(|| {
                Error::Internal(format!("unknown metric category in store: {}", category))
            })?;
            records.push(MetricRecord {
                test_id,
                category,
                name,
                value,
                unit,
                description,
            });
        }
        Ok(records)
    }
}

struct RawResultRow {
    id: String,
    test_id: String,
    test_type: String,
    url: String,
    name: String,
    description: Option<String>,
    status: String,
    current_step: Option<String>,
    progress: Option<u8>,
    metrics: String,
    summary: String,
    config: String,
    raw_output: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawResultRow {
    fn parse(self) -> Result<TestResult> {
        let status = TestStatus::parse(&self.status)
            .ok_or_else(|| Error::Internal(format!("unknown status in store: {}", self.status)))?;

        Ok(TestResult {
            id: self.id,
            test_id: self.test_id,
            test_type: self.test_type,
            url: self.url,
            name: self.name,
            description: self.description,
            status,
            current_step: self.current_step,
            progress: self.progress,
            metrics: serde_json::from_str(&self.metrics)?,
            summary: serde_json::from_str(&self.summary)?,
            config: serde_json::from_str(&self.config)?,
            raw_output: self.raw_output,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunSummary;

    fn new_result(test_id: &str) -> NewTestResult {
        NewTestResult {
            test_id: Some(test_id.to_string()),
            test_type: "lighthouse".to_string(),
            url: "https://example.com".to_string(),
            name: "audit".to_string(),
            description: Some("nightly".to_string()),
            status: TestStatus::Pending,
            config: serde_json::json!({"device": "desktop"}),
        }
    }

    #[tokio::test]
    async fn test_result_lifecycle() {
        let store = SqliteStore::open_memory().unwrap();
        let mut result = store.create_initial_result(new_result("t1")).await.unwrap();

        result.status = TestStatus::Completed;
        result.progress = Some(100);
        result.metrics = serde_json::json!({"performance": 93});
        result.summary = RunSummary {
            score: Some(93.0),
            ..Default::default()
        };
        result.raw_output = "{}".to_string();
        store.update_result(&result).await.unwrap();

        let stored = store.get_result_by_test_id("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TestStatus::Completed);
        assert_eq!(stored.progress, Some(100));
        assert_eq!(stored.metrics["performance"], 93);
        assert_eq!(stored.summary.score, Some(93.0));
        assert_eq!(stored.config["device"], "desktop");
        assert_eq!(stored.description.as_deref(), Some("nightly"));

        assert!(store.get_result_by_test_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metrics_duplicate_on_rerun() {
        let store = SqliteStore::open_memory().unwrap();
        let record = MetricRecord::new("t1", MetricCategory::Score, "performance", 93.0, "percent", "");

        store.create_initial_result(new_result("t1")).await.unwrap();
        store.save_metrics(&[record.clone()]).await.unwrap();
        store.create_initial_result(new_result("t1")).await.unwrap();
        store.save_metrics(&[record.clone()]).await.unwrap();

        let rows = store.metrics_for_test("t1").await.unwrap();
        assert_eq!(rows, vec![record.clone(), record]);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_initial_result(new_result("t1")).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let stored = reopened.get_result_by_test_id("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TestStatus::Pending);
    }
}
