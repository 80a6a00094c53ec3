//! libSQL-backed `MemoryStore`. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use super::migrations;
use super::relevance::{lexical_score, query_terms, rank};
use super::store::{HitSource, MemoryRecord, MemoryStore, SearchFilters, SearchHit, StoreAck};
use crate::error::StoreError;

const RECORD_COLUMNS: &str =
    "id, pool_id, worker_id, success, task, output, error, duration_ms, completed_at, content";

/// Single reused connection; `libsql::Connection` is safe for concurrent async use.
pub struct LibSqlMemoryStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlMemoryStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Misconfigured(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Misconfigured(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Memory store opened");
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create in-memory database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Total stored records.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM execution_records", ())
            .await
            .map_err(|e| StoreError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n as usize)
                .map_err(|e| StoreError::Query(format!("count row: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count: {e}"))),
        }
    }

    async fn insert_record(&self, record: &MemoryRecord) -> Result<bool, StoreError> {
        let task = serde_json::to_string(&record.task)
            .map_err(|e| StoreError::Serialization(format!("task: {e}")))?;
        let output = match &record.output {
            Some(value) => libsql::Value::Text(
                serde_json::to_string(value)
                    .map_err(|e| StoreError::Serialization(format!("output: {e}")))?,
            ),
            None => libsql::Value::Null,
        };
        let error = match &record.error {
            Some(e) => libsql::Value::Text(e.clone()),
            None => libsql::Value::Null,
        };

        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO execution_records (id, pool_id, worker_id, success, task, output, error, duration_ms, completed_at, content) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id.clone(),
                    record.pool_id.clone(),
                    record.worker_id.clone(),
                    record.success as i64,
                    task,
                    output,
                    error,
                    record.duration_ms as i64,
                    record.completed_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    record.content.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_record: {e}")))?;
        Ok(affected > 0)
    }
}

fn row_to_record(row: &libsql::Row) -> Result<MemoryRecord, StoreError> {
    let field = |e: libsql::Error| StoreError::Serialization(format!("row: {e}"));

    let task: String = row.get(4).map_err(field)?;
    let output: Option<String> = row.get(5).ok();
    let completed: String = row.get(8).map_err(field)?;

    Ok(MemoryRecord {
        id: row.get(0).map_err(field)?,
        pool_id: row.get(1).map_err(field)?,
        worker_id: row.get(2).map_err(field)?,
        success: row.get::<i64>(3).map_err(field)? != 0,
        task: serde_json::from_str(&task)
            .map_err(|e| StoreError::Serialization(format!("task column: {e}")))?,
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(6).ok(),
        duration_ms: row.get::<i64>(7).map_err(field)?.max(0) as u64,
        completed_at: DateTime::parse_from_rfc3339(&completed)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Serialization(format!("completed_at column: {e}")))?,
        content: row.get(9).map_err(field)?,
    })
}

#[async_trait]
impl MemoryStore for LibSqlMemoryStore {
    async fn store_batch(&self, records: &[MemoryRecord]) -> Result<StoreAck, StoreError> {
        let mut ack = StoreAck::default();
        for record in records {
            if self.insert_record(record).await? {
                ack.inserted += 1;
            } else {
                ack.duplicates += 1;
            }
        }
        debug!(inserted = ack.inserted, duplicates = ack.duplicates, "Stored record batch");
        Ok(ack)
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let terms = query_terms(query);

        // Rows are ranked in SQL by how many terms they contain, so the limit
        // never cuts a better match in favour of a newer, weaker one.
        let mut clauses = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();
        let mut term_hits = Vec::new();
        for term in &terms {
            values.push(libsql::Value::Text(format!("%{term}%")));
            term_hits.push(format!("(content LIKE ?{})", values.len()));
        }
        let score_expr = if term_hits.is_empty() {
            "0".to_string()
        } else {
            term_hits.join(" + ")
        };
        if !term_hits.is_empty() {
            clauses.push(format!("({score_expr}) > 0"));
        }
        if let Some(pool_id) = &filters.pool_id {
            values.push(libsql::Value::Text(pool_id.clone()));
            clauses.push(format!("pool_id = ?{}", values.len()));
        }
        if filters.success_only {
            clauses.push("success = 1".to_string());
        }
        values.push(libsql::Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let limit_param = values.len();

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS}, ({score_expr}) AS term_hits FROM execution_records {where_clause} \
             ORDER BY term_hits DESC, completed_at DESC LIMIT ?{limit_param}"
        );

        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| StoreError::Query(format!("search: {e}")))?;

        let mut hits = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_record(&row) {
                Ok(record) => {
                    let score = lexical_score(&terms, &record.content);
                    hits.push(SearchHit {
                        record,
                        score,
                        source: HitSource::Store,
                    });
                }
                Err(e) => warn!(error = %e, "Skipping execution record row"),
            }
        }

        rank(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .query("SELECT 1 FROM execution_records LIMIT 1", ())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Misconfigured(format!("ping: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::{ExecutionResult, Task};

    fn record(pool: &str, worker: &str, prompt: &str, success: bool) -> MemoryRecord {
        let task = Task::prompt(prompt);
        let result = if success {
            ExecutionResult::succeeded(pool, worker, task, serde_json::json!("done"), Duration::from_millis(5))
        } else {
            ExecutionResult::failed(pool, worker, task, "worker crashed", Duration::from_millis(5))
        };
        MemoryRecord::from(&result)
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let store = LibSqlMemoryStore::new_memory().await.unwrap();
        let batch = vec![record("p1", "w0", "alpha", true), record("p1", "w1", "beta", true)];

        let ack = store.store_batch(&batch).await.unwrap();
        assert_eq!(ack, StoreAck { inserted: 2, duplicates: 0 });

        let ack = store.store_batch(&batch).await.unwrap();
        assert_eq!(ack, StoreAck { inserted: 0, duplicates: 2 });
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn search_ranks_by_term_coverage() {
        let store = LibSqlMemoryStore::new_memory().await.unwrap();
        store
            .store_batch(&[
                record("p1", "w0", "deploy the billing service", true),
                record("p2", "w0", "deploy docs", true),
                record("p2", "w1", "unrelated chores", true),
            ])
            .await
            .unwrap();

        let hits = store
            .search("deploy billing", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.pool_id, "p1");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
        assert!(hits.iter().all(|h| h.source == HitSource::Store));
    }

    #[tokio::test]
    async fn search_applies_filters_and_limit() {
        let store = LibSqlMemoryStore::new_memory().await.unwrap();
        store
            .store_batch(&[
                record("p1", "w0", "index rebuild", true),
                record("p1", "w1", "index rebuild", false),
                record("p2", "w0", "index rebuild", true),
            ])
            .await
            .unwrap();

        let filters = SearchFilters {
            pool_id: Some("p1".into()),
            success_only: true,
        };
        let hits = store.search("index", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.worker_id, "w0");

        let hits = store.search("index", &SearchFilters::default(), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn best_match_survives_many_newer_partial_matches() {
        let store = LibSqlMemoryStore::new_memory().await.unwrap();
        let full = record("p1", "w-old", "rotate the deploy keys", true);
        store.store_batch(std::slice::from_ref(&full)).await.unwrap();

        let partial: Vec<MemoryRecord> = (0..5100)
            .map(|i| record("p1", &format!("w{i}"), "deploy the service", true))
            .collect();
        store.store_batch(&partial).await.unwrap();

        let hits = store
            .search("deploy keys", &SearchFilters::default(), 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].record.id, full.id);
        assert_eq!(hits[0].score, 1.0);
        assert!(hits[1..].iter().all(|h| h.score == 0.5));
    }

    #[tokio::test]
    async fn round_trips_fields() {
        let store = LibSqlMemoryStore::new_memory().await.unwrap();
        let original = record("p1", "w0", "inspect", false);
        store.store_batch(std::slice::from_ref(&original)).await.unwrap();

        let hits = store.search("inspect", &SearchFilters::default(), 1).await.unwrap();
        assert_eq!(hits[0].record, original);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        {
            let store = LibSqlMemoryStore::new_local(&path).await.unwrap();
            store.store_batch(&[record("p1", "w0", "persist me", true)]).await.unwrap();
        }
        let store = LibSqlMemoryStore::new_local(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.ping().await.unwrap();
    }
}
