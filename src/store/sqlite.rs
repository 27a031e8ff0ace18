//! SQLite task store
//!
//! Each unit is stored as its JSON document next to the columns queries
//! filter on. `content_hash` carries a UNIQUE index, so two dispatchers
//! inserting the same content race on the index and one gets `Duplicate`.
//!
//! Status changes are optimistic: the row is read, the transition checked
//! and applied, then written back with
//! `UPDATE ... WHERE data_id = ? AND version = ? AND status IN (...)`.
//! A write that matches no row lost a race and is retried against the
//! fresh row, where the status check turns it into a `Conflict`.

use super::{BatchSummary, Page, PageRequest, ReviewUpdate, TaskStore, Transition, UnitFilter};
use crate::error::PipelineError;
use crate::model::{Annotation, QAUnit, TaskStatus};
use crate::observability::metrics::metrics;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Optimistic write attempts before a contended update gives up
const CAS_ATTEMPTS: usize = 8;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS qa_units (
        data_id TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        parent_id TEXT,
        batch_id TEXT,
        status TEXT NOT NULL,
        expire_at TEXT,
        created_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_qa_units_hash ON qa_units(content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_qa_units_trace ON qa_units(trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_qa_units_status ON qa_units(status, expire_at)",
    r#"
    CREATE TABLE IF NOT EXISTS qa_annotations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        annotation_id TEXT NOT NULL UNIQUE,
        task_id TEXT NOT NULL REFERENCES qa_units(data_id),
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_qa_annotations_task ON qa_annotations(task_id)",
];

/// Fixed-width RFC 3339, so text order is time order
fn sortable(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| PipelineError::validation(format!("stored timestamp {text:?}: {e}")))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Task store persisted in a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: Pool<Sqlite>,
}

impl SqliteTaskStore {
    /// Open or create the database at `path` and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "SQLite task store opened");
        Ok(store)
    }

    /// Private in-memory database; lives as long as the store
    pub async fn in_memory() -> Result<Self, PipelineError> {
        // Every connection to :memory: is its own database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), PipelineError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Unit plus the row version it was read at
    async fn load(&self, data_id: &str) -> Result<Option<(QAUnit, i64)>, PipelineError> {
        let row = sqlx::query("SELECT body, version FROM qa_units WHERE data_id = ?")
            .bind(data_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let unit = serde_json::from_str(&row.get::<String, _>("body"))?;
                Ok(Some((unit, row.get::<i64, _>("version"))))
            }
            None => Ok(None),
        }
    }

    async fn require(&self, data_id: &str) -> Result<(QAUnit, i64), PipelineError> {
        self.load(data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))
    }

    async fn units_where(&self, sql: &str, value: &str) -> Result<Vec<QAUnit>, PipelineError> {
        let bodies: Vec<String> = sqlx::query_scalar(sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(PipelineError::from))
            .collect()
    }

    async fn check_parent(&self, unit: &QAUnit, parent_id: &str) -> Result<(), PipelineError> {
        if parent_id == unit.data_id {
            return Err(PipelineError::validation(format!(
                "unit {} cannot be its own parent",
                unit.data_id
            )));
        }
        let trace: Option<String> =
            sqlx::query_scalar("SELECT trace_id FROM qa_units WHERE data_id = ?")
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await?;
        match trace {
            None => Err(PipelineError::validation(format!(
                "parent {parent_id} of unit {} does not exist",
                unit.data_id
            ))),
            Some(trace) if trace != unit.source_trace_id => Err(PipelineError::validation(format!(
                "parent {parent_id} is on trace {trace}, unit {} is on trace {}",
                unit.data_id, unit.source_trace_id
            ))),
            Some(_) => Ok(()),
        }
    }

    async fn load_annotation(
        &self,
        annotation_id: &str,
    ) -> Result<Option<Annotation>, PipelineError> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM qa_annotations WHERE annotation_id = ?")
                .bind(annotation_id)
                .fetch_optional(&self.pool)
                .await?;
        body.map(|body| serde_json::from_str(&body).map_err(PipelineError::from))
            .transpose()
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_unit(&self, unit: QAUnit) -> Result<QAUnit, PipelineError> {
        if unit.status != TaskStatus::Pending {
            return Err(PipelineError::validation(format!(
                "new unit {} must be pending, not {}",
                unit.data_id, unit.status
            )));
        }
        if let Some(parent_id) = &unit.parent_id {
            self.check_parent(&unit, parent_id).await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO qa_units
                (data_id, content_hash, trace_id, parent_id, batch_id, status, expire_at, created_at, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&unit.data_id)
        .bind(&unit.content_hash)
        .bind(&unit.source_trace_id)
        .bind(unit.parent_id.as_deref())
        .bind(unit.batch_id.as_deref())
        .bind(unit.status.as_str())
        .bind(unit.expire_at.as_ref().map(sortable))
        .bind(sortable(&unit.created_at))
        .bind(serde_json::to_string(&unit)?)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(data_id = %unit.data_id, "Unit stored");
                Ok(unit)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                if e.message().contains("content_hash") {
                    Err(PipelineError::duplicate(&unit.content_hash))
                } else {
                    Err(PipelineError::validation(format!(
                        "data_id {} already exists",
                        unit.data_id
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_unit(&self, data_id: &str) -> Result<Option<QAUnit>, PipelineError> {
        Ok(self.load(data_id).await?.map(|(unit, _)| unit))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<QAUnit>, PipelineError> {
        Ok(self
            .units_where("SELECT body FROM qa_units WHERE content_hash = ?", content_hash)
            .await?
            .pop())
    }

    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: &PageRequest,
    ) -> Result<Page<QAUnit>, PipelineError> {
        // Indexed fields narrow in SQL; the rest of the filter runs on the documents
        let bodies: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT body FROM qa_units
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR trace_id = ?2)
              AND (?3 IS NULL OR batch_id = ?3)
              AND (?4 IS NULL OR parent_id = ?4)
            ORDER BY created_at DESC, data_id ASC
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.trace_id.as_deref())
        .bind(filter.batch_id.as_deref())
        .bind(filter.parent_id.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut matching = Vec::new();
        for body in &bodies {
            let unit: QAUnit = serde_json::from_str(body)?;
            if filter.matches(&unit) {
                matching.push(unit);
            }
        }

        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(page.offset())
                .take(page.page_size)
                .collect(),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn units_for_trace(&self, trace_id: &str) -> Result<Vec<QAUnit>, PipelineError> {
        self.units_where(
            "SELECT body FROM qa_units WHERE trace_id = ? ORDER BY created_at, data_id",
            trace_id,
        )
        .await
    }

    async fn transition(
        &self,
        data_id: &str,
        expected: &[TaskStatus],
        transition: Transition,
    ) -> Result<QAUnit, PipelineError> {
        let sql = format!(
            "UPDATE qa_units SET status = ?, expire_at = ?, body = ?, version = version + 1 \
             WHERE data_id = ? AND version = ? AND status IN ({})",
            placeholders(expected.len().max(1))
        );

        for _ in 0..CAS_ATTEMPTS {
            let (mut unit, version) = self.require(data_id).await?;
            if !expected.contains(&unit.status) || !unit.status.can_transition_to(transition.to) {
                metrics().status_conflict();
                return Err(PipelineError::conflict(data_id, expected, unit.status));
            }

            let from = unit.status;
            transition.apply(&mut unit, Utc::now());
            let mut update = sqlx::query(&sql)
                .bind(unit.status.as_str())
                .bind(unit.expire_at.as_ref().map(sortable))
                .bind(serde_json::to_string(&unit)?)
                .bind(data_id)
                .bind(version);
            for status in expected {
                update = update.bind(status.as_str());
            }

            if update.execute(&self.pool).await?.rows_affected() == 1 {
                debug!(data_id = data_id, from = %from, to = %unit.status, "Status changed");
                return Ok(unit);
            }
        }

        let (unit, _) = self.require(data_id).await?;
        metrics().status_conflict();
        Err(PipelineError::conflict(data_id, expected, unit.status))
    }

    async fn set_parent(
        &self,
        data_id: &str,
        parent_id: Option<String>,
    ) -> Result<QAUnit, PipelineError> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut unit, version) = self.require(data_id).await?;
            if let Some(parent) = &parent_id {
                self.check_parent(&unit, parent).await?;
            }
            unit.parent_id = parent_id.clone();
            unit.updated_at = Utc::now();

            let updated = sqlx::query(
                "UPDATE qa_units SET parent_id = ?, body = ?, version = version + 1 \
                 WHERE data_id = ? AND version = ?",
            )
            .bind(unit.parent_id.as_deref())
            .bind(serde_json::to_string(&unit)?)
            .bind(data_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 1 {
                return Ok(unit);
            }
        }
        Err(PipelineError::transient(format!(
            "unit {data_id} kept changing while its parent was set"
        )))
    }

    async fn save_annotation(&self, annotation: Annotation) -> Result<Annotation, PipelineError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM qa_units WHERE data_id = ?)")
            .bind(&annotation.task_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(PipelineError::not_found(format!(
                "unit {}",
                annotation.task_id
            )));
        }

        // A resubmitted id keeps its original position
        sqlx::query(
            r#"
            INSERT INTO qa_annotations (annotation_id, task_id, body) VALUES (?, ?, ?)
            ON CONFLICT(annotation_id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(&annotation.annotation_id)
        .bind(&annotation.task_id)
        .bind(serde_json::to_string(&annotation)?)
        .execute(&self.pool)
        .await?;
        Ok(annotation)
    }

    async fn get_annotation(
        &self,
        annotation_id: &str,
    ) -> Result<Option<Annotation>, PipelineError> {
        self.load_annotation(annotation_id).await
    }

    async fn latest_annotation_for(
        &self,
        data_id: &str,
    ) -> Result<Option<Annotation>, PipelineError> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM qa_annotations WHERE task_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(data_id)
        .fetch_optional(&self.pool)
        .await?;
        body.map(|body| serde_json::from_str(&body).map_err(PipelineError::from))
            .transpose()
    }

    async fn update_annotation_review(
        &self,
        annotation_id: &str,
        review: ReviewUpdate,
    ) -> Result<Annotation, PipelineError> {
        let mut annotation = self
            .load_annotation(annotation_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("annotation {annotation_id}")))?;
        annotation.review_status = review.outcome;
        annotation.reviewer_id = Some(review.reviewer_id);
        annotation.review_comment = review.comment;
        annotation.reviewed_at = Some(review.reviewed_at);

        sqlx::query("UPDATE qa_annotations SET body = ? WHERE annotation_id = ?")
            .bind(serde_json::to_string(&annotation)?)
            .bind(annotation_id)
            .execute(&self.pool)
            .await?;
        Ok(annotation)
    }

    async fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<QAUnit>, PipelineError> {
        self.units_where(
            "SELECT body FROM qa_units \
             WHERE status = 'assigned' AND expire_at IS NOT NULL AND expire_at <= ?",
            &sortable(&now),
        )
        .await
    }

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, PipelineError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM qa_units GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status = TaskStatus::from_str(&row.get::<String, _>("status"))
                .map_err(PipelineError::validation)?;
            counts.insert(status, row.get::<i64, _>("count") as usize);
        }
        Ok(counts)
    }

    async fn batch_summaries(&self) -> Result<Vec<BatchSummary>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, COUNT(*) AS count, MAX(created_at) AS latest
            FROM qa_units
            WHERE batch_id IS NOT NULL
            GROUP BY batch_id
            ORDER BY latest DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<BatchSummary, PipelineError> {
                Ok(BatchSummary {
                    batch_id: row.get("batch_id"),
                    count: row.get::<i64, _>("count") as usize,
                    latest_created_at: parse_time(&row.get::<String, _>("latest"))?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
