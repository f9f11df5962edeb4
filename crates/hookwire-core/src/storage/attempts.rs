//! Repository for attempt database operations.
//!
//! Attempts move through `INIT -> QUEUED -> terminal`. Every status write is
//! conditional on the row not being terminal yet, so a task that is
//! delivered twice (reclaimed after its visibility timeout) is recorded at
//! most once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Attempt, AttemptId, AttemptResult, ErrorCode, EventId},
};

const SELECT_COLUMNS: &str = "SELECT id, event_id, endpoint_id, workspace_id, attempt_number, \
     status, scheduled_at, attempted_at, trigger_mode, exhausted, error_code, request, response, \
     created_at FROM attempts";

/// Repository for attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a batch of attempts.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_batch(&self, attempts: &[Attempt]) -> Result<()> {
        self.insert_batch_impl(&*self.pool, attempts).await
    }

    /// Inserts a batch of attempts within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_batch_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempts: &[Attempt],
    ) -> Result<()> {
        self.insert_batch_impl(&mut **tx, attempts).await
    }

    async fn insert_batch_impl<'e, E>(&self, executor: E, attempts: &[Attempt]) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if attempts.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO attempts (id, event_id, endpoint_id, workspace_id, attempt_number, \
             status, scheduled_at, attempted_at, trigger_mode, exhausted, error_code, request, \
             response, created_at) ",
        );
        builder.push_values(attempts, |mut row, attempt| {
            row.push_bind(attempt.id)
                .push_bind(attempt.event_id)
                .push_bind(attempt.endpoint_id)
                .push_bind(attempt.workspace_id)
                .push_bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
                .push_bind(attempt.status)
                .push_bind(attempt.scheduled_at)
                .push_bind(attempt.attempted_at)
                .push_bind(attempt.trigger_mode)
                .push_bind(attempt.exhausted)
                .push_bind(attempt.error_code)
                .push_bind(attempt.request.clone().map(sqlx::types::Json))
                .push_bind(attempt.response.map(sqlx::types::Json))
                .push_bind(attempt.created_at);
        });

        builder.build().execute(executor).await?;
        Ok(())
    }

    /// Writes the terminal outcome of an attempt within a transaction.
    ///
    /// Returns false when the row is already terminal (or missing) and
    /// nothing was written.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn complete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt_id: AttemptId,
        result: &AttemptResult,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r"
            UPDATE attempts
            SET status = $2, attempted_at = $3, exhausted = $4, error_code = $5,
                request = $6, response = $7
            WHERE id = $1 AND status IN ('INIT', 'QUEUED')
            ",
        )
        .bind(attempt_id)
        .bind(result.status)
        .bind(result.attempted_at)
        .bind(result.exhausted)
        .bind(result.error_code)
        .bind(sqlx::types::Json(&result.request))
        .bind(result.response.map(sqlx::types::Json))
        .execute(&mut **tx)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    /// Cancels a non-terminal attempt. Returns false if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn cancel(&self, attempt_id: AttemptId, error_code: ErrorCode) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE attempts
            SET status = 'CANCELED', error_code = $2
            WHERE id = $1 AND status IN ('INIT', 'QUEUED')
            ",
        )
        .bind(attempt_id)
        .bind(error_code)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves attempts still in `INIT` to `QUEUED`.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_queued(&self, attempt_ids: &[AttemptId]) -> Result<u64> {
        if attempt_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = attempt_ids.iter().map(|id| id.0).collect();

        let result = sqlx::query(
            "UPDATE attempts SET status = 'QUEUED' WHERE id = ANY($1) AND status = 'INIT'",
        )
        .bind(ids)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists `INIT` attempts created before `created_before` and due before
    /// `scheduled_before`, ordered by `(scheduled_at, id)`. When `after` is
    /// set, only rows strictly past that key are returned.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_unqueued(
        &self,
        created_before: DateTime<Utc>,
        scheduled_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, AttemptId)>,
        limit: usize,
    ) -> Result<Vec<Attempt>> {
        let attempts = sqlx::query_as::<Postgres, Attempt>(&format!(
            "{SELECT_COLUMNS} WHERE status = 'INIT' AND created_at <= $1 AND scheduled_at <= $2 \
             AND ($3::timestamptz IS NULL OR (scheduled_at, id) > ($3, $4)) \
             ORDER BY scheduled_at ASC, id ASC LIMIT $5"
        ))
        .bind(created_before)
        .bind(scheduled_before)
        .bind(after.map(|(scheduled_at, _)| scheduled_at))
        .bind(after.map(|(_, id)| id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Lists every attempt of an event ordered by endpoint and number.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<Attempt>> {
        let attempts = sqlx::query_as::<Postgres, Attempt>(&format!(
            "{SELECT_COLUMNS} WHERE event_id = $1 ORDER BY endpoint_id ASC, attempt_number ASC"
        ))
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
