//! Repository for event database operations.
//!
//! Events are insert-only. Inserts skip rows that collide with an existing
//! id or `(workspace_id, unique_id)` pair and report which ids actually
//! landed, so callers can attach attempts only to persisted events.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Event, EventId, WorkspaceId},
};

/// Repository for event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts events, ignoring conflicts. Returns the ids that were written.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_ignoring_conflicts(&self, events: &[Event]) -> Result<Vec<EventId>> {
        self.insert_impl(&*self.pool, events).await
    }

    /// Inserts events within a transaction, ignoring conflicts.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_ignoring_conflicts_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[Event],
    ) -> Result<Vec<EventId>> {
        self.insert_impl(&mut **tx, events).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, events: &[Event]) -> Result<Vec<EventId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (id, workspace_id, event_type, data, unique_id, ingested_at) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(event.id)
                .push_bind(event.workspace_id)
                .push_bind(event.event_type.clone())
                .push_bind(sqlx::types::Json(event.data.clone()))
                .push_bind(event.unique_id.clone())
                .push_bind(event.ingested_at);
        });
        builder.push(" ON CONFLICT DO NOTHING RETURNING id");

        let ids = builder.build_query_scalar::<EventId>().fetch_all(executor).await?;
        Ok(ids)
    }

    /// Loads several events at once; missing ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_ids(&self, event_ids: &[EventId]) -> Result<Vec<Event>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.0).collect();

        let events = sqlx::query_as::<_, Event>(
            r"
            SELECT id, workspace_id, event_type, data, unique_id, ingested_at
            FROM events
            WHERE id = ANY($1)
            ",
        )
        .bind(ids)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Returns which of `unique_ids` already exist in the workspace.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_existing_unique_ids(
        &self,
        workspace_id: WorkspaceId,
        unique_ids: &[String],
    ) -> Result<Vec<String>> {
        if unique_ids.is_empty() {
            return Ok(Vec::new());
        }

        let existing = sqlx::query_scalar::<_, String>(
            r"
            SELECT unique_id FROM events
            WHERE workspace_id = $1 AND unique_id = ANY($2)
            ",
        )
        .bind(workspace_id)
        .bind(unique_ids)
        .fetch_all(&*self.pool)
        .await?;

        Ok(existing)
    }
}
