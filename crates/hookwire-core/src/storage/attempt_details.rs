//! Repository for attempt detail records.
//!
//! Details are written in the same transaction as the attempt outcome and
//! overwritten if the same attempt is recorded again.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{error::Result, models::AttemptDetail};

/// Repository for attempt detail records.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a detail row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        detail: &AttemptDetail,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO attempt_details (
                id, workspace_id, request_headers, request_body,
                response_headers, response_body, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                request_headers = EXCLUDED.request_headers,
                request_body = EXCLUDED.request_body,
                response_headers = EXCLUDED.response_headers,
                response_body = EXCLUDED.response_body
            ",
        )
        .bind(detail.id)
        .bind(detail.workspace_id)
        .bind(sqlx::types::Json(&detail.request_headers))
        .bind(&detail.request_body)
        .bind(detail.response_headers.as_ref().map(sqlx::types::Json))
        .bind(&detail.response_body)
        .bind(detail.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
