//! Repository for workspace database operations.
//!
//! Workspaces scope endpoints and events. The delivery pipeline only
//! enumerates them to warm the registry.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::WorkspaceId};

/// Repository for workspace database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists every workspace id, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_ids(&self) -> Result<Vec<WorkspaceId>> {
        let ids = sqlx::query_scalar::<_, WorkspaceId>(
            "SELECT id FROM workspaces ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }
}
