//! Repository for endpoint database operations.
//!
//! Endpoints are provisioned outside this service. The delivery pipeline
//! only reads them; `enabled` is re-checked by the worker before each send.

use std::sync::Arc;

use sqlx::{PgPool, Postgres};

use crate::{
    error::Result,
    models::{Endpoint, EndpointId, WorkspaceId},
};

const SELECT_COLUMNS: &str =
    "SELECT id, workspace_id, name, enabled, request, retry, events, created_at, updated_at \
     FROM endpoints";

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint =
            sqlx::query_as::<Postgres, Endpoint>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
                .bind(endpoint_id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(endpoint)
    }

    /// Lists enabled endpoints of a workspace in creation order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_enabled(&self, workspace_id: WorkspaceId) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<Postgres, Endpoint>(&format!(
            "{SELECT_COLUMNS} WHERE workspace_id = $1 AND enabled ORDER BY created_at ASC, id ASC"
        ))
        .bind(workspace_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }
}
