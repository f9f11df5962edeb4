//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and the Postgres schema.
//! Every database operation goes through them; each one that needs to take
//! part in a larger unit of work has an `*_in_tx` variant.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod attempt_details;
pub mod attempts;
pub mod endpoints;
pub mod events;
pub mod workspaces;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for events.
    pub events: Arc<events::Repository>,

    /// Repository for attempts.
    pub attempts: Arc<attempts::Repository>,

    /// Repository for attempt details.
    pub attempt_details: Arc<attempt_details::Repository>,

    /// Repository for endpoint configuration.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for workspaces.
    pub workspaces: Arc<workspaces::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool.clone())),
            attempt_details: Arc::new(attempt_details::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            workspaces: Arc::new(workspaces::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Starts a transaction on the shared pool.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
