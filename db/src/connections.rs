use diesel::{Connection, PgConnection};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::env;

use crate::error::StoreError;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[derive(Clone)]
pub struct DatabaseConnections {
    pub postgres: Pool<AsyncPgConnection>,
}

impl DatabaseConnections {
    /// Applies any pending migrations, each in its own transaction, tracked
    /// by filename. A failed migration rolls back unrecorded, so the next
    /// startup retries it; ingestion never starts on a partial schema.
    fn run_migrations(db_url: &str) -> Result<(), StoreError> {
        let mut conn =
            PgConnection::establish(db_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    pub fn postgres_pool(db_url: String) -> Result<Pool<AsyncPgConnection>, StoreError> {
        let config = AsyncDieselConnectionManager::new(db_url);
        let max_pool_size = env::var("MAX_POOL_SIZE")
            .ok()
            .and_then(|size| size.parse().ok())
            .unwrap_or(8);
        Pool::builder(config)
            .max_size(max_pool_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    pub async fn init() -> Result<Self, StoreError> {
        let db_url =
            env::var("DATABASE_URL").map_err(|_| StoreError::Config("DATABASE_URL must be set".into()))?;

        let db_url_pool = db_url.clone();
        tokio::task::spawn_blocking(move || Self::run_migrations(&db_url))
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))??;

        Ok(Self {
            postgres: Self::postgres_pool(db_url_pool)?,
        })
    }
}
