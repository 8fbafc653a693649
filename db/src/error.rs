use thiserror::Error;

/// Failures raised by the store. Constraint violations surface through
/// `Query` and are treated by callers as logic bugs, not data to swallow.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database configuration error: {0}")]
    Config(String),

    #[error("failed to connect to database: {0}")]
    Connection(String),

    #[error("migration failure: {0}")]
    Migration(String),

    #[error("connection pool failure: {0}")]
    Pool(String),

    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),
}
