use db::StoreError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::chain::ChainClientError;

/// Top-level failure taxonomy. The orchestrator is the only component that
/// decides whether a failure stops the batch or lets it continue.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("chain client error: {0}")]
    Chain(#[from] ChainClientError),

    /// Non-retryable problem with the data for one height, e.g. a
    /// transaction without a receipt. The height is not committed.
    #[error("data error at height {height}: {reason}")]
    Data { height: u64, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task join error: {0}")]
    Join(#[from] JoinError),
}
