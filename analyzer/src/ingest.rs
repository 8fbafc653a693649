use async_std::task::sleep;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use db::{
    AnalyzerStore, ChainClientType, HeightBundle, RunStatus, ToHexString, BLOCKS_MODULE,
};

use crate::chain::{ChainClient, RawHeight};
use crate::classify::classify_creations;
use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::normalize::normalize_height;
use crate::validators::merge_consensus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeightAction {
    /// Stored hash matches the chain; advance the cursor without rewriting.
    Skip,
    /// Nothing stored at this height yet.
    Insert,
    /// Stored hash differs (reorg) or a refresh was forced: cascade-delete
    /// the stale block and reprocess as new.
    Replace,
}

pub(crate) fn decide_height_action(
    existing: Option<&str>,
    fetched: &str,
    force_refresh: bool,
) -> HeightAction {
    match existing {
        None => HeightAction::Insert,
        Some(stored) if stored == fetched && !force_refresh => HeightAction::Skip,
        Some(_) => HeightAction::Replace,
    }
}

/// Target range for the next batch: `[cursor+1, min(cursor+batch, head)]`,
/// or None when the module is caught up to the confirmed head.
pub(crate) fn batch_range(
    cursor: Option<i64>,
    start_height: u64,
    batch_size: u64,
    head: u64,
) -> Option<(u64, u64)> {
    let next = match cursor {
        Some(cursor) => (cursor.max(0) as u64).saturating_add(1),
        None => start_height,
    };
    if next > head {
        return None;
    }
    let end = next.saturating_add(batch_size.saturating_sub(1)).min(head);
    Some((next, end))
}

struct BatchOutcome {
    last_committed: Option<u64>,
    error: Option<AnalyzerError>,
}

/// Per-block ingestion module: fetch with bounded fan-out, commit strictly
/// in increasing height order, one database transaction per height, cursor
/// advanced only on commit. Loops until shutdown.
pub async fn run_block_ingest(
    store: Arc<AnalyzerStore>,
    client: Arc<ChainClient>,
    client_type: ChainClientType,
    config: AnalyzerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let poll = time::Duration::from_millis(config.poll_interval_ms);
    loop {
        if *shutdown.borrow() {
            info!("block ingest module stopping");
            return;
        }

        let head = match client.head_height().await {
            Ok(head) => head,
            Err(e) => {
                warn!("confirmed head unavailable: {}", e);
                sleep(poll).await;
                continue;
            }
        };
        let cursor = match store.get_cursor(BLOCKS_MODULE).await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("cursor read failed: {}", e);
                sleep(poll).await;
                continue;
            }
        };
        let Some((start, end)) = batch_range(cursor, config.start_height, config.batch_size, head)
        else {
            sleep(poll).await;
            continue;
        };

        let started_at = Utc::now().naive_utc();
        let outcome = ingest_batch(&store, &client, client_type, &config, start, end, &shutdown)
            .await;
        let finished_at = Utc::now().naive_utc();

        let end_height = outcome
            .last_committed
            .map(|height| height as i64)
            .unwrap_or(start as i64 - 1);
        match outcome.error {
            None => {
                if let Some(last) = outcome.last_committed {
                    info!("batch [{}, {}] committed through {}", start, end, last);
                    if let Err(e) = store
                        .record_run(
                            BLOCKS_MODULE,
                            start as i64,
                            end_height,
                            RunStatus::Ok,
                            None,
                            started_at,
                            finished_at,
                        )
                        .await
                    {
                        error!("failed to record run: {}", e);
                    }
                }
            }
            Some(batch_error) => {
                error!(
                    "batch [{}, {}] failed after {:?}: {}",
                    start, end, outcome.last_committed, batch_error
                );
                if let Err(e) = store
                    .record_run(
                        BLOCKS_MODULE,
                        start as i64,
                        end_height,
                        RunStatus::Error,
                        Some(batch_error.to_string()),
                        started_at,
                        finished_at,
                    )
                    .await
                {
                    error!("failed to record run: {}", e);
                }
                sleep(poll).await;
            }
        }
    }
}

/// Fetches may complete out of order under the fan-out, but `buffered`
/// yields them back in height order, so the commit stage stays sequential.
async fn ingest_batch(
    store: &AnalyzerStore,
    client: &Arc<ChainClient>,
    client_type: ChainClientType,
    config: &AnalyzerConfig,
    start: u64,
    end: u64,
    shutdown: &watch::Receiver<bool>,
) -> BatchOutcome {
    let mut last_committed = None;
    let mut fetches = stream::iter(start..=end)
        .map(|height| {
            let client = Arc::clone(client);
            async move { (height, client.fetch_height(height).await) }
        })
        .buffered(config.fetch_concurrency.max(1));

    while let Some((height, fetched)) = fetches.next().await {
        if *shutdown.borrow() {
            break;
        }
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                return BatchOutcome {
                    last_committed,
                    error: Some(e.into()),
                }
            }
        };
        match process_height(store, client, client_type, config, height, raw).await {
            Ok(()) => last_committed = Some(height),
            Err(e) => {
                return BatchOutcome {
                    last_committed,
                    error: Some(e),
                }
            }
        }
    }

    BatchOutcome {
        last_committed,
        error: None,
    }
}

async fn process_height(
    store: &AnalyzerStore,
    client: &ChainClient,
    client_type: ChainClientType,
    config: &AnalyzerConfig,
    height: u64,
    raw: RawHeight,
) -> Result<(), AnalyzerError> {
    let fetched_hash = raw.block.header.hash.to_hex_string();
    let existing = store.block_hash_at(height as i64).await?;
    let action = decide_height_action(existing.as_deref(), &fetched_hash, config.force_refresh);

    if action == HeightAction::Skip {
        debug!("height {} already stored with matching hash", height);
        store.advance_cursor(BLOCKS_MODULE, height as i64).await?;
        return Ok(());
    }
    if let Some(stored) = &existing {
        if stored != &fetched_hash {
            warn!(
                "reorg at height {}: stored {} replaced by {}",
                height, stored, fetched_hash
            );
        }
    }

    let mut normalized = normalize_height(client_type, &raw)?;
    merge_consensus(&mut normalized.block, &raw.consensus);
    let classification = classify_creations(client, &normalized.transactions).await;

    let bundle = HeightBundle {
        block: normalized.block,
        transactions: normalized.transactions,
        contracts: classification.contracts,
        tokens: classification.tokens,
        proposer: Some(raw.consensus.proposer_address.clone()),
        seen_validators: raw.consensus.validator_addresses.clone(),
        replace_existing: action == HeightAction::Replace,
    };
    store.commit_height(BLOCKS_MODULE, &bundle).await?;
    debug!(
        "committed height {} ({} txs, {} new contracts)",
        height,
        bundle.transactions.len(),
        bundle.contracts.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn range_starts_at_configured_height_without_cursor() {
        assert_eq!(batch_range(None, 100, 10, 1000), Some((100, 109)));
    }

    #[test]
    fn range_resumes_after_cursor() {
        assert_eq!(batch_range(Some(150), 100, 10, 1000), Some((151, 160)));
    }

    #[test]
    fn range_clamps_to_head() {
        assert_eq!(batch_range(Some(995), 100, 10, 1000), Some((996, 1000)));
        assert_eq!(batch_range(Some(999), 100, 10, 1000), Some((1000, 1000)));
    }

    #[test]
    fn caught_up_module_has_no_range() {
        assert_eq!(batch_range(Some(1000), 100, 10, 1000), None);
        assert_eq!(batch_range(None, 2000, 10, 1000), None);
    }

    #[test]
    fn fresh_height_is_inserted() {
        assert_eq!(
            decide_height_action(None, "0xaaa", false),
            HeightAction::Insert
        );
    }

    #[test]
    fn matching_hash_is_skipped_unless_forced() {
        assert_eq!(
            decide_height_action(Some("0xaaa"), "0xaaa", false),
            HeightAction::Skip
        );
        assert_eq!(
            decide_height_action(Some("0xaaa"), "0xaaa", true),
            HeightAction::Replace
        );
    }

    #[test]
    fn hash_mismatch_triggers_replacement() {
        assert_eq!(
            decide_height_action(Some("0xaaa"), "0xbbb", false),
            HeightAction::Replace
        );
    }
}
