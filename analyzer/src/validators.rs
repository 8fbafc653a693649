use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use db::{
    AnalyzerStore, BlockRow, RunStatus, ValidatorSnapshotRow, VALIDATOR_SNAPSHOTS_MODULE,
};

use crate::chain::{ChainClient, ConsensusData, ValidatorSetEntry};
use crate::error::AnalyzerError;

const SNAPSHOT_SLEEP_MS: u64 = 60_000;

/// Merges the consensus view of a height into its block row. The
/// percentage is computed from the consensus response itself, never
/// re-derived from the snapshot table.
pub fn merge_consensus(block: &mut BlockRow, consensus: &ConsensusData) {
    block.proposer_address = Some(consensus.proposer_address.clone());
    block.missing_count = Some(consensus.absent_validators.len() as i32);
    block.missing_voting_power = Some(consensus.missing_voting_power);
    block.total_voting_power = Some(consensus.total_voting_power);
    block.missing_percentage = Some(missing_percentage(
        consensus.missing_voting_power,
        consensus.total_voting_power,
    ));
    block.last_commit_round = Some(consensus.last_commit_round);
    block.absent_validators = Some(consensus.absent_validators.clone());
}

pub(crate) fn missing_percentage(missing: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        missing as f64 / total as f64 * 100.0
    }
}

pub(crate) fn day_of_timestamp(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}

pub(crate) fn day_start_timestamp(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

pub(crate) fn snapshot_rows(
    day: NaiveDate,
    boundary_height: i64,
    set: &[ValidatorSetEntry],
) -> Vec<ValidatorSnapshotRow> {
    set.iter()
        .enumerate()
        .map(|(index, validator)| ValidatorSnapshotRow {
            day,
            validator_index: index as i32,
            validator_address: validator.address.clone(),
            voting_power: validator.voting_power,
            proposer_priority: validator.proposer_priority,
            boundary_height,
        })
        .collect()
}

/// Daily snapshot module. Independent of the per-block loop: it owns its own
/// cursor (the last boundary height built) and run log, and only reads the
/// block stream through the store.
pub async fn run_snapshot_ingest(
    store: Arc<AnalyzerStore>,
    client: Arc<ChainClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            info!("validator snapshot module stopping");
            return;
        }

        let built = match snapshot_tick(&store, &client).await {
            Ok(built) => built,
            Err(e) => {
                error!("validator snapshot tick failed: {}", e);
                false
            }
        };

        if !built {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(SNAPSHOT_SLEEP_MS)) => {}
            }
        }
    }
}

async fn snapshot_tick(
    store: &AnalyzerStore,
    client: &ChainClient,
) -> Result<bool, AnalyzerError> {
    let Some((day, boundary_height)) = next_snapshot_target(store).await? else {
        return Ok(false);
    };

    let started_at = Utc::now().naive_utc();
    match build_snapshot(store, client, day, boundary_height).await {
        Ok(validator_count) => {
            store
                .record_run(
                    VALIDATOR_SNAPSHOTS_MODULE,
                    boundary_height,
                    boundary_height,
                    RunStatus::Ok,
                    None,
                    started_at,
                    Utc::now().naive_utc(),
                )
                .await?;
            info!(
                "built validator snapshot for {} at height {} ({} validators)",
                day, boundary_height, validator_count
            );
            Ok(true)
        }
        Err(e) => {
            store
                .record_run(
                    VALIDATOR_SNAPSHOTS_MODULE,
                    boundary_height,
                    boundary_height,
                    RunStatus::Error,
                    Some(e.to_string()),
                    started_at,
                    Utc::now().naive_utc(),
                )
                .await?;
            Err(e)
        }
    }
}

/// Next day needing a snapshot, with its boundary block: the first stored
/// block at or past that day's UTC midnight. Returns None while the block
/// stream has not reached the day yet.
async fn next_snapshot_target(
    store: &AnalyzerStore,
) -> Result<Option<(NaiveDate, i64)>, AnalyzerError> {
    let cursor = store.get_cursor(VALIDATOR_SNAPSHOTS_MODULE).await?;
    let next_day = match cursor {
        Some(height) => match store.block_timestamp(height).await? {
            Some(timestamp) => day_of_timestamp(timestamp).and_then(|day| day.succ_opt()),
            None => {
                warn!("snapshot cursor points at missing block {}", height);
                None
            }
        },
        None => match store.first_block_at_or_after(0).await? {
            Some((_, timestamp)) => day_of_timestamp(timestamp),
            None => None,
        },
    };
    let Some(day) = next_day else {
        return Ok(None);
    };

    match store.first_block_at_or_after(day_start_timestamp(day)).await? {
        Some((height, _)) => Ok(Some((day, height))),
        None => Ok(None),
    }
}

async fn build_snapshot(
    store: &AnalyzerStore,
    client: &ChainClient,
    day: NaiveDate,
    boundary_height: i64,
) -> Result<usize, AnalyzerError> {
    let set = client.fetch_validator_set(boundary_height as u64).await?;
    let rows = snapshot_rows(day, boundary_height, &set);
    store
        .replace_daily_snapshot(VALIDATOR_SNAPSHOTS_MODULE, day, boundary_height, &rows)
        .await?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::ChainClientType;
    use pretty_assertions::assert_eq;

    fn empty_block_row() -> BlockRow {
        BlockRow {
            height: 42,
            el_hash: "0xabc".to_string(),
            parent_hash: "0xdef".to_string(),
            timestamp: 1_700_000_000,
            proposer_address: None,
            tx_count: 0,
            gas_used: 0,
            gas_limit: 0,
            base_fee_per_gas_wei: None,
            total_fees_wei: 0.into(),
            effective_gas_price_avg_wei: None,
            priority_fee_avg_wei: None,
            erc20_transfer_count: 0,
            erc20_unique_token_count: 0,
            chain_client_type: ChainClientType::Unknown.to_string(),
            missing_count: None,
            missing_voting_power: None,
            total_voting_power: None,
            missing_percentage: None,
            last_commit_round: None,
            absent_validators: None,
        }
    }

    #[test]
    fn merge_fills_all_consensus_columns() {
        let mut block = empty_block_row();
        let consensus = ConsensusData {
            proposer_address: "AA".to_string(),
            last_commit_round: 2,
            total_voting_power: 400,
            missing_voting_power: 100,
            absent_validators: vec!["BB".to_string(), "CC".to_string()],
            validator_addresses: vec!["AA".into(), "BB".into(), "CC".into(), "DD".into()],
        };

        merge_consensus(&mut block, &consensus);

        assert_eq!(block.proposer_address, Some("AA".to_string()));
        assert_eq!(block.missing_count, Some(2));
        assert_eq!(block.missing_voting_power, Some(100));
        assert_eq!(block.total_voting_power, Some(400));
        assert_eq!(block.missing_percentage, Some(25.0));
        assert_eq!(block.last_commit_round, Some(2));
        assert_eq!(
            block.absent_validators,
            Some(vec!["BB".to_string(), "CC".to_string()])
        );
    }

    #[test]
    fn zero_total_power_yields_zero_percentage() {
        assert_eq!(missing_percentage(0, 0), 0.0);
        assert_eq!(missing_percentage(10, 0), 0.0);
        assert_eq!(missing_percentage(1, 3), 100.0 / 3.0);
    }

    #[test]
    fn day_boundary_round_trip() {
        let day = NaiveDate::from_ymd_opt(2024, 11, 5).expect("valid date");
        let start = day_start_timestamp(day);
        assert_eq!(day_of_timestamp(start), Some(day));
        assert_eq!(day_of_timestamp(start - 1), day.pred_opt());
        assert_eq!(day_of_timestamp(start + 86_399), Some(day));
        assert_eq!(day_of_timestamp(start + 86_400), day.succ_opt());
    }

    #[test]
    fn snapshot_rows_are_indexed_in_set_order() {
        let day = NaiveDate::from_ymd_opt(2024, 11, 5).expect("valid date");
        let set = vec![
            ValidatorSetEntry {
                address: "AA".to_string(),
                voting_power: 70,
                proposer_priority: -3,
            },
            ValidatorSetEntry {
                address: "BB".to_string(),
                voting_power: 30,
                proposer_priority: 12,
            },
        ];

        let rows = snapshot_rows(day, 9000, &set);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].validator_index, 0);
        assert_eq!(rows[0].validator_address, "AA");
        assert_eq!(rows[0].voting_power, 70);
        assert_eq!(rows[1].validator_index, 1);
        assert_eq!(rows[1].proposer_priority, 12);
        assert!(rows.iter().all(|row| row.boundary_height == 9000));
        assert!(rows.iter().all(|row| row.day == day));
    }
}
