use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per ingested height. `el_hash` is unique across the table; a
/// different hash observed for an already stored height is the reorg signal.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    AsChangeset,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(height))]
#[diesel(table_name = crate::schema::blocks)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BlockRow {
    pub height: i64,
    pub el_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub proposer_address: Option<String>,
    pub tx_count: i32,
    pub gas_used: i64,
    pub gas_limit: i64,
    pub base_fee_per_gas_wei: Option<BigDecimal>,
    pub total_fees_wei: BigDecimal,
    pub effective_gas_price_avg_wei: Option<BigDecimal>,
    pub priority_fee_avg_wei: Option<BigDecimal>,
    pub erc20_transfer_count: i32,
    pub erc20_unique_token_count: i32,
    pub chain_client_type: String,
    pub missing_count: Option<i32>,
    pub missing_voting_power: Option<i64>,
    pub total_voting_power: Option<i64>,
    pub missing_percentage: Option<f64>,
    pub last_commit_round: Option<i32>,
    pub absent_validators: Option<Vec<String>>,
}

/// A transaction is only persisted once its receipt is known, so the realized
/// fields (`status`, `gas_used`, `effective_gas_price_wei`) are never null.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Associations,
    AsChangeset,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(hash))]
#[diesel(belongs_to(BlockRow, foreign_key = block_height))]
#[diesel(table_name = crate::schema::transactions)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TransactionRow {
    pub hash: String,
    pub block_height: i64,
    pub block_el_hash: String,
    pub tx_index: i32,
    pub from_address: String,
    pub to_address: Option<String>,
    pub nonce: i64,
    pub value_wei: BigDecimal,
    pub gas_limit: i64,
    pub max_fee_per_gas_wei: Option<BigDecimal>,
    pub max_priority_fee_per_gas_wei: Option<BigDecimal>,
    pub tx_type: i16,
    pub selector: Option<String>,
    pub status: i16,
    pub gas_used: i64,
    pub effective_gas_price_wei: BigDecimal,
    pub creates_contract: bool,
    pub created_contract_address: Option<String>,
}

#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Associations,
    AsChangeset,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(address))]
#[diesel(belongs_to(TransactionRow, foreign_key = creation_tx_hash))]
#[diesel(table_name = crate::schema::contracts)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ContractRow {
    pub address: String,
    pub creation_tx_hash: String,
    pub creator_address: String,
    pub creation_height: i64,
    pub is_proxy: bool,
    pub implementation_address: Option<String>,
}

/// Specialization of a contract that passed the ERC20 probe. Metadata is as
/// queried at detection time, not refreshed by the steady-state loop.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Associations,
    AsChangeset,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(address))]
#[diesel(belongs_to(ContractRow, foreign_key = address))]
#[diesel(table_name = crate::schema::erc20_tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Erc20TokenRow {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: i16,
    pub detected_at_height: i64,
}

/// Long-lived validator registry entry. `first_seen_block` is set once on the
/// first reference and never overwritten; `last_proposed_block` only grows.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(address))]
#[diesel(table_name = crate::schema::validators)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ValidatorRow {
    pub address: String,
    pub first_seen_block: i64,
    pub last_proposed_block: Option<i64>,
}

#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(day, validator_index))]
#[diesel(table_name = crate::schema::validator_set_daily_snapshots)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ValidatorSnapshotRow {
    pub day: NaiveDate,
    pub validator_index: i32,
    pub validator_address: String,
    pub voting_power: i64,
    pub proposer_priority: i64,
    pub boundary_height: i64,
}

/// One row per ingestion module; the sole source of truth for resumption.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(module))]
#[diesel(table_name = crate::schema::ingest_cursors)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct IngestCursorRow {
    pub module: String,
    pub last_processed_height: i64,
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable, Serialize, Deserialize, PartialEq)]
#[diesel(primary_key(id))]
#[diesel(table_name = crate::schema::ingest_runs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct IngestRunRow {
    pub id: i32,
    pub module: String,
    pub start_height: i64,
    pub end_height: i64,
    pub status: String,
    pub error: Option<String>,
    pub started_at: chrono::NaiveDateTime,
    pub finished_at: chrono::NaiveDateTime,
}

/// Insert shape for the append-only run log; `id` comes from the sequence.
#[derive(Clone, Debug, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::ingest_runs)]
pub struct NewIngestRun {
    pub module: String,
    pub start_height: i64,
    pub end_height: i64,
    pub status: String,
    pub error: Option<String>,
    pub started_at: chrono::NaiveDateTime,
    pub finished_at: chrono::NaiveDateTime,
}
