use chrono::{NaiveDate, NaiveDateTime};
use diesel::define_sql_function;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable};
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;

use crate::error::StoreError;
use crate::models::{
    BlockRow, ContractRow, Erc20TokenRow, IngestCursorRow, NewIngestRun, TransactionRow,
    ValidatorRow, ValidatorSnapshotRow,
};
use crate::schema::{
    blocks, contracts, erc20_tokens, ingest_cursors, ingest_runs, transactions,
    validator_set_daily_snapshots, validators,
};
use crate::types::RunStatus;
use crate::DatabaseConnections;

define_sql_function! {
    #[sql_name = "greatest"]
    fn greatest_bigint(a: BigInt, b: BigInt) -> BigInt;
}

define_sql_function! {
    #[sql_name = "coalesce"]
    fn coalesce_bigint(a: Nullable<BigInt>, b: BigInt) -> BigInt;
}

/// Everything derived for a single height. Committed atomically: either the
/// whole bundle lands together with the cursor advance, or none of it does.
#[derive(Clone, Debug)]
pub struct HeightBundle {
    pub block: BlockRow,
    pub transactions: Vec<TransactionRow>,
    pub contracts: Vec<ContractRow>,
    pub tokens: Vec<Erc20TokenRow>,
    pub proposer: Option<String>,
    pub seen_validators: Vec<String>,
    /// Set when the stored hash at this height differs from the fetched one.
    /// The stale block is deleted first and the cascade evicts its
    /// transactions, contracts, and tokens before the fresh rows go in.
    pub replace_existing: bool,
}

#[derive(Clone)]
pub struct AnalyzerStore {
    pub dbc: DatabaseConnections,
}

impl AnalyzerStore {
    pub async fn new() -> Result<Self, StoreError> {
        Ok(AnalyzerStore {
            dbc: DatabaseConnections::init().await?,
        })
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.dbc
            .postgres
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    pub async fn get_cursor(&self, module: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn().await?;
        let cursor = ingest_cursors::table
            .find(module)
            .select(IngestCursorRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(cursor.map(|row| row.last_processed_height))
    }

    /// Moves a module cursor forward outside a height transaction. Used when
    /// a height is skipped because the stored hash already matches.
    pub async fn advance_cursor(&self, module: &str, height: i64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        advance_cursor_inner(&mut conn, module, height).await?;
        Ok(())
    }

    pub async fn block_hash_at(&self, height: i64) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let hash = blocks::table
            .find(height)
            .select(blocks::el_hash)
            .first::<String>(&mut conn)
            .await
            .optional()?;
        Ok(hash)
    }

    pub async fn get_contract(&self, address: &str) -> Result<Option<ContractRow>, StoreError> {
        let mut conn = self.conn().await?;
        let contract = contracts::table
            .find(address)
            .select(ContractRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(contract)
    }

    pub async fn block_timestamp(&self, height: i64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn().await?;
        let timestamp = blocks::table
            .find(height)
            .select(blocks::timestamp)
            .first::<i64>(&mut conn)
            .await
            .optional()?;
        Ok(timestamp)
    }

    /// Lowest stored height whose timestamp is at or past `timestamp`, i.e.
    /// the boundary block anchoring a daily snapshot.
    pub async fn first_block_at_or_after(
        &self,
        timestamp: i64,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let mut conn = self.conn().await?;
        let row = blocks::table
            .filter(blocks::timestamp.ge(timestamp))
            .order(blocks::height.asc())
            .select((blocks::height, blocks::timestamp))
            .first::<(i64, i64)>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    /// Writes one height atomically and advances the module cursor in the
    /// same transaction, making the cursor a strict high-water mark.
    pub async fn commit_height(
        &self,
        module: &str,
        bundle: &HeightBundle,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                if bundle.replace_existing {
                    diesel::delete(blocks::table.filter(blocks::height.eq(bundle.block.height)))
                        .execute(conn)
                        .await?;
                }

                diesel::insert_into(blocks::table)
                    .values(&bundle.block)
                    .on_conflict(blocks::height)
                    .do_update()
                    .set(&bundle.block)
                    .execute(conn)
                    .await?;

                for tx in &bundle.transactions {
                    diesel::insert_into(transactions::table)
                        .values(tx)
                        .on_conflict(transactions::hash)
                        .do_update()
                        .set(tx)
                        .execute(conn)
                        .await?;
                }

                upsert_classification_inner(conn, &bundle.contracts, &bundle.tokens).await?;

                register_validators(
                    conn,
                    bundle.block.height,
                    bundle.proposer.as_deref(),
                    &bundle.seen_validators,
                )
                .await?;

                advance_cursor_inner(conn, module, bundle.block.height).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Rebuilds one day's validator-set snapshot. Delete-then-insert scoped
    /// by day, so re-running for the same day converges.
    pub async fn replace_daily_snapshot(
        &self,
        module: &str,
        day: NaiveDate,
        boundary_height: i64,
        rows: &[ValidatorSnapshotRow],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                diesel::delete(
                    validator_set_daily_snapshots::table
                        .filter(validator_set_daily_snapshots::day.eq(day)),
                )
                .execute(conn)
                .await?;

                if !rows.is_empty() {
                    diesel::insert_into(validator_set_daily_snapshots::table)
                        .values(rows)
                        .execute(conn)
                        .await?;
                }

                let addresses: Vec<String> =
                    rows.iter().map(|row| row.validator_address.clone()).collect();
                register_validators(conn, boundary_height, None, &addresses).await?;

                advance_cursor_inner(conn, module, boundary_height).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Explicit re-scan path for contracts whose proxy target or token
    /// metadata resolved after creation. Not part of the steady-state loop.
    pub async fn upsert_classification(
        &self,
        contract_rows: &[ContractRow],
        tokens: &[Erc20TokenRow],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move { upsert_classification_inner(conn, contract_rows, tokens).await }
                .scope_boxed()
        })
        .await
    }

    /// Appends a row to the run log. Rows are never mutated afterwards; they
    /// exist for diagnosis, not resumption.
    pub async fn record_run(
        &self,
        module: &str,
        start_height: i64,
        end_height: i64,
        status: RunStatus,
        error: Option<String>,
        started_at: NaiveDateTime,
        finished_at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let run = NewIngestRun {
            module: module.to_string(),
            start_height,
            end_height,
            status: status.to_string(),
            error,
            started_at,
            finished_at,
        };
        let mut conn = self.conn().await?;
        diesel::insert_into(ingest_runs::table)
            .values(&run)
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

async fn upsert_classification_inner(
    conn: &mut AsyncPgConnection,
    contract_rows: &[ContractRow],
    tokens: &[Erc20TokenRow],
) -> Result<(), StoreError> {
    for contract in contract_rows {
        diesel::insert_into(contracts::table)
            .values(contract)
            .on_conflict(contracts::address)
            .do_update()
            .set(contract)
            .execute(conn)
            .await?;
    }
    for token in tokens {
        diesel::insert_into(erc20_tokens::table)
            .values(token)
            .on_conflict(erc20_tokens::address)
            .do_update()
            .set(token)
            .execute(conn)
            .await?;
    }
    Ok(())
}

/// Registry upserts. `first_seen_block` is insert-only (`DO NOTHING` on
/// conflict keeps the earliest sighting); the proposer's
/// `last_proposed_block` only ever moves forward.
async fn register_validators(
    conn: &mut AsyncPgConnection,
    height: i64,
    proposer: Option<&str>,
    seen: &[String],
) -> Result<(), StoreError> {
    if !seen.is_empty() {
        let rows: Vec<ValidatorRow> = seen
            .iter()
            .map(|address| ValidatorRow {
                address: address.clone(),
                first_seen_block: height,
                last_proposed_block: None,
            })
            .collect();
        diesel::insert_into(validators::table)
            .values(&rows)
            .on_conflict(validators::address)
            .do_nothing()
            .execute(conn)
            .await?;
    }

    if let Some(address) = proposer {
        diesel::insert_into(validators::table)
            .values(&ValidatorRow {
                address: address.to_string(),
                first_seen_block: height,
                last_proposed_block: None,
            })
            .on_conflict(validators::address)
            .do_nothing()
            .execute(conn)
            .await?;

        diesel::update(validators::table.filter(validators::address.eq(address)))
            .set(validators::last_proposed_block.eq(greatest_bigint(
                coalesce_bigint(validators::last_proposed_block, 0i64),
                height,
            )
            .nullable()))
            .execute(conn)
            .await?;
    }

    Ok(())
}

async fn advance_cursor_inner(
    conn: &mut AsyncPgConnection,
    module: &str,
    height: i64,
) -> Result<(), StoreError> {
    diesel::insert_into(ingest_cursors::table)
        .values(&IngestCursorRow {
            module: module.to_string(),
            last_processed_height: height,
        })
        .on_conflict(ingest_cursors::module)
        .do_update()
        .set(
            ingest_cursors::last_processed_height
                .eq(greatest_bigint(ingest_cursors::last_processed_height, height)),
        )
        .execute(conn)
        .await?;
    Ok(())
}
