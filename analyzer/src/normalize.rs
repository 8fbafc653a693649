use alloy::primitives::{B256, U256};
use alloy::rpc::types::eth::{Transaction, TransactionReceipt};
use alloy::sol;
use alloy::sol_types::SolEvent;
use bigdecimal::BigDecimal;
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::HashMap;

use db::{u128_to_numeric, u256_to_numeric, BlockRow, ChainClientType, ToHexString, TransactionRow};

use crate::chain::RawHeight;
use crate::error::AnalyzerError;

sol! {
    /// Canonical ERC20 transfer event; only the topic signature is used.
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Canonical row shapes for one height, ready for an atomic commit.
#[derive(Clone, Debug)]
pub struct NormalizedHeight {
    pub block: BlockRow,
    pub transactions: Vec<TransactionRow>,
}

/// A transaction is Submitted until its receipt arrives. Only Finalized
/// transactions are ever persisted; the realized columns have no
/// "pending" encoding, so a leftover Submitted fails the whole height.
enum TxPhase<'a> {
    Submitted(&'a Transaction),
    Finalized(&'a Transaction, &'a TransactionReceipt),
}

pub fn normalize_height(
    client_type: ChainClientType,
    raw: &RawHeight,
) -> Result<NormalizedHeight, AnalyzerError> {
    let header = &raw.block.header;
    let height = header.number;
    let el_hash = header.hash.to_hex_string();
    let base_fee = header.base_fee_per_gas.unwrap_or(0);

    let receipts_by_hash: HashMap<B256, &TransactionReceipt> = raw
        .receipts
        .iter()
        .map(|receipt| (receipt.transaction_hash, receipt))
        .collect();

    let mut phases = Vec::new();
    for tx in raw.block.transactions.txns() {
        match receipts_by_hash.get(&tx.hash) {
            Some(receipt) => phases.push(TxPhase::Finalized(tx, receipt)),
            None => phases.push(TxPhase::Submitted(tx)),
        }
    }
    let pairs: Vec<(&Transaction, &TransactionReceipt)> = phases
        .iter()
        .map(|phase| match phase {
            TxPhase::Finalized(tx, receipt) => Ok((*tx, *receipt)),
            TxPhase::Submitted(tx) => Err(AnalyzerError::Data {
                height,
                reason: format!("transaction {} has no receipt", tx.hash.to_hex_string()),
            }),
        })
        .collect::<Result<_, _>>()?;

    let mut total_fees = U256::ZERO;
    let mut price_sum = U256::ZERO;
    let mut priority_sum = U256::ZERO;
    for (_, receipt) in &pairs {
        let gas_used = U256::from(receipt.gas_used);
        let price = U256::from(receipt.effective_gas_price);
        total_fees += gas_used * price;
        price_sum += price;
        priority_sum += U256::from(receipt.effective_gas_price.saturating_sub(base_fee));
    }
    let realized = pairs.len() as u64;
    let (price_avg, priority_avg) = if realized == 0 {
        (None, None)
    } else {
        let divisor = BigDecimal::from(realized);
        (
            Some(u256_to_numeric(price_sum) / divisor.clone()),
            Some(u256_to_numeric(priority_sum) / divisor),
        )
    };

    let (transfer_count, unique_token_count) = count_erc20_transfers(&raw.receipts);

    let transactions: Vec<TransactionRow> = pairs
        .par_iter()
        .enumerate()
        .map(|(index, pair)| to_transaction_row(height, &el_hash, index, pair.0, pair.1))
        .collect();

    let block = BlockRow {
        height: height as i64,
        el_hash,
        parent_hash: header.parent_hash.to_hex_string(),
        timestamp: header.timestamp as i64,
        proposer_address: None,
        tx_count: transactions.len() as i32,
        gas_used: header.gas_used as i64,
        gas_limit: header.gas_limit as i64,
        base_fee_per_gas_wei: header.base_fee_per_gas.map(u128_to_numeric),
        total_fees_wei: u256_to_numeric(total_fees),
        effective_gas_price_avg_wei: price_avg,
        priority_fee_avg_wei: priority_avg,
        erc20_transfer_count: transfer_count,
        erc20_unique_token_count: unique_token_count,
        chain_client_type: client_type.to_string(),
        missing_count: None,
        missing_voting_power: None,
        total_voting_power: None,
        missing_percentage: None,
        last_commit_round: None,
        absent_validators: None,
    };

    Ok(NormalizedHeight {
        block,
        transactions,
    })
}

fn to_transaction_row(
    height: u64,
    el_hash: &str,
    index: usize,
    tx: &Transaction,
    receipt: &TransactionReceipt,
) -> TransactionRow {
    let input = &tx.input;
    let selector = if input.len() >= 4 {
        Some((&input[0..4]).to_hex_string())
    } else {
        None
    };
    let creates_contract = tx.to.is_none();

    TransactionRow {
        hash: tx.hash.to_hex_string(),
        block_height: height as i64,
        block_el_hash: el_hash.to_string(),
        tx_index: tx.transaction_index.unwrap_or(index as u64) as i32,
        from_address: tx.from.to_hex_string(),
        to_address: tx.to.map(|to| to.to_hex_string()),
        nonce: tx.nonce as i64,
        value_wei: u256_to_numeric(tx.value),
        gas_limit: tx.gas as i64,
        max_fee_per_gas_wei: tx.max_fee_per_gas.map(u128_to_numeric),
        max_priority_fee_per_gas_wei: tx.max_priority_fee_per_gas.map(u128_to_numeric),
        tx_type: tx.transaction_type.unwrap_or(0) as i16,
        selector,
        status: i16::from(receipt.inner.status()),
        gas_used: receipt.gas_used as i64,
        effective_gas_price_wei: u128_to_numeric(receipt.effective_gas_price),
        creates_contract,
        created_contract_address: receipt
            .contract_address
            .map(|address| address.to_hex_string()),
    }
}

/// Counts logs matching the ERC20 Transfer topic with the full indexed
/// (from, to) layout, and the distinct token contracts emitting them.
fn count_erc20_transfers(receipts: &[TransactionReceipt]) -> (i32, i32) {
    let transfers: Vec<_> = receipts
        .iter()
        .flat_map(|receipt| receipt.inner.logs())
        .filter(|log| {
            log.topics().first() == Some(&Transfer::SIGNATURE_HASH) && log.topics().len() == 3
        })
        .collect();
    let unique = transfers
        .iter()
        .map(|log| log.address())
        .unique()
        .count();
    (transfers.len() as i32, unique as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ConsensusData;
    use alloy::primitives::{Address, Bloom, Bytes, Log as PrimitiveLog, LogData};
    use alloy::rpc::types::eth::{
        Block, BlockTransactions, Header, Log, Receipt, ReceiptEnvelope, ReceiptWithBloom,
    };
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    const GWEI: u128 = 1_000_000_000;

    fn consensus() -> ConsensusData {
        ConsensusData {
            proposer_address: "AA".to_string(),
            last_commit_round: 0,
            total_voting_power: 1,
            missing_voting_power: 0,
            absent_validators: vec![],
            validator_addresses: vec!["AA".to_string()],
        }
    }

    fn transaction(hash_byte: u8, to: Option<Address>, input: Vec<u8>) -> Transaction {
        Transaction {
            hash: B256::from([hash_byte; 32]),
            from: Address::from([1u8; 20]),
            to,
            value: U256::from(1_000_000_000_000_000_000u128),
            gas: 21_000,
            input: Bytes::from(input),
            nonce: 7,
            transaction_index: None,
            max_fee_per_gas: Some(120 * GWEI),
            max_priority_fee_per_gas: Some(2 * GWEI),
            transaction_type: Some(2),
            ..Default::default()
        }
    }

    fn log_with_topics(token: Address, topics: Vec<B256>) -> Log {
        Log {
            inner: PrimitiveLog {
                address: token,
                data: LogData::new_unchecked(topics, Bytes::new()),
            },
            block_hash: None,
            block_number: None,
            block_timestamp: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        }
    }

    fn transfer_log(token: Address) -> Log {
        log_with_topics(
            token,
            vec![
                Transfer::SIGNATURE_HASH,
                B256::from([2u8; 32]),
                B256::from([3u8; 32]),
            ],
        )
    }

    fn receipt(
        hash_byte: u8,
        gas_used: u128,
        effective_gas_price: u128,
        contract_address: Option<Address>,
        logs: Vec<Log>,
    ) -> TransactionReceipt {
        let inner = ReceiptWithBloom::new(
            Receipt {
                status: true.into(),
                cumulative_gas_used: gas_used,
                logs,
            },
            Bloom::default(),
        );
        TransactionReceipt {
            transaction_hash: B256::from([hash_byte; 32]),
            transaction_index: Some(hash_byte as u64),
            block_hash: Some(B256::from([9u8; 32])),
            block_number: Some(100),
            from: Address::from([1u8; 20]),
            to: None,
            gas_used,
            contract_address,
            effective_gas_price,
            blob_gas_used: None,
            blob_gas_price: None,
            state_root: None,
            authorization_list: None,
            inner: ReceiptEnvelope::Eip1559(inner),
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                number: 100,
                hash: B256::from([9u8; 32]),
                parent_hash: B256::from([8u8; 32]),
                timestamp: 1_700_000_000,
                gas_used: 63_000,
                gas_limit: 30_000_000,
                base_fee_per_gas: Some(100 * GWEI),
                miner: Address::from([4u8; 20]),
                ..Default::default()
            },
            transactions: BlockTransactions::Full(transactions),
            ..Default::default()
        }
    }

    #[test]
    fn derives_fee_aggregates_and_erc20_counts() {
        let token_a = Address::from([0xaa; 20]);
        let token_b = Address::from([0xbb; 20]);
        let created = Address::from([0xcc; 20]);

        let raw = RawHeight {
            block: block(vec![
                transaction(1, Some(Address::from([5u8; 20])), vec![]),
                transaction(2, None, vec![0xa9, 0x05, 0x9c, 0xbb, 0x00, 0x01]),
            ]),
            receipts: vec![
                receipt(1, 21_000, 110 * GWEI, None, vec![]),
                receipt(
                    2,
                    42_000,
                    130 * GWEI,
                    Some(created),
                    vec![
                        transfer_log(token_a),
                        transfer_log(token_b),
                        transfer_log(token_a),
                    ],
                ),
            ],
            consensus: consensus(),
        };

        let normalized = normalize_height(ChainClientType::Reth, &raw).expect("normalizes");

        let expected_fees = BigDecimal::from_str("7770000000000000").expect("literal");
        assert_eq!(normalized.block.total_fees_wei, expected_fees);
        assert_eq!(
            normalized.block.effective_gas_price_avg_wei,
            Some(BigDecimal::from(120 * GWEI))
        );
        // effective tips of 10 and 30 gwei over the 100 gwei base fee
        assert_eq!(
            normalized.block.priority_fee_avg_wei,
            Some(BigDecimal::from(20 * GWEI))
        );
        assert_eq!(normalized.block.erc20_transfer_count, 3);
        assert_eq!(normalized.block.erc20_unique_token_count, 2);
        assert_eq!(normalized.block.tx_count, 2);
        assert_eq!(normalized.block.chain_client_type, "reth");
        assert_eq!(normalized.block.missing_count, None);
    }

    #[test]
    fn selector_and_contract_creation_fields() {
        let created = Address::from([0xcc; 20]);
        let raw = RawHeight {
            block: block(vec![
                transaction(1, Some(Address::from([5u8; 20])), vec![]),
                transaction(2, None, vec![0xa9, 0x05, 0x9c, 0xbb, 0xff]),
            ]),
            receipts: vec![
                receipt(1, 21_000, 110 * GWEI, None, vec![]),
                receipt(2, 42_000, 130 * GWEI, Some(created), vec![]),
            ],
            consensus: consensus(),
        };

        let normalized = normalize_height(ChainClientType::Geth, &raw).expect("normalizes");
        let transfer = &normalized.transactions[0];
        let creation = &normalized.transactions[1];

        assert_eq!(transfer.selector, None);
        assert!(!transfer.creates_contract);
        assert_eq!(creation.selector, Some("0xa9059cbb".to_string()));
        assert!(creation.creates_contract);
        assert_eq!(
            creation.created_contract_address,
            Some(created.to_hex_string())
        );
        assert_eq!(creation.status, 1);
        assert_eq!(creation.gas_used, 42_000);
    }

    #[test]
    fn missing_receipt_fails_the_height() {
        let raw = RawHeight {
            block: block(vec![transaction(1, Some(Address::from([5u8; 20])), vec![])]),
            receipts: vec![],
            consensus: consensus(),
        };

        let err = normalize_height(ChainClientType::Reth, &raw).expect_err("no receipt");
        match err {
            AnalyzerError::Data { height, .. } => assert_eq!(height, 100),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_block_has_null_averages() {
        let raw = RawHeight {
            block: block(vec![]),
            receipts: vec![],
            consensus: consensus(),
        };
        let normalized = normalize_height(ChainClientType::Reth, &raw).expect("normalizes");
        assert_eq!(normalized.block.effective_gas_price_avg_wei, None);
        assert_eq!(normalized.block.priority_fee_avg_wei, None);
        assert_eq!(normalized.block.total_fees_wei, BigDecimal::from(0));
        assert_eq!(normalized.block.tx_count, 0);
    }

    #[test]
    fn transfer_topic_requires_three_topics() {
        let token = Address::from([0xaa; 20]);
        let short_log =
            log_with_topics(token, vec![Transfer::SIGNATURE_HASH, B256::from([2u8; 32])]);
        let receipts = vec![receipt(1, 21_000, 110 * GWEI, None, vec![short_log])];
        assert_eq!(count_erc20_transfers(&receipts), (0, 0));
    }
}
