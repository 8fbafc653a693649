use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::eth::{Block, TransactionInput, TransactionReceipt, TransactionRequest};
use alloy::transports::http::Http;
use alloy::transports::{RpcError, TransportError};
use async_std::task::sleep;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use db::ChainClientType;

use crate::config::AnalyzerConfig;

pub type ElProvider = RootProvider<Http<Client>>;

/// Signature present in a commit with this flag or higher (commit or nil
/// vote); lower flags mean the validator was absent for the round.
const BLOCK_ID_FLAG_COMMIT: i32 = 2;

const VALIDATORS_PER_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum ChainClientError {
    /// Network-level failure that survived every retry. The orchestrator
    /// records the run as failed and retries from the stalled cursor.
    #[error("transient rpc failure ({op}): {detail}")]
    Transient { op: &'static str, detail: String },

    /// The node answered with something we cannot interpret. Never retried.
    #[error("malformed response ({op}): {detail}")]
    Malformed { op: &'static str, detail: String },
}

/// Raw per-height payload handed to the normalizer: the full block with its
/// transactions, every receipt, and the consensus commit for the height.
#[derive(Clone, Debug)]
pub struct RawHeight {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
    pub consensus: ConsensusData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusData {
    pub proposer_address: String,
    pub last_commit_round: i32,
    pub total_voting_power: i64,
    pub missing_voting_power: i64,
    pub absent_validators: Vec<String>,
    /// Every address in the validator set at this height, for first-seen
    /// registry upserts.
    pub validator_addresses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorSetEntry {
    pub address: String,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

pub struct ChainClient {
    el: ElProvider,
    cl: Client,
    cl_endpoint: String,
    confirmation_depth: u64,
    max_retries: u32,
    backoff_base: Duration,
}

impl ChainClient {
    pub fn connect(config: &AnalyzerConfig) -> Result<Self, ChainClientError> {
        let url = config
            .el_endpoint
            .parse()
            .map_err(|e| ChainClientError::Malformed {
                op: "el_endpoint",
                detail: format!("{}: {}", config.el_endpoint, e),
            })?;
        let el = ProviderBuilder::new().on_http(url);
        Ok(Self {
            el,
            cl: Client::new(),
            cl_endpoint: config.cl_endpoint.trim_end_matches('/').to_string(),
            confirmation_depth: config.confirmation_depth,
            max_retries: config.rpc_max_retries,
            backoff_base: Duration::from_millis(config.rpc_backoff_base_ms),
        })
    }

    /// Highest height the orchestrator may ask for: the node's latest block
    /// minus the configured confirmation depth.
    pub async fn head_height(&self) -> Result<u64, ChainClientError> {
        let latest = self
            .with_backoff("eth_blockNumber", || async {
                self.el
                    .get_block_number()
                    .await
                    .map_err(|e| rpc_error("eth_blockNumber", e))
            })
            .await?;
        Ok(latest.saturating_sub(self.confirmation_depth))
    }

    pub async fn detect_client_type(&self) -> Result<ChainClientType, ChainClientError> {
        let version: String = self
            .with_backoff("web3_clientVersion", || async {
                self.el
                    .raw_request("web3_clientVersion".into(), ())
                    .await
                    .map_err(|e| rpc_error("web3_clientVersion", e))
            })
            .await?;
        debug!("detected client version string {}", version);
        Ok(ChainClientType::from_version(&version))
    }

    /// Fetches the EL and CL views of one height concurrently. Only valid
    /// for heights at or below `head_height()`.
    pub async fn fetch_height(&self, height: u64) -> Result<RawHeight, ChainClientError> {
        let ((block, receipts), consensus) =
            tokio::try_join!(self.fetch_block(height), self.fetch_consensus(height))?;
        Ok(RawHeight {
            block,
            receipts,
            consensus,
        })
    }

    pub async fn fetch_block(
        &self,
        height: u64,
    ) -> Result<(Block, Vec<TransactionReceipt>), ChainClientError> {
        let block = self
            .with_backoff("eth_getBlockByNumber", || async {
                self.el
                    .get_block_by_number(BlockNumberOrTag::Number(height), true)
                    .await
                    .map_err(|e| rpc_error("eth_getBlockByNumber", e))
            })
            .await?
            .ok_or(ChainClientError::Transient {
                op: "eth_getBlockByNumber",
                detail: format!("block {} not yet available", height),
            })?;

        let receipts = self
            .with_backoff("eth_getBlockReceipts", || async {
                self.el
                    .get_block_receipts(BlockId::Number(BlockNumberOrTag::Number(height)))
                    .await
                    .map_err(|e| rpc_error("eth_getBlockReceipts", e))
            })
            .await?
            .ok_or(ChainClientError::Transient {
                op: "eth_getBlockReceipts",
                detail: format!("receipts for block {} not yet available", height),
            })?;

        Ok((block, receipts))
    }

    pub async fn fetch_consensus(&self, height: u64) -> Result<ConsensusData, ChainClientError> {
        let commit: CommitResult = self
            .cl_get("commit", &[("height".to_string(), height.to_string())])
            .await?;
        let set = self.fetch_validator_set(height).await?;
        Ok(build_consensus(
            commit.signed_header.header.proposer_address,
            commit.signed_header.commit.round,
            &set,
            &commit.signed_header.commit.signatures,
        ))
    }

    /// Full validator set at a height; the CL pages at 100 per request.
    pub async fn fetch_validator_set(
        &self,
        height: u64,
    ) -> Result<Vec<ValidatorSetEntry>, ChainClientError> {
        let mut entries = Vec::new();
        let mut page = 1usize;
        loop {
            let result: ValidatorsResult = self
                .cl_get(
                    "validators",
                    &[
                        ("height".to_string(), height.to_string()),
                        ("page".to_string(), page.to_string()),
                        ("per_page".to_string(), VALIDATORS_PER_PAGE.to_string()),
                    ],
                )
                .await?;
            let total: usize = result
                .total
                .parse()
                .map_err(|_| ChainClientError::Malformed {
                    op: "validators",
                    detail: format!("unparseable total {}", result.total),
                })?;
            if result.validators.is_empty() {
                break;
            }
            for validator in result.validators {
                entries.push(ValidatorSetEntry {
                    voting_power: parse_i64("validators", &validator.voting_power)?,
                    proposer_priority: parse_i64("validators", &validator.proposer_priority)?,
                    address: validator.address,
                });
            }
            if entries.len() >= total {
                break;
            }
            page += 1;
        }
        Ok(entries)
    }

    pub async fn fetch_code(&self, address: Address) -> Result<Bytes, ChainClientError> {
        self.with_backoff("eth_getCode", || async {
            self.el
                .get_code_at(address)
                .await
                .map_err(|e| rpc_error("eth_getCode", e))
        })
        .await
    }

    pub async fn fetch_storage(
        &self,
        address: Address,
        slot: B256,
    ) -> Result<U256, ChainClientError> {
        self.with_backoff("eth_getStorageAt", || async {
            self.el
                .get_storage_at(address, U256::from_be_bytes(slot.0))
                .await
                .map_err(|e| rpc_error("eth_getStorageAt", e))
        })
        .await
    }

    /// Static call against a deployed contract. A revert surfaces as
    /// `Malformed`, which probe callers treat as "not conformant".
    pub async fn eth_call(
        &self,
        address: Address,
        data: Vec<u8>,
    ) -> Result<Bytes, ChainClientError> {
        let request = TransactionRequest {
            to: Some(TxKind::Call(address)),
            input: TransactionInput::new(data.into()),
            ..Default::default()
        };
        self.with_backoff("eth_call", || {
            let request = request.clone();
            async move {
                self.el
                    .call(&request)
                    .await
                    .map_err(|e| rpc_error("eth_call", e))
            }
        })
        .await
    }

    async fn cl_get<T: DeserializeOwned>(
        &self,
        path: &'static str,
        params: &[(String, String)],
    ) -> Result<T, ChainClientError> {
        let url = format!("{}/{}", self.cl_endpoint, path);
        self.with_backoff(path, || async {
            let response = self
                .cl
                .get(&url)
                .query(params)
                .send()
                .await
                .map_err(|e| http_error(path, e))?;
            let response = response.error_for_status().map_err(|e| http_error(path, e))?;
            let envelope: RpcEnvelope<T> =
                response.json().await.map_err(|e| ChainClientError::Malformed {
                    op: path,
                    detail: e.to_string(),
                })?;
            Ok(envelope.result)
        })
        .await
    }

    /// Retries transient failures with exponential backoff; anything
    /// malformed is surfaced to the caller on the first attempt.
    async fn with_backoff<T, F, Fut>(
        &self,
        op: &'static str,
        make: F,
    ) -> Result<T, ChainClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ChainClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            match make().await {
                Ok(value) => return Ok(value),
                Err(err @ ChainClientError::Malformed { .. }) => return Err(err),
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.backoff_base, attempt);
                    debug!("{} failed (attempt {}), retrying in {:?}", op, attempt, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

fn rpc_error(op: &'static str, err: TransportError) -> ChainClientError {
    match err {
        RpcError::Transport(kind) => ChainClientError::Transient {
            op,
            detail: kind.to_string(),
        },
        other => ChainClientError::Malformed {
            op,
            detail: other.to_string(),
        },
    }
}

fn http_error(op: &'static str, err: reqwest::Error) -> ChainClientError {
    let transient = err.is_timeout()
        || err.is_connect()
        || err.status().map_or(false, |code| code.is_server_error());
    if transient {
        ChainClientError::Transient {
            op,
            detail: err.to_string(),
        }
    } else {
        ChainClientError::Malformed {
            op,
            detail: err.to_string(),
        }
    }
}

fn parse_i64(op: &'static str, raw: &str) -> Result<i64, ChainClientError> {
    raw.parse().map_err(|_| ChainClientError::Malformed {
        op,
        detail: format!("unparseable integer {}", raw),
    })
}

fn build_consensus(
    proposer_address: String,
    round: i32,
    set: &[ValidatorSetEntry],
    signatures: &[CommitSig],
) -> ConsensusData {
    let present: HashSet<&str> = signatures
        .iter()
        .filter(|sig| sig.block_id_flag >= BLOCK_ID_FLAG_COMMIT && !sig.validator_address.is_empty())
        .map(|sig| sig.validator_address.as_str())
        .collect();

    let mut total_voting_power = 0i64;
    let mut missing_voting_power = 0i64;
    let mut absent_validators = Vec::new();
    let mut validator_addresses = Vec::with_capacity(set.len());
    for entry in set {
        total_voting_power += entry.voting_power;
        if !present.contains(entry.address.as_str()) {
            missing_voting_power += entry.voting_power;
            absent_validators.push(entry.address.clone());
        }
        validator_addresses.push(entry.address.clone());
    }

    ConsensusData {
        proposer_address,
        last_commit_round: round,
        total_voting_power,
        missing_voting_power,
        absent_validators,
        validator_addresses,
    }
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CommitResult {
    signed_header: SignedHeader,
}

#[derive(Deserialize)]
struct SignedHeader {
    header: CommitHeader,
    commit: Commit,
}

#[derive(Deserialize)]
struct CommitHeader {
    proposer_address: String,
}

#[derive(Deserialize)]
struct Commit {
    round: i32,
    signatures: Vec<CommitSig>,
}

#[derive(Deserialize)]
pub(crate) struct CommitSig {
    block_id_flag: i32,
    #[serde(default)]
    validator_address: String,
}

#[derive(Deserialize)]
struct ValidatorsResult {
    validators: Vec<RpcValidator>,
    total: String,
}

#[derive(Deserialize)]
struct RpcValidator {
    address: String,
    voting_power: String,
    proposer_priority: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(address: &str, power: i64) -> ValidatorSetEntry {
        ValidatorSetEntry {
            address: address.to_string(),
            voting_power: power,
            proposer_priority: 0,
        }
    }

    fn sig(address: &str, flag: i32) -> CommitSig {
        CommitSig {
            block_id_flag: flag,
            validator_address: address.to_string(),
        }
    }

    #[test]
    fn consensus_counts_absent_voting_power() {
        let set = vec![entry("AA", 50), entry("BB", 30), entry("CC", 20)];
        let signatures = vec![sig("AA", 2), sig("", 1), sig("CC", 3)];
        let consensus = build_consensus("AA".to_string(), 1, &set, &signatures);

        assert_eq!(consensus.total_voting_power, 100);
        assert_eq!(consensus.missing_voting_power, 30);
        assert_eq!(consensus.absent_validators, vec!["BB".to_string()]);
        assert_eq!(consensus.last_commit_round, 1);
        assert_eq!(consensus.validator_addresses.len(), 3);
    }

    #[test]
    fn nil_votes_still_count_as_present() {
        let set = vec![entry("AA", 10)];
        let signatures = vec![sig("AA", 3)];
        let consensus = build_consensus("AA".to_string(), 0, &set, &signatures);
        assert_eq!(consensus.missing_voting_power, 0);
        assert!(consensus.absent_validators.is_empty());
    }

    #[test]
    fn empty_commit_marks_whole_set_absent() {
        let set = vec![entry("AA", 10), entry("BB", 5)];
        let consensus = build_consensus("AA".to_string(), 0, &set, &[]);
        assert_eq!(consensus.missing_voting_power, 15);
        assert_eq!(consensus.absent_validators.len(), 2);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(200);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(1600));
    }
}
