use std::fmt;
use std::str::FromStr;

use alloy::primitives::{hex::ToHexExt, Address, Bytes, FixedBytes, U256};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Module names owning an `ingest_cursors` row. Each module advances its
/// cursor independently of the others.
pub const BLOCKS_MODULE: &str = "blocks";
pub const VALIDATOR_SNAPSHOTS_MODULE: &str = "validator_snapshots";

/// Closed set of known execution-layer client implementations, stamped on
/// every block row as detected at startup.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum ChainClientType {
    Reth,
    Geth,
    Erigon,
    Nethermind,
    Besu,
    Unknown,
}

impl ChainClientType {
    /// Classifies a `web3_clientVersion` response string.
    pub fn from_version(version: &str) -> Self {
        let lowered = version.to_ascii_lowercase();
        if lowered.starts_with("reth") {
            ChainClientType::Reth
        } else if lowered.starts_with("geth") {
            ChainClientType::Geth
        } else if lowered.starts_with("erigon") {
            ChainClientType::Erigon
        } else if lowered.starts_with("nethermind") {
            ChainClientType::Nethermind
        } else if lowered.starts_with("besu") {
            ChainClientType::Besu
        } else {
            ChainClientType::Unknown
        }
    }
}

impl FromStr for ChainClientType {
    type Err = serde_json::Error;

    fn from_str(input: &str) -> Result<ChainClientType, Self::Err> {
        match input {
            "reth" => Ok(ChainClientType::Reth),
            "geth" => Ok(ChainClientType::Geth),
            "erigon" => Ok(ChainClientType::Erigon),
            "nethermind" => Ok(ChainClientType::Nethermind),
            "besu" => Ok(ChainClientType::Besu),
            _ => Ok(ChainClientType::Unknown),
        }
    }
}

impl fmt::Display for ChainClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainClientType::Reth => "reth",
            ChainClientType::Geth => "geth",
            ChainClientType::Erigon => "erigon",
            ChainClientType::Nethermind => "nethermind",
            ChainClientType::Besu => "besu",
            ChainClientType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Terminal status of an ingest run, as stored in `ingest_runs.status`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum RunStatus {
    Ok,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

pub trait ToHexString {
    fn to_hex_string(&self) -> String;
}

impl ToHexString for &[u8] {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self)
    }
}

impl ToHexString for Address {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self.as_slice())
    }
}

impl<const N: usize> ToHexString for FixedBytes<N> {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self.as_slice())
    }
}

impl ToHexString for Bytes {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(&self.0)
    }
}

fn to_hex_string_internal(bytes: &[u8]) -> String {
    bytes.encode_hex_with_prefix()
}

/// Wei quantities exceed i64, so they are persisted as `NUMERIC`. A `U256`
/// renders as a plain decimal string, which `BigDecimal` parses exactly.
pub fn u256_to_numeric(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).expect("U256 renders as a decimal integer")
}

pub fn u128_to_numeric(value: u128) -> BigDecimal {
    BigDecimal::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_type_from_version_covers_known_clients() {
        let cases = [
            ("reth/v1.0.6/x86_64-unknown-linux-gnu", ChainClientType::Reth),
            ("Geth/v1.13.14-stable/linux-amd64/go1.21", ChainClientType::Geth),
            ("erigon/2.59.3/linux-amd64/go1.21.6", ChainClientType::Erigon),
            ("Nethermind/v1.25.4+20b10b35/linux-x64", ChainClientType::Nethermind),
            ("besu/v24.1.1/linux-x86_64/openjdk", ChainClientType::Besu),
            ("openethereum/v3.3.5", ChainClientType::Unknown),
        ];
        for (version, expected) in cases {
            assert_eq!(ChainClientType::from_version(version), expected);
        }
    }

    #[test]
    fn client_type_round_trips_through_text() {
        for client in [
            ChainClientType::Reth,
            ChainClientType::Geth,
            ChainClientType::Erigon,
            ChainClientType::Nethermind,
            ChainClientType::Besu,
            ChainClientType::Unknown,
        ] {
            let parsed: ChainClientType = client.to_string().parse().expect("infallible");
            assert_eq!(parsed, client);
        }
    }

    #[test]
    fn hex_rendering_is_prefixed_and_lowercase() {
        let address = Address::from_slice(&[0xab; 20]);
        assert_eq!(
            address.to_hex_string(),
            "0xabababababababababababababababababababab"
        );
        assert_eq!((&[0xa9, 0x05, 0x9c, 0xbb][..]).to_hex_string(), "0xa9059cbb");
    }

    #[test]
    fn u256_to_numeric_is_exact_beyond_i64() {
        let wei = U256::from(123_456_789_u64) * U256::from(10_u64).pow(U256::from(18));
        let expected = BigDecimal::from_str("123456789000000000000000000").expect("literal");
        assert_eq!(u256_to_numeric(wei), expected);
    }
}
