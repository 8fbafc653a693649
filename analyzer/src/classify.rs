use alloy::primitives::{b256, Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use tracing::warn;

use db::{AnalyzerStore, ContractRow, Erc20TokenRow, ToHexString, TransactionRow};

use crate::chain::ChainClient;
use crate::error::AnalyzerError;

sol! {
    function name() external view returns (string);
    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
}

/// EIP-1967 implementation slot, keccak256("eip1967.proxy.implementation") - 1.
const EIP1967_IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// EIP-1167 minimal proxy runtime code, with the 20-byte target in between.
const MINIMAL_PROXY_PREFIX: [u8; 10] = [0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x73];
const MINIMAL_PROXY_SUFFIX: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];
const MINIMAL_PROXY_LEN: usize = 45;

#[derive(Clone, Debug, Default)]
pub struct Classification {
    pub contracts: Vec<ContractRow>,
    pub tokens: Vec<Erc20TokenRow>,
}

/// Registers every contract created at this height and probes each one once.
/// Probe failures are expected outcomes, not errors: the contract simply
/// stays unclassified until an explicit re-scan.
pub async fn classify_creations(
    client: &ChainClient,
    transactions: &[TransactionRow],
) -> Classification {
    let mut classification = Classification::default();
    for tx in transactions {
        let Some(raw_address) = tx
            .created_contract_address
            .as_ref()
            .filter(|_| tx.creates_contract)
        else {
            continue;
        };
        let address: Address = match raw_address.parse() {
            Ok(address) => address,
            Err(_) => {
                warn!("skipping unparseable created address {}", raw_address);
                continue;
            }
        };

        let code = match client.fetch_code(address).await {
            Ok(code) => code.to_vec(),
            Err(e) => {
                warn!("code fetch for {} failed: {}", raw_address, e);
                Vec::new()
            }
        };

        let (is_proxy, implementation_address) = detect_proxy(client, address, &code).await;
        classification.contracts.push(ContractRow {
            address: raw_address.clone(),
            creation_tx_hash: tx.hash.clone(),
            creator_address: tx.from_address.clone(),
            creation_height: tx.block_height,
            is_proxy,
            implementation_address,
        });

        if !code.is_empty() {
            if let Some(token) = probe_erc20(client, address, tx.block_height).await {
                classification.tokens.push(token);
            }
        }
    }
    classification
}

/// Explicit, idempotent re-scan for a single known contract, e.g. after a
/// proxy upgrade. Never part of the steady-state loop.
pub async fn reclassify_contract(
    client: &ChainClient,
    store: &AnalyzerStore,
    contract: &ContractRow,
) -> Result<(), AnalyzerError> {
    let address: Address = contract.address.parse().map_err(|_| AnalyzerError::Data {
        height: contract.creation_height as u64,
        reason: format!("unparseable contract address {}", contract.address),
    })?;

    let code = client.fetch_code(address).await?.to_vec();
    let (is_proxy, implementation_address) = detect_proxy(client, address, &code).await;
    let updated = ContractRow {
        is_proxy,
        implementation_address,
        ..contract.clone()
    };
    let tokens: Vec<Erc20TokenRow> = if code.is_empty() {
        Vec::new()
    } else {
        probe_erc20(client, address, contract.creation_height)
            .await
            .into_iter()
            .collect()
    };

    store.upsert_classification(&[updated], &tokens).await?;
    Ok(())
}

/// Proxy detection: an EIP-1167 clone encodes its target directly in the
/// runtime code; otherwise a bytecode mentioning the EIP-1967 slot gets the
/// slot read. Resolution failure leaves the target null for a later pass.
async fn detect_proxy(
    client: &ChainClient,
    address: Address,
    code: &[u8],
) -> (bool, Option<String>) {
    if let Some(target) = minimal_proxy_target(code) {
        return (true, Some(target.to_hex_string()));
    }
    if !references_implementation_slot(code) {
        return (false, None);
    }
    match client.fetch_storage(address, EIP1967_IMPLEMENTATION_SLOT).await {
        Ok(value) if value != U256::ZERO => {
            let word = B256::from(value.to_be_bytes::<32>());
            (true, Some(Address::from_word(word).to_hex_string()))
        }
        Ok(_) => (true, None),
        Err(e) => {
            warn!("implementation slot read for {} failed: {}", address, e);
            (true, None)
        }
    }
}

pub(crate) fn minimal_proxy_target(code: &[u8]) -> Option<Address> {
    if code.len() != MINIMAL_PROXY_LEN {
        return None;
    }
    if code[..10] != MINIMAL_PROXY_PREFIX || code[30..] != MINIMAL_PROXY_SUFFIX {
        return None;
    }
    Some(Address::from_slice(&code[10..30]))
}

pub(crate) fn references_implementation_slot(code: &[u8]) -> bool {
    code.windows(32)
        .any(|window| window == EIP1967_IMPLEMENTATION_SLOT.as_slice())
}

async fn probe_erc20(
    client: &ChainClient,
    address: Address,
    height: i64,
) -> Option<Erc20TokenRow> {
    let name_raw = client.eth_call(address, nameCall {}.abi_encode()).await.ok()?;
    let symbol_raw = client
        .eth_call(address, symbolCall {}.abi_encode())
        .await
        .ok()?;
    let decimals_raw = client
        .eth_call(address, decimalsCall {}.abi_encode())
        .await
        .ok()?;

    let (name, symbol, decimals) = decode_erc20_metadata(&name_raw, &symbol_raw, &decimals_raw)?;
    Some(Erc20TokenRow {
        address: address.to_hex_string(),
        name,
        symbol,
        decimals: decimals as i16,
        detected_at_height: height,
    })
}

/// All three returns must decode with their ABI-conformant types for the
/// contract to classify as ERC20.
pub(crate) fn decode_erc20_metadata(
    name: &[u8],
    symbol: &[u8],
    decimals: &[u8],
) -> Option<(String, String, u8)> {
    let name = nameCall::abi_decode_returns(name, true).ok()?._0;
    let symbol = symbolCall::abi_decode_returns(symbol, true).ok()?._0;
    let decimals = decimalsCall::abi_decode_returns(decimals, true).ok()?._0;
    Some((name, symbol, decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolValue;
    use pretty_assertions::assert_eq;

    fn minimal_proxy_code(target: Address) -> Vec<u8> {
        let mut code = Vec::with_capacity(MINIMAL_PROXY_LEN);
        code.extend_from_slice(&MINIMAL_PROXY_PREFIX);
        code.extend_from_slice(target.as_slice());
        code.extend_from_slice(&MINIMAL_PROXY_SUFFIX);
        code
    }

    #[test]
    fn extracts_minimal_proxy_target() {
        let target = Address::from([0x42; 20]);
        assert_eq!(minimal_proxy_target(&minimal_proxy_code(target)), Some(target));
    }

    #[test]
    fn rejects_near_miss_minimal_proxies() {
        let target = Address::from([0x42; 20]);
        let mut truncated = minimal_proxy_code(target);
        truncated.pop();
        assert_eq!(minimal_proxy_target(&truncated), None);

        let mut wrong_suffix = minimal_proxy_code(target);
        wrong_suffix[44] = 0x00;
        assert_eq!(minimal_proxy_target(&wrong_suffix), None);
    }

    #[test]
    fn finds_eip1967_slot_constant_in_bytecode() {
        let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x7f];
        code.extend_from_slice(EIP1967_IMPLEMENTATION_SLOT.as_slice());
        code.push(0x54);
        assert!(references_implementation_slot(&code));
        assert!(!references_implementation_slot(&[0x60, 0x80, 0x60, 0x40]));
    }

    #[test]
    fn decodes_conformant_erc20_metadata() {
        let name = "Wrapped Ether".to_string().abi_encode();
        let symbol = "WETH".to_string().abi_encode();
        let decimals = 18u16.abi_encode();

        let decoded = decode_erc20_metadata(&name, &symbol, &decimals).expect("conformant");
        assert_eq!(decoded, ("Wrapped Ether".to_string(), "WETH".to_string(), 18));
    }

    #[test]
    fn rejects_wrong_return_types() {
        let name = "Token".to_string().abi_encode();
        let symbol = "TKN".to_string().abi_encode();
        // a value outside the uint8 domain is not ABI-conformant
        let bad_decimals = 300u32.abi_encode();
        assert_eq!(decode_erc20_metadata(&name, &symbol, &bad_decimals), None);

        // empty return data (e.g. a reverting fallback) is rejected too
        assert_eq!(decode_erc20_metadata(&[], &symbol, &18u16.abi_encode()), None);
    }
}
