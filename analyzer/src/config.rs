use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Parser, Debug)]
pub struct CLIArguments {
    #[clap(long, value_parser)]
    pub config_path: Option<String>,

    /// Re-run proxy detection and the ERC20 probe for one known contract,
    /// then exit instead of starting the ingest loops.
    #[clap(long, value_parser)]
    pub reclassify: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnalyzerConfig {
    /// Execution-layer JSON-RPC endpoint.
    pub el_endpoint: String,
    /// Consensus-layer (CometBFT-style) RPC endpoint.
    pub cl_endpoint: String,
    /// First height ingested when no cursor exists yet.
    pub start_height: u64,
    /// Heights processed per batch before a run row is written.
    pub batch_size: u64,
    /// Bounded fan-out for per-height fetches. Commits stay sequential.
    pub fetch_concurrency: usize,
    /// Blocks behind the node's latest height treated as confirmed head.
    pub confirmation_depth: u64,
    pub poll_interval_ms: u64,
    pub rpc_max_retries: u32,
    pub rpc_backoff_base_ms: u64,
    /// Reprocess heights whose stored hash already matches (backfill aid).
    pub force_refresh: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            el_endpoint: "http://127.0.0.1:8545".to_string(),
            cl_endpoint: "http://127.0.0.1:26657".to_string(),
            start_height: 1,
            batch_size: 100,
            fetch_concurrency: 8,
            confirmation_depth: 4,
            poll_interval_ms: 1000,
            rpc_max_retries: 5,
            rpc_backoff_base_ms: 200,
            force_refresh: false,
        }
    }
}

pub(crate) fn load_config(config_path: &str) -> std::result::Result<AnalyzerConfig, String> {
    match fs::read_to_string(config_path) {
        Ok(file_str) => {
            let ret: AnalyzerConfig = match toml::from_str(&file_str) {
                Ok(r) => r,
                Err(e) => {
                    println!("error...loading default config {}", e);
                    AnalyzerConfig::default()
                }
            };
            Ok(ret)
        }
        Err(_) => Ok(AnalyzerConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_full_config_file() {
        let raw = r#"
            el_endpoint = "http://10.0.0.5:8545"
            cl_endpoint = "http://10.0.0.5:26657"
            start_height = 438200
            batch_size = 50
            fetch_concurrency = 4
            confirmation_depth = 2
            poll_interval_ms = 500
            rpc_max_retries = 3
            rpc_backoff_base_ms = 100
            force_refresh = false
        "#;
        let config: AnalyzerConfig = toml::from_str(raw).expect("valid config");
        assert_eq!(config.start_height, 438200);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.el_endpoint, "http://10.0.0.5:8545");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config("/definitely/not/a/real/path.toml").expect("defaults");
        assert_eq!(config.batch_size, AnalyzerConfig::default().batch_size);
    }
}
