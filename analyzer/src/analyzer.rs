use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use db::{AnalyzerStore, ChainClientType};

use crate::chain::ChainClient;
use crate::classify::reclassify_contract;
use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::ingest::run_block_ingest;
use crate::validators::run_snapshot_ingest;

pub struct Analyzer {
    pub store: Arc<AnalyzerStore>,
    pub client: Arc<ChainClient>,
    pub client_type: ChainClientType,
    pub config: AnalyzerConfig,
}

impl Analyzer {
    pub async fn new(config: AnalyzerConfig) -> Result<Self, AnalyzerError> {
        let store = Arc::new(AnalyzerStore::new().await?);
        let client = Arc::new(ChainClient::connect(&config)?);
        let client_type = match client.detect_client_type().await {
            Ok(client_type) => client_type,
            Err(e) => {
                warn!("execution client detection failed: {}", e);
                ChainClientType::Unknown
            }
        };
        info!("connected to {} execution client", client_type);

        Ok(Self {
            store,
            client,
            client_type,
            config,
        })
    }

    /// Explicit re-scan for a contract already in the registry, e.g. after
    /// its proxy target moved. Idempotent; separate from the ingest loops.
    pub async fn reclassify(&self, address: &str) -> Result<(), AnalyzerError> {
        let Some(contract) = self.store.get_contract(address).await? else {
            warn!("no contract registered at {}", address);
            return Ok(());
        };
        reclassify_contract(&self.client, &self.store, &contract).await
    }

    /// Runs every ingestion module until ctrl-c. The shutdown flag is
    /// honored between heights; an in-flight height transaction commits or
    /// rolls back before the process exits.
    pub async fn run(self) -> Result<(), AnalyzerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let block_task = tokio::spawn(run_block_ingest(
            self.store.clone(),
            self.client.clone(),
            self.client_type,
            self.config.clone(),
            shutdown_rx.clone(),
        ));
        let snapshot_task = tokio::spawn(run_snapshot_ingest(
            self.store.clone(),
            self.client.clone(),
            shutdown_rx,
        ));

        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen to shutdown signal");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        let (block_result, snapshot_result) = tokio::join!(block_task, snapshot_task);
        block_result?;
        snapshot_result?;
        Ok(())
    }
}
