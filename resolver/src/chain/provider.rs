//! EVM provider with multi-RPC support and automatic failover

use crate::config::{EvmChainConfig, GasPriceStrategy};
use crate::error::{ResolverError, ResolverResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    /// Configured chain name
    name: String,
    config: EvmChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmProvider {
    pub fn new(name: &str, config: EvmChainConfig) -> ResolverResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ResolverError::chain_call(name, "No valid RPC providers"));
        }

        Ok(Self {
            name: name.to_string(),
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> ResolverResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.name, e);
                    self.failover();
                }
            }
        }

        Err(ResolverError::chain_call(&self.name, "All providers failed"))
    }

    /// Timestamp of a mined block, in epoch seconds
    pub async fn get_block_timestamp(&self, block_number: U64) -> ResolverResult<u64> {
        let block = self
            .http()
            .get_block(block_number)
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, e))?
            .ok_or_else(|| {
                ResolverError::chain_call(&self.name, format!("Block {} not found", block_number))
            })?;
        Ok(block.timestamp.as_u64())
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ResolverResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, e))
    }

    /// Read-only contract call with failover
    pub async fn call(&self, tx: &TypedTransaction) -> ResolverResult<Bytes> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().call(tx, None).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    last_error = e.to_string();
                    // Reverts come back identical from every node
                    if last_error.contains("revert") {
                        break;
                    }
                    warn!("eth_call failed on chain {}: {}", self.name, e);
                    self.failover();
                }
            }
        }

        Err(ResolverError::chain_call(&self.name, last_error))
    }

    pub async fn get_balance(&self, address: Address) -> ResolverResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, e))
    }

    pub async fn get_transaction_count(&self, address: Address) -> ResolverResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ResolverError::chain_call(&self.name, e))
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> ResolverResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, format!("gas estimation: {}", e)))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> ResolverResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self.http().get_gas_price().await.map_err(|e| {
                    ResolverError::chain_call(&self.name, format!("gas price: {}", e))
                })?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> ResolverResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, e))?
            .ok_or_else(|| ResolverError::chain_call(&self.name, "No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| ResolverError::chain_call(&self.name, "No base fee in block"))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;
        let max_fee = std::cmp::min(max_fee, self.max_gas_price());

        Ok((max_fee, priority_fee))
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.name, e);
                false
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
