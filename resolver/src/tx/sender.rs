//! Transaction sender: sign, submit, wait for confirmations

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{EvmProvider, GasPrice};
use crate::error::{ResolverError, ResolverResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Submits the resolver's transactions on one EVM chain
pub struct TransactionSender {
    provider: Arc<EvmProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    /// Wallet bound to the chain id
    wallet: LocalWallet,
    /// Upper bound on waiting for a receipt
    receipt_timeout: Duration,
}

impl TransactionSender {
    pub async fn new(
        provider: Arc<EvmProvider>,
        wallet: LocalWallet,
        receipt_timeout: Duration,
    ) -> ResolverResult<Self> {
        let wallet = wallet.with_chain_id(provider.chain_id());
        let nonce_manager = NonceManager::init(wallet.address(), &provider).await?;

        info!(
            "Transaction sender for chain {} initialized with wallet {:?}",
            provider.name(),
            wallet.address()
        );

        Ok(Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            receipt_timeout,
        })
    }

    /// Load the signing key from the named environment variable
    pub fn load_wallet(private_key_env: &str) -> ResolverResult<LocalWallet> {
        let key = std::env::var(private_key_env).map_err(|_| {
            ResolverError::Config(format!("No wallet configured. Set {}", private_key_env))
        })?;
        key.trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| ResolverError::Config(format!("Invalid private key: {}", e)))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Send a contract call and wait until it is mined with the configured
    /// confirmations. A reverted receipt is an error.
    pub async fn send(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> ResolverResult<TransactionReceipt> {
        let chain = self.provider.name();

        // One resync on a stale nonce, then give up
        let mut resynced = false;
        let (tx_hash, nonce) = loop {
            let nonce = self.nonce_manager.allocate().await;
            match self.submit(to, data.clone(), value, nonce).await {
                Ok(hash) => break (hash, nonce),
                Err(SubmitError::NonceTooLow) if !resynced => {
                    warn!("Nonce {} too low on chain {}, resyncing", nonce, chain);
                    self.nonce_manager.sync(&self.provider).await?;
                    resynced = true;
                }
                Err(SubmitError::NonceTooLow) => {
                    return Err(ResolverError::chain_call(chain, "nonce too low after resync"));
                }
                Err(SubmitError::Failed(e)) => {
                    self.nonce_manager.release(nonce).await;
                    return Err(e);
                }
            }
        };

        self.nonce_manager
            .mark_pending(nonce, &format!("{:?}", tx_hash))
            .await;

        let receipt = self.wait_for_receipt(tx_hash).await?;
        self.nonce_manager.confirm(nonce).await;

        if receipt.status != Some(U64::from(1)) {
            return Err(ResolverError::chain_call(
                chain,
                format!("transaction {:?} reverted", tx_hash),
            ));
        }

        Ok(receipt)
    }

    async fn submit(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
    ) -> Result<H256, SubmitError> {
        let chain = self.provider.name();
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;

        let mut tx = build_tx(self.wallet.address(), to, data, value, nonce, &gas_price);
        // Estimation runs the call, so reverts surface here before anything is spent
        let gas_limit = self
            .gas_estimator
            .estimate_gas_limit(&self.provider, &tx)
            .await
            .map_err(|e| SubmitError::Failed(classify_error(chain, &e.to_string())))?;
        tx.set_gas(gas_limit);

        debug!(
            "Sending tx on chain {}: nonce {}, gas {}, max cost {} wei",
            chain,
            nonce,
            gas_limit,
            GasEstimator::calculate_cost(gas_limit, &gas_price) + value
        );

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ResolverError::Internal(format!("signing failed: {}", e)))?;
        let raw = tx.rlp_signed(&signature);

        match timeout(SEND_TIMEOUT, self.provider.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                info!("Transaction sent on chain {}: {:?}", chain, tx_hash);
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("nonce too low") {
                    Err(SubmitError::NonceTooLow)
                } else {
                    Err(SubmitError::Failed(classify_error(chain, &message)))
                }
            }
            Err(_) => Err(SubmitError::Failed(ResolverError::Timeout {
                operation: format!("send transaction on {}", chain),
            })),
        }
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> ResolverResult<TransactionReceipt> {
        let confirmations = self.provider.confirmation_blocks().max(1);

        let wait = async {
            loop {
                if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
                    if let Some(mined_in) = receipt.block_number {
                        let head = self.provider.get_block_number().await?;
                        if head + 1 >= mined_in.as_u64() + confirmations {
                            return Ok::<_, ResolverError>(receipt);
                        }
                    }
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        timeout(self.receipt_timeout, wait)
            .await
            .map_err(|_| ResolverError::Timeout {
                operation: format!("receipt for {:?}", tx_hash),
            })?
    }
}

enum SubmitError {
    NonceTooLow,
    Failed(ResolverError),
}

impl From<ResolverError> for SubmitError {
    fn from(e: ResolverError) -> Self {
        SubmitError::Failed(e)
    }
}

fn build_tx(
    from: Address,
    to: Address,
    data: Bytes,
    value: U256,
    nonce: u64,
    gas_price: &GasPrice,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .gas_price(*price)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .into(),
    }
}

/// Map a node error to the resolver taxonomy. Escrows revert with
/// `InvalidTime()` outside their window.
pub fn classify_error(chain: &str, message: &str) -> ResolverError {
    let invalid_time = format!("0x{}", hex::encode(crate::chain::evm::selector("InvalidTime()")));
    if message.contains("InvalidTime") || message.contains(&invalid_time) {
        ResolverError::timing(chain, message)
    } else {
        ResolverError::chain_call(chain, message)
    }
}
