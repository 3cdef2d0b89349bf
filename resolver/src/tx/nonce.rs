//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent orders never reuse a nonce
//! - Releasing a nonce whose transaction never reached the mempool
//! - Resync with the chain after a "nonce too low" rejection

use crate::chain::EvmProvider;
use crate::error::ResolverResult;

use ethers::types::Address;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but not yet mined: nonce -> tx hash
    pending: BTreeMap<u64, String>,
    /// Highest nonce seen mined
    confirmed: Option<u64>,
}

/// Nonce allocator for the resolver's wallet on one EVM chain
pub struct NonceManager {
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    /// Start from a known next nonce
    pub fn starting_at(wallet_address: Address, next: u64) -> Self {
        Self {
            wallet_address,
            state: Mutex::new(NonceState {
                current: next,
                pending: BTreeMap::new(),
                confirmed: next.checked_sub(1),
            }),
        }
    }

    /// Initialize from the chain's pending transaction count
    pub async fn init(wallet_address: Address, provider: &EvmProvider) -> ResolverResult<Self> {
        let on_chain = provider.get_transaction_count(wallet_address).await?;
        debug!("Initialized nonce for chain {}: {}", provider.name(), on_chain);
        Ok(Self::starting_at(wallet_address, on_chain))
    }

    /// Allocate the next nonce
    pub async fn allocate(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {}", nonce);
        nonce
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        self.state.lock().await.pending.insert(nonce, tx_hash.to_string());
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
    }

    /// Release a nonce whose transaction was never accepted
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if state.current == nonce + 1 {
            state.current = nonce;
        }
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &EvmProvider) -> ResolverResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.apply_sync(on_chain).await;
        Ok(())
    }

    async fn apply_sync(&self, on_chain: u64) {
        let mut state = self.state.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain > expected && state.pending.is_empty() {
            warn!("Nonce gap detected: expected {}, chain reports {}", expected, on_chain);
        }

        state.pending = state.pending.split_off(&on_chain);
        state.confirmed = on_chain.checked_sub(1);
        if state.current < on_chain {
            state.current = on_chain;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
