//! Chain module - adapters for the two ledgers a swap spans
//!
//! This module provides:
//! - The `ChainAdapter` contract the coordination core drives
//! - An EVM escrow-factory adapter with multi-RPC failover
//! - An Internet Computer escrow-canister adapter
//! - Configured / unconfigured bindings so a chain with missing
//!   credentials is reported instead of silently stubbed

pub mod escrow;
pub mod evm;
pub mod icp;
pub mod provider;
#[cfg(test)]
pub mod testing;

pub use escrow::{EscrowHandle, EscrowImmutables, EscrowSide, Timelocks, WithdrawalWindow};
pub use provider::{EvmProvider, GasPrice};

use crate::config::{ChainConfig, ResolverConfig, Settings};
use crate::coordination::commitment::Secret;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Ledger family of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Icp,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Evm => "evm",
            ChainKind::Icp => "icp",
        }
    }
}

/// Operations the coordination core needs from a ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn kind(&self) -> ChainKind;

    fn chain_name(&self) -> String;

    /// Address the resolver signs with on this chain
    fn resolver_address(&self) -> String;

    /// Whether `token` denotes the chain's native asset
    fn is_native(&self, token: &str) -> bool;

    /// Fund and create the source escrow; returns the escrow as recorded on chain
    async fn create_source_escrow(
        &self,
        immutables: &EscrowImmutables,
    ) -> ResolverResult<EscrowHandle>;

    /// Fund and create the destination escrow. `src_cancellation_at` is the
    /// source escrow's cancellation start, which the destination must not outlive.
    async fn create_destination_escrow(
        &self,
        immutables: &EscrowImmutables,
        src_cancellation_at: u64,
    ) -> ResolverResult<EscrowHandle>;

    /// Reveal the secret to release an escrow; returns the transaction reference
    async fn withdraw(&self, escrow: &EscrowHandle, secret: &Secret) -> ResolverResult<String>;

    async fn get_balance(&self, account: &str, asset: &str) -> ResolverResult<u128>;

    async fn health_check(&self) -> bool;
}

/// A named chain, either backed by a working adapter or reported as unusable
#[derive(Clone)]
pub enum ChainBinding {
    Configured(Arc<dyn ChainAdapter>),
    Unconfigured { kind: ChainKind, reason: String },
}

impl ChainBinding {
    pub fn kind(&self) -> ChainKind {
        match self {
            ChainBinding::Configured(adapter) => adapter.kind(),
            ChainBinding::Unconfigured { kind, .. } => *kind,
        }
    }
}

/// Per-chain summary for the info endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub name: String,
    pub kind: ChainKind,
    pub configured: bool,
    pub resolver_address: Option<String>,
    pub reason: Option<String>,
}

/// Holds the adapter binding for every enabled chain
pub struct ChainManager {
    bindings: DashMap<String, ChainBinding>,
}

impl ChainManager {
    /// Bind every enabled chain. A chain whose adapter cannot be built is
    /// bound as unconfigured rather than failing startup.
    pub async fn new(settings: &Settings) -> Self {
        let manager = Self::empty();

        for (name, chain_config) in settings.enabled_chains() {
            let binding = match chain_config {
                ChainConfig::Evm(evm) => {
                    match evm::EvmChainAdapter::connect(name, evm, &settings.resolver).await {
                        Ok(adapter) => ChainBinding::Configured(Arc::new(adapter)),
                        Err(e) => ChainBinding::Unconfigured {
                            kind: ChainKind::Evm,
                            reason: e.to_string(),
                        },
                    }
                }
                ChainConfig::Icp(icp) => {
                    match icp::IcpChainAdapter::connect(name, icp, &settings.resolver).await {
                        Ok(adapter) => ChainBinding::Configured(Arc::new(adapter)),
                        Err(e) => ChainBinding::Unconfigured {
                            kind: ChainKind::Icp,
                            reason: e.to_string(),
                        },
                    }
                }
            };

            match &binding {
                ChainBinding::Configured(adapter) => {
                    info!(
                        "Chain {} ({}) initialized, resolver address {}",
                        name,
                        binding.kind().as_str(),
                        adapter.resolver_address()
                    );
                }
                ChainBinding::Unconfigured { reason, .. } => {
                    warn!("Chain {} left unconfigured: {}", name, reason);
                }
            }
            manager.insert(name.clone(), binding);
        }

        manager
    }

    pub fn empty() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    pub fn insert(&self, name: impl Into<String>, binding: ChainBinding) {
        self.bindings.insert(name.into(), binding);
    }

    pub fn kind_of(&self, name: &str) -> Option<ChainKind> {
        self.bindings.get(name).map(|b| b.kind())
    }

    /// Get the adapter for a chain
    pub fn get(&self, name: &str) -> ResolverResult<Arc<dyn ChainAdapter>> {
        match self.bindings.get(name).map(|b| b.clone()) {
            Some(ChainBinding::Configured(adapter)) => Ok(adapter),
            Some(ChainBinding::Unconfigured { reason, .. }) => {
                Err(ResolverError::ChainNotConfigured {
                    chain: name.to_string(),
                    reason,
                })
            }
            None => Err(ResolverError::ChainNotConfigured {
                chain: name.to_string(),
                reason: "unknown chain".to_string(),
            }),
        }
    }

    pub fn resolver_address(&self, name: &str) -> Option<String> {
        self.get(name).ok().map(|a| a.resolver_address())
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let bindings: Vec<(String, ChainBinding)> = self
            .bindings
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let checks = bindings.into_iter().map(|(name, binding)| async move {
            let healthy = match binding {
                ChainBinding::Configured(adapter) => adapter.health_check().await,
                ChainBinding::Unconfigured { .. } => false,
            };
            crate::metrics::record_chain_health(&name, healthy);
            (name, healthy)
        });

        let mut results = join_all(checks).await;

        results.sort();
        results
    }

    pub fn describe(&self) -> Vec<ChainInfo> {
        let mut chains: Vec<ChainInfo> = self
            .bindings
            .iter()
            .map(|entry| match entry.value() {
                ChainBinding::Configured(adapter) => ChainInfo {
                    name: entry.key().clone(),
                    kind: adapter.kind(),
                    configured: true,
                    resolver_address: Some(adapter.resolver_address()),
                    reason: None,
                },
                ChainBinding::Unconfigured { kind, reason } => ChainInfo {
                    name: entry.key().clone(),
                    kind: *kind,
                    configured: false,
                    resolver_address: None,
                    reason: Some(reason.clone()),
                },
            })
            .collect();
        chains.sort_by(|a, b| a.name.cmp(&b.name));
        chains
    }

    /// Every (source, destination) pair with exactly one home-ledger side
    pub fn supported_pairs(&self) -> Vec<(String, String)> {
        let chains = self.describe();
        let mut pairs = Vec::new();
        for src in &chains {
            for dst in &chains {
                if src.kind != dst.kind {
                    pairs.push((src.name.clone(), dst.name.clone()));
                }
            }
        }
        pairs
    }
}

pub(crate) fn call_timeout(config: &ResolverConfig) -> std::time::Duration {
    std::time::Duration::from_secs(config.chain_call_timeout_secs)
}
