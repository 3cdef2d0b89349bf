//! Liquidity checks and the per-chain reservation ledger
//!
//! Every accepted order reserves what the resolver must lock on each chain.
//! Available liquidity is the on-chain balance minus open reservations, so
//! two concurrent submissions cannot both spend the same balance. A side's
//! reservation is committed once its escrow is funded (the balance itself
//! then reflects the spend) and released if the order aborts first.

use super::validator::ValidatedOrder;
use crate::chain::{ChainKind, ChainManager, EscrowSide};
use crate::error::{ResolverError, ResolverResult};
use crate::state::order::u128_string;
use crate::state::OrderHash;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Asset id used for native EVM balance queries
pub const EVM_NATIVE_ASSET: &str = "0x0000000000000000000000000000000000000000";
/// Asset id used for native ICP balance queries
pub const ICP_NATIVE_ASSET: &str = "ICP";

fn native_asset(kind: ChainKind) -> &'static str {
    match kind {
        ChainKind::Evm => EVM_NATIVE_ASSET,
        ChainKind::Icp => ICP_NATIVE_ASSET,
    }
}

/// Amount the resolver must lock in one asset on one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub chain: String,
    pub asset: String,
    pub side: EscrowSide,
    pub amount: u128,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRequirement {
    pub chain: String,
    pub asset: String,
    #[serde(with = "u128_string")]
    pub required: u128,
    #[serde(with = "u128_string")]
    pub available: u128,
}

/// Outcome of a liquidity check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityReport {
    pub sufficient: bool,
    pub per_chain: Vec<ChainRequirement>,
}

impl LiquidityReport {
    fn first_shortfall(&self) -> Option<&ChainRequirement> {
        self.per_chain.iter().find(|c| c.available < c.required)
    }
}

/// One row of the liquidity snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityEntry {
    pub chain: String,
    pub asset: String,
    pub account: String,
    #[serde(with = "u128_string")]
    pub balance: u128,
    #[serde(with = "u128_string")]
    pub reserved: u128,
    #[serde(with = "u128_string")]
    pub available: u128,
}

pub struct LiquidityLedger {
    chains: Arc<ChainManager>,
    resolver_funds_source: bool,
    call_timeout: Duration,
    reservations: Mutex<HashMap<OrderHash, Vec<Requirement>>>,
}

impl LiquidityLedger {
    pub fn new(chains: Arc<ChainManager>, resolver_funds_source: bool, call_timeout: Duration) -> Self {
        Self {
            chains,
            resolver_funds_source,
            call_timeout,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// What the resolver must lock for an order.
    ///
    /// Both escrows carry the safety deposit. The destination always needs
    /// the principal; the source only when the resolver funds it. On EVM a
    /// token escrow takes its deposit in the native asset.
    pub fn requirements(&self, order: &ValidatedOrder) -> ResolverResult<Vec<Requirement>> {
        let mut requirements = Vec::new();

        for side in [EscrowSide::Source, EscrowSide::Destination] {
            let (chain, token, amount) = match side {
                EscrowSide::Source => (&order.src_chain, &order.src_token, order.src_amount),
                EscrowSide::Destination => (&order.dst_chain, &order.dst_token, order.dst_amount),
            };
            let principal = match side {
                EscrowSide::Source if !self.resolver_funds_source => 0,
                _ => amount,
            };

            let adapter = self.chains.get(chain)?;
            let kind = adapter.kind();
            let deposit_asset = if kind == ChainKind::Evm && !adapter.is_native(token) {
                EVM_NATIVE_ASSET.to_string()
            } else {
                token.clone()
            };

            if principal > 0 {
                requirements.push(Requirement {
                    chain: chain.clone(),
                    asset: token.clone(),
                    side,
                    amount: principal,
                });
            }
            requirements.push(Requirement {
                chain: chain.clone(),
                asset: deposit_asset,
                side,
                amount: order.safety_deposit,
            });
        }

        Ok(requirements)
    }

    /// Compare requirements against balance minus open reservations
    pub async fn check(&self, order: &ValidatedOrder) -> ResolverResult<LiquidityReport> {
        let requirements = self.requirements(order)?;
        let reservations = self.reservations.lock().await;
        self.evaluate(&requirements, &reservations).await
    }

    /// Check and reserve atomically. Fails with `InsufficientLiquidity`
    /// without reserving anything when any chain falls short.
    pub async fn reserve(&self, order: &ValidatedOrder) -> ResolverResult<LiquidityReport> {
        let requirements = self.requirements(order)?;
        let mut reservations = self.reservations.lock().await;

        if reservations.contains_key(&order.order_hash) {
            return Err(ResolverError::DuplicateOrder {
                order_hash: order.order_hash.to_string(),
            });
        }

        let report = self.evaluate(&requirements, &reservations).await?;
        if let Some(short) = report.first_shortfall() {
            warn!(
                "Insufficient liquidity for order {} on {}: available {}, required {}",
                order.order_hash, short.chain, short.available, short.required
            );
            return Err(ResolverError::InsufficientLiquidity {
                chain: short.chain.clone(),
                available: short.available,
                required: short.required,
            });
        }

        reservations.insert(order.order_hash, requirements.clone());
        publish_reserved(&reservations, &requirements);
        debug!("Reserved liquidity for order {}", order.order_hash);
        Ok(report)
    }

    /// Drop the reservation of one side once its escrow is funded
    pub async fn commit(&self, order_hash: &OrderHash, side: EscrowSide) {
        let mut reservations = self.reservations.lock().await;
        let mut committed = Vec::new();
        if let Some(entries) = reservations.get_mut(order_hash) {
            committed = entries.iter().filter(|r| r.side == side).cloned().collect();
            entries.retain(|r| r.side != side);
            if entries.is_empty() {
                reservations.remove(order_hash);
            }
        }
        publish_reserved(&reservations, &committed);
    }

    /// Drop whatever is still reserved for an order
    pub async fn release(&self, order_hash: &OrderHash) {
        let mut reservations = self.reservations.lock().await;
        if let Some(released) = reservations.remove(order_hash) {
            info!("Released remaining liquidity reservation for order {}", order_hash);
            publish_reserved(&reservations, &released);
        }
    }

    pub async fn open_reservations(&self) -> usize {
        self.reservations.lock().await.len()
    }

    pub async fn reserved_for(&self, order_hash: &OrderHash) -> Vec<Requirement> {
        self.reservations
            .lock()
            .await
            .get(order_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Balance, reserved and available amount per configured chain and
    /// every asset that is either native or currently reserved
    pub async fn snapshot(&self) -> Vec<LiquidityEntry> {
        // Copy the totals out; balance queries must not block reservations
        let totals = {
            let reservations = self.reservations.lock().await;
            reserved_totals(&reservations)
        };

        let mut assets: BTreeMap<(String, String), u128> = BTreeMap::new();
        for info in self.chains.describe() {
            if info.configured {
                assets.insert((info.name.clone(), native_asset(info.kind).to_string()), 0);
            }
        }
        for (key, amount) in totals {
            assets.insert(key, amount);
        }

        let mut entries = Vec::new();
        for ((chain, asset), reserved) in assets {
            let Ok(adapter) = self.chains.get(&chain) else {
                continue;
            };
            let account = adapter.resolver_address();
            match self.balance(&chain, &account, &asset).await {
                Ok(balance) => {
                    crate::metrics::record_balance(&chain, &asset, balance);
                    entries.push(LiquidityEntry {
                        chain,
                        asset,
                        account,
                        balance,
                        reserved,
                        available: balance.saturating_sub(reserved),
                    });
                }
                Err(e) => warn!("Balance query for {} on {} failed: {}", asset, chain, e),
            }
        }
        entries
    }

    async fn evaluate(
        &self,
        requirements: &[Requirement],
        reservations: &HashMap<OrderHash, Vec<Requirement>>,
    ) -> ResolverResult<LiquidityReport> {
        let mut needed: BTreeMap<(String, String), u128> = BTreeMap::new();
        for r in requirements {
            let total = needed.entry((r.chain.clone(), r.asset.clone())).or_default();
            *total = total.saturating_add(r.amount);
        }
        let reserved = reserved_totals(reservations);

        let mut per_chain = Vec::new();
        for ((chain, asset), required) in needed {
            let account = self.chains.get(&chain)?.resolver_address();
            let balance = self.balance(&chain, &account, &asset).await?;
            let held = reserved.get(&(chain.clone(), asset.clone())).copied().unwrap_or(0);
            per_chain.push(ChainRequirement {
                chain,
                asset,
                required,
                available: balance.saturating_sub(held),
            });
        }

        let sufficient = per_chain.iter().all(|c| c.available >= c.required);
        Ok(LiquidityReport {
            sufficient,
            per_chain,
        })
    }

    async fn balance(&self, chain: &str, account: &str, asset: &str) -> ResolverResult<u128> {
        let adapter = self.chains.get(chain)?;
        timeout(self.call_timeout, adapter.get_balance(account, asset))
            .await
            .map_err(|_| ResolverError::Timeout {
                operation: format!("balance query on {}", chain),
            })?
    }
}

fn reserved_totals(reservations: &HashMap<OrderHash, Vec<Requirement>>) -> HashMap<(String, String), u128> {
    let mut totals = HashMap::new();
    for r in reservations.values().flatten() {
        let total: &mut u128 = totals.entry((r.chain.clone(), r.asset.clone())).or_default();
        *total = total.saturating_add(r.amount);
    }
    totals
}

/// Refresh the reserved gauge for every (chain, asset) that changed
fn publish_reserved(reservations: &HashMap<OrderHash, Vec<Requirement>>, changed: &[Requirement]) {
    let totals = reserved_totals(reservations);
    for r in changed {
        let amount = totals
            .get(&(r.chain.clone(), r.asset.clone()))
            .copied()
            .unwrap_or(0);
        crate::metrics::record_reserved(&r.chain, &r.asset, amount);
    }
}
