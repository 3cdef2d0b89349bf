//! Timelock-gated withdrawal with bounded retry
//!
//! One timer per order, armed once both escrows exist. It fires after the
//! later of the two escrows' withdrawal starts (plus a small buffer), then
//! withdraws both legs in policy order. A failed attempt is retried after a
//! delay from the `RetryPolicy`; a retry resumes at the first leg not yet
//! withdrawn.

use crate::chain::{ChainKind, ChainManager, EscrowHandle, EscrowSide, WithdrawalWindow};
use crate::clock::Clock;
use crate::config::{ResolverConfig, RetryBackoff, WithdrawalOrder};
use crate::error::{ResolverError, ResolverResult};
use crate::state::{Order, OrderHash, OrderMutation, OrderStatus, OrderStore, StepName, SwapDirection};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, factor: u32 },
}

/// How many times a failed withdrawal is retried and how long to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolverConfig) -> Self {
        let base = Duration::from_secs(config.retry_delay_secs);
        let backoff = match config.retry_backoff {
            RetryBackoff::Fixed => Backoff::Fixed(base),
            RetryBackoff::Exponential => Backoff::Exponential { base, factor: 2 },
        };
        Self {
            max_retries: config.max_retries,
            backoff,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, factor } => {
                let exponent = retry.saturating_sub(1);
                let multiplier = factor.checked_pow(exponent).unwrap_or(u32::MAX);
                base.saturating_mul(multiplier)
            }
        }
    }

    /// Whether another retry is allowed after `retries_done` retries
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// Legs in the order they are withdrawn
pub fn leg_order(direction: SwapDirection, policy: WithdrawalOrder) -> [EscrowSide; 2] {
    let source_first = [EscrowSide::Source, EscrowSide::Destination];
    let destination_first = [EscrowSide::Destination, EscrowSide::Source];
    let source_is_evm = direction.kind_of(EscrowSide::Source) == ChainKind::Evm;

    match policy {
        WithdrawalOrder::SourceFirst => source_first,
        WithdrawalOrder::EvmFirst if source_is_evm => source_first,
        WithdrawalOrder::EvmFirst => destination_first,
        WithdrawalOrder::HomeFirst if source_is_evm => destination_first,
        WithdrawalOrder::HomeFirst => source_first,
    }
}

pub struct WithdrawalScheduler {
    chains: Arc<ChainManager>,
    store: Arc<dyn OrderStore>,
    clock: Clock,
    retry: RetryPolicy,
    order_policy: WithdrawalOrder,
    withdrawal_buffer_secs: u64,
    settle_delay: Duration,
    call_timeout: Duration,
    timers: DashMap<OrderHash, Arc<Notify>>,
}

impl WithdrawalScheduler {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn OrderStore>,
        clock: Clock,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            chains,
            store,
            clock,
            retry: RetryPolicy::from_config(config),
            order_policy: config.withdrawal_order,
            withdrawal_buffer_secs: config.withdrawal_buffer_secs,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            call_timeout: crate::chain::call_timeout(config),
            timers: DashMap::new(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Epoch second the timer fires at: the later withdrawal start of the
    /// two escrows plus the buffer
    pub fn fire_at(&self, order: &Order) -> ResolverResult<u64> {
        let source = escrow_of(order, EscrowSide::Source)?;
        let destination = escrow_of(order, EscrowSide::Destination)?;
        Ok(source
            .withdrawal_start()
            .max(destination.withdrawal_start())
            .saturating_add(self.withdrawal_buffer_secs))
    }

    /// Wake a pending timer so its order is skipped. Returns whether a
    /// timer was registered for the order.
    pub fn cancel(&self, order_hash: &OrderHash) -> bool {
        match self.timers.get(order_hash) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Wait out the timelock, then withdraw with retries until the order
    /// completes or fails
    pub async fn run_order(&self, order: Order) {
        let order_hash = order.order_hash;
        self.timers.insert(order_hash, Arc::new(Notify::new()));
        self.drive(order).await;
        self.timers.remove(&order_hash);
    }

    async fn drive(&self, order: Order) {
        let order_hash = order.order_hash;

        let fire_at = match self.fire_at(&order) {
            Ok(at) => at,
            Err(e) => {
                self.fail(&order_hash, &e).await;
                return;
            }
        };
        info!(
            "Withdrawal for order {} scheduled at {} (in {}s)",
            order_hash,
            fire_at,
            fire_at.saturating_sub(self.clock.now_secs())
        );
        if !self.wait_until(&order_hash, fire_at).await {
            info!("Withdrawal timer for order {} cancelled", order_hash);
            return;
        }

        let mut retries = 0u32;
        loop {
            let order = match self.current(&order_hash).await {
                Some(order) => order,
                None => return,
            };

            match self.attempt(&order).await {
                Ok(()) => {
                    self.complete(&order_hash).await;
                    return;
                }
                Err(e) if self.retry.allows(retries) => {
                    retries += 1;
                    let delay = self.retry.delay_for(retries);
                    crate::metrics::record_withdrawal_retry(e.kind());
                    warn!(
                        "Withdrawal for order {} failed ({}), retry {}/{} in {:?}",
                        order_hash, e, retries, self.retry.max_retries, delay
                    );
                    if !self.wait_for(&order_hash, delay).await {
                        info!("Withdrawal retry for order {} cancelled", order_hash);
                        return;
                    }
                }
                Err(e) => {
                    self.fail(&order_hash, &e).await;
                    return;
                }
            }
        }
    }

    /// The order, if it is still processing
    async fn current(&self, order_hash: &OrderHash) -> Option<Order> {
        match self.store.get(order_hash).await {
            Some(order) if order.status == OrderStatus::Processing => Some(order),
            Some(order) => {
                info!(
                    "Order {} is {}, skipping withdrawal",
                    order_hash,
                    order.status.as_str()
                );
                None
            }
            None => {
                warn!("Order {} vanished before withdrawal", order_hash);
                None
            }
        }
    }

    /// One withdrawal attempt, recorded as its own step
    async fn attempt(&self, order: &Order) -> ResolverResult<()> {
        let order_hash = order.order_hash;
        self.store.apply(&order_hash, OrderMutation::WithdrawalAttempt).await?;
        self.store
            .apply(&order_hash, OrderMutation::StepStarted(StepName::ExecuteWithdrawal))
            .await?;

        match self.withdraw_legs(order).await {
            Ok(()) => {
                let order = self.store.get(&order_hash).await.unwrap_or_else(|| order.clone());
                self.store
                    .apply(
                        &order_hash,
                        OrderMutation::StepCompleted {
                            name: StepName::ExecuteWithdrawal,
                            result: json!({
                                "sourceTx": order.withdrawals.source_tx,
                                "destinationTx": order.withdrawals.destination_tx,
                                "attempt": order.withdrawals.attempts,
                            }),
                        },
                    )
                    .await?;
                crate::metrics::record_step(StepName::ExecuteWithdrawal.as_str(), true);
                Ok(())
            }
            Err(e) => {
                crate::metrics::record_step(StepName::ExecuteWithdrawal.as_str(), false);
                self.store
                    .apply(
                        &order_hash,
                        OrderMutation::StepFailed {
                            name: StepName::ExecuteWithdrawal,
                            error: e.to_string(),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn withdraw_legs(&self, order: &Order) -> ResolverResult<()> {
        let mut withdrew_this_attempt = false;

        for side in leg_order(order.direction, self.order_policy) {
            if order.withdrawals.is_done(side) {
                debug!("Order {}: {} leg already withdrawn", order.order_hash, side.as_str());
                continue;
            }
            if withdrew_this_attempt {
                sleep(self.settle_delay).await;
            }

            let escrow = escrow_of(order, side)?;
            self.ensure_window(escrow).await?;

            let adapter = self.chains.get(&escrow.chain)?;
            let tx_ref = timeout(self.call_timeout, adapter.withdraw(escrow, &order.secret))
                .await
                .map_err(|_| ResolverError::Timeout {
                    operation: format!("withdraw {} escrow on {}", side.as_str(), escrow.chain),
                })??;

            self.store
                .apply(
                    &order.order_hash,
                    OrderMutation::LegWithdrawn {
                        side,
                        tx_ref: tx_ref.clone(),
                    },
                )
                .await?;
            info!(
                "Order {}: {} escrow {} withdrawn ({})",
                order.order_hash,
                side.as_str(),
                escrow.escrow_ref,
                tx_ref
            );
            withdrew_this_attempt = true;
        }

        Ok(())
    }

    /// Wait if the escrow's window has not opened yet; refuse once it closed
    async fn ensure_window(&self, escrow: &EscrowHandle) -> ResolverResult<()> {
        match escrow.window_at(self.clock.now_secs()) {
            WithdrawalWindow::Private | WithdrawalWindow::Public => Ok(()),
            WithdrawalWindow::TooEarly { opens_at } => {
                debug!("Escrow {} opens at {}, waiting", escrow.escrow_ref, opens_at);
                self.sleep_until(opens_at).await;
                Ok(())
            }
            WithdrawalWindow::Closed => Err(ResolverError::timing(
                &escrow.chain,
                format!(
                    "escrow {} reached cancellation at {}",
                    escrow.escrow_ref,
                    escrow.cancellation_start()
                ),
            )),
        }
    }

    async fn complete(&self, order_hash: &OrderHash) {
        match self.store.apply(order_hash, OrderMutation::Completed).await {
            Ok(order) => {
                let latency = (Utc::now() - order.created_at).num_milliseconds().max(0) as f64 / 1_000.0;
                crate::metrics::record_order_completed(
                    match order.direction {
                        SwapDirection::IcpToEvm => "icp_to_evm",
                        SwapDirection::EvmToIcp => "evm_to_icp",
                    },
                    latency,
                );
                info!("Order {} completed", order_hash);
            }
            Err(e) => warn!("Could not mark order {} completed: {}", order_hash, e),
        }
    }

    async fn fail(&self, order_hash: &OrderHash, cause: &ResolverError) {
        match self
            .store
            .apply(
                order_hash,
                OrderMutation::Failed {
                    error: cause.to_string(),
                },
            )
            .await
        {
            Ok(_) => {
                crate::metrics::record_order_failed();
                error!("Order {} failed during withdrawal: {}", order_hash, cause);
            }
            Err(e) => warn!("Could not mark order {} failed: {}", order_hash, e),
        }
    }

    async fn sleep_until(&self, epoch_secs: u64) {
        let delay_ms = epoch_secs.saturating_mul(1_000).saturating_sub(self.clock.now_millis());
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Sleep until `epoch_secs` unless cancelled; true when the time came
    async fn wait_until(&self, order_hash: &OrderHash, epoch_secs: u64) -> bool {
        let delay_ms = epoch_secs.saturating_mul(1_000).saturating_sub(self.clock.now_millis());
        self.wait_for(order_hash, Duration::from_millis(delay_ms)).await
    }

    async fn wait_for(&self, order_hash: &OrderHash, delay: Duration) -> bool {
        let notify = match self.timers.get(order_hash) {
            Some(n) => n.clone(),
            None => return true,
        };
        tokio::select! {
            _ = sleep(delay) => true,
            _ = notify.notified() => false,
        }
    }
}

fn escrow_of(order: &Order, side: EscrowSide) -> ResolverResult<&EscrowHandle> {
    order.escrow(side).ok_or_else(|| {
        ResolverError::Internal(format!(
            "order {} has no {} escrow",
            order.order_hash,
            side.as_str()
        ))
    })
}
