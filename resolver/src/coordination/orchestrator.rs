//! Escrow orchestration: source escrow first, then destination
//!
//! Each creation is recorded as a step on the order. A failed source step
//! aborts before anything is locked on the destination chain. A failed
//! destination step leaves the funded source escrow to its own cancellation
//! timelock; nothing is rolled back here.

use super::liquidity::LiquidityLedger;
use crate::chain::{ChainManager, EscrowHandle, EscrowImmutables, EscrowSide};
use crate::error::{ResolverError, ResolverResult};
use crate::state::{Order, OrderHash, OrderMutation, OrderStatus, OrderStore, StepName};

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub struct EscrowOrchestrator {
    chains: Arc<ChainManager>,
    store: Arc<dyn OrderStore>,
    liquidity: Arc<LiquidityLedger>,
    call_timeout: Duration,
}

impl EscrowOrchestrator {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn OrderStore>,
        liquidity: Arc<LiquidityLedger>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            chains,
            store,
            liquidity,
            call_timeout,
        }
    }

    /// Create both escrows. On success the returned order carries both
    /// handles and is ready for withdrawal scheduling. Any error has already
    /// been recorded on the order.
    pub async fn run(&self, order_hash: &OrderHash) -> ResolverResult<Order> {
        let order = self.load_processing(order_hash, StepName::CreateSourceEscrow).await?;

        let source = match self.create(&order, EscrowSide::Source, 0).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.abort(order_hash, e).await),
        };
        self.liquidity.commit(order_hash, EscrowSide::Source).await;

        let order = self
            .load_processing(order_hash, StepName::CreateDestinationEscrow)
            .await?;
        let destination = match self
            .create(&order, EscrowSide::Destination, source.cancellation_start())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "Destination escrow for order {} failed after source {} was funded; source refunds after {}",
                    order_hash,
                    source.escrow_ref,
                    source.cancellation_start()
                );
                return Err(self.abort(order_hash, e).await);
            }
        };
        self.liquidity.commit(order_hash, EscrowSide::Destination).await;

        info!(
            "Order {} escrows ready: source {} on {}, destination {} on {}",
            order_hash, source.escrow_ref, source.chain, destination.escrow_ref, destination.chain
        );

        self.store
            .get(order_hash)
            .await
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })
    }

    /// Fetch the order and make sure nobody cancelled it in the meantime
    async fn load_processing(&self, order_hash: &OrderHash, next: StepName) -> ResolverResult<Order> {
        let order = self
            .store
            .get(order_hash)
            .await
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;

        if order.status != OrderStatus::Processing {
            info!(
                "Order {} is {}, not starting {}",
                order_hash,
                order.status.as_str(),
                next.as_str()
            );
            self.liquidity.release(order_hash).await;
            return Err(ResolverError::InvalidStateTransition {
                from: order.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        Ok(order)
    }

    async fn create(
        &self,
        order: &Order,
        side: EscrowSide,
        src_cancellation_at: u64,
    ) -> ResolverResult<EscrowHandle> {
        let step = match side {
            EscrowSide::Source => StepName::CreateSourceEscrow,
            EscrowSide::Destination => StepName::CreateDestinationEscrow,
        };
        let chain = order.chain(side).to_string();
        let immutables = immutables_for(order, side);

        self.store
            .apply(&order.order_hash, OrderMutation::StepStarted(step))
            .await?;
        debug!("Order {}: {} on {}", order.order_hash, step.as_str(), chain);

        let outcome = self.call_adapter(&chain, side, &immutables, src_cancellation_at).await;

        match outcome {
            Ok(handle) => {
                self.store
                    .apply(&order.order_hash, OrderMutation::EscrowCreated(handle.clone()))
                    .await?;
                self.store
                    .apply(
                        &order.order_hash,
                        OrderMutation::StepCompleted {
                            name: step,
                            result: json!({
                                "chain": handle.chain,
                                "txRef": handle.tx_ref,
                                "escrowRef": handle.escrow_ref,
                                "deployedAt": handle.deployed_at,
                            }),
                        },
                    )
                    .await?;
                crate::metrics::record_step(step.as_str(), true);
                info!(
                    "Order {}: {} completed ({} at {})",
                    order.order_hash,
                    step.as_str(),
                    handle.escrow_ref,
                    handle.deployed_at
                );
                Ok(handle)
            }
            Err(e) => {
                crate::metrics::record_step(step.as_str(), false);
                warn!("Order {}: {} failed: {}", order.order_hash, step.as_str(), e);
                self.store
                    .apply(
                        &order.order_hash,
                        OrderMutation::StepFailed {
                            name: step,
                            error: e.to_string(),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn call_adapter(
        &self,
        chain: &str,
        side: EscrowSide,
        immutables: &EscrowImmutables,
        src_cancellation_at: u64,
    ) -> ResolverResult<EscrowHandle> {
        let adapter = self.chains.get(chain)?;
        let call = async {
            match side {
                EscrowSide::Source => adapter.create_source_escrow(immutables).await,
                EscrowSide::Destination => {
                    adapter
                        .create_destination_escrow(immutables, src_cancellation_at)
                        .await
                }
            }
        };

        timeout(self.call_timeout, call)
            .await
            .map_err(|_| ResolverError::Timeout {
                operation: format!("create {} escrow on {}", side.as_str(), chain),
            })?
    }

    /// Record the failure on the order and free what is still reserved
    async fn abort(&self, order_hash: &OrderHash, cause: ResolverError) -> ResolverError {
        self.liquidity.release(order_hash).await;

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
                error!("Order {} failed during escrow creation: {}", order_hash, cause);
            }
            Err(e) => warn!("Could not mark order {} failed: {}", order_hash, e),
        }
        cause
    }
}

/// Escrow parameters for one side of an order
pub fn immutables_for(order: &Order, side: EscrowSide) -> EscrowImmutables {
    let (parties, token, amount) = match side {
        EscrowSide::Source => (&order.addresses.src, &order.src_token, order.src_amount),
        EscrowSide::Destination => (&order.addresses.dst, &order.dst_token, order.dst_amount),
    };
    EscrowImmutables {
        order_hash: order.order_hash,
        hashlock: order.hashlock,
        maker: parties.maker.clone(),
        taker: parties.taker.clone(),
        token: token.clone(),
        amount,
        safety_deposit: order.safety_deposit,
        timelocks: order.timelocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeCall, FakeChain};
    use crate::chain::{ChainBinding, ChainKind};
    use crate::clock::Clock;
    use crate::state::order::tests::sample_order;
    use crate::state::{MemoryOrderStore, StepStatus};

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        orchestrator: EscrowOrchestrator,
        store: Arc<MemoryOrderStore>,
        icp: Arc<FakeChain>,
        evm: Arc<FakeChain>,
    }

    fn fixture() -> Fixture {
        let clock = Clock::starting_at(NOW * 1_000);
        let icp = Arc::new(FakeChain::new("icp", ChainKind::Icp, clock));
        let evm = Arc::new(FakeChain::new("sepolia", ChainKind::Evm, clock));
        let chains = ChainManager::empty();
        chains.insert("icp", ChainBinding::Configured(icp.clone()));
        chains.insert("sepolia", ChainBinding::Configured(evm.clone()));
        let chains = Arc::new(chains);
        let store = Arc::new(MemoryOrderStore::new());
        let liquidity = Arc::new(LiquidityLedger::new(chains.clone(), true, Duration::from_secs(5)));
        Fixture {
            orchestrator: EscrowOrchestrator::new(chains, store.clone(), liquidity, Duration::from_secs(5)),
            store,
            icp,
            evm,
        }
    }

    #[tokio::test]
    async fn test_creates_source_then_destination() {
        let f = fixture();
        let order = sample_order(1);
        let hash = order.order_hash;
        f.store.insert(order).await.unwrap();

        let ready = f.orchestrator.run(&hash).await.unwrap();
        assert_eq!(ready.status, OrderStatus::Processing);
        assert_eq!(ready.steps.len(), 2);
        assert_eq!(ready.steps[0].name, StepName::CreateSourceEscrow);
        assert_eq!(ready.steps[1].name, StepName::CreateDestinationEscrow);
        assert!(ready.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(ready.steps[0].result.as_ref().unwrap()["chain"], "icp");

        let source = ready.source_escrow.unwrap();
        assert_eq!(source.deployed_at, NOW);
        assert_eq!(source.immutables.maker, "aaaaa-aa");
        let destination = ready.destination_escrow.unwrap();
        assert_eq!(destination.immutables.taker, "0x2222222222222222222222222222222222222222");
        assert_eq!(destination.immutables.hashlock, source.immutables.hashlock);

        assert_eq!(f.icp.calls(), vec![FakeCall::CreateSource { at: NOW }]);
        assert_eq!(f.evm.calls(), vec![FakeCall::CreateDestination { at: NOW }]);
    }

    #[tokio::test]
    async fn test_source_failure_skips_destination() {
        let f = fixture();
        f.icp.fail_creates("InsufficientBalance");
        let order = sample_order(2);
        let hash = order.order_hash;
        f.store.insert(order).await.unwrap();

        let err = f.orchestrator.run(&hash).await.unwrap_err();
        assert!(matches!(err, ResolverError::ChainCall { .. }));
        assert_eq!(f.evm.create_count(), 0);

        let order = f.store.get(&hash).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.steps.len(), 1);
        assert_eq!(order.steps[0].status, StepStatus::Failed);
        assert!(order.error.unwrap().contains("InsufficientBalance"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_create_times_out_without_retry() {
        let f = fixture();
        f.icp.hang_creates();
        let order = sample_order(6);
        let hash = order.order_hash;
        f.store.insert(order).await.unwrap();

        let err = f.orchestrator.run(&hash).await.unwrap_err();
        assert!(matches!(err, ResolverError::Timeout { .. }));
        assert_eq!(f.icp.create_count(), 1);
        assert_eq!(f.evm.create_count(), 0);

        let order = f.store.get(&hash).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.steps.len(), 1);
        assert_eq!(order.steps[0].status, StepStatus::Failed);
        assert!(order.error.unwrap().contains("create source escrow on icp"));
    }

    #[tokio::test]
    async fn test_destination_failure_keeps_source_handle() {
        let f = fixture();
        f.evm.fail_creates("execution reverted");
        let order = sample_order(3);
        let hash = order.order_hash;
        f.store.insert(order).await.unwrap();

        f.orchestrator.run(&hash).await.unwrap_err();
        let order = f.store.get(&hash).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.source_escrow.is_some());
        assert!(order.destination_escrow.is_none());
        assert_eq!(order.steps[0].status, StepStatus::Completed);
        assert_eq!(order.steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_order_not_started() {
        let f = fixture();
        let order = sample_order(4);
        let hash = order.order_hash;
        f.store.insert(order).await.unwrap();
        f.store.apply(&hash, OrderMutation::Cancelling).await.unwrap();

        assert!(f.orchestrator.run(&hash).await.is_err());
        assert_eq!(f.icp.create_count(), 0);
        assert_eq!(f.store.get(&hash).await.unwrap().status, OrderStatus::Cancelling);
    }

    #[tokio::test]
    async fn test_unconfigured_chain_recorded_as_step_failure() {
        let clock = Clock::starting_at(NOW * 1_000);
        let chains = ChainManager::empty();
        chains.insert(
            "icp",
            ChainBinding::Unconfigured {
                kind: ChainKind::Icp,
                reason: "identity_pem not set".into(),
            },
        );
        chains.insert(
            "sepolia",
            ChainBinding::Configured(Arc::new(FakeChain::new("sepolia", ChainKind::Evm, clock))),
        );
        let chains = Arc::new(chains);
        let store = Arc::new(MemoryOrderStore::new());
        let liquidity = Arc::new(LiquidityLedger::new(chains.clone(), true, Duration::from_secs(5)));
        let orchestrator = EscrowOrchestrator::new(chains, store.clone(), liquidity, Duration::from_secs(5));

        let order = sample_order(5);
        let hash = order.order_hash;
        store.insert(order).await.unwrap();

        let err = orchestrator.run(&hash).await.unwrap_err();
        assert!(matches!(err, ResolverError::ChainNotConfigured { .. }));
        let order = store.get(&hash).await.unwrap();
        assert_eq!(order.steps[0].status, StepStatus::Failed);
        assert_eq!(order.status, OrderStatus::Failed);
    }
}
