//! Swap engine: order intake, per-order tasks and the failed-order sweep

use super::commitment::CommitmentGenerator;
use super::liquidity::{LiquidityEntry, LiquidityLedger};
use super::orchestrator::EscrowOrchestrator;
use super::scheduler::{RetryPolicy, WithdrawalScheduler};
use super::validator::{OrderRequest, OrderValidator, ValidatedOrder};
use crate::chain::ChainManager;
use crate::clock::Clock;
use crate::config::ResolverConfig;
use crate::error::{ResolverError, ResolverResult, ValidationError};
use crate::state::{
    Order, OrderFilter, OrderHash, OrderMutation, OrderStats, OrderStatus, OrderStore, SwapDirection,
    WithdrawalProgress,
};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Acknowledgement returned for an accepted order
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub order_hash: OrderHash,
    pub status: OrderStatus,
    /// Earliest epoch second at which both legs can be withdrawn
    pub estimated_completion_time: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub orders: OrderStats,
    pub running_tasks: usize,
    pub pending_timers: usize,
    pub reservations: usize,
}

/// Drives every order from submission to a terminal status
pub struct SwapEngine {
    config: ResolverConfig,
    clock: Clock,
    chains: Arc<ChainManager>,
    store: Arc<dyn OrderStore>,
    validator: OrderValidator,
    commitments: CommitmentGenerator,
    liquidity: Arc<LiquidityLedger>,
    orchestrator: Arc<EscrowOrchestrator>,
    scheduler: Arc<WithdrawalScheduler>,
    tasks: DashMap<OrderHash, JoinHandle<()>>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl SwapEngine {
    /// Create the engine. Fails only if the entropy source is unusable.
    pub fn new(
        config: ResolverConfig,
        chains: Arc<ChainManager>,
        store: Arc<dyn OrderStore>,
        clock: Clock,
    ) -> ResolverResult<Self> {
        let commitments = CommitmentGenerator::new()?;
        let call_timeout = crate::chain::call_timeout(&config);

        let validator = OrderValidator::new(
            chains.clone(),
            config.min_deadline_buffer_secs,
            config.safety_deposit_percent,
        );
        let liquidity = Arc::new(LiquidityLedger::new(
            chains.clone(),
            config.resolver_funds_source,
            call_timeout,
        ));
        let orchestrator = Arc::new(EscrowOrchestrator::new(
            chains.clone(),
            store.clone(),
            liquidity.clone(),
            call_timeout,
        ));
        let scheduler = Arc::new(WithdrawalScheduler::new(
            chains.clone(),
            store.clone(),
            clock,
            &config,
        ));

        Ok(Self {
            config,
            clock,
            chains,
            store,
            validator,
            commitments,
            liquidity,
            orchestrator,
            scheduler,
            tasks: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.scheduler.retry_policy()
    }

    /// Validate, reserve liquidity, record and start processing an order
    pub async fn submit(&self, request: OrderRequest) -> ResolverResult<SubmitReceipt> {
        let result = self.accept(request).await;
        if let Err(e) = &result {
            crate::metrics::record_order_rejected(e.kind());
            debug!("Order rejected: {}", e);
        }
        result
    }

    async fn accept(&self, request: OrderRequest) -> ResolverResult<SubmitReceipt> {
        let now = self.clock.now_secs();
        let validated = self.validator.validate(&request, now)?;
        let order_hash = validated.order_hash;

        if self.store.contains(&order_hash).await {
            return Err(ResolverError::DuplicateOrder {
                order_hash: order_hash.to_string(),
            });
        }

        let estimated_completion_time = now
            .checked_add(validated.timelocks.withdrawal)
            .and_then(|t| t.checked_add(self.config.withdrawal_buffer_secs))
            .ok_or_else(|| ValidationError::Format {
                field: "timelocks".to_string(),
                message: "withdrawal window ends past the representable time range".to_string(),
            })?;

        // A reservation doubles as the in-flight claim on the order hash
        self.liquidity.reserve(&validated).await?;
        let order = self.new_order(validated);
        let direction = order.direction;

        if let Err(e) = self.store.insert(order).await {
            self.liquidity.release(&order_hash).await;
            return Err(e);
        }

        crate::metrics::record_order_submitted(match direction {
            SwapDirection::IcpToEvm => "icp_to_evm",
            SwapDirection::EvmToIcp => "evm_to_icp",
        });
        info!("Order {} accepted ({:?})", order_hash, direction);

        self.spawn(order_hash);

        Ok(SubmitReceipt {
            order_hash,
            status: OrderStatus::Processing,
            estimated_completion_time,
        })
    }

    fn new_order(&self, validated: ValidatedOrder) -> Order {
        let commitment = self.commitments.generate();
        Order {
            order_hash: validated.order_hash,
            direction: validated.direction,
            src_chain: validated.src_chain,
            dst_chain: validated.dst_chain,
            src_token: validated.src_token,
            dst_token: validated.dst_token,
            src_amount: validated.src_amount,
            dst_amount: validated.dst_amount,
            deadline: validated.deadline,
            timelocks: validated.timelocks,
            addresses: validated.addresses,
            secret: commitment.secret,
            hashlock: commitment.hashlock,
            safety_deposit: validated.safety_deposit,
            status: OrderStatus::Processing,
            steps: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            source_escrow: None,
            destination_escrow: None,
            withdrawals: WithdrawalProgress::default(),
        }
    }

    /// One task per order: create escrows, then wait and withdraw
    fn spawn(&self, order_hash: OrderHash) {
        let orchestrator = self.orchestrator.clone();
        let scheduler = self.scheduler.clone();
        let liquidity = self.liquidity.clone();

        let handle = tokio::spawn(async move {
            match orchestrator.run(&order_hash).await {
                Ok(order) => scheduler.run_order(order).await,
                Err(e) => debug!("Order {} stopped before withdrawal: {}", order_hash, e),
            }
            liquidity.release(&order_hash).await;
        });
        self.tasks.insert(order_hash, handle);
    }

    pub async fn get(&self, order_hash: &OrderHash) -> ResolverResult<Order> {
        self.store
            .get(order_hash)
            .await
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })
    }

    pub async fn list(&self, filter: &OrderFilter, offset: usize, limit: usize) -> (Vec<Order>, usize) {
        self.store.list(filter, offset, limit).await
    }

    /// Operator cancellation: stop scheduling further steps for an order.
    /// Calls already sent to a chain run to completion.
    pub async fn cancel(&self, order_hash: &OrderHash) -> ResolverResult<Order> {
        let order = self.store.apply(order_hash, OrderMutation::Cancelling).await?;
        let had_timer = self.scheduler.cancel(order_hash);
        info!(
            "Order {} marked cancelling{}",
            order_hash,
            if had_timer { ", withdrawal timer stopped" } else { "" }
        );
        Ok(order)
    }

    pub async fn stats(&self) -> EngineStats {
        self.prune_tasks();
        EngineStats {
            orders: self.store.stats().await,
            running_tasks: self.tasks.len(),
            pending_timers: self.scheduler.pending_timers(),
            reservations: self.liquidity.open_reservations().await,
        }
    }

    pub async fn liquidity(&self) -> Vec<LiquidityEntry> {
        self.liquidity.snapshot().await
    }

    /// Periodic sweep loop; returns once `stop` is called
    pub async fn run(&self) -> ResolverResult<()> {
        let mut sweep_interval = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        let mut shutdown_check = interval(Duration::from_secs(1));

        info!("Swap engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = sweep_interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_check.tick() => {}
            }
        }

        info!("Swap engine stopped");
        Ok(())
    }

    /// Evict failed orders older than the retention window
    pub async fn sweep(&self) -> usize {
        let retention = chrono::Duration::seconds(self.config.failed_retention_secs as i64);
        let cutoff = Utc::now() - retention;

        let evicted = self.store.sweep_failed(cutoff).await;
        for order_hash in &evicted {
            self.liquidity.release(order_hash).await;
            if let Some((_, handle)) = self.tasks.remove(order_hash) {
                handle.abort();
            }
        }
        self.prune_tasks();

        if !evicted.is_empty() {
            info!("Swept {} failed orders", evicted.len());
        }
        evicted.len()
    }

    fn prune_tasks(&self) {
        self.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Stop the sweep loop and abort every order task
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;

        let running = self.tasks.len();
        self.tasks.retain(|order_hash, handle| {
            if !handle.is_finished() {
                warn!("Aborting task for order {}", order_hash);
                handle.abort();
            }
            false
        });
        if running > 0 {
            error!("Stopped with {} order tasks outstanding", running);
        }
    }

    /// Wait for an order's task to finish
    #[cfg(test)]
    pub async fn join(&self, order_hash: &OrderHash) {
        if let Some((_, handle)) = self.tasks.remove(order_hash) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::chain::{ChainBinding, ChainKind, EscrowSide};
    use crate::coordination::validator::tests::request;
    use crate::coordination::validator::AmountInput;
    use crate::state::{MemoryOrderStore, StepName, StepStatus};
    use tokio::time::sleep;

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        engine: SwapEngine,
        icp: Arc<FakeChain>,
        evm: Arc<FakeChain>,
    }

    fn fixture(config: ResolverConfig) -> Fixture {
        let clock = Clock::starting_at(NOW * 1_000);
        let icp = Arc::new(FakeChain::new("icp", ChainKind::Icp, clock));
        let evm = Arc::new(FakeChain::new("sepolia", ChainKind::Evm, clock));
        let chains = ChainManager::empty();
        chains.insert("icp", ChainBinding::Configured(icp.clone()));
        chains.insert("sepolia", ChainBinding::Configured(evm.clone()));
        let engine = SwapEngine::new(
            config,
            Arc::new(chains),
            Arc::new(MemoryOrderStore::new()),
            clock,
        )
        .unwrap();
        Fixture { engine, icp, evm }
    }

    fn test_config() -> ResolverConfig {
        ResolverConfig {
            withdrawal_buffer_secs: 0,
            ..Default::default()
        }
    }

    /// 10^18 wei out of sepolia, paid out in ICP
    fn large_order() -> OrderRequest {
        let mut req = request("sepolia", "icp");
        req.src_amount = AmountInput::Text("1000000000000000000".into());
        req.dst_amount = AmountInput::Text("100000000".into());
        req.taker_icp_address = Some("2vxsx-fae".into());
        req.taker_evm_address = None;
        req
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_swap() {
        let f = fixture(test_config());
        let receipt = f.engine.submit(large_order()).await.unwrap();
        assert_eq!(receipt.status, OrderStatus::Processing);
        assert_eq!(receipt.estimated_completion_time, NOW + 30);

        f.engine.join(&receipt.order_hash).await;

        let order = f.engine.get(&receipt.order_hash).await.unwrap();
        assert_eq!(order.safety_deposit, 150_000_000_000_000_000);
        assert_eq!(order.status, OrderStatus::Completed);

        let names: Vec<(StepName, StepStatus)> = order.steps.iter().map(|s| (s.name, s.status)).collect();
        assert_eq!(
            names,
            vec![
                (StepName::CreateSourceEscrow, StepStatus::Completed),
                (StepName::CreateDestinationEscrow, StepStatus::Completed),
                (StepName::ExecuteWithdrawal, StepStatus::Completed),
            ]
        );

        // Fires at deployedAt + 30, source side first
        assert_eq!(f.evm.withdraw_times(), vec![NOW + 30]);
        assert_eq!(f.icp.withdraw_times(), vec![NOW + 35]);

        let stats = f.engine.stats().await;
        assert_eq!(stats.orders.completed, 1);
        assert_eq!(stats.orders.active_set, 0);
        assert_eq!(stats.reservations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_submission_creates_one_escrow_pair() {
        let f = fixture(test_config());
        let receipt = f.engine.submit(request("icp", "sepolia")).await.unwrap();

        let err = f.engine.submit(request("icp", "sepolia")).await.unwrap_err();
        assert!(matches!(err, ResolverError::DuplicateOrder { .. }));

        f.engine.join(&receipt.order_hash).await;
        let err = f.engine.submit(request("icp", "sepolia")).await.unwrap_err();
        assert!(matches!(err, ResolverError::DuplicateOrder { .. }));

        assert_eq!(f.icp.create_count(), 1);
        assert_eq!(f.evm.create_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_liquidity_rejects_without_escrow() {
        let f = fixture(test_config());
        f.evm.set_balance(1);

        let err = f.engine.submit(request("icp", "sepolia")).await.unwrap_err();
        assert!(matches!(err, ResolverError::InsufficientLiquidity { .. }));
        assert_eq!(f.icp.create_count(), 0);
        assert_eq!(f.engine.stats().await.orders.total, 0);

        // Not recorded, so a later resubmission is allowed
        f.evm.set_balance(u128::MAX / 2);
        assert!(f.engine.submit(request("icp", "sepolia")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_processing_order() {
        let f = fixture(test_config());
        let receipt = f.engine.submit(request("icp", "sepolia")).await.unwrap();

        // Let escrow creation finish and the timer arm
        sleep(Duration::from_secs(5)).await;
        let order = f.engine.cancel(&receipt.order_hash).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelling);

        f.engine.join(&receipt.order_hash).await;
        assert!(f.icp.withdraw_times().is_empty());
        assert!(f.evm.withdraw_times().is_empty());

        // Cancelling again is an invalid transition
        assert!(matches!(
            f.engine.cancel(&receipt.order_hash).await,
            Err(ResolverError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            f.engine.cancel(&OrderHash([9u8; 32])).await,
            Err(ResolverError::OrderNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_old_failed_orders() {
        let f = fixture(ResolverConfig {
            failed_retention_secs: 0,
            ..test_config()
        });
        f.icp.fail_creates("ledger unavailable");
        let receipt = f.engine.submit(request("icp", "sepolia")).await.unwrap();
        f.engine.join(&receipt.order_hash).await;

        let order = f.engine.get(&receipt.order_hash).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(f.evm.create_count(), 0);
        assert!(f
            .engine
            .liquidity
            .reserved_for(&receipt.order_hash)
            .await
            .is_empty());

        // Wall-clock retention; zero means anything already failed is stale
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(f.engine.sweep().await, 1);
        assert!(matches!(
            f.engine.get(&receipt.order_hash).await,
            Err(ResolverError::OrderNotFound { .. })
        ));

        // The hash stays claimed after eviction
        let err = f.engine.submit(request("icp", "sepolia")).await.unwrap_err();
        assert!(matches!(err, ResolverError::DuplicateOrder { .. }));
        assert_eq!(f.icp.create_count(), 1);
        assert_eq!(f.engine.stats().await.reservations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timelocks_leave_no_reservation() {
        let f = fixture(test_config());
        let mut req = request("icp", "sepolia");
        req.timelocks = crate::chain::Timelocks {
            withdrawal: u64::MAX - 2,
            public_withdrawal: u64::MAX - 1,
            cancellation: u64::MAX,
        };
        match f.engine.submit(req).await {
            Err(ResolverError::Validation(e)) => assert_eq!(e.field(), "timelocks"),
            other => panic!("unexpected {:?}", other.map(|r| r.order_hash)),
        }
        assert_eq!(f.engine.stats().await.reservations, 0);

        // Completion estimate overflowing is rejected before anything is reserved
        let f = fixture(ResolverConfig {
            withdrawal_buffer_secs: u64::MAX,
            ..test_config()
        });
        match f.engine.submit(request("icp", "sepolia")).await {
            Err(ResolverError::Validation(e)) => assert_eq!(e.field(), "timelocks"),
            other => panic!("unexpected {:?}", other.map(|r| r.order_hash)),
        }
        assert_eq!(f.engine.stats().await.reservations, 0);
        assert_eq!(f.engine.stats().await.orders.total, 0);
        assert_eq!(f.icp.create_count(), 0);

        // Same hash is accepted once the config is sane
        let f = fixture(test_config());
        assert!(f.engine.submit(request("icp", "sepolia")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_rejection_reports_field() {
        let f = fixture(test_config());
        let mut req = request("icp", "sepolia");
        req.maker_icp_address = None;
        match f.engine.submit(req).await {
            Err(ResolverError::Validation(e)) => assert_eq!(e.field(), "makerIcpAddress"),
            other => panic!("unexpected {:?}", other.map(|r| r.order_hash)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_legs_use_resolved_addresses() {
        let f = fixture(test_config());
        let receipt = f.engine.submit(large_order()).await.unwrap();
        f.engine.join(&receipt.order_hash).await;

        let order = f.engine.get(&receipt.order_hash).await.unwrap();
        let source = order.escrow(EscrowSide::Source).unwrap();
        assert_eq!(source.chain, "sepolia");
        assert_eq!(source.immutables.maker, "0x1111111111111111111111111111111111111111");
        assert_eq!(source.immutables.taker, "0x9999999999999999999999999999999999999999");
        let destination = order.escrow(EscrowSide::Destination).unwrap();
        assert_eq!(destination.immutables.maker, "aaaaa-aa");
        assert_eq!(destination.immutables.taker, "2vxsx-fae");
    }
}
