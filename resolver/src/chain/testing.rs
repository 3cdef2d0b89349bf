//! In-process ledger used by coordination tests
//!
//! Escrows are stamped with the shared clock at creation and enforce the
//! hashlock and the withdrawal window the way the on-chain escrows do.

use super::{ChainAdapter, ChainKind, EscrowHandle, EscrowImmutables, EscrowSide, WithdrawalWindow};
use crate::clock::Clock;
use crate::coordination::commitment::{verify, Hashlock, Secret};
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::Mutex;
use std::time::Duration;

/// A call observed by the fake, with the clock time it was issued at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    CreateSource { at: u64 },
    CreateDestination { at: u64 },
    Withdraw { escrow_ref: String, at: u64 },
}

struct FakeEscrow {
    handle: EscrowHandle,
    withdrawn: bool,
}

pub struct FakeChain {
    name: String,
    kind: ChainKind,
    clock: Clock,
    balance: Mutex<u128>,
    escrows: Mutex<HashMap<String, FakeEscrow>>,
    calls: Mutex<Vec<FakeCall>>,
    create_failure: Mutex<Option<String>>,
    withdraw_failures: Mutex<VecDeque<ResolverError>>,
    hang_creates: Mutex<bool>,
    hung_withdrawals: Mutex<usize>,
    balance_delay: Mutex<Duration>,
}

impl FakeChain {
    pub fn new(name: &str, kind: ChainKind, clock: Clock) -> Self {
        Self {
            name: name.to_string(),
            kind,
            clock,
            balance: Mutex::new(u128::MAX / 2),
            escrows: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            create_failure: Mutex::new(None),
            withdraw_failures: Mutex::new(VecDeque::new()),
            hang_creates: Mutex::new(false),
            hung_withdrawals: Mutex::new(0),
            balance_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_balance(&self, balance: u128) {
        *self.balance.lock().unwrap() = balance;
    }

    /// Make every escrow creation fail with a chain-call error
    pub fn fail_creates(&self, message: &str) {
        *self.create_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Fail the next withdrawal calls with the given errors, in order
    pub fn fail_next_withdrawals(&self, errors: Vec<ResolverError>) {
        self.withdraw_failures.lock().unwrap().extend(errors);
    }

    /// Escrow creations are recorded and then never answer
    pub fn hang_creates(&self) {
        *self.hang_creates.lock().unwrap() = true;
    }

    /// The next `count` withdrawals are recorded and then never answer
    pub fn hang_next_withdrawals(&self, count: usize) {
        *self.hung_withdrawals.lock().unwrap() += count;
    }

    /// Balance queries answer only after `delay`
    pub fn delay_balances(&self, delay: Duration) {
        *self.balance_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn withdraw_times(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FakeCall::Withdraw { at, .. } => Some(at),
                _ => None,
            })
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !matches!(c, FakeCall::Withdraw { .. }))
            .count()
    }

    pub fn is_withdrawn(&self, hashlock: &Hashlock) -> bool {
        self.escrows
            .lock()
            .unwrap()
            .values()
            .any(|e| e.handle.immutables.hashlock == *hashlock && e.withdrawn)
    }

    async fn create(&self, side: EscrowSide, immutables: &EscrowImmutables) -> ResolverResult<EscrowHandle> {
        let at = self.clock.now_secs();
        self.calls.lock().unwrap().push(match side {
            EscrowSide::Source => FakeCall::CreateSource { at },
            EscrowSide::Destination => FakeCall::CreateDestination { at },
        });

        let hang = *self.hang_creates.lock().unwrap();
        if hang {
            pending::<()>().await;
        }

        if let Some(message) = self.create_failure.lock().unwrap().clone() {
            return Err(ResolverError::chain_call(&self.name, message));
        }

        let escrow_ref = format!("{}-{}-{}", self.name, side.as_str(), immutables.hashlock);
        let mut escrows = self.escrows.lock().unwrap();
        if escrows.contains_key(&escrow_ref) {
            return Err(ResolverError::chain_call(&self.name, "DuplicateEscrow"));
        }

        let handle = EscrowHandle {
            chain: self.name.clone(),
            side,
            escrow_ref: escrow_ref.clone(),
            tx_ref: format!("tx-create-{}", escrow_ref),
            deployed_at: at,
            immutables: immutables.clone(),
        };
        escrows.insert(
            escrow_ref,
            FakeEscrow {
                handle: handle.clone(),
                withdrawn: false,
            },
        );
        Ok(handle)
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn kind(&self) -> ChainKind {
        self.kind
    }

    fn chain_name(&self) -> String {
        self.name.clone()
    }

    fn resolver_address(&self) -> String {
        match self.kind {
            ChainKind::Evm => "0x9999999999999999999999999999999999999999".to_string(),
            ChainKind::Icp => "2vxsx-fae".to_string(),
        }
    }

    fn is_native(&self, token: &str) -> bool {
        match self.kind {
            ChainKind::Evm => token == "0x0000000000000000000000000000000000000000",
            ChainKind::Icp => token.is_empty() || token == "ICP",
        }
    }

    async fn create_source_escrow(
        &self,
        immutables: &EscrowImmutables,
    ) -> ResolverResult<EscrowHandle> {
        self.create(EscrowSide::Source, immutables).await
    }

    async fn create_destination_escrow(
        &self,
        immutables: &EscrowImmutables,
        _src_cancellation_at: u64,
    ) -> ResolverResult<EscrowHandle> {
        self.create(EscrowSide::Destination, immutables).await
    }

    async fn withdraw(&self, escrow: &EscrowHandle, secret: &Secret) -> ResolverResult<String> {
        let now = self.clock.now_secs();
        self.calls.lock().unwrap().push(FakeCall::Withdraw {
            escrow_ref: escrow.escrow_ref.clone(),
            at: now,
        });

        let hang = {
            let mut hung = self.hung_withdrawals.lock().unwrap();
            let hang = *hung > 0;
            if hang {
                *hung -= 1;
            }
            hang
        };
        if hang {
            pending::<()>().await;
        }

        if let Some(err) = self.withdraw_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut escrows = self.escrows.lock().unwrap();
        let stored = escrows
            .get_mut(&escrow.escrow_ref)
            .ok_or_else(|| ResolverError::chain_call(&self.name, "EscrowNotFound"))?;

        if !verify(secret, &stored.handle.immutables.hashlock) {
            return Err(ResolverError::chain_call(&self.name, "InvalidSecret"));
        }
        if stored.withdrawn {
            return Err(ResolverError::chain_call(&self.name, "InvalidState"));
        }
        match stored.handle.window_at(now) {
            WithdrawalWindow::Private | WithdrawalWindow::Public => {}
            window => return Err(ResolverError::timing(&self.name, format!("InvalidTime ({:?})", window))),
        }

        stored.withdrawn = true;
        Ok(format!("tx-withdraw-{}", escrow.escrow_ref))
    }

    async fn get_balance(&self, _account: &str, _asset: &str) -> ResolverResult<u128> {
        let delay = *self.balance_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(*self.balance.lock().unwrap())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
