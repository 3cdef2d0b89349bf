//! Internet Computer escrow-canister adapter
//!
//! The canister keys escrows by hashlock and pulls deposits from the caller
//! through an ICRC-2 allowance, so every creation is preceded by an approve
//! on the asset's ledger. The canister stamps `deployed_at` in nanoseconds;
//! it is read back after creation and converted to seconds.

use super::escrow::{EscrowHandle, EscrowImmutables, EscrowSide};
use super::{call_timeout, ChainAdapter, ChainKind};
use crate::config::{IcpChainConfig, ResolverConfig};
use crate::coordination::commitment::Secret;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use candid::{CandidType, Decode, Deserialize, Encode, Nat, Principal};
use ic_agent::identity::BasicIdentity;
use ic_agent::Agent;
use serde_bytes::ByteBuf;
use tracing::{debug, info};

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(CandidType, Deserialize, Clone, Debug)]
struct CanisterTimelocks {
    withdrawal: u64,
    public_withdrawal: u64,
    cancellation: u64,
    deployed_at: u64,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
struct CanisterImmutables {
    #[serde(with = "serde_bytes")]
    order_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    hashlock: Vec<u8>,
    maker: String,
    taker: String,
    token: String,
    amount: u64,
    safety_deposit: u64,
    timelocks: CanisterTimelocks,
}

#[derive(CandidType, Deserialize, Clone, Debug, PartialEq)]
enum CanisterEscrowState {
    Active,
    Completed,
    Cancelled,
    Rescued,
}

/// Subset of the canister's escrow record this adapter reads
#[derive(CandidType, Deserialize, Clone, Debug)]
struct CanisterEscrow {
    immutables: CanisterImmutables,
    state: CanisterEscrowState,
    created_at: u64,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
enum CanisterError {
    InvalidCaller,
    InvalidSecret,
    InvalidTime,
    InvalidAmount,
    InvalidState,
    EscrowNotFound,
    TransferFailed,
    Unauthorized,
    InvalidHashlock,
    InsufficientBalance,
    InvalidAddress,
    DuplicateEscrow,
    ConfigError,
    CanisterCallError,
    CanisterCallSuccLedgerError,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
struct Account {
    owner: Principal,
    subaccount: Option<ByteBuf>,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
struct ApproveArgs {
    from_subaccount: Option<ByteBuf>,
    spender: Account,
    amount: Nat,
    expected_allowance: Option<Nat>,
    expires_at: Option<u64>,
    fee: Option<Nat>,
    memo: Option<ByteBuf>,
    created_at_time: Option<u64>,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
enum ApproveError {
    BadFee { expected_fee: Nat },
    InsufficientFunds { balance: Nat },
    AllowanceChanged { current_allowance: Nat },
    Expired { ledger_time: u64 },
    TooOld,
    CreatedInFuture { ledger_time: u64 },
    Duplicate { duplicate_of: Nat },
    TemporarilyUnavailable,
    GenericError { error_code: Nat, message: String },
}

fn nat_to_u128(chain: &str, value: &Nat) -> ResolverResult<u128> {
    value
        .0
        .to_string()
        .parse::<u128>()
        .map_err(|e| ResolverError::chain_call(chain, format!("amount {} out of range: {}", value, e)))
}

fn to_e8s(chain: &str, field: &str, value: u128) -> ResolverResult<u64> {
    u64::try_from(value)
        .map_err(|_| ResolverError::chain_call(chain, format!("{} {} exceeds u64", field, value)))
}

/// Canister rejections: only the timing check is distinguished
fn map_canister_error(chain: &str, error: CanisterError) -> ResolverError {
    match error {
        CanisterError::InvalidTime => ResolverError::timing(chain, "InvalidTime"),
        other => ResolverError::chain_call(chain, format!("{:?}", other)),
    }
}

/// Round nanoseconds up to whole seconds so window starts are never early
fn nanos_to_secs(nanos: u64) -> u64 {
    nanos / NANOS_PER_SEC + u64::from(nanos % NANOS_PER_SEC != 0)
}

/// Adapter for the Internet Computer escrow canister
pub struct IcpChainAdapter {
    name: String,
    agent: Agent,
    escrow_canister: Principal,
    ledger_canister: Principal,
    resolver_principal: Principal,
    creation_fee_e8s: u64,
    transfer_fee_e8s: u64,
}

impl IcpChainAdapter {
    pub async fn connect(
        name: &str,
        config: &IcpChainConfig,
        resolver: &ResolverConfig,
    ) -> ResolverResult<Self> {
        if config.escrow_canister.is_empty() {
            return Err(ResolverError::Config("no escrow canister configured".to_string()));
        }
        let escrow_canister = Principal::from_text(&config.escrow_canister)
            .map_err(|e| ResolverError::Config(format!("invalid escrow canister: {}", e)))?;
        let ledger_canister = Principal::from_text(&config.ledger_canister)
            .map_err(|e| ResolverError::Config(format!("invalid ledger canister: {}", e)))?;

        // Anonymous callers are neither maker nor taker to the canister
        let pem = config
            .identity_pem
            .as_ref()
            .ok_or_else(|| ResolverError::Config("no identity_pem configured".to_string()))?;
        let identity = BasicIdentity::from_pem_file(pem)
            .map_err(|e| ResolverError::Config(format!("cannot load identity {}: {}", pem, e)))?;

        let agent = Agent::builder()
            .with_url(config.replica_url.clone())
            .with_identity(identity)
            .with_ingress_expiry(Some(call_timeout(resolver)))
            .build()
            .map_err(|e| ResolverError::Config(format!("agent: {}", e)))?;

        if config.fetch_root_key {
            agent
                .fetch_root_key()
                .await
                .map_err(|e| ResolverError::chain_call(name, format!("fetch_root_key: {}", e)))?;
        }

        let resolver_principal = agent
            .get_principal()
            .map_err(|e| ResolverError::Config(format!("identity principal: {}", e)))?;

        info!(
            "ICP chain {} bound to escrow canister {} as {}",
            name, escrow_canister, resolver_principal
        );

        Ok(Self {
            name: name.to_string(),
            agent,
            escrow_canister,
            ledger_canister,
            resolver_principal,
            creation_fee_e8s: config.creation_fee_e8s,
            transfer_fee_e8s: config.transfer_fee_e8s,
        })
    }

    fn ledger_for(&self, token: &str) -> ResolverResult<Principal> {
        if self.is_native(token) {
            return Ok(self.ledger_canister);
        }
        Principal::from_text(token)
            .map_err(|e| ResolverError::chain_call(&self.name, format!("invalid ledger {}: {}", token, e)))
    }

    fn canister_immutables(&self, immutables: &EscrowImmutables) -> ResolverResult<CanisterImmutables> {
        Ok(CanisterImmutables {
            order_hash: immutables.order_hash.0.to_vec(),
            hashlock: immutables.hashlock.0.to_vec(),
            maker: immutables.maker.clone(),
            taker: immutables.taker.clone(),
            token: immutables.token.clone(),
            amount: to_e8s(&self.name, "amount", immutables.amount)?,
            safety_deposit: to_e8s(&self.name, "safety deposit", immutables.safety_deposit)?,
            timelocks: CanisterTimelocks {
                withdrawal: immutables.timelocks.withdrawal,
                public_withdrawal: immutables.timelocks.public_withdrawal,
                cancellation: immutables.timelocks.cancellation,
                deployed_at: 0,
            },
        })
    }

    async fn update<R>(&self, canister: &Principal, method: &str, arg: Vec<u8>) -> ResolverResult<R>
    where
        R: CandidType + for<'de> Deserialize<'de>,
    {
        let response = self
            .agent
            .update(canister, method)
            .with_arg(arg)
            .call_and_wait()
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, format!("{}: {}", method, e)))?;
        Decode!(&response, R)
            .map_err(|e| ResolverError::chain_call(&self.name, format!("{} reply: {}", method, e)))
    }

    async fn query<R>(&self, canister: &Principal, method: &str, arg: Vec<u8>) -> ResolverResult<R>
    where
        R: CandidType + for<'de> Deserialize<'de>,
    {
        let response = self
            .agent
            .query(canister, method)
            .with_arg(arg)
            .call()
            .await
            .map_err(|e| ResolverError::chain_call(&self.name, format!("{}: {}", method, e)))?;
        Decode!(&response, R)
            .map_err(|e| ResolverError::chain_call(&self.name, format!("{} reply: {}", method, e)))
    }

    fn encode<T: CandidType>(&self, value: &T) -> ResolverResult<Vec<u8>> {
        Encode!(value).map_err(|e| ResolverError::Internal(format!("candid encode: {}", e)))
    }

    /// Allow the escrow canister to pull principal, deposit and fees
    async fn approve(&self, ledger: Principal, amount: u128) -> ResolverResult<()> {
        let args = ApproveArgs {
            from_subaccount: None,
            spender: Account {
                owner: self.escrow_canister,
                subaccount: None,
            },
            amount: Nat::from(amount),
            expected_allowance: None,
            expires_at: None,
            fee: None,
            memo: None,
            created_at_time: None,
        };
        let arg = self.encode(&args)?;
        let result: Result<Nat, ApproveError> = self.update(&ledger, "icrc2_approve", arg).await?;
        match result {
            Ok(block) => {
                debug!("Approved {} on ledger {} at block {}", amount, ledger, block);
                Ok(())
            }
            Err(e) => Err(ResolverError::chain_call(&self.name, format!("icrc2_approve: {:?}", e))),
        }
    }

    async fn create(&self, side: EscrowSide, immutables: &EscrowImmutables) -> ResolverResult<EscrowHandle> {
        let ledger = self.ledger_for(&immutables.token)?;
        let allowance = immutables.amount
            + immutables.safety_deposit
            + u128::from(self.creation_fee_e8s)
            + 2 * u128::from(self.transfer_fee_e8s);
        self.approve(ledger, allowance).await?;

        let method = match side {
            EscrowSide::Source => "create_src_escrow",
            EscrowSide::Destination => "create_dst_escrow",
        };
        let arg = self.encode(&self.canister_immutables(immutables)?)?;
        let result: Result<Vec<u8>, CanisterError> =
            self.update(&self.escrow_canister, method, arg).await?;
        let key = result.map_err(|e| map_canister_error(&self.name, e))?;

        let escrow = self.get_escrow(&key).await?.ok_or_else(|| {
            ResolverError::chain_call(&self.name, format!("escrow 0x{} missing after create", hex::encode(&key)))
        })?;
        let deployed_at = nanos_to_secs(escrow.immutables.timelocks.deployed_at);

        Ok(EscrowHandle {
            chain: self.name.clone(),
            side,
            escrow_ref: format!("0x{}", hex::encode(&key)),
            tx_ref: format!("{}:{}", method, escrow.created_at),
            deployed_at,
            immutables: immutables.clone(),
        })
    }

    async fn get_escrow(&self, hashlock: &[u8]) -> ResolverResult<Option<CanisterEscrow>> {
        let arg = self.encode(&ByteBuf::from(hashlock.to_vec()))?;
        self.query(&self.escrow_canister, "get_escrow", arg).await
    }
}

#[async_trait]
impl ChainAdapter for IcpChainAdapter {
    fn kind(&self) -> ChainKind {
        ChainKind::Icp
    }

    fn chain_name(&self) -> String {
        self.name.clone()
    }

    fn resolver_address(&self) -> String {
        self.resolver_principal.to_text()
    }

    fn is_native(&self, token: &str) -> bool {
        token.is_empty() || token.eq_ignore_ascii_case("ICP") || token == self.ledger_canister.to_text()
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
        let method = match escrow.side {
            EscrowSide::Source => "withdraw_src",
            EscrowSide::Destination => "withdraw_dst",
        };
        let secret_arg = ByteBuf::from(secret.as_bytes().to_vec());
        let hashlock_arg = ByteBuf::from(escrow.immutables.hashlock.0.to_vec());
        let arg = Encode!(&secret_arg, &hashlock_arg)
            .map_err(|e| ResolverError::Internal(format!("candid encode: {}", e)))?;

        let result: Result<(), CanisterError> = self.update(&self.escrow_canister, method, arg).await?;
        result.map_err(|e| map_canister_error(&self.name, e))?;

        let record = self.get_escrow(escrow.immutables.hashlock.as_bytes()).await?;
        match record {
            Some(e) if e.state == CanisterEscrowState::Completed => {
                Ok(format!("{}:{}", method, escrow.escrow_ref))
            }
            Some(e) => Err(ResolverError::chain_call(
                &self.name,
                format!("escrow still {:?} after {}", e.state, method),
            )),
            None => Err(ResolverError::chain_call(&self.name, "EscrowNotFound")),
        }
    }

    async fn get_balance(&self, account: &str, asset: &str) -> ResolverResult<u128> {
        let owner = Principal::from_text(account)
            .map_err(|e| ResolverError::chain_call(&self.name, format!("invalid principal {}: {}", account, e)))?;
        let ledger = self.ledger_for(asset)?;
        let arg = self.encode(&Account {
            owner,
            subaccount: None,
        })?;
        let balance: Nat = self.query(&ledger, "icrc1_balance_of", arg).await?;
        nat_to_u128(&self.name, &balance)
    }

    async fn health_check(&self) -> bool {
        self.agent.status().await.is_ok()
    }
}
