//! Order records and the mutations applied to them

use crate::chain::escrow::{EscrowHandle, EscrowSide, Timelocks};
use crate::chain::ChainKind;
use crate::coordination::commitment::{Hashlock, Secret};
use crate::error::{ResolverError, ResolverResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Caller-supplied 32-byte order identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderHash(pub [u8; 32]);

impl OrderHash {
    /// Parse `0x`-prefixed (or bare) 64-char hex
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.strip_prefix("0x").unwrap_or(s);
        if hex_part.len() != 64 {
            return None;
        }
        let bytes = hex::decode(hex_part).ok()?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }
}

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderHash({})", self)
    }
}

impl Serialize for OrderHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Swap direction between the home ledger and an EVM chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    IcpToEvm,
    EvmToIcp,
}

impl SwapDirection {
    /// Exactly one side must be the home ledger
    pub fn from_kinds(src: ChainKind, dst: ChainKind) -> Option<Self> {
        match (src, dst) {
            (ChainKind::Icp, ChainKind::Evm) => Some(SwapDirection::IcpToEvm),
            (ChainKind::Evm, ChainKind::Icp) => Some(SwapDirection::EvmToIcp),
            _ => None,
        }
    }

    pub fn kind_of(&self, side: EscrowSide) -> ChainKind {
        match (self, side) {
            (SwapDirection::IcpToEvm, EscrowSide::Source) => ChainKind::Icp,
            (SwapDirection::IcpToEvm, EscrowSide::Destination) => ChainKind::Evm,
            (SwapDirection::EvmToIcp, EscrowSide::Source) => ChainKind::Evm,
            (SwapDirection::EvmToIcp, EscrowSide::Destination) => ChainKind::Icp,
        }
    }
}

/// Maker and taker address on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartyAddresses {
    pub maker: String,
    pub taker: String,
}

/// Per-chain address assignment resolved from the swap direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressAssignment {
    pub src: PartyAddresses,
    pub dst: PartyAddresses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Processing,
    Completed,
    Failed,
    Cancelling,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelling => "cancelling",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(OrderStatus::Processing),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            "cancelling" => Ok(OrderStatus::Cancelling),
            other => Err(format!("unknown status {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    CreateSourceEscrow,
    CreateDestinationEscrow,
    ExecuteWithdrawal,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::CreateSourceEscrow => "create_source_escrow",
            StepName::CreateDestinationEscrow => "create_destination_escrow",
            StepName::ExecuteWithdrawal => "execute_withdrawal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// Audit record of one stage of order processing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: StepName,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Transaction references of the withdrawal legs done so far
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalProgress {
    pub source_tx: Option<String>,
    pub destination_tx: Option<String>,
    pub attempts: u32,
}

impl WithdrawalProgress {
    pub fn is_done(&self, side: EscrowSide) -> bool {
        match side {
            EscrowSide::Source => self.source_tx.is_some(),
            EscrowSide::Destination => self.destination_tx.is_some(),
        }
    }
}

/// A swap order and everything recorded while driving it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_hash: OrderHash,
    pub direction: SwapDirection,
    pub src_chain: String,
    pub dst_chain: String,
    pub src_token: String,
    pub dst_token: String,
    #[serde(with = "u128_string")]
    pub src_amount: u128,
    #[serde(with = "u128_string")]
    pub dst_amount: u128,
    pub deadline: u64,
    pub timelocks: Timelocks,
    pub addresses: AddressAssignment,
    #[serde(skip)]
    pub secret: Secret,
    pub hashlock: Hashlock,
    #[serde(with = "u128_string")]
    pub safety_deposit: u128,
    pub status: OrderStatus,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub source_escrow: Option<EscrowHandle>,
    pub destination_escrow: Option<EscrowHandle>,
    pub withdrawals: WithdrawalProgress,
}

/// State changes the orchestrator and scheduler may apply to an order
#[derive(Debug, Clone)]
pub enum OrderMutation {
    StepStarted(StepName),
    StepCompleted {
        name: StepName,
        result: serde_json::Value,
    },
    StepFailed {
        name: StepName,
        error: String,
    },
    EscrowCreated(EscrowHandle),
    LegWithdrawn {
        side: EscrowSide,
        tx_ref: String,
    },
    WithdrawalAttempt,
    Completed,
    Failed {
        error: String,
    },
    Cancelling,
}

impl Order {
    pub fn chain(&self, side: EscrowSide) -> &str {
        match side {
            EscrowSide::Source => &self.src_chain,
            EscrowSide::Destination => &self.dst_chain,
        }
    }

    pub fn escrow(&self, side: EscrowSide) -> Option<&EscrowHandle> {
        match side {
            EscrowSide::Source => self.source_escrow.as_ref(),
            EscrowSide::Destination => self.destination_escrow.as_ref(),
        }
    }

    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.steps.iter().rev().find(|s| s.name == name)
    }

    /// Apply a mutation, enforcing the order lifecycle
    pub fn apply(&mut self, mutation: OrderMutation, now: DateTime<Utc>) -> ResolverResult<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(&mutation));
        }

        match mutation {
            OrderMutation::StepStarted(name) => {
                self.steps.push(Step {
                    name,
                    status: StepStatus::Pending,
                    started_at: now,
                    completed_at: None,
                    error: None,
                    result: None,
                });
            }
            OrderMutation::StepCompleted { name, result } => {
                let step = self.pending_step(name)?;
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                step.result = Some(result);
            }
            OrderMutation::StepFailed { name, error } => {
                let step = self.pending_step(name)?;
                step.status = StepStatus::Failed;
                step.completed_at = Some(now);
                step.error = Some(error);
            }
            OrderMutation::EscrowCreated(handle) => match handle.side {
                EscrowSide::Source => self.source_escrow = Some(handle),
                EscrowSide::Destination => self.destination_escrow = Some(handle),
            },
            OrderMutation::LegWithdrawn { side, tx_ref } => match side {
                EscrowSide::Source => self.withdrawals.source_tx = Some(tx_ref),
                EscrowSide::Destination => self.withdrawals.destination_tx = Some(tx_ref),
            },
            OrderMutation::WithdrawalAttempt => {
                self.withdrawals.attempts += 1;
            }
            OrderMutation::Completed => {
                if self.status != OrderStatus::Processing {
                    return Err(self.transition_error(&OrderMutation::Completed));
                }
                self.status = OrderStatus::Completed;
                self.completed_at = Some(now);
            }
            OrderMutation::Failed { error } => {
                self.status = OrderStatus::Failed;
                self.completed_at = Some(now);
                self.error = Some(error);
            }
            OrderMutation::Cancelling => {
                if self.status != OrderStatus::Processing {
                    return Err(self.transition_error(&OrderMutation::Cancelling));
                }
                self.status = OrderStatus::Cancelling;
            }
        }

        Ok(())
    }

    fn pending_step(&mut self, name: StepName) -> ResolverResult<&mut Step> {
        self.steps
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.status == StepStatus::Pending)
            .ok_or_else(|| ResolverError::InvalidStateTransition {
                from: format!("{} (no pending step)", name.as_str()),
                to: "finished".to_string(),
            })
    }

    fn transition_error(&self, mutation: &OrderMutation) -> ResolverError {
        let to = match mutation {
            OrderMutation::Completed => "completed",
            OrderMutation::Failed { .. } => "failed",
            OrderMutation::Cancelling => "cancelling",
            _ => "updated",
        };
        ResolverError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.to_string(),
        }
    }
}

/// Serialize u128 amounts as decimal strings; JSON numbers lose precision
pub mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordination::commitment::CommitmentGenerator;

    pub(crate) fn sample_order(hash_byte: u8) -> Order {
        let commitment = CommitmentGenerator::new().unwrap().generate();
        Order {
            order_hash: OrderHash([hash_byte; 32]),
            direction: SwapDirection::IcpToEvm,
            src_chain: "icp".into(),
            dst_chain: "sepolia".into(),
            src_token: "ICP".into(),
            dst_token: "0x0000000000000000000000000000000000000000".into(),
            src_amount: 1_000_000_000_000_000_000,
            dst_amount: 1_000_000_000_000_000_000,
            deadline: 4_000_000_000,
            timelocks: Timelocks {
                withdrawal: 30,
                public_withdrawal: 60,
                cancellation: 43_200,
            },
            addresses: AddressAssignment {
                src: PartyAddresses {
                    maker: "aaaaa-aa".into(),
                    taker: "2vxsx-fae".into(),
                },
                dst: PartyAddresses {
                    maker: "0x1111111111111111111111111111111111111111".into(),
                    taker: "0x2222222222222222222222222222222222222222".into(),
                },
            },
            hashlock: commitment.hashlock,
            secret: commitment.secret,
            safety_deposit: 150_000_000_000_000_000,
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

    #[test]
    fn test_order_hash_parse() {
        let hex = format!("0x{}", "ab".repeat(32));
        let hash = OrderHash::parse(&hex).unwrap();
        assert_eq!(hash.to_string(), hex);
        assert!(OrderHash::parse("0x1234").is_none());
        assert!(OrderHash::parse(&format!("0x{}", "zz".repeat(32))).is_none());
    }

    #[test]
    fn test_step_lifecycle() {
        let mut order = sample_order(1);
        let now = Utc::now();
        order
            .apply(OrderMutation::StepStarted(StepName::CreateSourceEscrow), now)
            .unwrap();
        order
            .apply(
                OrderMutation::StepCompleted {
                    name: StepName::CreateSourceEscrow,
                    result: serde_json::json!({"txRef": "0x1"}),
                },
                now,
            )
            .unwrap();
        assert_eq!(order.steps[0].status, StepStatus::Completed);

        // A finished step cannot be completed twice
        let err = order
            .apply(
                OrderMutation::StepFailed {
                    name: StepName::CreateSourceEscrow,
                    error: "late".into(),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ResolverError::InvalidStateTransition { .. }));
        assert_eq!(order.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut order = sample_order(2);
        let now = Utc::now();
        order.apply(OrderMutation::Completed, now).unwrap();
        assert!(order
            .apply(OrderMutation::Failed { error: "x".into() }, now)
            .is_err());
        assert!(order.apply(OrderMutation::Cancelling, now).is_err());
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[test]
    fn test_cancelling_only_from_processing() {
        let mut order = sample_order(3);
        let now = Utc::now();
        order.apply(OrderMutation::Cancelling, now).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelling);
        assert!(order.apply(OrderMutation::Cancelling, now).is_err());
        assert!(order.apply(OrderMutation::Completed, now).is_err());
        order
            .apply(OrderMutation::Failed { error: "operator".into() }, now)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
    }

    #[test]
    fn test_serialization_hides_secret() {
        let order = sample_order(4);
        let json = serde_json::to_value(&order).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["srcAmount"], "1000000000000000000");
        assert_eq!(json["status"], "processing");
    }
}
