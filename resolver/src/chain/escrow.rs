//! Escrow immutables and timelock window arithmetic
//!
//! The core builds [`EscrowImmutables`] before creation. Only once an adapter
//! confirms creation does it hand back an [`EscrowHandle`] carrying the
//! escrow's own recorded `deployed_at`; all window math runs off that value.

use crate::coordination::commitment::Hashlock;
use crate::state::OrderHash;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Which side of the swap an escrow sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowSide {
    Source,
    Destination,
}

impl EscrowSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowSide::Source => "source",
            EscrowSide::Destination => "destination",
        }
    }
}

/// Timelock stage offsets in seconds, relative to deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timelocks {
    pub withdrawal: u64,
    pub public_withdrawal: u64,
    pub cancellation: u64,
}

impl Timelocks {
    pub fn is_strictly_increasing(&self) -> bool {
        self.withdrawal < self.public_withdrawal && self.public_withdrawal < self.cancellation
    }

    /// Pack into the uint256 layout used by the EVM escrows: one 32-bit lane
    /// per stage, deployment time in the top 32 bits.
    pub fn pack(&self, deployed_at: u64) -> U256 {
        let lane = |v: u64| U256::from(v & 0xffff_ffff);
        lane(self.withdrawal)
            | (lane(self.public_withdrawal) << 32usize)
            | (lane(self.cancellation) << 64usize)
            | (lane(deployed_at) << 224usize)
    }
}

/// Parameters an escrow is created with, minus the deployment time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowImmutables {
    pub order_hash: OrderHash,
    pub hashlock: Hashlock,
    pub maker: String,
    pub taker: String,
    pub token: String,
    #[serde(with = "crate::state::order::u128_string")]
    pub amount: u128,
    #[serde(with = "crate::state::order::u128_string")]
    pub safety_deposit: u128,
    pub timelocks: Timelocks,
}

/// A created escrow, as confirmed by its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowHandle {
    pub chain: String,
    pub side: EscrowSide,
    /// Contract address on EVM, hashlock key on the ICP canister
    pub escrow_ref: String,
    pub tx_ref: String,
    /// Deployment time recorded by the escrow itself (epoch seconds)
    pub deployed_at: u64,
    pub immutables: EscrowImmutables,
}

/// Where "now" falls relative to an escrow's withdrawal stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalWindow {
    TooEarly { opens_at: u64 },
    Private,
    Public,
    Closed,
}

impl EscrowHandle {
    pub fn withdrawal_start(&self) -> u64 {
        self.deployed_at.saturating_add(self.immutables.timelocks.withdrawal)
    }

    pub fn public_withdrawal_start(&self) -> u64 {
        self.deployed_at.saturating_add(self.immutables.timelocks.public_withdrawal)
    }

    pub fn cancellation_start(&self) -> u64 {
        self.deployed_at.saturating_add(self.immutables.timelocks.cancellation)
    }

    pub fn window_at(&self, now: u64) -> WithdrawalWindow {
        if now < self.withdrawal_start() {
            WithdrawalWindow::TooEarly {
                opens_at: self.withdrawal_start(),
            }
        } else if now >= self.cancellation_start() {
            WithdrawalWindow::Closed
        } else if now >= self.public_withdrawal_start() {
            WithdrawalWindow::Public
        } else {
            WithdrawalWindow::Private
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(deployed_at: u64) -> EscrowHandle {
        EscrowHandle {
            chain: "sepolia".into(),
            side: EscrowSide::Source,
            escrow_ref: "0xabc".into(),
            tx_ref: "0xdef".into(),
            deployed_at,
            immutables: EscrowImmutables {
                order_hash: OrderHash([1u8; 32]),
                hashlock: Hashlock([2u8; 32]),
                maker: "maker".into(),
                taker: "taker".into(),
                token: "0x0000000000000000000000000000000000000000".into(),
                amount: 1_000,
                safety_deposit: 150,
                timelocks: Timelocks {
                    withdrawal: 30,
                    public_withdrawal: 60,
                    cancellation: 43_200,
                },
            },
        }
    }

    #[test]
    fn test_window_boundaries() {
        let h = handle(1_000);
        assert_eq!(h.window_at(1_029), WithdrawalWindow::TooEarly { opens_at: 1_030 });
        assert_eq!(h.window_at(1_030), WithdrawalWindow::Private);
        assert_eq!(h.window_at(1_060), WithdrawalWindow::Public);
        assert_eq!(h.window_at(44_199), WithdrawalWindow::Public);
        assert_eq!(h.window_at(44_200), WithdrawalWindow::Closed);
    }

    #[test]
    fn test_window_saturates_at_time_limit() {
        let mut h = handle(u64::MAX - 40);
        assert_eq!(h.withdrawal_start(), u64::MAX - 10);
        assert_eq!(h.public_withdrawal_start(), u64::MAX);
        assert_eq!(h.cancellation_start(), u64::MAX);
        assert_eq!(h.window_at(u64::MAX - 1), WithdrawalWindow::Private);

        h.immutables.timelocks.withdrawal = u64::MAX;
        assert_eq!(
            h.window_at(0),
            WithdrawalWindow::TooEarly { opens_at: u64::MAX }
        );
    }

    #[test]
    fn test_pack_layout() {
        let t = Timelocks {
            withdrawal: 30,
            public_withdrawal: 60,
            cancellation: 43_200,
        };
        let packed = t.pack(1_700_000_000);
        assert_eq!(packed.low_u64() & 0xffff_ffff, 30);
        assert_eq!((packed >> 224usize).low_u64(), 1_700_000_000);
        assert_eq!((packed >> 32usize).low_u64() & 0xffff_ffff, 60);
        assert_eq!((packed >> 64usize).low_u64() & 0xffff_ffff, 43_200);
    }

    #[test]
    fn test_strict_ordering() {
        let mut t = Timelocks {
            withdrawal: 30,
            public_withdrawal: 60,
            cancellation: 90,
        };
        assert!(t.is_strictly_increasing());
        t.public_withdrawal = 30;
        assert!(!t.is_strictly_increasing());
    }
}
