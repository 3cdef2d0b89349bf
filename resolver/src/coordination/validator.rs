//! Order validation and cross-chain address resolution
//!
//! A submitted order names four counterparty addresses. Which of them are
//! required, and which chain each belongs to, follows from the swap
//! direction: a party's address on a chain is the address it receives (or
//! deposits) on that chain.

use crate::chain::{ChainKind, ChainManager, Timelocks};
use crate::error::ValidationError;
use crate::state::{AddressAssignment, OrderHash, PartyAddresses, SwapDirection};

use candid::Principal;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

lazy_static! {
    static ref ORDER_HASH: Regex = Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("static regex");
    static ref EVM_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex");
    static ref DECIMAL: Regex = Regex::new(r"^[0-9]+$").expect("static regex");
}

/// Amount as submitted: decimal string or JSON integer
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Text(String),
    Number(u64),
}

/// Raw order payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_hash: String,
    pub src_chain: String,
    pub dst_chain: String,
    pub src_token: String,
    pub dst_token: String,
    pub src_amount: AmountInput,
    pub dst_amount: AmountInput,
    pub deadline: u64,
    pub timelocks: Timelocks,
    #[serde(default)]
    pub maker_evm_address: Option<String>,
    #[serde(default)]
    pub maker_icp_address: Option<String>,
    #[serde(default)]
    pub taker_evm_address: Option<String>,
    #[serde(default)]
    pub taker_icp_address: Option<String>,
}

/// A validated order with its per-chain address assignment
#[derive(Debug, Clone)]
pub struct ValidatedOrder {
    pub order_hash: OrderHash,
    pub direction: SwapDirection,
    pub src_chain: String,
    pub dst_chain: String,
    pub src_token: String,
    pub dst_token: String,
    pub src_amount: u128,
    pub dst_amount: u128,
    pub deadline: u64,
    pub timelocks: Timelocks,
    pub addresses: AddressAssignment,
    pub safety_deposit: u128,
}

/// `floor(amount * percent / 100)` without intermediate overflow
pub fn safety_deposit(amount: u128, percent: u64) -> u128 {
    let percent = u128::from(percent);
    amount / 100 * percent + amount % 100 * percent / 100
}

pub struct OrderValidator {
    chains: Arc<ChainManager>,
    min_deadline_buffer_secs: u64,
    safety_deposit_percent: u64,
}

impl OrderValidator {
    pub fn new(chains: Arc<ChainManager>, min_deadline_buffer_secs: u64, safety_deposit_percent: u64) -> Self {
        Self {
            chains,
            min_deadline_buffer_secs,
            safety_deposit_percent,
        }
    }

    /// Validate a payload against the current time (epoch seconds)
    pub fn validate(&self, request: &OrderRequest, now: u64) -> Result<ValidatedOrder, ValidationError> {
        if !ORDER_HASH.is_match(&request.order_hash) {
            return Err(format_error("orderHash", "expected 0x-prefixed 32-byte hex"));
        }
        let order_hash = OrderHash::parse(&request.order_hash)
            .ok_or_else(|| format_error("orderHash", "expected 0x-prefixed 32-byte hex"))?;

        let direction = self.resolve_direction(&request.src_chain, &request.dst_chain)?;
        let src_kind = direction.kind_of(crate::chain::EscrowSide::Source);
        let dst_kind = direction.kind_of(crate::chain::EscrowSide::Destination);

        let src_amount = parse_amount("srcAmount", &request.src_amount, src_kind)?;
        let dst_amount = parse_amount("dstAmount", &request.dst_amount, dst_kind)?;
        check_token("srcToken", &request.src_token, src_kind)?;
        check_token("dstToken", &request.dst_token, dst_kind)?;

        let min_deadline = now.saturating_add(self.min_deadline_buffer_secs);
        if request.deadline < min_deadline {
            return Err(ValidationError::DeadlineTooSoon {
                deadline: request.deadline,
                min_deadline,
            });
        }

        check_timelocks(&request.timelocks)?;

        let addresses = self.resolve_addresses(request, direction)?;
        let safety_deposit = safety_deposit(src_amount, self.safety_deposit_percent);

        check_locked_total("srcAmount", src_amount, safety_deposit, src_kind)?;
        check_locked_total("dstAmount", dst_amount, safety_deposit, dst_kind)?;

        Ok(ValidatedOrder {
            order_hash,
            direction,
            src_chain: request.src_chain.clone(),
            dst_chain: request.dst_chain.clone(),
            src_token: request.src_token.clone(),
            dst_token: request.dst_token.clone(),
            src_amount,
            dst_amount,
            deadline: request.deadline,
            timelocks: request.timelocks,
            addresses,
            safety_deposit,
        })
    }

    fn resolve_direction(&self, src_chain: &str, dst_chain: &str) -> Result<SwapDirection, ValidationError> {
        let unsupported = || ValidationError::UnsupportedChainPair {
            src_chain: src_chain.to_string(),
            dst_chain: dst_chain.to_string(),
        };

        if src_chain == dst_chain {
            return Err(unsupported());
        }
        let src_kind = self.chains.kind_of(src_chain).ok_or_else(unsupported)?;
        let dst_kind = self.chains.kind_of(dst_chain).ok_or_else(unsupported)?;
        SwapDirection::from_kinds(src_kind, dst_kind).ok_or_else(unsupported)
    }

    fn resolve_addresses(
        &self,
        request: &OrderRequest,
        direction: SwapDirection,
    ) -> Result<AddressAssignment, ValidationError> {
        let maker_evm = required("makerEvmAddress", &request.maker_evm_address, ChainKind::Evm)?;
        let maker_icp = required("makerIcpAddress", &request.maker_icp_address, ChainKind::Icp)?;

        // The taker deposits on the destination chain, so that address is
        // mandatory; on the source chain the resolver itself receives.
        let (src_chain, src_kind, dst_kind) = match direction {
            SwapDirection::IcpToEvm => (&request.src_chain, ChainKind::Icp, ChainKind::Evm),
            SwapDirection::EvmToIcp => (&request.src_chain, ChainKind::Evm, ChainKind::Icp),
        };
        let (taker_src_field, taker_src_input, taker_dst_field, taker_dst_input) = match direction {
            SwapDirection::IcpToEvm => (
                "takerIcpAddress",
                &request.taker_icp_address,
                "takerEvmAddress",
                &request.taker_evm_address,
            ),
            SwapDirection::EvmToIcp => (
                "takerEvmAddress",
                &request.taker_evm_address,
                "takerIcpAddress",
                &request.taker_icp_address,
            ),
        };

        let taker_dst = required(taker_dst_field, taker_dst_input, dst_kind)?;
        let taker_src = match taker_src_input {
            Some(address) => {
                check_address(taker_src_field, address, src_kind)?;
                address.clone()
            }
            None => self.chains.resolver_address(src_chain).ok_or_else(|| {
                ValidationError::MissingAddress {
                    field: taker_src_field.to_string(),
                }
            })?,
        };

        let (maker_src, maker_dst) = match direction {
            SwapDirection::IcpToEvm => (maker_icp, maker_evm),
            SwapDirection::EvmToIcp => (maker_evm, maker_icp),
        };

        Ok(AddressAssignment {
            src: PartyAddresses {
                maker: maker_src,
                taker: taker_src,
            },
            dst: PartyAddresses {
                maker: maker_dst,
                taker: taker_dst,
            },
        })
    }
}

fn format_error(field: &str, message: &str) -> ValidationError {
    ValidationError::Format {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn parse_amount(field: &str, input: &AmountInput, kind: ChainKind) -> Result<u128, ValidationError> {
    let amount = match input {
        AmountInput::Number(n) => u128::from(*n),
        AmountInput::Text(s) => {
            if !DECIMAL.is_match(s) {
                return Err(format_error(field, "expected a non-negative decimal integer"));
            }
            s.parse::<u128>()
                .map_err(|_| format_error(field, "amount out of range"))?
        }
    };

    if kind == ChainKind::Icp && u64::try_from(amount).is_err() {
        return Err(format_error(field, "amount exceeds u64 e8s"));
    }
    Ok(amount)
}

fn check_token(field: &str, token: &str, kind: ChainKind) -> Result<(), ValidationError> {
    let valid = match kind {
        ChainKind::Evm => EVM_ADDRESS.is_match(token),
        ChainKind::Icp => {
            token.is_empty() || token.eq_ignore_ascii_case("ICP") || Principal::from_text(token).is_ok()
        }
    };
    if valid {
        Ok(())
    } else {
        Err(format_error(field, &format!("not a valid {} token", kind.as_str())))
    }
}

/// Amount plus deposit must fit what the escrow on that chain can hold
fn check_locked_total(
    field: &str,
    amount: u128,
    safety_deposit: u128,
    kind: ChainKind,
) -> Result<(), ValidationError> {
    let total = amount
        .checked_add(safety_deposit)
        .ok_or_else(|| format_error(field, "amount plus safety deposit overflows"))?;
    if kind == ChainKind::Icp && u64::try_from(total).is_err() {
        return Err(format_error(field, "amount plus safety deposit exceeds u64 e8s"));
    }
    Ok(())
}

fn check_timelocks(timelocks: &Timelocks) -> Result<(), ValidationError> {
    if timelocks.withdrawal >= timelocks.public_withdrawal {
        return Err(ValidationError::TimelockOrdering {
            message: format!(
                "withdrawal ({}) must be before publicWithdrawal ({})",
                timelocks.withdrawal, timelocks.public_withdrawal
            ),
        });
    }
    if timelocks.public_withdrawal >= timelocks.cancellation {
        return Err(ValidationError::TimelockOrdering {
            message: format!(
                "publicWithdrawal ({}) must be before cancellation ({})",
                timelocks.public_withdrawal, timelocks.cancellation
            ),
        });
    }
    // Escrows pack each lane into 32 bits
    if timelocks.cancellation > u64::from(u32::MAX) {
        return Err(format_error(
            "timelocks",
            &format!("cancellation ({}) exceeds {} seconds", timelocks.cancellation, u32::MAX),
        ));
    }
    Ok(())
}

fn check_address(field: &str, address: &str, kind: ChainKind) -> Result<(), ValidationError> {
    let valid = match kind {
        ChainKind::Evm => EVM_ADDRESS.is_match(address),
        ChainKind::Icp => Principal::from_text(address).is_ok(),
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::MalformedAddress {
            field: field.to_string(),
            chain_kind: kind.as_str().to_string(),
        })
    }
}

fn required(field: &str, input: &Option<String>, kind: ChainKind) -> Result<String, ValidationError> {
    match input.as_deref().map(str::trim) {
        Some(address) if !address.is_empty() => {
            check_address(field, address, kind)?;
            Ok(address.to_string())
        }
        _ => Err(ValidationError::MissingAddress {
            field: field.to_string(),
        }),
    }
}
