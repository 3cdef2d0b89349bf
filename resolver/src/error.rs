//! Error types for the swap resolver

use thiserror::Error;

/// Rejections raised while validating a submitted order.
///
/// Every variant names the offending field so API callers can point at it.
/// None of these are ever retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid format for {field}: {message}")]
    Format { field: String, message: String },

    #[error("Unsupported chain pair {src_chain} -> {dst_chain}")]
    UnsupportedChainPair { src_chain: String, dst_chain: String },

    #[error("Deadline {deadline} is too soon, must be at least {min_deadline}")]
    DeadlineTooSoon { deadline: u64, min_deadline: u64 },

    #[error("Timelocks must be strictly increasing: {message}")]
    TimelockOrdering { message: String },

    #[error("Missing required address {field}")]
    MissingAddress { field: String },

    #[error("Address in {field} is not a valid {chain_kind} address")]
    MalformedAddress { field: String, chain_kind: String },
}

impl ValidationError {
    /// Field the rejection refers to
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Format { field, .. } => field,
            ValidationError::UnsupportedChainPair { .. } => "srcChain/dstChain",
            ValidationError::DeadlineTooSoon { .. } => "deadline",
            ValidationError::TimelockOrdering { .. } => "timelocks",
            ValidationError::MissingAddress { field } => field,
            ValidationError::MalformedAddress { field, .. } => field,
        }
    }

    /// Short machine-readable kind, used for metrics labels and API bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Format { .. } => "format",
            ValidationError::UnsupportedChainPair { .. } => "unsupported_chain_pair",
            ValidationError::DeadlineTooSoon { .. } => "deadline_too_soon",
            ValidationError::TimelockOrdering { .. } => "timelock_ordering",
            ValidationError::MissingAddress { .. } => "missing_required_address",
            ValidationError::MalformedAddress { .. } => "malformed_address_for_chain",
        }
    }
}

/// Main error type for the resolver
#[derive(Error, Debug, Clone)]
pub enum ResolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Order {order_hash} already submitted")]
    DuplicateOrder { order_hash: String },

    #[error("Order {order_hash} not found")]
    OrderNotFound { order_hash: String },

    #[error("Insufficient liquidity on {chain}: available {available}, required {required}")]
    InsufficientLiquidity {
        chain: String,
        available: u128,
        required: u128,
    },

    #[error("Chain call failed on {chain}: {message}")]
    ChainCall { chain: String, message: String },

    #[error("Escrow on {chain} rejected call outside its window: {message}")]
    Timing { chain: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain} is not configured: {reason}")]
    ChainNotConfigured { chain: String, reason: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Label used by metrics and API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ResolverError::Config(_) => "config",
            ResolverError::Validation(e) => e.kind(),
            ResolverError::DuplicateOrder { .. } => "duplicate_order",
            ResolverError::OrderNotFound { .. } => "order_not_found",
            ResolverError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            ResolverError::ChainCall { .. } => "chain_call",
            ResolverError::Timing { .. } => "timing",
            ResolverError::Timeout { .. } => "timeout",
            ResolverError::ChainNotConfigured { .. } => "chain_not_configured",
            ResolverError::InvalidStateTransition { .. } => "invalid_state_transition",
            ResolverError::Internal(_) => "internal",
        }
    }

    pub fn chain_call(chain: impl Into<String>, message: impl ToString) -> Self {
        ResolverError::ChainCall {
            chain: chain.into(),
            message: message.to_string(),
        }
    }

    pub fn timing(chain: impl Into<String>, message: impl ToString) -> Self {
        ResolverError::Timing {
            chain: chain.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;
