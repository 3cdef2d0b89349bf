//! Swap coordination core
//!
//! The coordination engine:
//! 1. Generates a secret and hashlock per order
//! 2. Validates orders and resolves which address belongs to which chain
//! 3. Reserves the resolver's liquidity on both chains
//! 4. Creates the source escrow, then the destination escrow
//! 5. Waits out the withdrawal timelock and withdraws both legs

pub mod commitment;
pub mod engine;
pub mod liquidity;
pub mod orchestrator;
pub mod scheduler;
pub mod validator;

pub use engine::{EngineStats, SubmitReceipt, SwapEngine};
pub use liquidity::{LiquidityEntry, LiquidityLedger, LiquidityReport};
pub use scheduler::{Backoff, RetryPolicy};
pub use validator::{OrderRequest, ValidatedOrder};
