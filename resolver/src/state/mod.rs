//! Order state
//!
//! Handles:
//! - Order records, steps and the lifecycle transitions between them
//! - The registry all coordination components read and mutate

pub mod order;
mod registry;

pub use order::{
    AddressAssignment, Order, OrderHash, OrderMutation, OrderStatus, PartyAddresses, Step,
    StepName, StepStatus, SwapDirection, WithdrawalProgress,
};
pub use registry::{MemoryOrderStore, OrderFilter, OrderStats, OrderStore};
