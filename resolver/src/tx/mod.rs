//! EVM transaction submission with nonce management and gas pricing

mod gas;
mod nonce;
mod sender;

pub use sender::TransactionSender;
