//! EVM escrow-factory adapter
//!
//! Escrows are deployed by a factory contract. Calls are ABI-encoded by hand
//! against the factory's function signatures; the created escrow's address
//! is read from the factory's creation event and its deployment time from
//! the mined block.

use super::escrow::{EscrowHandle, EscrowImmutables, EscrowSide};
use super::provider::EvmProvider;
use super::{call_timeout, ChainAdapter, ChainKind};
use crate::config::{EvmChainConfig, ResolverConfig};
use crate::coordination::commitment::Secret;
use crate::error::{ResolverError, ResolverResult};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use tracing::{debug, info, warn};

const IMMUTABLES: &str = "(bytes32,bytes32,address,address,address,uint256,uint256,uint256)";

/// First four bytes of the keccak256 of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(args));
    data.into()
}

fn parse_address(chain: &str, field: &str, value: &str) -> ResolverResult<Address> {
    value
        .parse::<Address>()
        .map_err(|e| ResolverError::chain_call(chain, format!("invalid {} address {}: {}", field, value, e)))
}

/// Immutables tuple as the escrow contracts hash it
fn immutables_token(
    chain: &str,
    immutables: &EscrowImmutables,
    deployed_at: u64,
) -> ResolverResult<Token> {
    Ok(Token::Tuple(vec![
        Token::FixedBytes(immutables.order_hash.0.to_vec()),
        Token::FixedBytes(immutables.hashlock.0.to_vec()),
        Token::Address(parse_address(chain, "maker", &immutables.maker)?),
        Token::Address(parse_address(chain, "taker", &immutables.taker)?),
        Token::Address(parse_address(chain, "token", &immutables.token)?),
        Token::Uint(U256::from(immutables.amount)),
        Token::Uint(U256::from(immutables.safety_deposit)),
        Token::Uint(immutables.timelocks.pack(deployed_at)),
    ]))
}

fn creation_event(side: EscrowSide) -> &'static str {
    match side {
        EscrowSide::Source => "SrcEscrowCreated(address,bytes32)",
        EscrowSide::Destination => "DstEscrowCreated(address,bytes32)",
    }
}

/// Find the escrow address in a factory creation event
fn escrow_address_from_logs(logs: &[Log], factory: Address, side: EscrowSide) -> Option<Address> {
    let topic = event_topic(creation_event(side));
    logs.iter()
        .filter(|log| log.address == factory && log.topics.first() == Some(&topic))
        .find_map(|log| match log.topics.get(1) {
            Some(indexed) => Some(Address::from_slice(&indexed.0[12..32])),
            None if log.data.len() >= 32 => Some(Address::from_slice(&log.data[12..32])),
            None => None,
        })
}

fn u256_to_u128(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.as_u128()
    }
}

/// Adapter for an EVM chain with a deployed escrow factory
pub struct EvmChainAdapter {
    name: String,
    provider: Arc<EvmProvider>,
    sender: TransactionSender,
    factory: Address,
}

impl EvmChainAdapter {
    pub async fn connect(
        name: &str,
        config: &EvmChainConfig,
        resolver: &ResolverConfig,
    ) -> ResolverResult<Self> {
        if config.escrow_factory.is_empty() {
            return Err(ResolverError::Config("no escrow factory configured".to_string()));
        }
        let factory = config
            .escrow_factory
            .parse::<Address>()
            .map_err(|e| ResolverError::Config(format!("invalid escrow factory: {}", e)))?;

        let wallet = TransactionSender::load_wallet(&config.private_key_env)?;
        let provider = Arc::new(EvmProvider::new(name, config.clone())?);
        let sender = TransactionSender::new(provider.clone(), wallet, call_timeout(resolver)).await?;

        info!(
            "EVM chain {} (id {}) bound to factory {:#x}",
            name,
            provider.chain_id(),
            factory
        );

        Ok(Self {
            name: name.to_string(),
            provider,
            sender,
            factory,
        })
    }

    /// Ask the factory where the escrow will land. Advisory only: the
    /// factory stamps its own deployment time, so the receipt is authoritative.
    async fn predict_address(&self, side: EscrowSide, immutables: &EscrowImmutables) -> Option<Address> {
        let head = self.provider.get_block_number().await.ok()?;
        let timestamp = self.provider.get_block_timestamp(U64::from(head)).await.ok()?;
        let signature = match side {
            EscrowSide::Source => format!("addressOfEscrowSrc({})", IMMUTABLES),
            EscrowSide::Destination => format!("addressOfEscrowDst({})", IMMUTABLES),
        };
        let args = [immutables_token(&self.name, immutables, timestamp).ok()?];
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.factory)
            .data(encode_call(&signature, &args))
            .into();

        let output = self.provider.call(&tx).await.ok()?;
        abi::decode(&[ParamType::Address], &output)
            .ok()?
            .into_iter()
            .next()?
            .into_address()
    }

    /// Approve the factory to pull an ERC-20 amount
    async fn approve(&self, token: Address, amount: U256) -> ResolverResult<()> {
        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(self.factory), Token::Uint(amount)],
        );
        let receipt = self.sender.send(token, data, U256::zero()).await?;
        debug!(
            "Approved {} of {:#x} for factory on {} in {:#x}",
            amount, token, self.name, receipt.transaction_hash
        );
        Ok(())
    }

    async fn create(
        &self,
        side: EscrowSide,
        immutables: &EscrowImmutables,
        src_cancellation_at: Option<u64>,
    ) -> ResolverResult<EscrowHandle> {
        let predicted = self.predict_address(side, immutables).await;

        let amount = U256::from(immutables.amount);
        let deposit = U256::from(immutables.safety_deposit);
        let value = if self.is_native(&immutables.token) {
            amount + deposit
        } else {
            let token = parse_address(&self.name, "token", &immutables.token)?;
            self.approve(token, amount).await?;
            deposit
        };

        // Factory fills in the deployment time itself
        let tuple = immutables_token(&self.name, immutables, 0)?;
        let data = match src_cancellation_at {
            None => encode_call(&format!("createSrcEscrow({})", IMMUTABLES), &[tuple]),
            Some(at) => encode_call(
                &format!("createDstEscrow({},uint256)", IMMUTABLES),
                &[tuple, Token::Uint(U256::from(at))],
            ),
        };

        let receipt = self.sender.send(self.factory, data, value).await?;

        let escrow = escrow_address_from_logs(&receipt.logs, self.factory, side).ok_or_else(|| {
            ResolverError::chain_call(
                &self.name,
                format!("no {} in receipt {:#x}", creation_event(side), receipt.transaction_hash),
            )
        })?;
        let block = receipt
            .block_number
            .ok_or_else(|| ResolverError::chain_call(&self.name, "receipt without block number"))?;
        let deployed_at = self.provider.get_block_timestamp(block).await?;

        match predicted {
            Some(p) if p != escrow => warn!(
                "Predicted {} escrow {:#x} differs from created {:#x} on {}",
                side.as_str(),
                p,
                escrow,
                self.name
            ),
            Some(_) => debug!("Escrow {:#x} matches prediction", escrow),
            None => debug!("No address prediction available on {}", self.name),
        }

        Ok(EscrowHandle {
            chain: self.name.clone(),
            side,
            escrow_ref: format!("{:#x}", escrow),
            tx_ref: format!("{:#x}", receipt.transaction_hash),
            deployed_at,
            immutables: immutables.clone(),
        })
    }
}

#[async_trait]
impl ChainAdapter for EvmChainAdapter {
    fn kind(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn chain_name(&self) -> String {
        self.name.clone()
    }

    fn resolver_address(&self) -> String {
        format!("{:#x}", self.sender.wallet_address())
    }

    fn is_native(&self, token: &str) -> bool {
        token.is_empty() || token.parse::<Address>().map(|a| a.is_zero()).unwrap_or(false)
    }

    async fn create_source_escrow(
        &self,
        immutables: &EscrowImmutables,
    ) -> ResolverResult<EscrowHandle> {
        self.create(EscrowSide::Source, immutables, None).await
    }

    async fn create_destination_escrow(
        &self,
        immutables: &EscrowImmutables,
        src_cancellation_at: u64,
    ) -> ResolverResult<EscrowHandle> {
        self.create(EscrowSide::Destination, immutables, Some(src_cancellation_at))
            .await
    }

    async fn withdraw(&self, escrow: &EscrowHandle, secret: &Secret) -> ResolverResult<String> {
        let address = parse_address(&self.name, "escrow", &escrow.escrow_ref)?;
        let data = encode_call(
            &format!("withdraw(bytes32,{})", IMMUTABLES),
            &[
                Token::FixedBytes(secret.as_bytes().to_vec()),
                immutables_token(&self.name, &escrow.immutables, escrow.deployed_at)?,
            ],
        );
        let receipt = self.sender.send(address, data, U256::zero()).await?;
        Ok(format!("{:#x}", receipt.transaction_hash))
    }

    async fn get_balance(&self, account: &str, asset: &str) -> ResolverResult<u128> {
        let account = parse_address(&self.name, "account", account)?;
        if self.is_native(asset) {
            return Ok(u256_to_u128(self.provider.get_balance(account).await?));
        }

        let token = parse_address(&self.name, "token", asset)?;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(token)
            .data(encode_call("balanceOf(address)", &[Token::Address(account)]))
            .into();
        let output = self.provider.call(&tx).await?;
        let balance = abi::decode(&[ParamType::Uint(256)], &output)
            .ok()
            .and_then(|t| t.into_iter().next())
            .and_then(|t| t.into_uint())
            .ok_or_else(|| ResolverError::chain_call(&self.name, "malformed balanceOf output"))?;
        Ok(u256_to_u128(balance))
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::escrow::Timelocks;
    use crate::coordination::commitment::Hashlock;
    use crate::state::OrderHash;

    fn immutables() -> EscrowImmutables {
        EscrowImmutables {
            order_hash: OrderHash([1u8; 32]),
            hashlock: Hashlock([2u8; 32]),
            maker: "0x1111111111111111111111111111111111111111".into(),
            taker: "0x2222222222222222222222222222222222222222".into(),
            token: "0x0000000000000000000000000000000000000000".into(),
            amount: 1_000_000_000_000_000_000,
            safety_deposit: 150_000_000_000_000_000,
            timelocks: Timelocks {
                withdrawal: 30,
                public_withdrawal: 60,
                cancellation: 43_200,
            },
        }
    }

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector("approve(address,uint256)")), "095ea7b3");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_create_calldata_layout() {
        let tuple = immutables_token("sepolia", &immutables(), 0).unwrap();
        let data = encode_call(&format!("createSrcEscrow({})", IMMUTABLES), &[tuple]);
        // Static tuple of eight words
        assert_eq!(data.len(), 4 + 8 * 32);
        assert_eq!(&data[4..36], &[1u8; 32]);
        assert_eq!(&data[36..68], &[2u8; 32]);
        // Last word is the packed timelocks
        let packed = U256::from_big_endian(&data[4 + 7 * 32..]);
        assert_eq!(packed, immutables().timelocks.pack(0));
    }

    #[test]
    fn test_rejects_malformed_party_address() {
        let mut bad = immutables();
        bad.taker = "2vxsx-fae".into();
        assert!(matches!(
            immutables_token("sepolia", &bad, 0),
            Err(ResolverError::ChainCall { .. })
        ));
    }

    #[test]
    fn test_escrow_address_from_logs() {
        let factory = Address::repeat_byte(0xfa);
        let escrow = Address::repeat_byte(0xe5);
        let mut indexed = [0u8; 32];
        indexed[12..].copy_from_slice(escrow.as_bytes());

        let log = Log {
            address: factory,
            topics: vec![
                event_topic("DstEscrowCreated(address,bytes32)"),
                H256::from(indexed),
            ],
            ..Default::default()
        };

        assert_eq!(
            escrow_address_from_logs(&[log.clone()], factory, EscrowSide::Destination),
            Some(escrow)
        );
        // Wrong event or wrong emitter is ignored
        assert_eq!(escrow_address_from_logs(&[log.clone()], factory, EscrowSide::Source), None);
        assert_eq!(
            escrow_address_from_logs(&[log], Address::zero(), EscrowSide::Destination),
            None
        );
    }

    #[test]
    fn test_u256_saturates() {
        assert_eq!(u256_to_u128(U256::from(42u64)), 42);
        assert_eq!(u256_to_u128(U256::MAX), u128::MAX);
    }
}
