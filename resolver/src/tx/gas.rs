//! Gas estimation with safety buffers

use crate::chain::{EvmProvider, GasPrice};
use crate::error::ResolverResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for escrow transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Node estimate plus the limit buffer
    pub async fn estimate_gas_limit(
        &self,
        provider: &EvmProvider,
        tx: &TypedTransaction,
    ) -> ResolverResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.buffer_limit(estimate))
    }

    fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for the chain
    pub async fn get_gas_price(&self, provider: &EvmProvider) -> ResolverResult<GasPrice> {
        let buffered = self.buffer_price(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.name(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Upper bound on what a transaction can cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.buffer_limit(U256::from(100_000)), U256::from(120_000));

        match estimator.buffer_price(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(10),
        }) {
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, U256::from(110));
                assert_eq!(max_priority_fee_per_gas, U256::from(11));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            GasEstimator::calculate_cost(U256::from(21_000), &GasPrice::Legacy(U256::from(2))),
            U256::from(42_000)
        );
    }
}
