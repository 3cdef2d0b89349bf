//! Configuration management for the swap resolver
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub resolver: ResolverConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub instance_id: String,
    /// Minimum distance between now and an order's deadline
    pub min_deadline_buffer_secs: u64,
    pub safety_deposit_percent: u64,
    pub chain_call_timeout_secs: u64,
    /// Added on top of the escrow's own withdrawal start before firing
    pub withdrawal_buffer_secs: u64,
    /// Pause between the first and second withdrawal leg
    pub settle_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: RetryBackoff,
    pub failed_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub withdrawal_order: WithdrawalOrder,
    /// Resolver fronts the principal on the source chain as well
    pub resolver_funds_source: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            instance_id: "resolver-0".to_string(),
            min_deadline_buffer_secs: 300,
            safety_deposit_percent: 15,
            chain_call_timeout_secs: 60,
            withdrawal_buffer_secs: 2,
            settle_delay_ms: 5_000,
            max_retries: 2,
            retry_delay_secs: 30,
            retry_backoff: RetryBackoff::Fixed,
            failed_retention_secs: 3_600,
            sweep_interval_secs: 300,
            health_check_interval_secs: 30,
            withdrawal_order: WithdrawalOrder::SourceFirst,
            resolver_funds_source: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

/// Which escrow is withdrawn first once the timelock has elapsed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalOrder {
    SourceFirst,
    EvmFirst,
    HomeFirst,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChainConfig {
    Evm(EvmChainConfig),
    Icp(IcpChainConfig),
}

impl ChainConfig {
    pub fn enabled(&self) -> bool {
        match self {
            ChainConfig::Evm(c) => c.enabled,
            ChainConfig::Icp(c) => c.enabled,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub escrow_factory: String,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Name of the environment variable holding the resolver's key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IcpChainConfig {
    pub replica_url: String,
    #[serde(default)]
    pub escrow_canister: String,
    #[serde(default = "default_icp_ledger")]
    pub ledger_canister: String,
    #[serde(default)]
    pub identity_pem: Option<String>,
    /// Only for local replicas
    #[serde(default)]
    pub fetch_root_key: bool,
    #[serde(default = "default_creation_fee")]
    pub creation_fee_e8s: u64,
    #[serde(default = "default_transfer_fee")]
    pub transfer_fee_e8s: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_confirmation_blocks() -> u64 {
    1
}

fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_max_gas_price_gwei() -> u64 {
    200
}

fn default_private_key_env() -> String {
    "RESOLVER_PRIVATE_KEY".to_string()
}

fn default_icp_ledger() -> String {
    "ryjl3-tyaaa-aaaaa-aaaba-cai".to_string()
}

fn default_creation_fee() -> u64 {
    10_000
}

fn default_transfer_fee() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from the file named by `RESOLVER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RESOLVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let enabled = self.enabled_chains();
        if !enabled.iter().any(|(_, c)| matches!(c, ChainConfig::Evm(_))) {
            anyhow::bail!("At least one EVM chain must be enabled");
        }
        if !enabled.iter().any(|(_, c)| matches!(c, ChainConfig::Icp(_))) {
            anyhow::bail!("An ICP chain must be enabled");
        }

        for (name, chain) in &enabled {
            match chain {
                ChainConfig::Evm(evm) => {
                    if evm.rpc_urls.is_empty() {
                        anyhow::bail!("Chain {} has no RPC URLs configured", name);
                    }
                    if evm.escrow_factory.is_empty() {
                        tracing::warn!("Chain {} has no escrow factory - will stay unconfigured", name);
                    }
                }
                ChainConfig::Icp(icp) => {
                    if icp.escrow_canister.is_empty() {
                        tracing::warn!("Chain {} has no escrow canister - will stay unconfigured", name);
                    }
                }
            }
        }

        if self.resolver.safety_deposit_percent > 100 {
            anyhow::bail!(
                "safety_deposit_percent must be <= 100, got {}",
                self.resolver.safety_deposit_percent
            );
        }
        if self.resolver.max_retries > 10 {
            anyhow::bail!("max_retries must be <= 10, got {}", self.resolver.max_retries);
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled()).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [resolver]
        instance_id = "test"
        max_retries = 2

        [api]
        host = "127.0.0.1"
        port = 3000

        [metrics]
        enabled = false
        port = 9100

        [chains.sepolia]
        kind = "evm"
        chain_id = 11155111
        rpc_urls = ["https://rpc.example/${RESOLVER_TEST_RPC_KEY}"]
        escrow_factory = "0x1111111111111111111111111111111111111111"

        [chains.icp]
        kind = "icp"
        replica_url = "https://ic0.app"
        escrow_canister = "rrkah-fqaaa-aaaaa-aaaaq-cai"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("RESOLVER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${RESOLVER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("RESOLVER_TEST_RPC_KEY", "abc123");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.resolver.instance_id, "test");
        // Unspecified fields fall back to defaults
        assert_eq!(settings.resolver.safety_deposit_percent, 15);
        assert_eq!(settings.resolver.withdrawal_order, WithdrawalOrder::SourceFirst);

        match settings.chains.get("sepolia").unwrap() {
            ChainConfig::Evm(evm) => {
                assert_eq!(evm.chain_id, 11155111);
                assert_eq!(evm.rpc_urls[0], "https://rpc.example/abc123");
                assert_eq!(evm.gas_price_strategy, GasPriceStrategy::Eip1559);
            }
            other => panic!("expected evm chain, got {:?}", other),
        }
        assert!(matches!(settings.chains.get("icp"), Some(ChainConfig::Icp(_))));
    }

    #[test]
    fn test_requires_both_chain_kinds() {
        let only_evm = SAMPLE.replace("kind = \"icp\"", "kind = \"icp\"\n        enabled = false");
        let err = Settings::from_toml_str(&only_evm).unwrap_err();
        assert!(err.to_string().contains("ICP"));
    }

    #[test]
    fn test_rejects_deposit_over_100_percent() {
        let bad = SAMPLE.replace("max_retries = 2", "max_retries = 2\n        safety_deposit_percent = 150");
        assert!(Settings::from_toml_str(&bad).is_err());
    }
}
