//! Configuration management for the relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub core: CoreConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub attestation: AttestationConfig,
    pub price_feed: PriceFeedConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Delay between watcher poll cycles, also used after a failed cycle
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub executor_interval_ms: u64,
    /// Maximum jobs taken from the store per executor cycle
    pub batch_size: usize,
    pub retry: RetryConfig,
    /// How long a submission waits for its receipt before the attempt is abandoned
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
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

/// The settlement chain and the contracts the core executor talks to
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Relay chain id of the entry in `chains` that hosts the core
    pub chain_id: u16,
    /// Contract receiving settlement calls and emitting payout requests
    pub contract_address: String,
    /// Emitter whose attestations carry payout requests
    pub payout_emitter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Relay-level chain id, the one carried in messages
    pub chain_id: u16,
    pub name: String,
    /// Native network id used for transaction signing
    pub network_id: u64,
    /// Chain id as known by the attestation network
    pub attestation_chain_id: u16,
    pub rpc_urls: Vec<String>,
    /// Portal contract emitting relay events; absent for payout-only chains
    pub portal_address: Option<String>,
    /// Emitter of the attestations for relay events on this chain
    pub emitter_address: Option<String>,
    /// Pool contract accepting payout attestations; absent if no payouts land here
    pub pool_address: Option<String>,
    pub confirmation_blocks: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// Ticker symbol of the gas token, e.g. "eth"
    pub gas_token: String,
    pub gas_token_decimals: u32,
    /// Minimum signer balance in whole gas tokens before submitting
    pub min_signer_balance: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedConfig {
    pub base_url: String,
    #[serde(default = "default_quote")]
    pub quote: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    /// Number of most recent samples averaged by the estimator
    pub sample_window: usize,
    /// Fee allowance offered while bootstrapping a call kind, in core gas token units
    pub bootstrap_allowance: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            sample_window: 10,
            bootstrap_allowance: 1_000_000_000_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variables holding the signer pool private keys
    pub private_key_envs: Vec<String>,
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_receipt_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_quote() -> String {
    "USDT".to_string()
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn executor_interval(&self) -> Duration {
        Duration::from_millis(self.executor_interval_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

impl Settings {
    /// Load settings from the file named by `XCHAIN_RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("XCHAIN_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let core = self
            .get_chain_by_id(self.core.chain_id)
            .filter(|c| c.enabled)
            .with_context(|| format!("Core chain {} is not an enabled chain", self.core.chain_id))?;
        if core.pool_address.is_some() && core.emitter_address.is_none() {
            tracing::warn!("Core chain {} has a pool but no emitter address", core.name);
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.portal_address.is_some() && chain.emitter_address.is_none() {
                anyhow::bail!("Chain {} watches a portal but has no emitter address", name);
            }
        }

        if self.wallet.private_key_envs.is_empty() {
            anyhow::bail!("Signer pool is empty: configure wallet.private_key_envs");
        }
        if self.fees.sample_window == 0 {
            anyhow::bail!("fees.sample_window must be positive");
        }
        let retry = &self.relayer.retry;
        if retry.max_attempts == 0 || retry.max_delay_ms < retry.base_delay_ms {
            anyhow::bail!("relayer.retry needs max_attempts > 0 and max_delay_ms >= base_delay_ms");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Enabled chains that have a portal to watch
    pub fn source_chains(&self) -> Vec<&ChainConfig> {
        self.chains
            .values()
            .filter(|c| c.enabled && c.portal_address.is_some())
            .collect()
    }

    /// Enabled chains that accept payouts
    pub fn payout_chains(&self) -> Vec<&ChainConfig> {
        self.chains
            .values()
            .filter(|c| c.enabled && c.pool_address.is_some())
            .collect()
    }

    /// Get chain config by relay chain ID
    pub fn get_chain_by_id(&self, chain_id: u16) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid regex");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
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
[relayer]
instance_id = "relayer-test"
poll_interval_ms = 2000
sweep_interval_ms = 5000
executor_interval_ms = 1000
batch_size = 20
health_check_interval_secs = 30

[relayer.retry]
max_attempts = 3
base_delay_ms = 200
max_delay_ms = 5000

[database]
backend = "memory"
url = "${XCHAIN_TEST_DB_URL}"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[core]
chain_id = 0
contract_address = "0x0000000000000000000000000000000000000c0e"
payout_emitter = "0x00000000000000000000000000000000000000e1"

[chains.core]
chain_id = 0
name = "core"
network_id = 1337
attestation_chain_id = 21
rpc_urls = ["http://localhost:8545"]
emitter_address = "0x00000000000000000000000000000000000000e1"
pool_address = "0x00000000000000000000000000000000000000b0"
confirmation_blocks = 1
gas_price_strategy = "legacy"
max_gas_price_gwei = 100
gas_token = "sui"
gas_token_decimals = 9
min_signer_balance = 1.0
enabled = true

[chains.polygon]
chain_id = 5
name = "polygon"
network_id = 137
attestation_chain_id = 5
rpc_urls = ["http://localhost:8546"]
portal_address = "0x00000000000000000000000000000000000000a1"
emitter_address = "0x00000000000000000000000000000000000000a2"
confirmation_blocks = 32
gas_price_strategy = "eip1559"
max_gas_price_gwei = 500
gas_token = "matic"
gas_token_decimals = 18
min_signer_balance = 0.5
enabled = true

[attestation]
base_url = "https://guardian.example.com"

[price_feed]
base_url = "https://ticker.example.com"

[wallet]
private_key_envs = ["RELAYER_KEY_0", "RELAYER_KEY_1"]
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("XCHAIN_TEST_DB_URL", "postgres://relayer@localhost/relay");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.database.backend, StoreBackend::Memory);
        assert_eq!(settings.database.url, "postgres://relayer@localhost/relay");
        assert_eq!(settings.fees.sample_window, 10);
        assert_eq!(settings.source_chains().len(), 1);
        assert_eq!(settings.payout_chains().len(), 1);
        assert_eq!(settings.get_chain_by_id(5).unwrap().max_block_range, 1000);
        assert_eq!(settings.price_feed.quote, "USDT");
    }

    #[test]
    fn test_rejects_missing_core_chain() {
        let broken = SAMPLE.replace("[core]\nchain_id = 0", "[core]\nchain_id = 42");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(broken.as_bytes()).unwrap();

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Core chain 42"));
    }
}
