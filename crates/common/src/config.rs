use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub ingestion: Ingestion,
    pub scoring: Scoring,
    pub smart_money: SmartMoney,
    pub observability: Observability,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Ingestion {
    pub poll_interval_secs: u64,
    /// Max blocks per enqueued range; the live tail catches up in chunks.
    pub blocks_per_batch: u64,
    pub queue_depth: usize,
    pub rpc_timeout_secs: u64,
    pub metadata_cache_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct Scoring {
    pub pnl_weight: f64,
    pub win_rate_weight: f64,
    pub profitable_tokens_weight: f64,
    pub consistency_weight: f64,
    pub avoid_rug_weight: f64,
    pub profitable_token_target: u32,
    pub consistency_token_target: u32,
    pub avoid_rug_min_age_days: u32,
}

#[derive(Debug, Deserialize)]
pub struct SmartMoney {
    pub min_score: i64,
    pub min_usd: f64,
    pub cache_ttl_secs: u64,
    pub feed_page_limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

/// Static per-chain configuration. One entry per `[[chains]]` table in the
/// config file; `chain_id` is part of every natural key downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub short_name: String,
    pub native_symbol: String,
    /// Tried in order; the `RPC_<SHORT_NAME>` environment variable wins.
    pub rpc_urls: Vec<String>,
    /// Fiat-pegged tokens used for USD pricing and buy/sell classification.
    pub stablecoins: Vec<String>,
    /// Blocks behind head before a block is treated as final.
    pub confirmations: u64,
}

impl ChainConfig {
    /// Resolve the RPC endpoint: env override first, then the configured list.
    pub fn rpc_url(&self) -> Result<String> {
        let env_key = format!("RPC_{}", self.short_name.to_uppercase());
        if let Ok(url) = std::env::var(&env_key) {
            let url = url.trim();
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
        self.rpc_urls
            .iter()
            .find(|u| !u.trim().is_empty())
            .map(|u| u.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("no RPC URL configured for chain {}", self.name))
    }

    pub fn stablecoin_set(&self) -> HashSet<String> {
        self.stablecoins.iter().map(|a| a.to_lowercase()).collect()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn chains(&self) -> &[ChainConfig] {
        &self.chains
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn chain_by_name(&self, name: &str) -> Option<&ChainConfig> {
        self.chains
            .iter()
            .find(|c| c.short_name == name || c.chain_id.to_string() == name)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert!(config.ingestion.poll_interval_secs > 0);
        assert!(config.ingestion.blocks_per_batch > 0);
        assert!(!config.chains.is_empty());
    }

    #[test]
    fn test_chain_lookup_by_id_and_short_name() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let eth = config.chain(1).expect("ethereum should be configured");
        assert_eq!(eth.short_name, "eth");
        assert_eq!(config.chain_by_name("eth").unwrap().chain_id, 1);
        assert_eq!(config.chain_by_name("1").unwrap().chain_id, 1);
        assert!(config.chain(999_999).is_none());
    }

    #[test]
    fn test_stablecoin_set_is_lowercased() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let eth = config.chain(1).unwrap();
        let set = eth.stablecoin_set();
        assert!(!set.is_empty());
        for addr in &set {
            assert_eq!(addr, &addr.to_lowercase());
        }
    }

    #[test]
    fn test_score_weights_sum_to_one() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let s = &config.scoring;
        let total = s.pnl_weight
            + s.win_rate_weight
            + s.profitable_tokens_weight
            + s.consistency_weight
            + s.avoid_rug_weight;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rpc_url_falls_back_to_configured_list() {
        let chain = ChainConfig {
            chain_id: 1,
            name: "Ethereum".to_string(),
            short_name: "eth-test-no-env".to_string(),
            native_symbol: "ETH".to_string(),
            rpc_urls: vec![String::new(), "https://cloudflare-eth.com".to_string()],
            stablecoins: vec![],
            confirmations: 12,
        };
        assert_eq!(chain.rpc_url().unwrap(), "https://cloudflare-eth.com");
    }

    #[test]
    fn test_rpc_url_errors_when_empty() {
        let chain = ChainConfig {
            chain_id: 777,
            name: "Nowhere".to_string(),
            short_name: "nowhere".to_string(),
            native_symbol: "NONE".to_string(),
            rpc_urls: vec![],
            stablecoins: vec![],
            confirmations: 1,
        };
        assert!(chain.rpc_url().is_err());
    }
}
