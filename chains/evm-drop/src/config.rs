use anyhow::{Context, Result};
use config::{Config, Environment, File};
use drop_core::{ConfigError, DropConfig};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use serde::Deserialize;
use std::path::Path;

pub const PRIVATE_KEY_ENV: &str = "MINTER_PRIVATE_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DropCliConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Drop contract address.
    pub contract: String,
    pub collection: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Gas limit for mint calls; estimated per call when unset.
    pub gas_limit: Option<u64>,
    #[serde(default = "default_fallback_priority_gwei")]
    pub fallback_priority_gwei: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub drop: DropConfig,
}

fn default_database() -> String {
    "drop.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_fallback_priority_gwei() -> f64 {
    1.5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl DropCliConfig {
    /// Load a TOML file, then overlay `DROP_*` environment variables
    /// (`DROP_RPC_URL`, `DROP_DROP__SUBMISSION__MAX_ATTEMPTS`, ...).
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string(),
            }
            .into());
        }

        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("DROP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", path))?;

        let config: Self = settings
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.rpc_url).map_err(|_| ConfigError::InvalidRpcUrl {
            url: self.rpc_url.clone(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidRpcUrl {
                url: self.rpc_url.clone(),
            });
        }
        if self.collection.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "collection".to_string(),
            });
        }
        self.contract_address()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        self.drop.validate()
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        drop_core::normalize(&self.contract).map_err(|e| ConfigError::InvalidValue {
            field: "contract".to_string(),
            reason: e.to_string(),
        })
    }

    /// Signer from `MINTER_PRIVATE_KEY`, if set.
    pub fn wallet(&self) -> Result<Option<LocalWallet>> {
        let Ok(key) = std::env::var(PRIVATE_KEY_ENV) else {
            return Ok(None);
        };
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .with_context(|| format!("{} is not a valid private key", PRIVATE_KEY_ENV))?;
        Ok(Some(ethers::signers::Signer::with_chain_id(
            wallet,
            self.chain_id,
        )))
    }
}
