use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{disk_storage::DiskStorageInterface, registry::TokenEntry};

pub const ALCHEMY_API_KEY_ENV: &str = "ALCHEMY_API_KEY";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub alchemy_api_key: Option<String>,
    /// JSON-RPC endpoint for multicall reads. Defaults to Alchemy mainnet.
    pub rpc_url: Option<String>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionConfig>,
    /// Tokens tracked on top of the built-in catalog.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_tokens: Vec<TokenEntry>,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alchemy_api_key: None,
            rpc_url: None,
            db_path: default_db_path(),
            export_dir: default_export_dir(),
            collections: default_collections(),
            extra_tokens: Vec::new(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    pub name: String,
    pub contract_address: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Wallets covered by one multicall per token.
    pub wallets_per_batch: usize,
    /// Wallets per balances API call, capped by the API at 3.
    pub addresses_per_call: usize,
    pub workers: usize,
    pub call_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub max_attempts: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            wallets_per_batch: 3000,
            addresses_per_call: 3,
            workers: 10,
            call_delay_ms: 50,
            request_timeout_secs: 15,
            rpc_timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

impl AnalyzerConfig {
    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("nft_holders.db")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_collections() -> Vec<CollectionConfig> {
    vec![
        CollectionConfig {
            name: "Milady".to_string(),
            contract_address: "0x5Af0D9827E0c53E4799BB226655A1de152A425a5".to_string(),
        },
        CollectionConfig {
            name: "CryptoPunks".to_string(),
            contract_address: "0xb47e3cd837dDF8e4c57F05d70Ab865de6e193BBb".to_string(),
        },
    ]
}

impl DiskStorageInterface for Config {
    const FILE_NAME: &'static str = "config";
}

impl Config {
    /// The environment wins over the stored key so `.env` files work as expected.
    pub fn alchemy_api_key(&self) -> crate::Result<String> {
        std::env::var(ALCHEMY_API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.alchemy_api_key.clone())
            .ok_or(crate::Error::AlchemyApiKeyNotSet)
    }

    pub fn set_alchemy_api_key(alchemy_api_key: String) -> crate::Result<()> {
        let mut config = Config::load()?;
        config.alchemy_api_key = Some(alchemy_api_key);
        config.save()?;
        Ok(())
    }

    pub fn get_rpc_url(&self) -> crate::Result<String> {
        match &self.rpc_url {
            Some(rpc_url) => Ok(rpc_url.clone()),
            None => Ok(format!(
                "https://eth-mainnet.g.alchemy.com/v2/{}",
                self.alchemy_api_key()?
            )),
        }
    }
}
