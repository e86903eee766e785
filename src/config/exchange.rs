use crate::config::read_env_or_file;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub private_key: String,
    /// Master account the agent wallet trades for. Defaults to the wallet's own address.
    pub account_address: Option<String>,
    pub network: String,
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("private_key", &"<redacted>")
            .field("account_address", &self.account_address)
            .field("network", &self.network)
            .finish()
    }
}

impl ExchangeConfig {
    pub fn is_mainnet(&self) -> bool {
        self.network == "mainnet"
    }
}

pub fn load_exchange_config() -> Result<ExchangeConfig> {
    dotenv().ok(); // .env is optional, variables may come from the environment

    let private_key = read_env_or_file("HYPERLIQUID_PRIVATE_KEY")
        .context("HYPERLIQUID_PRIVATE_KEY is not set")?;

    let account_address = env::var("HYPERLIQUID_ACCOUNT_ADDRESS").ok();

    let network = env::var("HYPERLIQUID_NETWORK").unwrap_or_else(|_| "mainnet".to_string());
    if network != "mainnet" && network != "testnet" {
        return Err(anyhow::anyhow!(
            "HYPERLIQUID_NETWORK must be 'mainnet' or 'testnet', got '{}'",
            network
        ));
    }

    Ok(ExchangeConfig {
        private_key,
        account_address,
        network,
    })
}
