//! Application configuration loaded from environment variables.

use crate::errors::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger gateway JSON-RPC endpoint
    pub rpc_url: String,
    /// Address of the project-funding contract
    pub contract_address: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Fee ceiling attached to fund / set-completed-stage calls
    pub fee_limit: u64,
    /// Confirmation depth required before a receipt is acted on
    pub confirmations: u32,
    /// How often (in milliseconds) to poll for a transaction receipt
    pub receipt_poll_interval_ms: u64,
    /// Ledger address of the platform's own operating account
    pub operator_address: String,
    /// Signing key of the operating account (hex)
    pub operator_key: String,
    /// Expo push gateway endpoint
    pub expo_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            contract_address: env_var("CONTRACT_ADDRESS").map_err(|_| {
                ServiceError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
            })?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./fundflow.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid API_PORT".to_string()))?,
            fee_limit: env_var("FEE_LIMIT")
                .unwrap_or_else(|_| "200000".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid FEE_LIMIT".to_string()))?,
            confirmations: env_var("CONFIRMATIONS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid CONFIRMATIONS".to_string()))?,
            receipt_poll_interval_ms: env_var("RECEIPT_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid RECEIPT_POLL_INTERVAL_MS".to_string()))?,
            operator_address: env_var("OPERATOR_ADDRESS").map_err(|_| {
                ServiceError::Config("OPERATOR_ADDRESS environment variable is required".to_string())
            })?,
            operator_key: env_var("OPERATOR_KEY").map_err(|_| {
                ServiceError::Config("OPERATOR_KEY environment variable is required".to_string())
            })?,
            expo_url: env_var("EXPO_URL")
                .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ServiceError::Config(format!("Missing env var: {key}")))
}
