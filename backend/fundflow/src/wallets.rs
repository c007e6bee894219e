//! Wallet identity mapping.
//!
//! The platform keeps a one-to-one mapping between internal wallet ids and
//! ledger addresses; workflows resolve in both directions — addresses for
//! outgoing contract calls, internal ids for notification routing. Key
//! material is custodied elsewhere and never stored here.

use sqlx::SqlitePool;

use crate::errors::{Result, ServiceError};

#[derive(Clone)]
pub struct WalletResolver {
    pool: SqlitePool,
}

impl WalletResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register the mapping for a wallet. A wallet has exactly one address.
    pub async fn register(&self, wallet_id: &str, address: &str) -> Result<()> {
        sqlx::query("INSERT INTO wallets (wallet_id, address) VALUES (?1, ?2)")
            .bind(wallet_id)
            .bind(address)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ServiceError::Conflict("The wallet is already registered.".to_string())
                }
                _ => ServiceError::Database(e),
            })?;
        Ok(())
    }

    /// Internal wallet id for a ledger address, if the address is known.
    pub async fn wallet_id_for_address(&self, address: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT wallet_id FROM wallets WHERE address = ?1")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Ledger address for an internal wallet id.
    pub async fn address_for_wallet(&self, wallet_id: &str) -> Result<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT address FROM wallets WHERE wallet_id = ?1")
                .bind(wallet_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(address,)| address).ok_or_else(|| {
            ServiceError::NotFound(format!("No wallet found with id {wallet_id}"))
        })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
