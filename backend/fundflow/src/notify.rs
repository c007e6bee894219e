//! Best-effort push notifications.
//!
//! Workflows report asynchronous outcomes (funding confirmed, publication
//! failed, ...) through [`NotificationPort`]. Delivery is never allowed to
//! fail a workflow: the port's signature is infallible and the Expo
//! implementation logs and swallows every delivery error.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::errors::{Result, ServiceError};

#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Push a notification to every device registered for the wallet.
    async fn push(&self, wallet_id: &str, title: &str, body: &str, data: Value);
}

// ─────────────────────────────────────────────────────────
// Expo implementation
// ─────────────────────────────────────────────────────────

pub struct ExpoNotifier {
    pool: SqlitePool,
    client: Client,
    expo_url: String,
}

impl ExpoNotifier {
    pub fn new(pool: SqlitePool, client: Client, expo_url: String) -> Self {
        Self {
            pool,
            client,
            expo_url,
        }
    }

    /// Register a device push token for a wallet. Re-registering the same
    /// token is a no-op.
    pub async fn register_token(&self, wallet_id: &str, token: &str) -> Result<()> {
        if !is_expo_push_token(token) {
            return Err(ServiceError::Validation(format!(
                "Push token {token} is not a valid Expo push token"
            )));
        }
        info!("Adding push token for wallet {wallet_id}");
        sqlx::query("INSERT OR IGNORE INTO push_tokens (wallet_id, token) VALUES (?1, ?2)")
            .bind(wallet_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a device push token for a wallet.
    pub async fn remove_token(&self, wallet_id: &str, token: &str) -> Result<()> {
        info!("Removing push token for wallet {wallet_id}");
        sqlx::query("DELETE FROM push_tokens WHERE wallet_id = ?1 AND token = ?2")
            .bind(wallet_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn tokens_for(&self, wallet_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT token FROM push_tokens WHERE wallet_id = ?1")
                .bind(wallet_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

#[async_trait]
impl NotificationPort for ExpoNotifier {
    async fn push(&self, wallet_id: &str, title: &str, body: &str, data: Value) {
        let tokens = match self.tokens_for(wallet_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Could not load push tokens for wallet {wallet_id}: {e}");
                return;
            }
        };
        if tokens.is_empty() {
            debug!("No push tokens registered for wallet {wallet_id}");
            return;
        }

        info!("Sending notification '{title}' to wallet {wallet_id}");
        let messages: Vec<Value> = tokens
            .iter()
            .map(|token| {
                json!({
                    "to": token,
                    "sound": "default",
                    "title": title,
                    "body": body,
                    "data": data,
                })
            })
            .collect();

        if let Err(e) = self.client.post(&self.expo_url).json(&messages).send().await {
            warn!("Push delivery to wallet {wallet_id} failed: {e}");
        }
    }
}

/// Shape check matching the Expo SDK's token format.
fn is_expo_push_token(token: &str) -> bool {
    (token.starts_with("ExponentPushToken[") || token.starts_with("ExpoPushToken["))
        && token.ends_with(']')
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
