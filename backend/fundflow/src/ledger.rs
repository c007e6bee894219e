//! Ledger gateway client — submits signed contract calls and polls for
//! confirmed receipts.
//!
//! ## Resilience
//!
//! * Submission failures are surfaced immediately: the caller is still
//!   waiting and an error here means nothing was mutated anywhere.
//! * Receipt polling retries transient transport errors with exponential
//!   back-off, up to [`MAX_BACKOFF_SECS`] seconds, and has no overall
//!   deadline: a transaction that never mines simply never confirms.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::conversion::parse_smallest;
use crate::errors::{Result, ServiceError};
use crate::events::RawEvent;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

/// A ledger account able to sign calls.
///
/// Key custody lives outside this service; the identity is handed in by
/// the caller and forwarded to the signing gateway opaquely.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    pub address: String,
    pub key: String,
}

/// The contract calls this service knows how to make.
#[derive(Debug, Clone)]
pub enum ContractCall {
    CreateProject {
        /// Per-stage costs in the smallest unit.
        stage_costs: Vec<u128>,
        owner_address: String,
        reviewer_address: String,
    },
    Fund {
        project_id: i64,
        /// Transferred value in the smallest unit.
        value: u128,
        fee_limit: u64,
    },
    SetCompletedStage {
        project_id: i64,
        completed_stage: i64,
        fee_limit: u64,
    },
}

impl ContractCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateProject { .. } => "createProject",
            Self::Fund { .. } => "fund",
            Self::SetCompletedStage { .. } => "setCompletedStage",
        }
    }

    /// JSON argument object for the gateway. Smallest-unit values travel
    /// as decimal strings; they do not fit a JSON number reliably.
    pub fn args(&self) -> Value {
        match self {
            Self::CreateProject {
                stage_costs,
                owner_address,
                reviewer_address,
            } => json!({
                "stagesCost": stage_costs.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                "owner": owner_address,
                "reviewer": reviewer_address,
            }),
            Self::Fund {
                project_id,
                value,
                fee_limit,
            } => json!({
                "projectId": project_id,
                "value": value.to_string(),
                "feeLimit": fee_limit,
            }),
            Self::SetCompletedStage {
                project_id,
                completed_stage,
                fee_limit,
            } => json!({
                "projectId": project_id,
                "completedStage": completed_stage,
                "feeLimit": fee_limit,
            }),
        }
    }
}

/// Handle for a submitted, not yet confirmed transaction.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub tx_hash: String,
}

/// The confirmed outcome of a submitted call.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_hash: String,
    /// Emitted events, in emission order.
    pub events: Vec<RawEvent>,
}

/// Boundary to the external ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Build, sign and submit a call. Fails synchronously on malformed
    /// arguments or insufficient fee balance; nothing is mutated on error.
    async fn submit(&self, call: &ContractCall, signer: &SigningIdentity) -> Result<PendingTx>;

    /// Wait until the transaction has the requested confirmation depth and
    /// return its receipt. Rejects if the call reverted.
    async fn await_confirmation(&self, tx: &PendingTx, confirmations: u32) -> Result<Receipt>;

    /// Spendable balance of an account, in the smallest unit.
    async fn balance_of(&self, address: &str) -> Result<u128>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC implementation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    #[serde(rename = "txHash")]
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptResult {
    status: String,
    confirmations: u32,
    #[serde(default)]
    events: Vec<RawEvent>,
}

pub struct RpcLedgerClient {
    client: Client,
    rpc_url: String,
    contract_address: String,
    poll_interval: Duration,
}

impl RpcLedgerClient {
    pub fn new(
        client: Client,
        rpc_url: String,
        contract_address: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            rpc_url,
            contract_address,
            poll_interval,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let response: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ServiceError::Ledger(format!("{}: {}", err.code, err.message)));
        }
        response
            .result
            .ok_or_else(|| ServiceError::Ledger(format!("Empty result from {method}")))
    }

    /// Same as [`Self::call`] but retries transport failures with
    /// exponential back-off. Used only on paths where nobody is blocked
    /// waiting for an immediate answer.
    async fn call_with_backoff(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        loop {
            match self.call(method, params.clone()).await {
                Err(ServiceError::Http(e)) => {
                    warn!("RPC {method} transport failure (retry in {backoff}s): {e}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn submit(&self, call: &ContractCall, signer: &SigningIdentity) -> Result<PendingTx> {
        let result = self
            .call(
                "submitCall",
                json!({
                    "contract": self.contract_address,
                    "from": signer.address,
                    "key": signer.key,
                    "method": call.method(),
                    "args": call.args(),
                }),
            )
            .await?;

        let submitted: SubmitResult = serde_json::from_value(result)?;
        let tx_hash = validate_tx_hash(submitted.tx_hash)?;
        debug!("Submitted {} as tx {tx_hash}", call.method());
        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, tx: &PendingTx, confirmations: u32) -> Result<Receipt> {
        loop {
            let result = self
                .call_with_backoff(
                    "getTransactionReceipt",
                    json!({ "txHash": tx.tx_hash }),
                )
                .await?;

            // Null until the transaction is mined.
            if !result.is_null() {
                let receipt: ReceiptResult = serde_json::from_value(result)?;
                match receipt.status.as_str() {
                    "reverted" => {
                        return Err(ServiceError::Ledger(format!(
                            "Transaction {} reverted",
                            tx.tx_hash
                        )))
                    }
                    "confirmed" if receipt.confirmations >= confirmations => {
                        return Ok(Receipt {
                            tx_hash: tx.tx_hash.clone(),
                            events: receipt.events,
                        });
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn balance_of(&self, address: &str) -> Result<u128> {
        let result = self
            .call("getBalance", json!({ "address": address }))
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| ServiceError::Ledger(format!("Non-string balance: {result}")))?;
        parse_smallest(raw)
    }
}

/// Transaction hashes are 32 bytes, hex-encoded, optionally 0x-prefixed.
fn validate_tx_hash(raw: String) -> Result<String> {
    let digits = raw.strip_prefix("0x").unwrap_or(&raw);
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == 32 => Ok(raw),
        _ => Err(ServiceError::Ledger(format!(
            "Gateway returned a malformed transaction hash: {raw}"
        ))),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
