//! Generic transaction lifecycle executor.
//!
//! Every workflow goes through [`TransactionLifecycle::execute`]: submit a
//! signed call, hand the transaction hash straight back to the caller, and
//! finish the work in a detached background task that awaits confirmation
//! and applies the receipt's events. The caller never waits on
//! confirmation; the background task never reaches back into the caller's
//! path.
//!
//! Ordering: events within one receipt are applied strictly in receipt
//! order, one at a time — a later event (say, a status transition) may
//! depend on an earlier one (a funding amount) in the same receipt. No
//! ordering is guaranteed across receipts of different invocations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::errors::{Result, ServiceError};
use crate::events::LedgerEvent;
use crate::ledger::{ContractCall, LedgerClient, PendingTx, SigningIdentity};

/// Delivery context of a single receipt event.
#[derive(Debug, Clone)]
pub struct EventCtx {
    pub tx_hash: String,
    /// Position of the event within its receipt.
    pub index: i64,
}

/// Per-workflow event interpretation.
///
/// `on_event` is called once per receipt event, in order; returning an
/// error aborts the continuation and routes to `on_failure`. `on_failure`
/// also receives confirmation failures (revert, missing events) — it is
/// the only failure channel once the hash has been returned.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_event(&self, event: LedgerEvent, ctx: &EventCtx) -> Result<()>;
    async fn on_failure(&self, error: &ServiceError);
}

pub struct TransactionLifecycle {
    ledger: Arc<dyn LedgerClient>,
    confirmations: u32,
}

impl TransactionLifecycle {
    pub fn new(ledger: Arc<dyn LedgerClient>, confirmations: u32) -> Self {
        Self {
            ledger,
            confirmations,
        }
    }

    /// Submit `call` and return its transaction hash.
    ///
    /// Submission failures (malformed arguments, insufficient fee balance)
    /// happen before any state mutation and propagate to the caller.
    /// Everything after submission runs detached; its failures are caught,
    /// logged and routed to `handler.on_failure`, never left unobserved.
    pub async fn execute(
        &self,
        signer: &SigningIdentity,
        call: ContractCall,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String> {
        let method = call.method();
        let pending = self.ledger.submit(&call, signer).await?;
        let tx_hash = pending.tx_hash.clone();
        info!("{method} submitted as tx {tx_hash}");

        let ledger = Arc::clone(&self.ledger);
        let confirmations = self.confirmations;
        tokio::spawn(async move {
            if let Err(e) =
                confirm_and_dispatch(ledger, &pending, confirmations, handler.as_ref()).await
            {
                error!("{method} tx {} failed after submission: {e}", pending.tx_hash);
                handler.on_failure(&e).await;
            }
        });

        Ok(tx_hash)
    }
}

/// Await the receipt and apply its events sequentially, in receipt order.
pub(crate) async fn confirm_and_dispatch(
    ledger: Arc<dyn LedgerClient>,
    pending: &PendingTx,
    confirmations: u32,
    handler: &dyn EventHandler,
) -> Result<()> {
    let receipt = ledger.await_confirmation(pending, confirmations).await?;
    info!("Transaction {} mined", receipt.tx_hash);

    if receipt.events.is_empty() {
        return Err(ServiceError::Unknown(format!(
            "Receipt for tx {} carries no events",
            receipt.tx_hash
        )));
    }

    for (index, raw) in receipt.events.iter().enumerate() {
        let event = LedgerEvent::decode(raw)?;
        let ctx = EventCtx {
            tx_hash: receipt.tx_hash.clone(),
            index: index as i64,
        };
        handler.on_event(event, &ctx).await?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
