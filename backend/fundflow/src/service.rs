//! Project lifecycle workflows: create, fund, set-completed-stage.
//!
//! Each workflow validates against the current local projection, submits a
//! ledger call and returns its transaction hash immediately; interpretation
//! of the confirmed receipt runs in a background continuation that mutates
//! the projection and fires notifications. Guard reads are a snapshot: two
//! concurrent calls on the same project can both pass validation against
//! the same pre-submission state, and nothing here serializes them — the
//! ledger is the arbiter of which submission lands first.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::conversion;
use crate::errors::{Result, ServiceError};
use crate::events::LedgerEvent;
use crate::guards;
use crate::ledger::{ContractCall, LedgerClient, SigningIdentity};
use crate::lifecycle::{EventCtx, EventHandler, TransactionLifecycle};
use crate::notify::NotificationPort;
use crate::store::{NewProject, Project, ProjectPatch, ProjectRef, ProjectStatus, ProjectStore};
use crate::wallets::WalletResolver;

use async_trait::async_trait;

pub struct ProjectLifecycleService {
    store: ProjectStore,
    wallets: WalletResolver,
    ledger: Arc<dyn LedgerClient>,
    notifier: Arc<dyn NotificationPort>,
    lifecycle: TransactionLifecycle,
    fee_limit: u64,
}

impl ProjectLifecycleService {
    pub fn new(
        store: ProjectStore,
        wallets: WalletResolver,
        ledger: Arc<dyn LedgerClient>,
        notifier: Arc<dyn NotificationPort>,
        confirmations: u32,
        fee_limit: u64,
    ) -> Self {
        let lifecycle = TransactionLifecycle::new(Arc::clone(&ledger), confirmations);
        Self {
            store,
            wallets,
            ledger,
            notifier,
            lifecycle,
            fee_limit,
        }
    }

    /// Publish a new project to the ledger.
    ///
    /// The project row is written only once the creating transaction
    /// confirms and reports the assigned identity; until then the returned
    /// hash is the project's only key.
    pub async fn create(
        &self,
        signer: &SigningIdentity,
        stages_cost: Vec<Decimal>,
        owner_address: String,
        reviewer_address: String,
    ) -> Result<String> {
        guards::require_stage_costs(&stages_cost)?;
        let costs_smallest = stages_cost
            .iter()
            .map(|c| conversion::to_smallest(*c))
            .collect::<Result<Vec<_>>>()?;

        let handler = Arc::new(CreateHandler {
            store: self.store.clone(),
            wallets: self.wallets.clone(),
            notifier: Arc::clone(&self.notifier),
            stages_cost,
            owner_address: owner_address.clone(),
            reviewer_address: reviewer_address.clone(),
        });

        self.lifecycle
            .execute(
                signer,
                ContractCall::CreateProject {
                    stage_costs: costs_smallest,
                    owner_address,
                    reviewer_address,
                },
                handler,
            )
            .await
    }

    /// Contribute `amount` to a project currently in funding.
    pub async fn fund(
        &self,
        funder_wallet_id: &str,
        signer: &SigningIdentity,
        reference: &ProjectRef,
        amount: Decimal,
    ) -> Result<String> {
        // Guard snapshot; possibly stale by the time the call lands.
        let project = self.store.get_one(reference).await?;
        guards::require_status(&project, ProjectStatus::Funding)?;

        let value = conversion::to_smallest(amount)?;
        let balance = self.ledger.balance_of(&signer.address).await?;
        guards::require_balance(balance, value)?;

        let handler = Arc::new(FundHandler {
            store: self.store.clone(),
            wallets: self.wallets.clone(),
            notifier: Arc::clone(&self.notifier),
            project_id: project.project_id,
            owner_address: project.owner_address.clone(),
            reviewer_address: project.reviewer_address.clone(),
            funder_wallet_id: funder_wallet_id.to_string(),
        });

        self.lifecycle
            .execute(
                signer,
                ContractCall::Fund {
                    project_id: project.project_id,
                    value,
                    fee_limit: self.fee_limit,
                },
                handler,
            )
            .await
    }

    /// Mark a stage of an in-progress project as completed.
    pub async fn set_completed_stage(
        &self,
        reviewer_wallet_id: &str,
        signer: &SigningIdentity,
        reference: &ProjectRef,
        completed_stage: i64,
    ) -> Result<String> {
        let project = self.store.get_one(reference).await?;
        guards::require_status(&project, ProjectStatus::InProgress)?;
        guards::require_stage_in_range(project.current_stage, project.total_stages, completed_stage)?;
        guards::require_reviewer(&project, &signer.address)?;

        let handler = Arc::new(StageHandler {
            store: self.store.clone(),
            wallets: self.wallets.clone(),
            notifier: Arc::clone(&self.notifier),
            project_id: project.project_id,
            owner_address: project.owner_address.clone(),
            reviewer_address: project.reviewer_address.clone(),
            reviewer_wallet_id: reviewer_wallet_id.to_string(),
        });

        self.lifecycle
            .execute(
                signer,
                ContractCall::SetCompletedStage {
                    project_id: project.project_id,
                    completed_stage,
                    fee_limit: self.fee_limit,
                },
                handler,
            )
            .await
    }

    /// Look up a single project by either identity phase.
    pub async fn get(&self, reference: &ProjectRef) -> Result<Project> {
        self.store.get_one(reference).await
    }

    /// All projects, newest first.
    pub async fn get_all(&self) -> Result<Vec<Project>> {
        self.store.get(&Default::default()).await
    }
}

// ─────────────────────────────────────────────────────────
// Shared handler plumbing
// ─────────────────────────────────────────────────────────

/// Resolve a ledger address to an internal wallet and push to it.
/// Unresolvable addresses (external accounts) are skipped quietly.
async fn notify_address(
    wallets: &WalletResolver,
    notifier: &dyn NotificationPort,
    address: &str,
    title: &str,
    body: &str,
    data: serde_json::Value,
) {
    match wallets.wallet_id_for_address(address).await {
        Ok(Some(wallet_id)) => notifier.push(&wallet_id, title, body, data).await,
        Ok(None) => {}
        Err(e) => warn!("Wallet resolution for {address} failed: {e}"),
    }
}

/// Dedup read shared by every handler: `true` means this `(tx_hash,
/// event_index)` was already applied and the delivery must be skipped.
/// The mark itself is written by the store, in the same transaction as
/// the write it guards.
async fn already_applied(store: &ProjectStore, ctx: &EventCtx) -> Result<bool> {
    let applied = store.event_applied(&ctx.tx_hash, ctx.index).await?;
    if applied {
        warn_duplicate(ctx);
    }
    Ok(applied)
}

fn warn_duplicate(ctx: &EventCtx) {
    warn!(
        "Skipping duplicate delivery of event {} of tx {}",
        ctx.index, ctx.tx_hash
    );
}

fn unexpected(event: &LedgerEvent, ctx: &EventCtx) -> ServiceError {
    ServiceError::Unknown(format!(
        "Unexpected event {} at index {} of tx {}",
        event.name(),
        ctx.index,
        ctx.tx_hash
    ))
}

// ─────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────

struct CreateHandler {
    store: ProjectStore,
    wallets: WalletResolver,
    notifier: Arc<dyn NotificationPort>,
    stages_cost: Vec<Decimal>,
    owner_address: String,
    reviewer_address: String,
}

#[async_trait]
impl EventHandler for CreateHandler {
    async fn on_event(&self, event: LedgerEvent, ctx: &EventCtx) -> Result<()> {
        match event {
            // The creation event must open the receipt.
            LedgerEvent::ProjectCreated { project_id } if ctx.index == 0 => {
                let fresh = self
                    .store
                    .create(
                        NewProject {
                            tx_hash: ctx.tx_hash.clone(),
                            project_id,
                            owner_address: self.owner_address.clone(),
                            reviewer_address: self.reviewer_address.clone(),
                            stages_cost: self.stages_cost.clone(),
                        },
                        ctx.index,
                    )
                    .await?;
                if !fresh {
                    warn_duplicate(ctx);
                    return Ok(());
                }
                info!("Project {project_id} created in tx {}", ctx.tx_hash);
                Ok(())
            }
            // The row is written; later events carry nothing this
            // workflow tracks.
            other if ctx.index > 0 => {
                debug!(
                    "Ignoring trailing event {} at index {} of tx {}",
                    other.name(),
                    ctx.index,
                    ctx.tx_hash
                );
                Ok(())
            }
            other => Err(unexpected(&other, ctx)),
        }
    }

    async fn on_failure(&self, _error: &ServiceError) {
        for address in [&self.owner_address, &self.reviewer_address] {
            notify_address(
                &self.wallets,
                self.notifier.as_ref(),
                address,
                "Project publication failed",
                "The project could not be published to the ledger.",
                json!({}),
            )
            .await;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Fund
// ─────────────────────────────────────────────────────────

struct FundHandler {
    store: ProjectStore,
    wallets: WalletResolver,
    notifier: Arc<dyn NotificationPort>,
    project_id: i64,
    owner_address: String,
    reviewer_address: String,
    funder_wallet_id: String,
}

#[async_trait]
impl EventHandler for FundHandler {
    async fn on_event(&self, event: LedgerEvent, ctx: &EventCtx) -> Result<()> {
        if already_applied(&self.store, ctx).await? {
            return Ok(());
        }
        match event {
            LedgerEvent::ProjectFunded { project_id, funds } => {
                guards::require_project_id_match(self.project_id, project_id)?;
                let received = conversion::from_smallest(funds)?;
                let fresh = self
                    .store
                    .fund(
                        self.project_id,
                        &self.funder_wallet_id,
                        received,
                        &ctx.tx_hash,
                        ctx.index,
                    )
                    .await?;
                if !fresh {
                    warn_duplicate(ctx);
                    return Ok(());
                }
                info!("Project {} funded in tx {}", self.project_id, ctx.tx_hash);

                let data = json!({ "projectId": self.project_id, "txHash": ctx.tx_hash });
                self.notifier
                    .push(
                        &self.funder_wallet_id,
                        "Funds transferred",
                        &format!("You funded project {} with {received}.", self.project_id),
                        data.clone(),
                    )
                    .await;
                notify_address(
                    &self.wallets,
                    self.notifier.as_ref(),
                    &self.owner_address,
                    "Project funded",
                    &format!("Your project {} received {received}.", self.project_id),
                    data,
                )
                .await;
                Ok(())
            }
            LedgerEvent::ProjectStarted { project_id } => {
                guards::require_project_id_match(self.project_id, project_id)?;
                let project = self.store.get_one(&ProjectRef::Id(self.project_id)).await?;
                guards::require_transition(project.current_status, ProjectStatus::InProgress)?;
                let fresh = self
                    .store
                    .update_once(
                        self.project_id,
                        ProjectPatch {
                            current_status: Some(ProjectStatus::InProgress),
                            ..Default::default()
                        },
                        &ctx.tx_hash,
                        ctx.index,
                    )
                    .await?;
                if !fresh {
                    warn_duplicate(ctx);
                    return Ok(());
                }
                info!(
                    "Project {} funding completed, started in tx {}",
                    self.project_id, ctx.tx_hash
                );

                let data = json!({ "projectId": self.project_id, "txHash": ctx.tx_hash });
                for address in [&self.owner_address, &self.reviewer_address] {
                    notify_address(
                        &self.wallets,
                        self.notifier.as_ref(),
                        address,
                        "Project started",
                        &format!(
                            "Project {} reached its funding goal and is now in progress.",
                            self.project_id
                        ),
                        data.clone(),
                    )
                    .await;
                }
                Ok(())
            }
            other => Err(unexpected(&other, ctx)),
        }
    }

    async fn on_failure(&self, _error: &ServiceError) {
        self.notifier
            .push(
                &self.funder_wallet_id,
                "Funding failed",
                &format!(
                    "Your funds could not be transferred to project {}.",
                    self.project_id
                ),
                json!({ "projectId": self.project_id }),
            )
            .await;
    }
}

// ─────────────────────────────────────────────────────────
// Set completed stage
// ─────────────────────────────────────────────────────────

struct StageHandler {
    store: ProjectStore,
    wallets: WalletResolver,
    notifier: Arc<dyn NotificationPort>,
    project_id: i64,
    owner_address: String,
    reviewer_address: String,
    reviewer_wallet_id: String,
}

impl StageHandler {
    async fn notify_both(&self, title: &str, body: &str, data: serde_json::Value) {
        for address in [&self.owner_address, &self.reviewer_address] {
            notify_address(
                &self.wallets,
                self.notifier.as_ref(),
                address,
                title,
                body,
                data.clone(),
            )
            .await;
        }
    }
}

#[async_trait]
impl EventHandler for StageHandler {
    async fn on_event(&self, event: LedgerEvent, ctx: &EventCtx) -> Result<()> {
        if already_applied(&self.store, ctx).await? {
            return Ok(());
        }
        match event {
            LedgerEvent::StageCompleted {
                project_id,
                completed_stage,
            } => {
                guards::require_project_id_match(self.project_id, project_id)?;
                let fresh = self
                    .store
                    .update_once(
                        self.project_id,
                        ProjectPatch {
                            current_stage: Some(completed_stage + 1),
                            ..Default::default()
                        },
                        &ctx.tx_hash,
                        ctx.index,
                    )
                    .await?;
                if !fresh {
                    warn_duplicate(ctx);
                    return Ok(());
                }
                info!(
                    "Stage {completed_stage} of project {} completed in tx {}",
                    self.project_id, ctx.tx_hash
                );
                self.notify_both(
                    "Stage completed",
                    &format!(
                        "Stage {completed_stage} of project {} was approved.",
                        self.project_id
                    ),
                    json!({ "projectId": self.project_id, "txHash": ctx.tx_hash }),
                )
                .await;
                Ok(())
            }
            LedgerEvent::ProjectCompleted { project_id } => {
                guards::require_project_id_match(self.project_id, project_id)?;
                let project = self.store.get_one(&ProjectRef::Id(self.project_id)).await?;
                guards::require_transition(project.current_status, ProjectStatus::Completed)?;
                let fresh = self
                    .store
                    .update_once(
                        self.project_id,
                        ProjectPatch {
                            current_status: Some(ProjectStatus::Completed),
                            ..Default::default()
                        },
                        &ctx.tx_hash,
                        ctx.index,
                    )
                    .await?;
                if !fresh {
                    warn_duplicate(ctx);
                    return Ok(());
                }
                info!("Project {} completed in tx {}", self.project_id, ctx.tx_hash);
                self.notify_both(
                    "Project completed",
                    &format!("Project {} completed its final stage.", self.project_id),
                    json!({ "projectId": self.project_id, "txHash": ctx.tx_hash }),
                )
                .await;
                Ok(())
            }
            other => Err(unexpected(&other, ctx)),
        }
    }

    async fn on_failure(&self, _error: &ServiceError) {
        self.notifier
            .push(
                &self.reviewer_wallet_id,
                "Stage update failed",
                &format!(
                    "The stage update for project {} could not be completed.",
                    self.project_id
                ),
                json!({ "projectId": self.project_id }),
            )
            .await;
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawEvent;
    use crate::ledger::{PendingTx, Receipt};
    use crate::store::{memory_pool, FundingQuery};
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    struct MockLedger {
        balance: u128,
        hashes: Mutex<VecDeque<String>>,
        receipts: Mutex<HashMap<String, std::result::Result<Vec<RawEvent>, String>>>,
        submitted: Mutex<Vec<&'static str>>,
    }

    impl MockLedger {
        fn new(balance: u128) -> Self {
            Self {
                balance,
                hashes: Mutex::new(VecDeque::new()),
                receipts: Mutex::new(HashMap::new()),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn queue_tx(&self, hash: &str, receipt: std::result::Result<Vec<RawEvent>, String>) {
            self.hashes.lock().unwrap().push_back(hash.to_string());
            self.receipts.lock().unwrap().insert(hash.to_string(), receipt);
        }

        /// Queue a submission whose confirmation never materialises.
        fn queue_unmined_tx(&self, hash: &str) {
            self.hashes.lock().unwrap().push_back(hash.to_string());
        }

        fn submissions(&self) -> usize {
            self.submitted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LedgerClient for MockLedger {
        async fn submit(
            &self,
            call: &ContractCall,
            _signer: &SigningIdentity,
        ) -> Result<PendingTx> {
            let hash = self
                .hashes
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected submission");
            self.submitted.lock().unwrap().push(call.method());
            Ok(PendingTx { tx_hash: hash })
        }

        async fn await_confirmation(
            &self,
            tx: &PendingTx,
            _confirmations: u32,
        ) -> Result<Receipt> {
            let receipt = self.receipts.lock().unwrap().get(&tx.tx_hash).cloned();
            match receipt {
                Some(Ok(events)) => Ok(Receipt {
                    tx_hash: tx.tx_hash.clone(),
                    events,
                }),
                Some(Err(msg)) => Err(ServiceError::Ledger(msg)),
                None => {
                    // Never mined.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }

        async fn balance_of(&self, _address: &str) -> Result<u128> {
            Ok(self.balance)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        pushed: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn pushed(&self) -> Vec<(String, String)> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationPort for RecordingNotifier {
        async fn push(&self, wallet_id: &str, title: &str, _body: &str, _data: Value) {
            self.pushed
                .lock()
                .unwrap()
                .push((wallet_id.to_string(), title.to_string()));
        }
    }

    struct Fixture {
        service: ProjectLifecycleService,
        store: ProjectStore,
        ledger: Arc<MockLedger>,
        notifier: Arc<RecordingNotifier>,
        wallets: WalletResolver,
    }

    const PLENTY: u128 = 1_000_000_000_000_000_000_000_000;

    async fn fixture(balance: u128) -> Fixture {
        let pool = memory_pool().await;
        let store = ProjectStore::new(pool.clone());
        let wallets = WalletResolver::new(pool);
        let ledger = Arc::new(MockLedger::new(balance));
        let notifier = Arc::new(RecordingNotifier::default());
        let service = ProjectLifecycleService::new(
            store.clone(),
            wallets.clone(),
            ledger.clone(),
            notifier.clone(),
            1,
            200_000,
        );
        Fixture {
            service,
            store,
            ledger,
            notifier,
            wallets,
        }
    }

    fn signer(address: &str) -> SigningIdentity {
        SigningIdentity {
            address: address.to_string(),
            key: "secret".to_string(),
        }
    }

    fn raw(event: &str, args: Value) -> RawEvent {
        RawEvent {
            event: event.to_string(),
            args,
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Poll the projection until the project satisfies `pred`.
    async fn wait_for_project(
        store: &ProjectStore,
        reference: &ProjectRef,
        pred: impl Fn(&Project) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(project) = store.get_one(reference).await {
                    if pred(&project) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Seed a confirmed project directly into the projection.
    async fn seed_project(fx: &Fixture, project_id: i64, costs: &[i64], status: ProjectStatus) {
        fx.store
            .create(
                NewProject {
                    tx_hash: format!("0xseed{project_id}"),
                    project_id,
                    owner_address: "0xowner".to_string(),
                    reviewer_address: "0xreviewer".to_string(),
                    stages_cost: costs.iter().map(|c| Decimal::from(*c)).collect(),
                },
                0,
            )
            .await
            .unwrap();
        if status != ProjectStatus::Funding {
            fx.store
                .update_once(
                    project_id,
                    ProjectPatch {
                        current_status: Some(status),
                        ..Default::default()
                    },
                    &format!("0xseed{project_id}"),
                    1,
                )
                .await
                .unwrap();
        }
    }

    // ── Create ──

    #[tokio::test]
    async fn create_persists_project_once_creation_event_confirms() {
        let fx = fixture(PLENTY).await;
        fx.ledger.queue_tx(
            "0xc1",
            Ok(vec![raw("ProjectCreated", json!({ "projectId": 1 }))]),
        );

        let hash = fx
            .service
            .create(
                &signer("0xoperator"),
                vec![Decimal::from(100), Decimal::from(200)],
                "0xowner".to_string(),
                "0xreviewer".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(hash, "0xc1");

        wait_for_project(&fx.store, &ProjectRef::TxHash("0xc1".to_string()), |_| true).await;
        let project = fx.store.get_one(&ProjectRef::Id(1)).await.unwrap();
        assert_eq!(project.total_stages, 2);
        assert_eq!(project.current_stage, 0);
        assert_eq!(project.current_status, ProjectStatus::Funding);
        assert_eq!(
            project.stages_cost,
            vec![Decimal::from(100), Decimal::from(200)]
        );
    }

    #[tokio::test]
    async fn create_rejects_bad_cost_lists_before_submission() {
        let fx = fixture(PLENTY).await;

        let empty = fx
            .service
            .create(
                &signer("0xoperator"),
                vec![],
                "0xowner".to_string(),
                "0xreviewer".to_string(),
            )
            .await;
        assert!(matches!(empty, Err(ServiceError::Validation(_))));

        let negative = fx
            .service
            .create(
                &signer("0xoperator"),
                vec![Decimal::from(-5)],
                "0xowner".to_string(),
                "0xreviewer".to_string(),
            )
            .await;
        assert!(matches!(negative, Err(ServiceError::Validation(_))));
        assert_eq!(fx.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn create_without_creation_event_notifies_and_writes_nothing() {
        let fx = fixture(PLENTY).await;
        fx.wallets.register("w-owner", "0xowner").await.unwrap();
        fx.wallets.register("w-rev", "0xreviewer").await.unwrap();
        fx.ledger.queue_tx(
            "0xc1",
            Ok(vec![raw("Transfer", json!({ "value": "1" }))]),
        );

        fx.service
            .create(
                &signer("0xoperator"),
                vec![Decimal::from(100)],
                "0xowner".to_string(),
                "0xreviewer".to_string(),
            )
            .await
            .unwrap();

        wait_until(|| fx.notifier.pushed().len() == 2).await;
        let pushed = fx.notifier.pushed();
        assert!(pushed
            .iter()
            .any(|(w, t)| w == "w-owner" && t == "Project publication failed"));
        assert!(pushed
            .iter()
            .any(|(w, t)| w == "w-rev" && t == "Project publication failed"));
        // The project row was never created.
        assert!(fx
            .store
            .get_one(&ProjectRef::TxHash("0xc1".to_string()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn trailing_receipt_events_do_not_fail_a_confirmed_creation() {
        let fx = fixture(PLENTY).await;
        fx.wallets.register("w-owner", "0xowner").await.unwrap();
        fx.wallets.register("w-rev", "0xreviewer").await.unwrap();
        fx.ledger.queue_tx(
            "0xc1",
            Ok(vec![
                raw("ProjectCreated", json!({ "projectId": 1 })),
                raw("Transfer", json!({ "value": "1" })),
            ]),
        );

        fx.service
            .create(
                &signer("0xoperator"),
                vec![Decimal::from(100)],
                "0xowner".to_string(),
                "0xreviewer".to_string(),
            )
            .await
            .unwrap();

        wait_for_project(&fx.store, &ProjectRef::Id(1), |_| true).await;
        // Let the continuation run past the rest of the receipt.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.notifier.pushed().is_empty());
    }

    // ── Fund ──

    #[tokio::test]
    async fn fund_appends_record_and_leaves_status_alone() {
        let fx = fixture(PLENTY).await;
        fx.wallets.register("w-owner", "0xowner").await.unwrap();
        seed_project(&fx, 1, &[100, 200], ProjectStatus::Funding).await;
        fx.ledger.queue_tx(
            "0xf1",
            Ok(vec![raw(
                "ProjectFunded",
                json!({ "projectId": 1, "funds": "50000000000000000000" }),
            )]),
        );

        fx.service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(50),
            )
            .await
            .unwrap();

        wait_for_project(&fx.store, &ProjectRef::Id(1), |p| {
            p.total_funded == Decimal::from(50)
        })
        .await;
        let project = fx.store.get_one(&ProjectRef::Id(1)).await.unwrap();
        assert_eq!(project.contributions, 1);
        // No ProjectStarted event was seen, so status is untouched.
        assert_eq!(project.current_status, ProjectStatus::Funding);

        let pushed = fx.notifier.pushed();
        assert!(pushed
            .iter()
            .any(|(w, t)| w == "alice" && t == "Funds transferred"));
        assert!(pushed
            .iter()
            .any(|(w, t)| w == "w-owner" && t == "Project funded"));
    }

    #[tokio::test]
    async fn fund_is_rejected_before_submission_when_balance_is_short() {
        let fx = fixture(1).await; // 1 smallest unit available
        seed_project(&fx, 1, &[100], ProjectStatus::Funding).await;

        let err = fx
            .service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(50),
            )
            .await;
        assert!(matches!(err, Err(ServiceError::Validation(_))));
        assert_eq!(fx.ledger.submissions(), 0);
        let records = fx
            .store
            .fundings(&FundingQuery {
                project_id: Some(1),
                wallet_id: None,
            })
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn fund_is_rejected_when_project_is_not_funding() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100], ProjectStatus::InProgress).await;

        let err = fx
            .service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(1),
            )
            .await;
        assert!(matches!(err, Err(ServiceError::Validation(_))));
        assert_eq!(fx.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn fund_of_unknown_project_is_not_found() {
        let fx = fixture(PLENTY).await;
        let err = fx
            .service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(9),
                Decimal::from(1),
            )
            .await;
        assert!(matches!(err, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn goal_reaching_receipt_starts_the_project() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100], ProjectStatus::Funding).await;
        fx.ledger.queue_tx(
            "0xf1",
            Ok(vec![
                raw(
                    "ProjectFunded",
                    json!({ "projectId": 1, "funds": "100000000000000000000" }),
                ),
                raw("ProjectStarted", json!({ "projectId": 1 })),
            ]),
        );

        fx.service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(100),
            )
            .await
            .unwrap();

        wait_for_project(&fx.store, &ProjectRef::Id(1), |p| {
            p.current_status == ProjectStatus::InProgress
        })
        .await;
        let project = fx.store.get_one(&ProjectRef::Id(1)).await.unwrap();
        assert_eq!(project.total_funded, Decimal::from(100));
    }

    #[tokio::test]
    async fn reverted_funding_notifies_the_funder_and_writes_nothing() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100], ProjectStatus::Funding).await;
        fx.ledger
            .queue_tx("0xf1", Err("Transaction 0xf1 reverted".to_string()));

        fx.service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(50),
            )
            .await
            .unwrap();

        wait_until(|| !fx.notifier.pushed().is_empty()).await;
        assert_eq!(
            fx.notifier.pushed()[0],
            ("alice".to_string(), "Funding failed".to_string())
        );
        let project = fx.store.get_one(&ProjectRef::Id(1)).await.unwrap();
        assert_eq!(project.total_funded, Decimal::ZERO);
    }

    /// Two funders race: both guard reads see FUNDING before either
    /// continuation runs. Both submissions proceed — the ledger, not this
    /// service, serializes them. Documented behavior, not a bug fix site.
    #[tokio::test]
    async fn racing_fund_calls_both_pass_the_guard_snapshot() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100], ProjectStatus::Funding).await;
        fx.ledger.queue_unmined_tx("0xr1");
        fx.ledger.queue_unmined_tx("0xr2");

        let first = fx
            .service
            .fund(
                "alice",
                &signer("0xalice"),
                &ProjectRef::Id(1),
                Decimal::from(60),
            )
            .await;
        let second = fx
            .service
            .fund(
                "bob",
                &signer("0xbob"),
                &ProjectRef::Id(1),
                Decimal::from(60),
            )
            .await;

        assert_eq!(first.unwrap(), "0xr1");
        assert_eq!(second.unwrap(), "0xr2");
        assert_eq!(fx.ledger.submissions(), 2);
    }

    // ── Set completed stage ──

    #[tokio::test]
    async fn stage_out_of_range_is_rejected_synchronously() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;

        let err = fx
            .service
            .set_completed_stage("w-rev", &signer("0xreviewer"), &ProjectRef::Id(1), 5)
            .await;
        assert!(matches!(err, Err(ServiceError::Validation(_))));
        assert_eq!(fx.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn non_reviewer_cannot_complete_a_stage() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;

        let err = fx
            .service
            .set_completed_stage("w-x", &signer("0ximpostor"), &ProjectRef::Id(1), 0)
            .await;
        assert!(matches!(err, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn stage_completion_only_allowed_while_in_progress() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::Funding).await;

        let err = fx
            .service
            .set_completed_stage("w-rev", &signer("0xreviewer"), &ProjectRef::Id(1), 0)
            .await;
        assert!(matches!(err, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn stage_completed_event_advances_the_stage() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;
        fx.ledger.queue_tx(
            "0xs1",
            Ok(vec![raw(
                "StageCompleted",
                json!({ "projectId": 1, "completedStage": 0 }),
            )]),
        );

        fx.service
            .set_completed_stage("w-rev", &signer("0xreviewer"), &ProjectRef::Id(1), 0)
            .await
            .unwrap();

        wait_for_project(&fx.store, &ProjectRef::Id(1), |p| p.current_stage == 1).await;
    }

    #[tokio::test]
    async fn final_stage_receipt_completes_the_project() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;
        fx.store
            .update_once(
                1,
                ProjectPatch {
                    current_stage: Some(1),
                    ..Default::default()
                },
                "0xseed1",
                2,
            )
            .await
            .unwrap();
        fx.ledger.queue_tx(
            "0xs2",
            Ok(vec![
                raw(
                    "StageCompleted",
                    json!({ "projectId": 1, "completedStage": 1 }),
                ),
                raw("ProjectCompleted", json!({ "projectId": 1 })),
            ]),
        );

        fx.service
            .set_completed_stage("w-rev", &signer("0xreviewer"), &ProjectRef::Id(1), 1)
            .await
            .unwrap();

        wait_for_project(&fx.store, &ProjectRef::Id(1), |p| {
            p.current_status == ProjectStatus::Completed
        })
        .await;
    }

    // ── Handler-level properties ──

    #[tokio::test]
    async fn duplicate_event_delivery_does_not_reapply() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;

        let handler = StageHandler {
            store: fx.store.clone(),
            wallets: fx.wallets.clone(),
            notifier: fx.notifier.clone(),
            project_id: 1,
            owner_address: "0xowner".to_string(),
            reviewer_address: "0xreviewer".to_string(),
            reviewer_wallet_id: "w-rev".to_string(),
        };
        let ctx = EventCtx {
            tx_hash: "0xs1".to_string(),
            index: 0,
        };
        let event = LedgerEvent::StageCompleted {
            project_id: 1,
            completed_stage: 0,
        };

        handler.on_event(event.clone(), &ctx).await.unwrap();
        assert_eq!(
            fx.store.get_one(&ProjectRef::Id(1)).await.unwrap().current_stage,
            1
        );

        // Same (tx_hash, index) delivered again: must not advance further.
        handler.on_event(event, &ctx).await.unwrap();
        assert_eq!(
            fx.store.get_one(&ProjectRef::Id(1)).await.unwrap().current_stage,
            1
        );
    }

    #[tokio::test]
    async fn redelivery_after_a_failed_attempt_still_applies_the_event() {
        let fx = fixture(PLENTY).await;
        let handler = StageHandler {
            store: fx.store.clone(),
            wallets: fx.wallets.clone(),
            notifier: fx.notifier.clone(),
            project_id: 1,
            owner_address: "0xowner".to_string(),
            reviewer_address: "0xreviewer".to_string(),
            reviewer_wallet_id: "w-rev".to_string(),
        };
        let ctx = EventCtx {
            tx_hash: "0xs1".to_string(),
            index: 0,
        };
        let event = LedgerEvent::StageCompleted {
            project_id: 1,
            completed_stage: 0,
        };

        // First delivery fails: the projection has no row for the project.
        assert!(handler.on_event(event.clone(), &ctx).await.is_err());

        // The failure must not burn the dedup key. Once the row exists,
        // redelivering the identical event applies it.
        seed_project(&fx, 1, &[100, 200], ProjectStatus::InProgress).await;
        handler.on_event(event, &ctx).await.unwrap();
        assert_eq!(
            fx.store.get_one(&ProjectRef::Id(1)).await.unwrap().current_stage,
            1
        );
    }

    #[tokio::test]
    async fn event_for_a_different_project_is_a_fatal_mismatch() {
        let fx = fixture(PLENTY).await;
        seed_project(&fx, 1, &[100], ProjectStatus::Funding).await;

        let handler = FundHandler {
            store: fx.store.clone(),
            wallets: fx.wallets.clone(),
            notifier: fx.notifier.clone(),
            project_id: 1,
            owner_address: "0xowner".to_string(),
            reviewer_address: "0xreviewer".to_string(),
            funder_wallet_id: "alice".to_string(),
        };
        let err = handler
            .on_event(
                LedgerEvent::ProjectFunded {
                    project_id: 2,
                    funds: 1,
                },
                &EventCtx {
                    tx_hash: "0xf1".to_string(),
                    index: 0,
                },
            )
            .await;
        assert!(matches!(err, Err(ServiceError::Unknown(_))));
        let project = fx.store.get_one(&ProjectRef::Id(1)).await.unwrap();
        assert_eq!(project.total_funded, Decimal::ZERO);
    }
}
