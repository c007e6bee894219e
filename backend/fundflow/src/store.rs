//! Local projection of ledger state — pool setup, migrations and the
//! project/funding repository.
//!
//! The store owns uniqueness and referential grouping, nothing else:
//! status machines and stage rules live in the workflows. Rows for a
//! project exist only after its creating transaction confirmed; until the
//! ledger assigns a numeric identity the creating transaction's hash is
//! the only usable key, so every lookup accepts either.
//!
//! Event-driven writes are keyed by the `(tx_hash, event_index)` of the
//! receipt event that caused them. The dedup mark commits in the same
//! transaction as the write it guards: a failing write releases the mark,
//! so a redelivery of the same event can still apply it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{Result, ServiceError};

/// Establish the SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(ServiceError::Database)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Domain types
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Funding,
    InProgress,
    Completed,
    Canceled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Funding => "FUNDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "FUNDING" => Ok(Self::Funding),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(ServiceError::Unknown(format!(
                "Unrecognised project status in store: {other}"
            ))),
        }
    }

    /// Forward-only lifecycle: `FUNDING → IN_PROGRESS → COMPLETED`, with
    /// `CANCELED` reachable from `FUNDING`. Terminal states are final.
    pub fn can_transition(self, next: ProjectStatus) -> bool {
        matches!(
            (self, next),
            (Self::Funding, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::Funding, Self::Canceled)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-phase project identity: the creating transaction's hash before the
/// ledger assigns a numeric id, the numeric id afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectRef {
    TxHash(String),
    Id(i64),
}

impl std::fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TxHash(hash) => write!(f, "tx {hash}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// A project as read from the projection, annotated with its derived
/// aggregates. `total_funded` is always recomputed from funding records,
/// never stored.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Project {
    pub project_id: i64,
    pub tx_hash: String,
    pub owner_address: String,
    pub reviewer_address: String,
    pub total_stages: i64,
    pub current_stage: i64,
    pub current_status: ProjectStatus,
    pub stages_cost: Vec<Decimal>,
    pub total_funded: Decimal,
    pub contributions: i64,
    pub contributors: i64,
}

/// Insert payload for a confirmed project creation.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub tx_hash: String,
    pub project_id: i64,
    pub owner_address: String,
    pub reviewer_address: String,
    pub stages_cost: Vec<Decimal>,
}

/// Partial update applied by the event-handling continuations.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub current_stage: Option<i64>,
    pub current_status: Option<ProjectStatus>,
}

/// Typed query specification for project reads.
#[derive(Debug, Clone, Default)]
pub struct ProjectQuery {
    pub reference: Option<ProjectRef>,
    pub status: Option<ProjectStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// An append-only funding record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FundingRecord {
    pub project_id: i64,
    pub wallet_id: String,
    pub amount: Decimal,
    pub tx_hash: String,
    pub date: DateTime<Utc>,
}

/// Typed query specification for funding reads.
#[derive(Debug, Clone, Default)]
pub struct FundingQuery {
    pub project_id: Option<i64>,
    pub wallet_id: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Repository
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: i64,
    tx_hash: String,
    owner_address: String,
    reviewer_address: String,
    total_stages: i64,
    current_stage: i64,
    current_status: String,
}

#[derive(sqlx::FromRow)]
struct FundingRow {
    project_id: i64,
    wallet_id: String,
    amount: String,
    tx_hash: String,
    date: String,
}

#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a project and its per-stage costs as one atomic unit, keyed
    /// by the receipt event that reported the creation.
    ///
    /// Returns `false` when that event was already applied. A duplicate
    /// `project_id` or `tx_hash` is a conflict; any failure after the
    /// project insert rolls the whole unit back, dedup mark included.
    pub async fn create(&self, project: NewProject, event_index: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !mark_applied(&mut tx, &project.tx_hash, event_index).await? {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO projects
                (project_id, tx_hash, owner_address, reviewer_address,
                 total_stages, current_stage, current_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 'FUNDING', ?6)
            "#,
        )
        .bind(project.project_id)
        .bind(&project.tx_hash)
        .bind(&project.owner_address)
        .bind(&project.reviewer_address)
        .bind(project.stages_cost.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "Project already exists."))?;

        for (stage, cost) in project.stages_cost.iter().enumerate() {
            sqlx::query(
                "INSERT INTO stage_costs (project_id, stage, cost) VALUES (?1, ?2, ?3)",
            )
            .bind(project.project_id)
            .bind(stage as i64)
            .bind(cost.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Generic filtered read. Each returned project is annotated with its
    /// stage costs and funding aggregates.
    pub async fn get(&self, query: &ProjectQuery) -> Result<Vec<Project>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT project_id, tx_hash, owner_address, reviewer_address, \
             total_stages, current_stage, current_status FROM projects WHERE 1 = 1",
        );
        match &query.reference {
            Some(ProjectRef::Id(id)) => {
                builder.push(" AND project_id = ").push_bind(*id);
            }
            Some(ProjectRef::TxHash(hash)) => {
                builder.push(" AND tx_hash = ").push_bind(hash.clone());
            }
            None => {}
        }
        if let Some(status) = query.status {
            builder.push(" AND current_status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY project_id DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }
        if let Some(offset) = query.offset {
            builder.push(" OFFSET ").push_bind(offset);
        }

        let rows: Vec<ProjectRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in rows {
            projects.push(self.annotate(row).await?);
        }
        Ok(projects)
    }

    /// Single-project lookup by either identity phase.
    pub async fn get_one(&self, reference: &ProjectRef) -> Result<Project> {
        let found = self
            .get(&ProjectQuery {
                reference: Some(reference.clone()),
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        found.into_iter().next().ok_or_else(|| {
            ServiceError::NotFound(format!("No project found with {reference}"))
        })
    }

    /// Apply a partial update to a project, keyed by the receipt event
    /// that caused the patch.
    ///
    /// Returns `false` when that event was already applied. The patch and
    /// the dedup mark commit together; a failing patch releases the mark.
    pub async fn update_once(
        &self,
        project_id: i64,
        patch: ProjectPatch,
        tx_hash: &str,
        event_index: i64,
    ) -> Result<bool> {
        let Some(mut builder) = patch_query(project_id, &patch) else {
            return Ok(true);
        };
        let mut tx = self.pool.begin().await?;
        if !mark_applied(&mut tx, tx_hash, event_index).await? {
            return Ok(false);
        }
        let result = builder.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!(
                "No project found with id {project_id}"
            )));
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Append a funding record, keyed by the receipt event that reported
    /// the contribution.
    ///
    /// Returns `false` when that event was already applied. The record and
    /// the dedup mark commit together.
    pub async fn fund(
        &self,
        project_id: i64,
        wallet_id: &str,
        amount: Decimal,
        tx_hash: &str,
        event_index: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !mark_applied(&mut tx, tx_hash, event_index).await? {
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO fundings (project_id, wallet_id, amount, tx_hash, date)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(project_id)
        .bind(wallet_id)
        .bind(amount.to_string())
        .bind(tx_hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Whether a receipt event has already been applied to the projection.
    pub async fn event_applied(&self, tx_hash: &str, event_index: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM applied_events WHERE tx_hash = ?1 AND event_index = ?2",
        )
        .bind(tx_hash)
        .bind(event_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Filtered funding reads, oldest first.
    pub async fn fundings(&self, query: &FundingQuery) -> Result<Vec<FundingRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT project_id, wallet_id, amount, tx_hash, date FROM fundings WHERE 1 = 1",
        );
        if let Some(project_id) = query.project_id {
            builder.push(" AND project_id = ").push_bind(project_id);
        }
        if let Some(wallet_id) = &query.wallet_id {
            builder.push(" AND wallet_id = ").push_bind(wallet_id.clone());
        }
        builder.push(" ORDER BY id ASC");

        let rows: Vec<FundingRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(funding_from_row).collect()
    }

    async fn annotate(&self, row: ProjectRow) -> Result<Project> {
        let costs: Vec<(String,)> = sqlx::query_as(
            "SELECT cost FROM stage_costs WHERE project_id = ?1 ORDER BY stage ASC",
        )
        .bind(row.project_id)
        .fetch_all(&self.pool)
        .await?;
        let stages_cost = costs
            .into_iter()
            .map(|(c,)| parse_amount(&c))
            .collect::<Result<Vec<_>>>()?;

        let fundings = self
            .fundings(&FundingQuery {
                project_id: Some(row.project_id),
                wallet_id: None,
            })
            .await?;
        let total_funded = fundings.iter().map(|f| f.amount).sum();
        let contributions = fundings.len() as i64;
        let contributors = {
            let mut wallets: Vec<&str> = fundings.iter().map(|f| f.wallet_id.as_str()).collect();
            wallets.sort_unstable();
            wallets.dedup();
            wallets.len() as i64
        };

        Ok(Project {
            project_id: row.project_id,
            tx_hash: row.tx_hash,
            owner_address: row.owner_address,
            reviewer_address: row.reviewer_address,
            total_stages: row.total_stages,
            current_stage: row.current_stage,
            current_status: ProjectStatus::parse(&row.current_status)?,
            stages_cost,
            total_funded,
            contributions,
            contributors,
        })
    }
}

fn funding_from_row(row: FundingRow) -> Result<FundingRecord> {
    Ok(FundingRecord {
        project_id: row.project_id,
        wallet_id: row.wallet_id,
        amount: parse_amount(&row.amount)?,
        tx_hash: row.tx_hash,
        date: DateTime::parse_from_rfc3339(&row.date)
            .map_err(|e| ServiceError::Unknown(format!("Bad timestamp in store: {e}")))?
            .with_timezone(&Utc),
    })
}

fn parse_amount(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| ServiceError::Unknown(format!("Bad amount in store '{raw}': {e}")))
}

/// Record the `(tx_hash, event_index)` dedup key on an open transaction.
/// `false` means the event was already applied; the enclosing transaction
/// must then not commit any effect for it.
async fn mark_applied(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    tx_hash: &str,
    event_index: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO applied_events (tx_hash, event_index) VALUES (?1, ?2)",
    )
    .bind(tx_hash)
    .bind(event_index)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Build the dynamic UPDATE for a patch; `None` when the patch is empty.
fn patch_query(project_id: i64, patch: &ProjectPatch) -> Option<QueryBuilder<'static, Sqlite>> {
    if patch.current_stage.is_none() && patch.current_status.is_none() {
        return None;
    }
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE projects SET ");
    let mut first = true;
    if let Some(stage) = patch.current_stage {
        builder.push("current_stage = ").push_bind(stage);
        first = false;
    }
    if let Some(status) = patch.current_status {
        if !first {
            builder.push(", ");
        }
        builder.push("current_status = ").push_bind(status.as_str());
    }
    builder.push(" WHERE project_id = ").push_bind(project_id);
    Some(builder)
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> ServiceError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ServiceError::Conflict(message.to_string())
        }
        _ => ServiceError::Database(err),
    }
}

/// In-memory pool with migrations applied, shared by the crate's tests.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
