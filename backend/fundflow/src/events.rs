//! Canonical event types emitted by the project-funding contract.
//!
//! Receipts carry events as `{event, args}` JSON objects. They are decoded
//! into a closed enum and matched exhaustively by the workflow handlers;
//! names this service does not recognise decode to [`LedgerEvent::Unknown`]
//! so the unexpected case is handled explicitly instead of through a
//! missing-key lookup failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, ServiceError};

/// An event exactly as it appears in a confirmed receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name as emitted by the contract.
    pub event: String,
    /// Decoded event arguments.
    pub args: Value,
}

/// All recognised event kinds from the funding contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// A new project was registered; carries the ledger-assigned identity.
    ProjectCreated { project_id: i64 },
    /// A contribution was accepted; `funds` is in the smallest unit.
    ProjectFunded { project_id: i64, funds: u128 },
    /// The funding goal was reached and work began.
    ProjectStarted { project_id: i64 },
    /// The reviewer marked a stage complete.
    StageCompleted { project_id: i64, completed_stage: i64 },
    /// The final stage was completed.
    ProjectCompleted { project_id: i64 },
    /// An event from this contract that we don't recognise.
    Unknown { name: String },
}

impl LedgerEvent {
    /// Decode a raw receipt event.
    ///
    /// A recognised name with malformed arguments is an error; only the
    /// name itself being unrecognised yields [`LedgerEvent::Unknown`].
    pub fn decode(raw: &RawEvent) -> Result<Self> {
        match raw.event.as_str() {
            "ProjectCreated" => Ok(Self::ProjectCreated {
                project_id: arg_i64(raw, "projectId")?,
            }),
            "ProjectFunded" => Ok(Self::ProjectFunded {
                project_id: arg_i64(raw, "projectId")?,
                funds: arg_u128(raw, "funds")?,
            }),
            "ProjectStarted" => Ok(Self::ProjectStarted {
                project_id: arg_i64(raw, "projectId")?,
            }),
            "StageCompleted" => Ok(Self::StageCompleted {
                project_id: arg_i64(raw, "projectId")?,
                completed_stage: arg_i64(raw, "completedStage")?,
            }),
            "ProjectCompleted" => Ok(Self::ProjectCompleted {
                project_id: arg_i64(raw, "projectId")?,
            }),
            other => Ok(Self::Unknown {
                name: other.to_string(),
            }),
        }
    }

    /// Short identifier used in logs.
    pub fn name(&self) -> &str {
        match self {
            Self::ProjectCreated { .. } => "ProjectCreated",
            Self::ProjectFunded { .. } => "ProjectFunded",
            Self::ProjectStarted { .. } => "ProjectStarted",
            Self::StageCompleted { .. } => "StageCompleted",
            Self::ProjectCompleted { .. } => "ProjectCompleted",
            Self::Unknown { name } => name,
        }
    }
}

/// Extract an integer argument that may arrive as a JSON number or a
/// decimal string (large values are stringified by the gateway).
fn arg_i64(raw: &RawEvent, key: &str) -> Result<i64> {
    let value = arg(raw, key)?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| malformed(raw, key, value))
}

fn arg_u128(raw: &RawEvent, key: &str) -> Result<u128> {
    let value = arg(raw, key)?;
    value
        .as_u64()
        .map(u128::from)
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| malformed(raw, key, value))
}

fn arg<'a>(raw: &'a RawEvent, key: &str) -> Result<&'a Value> {
    raw.args.get(key).ok_or_else(|| {
        ServiceError::Unknown(format!("Event {} is missing argument '{key}'", raw.event))
    })
}

fn malformed(raw: &RawEvent, key: &str, value: &Value) -> ServiceError {
    ServiceError::Unknown(format!(
        "Event {} argument '{key}' is malformed: {value}",
        raw.event
    ))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
