//! Stateless workflow preconditions.
//!
//! Every guard is a pure predicate over values the workflow already read;
//! a failing guard raises a typed error before anything is submitted to
//! the ledger. Identity-match and transition guards raise `Unknown`
//! instead of `Validation`: they can only fail on an internal
//! inconsistency, never on caller input.

use rust_decimal::Decimal;

use crate::errors::{Result, ServiceError};
use crate::store::{Project, ProjectStatus};

/// The operation requires the project to be in `expected` status.
pub fn require_status(project: &Project, expected: ProjectStatus) -> Result<()> {
    if project.current_status != expected {
        return Err(ServiceError::Validation(format!(
            "Project not in {expected} status. (current: {})",
            project.current_status
        )));
    }
    Ok(())
}

/// The completed stage must lie in `[current_stage, total_stages - 1]`:
/// no going backward, no skipping past the last stage.
pub fn require_stage_in_range(
    current_stage: i64,
    total_stages: i64,
    completed_stage: i64,
) -> Result<()> {
    if completed_stage < current_stage || completed_stage > total_stages - 1 {
        return Err(ServiceError::Validation(
            "Invalid value for new stage.".to_string(),
        ));
    }
    Ok(())
}

/// Only the project's stored reviewer may complete stages.
pub fn require_reviewer(project: &Project, caller_address: &str) -> Result<()> {
    if project.reviewer_address != caller_address {
        return Err(ServiceError::Validation(
            "Given reviewer address is incorrect for project.".to_string(),
        ));
    }
    Ok(())
}

/// The funder must hold at least the requested amount, in smallest units.
pub fn require_balance(available: u128, requested: u128) -> Result<()> {
    if available < requested {
        return Err(ServiceError::Validation(format!(
            "Insufficient funds. Funds available ({available}) < funds requested ({requested})"
        )));
    }
    Ok(())
}

/// Stage costs must be a non-empty list of strictly positive amounts.
pub fn require_stage_costs(costs: &[Decimal]) -> Result<()> {
    if costs.is_empty() {
        return Err(ServiceError::Validation(
            "A project needs at least one stage.".to_string(),
        ));
    }
    if costs.iter().any(|c| !c.is_sign_positive() || c.is_zero()) {
        return Err(ServiceError::Validation(
            "Every stage cost must be positive.".to_string(),
        ));
    }
    Ok(())
}

/// A receipt event reporting a different project than the workflow's
/// target means the workflow operated on the wrong project.
pub fn require_project_id_match(expected: i64, reported: i64) -> Result<()> {
    if expected != reported {
        return Err(ServiceError::Unknown(format!(
            "Event reported projectId {reported}, workflow targeted {expected}"
        )));
    }
    Ok(())
}

/// Status writes from event handlers must follow the forward-only machine.
pub fn require_transition(from: ProjectStatus, to: ProjectStatus) -> Result<()> {
    if !from.can_transition(to) {
        return Err(ServiceError::Unknown(format!(
            "Illegal status transition {from} -> {to}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
