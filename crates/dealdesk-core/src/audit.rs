//! Hash-chained compliance action trail.
//!
//! Every state change appends an action whose hash covers the previous
//! action's hash, so tampering with any recorded entry breaks every hash
//! after it. Actions chain per deal (the predecessor is the same deal's
//! most recent action) so a per-deal listing verifies on its own, even when
//! several deals' actions interleave in the store. Sequence numbers remain
//! store-wide. Hashing is deterministic over the canonical serde encoding.

use crate::store::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ScreeningRun,
    FlagRaised,
    FlagResolved,
    StatusChanged,
    RequirementsPersisted,
    RequirementReviewed,
    InstrumentRegistered,
    InstrumentVerified,
    InstrumentApproved,
    InstrumentRejected,
    StageAdvanced,
    SettlementPersisted,
    SettlementRevalidated,
    MilestoneReleased,
    MilestoneDisputed,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ScreeningRun => "screening_run",
            ActionKind::FlagRaised => "flag_raised",
            ActionKind::FlagResolved => "flag_resolved",
            ActionKind::StatusChanged => "status_changed",
            ActionKind::RequirementsPersisted => "requirements_persisted",
            ActionKind::RequirementReviewed => "requirement_reviewed",
            ActionKind::InstrumentRegistered => "instrument_registered",
            ActionKind::InstrumentVerified => "instrument_verified",
            ActionKind::InstrumentApproved => "instrument_approved",
            ActionKind::InstrumentRejected => "instrument_rejected",
            ActionKind::StageAdvanced => "stage_advanced",
            ActionKind::SettlementPersisted => "settlement_persisted",
            ActionKind::SettlementRevalidated => "settlement_revalidated",
            ActionKind::MilestoneReleased => "milestone_released",
            ActionKind::MilestoneDisputed => "milestone_disputed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "screening_run" => ActionKind::ScreeningRun,
            "flag_raised" => ActionKind::FlagRaised,
            "flag_resolved" => ActionKind::FlagResolved,
            "status_changed" => ActionKind::StatusChanged,
            "requirements_persisted" => ActionKind::RequirementsPersisted,
            "requirement_reviewed" => ActionKind::RequirementReviewed,
            "instrument_registered" => ActionKind::InstrumentRegistered,
            "instrument_verified" => ActionKind::InstrumentVerified,
            "instrument_approved" => ActionKind::InstrumentApproved,
            "instrument_rejected" => ActionKind::InstrumentRejected,
            "stage_advanced" => ActionKind::StageAdvanced,
            "settlement_persisted" => ActionKind::SettlementPersisted,
            "settlement_revalidated" => ActionKind::SettlementRevalidated,
            "milestone_released" => ActionKind::MilestoneReleased,
            "milestone_disputed" => ActionKind::MilestoneDisputed,
            _ => return None,
        })
    }
}

/// What a caller submits for recording. Identity, sequence and hashes are
/// assigned by the store on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAppend {
    pub deal_id: Option<String>,
    pub actor: String,
    pub kind: ActionKind,
    pub detail: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// A recorded action. `previous_hash` is `None` only for the first entry of
/// a deal's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceAction {
    pub action_id: String,
    pub sequence: u64,
    pub deal_id: Option<String>,
    pub actor: String,
    pub kind: ActionKind,
    pub detail: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Compute the chain hash for an action about to be appended at `sequence`.
pub fn compute_action_hash(
    event: &ActionAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StoreResult<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous_hash.unwrap_or("genesis").as_bytes());
    hasher.update(&sequence.to_be_bytes());
    let encoded = serde_json::to_vec(event)
        .map_err(|e| StoreError::Serialization(format!("action encode failed: {e}")))?;
    hasher.update(&encoded);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Verify that one deal's actions, ordered by ascending sequence, form an
/// unbroken chain.
pub fn verify_chain(actions: &[ComplianceAction]) -> bool {
    let mut previous: Option<&str> = None;
    for action in actions {
        if action.previous_hash.as_deref() != previous {
            return false;
        }
        let event = ActionAppend {
            deal_id: action.deal_id.clone(),
            actor: action.actor.clone(),
            kind: action.kind,
            detail: action.detail.clone(),
            payload: action.payload.clone(),
            occurred_at: action.occurred_at,
        };
        match compute_action_hash(&event, previous, action.sequence) {
            Ok(expected) if expected == action.hash => {}
            _ => return false,
        }
        previous = Some(action.hash.as_str());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(detail: &str) -> ActionAppend {
        ActionAppend {
            deal_id: Some("deal-1".to_string()),
            actor: "ops.desk".to_string(),
            kind: ActionKind::StatusChanged,
            detail: detail.to_string(),
            payload: json!({"from": "inquiry", "to": "qualified"}),
            occurred_at: Utc::now(),
        }
    }

    fn record(event: ActionAppend, previous: Option<&str>, sequence: u64) -> ComplianceAction {
        let hash = compute_action_hash(&event, previous, sequence).unwrap();
        ComplianceAction {
            action_id: format!("act-{sequence}"),
            sequence,
            deal_id: event.deal_id,
            actor: event.actor,
            kind: event.kind,
            detail: event.detail,
            payload: event.payload,
            occurred_at: event.occurred_at,
            previous_hash: previous.map(str::to_string),
            hash,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let e = event("promoted");
        let a = compute_action_hash(&e, None, 1).unwrap();
        let b = compute_action_hash(&e, None, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_depends_on_predecessor_and_sequence() {
        let e = event("promoted");
        let base = compute_action_hash(&e, None, 1).unwrap();
        assert_ne!(base, compute_action_hash(&e, Some("abc"), 1).unwrap());
        assert_ne!(base, compute_action_hash(&e, None, 2).unwrap());
    }

    #[test]
    fn intact_chain_verifies() {
        let first = record(event("one"), None, 1);
        let second = record(event("two"), Some(first.hash.as_str()), 2);
        let third = record(event("three"), Some(second.hash.as_str()), 3);
        assert!(verify_chain(&[first, second, third]));
    }

    #[test]
    fn tampered_entry_breaks_verification() {
        let first = record(event("one"), None, 1);
        let mut second = record(event("two"), Some(first.hash.as_str()), 2);
        second.detail = "rewritten".to_string();
        assert!(!verify_chain(&[first, second]));
    }

    #[test]
    fn kinds_round_trip_through_strings() {
        for kind in [
            ActionKind::ScreeningRun,
            ActionKind::FlagResolved,
            ActionKind::SettlementRevalidated,
            ActionKind::MilestoneDisputed,
        ] {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("unknown"), None);
    }
}
