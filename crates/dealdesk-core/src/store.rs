//! Persistence traits for the back office.
//!
//! Adapters live in `dealdesk-store`; the traits stay here so the engine can
//! depend on them without a crate cycle. All state transitions are
//! compare-and-set: the caller names the expected current state and the
//! store refuses to apply the change if the record has moved on.

use crate::audit::{ActionAppend, ComplianceAction};
use crate::types::{
    ChecklistEntry, ComplianceStatus, Deal, DealStatus, EscrowMilestone, ComplianceFlag,
    FlagResolution, FundingInstrument, FundingRequirement, InstrumentStage, ReleaseStatus,
    RequirementStatus, SettlementInstruction, VerificationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pagination window for list queries.
#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Result of an idempotent requirements upsert.
#[derive(Debug, Clone)]
pub struct RequirementsUpsert {
    /// Rows newly inserted by this call.
    pub inserted: usize,
    /// Full requirement set for the deal after the upsert.
    pub requirements: Vec<FundingRequirement>,
}

#[async_trait]
pub trait DealStore: Send + Sync {
    async fn create_deal(&self, deal: Deal) -> StoreResult<Deal>;

    async fn get_deal(&self, deal_id: &str) -> StoreResult<Deal>;

    async fn list_deals(&self, window: QueryWindow) -> StoreResult<Vec<Deal>>;

    /// Compare-and-set on the `(status, compliance_status)` pair.
    async fn set_deal_state(
        &self,
        deal_id: &str,
        expected: (DealStatus, ComplianceStatus),
        next: (DealStatus, ComplianceStatus),
        at: DateTime<Utc>,
    ) -> StoreResult<Deal>;
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn insert_flags(&self, flags: Vec<ComplianceFlag>) -> StoreResult<Vec<ComplianceFlag>>;

    async fn get_flag(&self, flag_id: &str) -> StoreResult<ComplianceFlag>;

    async fn list_flags(&self, deal_id: &str) -> StoreResult<Vec<ComplianceFlag>>;

    /// Resolve one flag and reconcile the owning deal's status in a single
    /// atomic step. Resolving an already-resolved flag is a conflict and
    /// leaves the original resolution untouched.
    async fn resolve_and_reconcile(
        &self,
        flag_id: &str,
        resolved_by: &str,
        notes: &str,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<FlagResolution>;
}

#[async_trait]
pub trait RequirementStore: Send + Sync {
    /// Insert requirements that do not already exist for
    /// `(deal_id, requirement_type, label)`; existing rows keep their status.
    async fn upsert_requirements(
        &self,
        deal_id: &str,
        requirements: Vec<FundingRequirement>,
    ) -> StoreResult<RequirementsUpsert>;

    async fn get_requirement(&self, requirement_id: &str) -> StoreResult<FundingRequirement>;

    async fn list_requirements(&self, deal_id: &str) -> StoreResult<Vec<FundingRequirement>>;

    async fn transition_requirement(
        &self,
        requirement_id: &str,
        expected: RequirementStatus,
        next: RequirementStatus,
        reviewer: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingRequirement>;
}

#[async_trait]
pub trait InstrumentStore: Send + Sync {
    async fn create_instrument(&self, instrument: FundingInstrument)
        -> StoreResult<FundingInstrument>;

    async fn get_instrument(&self, instrument_id: &str) -> StoreResult<FundingInstrument>;

    async fn list_instruments(&self, deal_id: &str) -> StoreResult<Vec<FundingInstrument>>;

    /// Compare-and-set the trust state. `expected_from` lists the states the
    /// transition may start from; actor and notes are recorded on the
    /// approval or rejection fields as appropriate for `to`.
    async fn set_verification(
        &self,
        instrument_id: &str,
        expected_from: &[VerificationStatus],
        to: VerificationStatus,
        actor: Option<&str>,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument>;

    async fn set_stage(
        &self,
        instrument_id: &str,
        expected: InstrumentStage,
        next: InstrumentStage,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn create_settlement(
        &self,
        instruction: SettlementInstruction,
    ) -> StoreResult<SettlementInstruction>;

    async fn get_settlement(&self, settlement_id: &str) -> StoreResult<SettlementInstruction>;

    async fn list_settlements(&self, deal_id: &str) -> StoreResult<Vec<SettlementInstruction>>;

    /// Replace the checklist snapshot, guarded by the expected revision. The
    /// stored revision becomes `expected_revision + 1`.
    async fn replace_checklist(
        &self,
        settlement_id: &str,
        expected_revision: u32,
        checklist: Vec<ChecklistEntry>,
        is_validated: bool,
        revalidated_at: DateTime<Utc>,
    ) -> StoreResult<SettlementInstruction>;

    async fn create_milestones(
        &self,
        milestones: Vec<EscrowMilestone>,
    ) -> StoreResult<Vec<EscrowMilestone>>;

    async fn get_milestone(&self, milestone_id: &str) -> StoreResult<EscrowMilestone>;

    async fn list_milestones(&self, settlement_id: &str) -> StoreResult<Vec<EscrowMilestone>>;

    async fn transition_milestone(
        &self,
        milestone_id: &str,
        expected: ReleaseStatus,
        next: ReleaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<EscrowMilestone>;
}

#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Append an action to the hash chain, assigning sequence and hashes.
    async fn append_action(&self, event: ActionAppend) -> StoreResult<ComplianceAction>;

    /// Actions for a deal, newest first.
    async fn list_actions(
        &self,
        deal_id: &str,
        window: QueryWindow,
    ) -> StoreResult<Vec<ComplianceAction>>;

    async fn latest_action_hash(&self) -> StoreResult<Option<String>>;
}

/// Everything the engine needs from a backend.
pub trait BackOfficeStore:
    DealStore + FlagStore + RequirementStore + InstrumentStore + SettlementStore + ActionStore
{
}

impl<T> BackOfficeStore for T where
    T: DealStore + FlagStore + RequirementStore + InstrumentStore + SettlementStore + ActionStore
{
}
