//! In-memory backend for tests and development.
//!
//! A single lock guards all collections so cross-entity operations
//! (resolving a flag and reconciling its deal) stay atomic, matching the
//! transactional behavior of the Postgres adapter.

use crate::{apply_window, poisoned};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealdesk_core::audit::{compute_action_hash, ActionAppend, ComplianceAction};
use dealdesk_core::reconciler;
use dealdesk_core::store::{
    ActionStore, DealStore, FlagStore, InstrumentStore, QueryWindow, RequirementStore,
    RequirementsUpsert, SettlementStore, StoreError, StoreResult,
};
use dealdesk_core::types::{
    ChecklistEntry, ComplianceFlag, ComplianceStatus, Deal, DealStatus, EscrowMilestone,
    FlagResolution, FundingInstrument, FundingRequirement, InstrumentStage, ReleaseStatus,
    RequirementStatus, SettlementInstruction, VerificationStatus,
};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    deals: HashMap<String, Deal>,
    flags: HashMap<String, ComplianceFlag>,
    requirements: HashMap<String, FundingRequirement>,
    instruments: HashMap<String, FundingInstrument>,
    settlements: HashMap<String, SettlementInstruction>,
    milestones: HashMap<String, EscrowMilestone>,
    actions: Vec<ComplianceAction>,
}

#[derive(Default)]
pub struct InMemoryBackOfficeStore {
    state: RwLock<MemoryState>,
}

impl InMemoryBackOfficeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DealStore for InMemoryBackOfficeStore {
    async fn create_deal(&self, deal: Deal) -> StoreResult<Deal> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.deals.contains_key(&deal.deal_id) {
            return Err(StoreError::Conflict(format!(
                "deal {} already exists",
                deal.deal_id
            )));
        }
        state.deals.insert(deal.deal_id.clone(), deal.clone());
        Ok(deal)
    }

    async fn get_deal(&self, deal_id: &str) -> StoreResult<Deal> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .deals
            .get(deal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("deal {deal_id}")))
    }

    async fn list_deals(&self, window: QueryWindow) -> StoreResult<Vec<Deal>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut deals: Vec<Deal> = state.deals.values().cloned().collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.deal_id.cmp(&b.deal_id)));
        Ok(apply_window(deals, window))
    }

    async fn set_deal_state(
        &self,
        deal_id: &str,
        expected: (DealStatus, ComplianceStatus),
        next: (DealStatus, ComplianceStatus),
        at: DateTime<Utc>,
    ) -> StoreResult<Deal> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let deal = state
            .deals
            .get_mut(deal_id)
            .ok_or_else(|| StoreError::NotFound(format!("deal {deal_id}")))?;
        if (deal.status, deal.compliance_status) != expected {
            return Err(StoreError::InvariantViolation(format!(
                "deal {deal_id} is ({:?}, {:?}), expected ({:?}, {:?})",
                deal.status, deal.compliance_status, expected.0, expected.1
            )));
        }
        deal.status = next.0;
        deal.compliance_status = next.1;
        deal.updated_at = at;
        Ok(deal.clone())
    }
}

#[async_trait]
impl FlagStore for InMemoryBackOfficeStore {
    async fn insert_flags(&self, flags: Vec<ComplianceFlag>) -> StoreResult<Vec<ComplianceFlag>> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        for flag in &flags {
            if !state.deals.contains_key(&flag.deal_id) {
                return Err(StoreError::NotFound(format!("deal {}", flag.deal_id)));
            }
            state.flags.insert(flag.flag_id.clone(), flag.clone());
        }
        Ok(flags)
    }

    async fn get_flag(&self, flag_id: &str) -> StoreResult<ComplianceFlag> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .flags
            .get(flag_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("flag {flag_id}")))
    }

    async fn list_flags(&self, deal_id: &str) -> StoreResult<Vec<ComplianceFlag>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut flags: Vec<ComplianceFlag> = state
            .flags
            .values()
            .filter(|f| f.deal_id == deal_id)
            .cloned()
            .collect();
        flags.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.flag_id.cmp(&b.flag_id)));
        Ok(flags)
    }

    async fn resolve_and_reconcile(
        &self,
        flag_id: &str,
        resolved_by: &str,
        notes: &str,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<FlagResolution> {
        let mut state = self.state.write().map_err(|_| poisoned())?;

        let flag = state
            .flags
            .get_mut(flag_id)
            .ok_or_else(|| StoreError::NotFound(format!("flag {flag_id}")))?;
        if flag.resolved {
            return Err(StoreError::Conflict(format!(
                "flag {flag_id} is already resolved"
            )));
        }
        flag.resolved = true;
        flag.resolved_by = Some(resolved_by.to_string());
        flag.resolved_at = Some(resolved_at);
        flag.resolution_notes = Some(notes.to_string());
        let flag = flag.clone();

        let unresolved: Vec<&ComplianceFlag> = state
            .flags
            .values()
            .filter(|f| f.deal_id == flag.deal_id && !f.resolved)
            .collect();
        let blocking = unresolved.iter().filter(|f| f.blocks_execution).count();
        let total = unresolved.len();

        let deal = state
            .deals
            .get_mut(&flag.deal_id)
            .ok_or_else(|| StoreError::NotFound(format!("deal {}", flag.deal_id)))?;
        let (status, compliance) =
            reconciler::reconcile_after_resolution(deal.status, blocking, total);
        deal.status = status;
        deal.compliance_status = compliance;
        deal.updated_at = resolved_at;
        let deal = deal.clone();

        Ok(FlagResolution { flag, deal })
    }
}

#[async_trait]
impl RequirementStore for InMemoryBackOfficeStore {
    async fn upsert_requirements(
        &self,
        deal_id: &str,
        requirements: Vec<FundingRequirement>,
    ) -> StoreResult<RequirementsUpsert> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if !state.deals.contains_key(deal_id) {
            return Err(StoreError::NotFound(format!("deal {deal_id}")));
        }

        let mut inserted = 0;
        for requirement in requirements {
            if requirement.deal_id != deal_id {
                return Err(StoreError::InvalidInput(format!(
                    "requirement {} does not belong to deal {deal_id}",
                    requirement.requirement_id
                )));
            }
            let exists = state.requirements.values().any(|r| {
                r.deal_id == deal_id
                    && r.requirement_type == requirement.requirement_type
                    && r.label == requirement.label
            });
            if !exists {
                state
                    .requirements
                    .insert(requirement.requirement_id.clone(), requirement);
                inserted += 1;
            }
        }

        let mut all: Vec<FundingRequirement> = state
            .requirements
            .values()
            .filter(|r| r.deal_id == deal_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.requirement_id.cmp(&b.requirement_id))
        });
        Ok(RequirementsUpsert {
            inserted,
            requirements: all,
        })
    }

    async fn get_requirement(&self, requirement_id: &str) -> StoreResult<FundingRequirement> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .requirements
            .get(requirement_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("requirement {requirement_id}")))
    }

    async fn list_requirements(&self, deal_id: &str) -> StoreResult<Vec<FundingRequirement>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut requirements: Vec<FundingRequirement> = state
            .requirements
            .values()
            .filter(|r| r.deal_id == deal_id)
            .cloned()
            .collect();
        requirements.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.requirement_id.cmp(&b.requirement_id))
        });
        Ok(requirements)
    }

    async fn transition_requirement(
        &self,
        requirement_id: &str,
        expected: RequirementStatus,
        next: RequirementStatus,
        reviewer: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingRequirement> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let requirement = state
            .requirements
            .get_mut(requirement_id)
            .ok_or_else(|| StoreError::NotFound(format!("requirement {requirement_id}")))?;
        if requirement.status != expected {
            return Err(StoreError::InvariantViolation(format!(
                "requirement {requirement_id} is {:?}, expected {:?}",
                requirement.status, expected
            )));
        }
        requirement.status = next;
        if let Some(reviewer) = reviewer {
            requirement.reviewer = Some(reviewer.to_string());
        }
        requirement.updated_at = at;
        Ok(requirement.clone())
    }
}

#[async_trait]
impl InstrumentStore for InMemoryBackOfficeStore {
    async fn create_instrument(
        &self,
        instrument: FundingInstrument,
    ) -> StoreResult<FundingInstrument> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if !state.deals.contains_key(&instrument.deal_id) {
            return Err(StoreError::NotFound(format!("deal {}", instrument.deal_id)));
        }
        state
            .instruments
            .insert(instrument.instrument_id.clone(), instrument.clone());
        Ok(instrument)
    }

    async fn get_instrument(&self, instrument_id: &str) -> StoreResult<FundingInstrument> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .instruments
            .get(instrument_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("instrument {instrument_id}")))
    }

    async fn list_instruments(&self, deal_id: &str) -> StoreResult<Vec<FundingInstrument>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut instruments: Vec<FundingInstrument> = state
            .instruments
            .values()
            .filter(|i| i.deal_id == deal_id)
            .cloned()
            .collect();
        instruments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.instrument_id.cmp(&b.instrument_id))
        });
        Ok(instruments)
    }

    async fn set_verification(
        &self,
        instrument_id: &str,
        expected_from: &[VerificationStatus],
        to: VerificationStatus,
        actor: Option<&str>,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let instrument = state
            .instruments
            .get_mut(instrument_id)
            .ok_or_else(|| StoreError::NotFound(format!("instrument {instrument_id}")))?;
        if !expected_from.contains(&instrument.verification_status) {
            return Err(StoreError::InvariantViolation(format!(
                "instrument {instrument_id} is {:?}, expected one of {:?}",
                instrument.verification_status, expected_from
            )));
        }
        instrument.verification_status = to;
        match to {
            VerificationStatus::PendingHumanReview => {
                instrument.last_verified_at = Some(at);
            }
            VerificationStatus::HumanApproved => {
                instrument.approved_by = actor.map(str::to_string);
                instrument.approved_at = Some(at);
                instrument.approval_notes = notes.map(str::to_string);
            }
            VerificationStatus::HumanRejected => {
                instrument.rejected_by = actor.map(str::to_string);
                instrument.rejected_at = Some(at);
                instrument.rejection_reason = notes.map(str::to_string);
            }
            VerificationStatus::Unverified => {}
        }
        instrument.updated_at = at;
        Ok(instrument.clone())
    }

    async fn set_stage(
        &self,
        instrument_id: &str,
        expected: InstrumentStage,
        next: InstrumentStage,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let instrument = state
            .instruments
            .get_mut(instrument_id)
            .ok_or_else(|| StoreError::NotFound(format!("instrument {instrument_id}")))?;
        if instrument.stage != expected {
            return Err(StoreError::InvariantViolation(format!(
                "instrument {instrument_id} is {:?}, expected {:?}",
                instrument.stage, expected
            )));
        }
        instrument.stage = next;
        instrument.updated_at = at;
        Ok(instrument.clone())
    }
}

#[async_trait]
impl SettlementStore for InMemoryBackOfficeStore {
    async fn create_settlement(
        &self,
        instruction: SettlementInstruction,
    ) -> StoreResult<SettlementInstruction> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if !state.deals.contains_key(&instruction.deal_id) {
            return Err(StoreError::NotFound(format!(
                "deal {}",
                instruction.deal_id
            )));
        }
        state
            .settlements
            .insert(instruction.settlement_id.clone(), instruction.clone());
        Ok(instruction)
    }

    async fn get_settlement(&self, settlement_id: &str) -> StoreResult<SettlementInstruction> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .settlements
            .get(settlement_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("settlement {settlement_id}")))
    }

    async fn list_settlements(&self, deal_id: &str) -> StoreResult<Vec<SettlementInstruction>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut settlements: Vec<SettlementInstruction> = state
            .settlements
            .values()
            .filter(|s| s.deal_id == deal_id)
            .cloned()
            .collect();
        settlements.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.settlement_id.cmp(&b.settlement_id))
        });
        Ok(settlements)
    }

    async fn replace_checklist(
        &self,
        settlement_id: &str,
        expected_revision: u32,
        checklist: Vec<ChecklistEntry>,
        is_validated: bool,
        revalidated_at: DateTime<Utc>,
    ) -> StoreResult<SettlementInstruction> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| StoreError::NotFound(format!("settlement {settlement_id}")))?;
        if settlement.revision != expected_revision {
            return Err(StoreError::InvariantViolation(format!(
                "settlement {settlement_id} is at revision {}, expected {}",
                settlement.revision, expected_revision
            )));
        }
        settlement.checklist = checklist;
        settlement.is_validated = is_validated;
        settlement.revision = expected_revision + 1;
        settlement.revalidated_at = Some(revalidated_at);
        Ok(settlement.clone())
    }

    async fn create_milestones(
        &self,
        milestones: Vec<EscrowMilestone>,
    ) -> StoreResult<Vec<EscrowMilestone>> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        for milestone in &milestones {
            if !state.settlements.contains_key(&milestone.settlement_id) {
                return Err(StoreError::NotFound(format!(
                    "settlement {}",
                    milestone.settlement_id
                )));
            }
            state
                .milestones
                .insert(milestone.milestone_id.clone(), milestone.clone());
        }
        Ok(milestones)
    }

    async fn get_milestone(&self, milestone_id: &str) -> StoreResult<EscrowMilestone> {
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .milestones
            .get(milestone_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("milestone {milestone_id}")))
    }

    async fn list_milestones(&self, settlement_id: &str) -> StoreResult<Vec<EscrowMilestone>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut milestones: Vec<EscrowMilestone> = state
            .milestones
            .values()
            .filter(|m| m.settlement_id == settlement_id)
            .cloned()
            .collect();
        milestones.sort_by_key(|m| m.sequence);
        Ok(milestones)
    }

    async fn transition_milestone(
        &self,
        milestone_id: &str,
        expected: ReleaseStatus,
        next: ReleaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<EscrowMilestone> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let milestone = state
            .milestones
            .get_mut(milestone_id)
            .ok_or_else(|| StoreError::NotFound(format!("milestone {milestone_id}")))?;
        if milestone.release_status != expected {
            return Err(StoreError::InvariantViolation(format!(
                "milestone {milestone_id} is {:?}, expected {:?}",
                milestone.release_status, expected
            )));
        }
        milestone.release_status = next;
        milestone.updated_at = at;
        Ok(milestone.clone())
    }
}

#[async_trait]
impl ActionStore for InMemoryBackOfficeStore {
    async fn append_action(&self, event: ActionAppend) -> StoreResult<ComplianceAction> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let sequence = state.actions.len() as u64 + 1;
        // Chain per deal: the previous hash is the same deal's most recent
        // action, so a per-deal listing verifies even when deals interleave.
        let previous_hash = state
            .actions
            .iter()
            .rev()
            .find(|a| a.deal_id == event.deal_id)
            .map(|a| a.hash.clone());
        let hash = compute_action_hash(&event, previous_hash.as_deref(), sequence)?;
        let action = ComplianceAction {
            action_id: format!("act-{}", Uuid::new_v4()),
            sequence,
            deal_id: event.deal_id,
            actor: event.actor,
            kind: event.kind,
            detail: event.detail,
            payload: event.payload,
            occurred_at: event.occurred_at,
            previous_hash,
            hash,
        };
        state.actions.push(action.clone());
        Ok(action)
    }

    async fn list_actions(
        &self,
        deal_id: &str,
        window: QueryWindow,
    ) -> StoreResult<Vec<ComplianceAction>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut actions: Vec<ComplianceAction> = state
            .actions
            .iter()
            .filter(|a| a.deal_id.as_deref() == Some(deal_id))
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(actions, window))
    }

    async fn latest_action_hash(&self) -> StoreResult<Option<String>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.actions.last().map(|a| a.hash.clone()))
    }
}
