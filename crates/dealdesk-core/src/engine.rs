//! Back-office orchestration over the store traits.
//!
//! The engine wires the pure decision logic (screening, reconciliation,
//! funding analysis, verification, settlement building) to a persistence
//! backend and records every state change in the compliance action chain.

use crate::audit::{ActionAppend, ActionKind, ComplianceAction};
use crate::catalog::RuleCatalog;
use crate::error::{require_non_empty, DeskError};
use crate::funding::{
    requirement_transition_allowed, requires_reviewer, FundingAnalyzer, FundingThresholds,
    ReadinessWeights,
};
use crate::instrument::{
    build_check_report, run_verification_checks, stage_transition_allowed, CheckReport,
    ExpectedInstrumentFacts,
};
use crate::reconciler;
use crate::screening::{CandidateFlag, ScreeningEngine, ScreeningReport};
use crate::settlement::{build_instructions, run_checklist, SettlementParams};
use crate::store::{BackOfficeStore, QueryWindow};
use crate::types::{
    ComplianceFlag, Deal, DealDraft, DealStatus, EscrowMilestone, FlagResolution,
    FundingInstrument, FundingRequirement, InstrumentDraft, InstrumentStage, ReleaseStatus,
    RequirementStatus, SettlementInstruction, VerificationStatus,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine configuration: the rule catalog plus funding weights/thresholds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub catalog: RuleCatalog,
    pub weights: ReadinessWeights,
    pub thresholds: FundingThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog: RuleCatalog::builtin(),
            weights: ReadinessWeights::default(),
            thresholds: FundingThresholds::default(),
        }
    }
}

/// Outcome of deal intake: the persisted deal after its first screening.
#[derive(Debug, Clone)]
pub struct DealIntake {
    pub deal: Deal,
    pub flags: Vec<ComplianceFlag>,
    pub report: ScreeningReport,
}

/// Outcome of a re-screening run. `flags` holds only newly raised flags.
#[derive(Debug, Clone)]
pub struct ScreeningOutcome {
    pub deal: Deal,
    pub flags: Vec<ComplianceFlag>,
    pub report: ScreeningReport,
}

/// Persisted requirement set plus the score it implies.
#[derive(Debug, Clone)]
pub struct FundingOutcome {
    pub requirements: Vec<FundingRequirement>,
    pub readiness_score: u8,
}

/// A reviewed requirement and the deal's recomputed readiness score.
#[derive(Debug, Clone)]
pub struct RequirementReview {
    pub requirement: FundingRequirement,
    pub readiness_score: u8,
}

/// A persisted settlement instruction with its escrow milestones.
#[derive(Debug, Clone)]
pub struct SettlementCreated {
    pub settlement: SettlementInstruction,
    pub milestones: Vec<EscrowMilestone>,
}

pub struct BackOfficeEngine {
    store: Arc<dyn BackOfficeStore>,
    screening: ScreeningEngine,
    analyzer: FundingAnalyzer,
}

impl BackOfficeEngine {
    pub fn new(store: Arc<dyn BackOfficeStore>, config: EngineConfig) -> Self {
        Self {
            store,
            screening: ScreeningEngine::new(config.catalog),
            analyzer: FundingAnalyzer::new(config.weights, config.thresholds),
        }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        self.screening.catalog()
    }

    /// Register a deal and run its first compliance screening.
    pub async fn intake_deal(&self, draft: DealDraft, actor: &str) -> Result<DealIntake, DeskError> {
        require_non_empty("counterparty", &draft.counterparty)?;
        require_non_empty("commodity", &draft.commodity)?;
        require_non_empty("currency", &draft.currency)?;
        require_non_empty("origin_country", &draft.origin_country)?;
        require_non_empty("destination_country", &draft.destination_country)?;
        if draft.value_minor <= 0 {
            return Err(DeskError::Validation(
                "value_minor must be positive".to_string(),
            ));
        }
        if !draft.quantity_mt.is_finite() || draft.quantity_mt < 0.0 {
            return Err(DeskError::Validation(
                "quantity_mt must be a non-negative finite number".to_string(),
            ));
        }

        let now = Utc::now();
        let deal = self.store.create_deal(draft.into_deal(now)).await?;

        let candidates = self.screening.screen(&deal)?;
        let rules_evaluated = self.catalog().rules().len();
        let flags = self
            .store
            .insert_flags(materialize_flags(&deal.deal_id, candidates, now))
            .await?;

        let unresolved_blocking = flags.iter().filter(|f| f.blocks_execution).count();
        let (status, compliance) =
            reconciler::apply_screening_outcome(deal.status, unresolved_blocking, flags.len());
        let deal = self
            .store
            .set_deal_state(
                &deal.deal_id,
                (deal.status, deal.compliance_status),
                (status, compliance),
                now,
            )
            .await?;

        let report = ScreeningReport {
            catalog_version: self.catalog().version.clone(),
            rules_evaluated,
            matched: flags.len(),
            skipped_existing: Vec::new(),
            screened_at: now,
        };
        self.record(
            Some(&deal.deal_id),
            actor,
            ActionKind::ScreeningRun,
            format!("intake screening raised {} flag(s)", flags.len()),
            json!({
                "catalog_version": report.catalog_version,
                "matched": report.matched,
                "status": deal.status,
            }),
        )
        .await?;
        for flag in &flags {
            self.record(
                Some(&deal.deal_id),
                actor,
                ActionKind::FlagRaised,
                format!("rule {} matched", flag.rule_code),
                json!({"flag_id": flag.flag_id, "severity": flag.severity, "blocks_execution": flag.blocks_execution}),
            )
            .await?;
        }

        if unresolved_blocking > 0 {
            warn!(deal_id = %deal.deal_id, blocking = unresolved_blocking, "deal placed on compliance hold at intake");
        } else {
            info!(deal_id = %deal.deal_id, matched = flags.len(), "deal intake screened");
        }
        Ok(DealIntake {
            deal,
            flags,
            report,
        })
    }

    pub async fn get_deal(&self, deal_id: &str) -> Result<Deal, DeskError> {
        Ok(self.store.get_deal(deal_id).await?)
    }

    pub async fn list_deals(&self, window: QueryWindow) -> Result<Vec<Deal>, DeskError> {
        Ok(self.store.list_deals(window).await?)
    }

    pub async fn deal_flags(&self, deal_id: &str) -> Result<Vec<ComplianceFlag>, DeskError> {
        self.store.get_deal(deal_id).await?;
        Ok(self.store.list_flags(deal_id).await?)
    }

    /// Re-screen a deal. Rules that already have an unresolved flag are
    /// skipped so repeated runs never duplicate open flags.
    pub async fn rescreen_deal(
        &self,
        deal_id: &str,
        actor: &str,
    ) -> Result<ScreeningOutcome, DeskError> {
        let deal = self.store.get_deal(deal_id).await?;
        if deal.status.is_terminal() {
            return Err(DeskError::Conflict(format!(
                "deal {deal_id} is closed and cannot be re-screened"
            )));
        }

        let now = Utc::now();
        let existing = self.store.list_flags(deal_id).await?;
        let candidates = self.screening.screen(&deal)?;
        let rules_evaluated = self.catalog().rules().len();

        let mut skipped_existing = Vec::new();
        let mut fresh = Vec::new();
        for candidate in candidates {
            let open_duplicate = existing
                .iter()
                .any(|f| !f.resolved && f.rule_code == candidate.rule_code);
            if open_duplicate {
                skipped_existing.push(candidate.rule_code);
            } else {
                fresh.push(candidate);
            }
        }
        let new_flags = self
            .store
            .insert_flags(materialize_flags(deal_id, fresh, now))
            .await?;

        let unresolved: Vec<&ComplianceFlag> = existing
            .iter()
            .filter(|f| !f.resolved)
            .chain(new_flags.iter())
            .collect();
        let unresolved_blocking = unresolved.iter().filter(|f| f.blocks_execution).count();
        let (status, compliance) =
            reconciler::apply_screening_outcome(deal.status, unresolved_blocking, unresolved.len());
        let deal = if (status, compliance) != (deal.status, deal.compliance_status) {
            self.store
                .set_deal_state(
                    deal_id,
                    (deal.status, deal.compliance_status),
                    (status, compliance),
                    now,
                )
                .await?
        } else {
            deal
        };

        let report = ScreeningReport {
            catalog_version: self.catalog().version.clone(),
            rules_evaluated,
            matched: new_flags.len(),
            skipped_existing,
            screened_at: now,
        };
        self.record(
            Some(deal_id),
            actor,
            ActionKind::ScreeningRun,
            format!(
                "re-screening raised {} new flag(s), skipped {}",
                new_flags.len(),
                report.skipped_existing.len()
            ),
            json!({
                "catalog_version": report.catalog_version,
                "matched": report.matched,
                "skipped_existing": report.skipped_existing,
            }),
        )
        .await?;
        for flag in &new_flags {
            self.record(
                Some(deal_id),
                actor,
                ActionKind::FlagRaised,
                format!("rule {} matched", flag.rule_code),
                json!({"flag_id": flag.flag_id, "severity": flag.severity, "blocks_execution": flag.blocks_execution}),
            )
            .await?;
        }

        info!(deal_id, new = new_flags.len(), skipped = report.skipped_existing.len(), "re-screening complete");
        Ok(ScreeningOutcome {
            deal,
            flags: new_flags,
            report,
        })
    }

    /// Resolve a flag and reconcile the deal's status atomically.
    pub async fn resolve_flag(
        &self,
        flag_id: &str,
        resolved_by: &str,
        notes: &str,
    ) -> Result<FlagResolution, DeskError> {
        require_non_empty("resolved_by", resolved_by)?;
        require_non_empty("notes", notes)?;

        let resolution = self
            .store
            .resolve_and_reconcile(flag_id, resolved_by, notes, Utc::now())
            .await?;

        self.record(
            Some(&resolution.deal.deal_id),
            resolved_by,
            ActionKind::FlagResolved,
            format!("flag {} ({}) resolved", flag_id, resolution.flag.rule_code),
            json!({
                "flag_id": flag_id,
                "rule_code": resolution.flag.rule_code,
                "deal_status": resolution.deal.status,
                "compliance_status": resolution.deal.compliance_status,
            }),
        )
        .await?;

        info!(
            flag_id,
            deal_id = %resolution.deal.deal_id,
            status = ?resolution.deal.status,
            "flag resolved and deal reconciled"
        );
        Ok(resolution)
    }

    /// Operator-requested lifecycle transition. Compliance-owned edges
    /// (entering hold, leaving hold other than by losing the deal) are
    /// rejected here.
    pub async fn change_deal_status(
        &self,
        deal_id: &str,
        to: DealStatus,
        actor: &str,
    ) -> Result<Deal, DeskError> {
        let deal = self.store.get_deal(deal_id).await?;
        if !reconciler::operator_transition_allowed(deal.status, to) {
            return Err(DeskError::Conflict(format!(
                "transition {:?} -> {:?} is not allowed",
                deal.status, to
            )));
        }
        let updated = self
            .store
            .set_deal_state(
                deal_id,
                (deal.status, deal.compliance_status),
                (to, deal.compliance_status),
                Utc::now(),
            )
            .await?;

        self.record(
            Some(deal_id),
            actor,
            ActionKind::StatusChanged,
            format!("status {:?} -> {:?}", deal.status, to),
            json!({"from": deal.status, "to": to}),
        )
        .await?;
        info!(deal_id, from = ?deal.status, to = ?to, "deal status changed");
        Ok(updated)
    }

    /// Derive and persist the funding requirement checklist. Idempotent:
    /// existing rows keep their review state.
    pub async fn analyze_funding(
        &self,
        deal_id: &str,
        actor: &str,
    ) -> Result<FundingOutcome, DeskError> {
        let deal = self.store.get_deal(deal_id).await?;
        let now = Utc::now();
        let sheet = self.analyzer.analyze(&deal);

        let rows = sheet
            .requirements
            .iter()
            .map(|derived| FundingRequirement {
                requirement_id: format!("req-{}", Uuid::new_v4()),
                deal_id: deal_id.to_string(),
                requirement_type: derived.requirement_type.clone(),
                label: derived.label.clone(),
                is_critical: derived.is_critical,
                status: RequirementStatus::Pending,
                due_date: Some(now + Duration::days(derived.due_in_days)),
                reviewer: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        let upsert = self.store.upsert_requirements(deal_id, rows).await?;
        let readiness_score = self.analyzer.score_requirements(&upsert.requirements);

        self.record(
            Some(deal_id),
            actor,
            ActionKind::RequirementsPersisted,
            format!(
                "funding analysis persisted {} new requirement(s)",
                upsert.inserted
            ),
            json!({
                "inserted": upsert.inserted,
                "total": upsert.requirements.len(),
                "readiness_score": readiness_score,
                "weights_version": self.analyzer.weights().version,
            }),
        )
        .await?;
        info!(deal_id, inserted = upsert.inserted, readiness_score, "funding analysis complete");
        Ok(FundingOutcome {
            requirements: upsert.requirements,
            readiness_score,
        })
    }

    /// Current requirement set and readiness score without re-deriving.
    pub async fn funding_status(&self, deal_id: &str) -> Result<FundingOutcome, DeskError> {
        self.store.get_deal(deal_id).await?;
        let requirements = self.store.list_requirements(deal_id).await?;
        let readiness_score = self.analyzer.score_requirements(&requirements);
        Ok(FundingOutcome {
            requirements,
            readiness_score,
        })
    }

    /// Move a requirement through its review lifecycle.
    pub async fn review_requirement(
        &self,
        requirement_id: &str,
        to: RequirementStatus,
        reviewer: Option<&str>,
        actor: &str,
    ) -> Result<RequirementReview, DeskError> {
        let requirement = self.store.get_requirement(requirement_id).await?;
        if !requirement_transition_allowed(requirement.status, to) {
            return Err(DeskError::Conflict(format!(
                "requirement transition {:?} -> {:?} is not allowed",
                requirement.status, to
            )));
        }
        if requires_reviewer(to) && reviewer.map(str::trim).filter(|r| !r.is_empty()).is_none() {
            return Err(DeskError::Validation(format!(
                "a reviewer is required to mark a requirement {to:?}"
            )));
        }

        let updated = self
            .store
            .transition_requirement(requirement_id, requirement.status, to, reviewer, Utc::now())
            .await?;
        let requirements = self.store.list_requirements(&updated.deal_id).await?;
        let readiness_score = self.analyzer.score_requirements(&requirements);

        self.record(
            Some(&updated.deal_id),
            actor,
            ActionKind::RequirementReviewed,
            format!(
                "requirement {} ({}) {:?} -> {:?}",
                requirement_id, updated.requirement_type, requirement.status, to
            ),
            json!({
                "requirement_id": requirement_id,
                "from": requirement.status,
                "to": to,
                "reviewer": reviewer,
                "readiness_score": readiness_score,
            }),
        )
        .await?;
        Ok(RequirementReview {
            requirement: updated,
            readiness_score,
        })
    }

    /// Register a banking instrument against a deal. The instrument starts
    /// unverified and always requires human approval.
    pub async fn register_instrument(
        &self,
        draft: InstrumentDraft,
        actor: &str,
    ) -> Result<FundingInstrument, DeskError> {
        require_non_empty("instrument_type", &draft.instrument_type)?;
        require_non_empty("issuing_bank", &draft.issuing_bank)?;
        require_non_empty("issuing_bank_bic", &draft.issuing_bank_bic)?;
        require_non_empty("beneficiary", &draft.beneficiary)?;
        require_non_empty("currency", &draft.currency)?;
        if draft.amount_minor <= 0 {
            return Err(DeskError::Validation(
                "amount_minor must be positive".to_string(),
            ));
        }
        self.store.get_deal(&draft.deal_id).await?;

        let instrument = self
            .store
            .create_instrument(draft.into_instrument(Utc::now()))
            .await?;
        self.record(
            Some(&instrument.deal_id),
            actor,
            ActionKind::InstrumentRegistered,
            format!(
                "instrument {} ({}) registered",
                instrument.instrument_id, instrument.instrument_type
            ),
            json!({"instrument_id": instrument.instrument_id, "issuing_bank": instrument.issuing_bank}),
        )
        .await?;
        Ok(instrument)
    }

    pub async fn get_instrument(&self, instrument_id: &str) -> Result<FundingInstrument, DeskError> {
        Ok(self.store.get_instrument(instrument_id).await?)
    }

    pub async fn list_instruments(
        &self,
        deal_id: &str,
    ) -> Result<Vec<FundingInstrument>, DeskError> {
        self.store.get_deal(deal_id).await?;
        Ok(self.store.list_instruments(deal_id).await?)
    }

    /// Run automated consistency checks. Regardless of outcome the
    /// instrument lands in `pending_human_review`; a pass never approves.
    pub async fn verify_instrument(
        &self,
        instrument_id: &str,
        expected: Option<ExpectedInstrumentFacts>,
        actor: &str,
    ) -> Result<CheckReport, DeskError> {
        let instrument = self.store.get_instrument(instrument_id).await?;
        if matches!(
            instrument.verification_status,
            VerificationStatus::HumanApproved | VerificationStatus::HumanRejected
        ) {
            return Err(DeskError::Conflict(format!(
                "instrument {instrument_id} already decided ({:?})",
                instrument.verification_status
            )));
        }

        // With no operator-supplied facts, amount and currency come from the
        // deal; beneficiary and issuing bank have no independent source, so
        // those checks must report WARN rather than compare the instrument
        // against itself.
        let deal = self.store.get_deal(&instrument.deal_id).await?;
        let expected = expected.unwrap_or_else(|| ExpectedInstrumentFacts {
            amount_minor: deal.value_minor,
            currency: deal.currency.clone(),
            beneficiary: None,
            issuing_bank_bic: None,
        });

        let now = Utc::now();
        let checks = run_verification_checks(&instrument, &expected, now);
        let report = build_check_report(instrument_id, checks, now);

        self.store
            .set_verification(
                instrument_id,
                &[
                    VerificationStatus::Unverified,
                    VerificationStatus::PendingHumanReview,
                ],
                VerificationStatus::PendingHumanReview,
                None,
                None,
                now,
            )
            .await?;
        self.record(
            Some(&instrument.deal_id),
            actor,
            ActionKind::InstrumentVerified,
            format!(
                "instrument {} checked, all_passed={}",
                instrument_id, report.all_passed
            ),
            json!({"instrument_id": instrument_id, "all_passed": report.all_passed, "checks": report.checks}),
        )
        .await?;
        info!(instrument_id, all_passed = report.all_passed, "instrument verified, awaiting human review");
        Ok(report)
    }

    /// Explicit human approval. Only valid from `pending_human_review`.
    pub async fn approve_instrument(
        &self,
        instrument_id: &str,
        approved_by: &str,
        notes: Option<&str>,
    ) -> Result<FundingInstrument, DeskError> {
        require_non_empty("approved_by", approved_by)?;
        let instrument = self
            .store
            .set_verification(
                instrument_id,
                &[VerificationStatus::PendingHumanReview],
                VerificationStatus::HumanApproved,
                Some(approved_by),
                notes,
                Utc::now(),
            )
            .await?;
        self.record(
            Some(&instrument.deal_id),
            approved_by,
            ActionKind::InstrumentApproved,
            format!("instrument {instrument_id} approved"),
            json!({"instrument_id": instrument_id, "notes": notes}),
        )
        .await?;
        info!(instrument_id, approved_by, "instrument approved by human reviewer");
        Ok(instrument)
    }

    /// Explicit human rejection, allowed before or after checks ran.
    pub async fn reject_instrument(
        &self,
        instrument_id: &str,
        rejected_by: &str,
        reason: &str,
    ) -> Result<FundingInstrument, DeskError> {
        require_non_empty("rejected_by", rejected_by)?;
        require_non_empty("reason", reason)?;
        let instrument = self
            .store
            .set_verification(
                instrument_id,
                &[
                    VerificationStatus::Unverified,
                    VerificationStatus::PendingHumanReview,
                ],
                VerificationStatus::HumanRejected,
                Some(rejected_by),
                Some(reason),
                Utc::now(),
            )
            .await?;
        self.record(
            Some(&instrument.deal_id),
            rejected_by,
            ActionKind::InstrumentRejected,
            format!("instrument {instrument_id} rejected"),
            json!({"instrument_id": instrument_id, "reason": reason}),
        )
        .await?;
        Ok(instrument)
    }

    /// Advance the issuance stage machine, independent of trust state.
    pub async fn advance_instrument_stage(
        &self,
        instrument_id: &str,
        to: InstrumentStage,
        actor: &str,
    ) -> Result<FundingInstrument, DeskError> {
        let instrument = self.store.get_instrument(instrument_id).await?;
        if !stage_transition_allowed(instrument.stage, to) {
            return Err(DeskError::Conflict(format!(
                "stage transition {:?} -> {:?} is not allowed",
                instrument.stage, to
            )));
        }
        let updated = self
            .store
            .set_stage(instrument_id, instrument.stage, to, Utc::now())
            .await?;
        self.record(
            Some(&updated.deal_id),
            actor,
            ActionKind::StageAdvanced,
            format!("instrument {instrument_id} stage {:?} -> {:?}", instrument.stage, to),
            json!({"instrument_id": instrument_id, "from": instrument.stage, "to": to}),
        )
        .await?;
        Ok(updated)
    }

    /// Build, validate, and persist a settlement instruction with its escrow
    /// milestones. Deals on compliance hold cannot open settlements.
    pub async fn create_settlement(
        &self,
        deal_id: &str,
        params: SettlementParams,
        milestone_labels: Vec<String>,
        actor: &str,
    ) -> Result<SettlementCreated, DeskError> {
        let deal = self.store.get_deal(deal_id).await?;
        if deal.status == DealStatus::OnHold {
            return Err(DeskError::Conflict(format!(
                "deal {deal_id} is on compliance hold; settlement instructions are not allowed"
            )));
        }
        if deal.status.is_terminal() {
            return Err(DeskError::Conflict(format!(
                "deal {deal_id} is closed; settlement instructions are not allowed"
            )));
        }

        let now = Utc::now();
        let built = build_instructions(&params)?;
        let settlement = self
            .store
            .create_settlement(SettlementInstruction {
                settlement_id: format!("stl-{}", Uuid::new_v4()),
                deal_id: deal_id.to_string(),
                rail: built.rail,
                payload: built.payload,
                checklist: built.checklist,
                is_validated: built.is_validated,
                revision: 1,
                created_at: now,
                revalidated_at: None,
            })
            .await?;

        let milestones = milestone_labels
            .into_iter()
            .enumerate()
            .map(|(index, label)| EscrowMilestone {
                milestone_id: format!("ms-{}", Uuid::new_v4()),
                settlement_id: settlement.settlement_id.clone(),
                deal_id: deal_id.to_string(),
                label,
                sequence: index as u32 + 1,
                release_status: ReleaseStatus::Locked,
                created_at: now,
                updated_at: now,
            })
            .collect();
        let milestones = self.store.create_milestones(milestones).await?;

        self.record(
            Some(deal_id),
            actor,
            ActionKind::SettlementPersisted,
            format!(
                "settlement {} ({:?}) created with {} milestone(s), validated={}",
                settlement.settlement_id,
                settlement.rail,
                milestones.len(),
                settlement.is_validated
            ),
            json!({
                "settlement_id": settlement.settlement_id,
                "rail": settlement.rail,
                "is_validated": settlement.is_validated,
                "milestones": milestones.len(),
            }),
        )
        .await?;
        if !settlement.is_validated {
            warn!(settlement_id = %settlement.settlement_id, "settlement persisted with failing checklist entries");
        }
        Ok(SettlementCreated {
            settlement,
            milestones,
        })
    }

    pub async fn get_settlement(
        &self,
        settlement_id: &str,
    ) -> Result<SettlementInstruction, DeskError> {
        Ok(self.store.get_settlement(settlement_id).await?)
    }

    pub async fn list_settlements(
        &self,
        deal_id: &str,
    ) -> Result<Vec<SettlementInstruction>, DeskError> {
        self.store.get_deal(deal_id).await?;
        Ok(self.store.list_settlements(deal_id).await?)
    }

    pub async fn list_milestones(
        &self,
        settlement_id: &str,
    ) -> Result<Vec<EscrowMilestone>, DeskError> {
        self.store.get_settlement(settlement_id).await?;
        Ok(self.store.list_milestones(settlement_id).await?)
    }

    /// Re-run the checklist against the stored payload under a new revision.
    pub async fn revalidate_settlement(
        &self,
        settlement_id: &str,
        actor: &str,
    ) -> Result<SettlementInstruction, DeskError> {
        let settlement = self.store.get_settlement(settlement_id).await?;
        let checklist = run_checklist(&settlement.payload)?;
        let is_validated = crate::settlement::checklist_is_validated(&checklist);
        let updated = self
            .store
            .replace_checklist(
                settlement_id,
                settlement.revision,
                checklist,
                is_validated,
                Utc::now(),
            )
            .await?;

        self.record(
            Some(&updated.deal_id),
            actor,
            ActionKind::SettlementRevalidated,
            format!(
                "settlement {} re-validated at revision {}, validated={}",
                settlement_id, updated.revision, updated.is_validated
            ),
            json!({
                "settlement_id": settlement_id,
                "revision": updated.revision,
                "is_validated": updated.is_validated,
            }),
        )
        .await?;
        Ok(updated)
    }

    /// Walk a milestone one step toward release. A disputed milestone
    /// re-enters the release queue rather than releasing directly.
    pub async fn release_milestone(
        &self,
        milestone_id: &str,
        actor: &str,
    ) -> Result<EscrowMilestone, DeskError> {
        let milestone = self.store.get_milestone(milestone_id).await?;
        let next = match milestone.release_status {
            ReleaseStatus::Locked => ReleaseStatus::PendingRelease,
            ReleaseStatus::PendingRelease => ReleaseStatus::Released,
            ReleaseStatus::Disputed => ReleaseStatus::PendingRelease,
            ReleaseStatus::Released => {
                return Err(DeskError::Conflict(format!(
                    "milestone {milestone_id} is already released"
                )))
            }
        };
        let updated = self
            .store
            .transition_milestone(milestone_id, milestone.release_status, next, Utc::now())
            .await?;
        self.record(
            Some(&updated.deal_id),
            actor,
            ActionKind::MilestoneReleased,
            format!(
                "milestone {milestone_id} {:?} -> {:?}",
                milestone.release_status, next
            ),
            json!({"milestone_id": milestone_id, "from": milestone.release_status, "to": next}),
        )
        .await?;
        Ok(updated)
    }

    /// Dispute a milestone awaiting release.
    pub async fn dispute_milestone(
        &self,
        milestone_id: &str,
        actor: &str,
    ) -> Result<EscrowMilestone, DeskError> {
        let milestone = self.store.get_milestone(milestone_id).await?;
        if milestone.release_status != ReleaseStatus::PendingRelease {
            return Err(DeskError::Conflict(format!(
                "milestone {milestone_id} is {:?}; only pending_release can be disputed",
                milestone.release_status
            )));
        }
        let updated = self
            .store
            .transition_milestone(
                milestone_id,
                ReleaseStatus::PendingRelease,
                ReleaseStatus::Disputed,
                Utc::now(),
            )
            .await?;
        self.record(
            Some(&updated.deal_id),
            actor,
            ActionKind::MilestoneDisputed,
            format!("milestone {milestone_id} disputed"),
            json!({"milestone_id": milestone_id}),
        )
        .await?;
        Ok(updated)
    }

    /// The deal's compliance action trail, newest first.
    pub async fn deal_actions(
        &self,
        deal_id: &str,
        window: QueryWindow,
    ) -> Result<Vec<ComplianceAction>, DeskError> {
        self.store.get_deal(deal_id).await?;
        Ok(self.store.list_actions(deal_id, window).await?)
    }

    async fn record(
        &self,
        deal_id: Option<&str>,
        actor: &str,
        kind: ActionKind,
        detail: String,
        payload: serde_json::Value,
    ) -> Result<(), DeskError> {
        self.store
            .append_action(ActionAppend {
                deal_id: deal_id.map(str::to_string),
                actor: actor.to_string(),
                kind,
                detail,
                payload,
                occurred_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

fn materialize_flags(
    deal_id: &str,
    candidates: Vec<CandidateFlag>,
    raised_at: chrono::DateTime<Utc>,
) -> Vec<ComplianceFlag> {
    candidates
        .into_iter()
        .map(|candidate| ComplianceFlag {
            flag_id: format!("flag-{}", Uuid::new_v4()),
            deal_id: deal_id.to_string(),
            rule_code: candidate.rule_code,
            rationale: candidate.rationale,
            severity: candidate.severity,
            blocks_execution: candidate.blocks_execution,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            raised_at,
        })
        .collect()
}
