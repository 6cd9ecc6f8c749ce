//! End-to-end engine scenarios over the in-memory backend.

use dealdesk_core::audit::verify_chain;
use dealdesk_core::engine::{BackOfficeEngine, EngineConfig};
use dealdesk_core::instrument::ExpectedInstrumentFacts;
use dealdesk_core::settlement::{SettlementParams, XrplParams};
use dealdesk_core::store::QueryWindow;
use dealdesk_core::types::{
    CheckStatus, ComplianceStatus, DealDraft, DealStatus, InstrumentDraft, InstrumentStage,
    ReleaseStatus, RequirementStatus, VerificationStatus,
};
use dealdesk_core::DeskError;
use dealdesk_store::InMemoryBackOfficeStore;
use std::sync::Arc;

fn engine() -> BackOfficeEngine {
    BackOfficeEngine::new(
        Arc::new(InMemoryBackOfficeStore::new()),
        EngineConfig::default(),
    )
}

fn clean_draft() -> DealDraft {
    DealDraft::new("Helvetia Trading AG", "copper", 5_000_000, "USD", "CL", "DE")
        .with_incoterm("CIF")
        .with_quantity_mt(120.0)
}

fn restricted_metals_draft() -> DealDraft {
    DealDraft::new("Aurum Trade House", "precious-metals", 8_000_000, "USD", "CH", "AE")
        .with_incoterm("CIP")
        .with_quantity_mt(2.0)
}

#[tokio::test]
async fn clean_deal_clears_at_intake() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    assert_eq!(intake.deal.status, DealStatus::Inquiry);
    assert_eq!(intake.deal.compliance_status, ComplianceStatus::Cleared);
    assert!(intake.flags.is_empty());
}

#[tokio::test]
async fn negative_or_non_finite_quantity_is_rejected_at_intake() {
    let engine = engine();
    let negative = engine
        .intake_deal(clean_draft().with_quantity_mt(-120.0), "ops.desk")
        .await;
    assert!(matches!(negative, Err(DeskError::Validation(_))));
    let nan = engine
        .intake_deal(clean_draft().with_quantity_mt(f64::NAN), "ops.desk")
        .await;
    assert!(matches!(nan, Err(DeskError::Validation(_))));
}

#[tokio::test]
async fn blocking_flag_holds_deal_and_resolution_promotes_it() {
    let engine = engine();
    let intake = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    assert_eq!(intake.deal.status, DealStatus::OnHold);
    assert_eq!(intake.deal.compliance_status, ComplianceStatus::Flagged);
    let flag = intake
        .flags
        .iter()
        .find(|f| f.rule_code == "RESTRICTED_METALS_DESTINATION")
        .expect("metals flag");

    let resolution = engine
        .resolve_flag(&flag.flag_id, "mlro.chen", "licensed shipment, permit 4471 on file")
        .await
        .unwrap();
    assert!(resolution.flag.resolved);
    assert_eq!(resolution.deal.status, DealStatus::Qualified);
    assert_eq!(resolution.deal.compliance_status, ComplianceStatus::Cleared);
}

#[tokio::test]
async fn resolving_a_flag_twice_conflicts_and_preserves_the_original() {
    let engine = engine();
    let intake = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    let flag_id = intake.flags[0].flag_id.clone();

    let first = engine
        .resolve_flag(&flag_id, "mlro.chen", "reviewed and cleared")
        .await
        .unwrap();
    let second = engine
        .resolve_flag(&flag_id, "someone.else", "duplicate attempt")
        .await;
    assert!(matches!(second, Err(DeskError::Conflict(_))));

    let flags = engine.deal_flags(&intake.deal.deal_id).await.unwrap();
    let flag = flags.iter().find(|f| f.flag_id == flag_id).unwrap();
    assert_eq!(flag.resolved_by.as_deref(), Some("mlro.chen"));
    assert_eq!(flag.resolved_at, first.flag.resolved_at);
}

#[tokio::test]
async fn rescreening_skips_rules_with_open_flags() {
    let engine = engine();
    let intake = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    assert!(!intake.flags.is_empty());

    let outcome = engine
        .rescreen_deal(&intake.deal.deal_id, "ops.desk")
        .await
        .unwrap();
    assert!(outcome.flags.is_empty());
    assert!(outcome
        .report
        .skipped_existing
        .contains(&"RESTRICTED_METALS_DESTINATION".to_string()));
}

#[tokio::test]
async fn operator_cannot_enter_or_exit_hold_directly() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let deal_id = intake.deal.deal_id.clone();

    let held = engine
        .change_deal_status(&deal_id, DealStatus::OnHold, "ops.desk")
        .await;
    assert!(matches!(held, Err(DeskError::Conflict(_))));

    let deal = engine
        .change_deal_status(&deal_id, DealStatus::Qualified, "ops.desk")
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::Qualified);
}

#[tokio::test]
async fn funding_analysis_is_idempotent_and_reviews_raise_the_score() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let deal_id = intake.deal.deal_id.clone();

    let first = engine.analyze_funding(&deal_id, "ops.desk").await.unwrap();
    assert!(!first.requirements.is_empty());
    let second = engine.analyze_funding(&deal_id, "ops.desk").await.unwrap();
    assert_eq!(second.requirements.len(), first.requirements.len());

    let target = first
        .requirements
        .iter()
        .find(|r| r.requirement_type == "kyc_dossier")
        .expect("kyc requirement");
    let submitted = engine
        .review_requirement(&target.requirement_id, RequirementStatus::Submitted, None, "ops.desk")
        .await
        .unwrap();
    let under_review = engine
        .review_requirement(
            &submitted.requirement.requirement_id,
            RequirementStatus::UnderReview,
            None,
            "ops.desk",
        )
        .await
        .unwrap();
    let approved = engine
        .review_requirement(
            &under_review.requirement.requirement_id,
            RequirementStatus::Approved,
            Some("credit.lang"),
            "credit.lang",
        )
        .await
        .unwrap();
    assert!(approved.readiness_score > first.readiness_score);
    assert_eq!(approved.requirement.reviewer.as_deref(), Some("credit.lang"));
}

#[tokio::test]
async fn review_outcomes_require_a_reviewer() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let funding = engine
        .analyze_funding(&intake.deal.deal_id, "ops.desk")
        .await
        .unwrap();
    let requirement = &funding.requirements[0];

    let waived = engine
        .review_requirement(&requirement.requirement_id, RequirementStatus::Waived, None, "ops.desk")
        .await;
    assert!(matches!(waived, Err(DeskError::Validation(_))));
}

#[tokio::test]
async fn verification_always_lands_in_human_review() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let deal = intake.deal;

    let instrument = engine
        .register_instrument(
            InstrumentDraft {
                deal_id: deal.deal_id.clone(),
                instrument_type: "standby_letter_of_credit".to_string(),
                issuing_bank: "First Commercial Bank".to_string(),
                issuing_bank_bic: "FCBKDEFF".to_string(),
                advising_bank: None,
                beneficiary: deal.counterparty.clone(),
                amount_minor: deal.value_minor,
                currency: deal.currency.clone(),
                issued_at: Some(chrono::Utc::now()),
                expires_at: Some(chrono::Utc::now() + chrono::Duration::days(180)),
            },
            "ops.desk",
        )
        .await
        .unwrap();
    assert_eq!(instrument.verification_status, VerificationStatus::Unverified);
    assert!(instrument.human_approval_required);

    // A pass never auto-approves.
    let report = engine
        .verify_instrument(
            &instrument.instrument_id,
            Some(ExpectedInstrumentFacts {
                amount_minor: deal.value_minor,
                currency: deal.currency.clone(),
                beneficiary: Some(deal.counterparty.clone()),
                issuing_bank_bic: Some("FCBKDEFF".to_string()),
            }),
            "ops.desk",
        )
        .await
        .unwrap();
    assert!(report.all_passed);
    let stored = engine.get_instrument(&instrument.instrument_id).await.unwrap();
    assert_eq!(
        stored.verification_status,
        VerificationStatus::PendingHumanReview
    );
}

#[tokio::test]
async fn verification_without_expected_facts_warns_on_bank_checks() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let deal = intake.deal;
    let instrument = engine
        .register_instrument(
            InstrumentDraft {
                deal_id: deal.deal_id.clone(),
                instrument_type: "standby_letter_of_credit".to_string(),
                issuing_bank: "First Commercial Bank".to_string(),
                issuing_bank_bic: "FCBKDEFF".to_string(),
                advising_bank: None,
                beneficiary: deal.counterparty.clone(),
                amount_minor: deal.value_minor,
                currency: deal.currency.clone(),
                issued_at: Some(chrono::Utc::now()),
                expires_at: Some(chrono::Utc::now() + chrono::Duration::days(180)),
            },
            "ops.desk",
        )
        .await
        .unwrap();

    // Without operator-supplied facts the beneficiary and issuing-bank checks
    // have nothing independent to compare against and must warn, not pass.
    let report = engine
        .verify_instrument(&instrument.instrument_id, None, "ops.desk")
        .await
        .unwrap();
    assert!(!report.all_passed);
    for name in ["beneficiary_match", "issuing_bank_match"] {
        let check = report.checks.iter().find(|c| c.check == name).unwrap();
        assert_eq!(check.status, CheckStatus::Warn);
    }
    assert!(report
        .checks
        .iter()
        .any(|c| c.check == "amount_match" && c.status == CheckStatus::Pass));
    assert_eq!(
        report.verification_status,
        VerificationStatus::PendingHumanReview
    );
}

#[tokio::test]
async fn approval_is_only_reachable_from_human_review() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let instrument = engine
        .register_instrument(
            InstrumentDraft {
                deal_id: intake.deal.deal_id.clone(),
                instrument_type: "documentary_letter_of_credit".to_string(),
                issuing_bank: "First Commercial Bank".to_string(),
                issuing_bank_bic: "FCBKDEFF".to_string(),
                advising_bank: None,
                beneficiary: "Helvetia Trading AG".to_string(),
                amount_minor: 5_000_000,
                currency: "USD".to_string(),
                issued_at: None,
                expires_at: None,
            },
            "ops.desk",
        )
        .await
        .unwrap();

    let premature = engine
        .approve_instrument(&instrument.instrument_id, "mlro.chen", None)
        .await;
    assert!(matches!(premature, Err(DeskError::Conflict(_))));

    engine
        .verify_instrument(&instrument.instrument_id, None, "ops.desk")
        .await
        .unwrap();
    let approved = engine
        .approve_instrument(&instrument.instrument_id, "mlro.chen", Some("documents check out"))
        .await
        .unwrap();
    assert_eq!(approved.verification_status, VerificationStatus::HumanApproved);
    assert_eq!(approved.approved_by.as_deref(), Some("mlro.chen"));
}

#[tokio::test]
async fn instrument_stage_machine_is_independent_of_trust_state() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let instrument = engine
        .register_instrument(
            InstrumentDraft {
                deal_id: intake.deal.deal_id.clone(),
                instrument_type: "bank_guarantee".to_string(),
                issuing_bank: "First Commercial Bank".to_string(),
                issuing_bank_bic: "FCBKDEFF".to_string(),
                advising_bank: None,
                beneficiary: "Helvetia Trading AG".to_string(),
                amount_minor: 5_000_000,
                currency: "USD".to_string(),
                issued_at: None,
                expires_at: None,
            },
            "ops.desk",
        )
        .await
        .unwrap();

    let issued = engine
        .advance_instrument_stage(&instrument.instrument_id, InstrumentStage::Issued, "ops.desk")
        .await
        .unwrap();
    assert_eq!(issued.stage, InstrumentStage::Issued);
    assert_eq!(issued.verification_status, VerificationStatus::Unverified);

    let skipped = engine
        .advance_instrument_stage(&instrument.instrument_id, InstrumentStage::Active, "ops.desk")
        .await;
    assert!(matches!(skipped, Err(DeskError::Conflict(_))));
}

#[tokio::test]
async fn settlement_flow_revalidates_and_releases_milestones() {
    let engine = engine();
    let intake = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let deal_id = intake.deal.deal_id.clone();

    let created = engine
        .create_settlement(
            &deal_id,
            SettlementParams::Xrpl(XrplParams {
                destination_address: "rN7n7otQDd6FczFgLdSqtcsAUxDkw6fzRH".to_string(),
                destination_tag: Some(2201),
                amount_minor: 5_000_000,
                currency: "USD".to_string(),
            }),
            vec!["cargo loaded".to_string(), "cargo delivered".to_string()],
            "ops.desk",
        )
        .await
        .unwrap();
    assert!(created.settlement.is_validated);
    assert_eq!(created.settlement.revision, 1);
    assert_eq!(created.milestones.len(), 2);
    assert!(created
        .milestones
        .iter()
        .all(|m| m.release_status == ReleaseStatus::Locked));

    let revalidated = engine
        .revalidate_settlement(&created.settlement.settlement_id, "ops.desk")
        .await
        .unwrap();
    assert_eq!(revalidated.revision, 2);
    assert!(revalidated.revalidated_at.is_some());

    let milestone_id = created.milestones[0].milestone_id.clone();
    let pending = engine.release_milestone(&milestone_id, "ops.desk").await.unwrap();
    assert_eq!(pending.release_status, ReleaseStatus::PendingRelease);
    let disputed = engine.dispute_milestone(&milestone_id, "buyer.agent").await.unwrap();
    assert_eq!(disputed.release_status, ReleaseStatus::Disputed);
    let requeued = engine.release_milestone(&milestone_id, "ops.desk").await.unwrap();
    assert_eq!(requeued.release_status, ReleaseStatus::PendingRelease);
    let released = engine.release_milestone(&milestone_id, "ops.desk").await.unwrap();
    assert_eq!(released.release_status, ReleaseStatus::Released);

    let again = engine.release_milestone(&milestone_id, "ops.desk").await;
    assert!(matches!(again, Err(DeskError::Conflict(_))));
}

#[tokio::test]
async fn held_deals_cannot_open_settlements() {
    let engine = engine();
    let intake = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    assert_eq!(intake.deal.status, DealStatus::OnHold);

    let result = engine
        .create_settlement(
            &intake.deal.deal_id,
            SettlementParams::Xrpl(XrplParams {
                destination_address: "rN7n7otQDd6FczFgLdSqtcsAUxDkw6fzRH".to_string(),
                destination_tag: Some(7),
                amount_minor: 8_000_000,
                currency: "USD".to_string(),
            }),
            Vec::new(),
            "ops.desk",
        )
        .await;
    assert!(matches!(result, Err(DeskError::Conflict(_))));
}

#[tokio::test]
async fn action_trail_forms_an_unbroken_chain() {
    let engine = engine();
    let intake = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    let deal_id = intake.deal.deal_id.clone();
    let flag_id = intake.flags[0].flag_id.clone();
    engine
        .resolve_flag(&flag_id, "mlro.chen", "permit verified")
        .await
        .unwrap();
    engine.analyze_funding(&deal_id, "ops.desk").await.unwrap();

    let mut actions = engine
        .deal_actions(
            &deal_id,
            QueryWindow {
                limit: 100,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert!(actions.len() >= 4);
    assert!(actions[0].sequence > actions[1].sequence);

    actions.reverse();
    assert!(verify_chain(&actions));
}

#[tokio::test]
async fn interleaved_deals_keep_independent_action_chains() {
    let engine = engine();
    let first = engine.intake_deal(clean_draft(), "ops.desk").await.unwrap();
    let second = engine
        .intake_deal(restricted_metals_draft(), "ops.desk")
        .await
        .unwrap();
    let first_id = first.deal.deal_id.clone();
    let second_id = second.deal.deal_id.clone();

    // Alternate between the two deals so their actions interleave in the
    // store; each deal's trail must still verify on its own.
    engine.analyze_funding(&first_id, "ops.desk").await.unwrap();
    engine.rescreen_deal(&second_id, "ops.desk").await.unwrap();
    engine.analyze_funding(&second_id, "ops.desk").await.unwrap();
    engine.rescreen_deal(&first_id, "ops.desk").await.unwrap();

    for deal_id in [&first_id, &second_id] {
        let mut actions = engine
            .deal_actions(
                deal_id,
                QueryWindow {
                    limit: 100,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert!(actions.len() >= 3);
        actions.reverse();
        assert!(verify_chain(&actions), "chain broken for {deal_id}");
    }
}
