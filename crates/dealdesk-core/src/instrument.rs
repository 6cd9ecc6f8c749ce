//! Instrument verification gate and issuance stage machine.
//!
//! Automated checks compare supplied instrument data against expected deal
//! facts and always land the instrument in `pending_human_review` — a pass
//! never auto-approves. Approval and rejection are explicit human acts,
//! applied with compare-and-set transitions by the store.

use crate::types::{CheckStatus, FundingInstrument, InstrumentStage, VerificationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One consistency check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub check: String,
    pub status: CheckStatus,
    pub detail: String,
}

/// Structured check report consumed by the operator UI. `verification_status`
/// is always `pending_human_review` after a verify run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub instrument_id: String,
    pub checks: Vec<VerificationCheck>,
    pub all_passed: bool,
    pub verification_status: VerificationStatus,
    pub checked_at: DateTime<Utc>,
}

/// Expected deal-side facts the supplied instrument must match. Beneficiary
/// and issuing bank are optional: when the operator has no expected value on
/// file the corresponding check reports WARN instead of comparing the
/// instrument against itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedInstrumentFacts {
    pub amount_minor: i64,
    pub currency: String,
    pub beneficiary: Option<String>,
    pub issuing_bank_bic: Option<String>,
}

/// Run the deterministic consistency checks.
pub fn run_verification_checks(
    instrument: &FundingInstrument,
    expected: &ExpectedInstrumentFacts,
    now: DateTime<Utc>,
) -> Vec<VerificationCheck> {
    let mut checks = Vec::with_capacity(5);

    checks.push(if instrument.amount_minor == expected.amount_minor {
        pass("amount_match", "instrument amount matches deal value")
    } else {
        fail(
            "amount_match",
            format!(
                "instrument amount {} differs from expected {}",
                instrument.amount_minor, expected.amount_minor
            ),
        )
    });

    checks.push(
        if instrument
            .currency
            .trim()
            .eq_ignore_ascii_case(expected.currency.trim())
        {
            pass("currency_match", "currency matches")
        } else {
            fail(
                "currency_match",
                format!(
                    "instrument currency '{}' differs from expected '{}'",
                    instrument.currency, expected.currency
                ),
            )
        },
    );

    checks.push(match expected.beneficiary.as_deref() {
        Some(beneficiary) => {
            if instrument
                .beneficiary
                .trim()
                .eq_ignore_ascii_case(beneficiary.trim())
            {
                pass("beneficiary_match", "beneficiary matches")
            } else {
                fail(
                    "beneficiary_match",
                    format!(
                        "instrument beneficiary '{}' differs from expected '{}'",
                        instrument.beneficiary, beneficiary
                    ),
                )
            }
        }
        None => warn("beneficiary_match", "no expected beneficiary on file"),
    });

    checks.push(match expected.issuing_bank_bic.as_deref() {
        Some(bic) => {
            if instrument
                .issuing_bank_bic
                .trim()
                .eq_ignore_ascii_case(bic.trim())
            {
                pass("issuing_bank_match", "issuing bank identifier matches")
            } else {
                fail(
                    "issuing_bank_match",
                    format!(
                        "issuing bank BIC '{}' differs from expected '{}'",
                        instrument.issuing_bank_bic, bic
                    ),
                )
            }
        }
        None => warn("issuing_bank_match", "no expected issuing bank on file"),
    });

    checks.push(match instrument.expires_at {
        Some(expires_at) if expires_at <= now => fail(
            "expiry",
            format!("instrument expired at {}", expires_at.to_rfc3339()),
        ),
        Some(expires_at) => pass(
            "expiry",
            format!("valid until {}", expires_at.to_rfc3339()),
        ),
        None => warn("expiry", "no expiry date on file"),
    });

    checks
}

/// Assemble the report for a verify run. Regardless of check outcomes the
/// resulting trust state is human review.
pub fn build_check_report(
    instrument_id: &str,
    checks: Vec<VerificationCheck>,
    checked_at: DateTime<Utc>,
) -> CheckReport {
    let all_passed = checks.iter().all(|c| c.status == CheckStatus::Pass);
    CheckReport {
        instrument_id: instrument_id.to_string(),
        checks,
        all_passed,
        verification_status: VerificationStatus::PendingHumanReview,
        checked_at,
    }
}

/// Trust-state transition table. There is no edge into `human_approved`
/// other than from human review.
pub fn verification_transition_allowed(from: VerificationStatus, to: VerificationStatus) -> bool {
    use VerificationStatus::*;
    matches!(
        (from, to),
        (Unverified, PendingHumanReview)
            | (PendingHumanReview, PendingHumanReview)
            | (PendingHumanReview, HumanApproved)
            | (PendingHumanReview, HumanRejected)
            | (Unverified, HumanRejected)
    )
}

/// Issuance lifecycle transition table, independent of trust state.
pub fn stage_transition_allowed(from: InstrumentStage, to: InstrumentStage) -> bool {
    use InstrumentStage::*;
    matches!(
        (from, to),
        (Draft, Issued)
            | (Draft, Cancelled)
            | (Draft, Rejected)
            | (Issued, Transmitted)
            | (Issued, Expired)
            | (Issued, Cancelled)
            | (Issued, Rejected)
            | (Transmitted, Confirmed)
            | (Transmitted, Expired)
            | (Transmitted, Cancelled)
            | (Transmitted, Rejected)
            | (Confirmed, Active)
            | (Confirmed, Expired)
            | (Confirmed, Cancelled)
            | (Active, Drawn)
            | (Active, Expired)
            | (Active, Cancelled)
    )
}

fn pass(check: &str, detail: impl Into<String>) -> VerificationCheck {
    VerificationCheck {
        check: check.to_string(),
        status: CheckStatus::Pass,
        detail: detail.into(),
    }
}

fn fail(check: &str, detail: impl Into<String>) -> VerificationCheck {
    VerificationCheck {
        check: check.to_string(),
        status: CheckStatus::Fail,
        detail: detail.into(),
    }
}

fn warn(check: &str, detail: impl Into<String>) -> VerificationCheck {
    VerificationCheck {
        check: check.to_string(),
        status: CheckStatus::Warn,
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstrumentDraft;
    use chrono::Duration;

    fn instrument(amount_minor: i64, currency: &str) -> FundingInstrument {
        InstrumentDraft {
            deal_id: "deal-1".to_string(),
            instrument_type: "standby_letter_of_credit".to_string(),
            issuing_bank: "First Commercial Bank".to_string(),
            issuing_bank_bic: "FCBKDEFF".to_string(),
            advising_bank: None,
            beneficiary: "Acme Metals".to_string(),
            amount_minor,
            currency: currency.to_string(),
            issued_at: Some(Utc::now()),
            expires_at: Some(Utc::now() + Duration::days(90)),
        }
        .into_instrument(Utc::now())
    }

    fn expected() -> ExpectedInstrumentFacts {
        ExpectedInstrumentFacts {
            amount_minor: 5_000_000,
            currency: "USD".to_string(),
            beneficiary: Some("Acme Metals".to_string()),
            issuing_bank_bic: Some("FCBKDEFF".to_string()),
        }
    }

    #[test]
    fn matching_facts_pass_but_still_require_human_review() {
        let inst = instrument(5_000_000, "USD");
        let checks = run_verification_checks(&inst, &expected(), Utc::now());
        let report = build_check_report(&inst.instrument_id, checks, Utc::now());
        assert!(report.all_passed);
        assert_eq!(
            report.verification_status,
            VerificationStatus::PendingHumanReview
        );
    }

    #[test]
    fn amount_mismatch_fails_the_check() {
        let inst = instrument(4_000_000, "USD");
        let checks = run_verification_checks(&inst, &expected(), Utc::now());
        assert!(checks
            .iter()
            .any(|c| c.check == "amount_match" && c.status == CheckStatus::Fail));
    }

    #[test]
    fn elapsed_expiry_fails() {
        let mut inst = instrument(5_000_000, "USD");
        inst.expires_at = Some(Utc::now() - Duration::days(1));
        let checks = run_verification_checks(&inst, &expected(), Utc::now());
        assert!(checks
            .iter()
            .any(|c| c.check == "expiry" && c.status == CheckStatus::Fail));
    }

    #[test]
    fn absent_expected_facts_warn_instead_of_self_comparing() {
        let inst = instrument(5_000_000, "USD");
        let facts = ExpectedInstrumentFacts {
            beneficiary: None,
            issuing_bank_bic: None,
            ..expected()
        };
        let checks = run_verification_checks(&inst, &facts, Utc::now());
        for name in ["beneficiary_match", "issuing_bank_match"] {
            let check = checks.iter().find(|c| c.check == name).unwrap();
            assert_eq!(check.status, CheckStatus::Warn);
            assert!(check.detail.contains("no expected"));
        }
        let report = build_check_report(&inst.instrument_id, checks, Utc::now());
        assert!(!report.all_passed);
    }

    #[test]
    fn missing_expiry_warns() {
        let mut inst = instrument(5_000_000, "USD");
        inst.expires_at = None;
        let checks = run_verification_checks(&inst, &expected(), Utc::now());
        assert!(checks
            .iter()
            .any(|c| c.check == "expiry" && c.status == CheckStatus::Warn));
    }

    #[test]
    fn no_automated_edge_reaches_human_approved() {
        use VerificationStatus::*;
        assert!(!verification_transition_allowed(Unverified, HumanApproved));
        assert!(!verification_transition_allowed(HumanRejected, HumanApproved));
        assert!(!verification_transition_allowed(HumanApproved, HumanApproved));
        assert!(verification_transition_allowed(
            PendingHumanReview,
            HumanApproved
        ));
    }

    #[test]
    fn stage_machine_rejects_skips_and_terminal_exits() {
        use InstrumentStage::*;
        assert!(stage_transition_allowed(Draft, Issued));
        assert!(stage_transition_allowed(Active, Drawn));
        assert!(!stage_transition_allowed(Draft, Active));
        assert!(!stage_transition_allowed(Drawn, Active));
        assert!(!stage_transition_allowed(Cancelled, Issued));
    }
}
