//! Funding requirements analysis and the readiness score.
//!
//! The analyzer derives a document/instrument checklist from deal value,
//! commodity, and jurisdictions. The readiness score is a deterministic
//! function of the requirement set: it starts at 100, loses a fixed penalty
//! per open requirement, and floors at 0. Approved and waived requirements
//! cost nothing.

use crate::types::{Deal, FundingRequirement, RequirementStatus};
use serde::{Deserialize, Serialize};

/// Version tag for the scoring formula and its weights.
pub const READINESS_VERSION: &str = "dealdesk-readiness-v1";

/// Default penalty per open critical requirement.
pub const CRITICAL_PENALTY: u8 = 25;

/// Default penalty per open optional requirement.
pub const OPTIONAL_PENALTY: u8 = 10;

/// Named, versioned scoring weights. Business configuration, not code
/// constants buried in the formula.
#[derive(Debug, Clone)]
pub struct ReadinessWeights {
    pub version: String,
    pub critical_penalty: u8,
    pub optional_penalty: u8,
}

impl Default for ReadinessWeights {
    fn default() -> Self {
        Self {
            version: READINESS_VERSION.to_string(),
            critical_penalty: CRITICAL_PENALTY,
            optional_penalty: OPTIONAL_PENALTY,
        }
    }
}

/// Value and quantity thresholds that widen the requirement set.
#[derive(Debug, Clone)]
pub struct FundingThresholds {
    /// Deals at or above this value must be backed by a banking instrument.
    pub instrument_value_minor: i64,
    /// Enhanced due diligence report threshold.
    pub edd_value_minor: i64,
    /// Audited counterparty financials threshold.
    pub financials_value_minor: i64,
    /// Bulk cargo quantity (metric tons) requiring inspection evidence.
    pub bulk_quantity_mt: f64,
}

impl Default for FundingThresholds {
    fn default() -> Self {
        Self {
            instrument_value_minor: 25_000_000,
            edd_value_minor: 50_000_000,
            financials_value_minor: 100_000_000,
            bulk_quantity_mt: 500.0,
        }
    }
}

/// One derived checklist item before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedRequirement {
    pub requirement_type: String,
    pub label: String,
    pub is_critical: bool,
    pub due_in_days: i64,
}

impl DerivedRequirement {
    fn critical(requirement_type: &str, label: &str) -> Self {
        Self {
            requirement_type: requirement_type.to_string(),
            label: label.to_string(),
            is_critical: true,
            due_in_days: 14,
        }
    }

    fn optional(requirement_type: &str, label: &str) -> Self {
        Self {
            requirement_type: requirement_type.to_string(),
            label: label.to_string(),
            is_critical: false,
            due_in_days: 30,
        }
    }
}

/// Requirement set plus the score it implies with every item still open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermSheet {
    pub requirements: Vec<DerivedRequirement>,
    pub readiness_score: u8,
}

#[derive(Debug, Clone, Default)]
pub struct FundingAnalyzer {
    weights: ReadinessWeights,
    thresholds: FundingThresholds,
}

impl FundingAnalyzer {
    pub fn new(weights: ReadinessWeights, thresholds: FundingThresholds) -> Self {
        Self {
            weights,
            thresholds,
        }
    }

    pub fn weights(&self) -> &ReadinessWeights {
        &self.weights
    }

    /// Derive the requirement checklist for a deal.
    pub fn analyze(&self, deal: &Deal) -> TermSheet {
        let mut requirements = vec![
            DerivedRequirement::critical("kyc_dossier", "Counterparty KYC dossier"),
            DerivedRequirement::critical("sales_contract", "Signed sales contract"),
        ];

        let cross_border = !deal
            .origin_country
            .trim()
            .eq_ignore_ascii_case(deal.destination_country.trim());
        if cross_border {
            requirements.push(DerivedRequirement::critical(
                "export_license",
                "Export license for origin jurisdiction",
            ));
            requirements.push(DerivedRequirement::critical(
                "import_license",
                "Import license for destination jurisdiction",
            ));
            requirements.push(DerivedRequirement::optional(
                "certificate_of_origin",
                "Certificate of origin",
            ));
        }

        if deal.value_minor >= self.thresholds.instrument_value_minor {
            requirements.push(DerivedRequirement::critical(
                "banking_instrument",
                "Standby or documentary credit covering deal value",
            ));
        }
        if deal.value_minor >= self.thresholds.edd_value_minor {
            requirements.push(DerivedRequirement::critical(
                "edd_report",
                "Enhanced due diligence report",
            ));
        }
        if deal.value_minor >= self.thresholds.financials_value_minor {
            requirements.push(DerivedRequirement::optional(
                "audited_financials",
                "Audited counterparty financial statements",
            ));
        }

        let commodity = deal.commodity.trim().to_ascii_lowercase();
        if commodity == "precious-metals" || commodity == "rough-diamonds" {
            requirements.push(DerivedRequirement::critical(
                "provenance_dossier",
                "Chain-of-custody provenance dossier",
            ));
        }
        if commodity == "rough-diamonds" {
            requirements.push(DerivedRequirement::critical(
                "kimberley_certificate",
                "Kimberley Process certificate",
            ));
        }

        if deal.quantity_mt >= self.thresholds.bulk_quantity_mt {
            requirements.push(DerivedRequirement::optional(
                "inspection_certificate",
                "Independent cargo inspection certificate",
            ));
        }
        requirements.push(DerivedRequirement::optional(
            "insurance_certificate",
            "Cargo insurance certificate",
        ));

        let readiness_score = self.score_derived(&requirements);
        TermSheet {
            requirements,
            readiness_score,
        }
    }

    /// Score persisted requirements for a deal.
    pub fn score_requirements(&self, requirements: &[FundingRequirement]) -> u8 {
        let mut score: i32 = 100;
        for requirement in requirements {
            if penalty_applies(requirement.status) {
                score -= if requirement.is_critical {
                    i32::from(self.weights.critical_penalty)
                } else {
                    i32::from(self.weights.optional_penalty)
                };
            }
        }
        score.clamp(0, 100) as u8
    }

    fn score_derived(&self, requirements: &[DerivedRequirement]) -> u8 {
        let mut score: i32 = 100;
        for requirement in requirements {
            score -= if requirement.is_critical {
                i32::from(self.weights.critical_penalty)
            } else {
                i32::from(self.weights.optional_penalty)
            };
        }
        score.clamp(0, 100) as u8
    }
}

/// Open statuses carry their penalty; approved and waived cost nothing.
pub fn penalty_applies(status: RequirementStatus) -> bool {
    matches!(
        status,
        RequirementStatus::Pending
            | RequirementStatus::Submitted
            | RequirementStatus::UnderReview
            | RequirementStatus::Rejected
    )
}

/// Requirement review transition table.
pub fn requirement_transition_allowed(from: RequirementStatus, to: RequirementStatus) -> bool {
    use RequirementStatus::*;
    matches!(
        (from, to),
        (Pending, Submitted)
            | (Pending, Waived)
            | (Submitted, UnderReview)
            | (UnderReview, Approved)
            | (UnderReview, Rejected)
            | (UnderReview, Waived)
            | (Rejected, Submitted)
    )
}

/// Review outcomes require a named reviewer.
pub fn requires_reviewer(to: RequirementStatus) -> bool {
    matches!(
        to,
        RequirementStatus::Approved | RequirementStatus::Rejected | RequirementStatus::Waived
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DealDraft;
    use chrono::Utc;
    use proptest::prelude::*;

    fn deal(commodity: &str, value_minor: i64, origin: &str, destination: &str) -> Deal {
        DealDraft::new("Acme Metals", commodity, value_minor, "USD", origin, destination)
            .with_incoterm("FOB")
            .with_quantity_mt(100.0)
            .into_deal(Utc::now())
    }

    fn requirement(is_critical: bool, status: RequirementStatus) -> FundingRequirement {
        let now = Utc::now();
        FundingRequirement {
            requirement_id: "req-1".to_string(),
            deal_id: "deal-1".to_string(),
            requirement_type: "kyc_dossier".to_string(),
            label: "Counterparty KYC dossier".to_string(),
            is_critical,
            status,
            due_date: None,
            reviewer: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn domestic_small_deal_has_baseline_requirements() {
        let sheet = FundingAnalyzer::default().analyze(&deal("copper", 1_000_000, "DE", "DE"));
        let types: Vec<_> = sheet
            .requirements
            .iter()
            .map(|r| r.requirement_type.as_str())
            .collect();
        assert!(types.contains(&"kyc_dossier"));
        assert!(types.contains(&"sales_contract"));
        assert!(!types.contains(&"export_license"));
        assert!(!types.contains(&"banking_instrument"));
    }

    #[test]
    fn cross_border_high_value_widens_the_checklist() {
        let sheet = FundingAnalyzer::default().analyze(&deal("copper", 60_000_000, "CL", "DE"));
        let types: Vec<_> = sheet
            .requirements
            .iter()
            .map(|r| r.requirement_type.as_str())
            .collect();
        assert!(types.contains(&"export_license"));
        assert!(types.contains(&"import_license"));
        assert!(types.contains(&"banking_instrument"));
        assert!(types.contains(&"edd_report"));
    }

    #[test]
    fn rough_diamonds_require_kimberley_certificate() {
        let sheet =
            FundingAnalyzer::default().analyze(&deal("rough-diamonds", 1_000_000, "BW", "BE"));
        assert!(sheet
            .requirements
            .iter()
            .any(|r| r.requirement_type == "kimberley_certificate" && r.is_critical));
    }

    #[test]
    fn score_uses_named_weights() {
        let analyzer = FundingAnalyzer::default();
        let requirements = vec![
            requirement(true, RequirementStatus::Pending),
            requirement(false, RequirementStatus::Pending),
        ];
        assert_eq!(
            analyzer.score_requirements(&requirements),
            100 - CRITICAL_PENALTY - OPTIONAL_PENALTY
        );
    }

    #[test]
    fn approved_and_waived_cost_nothing() {
        let analyzer = FundingAnalyzer::default();
        let requirements = vec![
            requirement(true, RequirementStatus::Approved),
            requirement(false, RequirementStatus::Waived),
        ];
        assert_eq!(analyzer.score_requirements(&requirements), 100);
    }

    #[test]
    fn score_floors_at_zero() {
        let analyzer = FundingAnalyzer::default();
        let requirements: Vec<_> = (0..10)
            .map(|_| requirement(true, RequirementStatus::Rejected))
            .collect();
        assert_eq!(analyzer.score_requirements(&requirements), 0);
    }

    #[test]
    fn review_transitions_follow_the_table() {
        use RequirementStatus::*;
        assert!(requirement_transition_allowed(Pending, Submitted));
        assert!(requirement_transition_allowed(Rejected, Submitted));
        assert!(requirement_transition_allowed(UnderReview, Waived));
        assert!(!requirement_transition_allowed(Pending, Approved));
        assert!(!requirement_transition_allowed(Approved, Rejected));
        assert!(!requirement_transition_allowed(Waived, Submitted));
    }

    fn status_strategy() -> impl Strategy<Value = RequirementStatus> {
        prop_oneof![
            Just(RequirementStatus::Pending),
            Just(RequirementStatus::Submitted),
            Just(RequirementStatus::UnderReview),
            Just(RequirementStatus::Approved),
            Just(RequirementStatus::Rejected),
            Just(RequirementStatus::Waived),
        ]
    }

    proptest! {
        #[test]
        fn score_is_bounded(
            specs in proptest::collection::vec((any::<bool>(), status_strategy()), 0..40)
        ) {
            let analyzer = FundingAnalyzer::default();
            let requirements: Vec<_> = specs
                .iter()
                .map(|(critical, status)| requirement(*critical, *status))
                .collect();
            let score = analyzer.score_requirements(&requirements);
            prop_assert!(score <= 100);
        }

        #[test]
        fn approving_one_requirement_never_lowers_the_score(
            specs in proptest::collection::vec((any::<bool>(), status_strategy()), 1..40),
            index in 0usize..40
        ) {
            let analyzer = FundingAnalyzer::default();
            let index = index % specs.len();
            let before: Vec<_> = specs
                .iter()
                .map(|(critical, status)| requirement(*critical, *status))
                .collect();
            let mut after = before.clone();
            after[index].status = RequirementStatus::Approved;
            prop_assert!(
                analyzer.score_requirements(&after) >= analyzer.score_requirements(&before)
            );
        }
    }
}
