//! Versioned rule catalog for jurisdiction, sanctions, and commodity
//! restrictions.
//!
//! Rules are immutable once referenced by a flag: revisions create new rules
//! under a new catalog version instead of mutating old ones, and flags
//! snapshot the rule fields at raise time.

use crate::types::Severity;
use serde::{Deserialize, Serialize};

/// Catalog version recorded on every screening run.
pub const CATALOG_VERSION: &str = "dealdesk-rules-v1";

/// Destinations under comprehensive embargo.
pub const EMBARGOED_DESTINATIONS: &[&str] = &["KP", "IR", "SY", "CU"];

/// Gold-control jurisdictions restricted for precious metals shipments.
pub const METALS_CONTROL_DESTINATIONS: &[&str] = &["AE", "TR", "HK"];

/// Jurisdictions requiring enhanced monitoring; matches do not block execution.
pub const HIGH_RISK_JURISDICTIONS: &[&str] = &["AF", "YE", "LY", "SO", "SS"];

/// Counterparty name patterns on the internal denylist.
pub const COUNTERPARTY_DENYLIST_PATTERNS: &[&str] = &[
    r"(?i)\bnorthstar\s+holdings\b",
    r"(?i)\bzenith\s+commodities\s+fz\b",
];

/// Deal value (minor units) at which enhanced due diligence applies.
pub const EDD_VALUE_THRESHOLD_MINOR: i64 = 50_000_000;

/// What a rule matches against. Evaluated exhaustively by the screening
/// engine; adding a variant forces every evaluator to handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleScope {
    EmbargoedDestination { destinations: Vec<String> },
    CommodityDestination { commodity: String, destinations: Vec<String> },
    Commodity { commodity: String },
    CounterpartyPattern { pattern: String },
    ValueAtLeast { min_value_minor: i64 },
    HighRiskJurisdiction { jurisdictions: Vec<String> },
    MissingIncoterm,
}

/// A jurisdiction/commodity/sanctions restriction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub code: String,
    pub scope: RuleScope,
    pub severity: Severity,
    pub rationale: String,
    pub blocks_execution: bool,
}

/// The active rule set, versioned in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub version: String,
    pub rules: Vec<Rule>,
}

impl RuleCatalog {
    pub fn new(version: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            version: version.into(),
            rules,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The v1 catalog shipped with the desk.
    pub fn builtin() -> Self {
        let mut rules = vec![
            Rule {
                code: "EMBARGOED_DESTINATION".to_string(),
                scope: RuleScope::EmbargoedDestination {
                    destinations: to_strings(EMBARGOED_DESTINATIONS),
                },
                severity: Severity::Critical,
                rationale: "destination jurisdiction is under comprehensive embargo".to_string(),
                blocks_execution: true,
            },
            Rule {
                code: "RESTRICTED_METALS_DESTINATION".to_string(),
                scope: RuleScope::CommodityDestination {
                    commodity: "precious-metals".to_string(),
                    destinations: to_strings(METALS_CONTROL_DESTINATIONS),
                },
                severity: Severity::Critical,
                rationale: "precious metals shipments to gold-control jurisdictions require \
                            pre-clearance"
                    .to_string(),
                blocks_execution: true,
            },
            Rule {
                code: "KIMBERLEY_CERTIFICATION".to_string(),
                scope: RuleScope::Commodity {
                    commodity: "rough-diamonds".to_string(),
                },
                severity: Severity::High,
                rationale: "rough diamond trades require Kimberley Process certification"
                    .to_string(),
                blocks_execution: true,
            },
            Rule {
                code: "HIGH_RISK_JURISDICTION".to_string(),
                scope: RuleScope::HighRiskJurisdiction {
                    jurisdictions: to_strings(HIGH_RISK_JURISDICTIONS),
                },
                severity: Severity::Medium,
                rationale: "origin or destination is a high-risk jurisdiction; enhanced \
                            monitoring applies"
                    .to_string(),
                blocks_execution: false,
            },
            Rule {
                code: "ENHANCED_DUE_DILIGENCE".to_string(),
                scope: RuleScope::ValueAtLeast {
                    min_value_minor: EDD_VALUE_THRESHOLD_MINOR,
                },
                severity: Severity::Medium,
                rationale: "deal value exceeds the enhanced due diligence threshold".to_string(),
                blocks_execution: false,
            },
            Rule {
                code: "MISSING_INCOTERM".to_string(),
                scope: RuleScope::MissingIncoterm,
                severity: Severity::Low,
                rationale: "no incoterm recorded; delivery risk allocation is undefined"
                    .to_string(),
                blocks_execution: false,
            },
        ];

        for pattern in COUNTERPARTY_DENYLIST_PATTERNS {
            rules.push(Rule {
                code: "COUNTERPARTY_DENYLIST".to_string(),
                scope: RuleScope::CounterpartyPattern {
                    pattern: (*pattern).to_string(),
                },
                severity: Severity::Critical,
                rationale: "counterparty matches an internal denylist entry".to_string(),
                blocks_execution: true,
            });
        }

        Self::new(CATALOG_VERSION, rules)
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_versioned() {
        let catalog = RuleCatalog::builtin();
        assert_eq!(catalog.version, CATALOG_VERSION);
        assert!(!catalog.rules.is_empty());
    }

    #[test]
    fn blocking_rules_are_critical_or_high() {
        for rule in RuleCatalog::builtin().rules() {
            if rule.blocks_execution {
                assert!(
                    rule.severity >= Severity::High,
                    "blocking rule {} below high severity",
                    rule.code
                );
            }
        }
    }
}
