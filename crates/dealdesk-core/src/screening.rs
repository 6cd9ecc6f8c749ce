//! Deterministic compliance screening against the rule catalog.
//!
//! Given the same deal attributes and rule set, the output flag set is
//! identical: no randomness and no model judgment. A rule that cannot be
//! evaluated fails the whole run closed ("flags unknown"), never reports
//! zero flags.

use crate::catalog::{Rule, RuleCatalog, RuleScope};
use crate::error::DeskError;
use crate::types::{Deal, Severity};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A rule match before persistence. Snapshots the rule fields so later
/// catalog revisions never change what was flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFlag {
    pub rule_code: String,
    pub rationale: String,
    pub severity: Severity,
    pub blocks_execution: bool,
}

/// Summary of one screening run, recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub catalog_version: String,
    pub rules_evaluated: usize,
    pub matched: usize,
    /// Rule codes skipped because an unresolved flag already exists.
    pub skipped_existing: Vec<String>,
    pub screened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScreeningEngine {
    catalog: RuleCatalog,
}

impl ScreeningEngine {
    pub fn new(catalog: RuleCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Evaluate every active rule against the deal.
    pub fn screen(&self, deal: &Deal) -> Result<Vec<CandidateFlag>, DeskError> {
        let mut matched = Vec::new();
        for rule in self.catalog.rules() {
            if rule_matches(rule, deal)? {
                matched.push(CandidateFlag {
                    rule_code: rule.code.clone(),
                    rationale: rule.rationale.clone(),
                    severity: rule.severity,
                    blocks_execution: rule.blocks_execution,
                });
            }
        }
        Ok(matched)
    }
}

fn rule_matches(rule: &Rule, deal: &Deal) -> Result<bool, DeskError> {
    match &rule.scope {
        RuleScope::EmbargoedDestination { destinations } => {
            Ok(contains_country(destinations, &deal.destination_country))
        }
        RuleScope::CommodityDestination {
            commodity,
            destinations,
        } => Ok(commodity_matches(commodity, &deal.commodity)
            && contains_country(destinations, &deal.destination_country)),
        RuleScope::Commodity { commodity } => Ok(commodity_matches(commodity, &deal.commodity)),
        RuleScope::CounterpartyPattern { pattern } => {
            // A malformed pattern means this rule cannot be evaluated at all;
            // fail closed rather than treating it as a non-match.
            let re = Regex::new(pattern).map_err(|e| {
                DeskError::Dependency(format!(
                    "rule {} cannot be evaluated: invalid pattern: {e}",
                    rule.code
                ))
            })?;
            Ok(re.is_match(&deal.counterparty))
        }
        RuleScope::ValueAtLeast { min_value_minor } => Ok(deal.value_minor >= *min_value_minor),
        RuleScope::HighRiskJurisdiction { jurisdictions } => {
            Ok(contains_country(jurisdictions, &deal.origin_country)
                || contains_country(jurisdictions, &deal.destination_country))
        }
        RuleScope::MissingIncoterm => Ok(deal
            .incoterm
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .is_none()),
    }
}

fn contains_country(list: &[String], country: &str) -> bool {
    list.iter()
        .any(|entry| entry.eq_ignore_ascii_case(country.trim()))
}

fn commodity_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DealDraft;

    fn deal(commodity: &str, value_minor: i64, origin: &str, destination: &str) -> Deal {
        DealDraft::new("Helvetia Trading AG", commodity, value_minor, "USD", origin, destination)
            .with_incoterm("CIF")
            .with_quantity_mt(100.0)
            .into_deal(Utc::now())
    }

    fn engine() -> ScreeningEngine {
        ScreeningEngine::new(RuleCatalog::builtin())
    }

    #[test]
    fn clean_deal_produces_no_flags() {
        let flags = engine().screen(&deal("copper", 1_000_000, "CL", "DE")).unwrap();
        assert!(flags.is_empty());
    }

    #[test]
    fn embargoed_destination_is_critical_and_blocking() {
        let flags = engine().screen(&deal("copper", 1_000_000, "CL", "IR")).unwrap();
        let flag = flags
            .iter()
            .find(|f| f.rule_code == "EMBARGOED_DESTINATION")
            .expect("embargo flag");
        assert_eq!(flag.severity, Severity::Critical);
        assert!(flag.blocks_execution);
    }

    #[test]
    fn precious_metals_to_control_jurisdiction_blocks() {
        let flags = engine()
            .screen(&deal("precious-metals", 1_000_000, "CH", "AE"))
            .unwrap();
        assert!(flags
            .iter()
            .any(|f| f.rule_code == "RESTRICTED_METALS_DESTINATION" && f.blocks_execution));
    }

    #[test]
    fn precious_metals_elsewhere_do_not_block() {
        let flags = engine()
            .screen(&deal("precious-metals", 1_000_000, "CH", "DE"))
            .unwrap();
        assert!(flags.is_empty());
    }

    #[test]
    fn denylisted_counterparty_matches_pattern() {
        let mut d = deal("copper", 1_000_000, "CL", "DE");
        d.counterparty = "Northstar Holdings Ltd".to_string();
        let flags = engine().screen(&d).unwrap();
        assert!(flags.iter().any(|f| f.rule_code == "COUNTERPARTY_DENYLIST"));
    }

    #[test]
    fn high_value_triggers_edd_without_blocking() {
        let flags = engine().screen(&deal("copper", 60_000_000, "CL", "DE")).unwrap();
        let flag = flags
            .iter()
            .find(|f| f.rule_code == "ENHANCED_DUE_DILIGENCE")
            .expect("edd flag");
        assert_eq!(flag.severity, Severity::Medium);
        assert!(!flag.blocks_execution);
    }

    #[test]
    fn missing_incoterm_is_low_severity() {
        let mut d = deal("copper", 1_000_000, "CL", "DE");
        d.incoterm = None;
        let flags = engine().screen(&d).unwrap();
        assert!(flags
            .iter()
            .any(|f| f.rule_code == "MISSING_INCOTERM" && f.severity == Severity::Low));
    }

    #[test]
    fn screening_is_deterministic() {
        let d = deal("rough-diamonds", 60_000_000, "AF", "BE");
        let first = engine().screen(&d).unwrap();
        let second = engine().screen(&d).unwrap();
        let codes = |flags: &[CandidateFlag]| {
            flags.iter().map(|f| f.rule_code.clone()).collect::<Vec<_>>()
        };
        assert_eq!(codes(&first), codes(&second));
        assert_eq!(first.len(), 3); // kimberley + high-risk origin + edd
    }

    #[test]
    fn unevaluable_pattern_fails_closed() {
        let catalog = RuleCatalog::new(
            "test-v0",
            vec![Rule {
                code: "BAD_PATTERN".to_string(),
                scope: RuleScope::CounterpartyPattern {
                    pattern: "(unclosed".to_string(),
                },
                severity: Severity::Critical,
                rationale: "broken".to_string(),
                blocks_execution: true,
            }],
        );
        let result = ScreeningEngine::new(catalog).screen(&deal("copper", 1_000_000, "CL", "DE"));
        assert!(matches!(result, Err(DeskError::Dependency(_))));
    }
}
