//! Rail-specific settlement instruction builders and escrow milestones.
//!
//! Builders are pure functions of validated input: they construct a typed
//! payload plus a validation checklist and never execute transfers. An
//! instruction is validated only when its checklist contains zero FAIL
//! entries; warnings and open items do not block.

use crate::error::{require_non_empty, DeskError};
use crate::types::{
    ChecklistEntry, CheckStatus, ReleaseStatus, SettlementPayload, SettlementRail,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

const BIC_PATTERN: &str = r"^[A-Z]{4}[A-Z]{2}[A-Z0-9]{2}([A-Z0-9]{3})?$";
const XRPL_ADDRESS_PATTERN: &str = r"^r[1-9A-HJ-NP-Za-km-z]{24,34}$";
const STELLAR_ADDRESS_PATTERN: &str = r"^G[A-Z2-7]{55}$";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiatWireParams {
    pub beneficiary_name: String,
    pub beneficiary_account: String,
    pub swift_bic: String,
    pub intermediary_bank: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrplParams {
    pub destination_address: String,
    pub destination_tag: Option<u32>,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StellarParams {
    pub destination_address: String,
    pub memo: Option<String>,
    /// Exchange-hosted destinations multiplex deposits by memo.
    pub exchange_destination: bool,
    pub amount_minor: i64,
    pub currency: String,
}

/// Rail selector plus parameters, tagged for the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "snake_case")]
pub enum SettlementParams {
    FiatWire(FiatWireParams),
    Xrpl(XrplParams),
    Stellar(StellarParams),
}

/// A constructed instruction before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltInstruction {
    pub rail: SettlementRail,
    pub payload: SettlementPayload,
    pub checklist: Vec<ChecklistEntry>,
    pub is_validated: bool,
}

pub fn build_instructions(params: &SettlementParams) -> Result<BuiltInstruction, DeskError> {
    match params {
        SettlementParams::FiatWire(p) => build_fiat_instructions(p),
        SettlementParams::Xrpl(p) => build_xrpl_instructions(p),
        SettlementParams::Stellar(p) => build_stellar_instructions(p),
    }
}

pub fn build_fiat_instructions(params: &FiatWireParams) -> Result<BuiltInstruction, DeskError> {
    require_non_empty("beneficiary_name", &params.beneficiary_name)?;
    require_non_empty("beneficiary_account", &params.beneficiary_account)?;
    require_non_empty("swift_bic", &params.swift_bic)?;
    require_positive_amount(params.amount_minor)?;
    require_non_empty("currency", &params.currency)?;

    let payload = SettlementPayload::FiatWire {
        beneficiary_name: params.beneficiary_name.clone(),
        beneficiary_account: params.beneficiary_account.clone(),
        swift_bic: params.swift_bic.clone(),
        intermediary_bank: params.intermediary_bank.clone(),
        amount_minor: params.amount_minor,
        currency: params.currency.clone(),
    };
    finish(SettlementRail::FiatWire, payload)
}

pub fn build_xrpl_instructions(params: &XrplParams) -> Result<BuiltInstruction, DeskError> {
    require_non_empty("destination_address", &params.destination_address)?;
    require_positive_amount(params.amount_minor)?;
    require_non_empty("currency", &params.currency)?;

    let payload = SettlementPayload::Xrpl {
        destination_address: params.destination_address.clone(),
        destination_tag: params.destination_tag,
        amount_minor: params.amount_minor,
        currency: params.currency.clone(),
    };
    finish(SettlementRail::Xrpl, payload)
}

pub fn build_stellar_instructions(params: &StellarParams) -> Result<BuiltInstruction, DeskError> {
    require_non_empty("destination_address", &params.destination_address)?;
    require_positive_amount(params.amount_minor)?;
    require_non_empty("currency", &params.currency)?;

    let payload = SettlementPayload::Stellar {
        destination_address: params.destination_address.clone(),
        memo: params.memo.clone(),
        exchange_destination: params.exchange_destination,
        amount_minor: params.amount_minor,
        currency: params.currency.clone(),
    };
    finish(SettlementRail::Stellar, payload)
}

/// Run the rail's validation checklist against a payload. Used at build time
/// and again by re-validation against the stored payload.
pub fn run_checklist(payload: &SettlementPayload) -> Result<Vec<ChecklistEntry>, DeskError> {
    match payload {
        SettlementPayload::FiatWire {
            swift_bic,
            intermediary_bank,
            currency,
            ..
        } => {
            let mut checklist = vec![format_check(
                "bic_format",
                BIC_PATTERN,
                swift_bic.trim(),
                "SWIFT/BIC does not match the ISO 9362 format",
            )?];
            checklist.push(match intermediary_bank {
                Some(bank) if !bank.trim().is_empty() => entry(
                    "intermediary_bank",
                    CheckStatus::Pass,
                    format!("routed via {}", bank.trim()),
                ),
                _ => entry(
                    "intermediary_bank",
                    CheckStatus::Warn,
                    "no intermediary bank specified; direct routing assumed",
                ),
            });
            checklist.push(currency_check(currency));
            checklist.push(entry(
                "wire_confirmation",
                CheckStatus::Todo,
                "attach MT103 confirmation once the wire is sent",
            ));
            Ok(checklist)
        }
        SettlementPayload::Xrpl {
            destination_address,
            destination_tag,
            currency,
            ..
        } => {
            let mut checklist = vec![format_check(
                "destination_address_format",
                XRPL_ADDRESS_PATTERN,
                destination_address.trim(),
                "destination is not a valid XRPL classic address",
            )?];
            checklist.push(match destination_tag {
                Some(tag) => entry(
                    "destination_tag",
                    CheckStatus::Pass,
                    format!("destination tag {tag} present"),
                ),
                None => entry(
                    "destination_tag",
                    CheckStatus::Fail,
                    "missing destination tag; funds may be unrecoverable at hosted destinations",
                ),
            });
            checklist.push(currency_check(currency));
            Ok(checklist)
        }
        SettlementPayload::Stellar {
            destination_address,
            memo,
            exchange_destination,
            currency,
            ..
        } => {
            let mut checklist = vec![format_check(
                "destination_address_format",
                STELLAR_ADDRESS_PATTERN,
                destination_address.trim(),
                "destination is not a valid Stellar public key",
            )?];
            let memo_present = memo.as_deref().map(str::trim).is_some_and(|m| !m.is_empty());
            checklist.push(if memo_present {
                entry("memo", CheckStatus::Pass, "memo attached")
            } else if *exchange_destination {
                entry(
                    "memo",
                    CheckStatus::Fail,
                    "missing memo for exchange-hosted destination; funds may be unrecoverable",
                )
            } else {
                entry(
                    "memo",
                    CheckStatus::Warn,
                    "no memo attached; confirm the destination does not require one",
                )
            });
            checklist.push(currency_check(currency));
            Ok(checklist)
        }
    }
}

/// Validated means zero FAIL entries; WARN and TODO are acceptable.
pub fn checklist_is_validated(checklist: &[ChecklistEntry]) -> bool {
    checklist.iter().all(|e| e.status != CheckStatus::Fail)
}

/// Escrow release transition table. `release` walks a milestone one step
/// toward `released`; a dispute re-queues through `pending_release`.
pub fn milestone_transition_allowed(from: ReleaseStatus, to: ReleaseStatus) -> bool {
    use ReleaseStatus::*;
    matches!(
        (from, to),
        (Locked, PendingRelease)
            | (PendingRelease, Released)
            | (PendingRelease, Disputed)
            | (Disputed, PendingRelease)
    )
}

fn finish(rail: SettlementRail, payload: SettlementPayload) -> Result<BuiltInstruction, DeskError> {
    let checklist = run_checklist(&payload)?;
    let is_validated = checklist_is_validated(&checklist);
    Ok(BuiltInstruction {
        rail,
        payload,
        checklist,
        is_validated,
    })
}

fn format_check(
    check: &str,
    pattern: &str,
    value: &str,
    fail_detail: &str,
) -> Result<ChecklistEntry, DeskError> {
    let re = Regex::new(pattern)
        .map_err(|e| DeskError::Dependency(format!("checklist pattern unavailable: {e}")))?;
    Ok(if re.is_match(value) {
        entry(check, CheckStatus::Pass, format!("'{value}' is well-formed"))
    } else {
        entry(check, CheckStatus::Fail, fail_detail)
    })
}

fn currency_check(currency: &str) -> ChecklistEntry {
    let trimmed = currency.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_uppercase()) {
        entry("currency_code", CheckStatus::Pass, format!("{trimmed} accepted"))
    } else {
        entry(
            "currency_code",
            CheckStatus::Warn,
            format!("'{trimmed}' is not a three-letter ISO currency code"),
        )
    }
}

fn entry(check: &str, status: CheckStatus, detail: impl Into<String>) -> ChecklistEntry {
    ChecklistEntry {
        check: check.to_string(),
        status,
        detail: detail.into(),
    }
}

fn require_positive_amount(amount_minor: i64) -> Result<(), DeskError> {
    if amount_minor <= 0 {
        return Err(DeskError::Validation(
            "amount_minor must be positive".to_string(),
        ));
    }
    Ok(())
}
