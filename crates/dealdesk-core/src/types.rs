use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deal lifecycle state. Transitions are validated by the reconciler's
/// transition table; `on_hold` is owned by compliance screening and can only
/// be exited through flag resolution (or by losing the deal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Inquiry,
    Qualified,
    Negotiation,
    Contracted,
    Settlement,
    OnHold,
    ClosedWon,
    ClosedLost,
}

impl DealStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DealStatus::ClosedWon | DealStatus::ClosedLost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Pending,
    Cleared,
    Flagged,
}

/// Flag severity, ordered LOW < MEDIUM < HIGH < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A commodity trade transaction. Monetary values are integer minor units
/// plus an ISO currency code; deals are never deleted (audit retention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub deal_id: String,
    pub counterparty: String,
    pub commodity: String,
    pub value_minor: i64,
    pub currency: String,
    pub origin_country: String,
    pub destination_country: String,
    pub incoterm: Option<String>,
    pub quantity_mt: f64,
    pub payment_terms: String,
    pub status: DealStatus,
    pub compliance_status: ComplianceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Intake payload for a new deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealDraft {
    pub counterparty: String,
    pub commodity: String,
    pub value_minor: i64,
    pub currency: String,
    pub origin_country: String,
    pub destination_country: String,
    pub incoterm: Option<String>,
    pub quantity_mt: f64,
    pub payment_terms: String,
}

impl DealDraft {
    pub fn new(
        counterparty: impl Into<String>,
        commodity: impl Into<String>,
        value_minor: i64,
        currency: impl Into<String>,
        origin_country: impl Into<String>,
        destination_country: impl Into<String>,
    ) -> Self {
        Self {
            counterparty: counterparty.into(),
            commodity: commodity.into(),
            value_minor,
            currency: currency.into(),
            origin_country: origin_country.into(),
            destination_country: destination_country.into(),
            incoterm: None,
            quantity_mt: 0.0,
            payment_terms: "open_account".to_string(),
        }
    }

    pub fn with_incoterm(mut self, incoterm: impl Into<String>) -> Self {
        self.incoterm = Some(incoterm.into());
        self
    }

    pub fn with_quantity_mt(mut self, quantity_mt: f64) -> Self {
        self.quantity_mt = quantity_mt;
        self
    }

    pub fn with_payment_terms(mut self, payment_terms: impl Into<String>) -> Self {
        self.payment_terms = payment_terms.into();
        self
    }

    pub(crate) fn into_deal(self, now: DateTime<Utc>) -> Deal {
        Deal {
            deal_id: format!("deal-{}", Uuid::new_v4()),
            counterparty: self.counterparty,
            commodity: self.commodity,
            value_minor: self.value_minor,
            currency: self.currency,
            origin_country: self.origin_country,
            destination_country: self.destination_country,
            incoterm: self.incoterm,
            quantity_mt: self.quantity_mt,
            payment_terms: self.payment_terms,
            status: DealStatus::Inquiry,
            compliance_status: ComplianceStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A recorded compliance concern against a deal. The rule's code, rationale,
/// severity, and blocking bit are snapshotted at raise time so catalog
/// revisions never mutate history. Once resolved, the flag is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceFlag {
    pub flag_id: String,
    pub deal_id: String,
    pub rule_code: String,
    pub rationale: String,
    pub severity: Severity,
    pub blocks_execution: bool,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub raised_at: DateTime<Utc>,
}

/// Outcome of resolving a flag: the resolved flag plus the owning deal with
/// its reconciled lifecycle and compliance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagResolution {
    pub flag: ComplianceFlag,
    pub deal: Deal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Pending,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Waived,
}

/// One funding checklist line item for a deal. Uniqueness is
/// `(deal_id, requirement_type, label)`; re-running the analyzer never
/// duplicates a row or resets its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRequirement {
    pub requirement_id: String,
    pub deal_id: String,
    pub requirement_type: String,
    pub label: String,
    pub is_critical: bool,
    pub status: RequirementStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub reviewer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Issuance lifecycle of a banking instrument. Orthogonal to
/// [`VerificationStatus`]; the two state machines never drive each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStage {
    Draft,
    Issued,
    Transmitted,
    Confirmed,
    Active,
    Drawn,
    Expired,
    Cancelled,
    Rejected,
}

impl InstrumentStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstrumentStage::Drawn
                | InstrumentStage::Expired
                | InstrumentStage::Cancelled
                | InstrumentStage::Rejected
        )
    }
}

/// Trust state of an instrument. No automated path reaches `HumanApproved`:
/// automated checks only ever land in `PendingHumanReview`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    PendingHumanReview,
    HumanApproved,
    HumanRejected,
}

/// A banking instrument claimed to back a deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingInstrument {
    pub instrument_id: String,
    pub deal_id: String,
    pub instrument_type: String,
    pub issuing_bank: String,
    pub issuing_bank_bic: String,
    pub advising_bank: Option<String>,
    pub beneficiary: String,
    pub amount_minor: i64,
    pub currency: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub stage: InstrumentStage,
    pub verification_status: VerificationStatus,
    /// Always true by policy; kept explicit so the record is self-describing.
    pub human_approval_required: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload for a new instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDraft {
    pub deal_id: String,
    pub instrument_type: String,
    pub issuing_bank: String,
    pub issuing_bank_bic: String,
    pub advising_bank: Option<String>,
    pub beneficiary: String,
    pub amount_minor: i64,
    pub currency: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstrumentDraft {
    pub(crate) fn into_instrument(self, now: DateTime<Utc>) -> FundingInstrument {
        FundingInstrument {
            instrument_id: format!("inst-{}", Uuid::new_v4()),
            deal_id: self.deal_id,
            instrument_type: self.instrument_type,
            issuing_bank: self.issuing_bank,
            issuing_bank_bic: self.issuing_bank_bic,
            advising_bank: self.advising_bank,
            beneficiary: self.beneficiary,
            amount_minor: self.amount_minor,
            currency: self.currency,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            stage: InstrumentStage::Draft,
            verification_status: VerificationStatus::Unverified,
            human_approval_required: true,
            approved_by: None,
            approved_at: None,
            approval_notes: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            last_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Todo,
}

/// One line of a settlement validation checklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistEntry {
    pub check: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementRail {
    FiatWire,
    Xrpl,
    Stellar,
}

/// Rail-specific instruction payload. Generated/validated data only: nothing
/// in this system moves funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "snake_case")]
pub enum SettlementPayload {
    FiatWire {
        beneficiary_name: String,
        beneficiary_account: String,
        swift_bic: String,
        intermediary_bank: Option<String>,
        amount_minor: i64,
        currency: String,
    },
    Xrpl {
        destination_address: String,
        destination_tag: Option<u32>,
        amount_minor: i64,
        currency: String,
    },
    Stellar {
        destination_address: String,
        memo: Option<String>,
        exchange_destination: bool,
        amount_minor: i64,
        currency: String,
    },
}

/// A persisted settlement instruction with its checklist snapshot. The
/// payload is immutable; re-validation produces a new checklist snapshot
/// under an incremented revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub settlement_id: String,
    pub deal_id: String,
    pub rail: SettlementRail,
    pub payload: SettlementPayload,
    pub checklist: Vec<ChecklistEntry>,
    pub is_validated: bool,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub revalidated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Locked,
    PendingRelease,
    Released,
    Disputed,
}

/// A release condition tied to a settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowMilestone {
    pub milestone_id: String,
    pub settlement_id: String,
    pub deal_id: String,
    pub label: String,
    pub sequence: u32,
    pub release_status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
