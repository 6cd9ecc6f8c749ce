//! DealDesk core: trade-compliance screening, funding readiness, and
//! settlement instruction construction for commodity deals.
//!
//! This crate enforces the back-office trust invariants with explicit state
//! machines, a deterministic rule catalog, and append-only audit chains. It
//! deliberately contains no HTTP or SQL: persistence happens behind the store
//! traits in [`store`], implemented by `dealdesk-store`.

#![deny(unsafe_code)]

pub mod audit;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod funding;
pub mod instrument;
pub mod reconciler;
pub mod screening;
pub mod settlement;
pub mod store;
pub mod types;

pub use audit::{ActionAppend, ActionKind, ComplianceAction};
pub use catalog::{Rule, RuleCatalog, RuleScope, CATALOG_VERSION};
pub use engine::{
    BackOfficeEngine, DealIntake, EngineConfig, FundingOutcome, RequirementReview,
    ScreeningOutcome, SettlementCreated,
};
pub use error::DeskError;
pub use funding::{
    DerivedRequirement, FundingAnalyzer, FundingThresholds, ReadinessWeights, TermSheet,
    READINESS_VERSION,
};
pub use instrument::{CheckReport, ExpectedInstrumentFacts, VerificationCheck};
pub use screening::{CandidateFlag, ScreeningEngine, ScreeningReport};
pub use settlement::{BuiltInstruction, FiatWireParams, SettlementParams, StellarParams, XrplParams};
pub use store::{
    ActionStore, BackOfficeStore, DealStore, FlagStore, InstrumentStore, QueryWindow,
    RequirementStore, RequirementsUpsert, SettlementStore, StoreError, StoreResult,
};
pub use types::{
    ChecklistEntry, CheckStatus, ComplianceFlag, ComplianceStatus, Deal, DealDraft, DealStatus,
    EscrowMilestone, FlagResolution, FundingInstrument, FundingRequirement, InstrumentDraft,
    InstrumentStage, ReleaseStatus, RequirementStatus, SettlementInstruction, SettlementPayload,
    SettlementRail, Severity, VerificationStatus,
};
