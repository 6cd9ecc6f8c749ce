//! Deal lifecycle transition table and compliance reconciliation.
//!
//! The deal status machine and the derivation of `compliance_status` from
//! unresolved flag counts live here as pure functions so the store adapters
//! can apply them inside their own transactions.

use crate::types::{ComplianceStatus, DealStatus};

/// Raw lifecycle transition table, including the compliance-owned edges.
pub fn lifecycle_transition_allowed(from: DealStatus, to: DealStatus) -> bool {
    use DealStatus::*;
    if from == to || from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, ClosedLost) => true,
        (_, OnHold) => true,
        (Inquiry, Qualified) => true,
        (Qualified, Negotiation) => true,
        (Negotiation, Contracted) => true,
        (Contracted, Settlement) => true,
        (Settlement, ClosedWon) => true,
        (OnHold, Qualified) => true,
        _ => false,
    }
}

/// Transitions an operator may request directly. `on_hold` is entered by
/// screening and exited by flag resolution only; the single manual way out
/// of a held deal is losing it.
pub fn operator_transition_allowed(from: DealStatus, to: DealStatus) -> bool {
    if to == DealStatus::OnHold {
        return false;
    }
    if from == DealStatus::OnHold && to != DealStatus::ClosedLost {
        return false;
    }
    lifecycle_transition_allowed(from, to)
}

/// Derive `compliance_status` from unresolved flag counts.
pub fn derive_compliance(unresolved_total: usize) -> ComplianceStatus {
    if unresolved_total == 0 {
        ComplianceStatus::Cleared
    } else {
        ComplianceStatus::Flagged
    }
}

/// Reconcile a deal after one flag was resolved.
///
/// Blocking flags outstanding keep the deal held and flagged. With no
/// unresolved flags at all the deal clears, and a held deal is promoted back
/// to `qualified`. Non-blocking leftovers keep it flagged without forcing a
/// hold.
pub fn reconcile_after_resolution(
    current: DealStatus,
    unresolved_blocking: usize,
    unresolved_total: usize,
) -> (DealStatus, ComplianceStatus) {
    if unresolved_blocking > 0 {
        let status = if current.is_terminal() {
            current
        } else {
            DealStatus::OnHold
        };
        return (status, ComplianceStatus::Flagged);
    }
    if unresolved_total == 0 {
        let status = if current == DealStatus::OnHold {
            DealStatus::Qualified
        } else {
            current
        };
        return (status, ComplianceStatus::Cleared);
    }
    (current, ComplianceStatus::Flagged)
}

/// Apply a screening outcome to a deal's state. Unresolved blocking flags
/// force a hold; otherwise the lifecycle status is untouched.
pub fn apply_screening_outcome(
    current: DealStatus,
    unresolved_blocking: usize,
    unresolved_total: usize,
) -> (DealStatus, ComplianceStatus) {
    if unresolved_blocking > 0 && !current.is_terminal() {
        return (DealStatus::OnHold, ComplianceStatus::Flagged);
    }
    (current, derive_compliance(unresolved_total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use DealStatus::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        for (from, to) in [
            (Inquiry, Qualified),
            (Qualified, Negotiation),
            (Negotiation, Contracted),
            (Contracted, Settlement),
            (Settlement, ClosedWon),
        ] {
            assert!(lifecycle_transition_allowed(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for from in [ClosedWon, ClosedLost] {
            for to in [Inquiry, Qualified, OnHold, ClosedLost] {
                assert!(!lifecycle_transition_allowed(from, to));
            }
        }
    }

    #[test]
    fn operators_cannot_enter_or_skip_out_of_hold() {
        assert!(!operator_transition_allowed(Qualified, OnHold));
        assert!(!operator_transition_allowed(OnHold, Qualified));
        assert!(!operator_transition_allowed(OnHold, Settlement));
        assert!(operator_transition_allowed(OnHold, ClosedLost));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!lifecycle_transition_allowed(Contracted, Qualified));
        assert!(!lifecycle_transition_allowed(Settlement, Inquiry));
    }

    #[test]
    fn blocking_flags_keep_the_deal_held() {
        let (status, compliance) = reconcile_after_resolution(OnHold, 1, 2);
        assert_eq!(status, OnHold);
        assert_eq!(compliance, ComplianceStatus::Flagged);
    }

    #[test]
    fn full_resolution_promotes_held_deal_to_qualified() {
        let (status, compliance) = reconcile_after_resolution(OnHold, 0, 0);
        assert_eq!(status, Qualified);
        assert_eq!(compliance, ComplianceStatus::Cleared);
    }

    #[test]
    fn nonblocking_leftovers_flag_without_forcing_hold() {
        let (status, compliance) = reconcile_after_resolution(Negotiation, 0, 2);
        assert_eq!(status, Negotiation);
        assert_eq!(compliance, ComplianceStatus::Flagged);
    }

    #[test]
    fn screening_with_blocking_flag_forces_hold() {
        let (status, compliance) = apply_screening_outcome(Inquiry, 1, 1);
        assert_eq!(status, OnHold);
        assert_eq!(compliance, ComplianceStatus::Flagged);
    }

    #[test]
    fn screening_with_no_flags_clears() {
        let (status, compliance) = apply_screening_outcome(Inquiry, 0, 0);
        assert_eq!(status, Inquiry);
        assert_eq!(compliance, ComplianceStatus::Cleared);
    }
}
