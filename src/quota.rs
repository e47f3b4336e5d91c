//! Admission gate for generation requests.
//!
//! The gate decides from a ledger snapshot whether a request may run and
//! which charge it will eventually carry. The charge is NOT applied at
//! admission: the orchestrator applies it only after inference and
//! validation succeed, so nobody pays for output the system could not
//! interpret. The price of that ordering is a small race window, closed
//! by the ledger's conditional updates at apply time.

use crate::error::CoreError;
use crate::ledger::{LedgerStore, Profile, Tier, FREE_LIMIT};
use std::sync::Arc;

/// The balance mutation a completed request will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// Premium principals are not metered.
    None,
    /// Increment the free-tier usage counter by one.
    FreeUse,
    /// Decrement the purchased-credit balance by one.
    Credit,
}

/// Why a request was turned away at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Free limit reached and no credits left.
    QuotaExhausted,
    /// No ledger row for the principal — a configuration fault, not a
    /// retryable condition.
    ProfileNotFound,
}

/// Gate decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted(Charge),
    Denied(DenyReason),
}

/// Quota gate over the ledger store.
pub struct QuotaGate {
    ledger: Arc<LedgerStore>,
}

impl QuotaGate {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Decide admission for a principal from its current snapshot.
    pub fn admit(&self, principal_id: &str) -> anyhow::Result<Decision> {
        let Some(profile) = self.ledger.get_profile(principal_id)? else {
            return Ok(Decision::Denied(DenyReason::ProfileNotFound));
        };
        Ok(decide(&profile))
    }

    /// Apply the charge decided at admission, exactly once.
    ///
    /// Each arm is a conditional update; zero rows changed means a
    /// concurrent request consumed the remaining headroom between
    /// admission and now. That is surfaced as a race, never retried.
    pub fn apply_charge(&self, principal_id: &str, charge: Charge) -> Result<(), CoreError> {
        let applied = match charge {
            Charge::None => return Ok(()),
            Charge::FreeUse => self.ledger.increment_free_use(principal_id)?,
            Charge::Credit => self.ledger.debit_credit(principal_id)?,
        };
        if applied {
            Ok(())
        } else {
            Err(CoreError::ConcurrentQuotaRace)
        }
    }
}

/// Pure admission rule over a profile snapshot.
pub fn decide(profile: &Profile) -> Decision {
    match profile.tier {
        Tier::Premium => Decision::Admitted(Charge::None),
        Tier::Free => {
            if profile.monthly_uses < FREE_LIMIT {
                Decision::Admitted(Charge::FreeUse)
            } else if profile.credits > 0 {
                Decision::Admitted(Charge::Credit)
            } else {
                Decision::Denied(DenyReason::QuotaExhausted)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gate_with_profile(monthly_uses: u32, credits: u32) -> (TempDir, QuotaGate) {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(LedgerStore::open(&tmp.path().join("ledger.db")).unwrap());
        ledger.create_profile_if_missing("principal-p").unwrap();
        ledger.force_counters("principal-p", monthly_uses, credits);
        (tmp, QuotaGate::new(ledger))
    }

    #[test]
    fn free_tier_under_limit_charges_counter() {
        let (_tmp, gate) = gate_with_profile(0, 0);
        assert_eq!(
            gate.admit("principal-p").unwrap(),
            Decision::Admitted(Charge::FreeUse)
        );
    }

    #[test]
    fn free_tier_at_limit_falls_back_to_credits() {
        let (_tmp, gate) = gate_with_profile(FREE_LIMIT, 3);
        assert_eq!(
            gate.admit("principal-p").unwrap(),
            Decision::Admitted(Charge::Credit)
        );
    }

    #[test]
    fn exhausted_free_tier_without_credits_is_denied() {
        let (_tmp, gate) = gate_with_profile(FREE_LIMIT, 0);
        assert_eq!(
            gate.admit("principal-p").unwrap(),
            Decision::Denied(DenyReason::QuotaExhausted)
        );
    }

    #[test]
    fn premium_bypasses_both_counters() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(LedgerStore::open(&tmp.path().join("ledger.db")).unwrap());
        ledger.create_profile_if_missing("principal-p").unwrap();
        ledger.force_counters("principal-p", FREE_LIMIT, 0);
        ledger
            .set_tier("principal-p", crate::ledger::Tier::Premium)
            .unwrap();
        let gate = QuotaGate::new(ledger);
        assert_eq!(
            gate.admit("principal-p").unwrap(),
            Decision::Admitted(Charge::None)
        );
    }

    #[test]
    fn missing_profile_is_denied_not_created() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(LedgerStore::open(&tmp.path().join("ledger.db")).unwrap());
        let gate = QuotaGate::new(ledger.clone());
        assert_eq!(
            gate.admit("ghost").unwrap(),
            Decision::Denied(DenyReason::ProfileNotFound)
        );
        assert!(ledger.get_profile("ghost").unwrap().is_none());
    }

    #[test]
    fn applying_free_charge_moves_only_the_counter() {
        let (_tmp, gate) = gate_with_profile(4, 7);
        gate.apply_charge("principal-p", Charge::FreeUse).unwrap();
        let profile = gate.ledger.get_profile("principal-p").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, 5);
        assert_eq!(profile.credits, 7);
    }

    #[test]
    fn applying_credit_charge_moves_only_the_balance() {
        let (_tmp, gate) = gate_with_profile(FREE_LIMIT, 7);
        gate.apply_charge("principal-p", Charge::Credit).unwrap();
        let profile = gate.ledger.get_profile("principal-p").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, FREE_LIMIT);
        assert_eq!(profile.credits, 6);
    }

    #[test]
    fn stale_charge_surfaces_as_race() {
        let (_tmp, gate) = gate_with_profile(FREE_LIMIT, 1);
        // Admission saw one credit; a concurrent request drains it.
        gate.ledger.force_counters("principal-p", FREE_LIMIT, 0);
        let err = gate.apply_charge("principal-p", Charge::Credit).unwrap_err();
        assert!(matches!(err, CoreError::ConcurrentQuotaRace));
    }

    #[test]
    fn premium_charge_is_a_no_op() {
        let (_tmp, gate) = gate_with_profile(2, 2);
        gate.apply_charge("principal-p", Charge::None).unwrap();
        let profile = gate.ledger.get_profile("principal-p").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, 2);
        assert_eq!(profile.credits, 2);
    }
}
