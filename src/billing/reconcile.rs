//! Reconciliation of verified payment-provider events into the ledger.
//!
//! The provider delivers events at-least-once; the idempotency journal
//! inside [`LedgerStore`] makes redelivery safe. Every outcome here is
//! acknowledged to the provider — only signature failures (handled
//! before this layer) are rejected.

use crate::billing::packages::credits_for_package;
use crate::ledger::{GrantOutcome, LedgerStore};
use crate::payments::VerifiedEvent;
use std::sync::Arc;

/// Event kind for a completed hosted-checkout session.
const KIND_CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Event kind for a refunded charge.
const KIND_CHARGE_REFUNDED: &str = "charge.refunded";

/// Result of reconciling one verified event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Credits granted and journaled.
    Credited {
        principal_id: String,
        credits: u32,
        new_balance: u32,
    },
    /// The event id was already journaled; no mutation. This is the
    /// mechanism that makes at-least-once delivery safe.
    AlreadyProcessed,
    /// The event named no principal we can credit; no mutation.
    MissingPrincipal,
    /// Acknowledged without any ledger effect: refunds, unknown event
    /// kinds, unpaid sessions, unrecognized packages.
    Ignored,
}

/// Maps verified payment events to ledger mutations.
pub struct ReconcileProcessor {
    ledger: Arc<LedgerStore>,
}

impl ReconcileProcessor {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Reconcile one verified event. Invoked once per inbound delivery,
    /// after signature verification.
    pub fn reconcile(&self, event: &VerifiedEvent) -> anyhow::Result<ReconcileOutcome> {
        match event.kind.as_str() {
            KIND_CHECKOUT_COMPLETED => self.handle_checkout_completed(event),
            KIND_CHARGE_REFUNDED => {
                // Acknowledged but deliberately unhandled: the clawback
                // policy for already-spent credits is undecided.
                tracing::info!(event_id = %event.id, "refund event acknowledged, no ledger effect");
                Ok(ReconcileOutcome::Ignored)
            }
            other => {
                tracing::debug!(event_id = %event.id, kind = other, "unhandled event kind acknowledged");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    fn handle_checkout_completed(&self, event: &VerifiedEvent) -> anyhow::Result<ReconcileOutcome> {
        if event.payment_status.as_deref() != Some("paid")
            || event.mode.as_deref() != Some("payment")
        {
            tracing::debug!(event_id = %event.id, "checkout session not a paid one-time purchase, ignoring");
            return Ok(ReconcileOutcome::Ignored);
        }

        let Some(principal_id) = event.principal_id.as_deref() else {
            tracing::error!(event_id = %event.id, "completed checkout carries no principal id");
            return Ok(ReconcileOutcome::MissingPrincipal);
        };

        let package_key = event.package_key.as_deref().unwrap_or("");
        let credits = credits_for_package(package_key);
        if credits == 0 {
            // Unrecognized packages are journaled and ignored rather
            // than crashing the handler; the provider catalog can drift
            // ahead of this binary.
            tracing::warn!(
                event_id = %event.id,
                package_key,
                "unrecognized credit package, granting nothing"
            );
            self.ledger.journal_event_if_new(
                &event.id,
                &format!("ignored unrecognized package {package_key:?}"),
            )?;
            return Ok(ReconcileOutcome::Ignored);
        }

        let reason = format!("Purchased {credits} credits");
        match self
            .ledger
            .apply_credit_grant(&event.id, principal_id, credits, &reason)?
        {
            GrantOutcome::Applied { new_balance } => {
                tracing::info!(
                    event_id = %event.id,
                    principal_id,
                    credits,
                    new_balance,
                    "credit grant applied"
                );
                Ok(ReconcileOutcome::Credited {
                    principal_id: principal_id.to_string(),
                    credits,
                    new_balance,
                })
            }
            GrantOutcome::AlreadyProcessed => {
                tracing::info!(event_id = %event.id, "event already journaled, skipping");
                Ok(ReconcileOutcome::AlreadyProcessed)
            }
            GrantOutcome::ProfileMissing => {
                tracing::error!(
                    event_id = %event.id,
                    principal_id,
                    "no ledger profile for credited principal"
                );
                Ok(ReconcileOutcome::MissingPrincipal)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
