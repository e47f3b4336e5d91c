//! Generation request lifecycle.
//!
//! One request walks Received -> Gated -> Inferring -> Validating ->
//! Charging -> Completed. Gate denial exits at Gated as `Rejected`;
//! inference and validation failures exit as `Failed`. The charge
//! decided at admission is applied only at the Charging step, after the
//! output is known-good, and it is the request's only ledger mutation.
//! A request abandoned before Charging leaves the ledger untouched;
//! abandonment after Charging is impossible since Charging is the
//! terminal mutating step.

use crate::error::CoreError;
use crate::inference::InferenceProvider;
use crate::quota::{Decision, DenyReason, QuotaGate};
use crate::validator::{self, PolicyMemo};
use std::sync::Arc;
use std::time::Duration;

/// Input length bounds, in characters.
pub const MIN_INPUT_CHARS: usize = 100;
pub const MAX_INPUT_CHARS: usize = 10_000;

/// Orchestrates the summarize request path.
pub struct Orchestrator {
    gate: QuotaGate,
    provider: Arc<dyn InferenceProvider>,
    inference_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        gate: QuotaGate,
        provider: Arc<dyn InferenceProvider>,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            provider,
            inference_timeout,
        }
    }

    /// Run one generation request to completion.
    pub async fn summarize(
        &self,
        principal_id: &str,
        input_text: &str,
    ) -> Result<PolicyMemo, CoreError> {
        let request_id = uuid::Uuid::new_v4();

        // Cheap rejects first: input shape before any ledger read.
        check_input_shape(input_text)?;

        // Gated
        let charge = match self.gate.admit(principal_id)? {
            Decision::Admitted(charge) => charge,
            Decision::Denied(DenyReason::QuotaExhausted) => {
                tracing::info!(%request_id, principal_id, "request rejected: quota exhausted");
                return Err(CoreError::QuotaExhausted);
            }
            Decision::Denied(DenyReason::ProfileNotFound) => {
                // An authenticated principal without a ledger row is a
                // configuration fault; never auto-created mid-request.
                tracing::error!(%request_id, principal_id, "request rejected: ledger profile missing");
                return Err(CoreError::ProfileNotFound);
            }
        };

        // Inferring. No retry on failure or expiry — a resubmit is the
        // caller's call, and an automatic retry could double-charge.
        let raw = match tokio::time::timeout(
            self.inference_timeout,
            self.provider.generate(input_text),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(%request_id, principal_id, error = %e, "inference call failed");
                return Err(CoreError::InferenceUnavailable(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    %request_id,
                    principal_id,
                    timeout_secs = self.inference_timeout.as_secs(),
                    "inference call timed out"
                );
                return Err(CoreError::InferenceUnavailable("timed out".to_string()));
            }
        };

        // Validating. On failure the pending charge is discarded: the
        // principal is not billed for output we could not interpret.
        let memo = validator::validate(&raw).map_err(|e| {
            tracing::warn!(%request_id, principal_id, error = %e, "model output failed validation, not billed");
            CoreError::from(e)
        })?;

        // Charging — the only ledger mutation on this path.
        self.gate.apply_charge(principal_id, charge)?;
        tracing::info!(%request_id, principal_id, charge = ?charge, "request completed");

        Ok(memo)
    }
}

/// Validate the input length bounds.
fn check_input_shape(input_text: &str) -> Result<(), CoreError> {
    let chars = input_text.chars().count();
    if chars < MIN_INPUT_CHARS {
        return Err(CoreError::InputInvalid(format!(
            "Policy text must be at least {MIN_INPUT_CHARS} characters long to provide meaningful analysis."
        )));
    }
    if chars > MAX_INPUT_CHARS {
        return Err(CoreError::InputInvalid(format!(
            "Policy text cannot exceed {MAX_INPUT_CHARS} characters."
        )));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
