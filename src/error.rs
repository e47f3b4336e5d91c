//! Typed error taxonomy for the request lifecycle.
//!
//! Every ledger-touching path surfaces failures to its caller. The only
//! deliberate silent no-ops in the system are idempotency-journal hits
//! and unrecognized-package grants, both handled (and logged) inside the
//! reconciliation processor.

use crate::validator::ValidationError;

/// Errors surfaced by the summarize request path.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// User-correctable input problem. Shown inline, never retried.
    #[error("{0}")]
    InputInvalid(String),

    /// No authenticated principal on the request.
    #[error("authentication required")]
    Unauthenticated,

    /// Free limit reached and no credits remaining. Correctable via
    /// purchase, not via retry.
    #[error("free tier limit reached and no credits remaining")]
    QuotaExhausted,

    /// Ledger row missing for an authenticated principal. An internal
    /// consistency fault: logged, surfaced as a generic failure, and
    /// never silently auto-created mid-request.
    #[error("no ledger profile for principal")]
    ProfileNotFound,

    /// Inference transport failure or timeout. The caller may resubmit;
    /// the system itself never retries, which could double-charge.
    #[error("inference provider unavailable: {0}")]
    InferenceUnavailable(String),

    /// Model output failed the structural contract. The pending charge
    /// is discarded — nobody pays for output we could not interpret.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The conditional charge found no headroom at apply time because a
    /// concurrent request consumed it first. Surfaced as quota
    /// exhaustion; not retried, to avoid livelock.
    #[error("quota consumed by a concurrent request")]
    ConcurrentQuotaRace,

    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_convert() {
        let err: CoreError = ValidationError::MalformedSyntax("eof".into()).into();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn display_messages_are_user_safe() {
        // No internal identifiers leak through the Display impls.
        let msg = CoreError::QuotaExhausted.to_string();
        assert!(msg.contains("free tier"));
        let msg = CoreError::ConcurrentQuotaRace.to_string();
        assert!(msg.contains("concurrent"));
    }
}
