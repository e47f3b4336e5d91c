//! Billing: credit packages and payment-event reconciliation.
//!
//! Purchases happen on the provider's hosted checkout; this module only
//! defines what a package is worth and how a verified provider event
//! becomes a ledger mutation.

pub mod packages;
pub mod reconcile;

pub use packages::{credits_for_package, find_package, CreditPackage, CREDIT_PACKAGES};
pub use reconcile::{ReconcileOutcome, ReconcileProcessor};
