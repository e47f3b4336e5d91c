//! Credit package catalog.
//!
//! Purchases are one-time credit packs; there are no subscriptions.
//! Pricing keeps a low entry point with a natural tier progression.

use serde::{Deserialize, Serialize};

/// A purchasable credit package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPackage {
    /// Stable package key carried in checkout metadata.
    pub key: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Credits granted upon purchase.
    pub credits: u32,
    /// Price in USD cents.
    pub amount_cents: u32,
}

/// Available credit packages.
pub const CREDIT_PACKAGES: &[CreditPackage] = &[
    CreditPackage {
        key: "CREDITS_20",
        name: "20 Credits",
        credits: 20,
        amount_cents: 299,
    },
    CreditPackage {
        key: "CREDITS_75",
        name: "75 Credits",
        credits: 75,
        amount_cents: 999,
    },
    CreditPackage {
        key: "CREDITS_200",
        name: "200 Credits",
        credits: 200,
        amount_cents: 2499,
    },
];

/// Look up a credit package by key.
pub fn find_package(key: &str) -> Option<&'static CreditPackage> {
    CREDIT_PACKAGES.iter().find(|p| p.key == key)
}

/// Credits granted for a package key; any unknown key maps to zero.
/// Unknown keys are handled as deliberate no-ops upstream, never as
/// errors, so a provider-side catalog change cannot crash the webhook.
pub fn credits_for_package(key: &str) -> u32 {
    find_package(key).map_or(0, |p| p.credits)
}

// ── Tests ────────────────────────────────────────────────────────
