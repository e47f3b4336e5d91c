//! Durable per-principal ledger: tier, free-tier usage, credit balance.
//!
//! Backing store is a single SQLite database with three tables:
//! - `profiles`: one row per principal (tier, monthly usage counter,
//!   purchased-credit balance, lazily-created payment customer ref)
//! - `processed_events`: idempotency journal of already-applied external
//!   event ids — the single source of truth for "already applied"
//! - `credit_grants`: append-only audit trail, one row per applied grant
//!
//! ## Design
//! - Every counter mutation is a single conditional `UPDATE ... WHERE`,
//!   atomic under SQLite's write lock. A decrement that would underflow
//!   changes zero rows and is reported to the caller, never clamped.
//! - Credit grants run in one transaction with the journal insert, so a
//!   duplicate delivery can never double-credit and a failed grant never
//!   leaves a stale journal entry behind.
//! - Contention is per-principal; unrelated principals never block on
//!   each other beyond the store's write lock.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Free-tier generations per billing period.
pub const FREE_LIMIT: u32 = 5;

/// Credits granted to a fresh profile at first login.
pub const SIGNUP_BONUS_CREDITS: u32 = 5;

// ── Profile ──────────────────────────────────────────────────────

/// Billing tier of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    /// Metered: free monthly quota, then purchased credits.
    Free,
    /// Unmetered: bypasses both counters.
    Premium,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Premium => "PREMIUM",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "PREMIUM" => Self::Premium,
            _ => Self::Free,
        }
    }
}

/// Snapshot of one principal's ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    /// Opaque principal identity, stable for the principal's lifetime.
    pub principal_id: String,
    /// Billing tier.
    pub tier: Tier,
    /// Free-tier uses consumed in the current period. Only meaningful
    /// while `tier == Free`.
    pub monthly_uses: u32,
    /// Purchased-credit balance; one credit buys one generation.
    pub credits: u32,
    /// Payment-provider customer ref, created lazily at most once.
    pub stripe_customer_id: Option<String>,
    /// Usage period key (`YYYY-MM`) the counter belongs to.
    pub period: String,
    /// Unix timestamp of profile creation.
    pub created_at: i64,
}

/// One row of the credit-grant audit trail. Never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct CreditGrant {
    pub principal_id: String,
    pub credits_granted: u32,
    pub source_event_id: String,
    pub reason: String,
    pub granted_at: i64,
}

/// Result of applying a credit grant for an external event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Grant applied; the journal now holds the event id.
    Applied { new_balance: u32 },
    /// The event id was already journaled; nothing changed.
    AlreadyProcessed,
    /// No ledger row for the named principal; nothing changed and the
    /// event was not journaled, so a later redelivery can still apply.
    ProfileMissing,
}

// ── Store ────────────────────────────────────────────────────────

/// SQLite-backed ledger store.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profiles (
                principal_id TEXT PRIMARY KEY,
                tier TEXT NOT NULL DEFAULT 'FREE',
                monthly_uses INTEGER NOT NULL DEFAULT 0,
                credits INTEGER NOT NULL DEFAULT 0,
                stripe_customer_id TEXT,
                period TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL,
                effect TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credit_grants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_id TEXT NOT NULL,
                credits_granted INTEGER NOT NULL,
                source_event_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                granted_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_grants_principal
                ON credit_grants(principal_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Profile lifecycle ───────────────────────────────────────

    /// Create the ledger row for a principal if none exists yet.
    ///
    /// New rows get the signup defaults: FREE tier, zero usage, the
    /// signup bonus credit balance. Returns true if a row was created.
    /// Safe to call on every login.
    pub fn create_profile_if_missing(&self, principal_id: &str) -> Result<bool> {
        let now = now_epoch();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO profiles
                (principal_id, tier, monthly_uses, credits, period, created_at, updated_at)
             VALUES (?1, 'FREE', 0, ?2, ?3, ?4, ?4)",
            params![principal_id, SIGNUP_BONUS_CREDITS, current_period(), now],
        )?;
        Ok(inserted > 0)
    }

    /// Fetch a principal's ledger snapshot.
    ///
    /// Applies the lazy period reset first: if the stored period key is
    /// stale, the usage counter is zeroed before the caller sees it.
    /// The reset is itself a conditional update, so concurrent readers
    /// in a new period reset at most once.
    pub fn get_profile(&self, principal_id: &str) -> Result<Option<Profile>> {
        let period = current_period();
        let conn = self.conn.lock();

        conn.execute(
            "UPDATE profiles SET monthly_uses = 0, period = ?1, updated_at = ?2
             WHERE principal_id = ?3 AND period <> ?1",
            params![period, now_epoch(), principal_id],
        )?;

        let row = conn.query_row(
            "SELECT principal_id, tier, monthly_uses, credits, stripe_customer_id,
                    period, created_at
             FROM profiles WHERE principal_id = ?1",
            params![principal_id],
            |row| {
                let tier: String = row.get(1)?;
                Ok(Profile {
                    principal_id: row.get(0)?,
                    tier: Tier::from_str(&tier),
                    monthly_uses: row.get(2)?,
                    credits: row.get(3)?,
                    stripe_customer_id: row.get(4)?,
                    period: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        );

        match row {
            Ok(profile) => Ok(Some(profile)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Change a principal's tier.
    pub fn set_tier(&self, principal_id: &str, tier: Tier) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE profiles SET tier = ?1, updated_at = ?2 WHERE principal_id = ?3",
            params![tier.as_str(), now_epoch(), principal_id],
        )?;
        Ok(updated > 0)
    }

    // ── Charge application (conditional, atomic) ────────────────

    /// Consume one free-tier use, guarded by the limit.
    ///
    /// Returns false when the counter has no headroom left — either the
    /// limit was reached by a concurrent request since admission, or the
    /// row is gone. The caller decides; nothing is clamped here.
    pub fn increment_free_use(&self, principal_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE profiles SET monthly_uses = monthly_uses + 1, updated_at = ?1
             WHERE principal_id = ?2 AND monthly_uses < ?3",
            params![now_epoch(), principal_id, FREE_LIMIT],
        )?;
        Ok(updated > 0)
    }

    /// Consume one purchased credit, floored at zero.
    ///
    /// Returns false when the balance cannot cover the debit. The
    /// balance never goes negative; the conditional update rejects
    /// rather than clamps.
    pub fn debit_credit(&self, principal_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE profiles SET credits = credits - 1, updated_at = ?1
             WHERE principal_id = ?2 AND credits >= 1",
            params![now_epoch(), principal_id],
        )?;
        Ok(updated > 0)
    }

    // ── Credit grants + idempotency journal ─────────────────────

    /// Apply a credit grant for an external payment event, exactly once.
    ///
    /// The journal claim, balance increment, and audit insert share one
    /// transaction. A duplicate event id loses the journal claim and
    /// reports [`GrantOutcome::AlreadyProcessed`] without touching the
    /// balance. A missing profile rolls the whole transaction back.
    pub fn apply_credit_grant(
        &self,
        event_id: &str,
        principal_id: &str,
        credits: u32,
        reason: &str,
    ) -> Result<GrantOutcome> {
        let now = now_epoch();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let claimed = tx.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, processed_at, effect)
             VALUES (?1, ?2, ?3)",
            params![
                event_id,
                now,
                format!("granted {credits} credits to {principal_id}"),
            ],
        )?;
        if claimed == 0 {
            return Ok(GrantOutcome::AlreadyProcessed);
        }

        let updated = tx.execute(
            "UPDATE profiles SET credits = credits + ?1, updated_at = ?2
             WHERE principal_id = ?3",
            params![credits, now, principal_id],
        )?;
        if updated == 0 {
            // Dropping the transaction rolls back the journal claim, so
            // a redelivery after the profile exists can still apply.
            return Ok(GrantOutcome::ProfileMissing);
        }

        tx.execute(
            "INSERT INTO credit_grants
                (principal_id, credits_granted, source_event_id, reason, granted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![principal_id, credits, event_id, reason, now],
        )?;

        let new_balance: u32 = tx.query_row(
            "SELECT credits FROM profiles WHERE principal_id = ?1",
            params![principal_id],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(GrantOutcome::Applied { new_balance })
    }

    /// Journal an event id without any ledger effect.
    ///
    /// Used for events that are deliberately acknowledged as no-ops
    /// (unknown package keys). Returns false if already journaled.
    pub fn journal_event_if_new(&self, event_id: &str, effect: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, processed_at, effect)
             VALUES (?1, ?2, ?3)",
            params![event_id, now_epoch(), effect],
        )?;
        Ok(inserted > 0)
    }

    /// Whether an external event id has already been applied.
    pub fn was_processed(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List the grant audit trail for a principal, most recent first.
    pub fn list_credit_grants(&self, principal_id: &str, limit: usize) -> Result<Vec<CreditGrant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT principal_id, credits_granted, source_event_id, reason, granted_at
             FROM credit_grants WHERE principal_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let grants = stmt
            .query_map(params![principal_id, limit as i64], |row| {
                Ok(CreditGrant {
                    principal_id: row.get(0)?,
                    credits_granted: row.get(1)?,
                    source_event_id: row.get(2)?,
                    reason: row.get(3)?,
                    granted_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(grants)
    }

    // ── Payment customer ref (lazy, at-most-once) ───────────────

    /// Store a payment-provider customer ref if none is set yet, and
    /// return whichever ref ended up persisted.
    ///
    /// Two concurrent purchase attempts may both create a provider-side
    /// customer, but only the first claim lands; the loser must use the
    /// returned (winning) ref so ledger and provider never diverge.
    pub fn claim_customer_ref(&self, principal_id: &str, candidate: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE profiles SET stripe_customer_id = ?1, updated_at = ?2
             WHERE principal_id = ?3 AND stripe_customer_id IS NULL",
            params![candidate, now_epoch(), principal_id],
        )?;

        let row = conn.query_row(
            "SELECT stripe_customer_id FROM profiles WHERE principal_id = ?1",
            params![principal_id],
            |row| row.get::<_, Option<String>>(0),
        );

        match row {
            Ok(stored) => Ok(stored),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Time helpers ─────────────────────────────────────────────────

/// Current Unix epoch in seconds.
fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current usage-period key, e.g. "2026-08".
fn current_period() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

// ── Test support ─────────────────────────────────────────────────

#[cfg(test)]
impl LedgerStore {
    /// Force a profile into an arbitrary counter state.
    pub fn force_counters(&self, principal_id: &str, monthly_uses: u32, credits: u32) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE profiles SET monthly_uses = ?1, credits = ?2 WHERE principal_id = ?3",
            params![monthly_uses, credits, principal_id],
        )
        .unwrap();
    }

    /// Backdate a profile's period key to simulate a month rollover.
    pub fn force_period(&self, principal_id: &str, period: &str) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE profiles SET period = ?1 WHERE principal_id = ?2",
            params![period, principal_id],
        )
        .unwrap();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, LedgerStore) {
        let tmp = TempDir::new().unwrap();
        let store = LedgerStore::open(&tmp.path().join("ledger.db")).unwrap();
        (tmp, store)
    }

    #[test]
    fn profile_created_with_signup_defaults() {
        let (_tmp, store) = test_store();

        assert!(store.create_profile_if_missing("principal-a").unwrap());
        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.tier, Tier::Free);
        assert_eq!(profile.monthly_uses, 0);
        assert_eq!(profile.credits, SIGNUP_BONUS_CREDITS);
        assert!(profile.stripe_customer_id.is_none());
    }

    #[test]
    fn profile_creation_is_idempotent() {
        let (_tmp, store) = test_store();

        assert!(store.create_profile_if_missing("principal-a").unwrap());
        store.force_counters("principal-a", 3, 10);
        // Second login must not reset anything.
        assert!(!store.create_profile_if_missing("principal-a").unwrap());
        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, 3);
        assert_eq!(profile.credits, 10);
    }

    #[test]
    fn missing_profile_reads_as_none() {
        let (_tmp, store) = test_store();
        assert!(store.get_profile("ghost").unwrap().is_none());
    }

    #[test]
    fn free_use_increments_until_limit() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-a").unwrap();

        for _ in 0..FREE_LIMIT {
            assert!(store.increment_free_use("principal-a").unwrap());
        }
        // At the limit the conditional update changes zero rows.
        assert!(!store.increment_free_use("principal-a").unwrap());
        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, FREE_LIMIT);
    }

    #[test]
    fn debit_rejects_at_zero_balance() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-a").unwrap();
        store.force_counters("principal-a", 0, 1);

        assert!(store.debit_credit("principal-a").unwrap());
        assert!(!store.debit_credit("principal-a").unwrap());
        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.credits, 0);
    }

    #[test]
    fn grant_applies_once_per_event() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-q").unwrap();
        store.force_counters("principal-q", 0, 10);

        let outcome = store
            .apply_credit_grant("evt_1", "principal-q", 75, "Purchased 75 credits")
            .unwrap();
        assert_eq!(outcome, GrantOutcome::Applied { new_balance: 85 });

        // Redelivery of the same event id is a no-op.
        let outcome = store
            .apply_credit_grant("evt_1", "principal-q", 75, "Purchased 75 credits")
            .unwrap();
        assert_eq!(outcome, GrantOutcome::AlreadyProcessed);

        let profile = store.get_profile("principal-q").unwrap().unwrap();
        assert_eq!(profile.credits, 85);

        let grants = store.list_credit_grants("principal-q", 10).unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].credits_granted, 75);
        assert_eq!(grants[0].source_event_id, "evt_1");
        assert!(store.was_processed("evt_1").unwrap());
    }

    #[test]
    fn grant_for_missing_profile_leaves_no_journal_entry() {
        let (_tmp, store) = test_store();

        let outcome = store
            .apply_credit_grant("evt_2", "ghost", 20, "Purchased 20 credits")
            .unwrap();
        assert_eq!(outcome, GrantOutcome::ProfileMissing);
        // Not journaled — a redelivery after signup can still apply.
        assert!(!store.was_processed("evt_2").unwrap());

        store.create_profile_if_missing("ghost").unwrap();
        let outcome = store
            .apply_credit_grant("evt_2", "ghost", 20, "Purchased 20 credits")
            .unwrap();
        assert!(matches!(outcome, GrantOutcome::Applied { .. }));
    }

    #[test]
    fn journal_without_effect_is_idempotent() {
        let (_tmp, store) = test_store();
        assert!(store.journal_event_if_new("evt_3", "ignored unknown package").unwrap());
        assert!(!store.journal_event_if_new("evt_3", "ignored unknown package").unwrap());
        assert!(store.was_processed("evt_3").unwrap());
    }

    #[test]
    fn customer_ref_first_claim_wins() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-a").unwrap();

        let first = store.claim_customer_ref("principal-a", "cus_111").unwrap();
        assert_eq!(first.as_deref(), Some("cus_111"));

        // A racing second claim must observe the winner's ref.
        let second = store.claim_customer_ref("principal-a", "cus_222").unwrap();
        assert_eq!(second.as_deref(), Some("cus_111"));
    }

    #[test]
    fn customer_ref_claim_for_missing_profile() {
        let (_tmp, store) = test_store();
        assert!(store.claim_customer_ref("ghost", "cus_111").unwrap().is_none());
    }

    #[test]
    fn stale_period_resets_usage_on_read() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-a").unwrap();
        store.force_counters("principal-a", 5, 2);
        store.force_period("principal-a", "2020-01");

        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.monthly_uses, 0);
        assert_eq!(profile.period, current_period());
        // Credits are purchased entitlements; a period rollover never
        // touches them.
        assert_eq!(profile.credits, 2);
    }

    #[test]
    fn tier_change_persists() {
        let (_tmp, store) = test_store();
        store.create_profile_if_missing("principal-a").unwrap();
        assert!(store.set_tier("principal-a", Tier::Premium).unwrap());
        let profile = store.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.tier, Tier::Premium);
    }
}
