//! SQLite-backed session store.
//!
//! One table, `sessions`: token_hash, principal_id, created_at,
//! expires_at. Tokens are high-entropy random values revealed to the
//! client once and stored only as a single-pass SHA-256 hash.

use anyhow::Result;
use parking_lot::Mutex;
use rand::TryRng;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// SQLite-backed session store.
pub struct SessionStore {
    conn: Mutex<rusqlite::Connection>,
    session_ttl_secs: u64,
}

impl SessionStore {
    /// Open (or create) the session database at the given path.
    pub fn open(db_path: &Path, session_ttl_secs: u64) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                principal_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_principal ON sessions(principal_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl_secs,
        })
    }

    /// Mint a session token for a principal. The plaintext token is
    /// returned exactly once; only its hash is persisted.
    pub fn create_session(&self, principal_id: &str) -> Result<String> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();
        let expires_at = now + self.session_ttl_secs;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, principal_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token_hash, principal_id, now as i64, expires_at as i64],
        )?;

        Ok(token)
    }

    /// Resolve a token to its principal. `None` for unknown or expired.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let token_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        conn.query_row(
            "SELECT principal_id FROM sessions
             WHERE token_hash = ?1 AND expires_at > ?2",
            rusqlite::params![token_hash, now],
            |row| row.get(0),
        )
        .ok()
    }

    /// Revoke a session by token. Returns whether anything was removed.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            rusqlite::params![token_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Remove expired sessions; returns the number deleted.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }
}

/// Generate a random session token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::SysRng
        .try_fill_bytes(&mut bytes)
        .expect("CSPRNG failure");
    hex::encode(bytes)
}

/// Hash a session token (SHA-256, single pass — tokens are already
/// high-entropy).
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ────────────────────────────────────────────────────────
