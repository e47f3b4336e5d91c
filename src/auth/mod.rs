//! Identity and session handling.
//!
//! The identity provider is a black box reached over HTTP: we hand it
//! an authorization code, it hands back the authenticated principal.
//! Sessions are opaque random tokens, SHA-256 hashed at rest, with a
//! server-side lookup — no JWT dependency.
//!
//! The one ledger side effect lives here: the first successful code
//! exchange for an unknown principal creates its ledger row with the
//! signup defaults. Later requests never auto-create profiles.

pub mod store;

use crate::ledger::LedgerStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub use store::SessionStore;

/// An authenticated end user.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Opaque provider-issued identity, stable for the user's lifetime.
    pub id: String,
    pub email: Option<String>,
}

/// The identity collaborator: exchanges an authorization code for the
/// authenticated principal.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_auth_code(&self, code: &str) -> anyhow::Result<Principal>;
}

// ── OIDC-style HTTP identity client ──────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// HTTP client for an OIDC-style token endpoint.
pub struct OidcClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OidcClient {
    pub fn new(token_url: &str, client_id: &str, client_secret: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcClient {
    async fn exchange_auth_code(&self, code: &str) -> anyhow::Result<Principal> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("auth code exchange rejected ({status})");
        }

        let exchanged: TokenExchangeResponse = resp.json().await?;
        Ok(Principal {
            id: exchanged.sub,
            email: exchanged.email,
        })
    }
}

// ── Login flow ───────────────────────────────────────────────────

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Opaque session token; revealed to the client exactly once.
    pub token: String,
    pub principal_id: String,
    /// Whether this login created the ledger profile.
    pub new_profile: bool,
}

/// Composes the identity collaborator, the session store, and the
/// one-time profile bootstrap.
pub struct AuthFlow {
    identity: Arc<dyn IdentityProvider>,
    sessions: Arc<SessionStore>,
    ledger: Arc<LedgerStore>,
}

impl AuthFlow {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        sessions: Arc<SessionStore>,
        ledger: Arc<LedgerStore>,
    ) -> Self {
        Self {
            identity,
            sessions,
            ledger,
        }
    }

    /// Exchange an authorization code, bootstrap the ledger profile on
    /// first login, and mint a session token.
    pub async fn login_with_code(&self, code: &str) -> anyhow::Result<LoginOutcome> {
        let principal = self.identity.exchange_auth_code(code).await?;

        let new_profile = self.ledger.create_profile_if_missing(&principal.id)?;
        if new_profile {
            tracing::info!(principal_id = %principal.id, "created ledger profile on first login");
        }

        let token = self.sessions.create_session(&principal.id)?;
        Ok(LoginOutcome {
            token,
            principal_id: principal.id,
            new_profile,
        })
    }

    /// Resolve the current principal from a bearer token, if the
    /// session exists and has not expired.
    pub fn current_principal(&self, token: &str) -> Option<String> {
        self.sessions.resolve(token)
    }

    /// Revoke the session behind a bearer token. Returns whether a
    /// live session was actually removed.
    pub fn logout(&self, token: &str) -> anyhow::Result<bool> {
        self.sessions.revoke(token)
    }
}

// ── Tests ────────────────────────────────────────────────────────
