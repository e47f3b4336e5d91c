//! Axum-based HTTP gateway.
//!
//! Thin surface over the core: every route resolves the principal,
//! delegates to the orchestrator / checkout flow / reconciler, and maps
//! typed errors to status codes. Body-size limits, request timeouts,
//! and per-key sliding-window rate limits guard the edge; the business
//! rules all live below this module.

use crate::auth::{AuthFlow, OidcClient, SessionStore};
use crate::billing::{ReconcileOutcome, ReconcileProcessor};
use crate::config::Config;
use crate::error::CoreError;
use crate::inference::GeminiClient;
use crate::ledger::{LedgerStore, FREE_LIMIT};
use crate::orchestrator::Orchestrator;
use crate::payments::{self, CheckoutError, StripeClient};
use crate::quota::QuotaGate;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout; inference-bound requests need headroom.
pub const REQUEST_TIMEOUT_SECS: u64 = 120;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Concrete return type for handlers (avoids `impl IntoResponse`
/// inference issues).
type ApiResponse = (StatusCode, Json<serde_json::Value>);

// ── Rate limiting ────────────────────────────────────────────────

/// Sliding-window limiter keyed by principal or client address.
#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut requests = self.requests.lock();
        // Drop keys whose whole window has drained, so the map cannot
        // grow without bound across many one-off callers.
        requests.retain(|_, stamps| {
            stamps.retain(|t| *t > cutoff);
            !stamps.is_empty()
        });

        let entry = requests.entry(key.to_owned()).or_default();
        if entry.len() >= self.limit_per_window as usize {
            return false;
        }
        entry.push(now);
        true
    }
}

/// Per-route limiters for the gateway.
#[derive(Debug)]
pub struct GatewayRateLimiter {
    summarize: SlidingWindowRateLimiter,
    webhook: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new(summarize_per_minute: u32, webhook_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            summarize: SlidingWindowRateLimiter::new(summarize_per_minute, window),
            webhook: SlidingWindowRateLimiter::new(webhook_per_minute, window),
        }
    }

    fn allow_summarize(&self, key: &str) -> bool {
        self.summarize.allow(key)
    }

    fn allow_webhook(&self, key: &str) -> bool {
        self.webhook.allow(key)
    }
}

/// Best-effort client key from proxy headers, for webhook limiting.
fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

// ── Shared state ─────────────────────────────────────────────────

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ledger: Arc<LedgerStore>,
    pub auth: Arc<AuthFlow>,
    /// Checkout client; `None` when no payment secret is configured.
    pub stripe: Option<Arc<StripeClient>>,
    pub reconciler: Arc<ReconcileProcessor>,
    /// Webhook signing secret; `None` disables the webhook route.
    pub webhook_secret: Option<Arc<str>>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// Public base URL for checkout redirects.
    pub app_base_url: String,
}

/// Build the gateway router over the given state.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("stripe-signature"),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/callback", get(handle_auth_callback))
        .route("/auth/logout", post(handle_auth_logout))
        .route("/api/summarize", post(handle_summarize))
        .route("/api/profile", get(handle_profile))
        .route("/api/checkout", post(handle_checkout))
        .route("/webhooks/stripe", post(handle_stripe_webhook))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Run the HTTP gateway from configuration: open the durable stores,
/// wire the collaborators, bind, and serve.
pub async fn run_gateway(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.workspace_dir)?;

    let ledger = Arc::new(LedgerStore::open(&config.workspace_dir.join("ledger.db"))?);
    let sessions = Arc::new(SessionStore::open(
        &config.workspace_dir.join("sessions.db"),
        config.auth.session_ttl_secs,
    )?);

    let Some(ref api_key) = config.inference.api_key else {
        anyhow::bail!(
            "no inference API key configured — set GEMINI_API_KEY or [inference] api_key"
        );
    };
    let provider = Arc::new(GeminiClient::new(
        &config.inference.api_url,
        api_key,
        &config.inference.model,
        config.inference.timeout_secs,
    )?);

    let identity = Arc::new(OidcClient::new(
        &config.identity.token_url,
        &config.identity.client_id,
        config.identity.client_secret.as_deref().unwrap_or_default(),
    )?);
    let auth = Arc::new(AuthFlow::new(identity, sessions, ledger.clone()));

    let stripe = match config.stripe.secret_key {
        Some(ref key) => Some(Arc::new(StripeClient::with_base(key, &config.stripe.api_url)?)),
        None => {
            tracing::warn!("no STRIPE_SECRET_KEY configured — checkout disabled");
            None
        }
    };
    let webhook_secret: Option<Arc<str>> = config
        .stripe
        .webhook_secret
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Arc::from);
    if webhook_secret.is_none() {
        tracing::warn!("no STRIPE_WEBHOOK_SECRET configured — webhook verification disabled");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        QuotaGate::new(ledger.clone()),
        provider,
        Duration::from_secs(config.inference.timeout_secs),
    ));
    let reconciler = Arc::new(ReconcileProcessor::new(ledger.clone()));
    let rate_limiter = Arc::new(GatewayRateLimiter::new(
        config.gateway.summarize_per_minute,
        config.gateway.webhook_per_minute,
    ));

    let state = AppState {
        orchestrator,
        ledger,
        auth,
        stripe,
        reconciler,
        webhook_secret,
        rate_limiter,
        app_base_url: config.gateway.app_base_url.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

// ── Principal resolution ─────────────────────────────────────────

/// Pull the raw token out of `Authorization: Bearer`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Resolve the authenticated principal from `Authorization: Bearer`.
fn bearer_principal(state: &AppState, headers: &HeaderMap) -> Option<String> {
    state.auth.current_principal(bearer_token(headers)?)
}

// ── Error mapping ────────────────────────────────────────────────

/// Map a core error to its HTTP surface.
fn core_error_response(err: &CoreError) -> ApiResponse {
    let (status, message) = match err {
        CoreError::InputInvalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        CoreError::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            "Authentication required. Please log in to continue.".to_string(),
        ),
        // A lost quota race is indistinguishable from exhaustion as far
        // as the user is concerned, and retrying would livelock.
        CoreError::QuotaExhausted | CoreError::ConcurrentQuotaRace => (
            StatusCode::PAYMENT_REQUIRED,
            format!("Free tier limit of {FREE_LIMIT} uses reached. Purchase credits to continue."),
        ),
        CoreError::ProfileNotFound => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not retrieve user profile for usage check.".to_string(),
        ),
        CoreError::InferenceUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "AI processing is temporarily unavailable. Please try again.".to_string(),
        ),
        CoreError::Validation(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "AI processing failed to return a valid policy summary. Please try again with different text."
                .to_string(),
        ),
        CoreError::Storage(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An unexpected error occurred.".to_string(),
        ),
    };
    (status, Json(serde_json::json!({"error": message})))
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health() -> ApiResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
}

/// GET /auth/callback — exchange an authorization code for a session.
async fn handle_auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> ApiResponse {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Missing authorization code"})),
        );
    };

    match state.auth.login_with_code(&code).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "token": outcome.token,
                "principal_id": outcome.principal_id,
                "new_profile": outcome.new_profile,
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "auth code exchange failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Authentication failed"})),
            )
        }
    }
}

/// POST /auth/logout — revoke the current session.
async fn handle_auth_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(token) = bearer_token(&headers) else {
        return core_error_response(&CoreError::Unauthenticated);
    };

    match state.auth.logout(token) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "logged_out"})),
        ),
        Ok(false) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid session"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "logout failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Logout failed"})),
            )
        }
    }
}

#[derive(Deserialize)]
struct SummarizeBody {
    #[serde(alias = "policyText")]
    policy_text: String,
}

/// POST /api/summarize — run one generation request.
async fn handle_summarize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SummarizeBody>,
) -> ApiResponse {
    let Some(principal_id) = bearer_principal(&state, &headers) else {
        return core_error_response(&CoreError::Unauthenticated);
    };

    if !state.rate_limiter.allow_summarize(&principal_id) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "Too many requests. Slow down."})),
        );
    }

    match state
        .orchestrator
        .summarize(&principal_id, &body.policy_text)
        .await
    {
        Ok(memo) => (StatusCode::OK, Json(serde_json::json!({"result": memo}))),
        Err(e) => core_error_response(&e),
    }
}

/// GET /api/profile — tier/usage/credits snapshot for the billing page.
async fn handle_profile(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(principal_id) = bearer_principal(&state, &headers) else {
        return core_error_response(&CoreError::Unauthenticated);
    };

    match state.ledger.get_profile(&principal_id) {
        Ok(Some(profile)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "tier": profile.tier,
                "monthly_uses": profile.monthly_uses,
                "free_limit": FREE_LIMIT,
                "credits": profile.credits,
            })),
        ),
        Ok(None) => core_error_response(&CoreError::ProfileNotFound),
        Err(e) => {
            tracing::error!(error = %e, "profile lookup failed");
            core_error_response(&CoreError::Storage(e))
        }
    }
}

#[derive(Deserialize)]
struct CheckoutBody {
    #[serde(alias = "packageKey")]
    package_key: String,
}

/// POST /api/checkout — start a credit purchase, returns the hosted
/// checkout redirect URL.
async fn handle_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> ApiResponse {
    let Some(principal_id) = bearer_principal(&state, &headers) else {
        return core_error_response(&CoreError::Unauthenticated);
    };

    let Some(ref stripe) = state.stripe else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Payments are not configured"})),
        );
    };

    let success_url = format!("{}/billing?success=true", state.app_base_url);
    let cancel_url = format!("{}/billing?canceled=true", state.app_base_url);

    match payments::start_checkout(
        &state.ledger,
        stripe,
        &principal_id,
        &body.package_key,
        &success_url,
        &cancel_url,
    )
    .await
    {
        Ok(url) => (StatusCode::OK, Json(serde_json::json!({"url": url}))),
        Err(CheckoutError::UnknownPackage(key)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("Unknown credit package: {key}")})),
        ),
        Err(CheckoutError::ProfileNotFound) => core_error_response(&CoreError::ProfileNotFound),
        Err(CheckoutError::Provider(e)) => {
            tracing::error!(error = %e, "checkout session creation failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "Failed to create checkout session"})),
            )
        }
    }
}

/// POST /webhooks/stripe — verified payment events.
///
/// 2xx on every reconcile outcome so the provider stops redelivering a
/// logically-handled event; 4xx only on signature/verification failure;
/// 5xx when our own storage failed and a redelivery should retry.
async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    if !state
        .rate_limiter
        .allow_webhook(&client_key_from_headers(&headers))
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "Too many requests"})),
        );
    }

    let Some(ref secret) = state.webhook_secret else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Webhook secret not configured"})),
        );
    };

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let event = match payments::verify_and_parse_event(&body, signature, secret) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "webhook rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };

    match state.reconciler.reconcile(&event) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "received": true,
                "outcome": outcome_label(&outcome),
            })),
        ),
        Err(e) => {
            tracing::error!(event_id = %event.id, error = %e, "webhook reconciliation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Webhook processing failed"})),
            )
        }
    }
}

fn outcome_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Credited { .. } => "credited",
        ReconcileOutcome::AlreadyProcessed => "already_processed",
        ReconcileOutcome::MissingPrincipal => "missing_principal",
        ReconcileOutcome::Ignored => "ignored",
    }
}

// ── Tests ────────────────────────────────────────────────────────
