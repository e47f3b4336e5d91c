//! Payment-provider integration (Stripe-style REST API).
//!
//! Three concerns live here:
//! - webhook verification: HMAC-SHA256 over `"{t}.{body}"` from the
//!   `Stripe-Signature` header, constant-time comparison, timestamp
//!   tolerance. The core never constructs a payment event from
//!   unverified input.
//! - a thin checkout client: customer creation and hosted checkout
//!   sessions, with `principalId` + `packageKey` carried in metadata so
//!   the webhook can map the event back to a ledger row.
//! - the lazy customer-ref flow: the provider-side customer is created
//!   at most once per principal, racing claims resolve through the
//!   ledger's conditional write.

use crate::billing::packages::{find_package, CreditPackage};
use crate::ledger::LedgerStore;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;

/// Default clock skew allowed between the provider's signature
/// timestamp and our clock, in seconds.
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

// ── Webhook errors ───────────────────────────────────────────────

/// Why an inbound webhook delivery was rejected. All of these map to a
/// 4xx at the HTTP surface; the provider will redeliver.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or unparseable Stripe-Signature header")]
    MissingSignature,

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("webhook timestamp outside tolerance")]
    TimestampOutOfTolerance,

    #[error("webhook payload is not a recognizable event object")]
    MalformedPayload,
}

// ── Verified events ──────────────────────────────────────────────

/// A payment-provider event that passed signature verification.
#[derive(Debug, Clone)]
pub struct VerifiedEvent {
    /// Provider-assigned event id — the idempotency key.
    pub id: String,
    /// Event kind, e.g. "checkout.session.completed".
    pub kind: String,
    /// Principal named in the session metadata, if any.
    pub principal_id: Option<String>,
    /// Package key named in the session metadata, if any.
    pub package_key: Option<String>,
    /// Session payment status ("paid", "unpaid", ...).
    pub payment_status: Option<String>,
    /// Session mode ("payment", "subscription", ...).
    pub mode: Option<String>,
}

/// Verify a raw webhook delivery and parse it into a [`VerifiedEvent`].
pub fn verify_and_parse_event(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> Result<VerifiedEvent, WebhookError> {
    verify_signature_at(
        body,
        signature_header,
        secret,
        chrono::Utc::now().timestamp(),
        DEFAULT_SIGNATURE_TOLERANCE_SECS,
    )?;
    parse_event(body)
}

/// Signature check with an injectable clock, so tolerance behavior is
/// testable without waiting.
fn verify_signature_at(
    body: &[u8],
    signature_header: &str,
    secret: &str,
    now_epoch: i64,
    tolerance_secs: i64,
) -> Result<(), WebhookError> {
    // Header format: "t=<epoch>,v1=<hex>[,v1=<hex>...]"
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(decoded) = hex::decode(value) {
                    candidates.push(decoded);
                }
            }
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return Err(WebhookError::MissingSignature);
    };
    if candidates.is_empty() {
        return Err(WebhookError::MissingSignature);
    }
    if (now_epoch - timestamp).abs() > tolerance_secs {
        return Err(WebhookError::TimestampOutOfTolerance);
    }

    // Signed payload is "{t}.{body}".
    let verified = candidates.iter().any(|candidate| {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        // Constant-time comparison
        mac.verify_slice(candidate).is_ok()
    });

    if verified {
        Ok(())
    } else {
        Err(WebhookError::SignatureInvalid)
    }
}

/// Extract the fields the reconciler needs from a verified event body.
fn parse_event(body: &[u8]) -> Result<VerifiedEvent, WebhookError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| WebhookError::MalformedPayload)?;

    let id = value["id"]
        .as_str()
        .ok_or(WebhookError::MalformedPayload)?
        .to_string();
    let kind = value["type"]
        .as_str()
        .ok_or(WebhookError::MalformedPayload)?
        .to_string();

    let object = &value["data"]["object"];
    let text = |v: &serde_json::Value| v.as_str().map(str::to_string);

    Ok(VerifiedEvent {
        id,
        kind,
        principal_id: text(&object["metadata"]["principalId"]),
        package_key: text(&object["metadata"]["packageKey"]),
        payment_status: text(&object["payment_status"]),
        mode: text(&object["mode"]),
    })
}

// ── Checkout client ──────────────────────────────────────────────

/// Errors surfaced by the purchase flow.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("unknown credit package: {0}")]
    UnknownPackage(String),

    #[error("no ledger profile for principal")]
    ProfileNotFound,

    #[error("payment provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionResponse {
    url: String,
}

/// Thin client for the payment provider's REST API.
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    /// Create a client against the production API.
    pub fn new(secret_key: &str) -> anyhow::Result<Self> {
        Self::with_base(secret_key, "https://api.stripe.com")
    }

    /// Create a client against an alternate base URL (tests).
    pub fn with_base(secret_key: &str, api_base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    /// Create a provider-side customer tagged with the principal id.
    pub async fn create_customer(&self, principal_id: &str) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(format!("{}/v1/customers", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&[("metadata[principalId]", principal_id)])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("customer creation failed ({status}): {body}");
        }

        let customer: CustomerResponse = resp.json().await?;
        Ok(customer.id)
    }

    /// Create a hosted checkout session for a one-time credit purchase.
    /// Returns the redirect URL.
    pub async fn create_checkout_session(
        &self,
        customer_ref: &str,
        package: &CreditPackage,
        principal_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> anyhow::Result<String> {
        let amount = package.amount_cents.to_string();
        let form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("customer", customer_ref),
            ("success_url", success_url),
            ("cancel_url", cancel_url),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", "usd"),
            ("line_items[0][price_data][unit_amount]", &amount),
            ("line_items[0][price_data][product_data][name]", package.name),
            ("metadata[principalId]", principal_id),
            ("metadata[packageKey]", package.key),
        ];

        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("checkout session creation failed ({status}): {body}");
        }

        let session: CheckoutSessionResponse = resp.json().await?;
        Ok(session.url)
    }
}

/// Start a credit purchase for a principal: resolve the package, ensure
/// a provider customer exists (lazily, at most once), and return the
/// hosted checkout URL.
pub async fn start_checkout(
    ledger: &Arc<LedgerStore>,
    stripe: &StripeClient,
    principal_id: &str,
    package_key: &str,
    success_url: &str,
    cancel_url: &str,
) -> Result<String, CheckoutError> {
    let package =
        find_package(package_key).ok_or_else(|| CheckoutError::UnknownPackage(package_key.into()))?;

    let profile = ledger
        .get_profile(principal_id)
        .map_err(CheckoutError::Provider)?
        .ok_or(CheckoutError::ProfileNotFound)?;

    let customer_ref = match profile.stripe_customer_id {
        Some(existing) => existing,
        None => {
            // Create provider-side first, then claim the slot. If a
            // concurrent purchase won the claim, its ref is the one the
            // ledger keeps and the one we must use.
            let candidate = stripe.create_customer(principal_id).await?;
            let stored = ledger
                .claim_customer_ref(principal_id, &candidate)
                .map_err(CheckoutError::Provider)?
                .ok_or(CheckoutError::ProfileNotFound)?;
            if stored != candidate {
                tracing::warn!(
                    principal_id,
                    "concurrent checkout created a duplicate provider customer, reusing the stored ref"
                );
            }
            stored
        }
    };

    let url = stripe
        .create_checkout_session(&customer_ref, package, principal_id, success_url, cancel_url)
        .await?;
    Ok(url)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Build a valid signature header for a body at a given timestamp.
    fn sign(body: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn checkout_event_body() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_test_1",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "mode": "payment",
                    "payment_status": "paid",
                    "metadata": {
                        "principalId": "principal-q",
                        "packageKey": "CREDITS_75"
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_verifies_and_parses() {
        let body = checkout_event_body();
        let now = chrono::Utc::now().timestamp();
        let header = sign(&body, "whsec_test", now);

        let event = verify_and_parse_event(&body, &header, "whsec_test").unwrap();
        assert_eq!(event.id, "evt_test_1");
        assert_eq!(event.kind, "checkout.session.completed");
        assert_eq!(event.principal_id.as_deref(), Some("principal-q"));
        assert_eq!(event.package_key.as_deref(), Some("CREDITS_75"));
        assert_eq!(event.payment_status.as_deref(), Some("paid"));
        assert_eq!(event.mode.as_deref(), Some("payment"));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = checkout_event_body();
        let now = chrono::Utc::now().timestamp();
        let header = sign(&body, "whsec_test", now);

        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");
        assert!(matches!(
            verify_and_parse_event(&tampered, &header, "whsec_test"),
            Err(WebhookError::SignatureInvalid)
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = checkout_event_body();
        let now = chrono::Utc::now().timestamp();
        let header = sign(&body, "whsec_test", now);
        assert!(matches!(
            verify_and_parse_event(&body, &header, "whsec_other"),
            Err(WebhookError::SignatureInvalid)
        ));
    }

    #[test]
    fn garbage_header_is_missing_signature() {
        let body = checkout_event_body();
        assert!(matches!(
            verify_and_parse_event(&body, "not-a-header", "whsec_test"),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_and_parse_event(&body, "", "whsec_test"),
            Err(WebhookError::MissingSignature)
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = checkout_event_body();
        let stale = chrono::Utc::now().timestamp() - 3600;
        let header = sign(&body, "whsec_test", stale);
        assert!(matches!(
            verify_and_parse_event(&body, &header, "whsec_test"),
            Err(WebhookError::TimestampOutOfTolerance)
        ));
    }

    #[test]
    fn stale_timestamp_ok_within_custom_tolerance() {
        let body = checkout_event_body();
        let header = sign(&body, "whsec_test", 1_000_000);
        assert!(verify_signature_at(&body, &header, "whsec_test", 1_000_200, 300).is_ok());
        assert!(verify_signature_at(&body, &header, "whsec_test", 1_000_400, 300).is_err());
    }

    #[test]
    fn second_v1_candidate_is_accepted() {
        // During secret rotation the provider sends one v1 per secret.
        let body = checkout_event_body();
        let now = chrono::Utc::now().timestamp();
        let good = sign(&body, "whsec_test", now);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={now},v1={},v1={good_sig}", hex::encode([0u8; 32]));
        assert!(verify_and_parse_event(&body, &header, "whsec_test").is_ok());
    }

    #[test]
    fn signed_garbage_is_malformed_payload() {
        let body = b"not json at all".to_vec();
        let now = chrono::Utc::now().timestamp();
        let header = sign(&body, "whsec_test", now);
        assert!(matches!(
            verify_and_parse_event(&body, &header, "whsec_test"),
            Err(WebhookError::MalformedPayload)
        ));
    }

    #[test]
    fn event_without_metadata_parses_with_nones() {
        let body = serde_json::json!({
            "id": "evt_min",
            "type": "charge.refunded",
            "data": {"object": {}}
        })
        .to_string()
        .into_bytes();
        let now = chrono::Utc::now().timestamp();
        let header = sign(&body, "whsec_test", now);

        let event = verify_and_parse_event(&body, &header, "whsec_test").unwrap();
        assert_eq!(event.kind, "charge.refunded");
        assert!(event.principal_id.is_none());
        assert!(event.package_key.is_none());
    }

    // ── Checkout flow (wiremock) ────────────────────────────────

    async fn mock_provider() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cus_test_1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(body_string_contains("packageKey%5D=CREDITS_20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.example.com/cs_test_1"
            })))
            .mount(&server)
            .await;
        server
    }

    fn test_ledger() -> (TempDir, Arc<LedgerStore>) {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(LedgerStore::open(&tmp.path().join("ledger.db")).unwrap());
        (tmp, ledger)
    }

    #[tokio::test]
    async fn checkout_creates_customer_then_session() {
        let server = mock_provider().await;
        let (_tmp, ledger) = test_ledger();
        ledger.create_profile_if_missing("principal-a").unwrap();
        let stripe = StripeClient::with_base("sk_test", &server.uri()).unwrap();

        let url = start_checkout(
            &ledger,
            &stripe,
            "principal-a",
            "CREDITS_20",
            "https://app.example.com/billing?success=true",
            "https://app.example.com/billing?canceled=true",
        )
        .await
        .unwrap();

        assert_eq!(url, "https://checkout.example.com/cs_test_1");
        let profile = ledger.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.stripe_customer_id.as_deref(), Some("cus_test_1"));
    }

    #[tokio::test]
    async fn second_checkout_reuses_stored_customer() {
        let server = mock_provider().await;
        let (_tmp, ledger) = test_ledger();
        ledger.create_profile_if_missing("principal-a").unwrap();
        ledger
            .claim_customer_ref("principal-a", "cus_existing")
            .unwrap();
        let stripe = StripeClient::with_base("sk_test", &server.uri()).unwrap();

        start_checkout(
            &ledger,
            &stripe,
            "principal-a",
            "CREDITS_20",
            "https://app.example.com/ok",
            "https://app.example.com/no",
        )
        .await
        .unwrap();

        // The stored ref survives; the mock's cus_test_1 never replaces it.
        let profile = ledger.get_profile("principal-a").unwrap().unwrap();
        assert_eq!(profile.stripe_customer_id.as_deref(), Some("cus_existing"));
    }

    #[tokio::test]
    async fn checkout_rejects_unknown_package() {
        let server = mock_provider().await;
        let (_tmp, ledger) = test_ledger();
        ledger.create_profile_if_missing("principal-a").unwrap();
        let stripe = StripeClient::with_base("sk_test", &server.uri()).unwrap();

        let err = start_checkout(&ledger, &stripe, "principal-a", "CREDITS_13", "s", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::UnknownPackage(_)));
    }

    #[tokio::test]
    async fn checkout_requires_a_profile() {
        let server = mock_provider().await;
        let (_tmp, ledger) = test_ledger();
        let stripe = StripeClient::with_base("sk_test", &server.uri()).unwrap();

        let err = start_checkout(&ledger, &stripe, "ghost", "CREDITS_20", "s", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::ProfileNotFound));
    }
}
