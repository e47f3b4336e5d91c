//! External inference collaborator.
//!
//! The model is treated as unreliable and slow: one request, no retries
//! (a retry above a charge decision is a double-charge waiting to
//! happen), timeouts enforced by the orchestrator on top of the HTTP
//! client's own. Concrete backends implement [`InferenceProvider`] so
//! the orchestrator can be tested against canned responses.

pub mod prompt;

use async_trait::async_trait;
use serde::Deserialize;

pub use prompt::build_memo_prompt;

/// Default generation temperature; low for factual, deterministic output.
const DEFAULT_TEMPERATURE: f64 = 0.2;

/// A backend that turns a prompt into raw model text.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Generate raw text for the given policy input. Implementations
    /// return the model's text verbatim; validation happens elsewhere.
    async fn generate(&self, policy_text: &str) -> anyhow::Result<String>;
}

// ── Gemini REST backend ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Gemini `generateContent` client.
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(
        api_base: &str,
        api_key: &str,
        model: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl InferenceProvider for GeminiClient {
    async fn generate(&self, policy_text: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        );
        let payload = serde_json::json!({
            "contents": [{"parts": [{"text": build_memo_prompt(policy_text)}]}],
            "generationConfig": {
                "temperature": DEFAULT_TEMPERATURE,
                "responseMimeType": "application/json",
            },
        });

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("inference request failed ({status}): {body}");
        }

        let parsed: GenerateResponse = resp.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        if text.trim().is_empty() {
            anyhow::bail!("inference response carried no text content");
        }
        Ok(text)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generate_extracts_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"parts": [{"text": "{\"memoTitle\": \"x\"}"}]}
                }]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(&server.uri(), "test-key", "gemini-2.5-flash", 5).unwrap();
        let text = client.generate("some policy").await.unwrap();
        assert_eq!(text, "{\"memoTitle\": \"x\"}");
    }

    #[tokio::test]
    async fn empty_candidates_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(&server.uri(), "test-key", "gemini-2.5-flash", 5).unwrap();
        assert!(client.generate("some policy").await.is_err());
    }

    #[tokio::test]
    async fn provider_5xx_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = GeminiClient::new(&server.uri(), "test-key", "gemini-2.5-flash", 5).unwrap();
        assert!(client.generate("some policy").await.is_err());
    }
}
