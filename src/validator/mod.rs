//! Strict validation of untrusted model output.
//!
//! The model is prompted to return exactly one JSON object, but real
//! responses arrive wrapped in markdown code fences or padded with prose.
//! This module strips the wrapper, parses the remainder as a single JSON
//! value, and checks it against the memo contract. It has no side effects
//! and no knowledge of the ledger.
//!
//! Only the first contract violation is surfaced: callers show one
//! actionable error, not a list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimum character count for each entry in `top3Risks`.
const RISK_MIN_CHARS: usize = 10;

/// Allowed length range for `keyRequirements`.
const REQUIREMENTS_MIN: usize = 5;
const REQUIREMENTS_MAX: usize = 10;

/// Maximum number of entries in `top3Risks`. Fewer is accepted; the
/// upstream prompt is best-effort about filling all three.
const RISKS_MAX: usize = 3;

// ── Validation errors ────────────────────────────────────────────

/// Why a model response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The response was not parseable as JSON at all. Fatal for this
    /// attempt; the caller may resubmit but we never retry internally.
    #[error("model output is not valid JSON: {0}")]
    MalformedSyntax(String),

    /// The response parsed but violates the memo contract. `field` is the
    /// path of the first violation encountered.
    #[error("model output violates the memo contract at `{field}`: {reason}")]
    SchemaViolation { field: String, reason: String },
}

impl ValidationError {
    fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── Memo contract ────────────────────────────────────────────────

/// The closed set of audiences a memo may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    Employees,
    Leadership,
    #[serde(rename = "Technical Team")]
    TechnicalTeam,
}

impl Audience {
    /// Parse from the wire representation. Any value outside the closed
    /// set is a contract violation, never coerced.
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Employees" => Some(Self::Employees),
            "Leadership" => Some(Self::Leadership),
            "Technical Team" => Some(Self::TechnicalTeam),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employees => "Employees",
            Self::Leadership => "Leadership",
            Self::TechnicalTeam => "Technical Team",
        }
    }
}

/// One actionable requirement extracted from the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// The policy area, e.g. "Password Management".
    pub category: String,
    /// The single clear action the audience must take.
    pub simplified_action: String,
}

/// A validated, schema-conformant memo — the output of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMemo {
    /// Concise, non-technical memo title.
    pub memo_title: String,
    /// Primary internal group the memo targets.
    pub target_audience: Audience,
    /// Up to three critical risks if the policy is ignored.
    pub top3_risks: Vec<String>,
    /// 5–10 simplified, actionable requirements.
    pub key_requirements: Vec<Requirement>,
    /// Single call-to-action for the reader.
    pub next_step: String,
}

// ── Validation pipeline ──────────────────────────────────────────

/// Validate raw model output into a [`PolicyMemo`].
///
/// Pipeline: strip a code-fence wrapper, parse as a single JSON value,
/// then check each contract field in order. On success the memo is
/// returned as parsed — no field rewriting beyond the fence strip.
pub fn validate(raw: &str) -> Result<PolicyMemo, ValidationError> {
    let stripped = strip_code_fence(raw);

    let value: Value = serde_json::from_str(stripped)
        .map_err(|e| ValidationError::MalformedSyntax(e.to_string()))?;

    check_contract(&value)
}

/// Strip a leading markdown fence (optionally tagged with a language
/// hint) and its matching trailing fence. Anything else is returned
/// trimmed but untouched, so a fence-less response parses as-is.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();

    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the fence line itself (which may carry "json" or similar).
    let Some(newline) = rest.find('\n') else {
        return trimmed;
    };
    let body = &rest[newline + 1..];

    // Cut at the matching trailing fence; without one, the wrapper is
    // not well-formed and the original text goes to the parser.
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => trimmed,
    }
}

/// Check the parsed value against the memo contract, field by field.
/// Fails on the first violation encountered.
fn check_contract(value: &Value) -> Result<PolicyMemo, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::schema("$", "expected a single JSON object"))?;

    let memo_title = require_text(obj, "memoTitle")?;

    let audience_raw = require_text(obj, "targetAudience")?;
    let target_audience = Audience::parse(&audience_raw).ok_or_else(|| {
        ValidationError::schema(
            "targetAudience",
            format!("\"{audience_raw}\" is not one of Employees, Leadership, Technical Team"),
        )
    })?;

    let risks_value = obj
        .get("top3Risks")
        .ok_or_else(|| ValidationError::schema("top3Risks", "missing required field"))?;
    let risks = risks_value
        .as_array()
        .ok_or_else(|| ValidationError::schema("top3Risks", "expected an array of strings"))?;
    if risks.len() > RISKS_MAX {
        return Err(ValidationError::schema(
            "top3Risks",
            format!("at most {RISKS_MAX} entries allowed, got {}", risks.len()),
        ));
    }
    let mut top3_risks = Vec::with_capacity(risks.len());
    for (i, risk) in risks.iter().enumerate() {
        let field = format!("top3Risks[{i}]");
        let text = risk
            .as_str()
            .ok_or_else(|| ValidationError::schema(&field, "expected a string"))?;
        if text.chars().count() < RISK_MIN_CHARS {
            return Err(ValidationError::schema(
                &field,
                format!("must be at least {RISK_MIN_CHARS} characters"),
            ));
        }
        top3_risks.push(text.to_string());
    }

    let reqs_value = obj
        .get("keyRequirements")
        .ok_or_else(|| ValidationError::schema("keyRequirements", "missing required field"))?;
    let reqs = reqs_value
        .as_array()
        .ok_or_else(|| ValidationError::schema("keyRequirements", "expected an array of objects"))?;
    if reqs.len() < REQUIREMENTS_MIN || reqs.len() > REQUIREMENTS_MAX {
        return Err(ValidationError::schema(
            "keyRequirements",
            format!(
                "expected {REQUIREMENTS_MIN} to {REQUIREMENTS_MAX} entries, got {}",
                reqs.len()
            ),
        ));
    }
    let mut key_requirements = Vec::with_capacity(reqs.len());
    for (i, req) in reqs.iter().enumerate() {
        let entry = req.as_object().ok_or_else(|| {
            ValidationError::schema(format!("keyRequirements[{i}]"), "expected an object")
        })?;
        let category = require_text_at(entry, "category", &format!("keyRequirements[{i}].category"))?;
        let simplified_action = require_text_at(
            entry,
            "simplifiedAction",
            &format!("keyRequirements[{i}].simplifiedAction"),
        )?;
        key_requirements.push(Requirement {
            category,
            simplified_action,
        });
    }

    let next_step = require_text(obj, "nextStep")?;

    Ok(PolicyMemo {
        memo_title,
        target_audience,
        top3_risks,
        key_requirements,
        next_step,
    })
}

/// Fetch a required non-empty string field from the top-level object.
fn require_text(
    obj: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<String, ValidationError> {
    require_text_at(obj, field, field)
}

/// Fetch a required non-empty string, reporting `path` on violation.
fn require_text_at(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    path: &str,
) -> Result<String, ValidationError> {
    let value = obj
        .get(field)
        .ok_or_else(|| ValidationError::schema(path, "missing required field"))?;
    let text = value
        .as_str()
        .ok_or_else(|| ValidationError::schema(path, "expected a string"))?;
    if text.trim().is_empty() {
        return Err(ValidationError::schema(path, "must not be empty"));
    }
    Ok(text.to_string())
}

// ── Tests ────────────────────────────────────────────────────────
