//! Wire contracts and internal types.
//!
//! [`PreparedInput`] and [`ScanResult`] are the request/response pair at the
//! service boundary. [`Rule`], [`DatasetMetadata`], and [`Dataset`] model the
//! rule-bundle file format. [`RuleMatch`] is the internal record of a hit;
//! its `matched_preview` is always a redacted digest, never raw text.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError};

// ── ScanStatus ─────────────────────────────────────────────────────────

/// Verdict of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    /// No rule matched; input may proceed.
    Clean,
    /// Input was classified as source code and bypassed rule scanning.
    CleanCode,
    /// A medium/low-severity rule matched, or ensemble score warrants review.
    Warn,
    /// A critical/high-severity rule matched; input must not proceed.
    Rejected,
    /// Internal failure under fail-closed policy; a human must decide.
    ReviewRequired,
    /// Internal failure under fail-open policy; input passes with a flag.
    Error,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "CLEAN"),
            Self::CleanCode => write!(f, "CLEAN_CODE"),
            Self::Warn => write!(f, "WARN"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::ReviewRequired => write!(f, "REVIEW_REQUIRED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ── Severity ───────────────────────────────────────────────────────────

/// Rule severity. Scanning order and status mapping both follow this:
/// `critical`/`high` reject, `medium`/`low` warn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Immediate rejection; incident-worthy.
    Critical,
    /// Rejection.
    High,
    /// Flag for review.
    Medium,
    /// Flag for review.
    Low,
}

impl Severity {
    /// Sort rank: critical first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Whether a single match at this severity rejects the input outright.
    #[must_use]
    pub fn rejects(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

// ── RuleState ──────────────────────────────────────────────────────────

/// Rule lifecycle state. Only `active` rules participate in scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    /// Authored but not yet vetted.
    Draft,
    /// Under offline evaluation.
    Testing,
    /// Live for a fraction of traffic in upstream deployments.
    Canary,
    /// Live.
    Active,
    /// Superseded; kept for history.
    Deprecated,
    /// Pulled after misbehaviour.
    Quarantined,
}

// ── Rule ───────────────────────────────────────────────────────────────

/// One detection rule.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Rule {
    /// Stable identifier, unique within a snapshot.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the rule detects.
    #[serde(default)]
    pub description: String,
    /// Regex pattern executed by the evaluator.
    pub pattern: String,
    /// Severity when the rule matches.
    pub severity: Severity,
    /// Lifecycle state; defaults to `active`.
    #[serde(default = "default_rule_state")]
    pub state: RuleState,
    /// Kill switch; a rule with an uncompilable pattern is disabled at load.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Confidence weight copied into matches, in `[0, 1]`.
    #[serde(default = "default_impact_score")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub impact_score: f64,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Samples that must match the pattern (checked at load, never fatal).
    #[serde(default)]
    pub positive_tests: Vec<String>,
    /// Samples that must not match the pattern.
    #[serde(default)]
    pub negative_tests: Vec<String>,
}

fn default_rule_state() -> RuleState {
    RuleState::Active
}

fn default_true() -> bool {
    true
}

fn default_impact_score() -> f64 {
    1.0
}

impl Rule {
    /// Whether this rule participates in scanning.
    #[must_use]
    pub fn is_scannable(&self) -> bool {
        self.state == RuleState::Active && self.enabled
    }
}

// ── Dataset ────────────────────────────────────────────────────────────

/// Bundle-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Bundle name, unique across the dataset directory.
    pub name: String,
    /// Author-assigned version string.
    pub version: String,
    /// Provenance of the rules (curated, imported, generated).
    pub source: String,
    /// Author-reported last update, opaque to the loader.
    pub last_updated: String,
    /// Declared rule count; auto-corrected against the actual count.
    pub total_rules: usize,
    /// Build identifier; synthesized as `{name}-{version}` when absent.
    pub dataset_build_id: String,
    /// Optional HMAC-SHA256 signature over the canonical bundle form.
    #[serde(default)]
    pub hmac_signature: Option<String>,
}

/// A parsed, validated rule bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Bundle metadata.
    pub metadata: DatasetMetadata,
    /// Rules in file order.
    pub rules: Vec<Rule>,
}

// ── MatchSource ────────────────────────────────────────────────────────

/// Which scan scope produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// The primary user text.
    UserInput,
    /// External chunk at the given index.
    Chunk(usize),
    /// The concatenation of user text and all chunks.
    Combined,
}

impl std::fmt::Display for MatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserInput => write!(f, "user_input"),
            Self::Chunk(i) => write!(f, "chunk_{i}"),
            Self::Combined => write!(f, "combined"),
        }
    }
}

impl Serialize for MatchSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── RuleMatch ──────────────────────────────────────────────────────────

/// Internal record of a rule hit.
///
/// `matched_preview` carries a digest of the matched text, never the text
/// itself; see [`crate::scanner::redacted_preview`].
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    /// Matching rule.
    pub rule_id: String,
    /// Dataset the rule came from.
    pub dataset: String,
    /// Severity of the matching rule.
    pub severity: Severity,
    /// `[REDACTED:match:sha256={16 hex}]`.
    pub matched_preview: String,
    /// Copied from the rule's `impact_score`.
    pub confidence: f64,
    /// Scope that produced the hit.
    pub source: MatchSource,
}

// ── ScanResult ─────────────────────────────────────────────────────────

/// Response contract for one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Verdict.
    pub status: ScanStatus,
    /// Opaque token binding this scan to a snapshot version and second.
    pub audit_token: String,
    /// Matching rule, when any.
    pub rule_id: Option<String>,
    /// Dataset of the matching rule, when any.
    pub dataset: Option<String>,
    /// Severity of the matching rule, when any.
    pub severity: Option<Severity>,
    /// Wall-clock time spent in the scanner.
    pub processing_time_ms: f64,
    /// Version of the snapshot the scan ran against.
    pub rule_set_version: String,
    /// Engine version.
    pub scanner_version: String,
    /// Short human-readable note; never contains matched text.
    pub note: Option<String>,
    /// Optional auxiliary model score, absent unless an upstream fusion
    /// layer supplies one.
    pub ml_suspicion_score: Option<f64>,
}

// ── PreparedInput ──────────────────────────────────────────────────────

/// Errors surfaced when a request fails boundary validation (HTTP 422).
#[derive(Debug, Error)]
pub enum InputError {
    /// `user_input` was empty or whitespace-only.
    #[error(transparent)]
    Invalid(#[from] validator::ValidationErrors),
    /// `user_input` exceeded the configured character limit.
    #[error("user_input exceeds {limit} characters (got {actual})")]
    InputTooLong {
        /// Configured maximum.
        limit: usize,
        /// Observed length.
        actual: usize,
    },
    /// More external chunks than the configured limit.
    #[error("too many external chunks: {actual} > {limit}")]
    TooManyChunks {
        /// Configured maximum.
        limit: usize,
        /// Observed count.
        actual: usize,
    },
}

/// The request: primary user text plus ordered external chunks.
///
/// Empty chunks are filtered on construction; `user_input` must have a
/// trimmed length of at least one character.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PreparedInput {
    /// Primary user text. Never empty after validation.
    #[validate(custom(function = validate_non_blank))]
    pub user_input: String,
    /// External context chunks (retrieval results, file extracts), in order.
    #[serde(default, deserialize_with = "chunks_or_empty")]
    pub external_chunks: Vec<String>,
    /// Opaque caller metadata for the audit trail.
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

fn validate_non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("user_input cannot be empty".into()));
    }
    Ok(())
}

/// Accepts a JSON `null` where a chunk list is expected.
fn chunks_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let maybe: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(maybe.unwrap_or_default())
}

impl PreparedInput {
    /// Build an input, dropping empty chunks.
    #[must_use]
    pub fn new(user_input: impl Into<String>, external_chunks: Vec<String>) -> Self {
        let mut input = Self {
            user_input: user_input.into(),
            external_chunks,
            metadata: None,
        };
        input.drop_empty_chunks();
        input
    }

    /// Remove chunks that are empty after trimming. Order is preserved.
    pub fn drop_empty_chunks(&mut self) {
        self.external_chunks.retain(|c| !c.trim().is_empty());
    }

    /// Enforce boundary invariants against the configured limits.
    ///
    /// # Errors
    ///
    /// Returns [`InputError`] when the input is blank, oversized, or carries
    /// too many chunks.
    pub fn check_limits(&self, max_input_length: usize, max_chunks: usize) -> Result<(), InputError> {
        self.validate()?;
        let actual = self.user_input.chars().count();
        if actual > max_input_length {
            return Err(InputError::InputTooLong {
                limit: max_input_length,
                actual,
            });
        }
        if self.external_chunks.len() > max_chunks {
            return Err(InputError::TooManyChunks {
                limit: max_chunks,
                actual: self.external_chunks.len(),
            });
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ScanStatus::CleanCode).unwrap(),
            r#""CLEAN_CODE""#
        );
        assert_eq!(
            serde_json::to_string(&ScanStatus::ReviewRequired).unwrap(),
            r#""REVIEW_REQUIRED""#
        );
    }

    #[test]
    fn severity_round_trips_and_ranks() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, r#""critical""#);
        let parsed: Severity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Severity::Critical);
        assert!(Severity::Critical.rank() < Severity::Low.rank());
        assert!(Severity::High.rejects());
        assert!(!Severity::Medium.rejects());
    }

    #[test]
    fn rule_defaults_fill_in() {
        let rule: Rule = serde_yaml::from_str(
            r#"
            id: r1
            name: test rule
            pattern: "foo"
            severity: high
            "#,
        )
        .unwrap();
        assert_eq!(rule.state, RuleState::Active);
        assert!(rule.enabled);
        assert!(rule.is_scannable());
        assert!(rule.positive_tests.is_empty());
    }

    #[test]
    fn non_active_rule_not_scannable() {
        let rule: Rule = serde_yaml::from_str(
            r#"
            id: r2
            name: draft rule
            pattern: "bar"
            severity: low
            state: draft
            "#,
        )
        .unwrap();
        assert!(!rule.is_scannable());
    }

    #[test]
    fn prepared_input_filters_empty_chunks() {
        let input = PreparedInput::new(
            "hello",
            vec!["a".into(), "".into(), "  ".into(), "b".into()],
        );
        assert_eq!(input.external_chunks, vec!["a", "b"]);
    }

    #[test]
    fn blank_user_input_rejected() {
        let input = PreparedInput::new("   ", vec![]);
        assert!(input.check_limits(100, 10).is_err());
    }

    #[test]
    fn oversized_input_rejected() {
        let input = PreparedInput::new("abcdef", vec![]);
        assert!(matches!(
            input.check_limits(3, 10),
            Err(InputError::InputTooLong { limit: 3, actual: 6 })
        ));
    }

    #[test]
    fn too_many_chunks_rejected() {
        let input = PreparedInput::new("hi", vec!["a".into(), "b".into(), "c".into()]);
        assert!(matches!(
            input.check_limits(100, 2),
            Err(InputError::TooManyChunks { limit: 2, actual: 3 })
        ));
    }

    #[test]
    fn null_chunks_deserialize_as_empty() {
        let input: PreparedInput =
            serde_json::from_str(r#"{"user_input": "hi", "external_chunks": null}"#).unwrap();
        assert!(input.external_chunks.is_empty());
    }

    #[test]
    fn match_source_display() {
        assert_eq!(MatchSource::UserInput.to_string(), "user_input");
        assert_eq!(MatchSource::Chunk(3).to_string(), "chunk_3");
        assert_eq!(MatchSource::Combined.to_string(), "combined");
    }
}
