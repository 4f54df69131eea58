//! Environment-sourced configuration with secure defaults.
//!
//! All settings are read from `L0_`-prefixed environment variables (a `.env`
//! file is honoured when present). Defaults fail closed: unsigned or broken
//! rule bundles keep the previous snapshot, and internal scanner errors map
//! to `REVIEW_REQUIRED` rather than letting input through.
//!
//! ```rust,no_run
//! use layer0::config::Settings;
//!
//! let settings = Settings::from_env().expect("valid environment");
//! assert!(!settings.fail_open);
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse {
        /// Environment variable key.
        key: String,
        /// What was wrong with the value.
        message: String,
    },
}

/// Which regex engine compiles a rule pattern first.
///
/// The evaluator tries the preferred engine and falls back per-pattern when
/// the pattern does not compile under it. The linear-time engine ignores the
/// wall-clock budget (linearity is the guarantee); the PCRE-style
/// backtracker is budgeted and doubles as the default fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePreference {
    /// Linear-time NFA engine first (`regex`), backtracker as fallback.
    Linear,
    /// PCRE-style backtracking engine first (`fancy-regex`).
    Pcre,
}

impl Default for EnginePreference {
    fn default() -> Self {
        Self::Linear
    }
}

impl FromStr for EnginePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" | "auto" => Ok(Self::Linear),
            "pcre" | "backtracking" => Ok(Self::Pcre),
            other => Err(format!(
                "unknown regex engine '{other}' (expected 'linear' or 'pcre')"
            )),
        }
    }
}

/// Typed runtime settings for the whole service.
///
/// Construct with [`Settings::from_env`] in production or
/// [`Settings::default`] in tests, then share as `Arc<Settings>`. There are
/// no hidden globals; the settings value is threaded explicitly through
/// [`Scanner`](crate::scanner::Scanner) and
/// [`ServerContext`](crate::service::ServerContext).
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // ── Regex engine ───────────────────────────────────────────────────
    /// Per-call wall-clock budget for backtracking regex execution.
    pub regex_timeout_ms: u64,
    /// Preferred regex engine.
    pub regex_engine: EnginePreference,

    // ── Scanner ────────────────────────────────────────────────────────
    /// Stop at the first matching rule (default `true`).
    pub stop_on_first_match: bool,
    /// Aggregate matches across all scan scopes instead of stopping early.
    pub ensemble_scoring: bool,
    /// Mean-confidence threshold for `REJECTED` in ensemble mode.
    pub ensemble_threshold_reject: f64,
    /// Mean-confidence threshold for `WARN` in ensemble mode.
    pub ensemble_threshold_warn: f64,

    // ── Prefilters ─────────────────────────────────────────────────────
    /// Legacy substring prefilter keywords (comma-separated in the env).
    pub prefilter_keywords: Vec<String>,
    /// Whether the prefilters run at all.
    pub prefilter_enabled: bool,

    // ── Normalization ──────────────────────────────────────────────────
    /// Normalization stage names to skip (see [`crate::normalize`]).
    pub disable_normalization_steps: HashSet<String>,
    /// Master switch for the normalization pipeline.
    pub normalization_enabled: bool,

    // ── Code detection ─────────────────────────────────────────────────
    /// Whether code detection may bypass rule scanning.
    pub code_detection_enabled: bool,
    /// Combined-score threshold above which input counts as code.
    pub code_confidence_threshold: f64,

    // ── Datasets ───────────────────────────────────────────────────────
    /// Shared secret for bundle HMAC verification and audit tokens.
    pub dataset_hmac_secret: String,
    /// Directory holding `*.yaml` rule bundles.
    pub dataset_path: String,
    /// Allowlisted content hashes (comma-separated in the env).
    pub allowlisted_hashes: Vec<String>,

    // ── Fail policy ────────────────────────────────────────────────────
    /// `true` maps internal errors to `ERROR` (permit); `false` to
    /// `REVIEW_REQUIRED` (deny). Default `false`.
    pub fail_open: bool,

    // ── Observability ──────────────────────────────────────────────────
    /// Whether the `/metrics` endpoint and counters are active.
    pub metrics_enabled: bool,
    /// Log filter directive passed to the tracing subscriber.
    pub log_level: String,

    // ── API ────────────────────────────────────────────────────────────
    /// Bind address for the HTTP boundary.
    pub api_host: String,
    /// Bind port for the HTTP boundary.
    pub api_port: u16,
    /// Optional static API key; `None` allows anonymous access.
    pub api_key: Option<String>,

    // ── Limits ─────────────────────────────────────────────────────────
    /// Maximum `user_input` length in characters.
    pub max_input_length: usize,
    /// Maximum number of external chunks per request.
    pub max_chunks: usize,
    /// End-to-end soft budget for one scan.
    pub chunk_processing_timeout_ms: u64,
    /// Bounded worker pool size for chunk normalization and scanning.
    pub scan_workers: usize,
    /// Per-client `/scan` budget per minute.
    pub rate_limit_per_minute: u32,
    /// Per-client `/datasets/reload` budget per hour.
    pub reload_rate_per_hour: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            regex_timeout_ms: 100,
            regex_engine: EnginePreference::Linear,
            stop_on_first_match: true,
            ensemble_scoring: false,
            ensemble_threshold_reject: 0.95,
            ensemble_threshold_warn: 0.7,
            prefilter_keywords: [
                "ignore",
                "override",
                "jailbreak",
                "system",
                "prompt",
                "instructions",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            prefilter_enabled: true,
            disable_normalization_steps: HashSet::new(),
            normalization_enabled: true,
            code_detection_enabled: true,
            code_confidence_threshold: 0.7,
            dataset_hmac_secret: "change-me-in-production".to_string(),
            dataset_path: "datasets".to_string(),
            allowlisted_hashes: Vec::new(),
            fail_open: false,
            metrics_enabled: true,
            log_level: "info".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            api_key: None,
            max_input_length: 100_000,
            max_chunks: 1000,
            chunk_processing_timeout_ms: 5000,
            scan_workers: 4,
            rate_limit_per_minute: 100,
            reload_rate_per_hour: 10,
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    /// Unset variables keep their secure defaults; set-but-unparsable
    /// variables are an error rather than a silent fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvParse`] for any `L0_*` variable whose value
    /// does not parse.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        dotenvy::dotenv().ok();

        let mut settings = Self::default();

        read_parsed("L0_REGEX_TIMEOUT_MS", &mut settings.regex_timeout_ms)?;
        read_parsed("L0_REGEX_ENGINE", &mut settings.regex_engine)?;
        read_bool("L0_STOP_ON_FIRST_MATCH", &mut settings.stop_on_first_match)?;
        read_bool("L0_ENSEMBLE_SCORING", &mut settings.ensemble_scoring)?;
        read_parsed(
            "L0_ENSEMBLE_THRESHOLD_REJECT",
            &mut settings.ensemble_threshold_reject,
        )?;
        read_parsed(
            "L0_ENSEMBLE_THRESHOLD_WARN",
            &mut settings.ensemble_threshold_warn,
        )?;
        if let Some(raw) = read_raw("L0_PREFILTER_KEYWORDS") {
            settings.prefilter_keywords = split_csv(&raw)
                .map(|kw| kw.to_ascii_lowercase())
                .collect();
        }
        read_bool("L0_PREFILTER_ENABLED", &mut settings.prefilter_enabled)?;
        if let Some(raw) = read_raw("L0_DISABLE_NORMALIZATION_STEPS") {
            settings.disable_normalization_steps =
                split_csv(&raw).map(ToString::to_string).collect();
        }
        read_bool(
            "L0_NORMALIZATION_ENABLED",
            &mut settings.normalization_enabled,
        )?;
        read_bool(
            "L0_CODE_DETECTION_ENABLED",
            &mut settings.code_detection_enabled,
        )?;
        read_parsed(
            "L0_CODE_CONFIDENCE_THRESHOLD",
            &mut settings.code_confidence_threshold,
        )?;
        if let Some(raw) = read_raw("L0_DATASET_HMAC_SECRET") {
            settings.dataset_hmac_secret = raw;
        }
        if let Some(raw) = read_raw("L0_DATASET_PATH") {
            settings.dataset_path = raw;
        }
        if let Some(raw) = read_raw("L0_ALLOWLISTED_HASHES") {
            settings.allowlisted_hashes = split_csv(&raw).map(ToString::to_string).collect();
        }
        read_bool("L0_FAIL_OPEN", &mut settings.fail_open)?;
        read_bool("L0_METRICS_ENABLED", &mut settings.metrics_enabled)?;
        if let Some(raw) = read_raw("L0_LOG_LEVEL") {
            settings.log_level = raw;
        }
        if let Some(raw) = read_raw("L0_API_HOST") {
            settings.api_host = raw;
        }
        read_parsed("L0_API_PORT", &mut settings.api_port)?;
        if let Some(raw) = read_raw("L0_API_KEY") {
            settings.api_key = (!raw.is_empty()).then_some(raw);
        }
        read_parsed("L0_MAX_INPUT_LENGTH", &mut settings.max_input_length)?;
        read_parsed("L0_MAX_CHUNKS", &mut settings.max_chunks)?;
        read_parsed(
            "L0_CHUNK_PROCESSING_TIMEOUT_MS",
            &mut settings.chunk_processing_timeout_ms,
        )?;
        read_parsed("L0_SCAN_WORKERS", &mut settings.scan_workers)?;
        read_parsed("L0_RATE_LIMIT_PER_MINUTE", &mut settings.rate_limit_per_minute)?;
        read_parsed("L0_RELOAD_RATE_PER_HOUR", &mut settings.reload_rate_per_hour)?;

        Ok(Arc::new(settings))
    }
}

// ── Env helpers ────────────────────────────────────────────────────────

fn read_raw(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string())
}

fn read_parsed<T>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = read_raw(key) {
        *slot = raw.parse().map_err(|e: T::Err| ConfigError::EnvParse {
            key: key.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn read_bool(key: &str, slot: &mut bool) -> Result<(), ConfigError> {
    if let Some(raw) = read_raw(key) {
        *slot = match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                return Err(ConfigError::EnvParse {
                    key: key.to_string(),
                    message: "must be 'true' or 'false'".to_string(),
                });
            }
        };
    }
    Ok(())
}

fn split_csv(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_closed() {
        let settings = Settings::default();
        assert!(!settings.fail_open);
        assert!(settings.stop_on_first_match);
        assert_eq!(settings.regex_timeout_ms, 100);
        assert_eq!(settings.chunk_processing_timeout_ms, 5000);
        assert_eq!(settings.regex_engine, EnginePreference::Linear);
    }

    #[test]
    fn default_prefilter_keywords_present() {
        let settings = Settings::default();
        assert!(settings.prefilter_keywords.contains(&"jailbreak".to_string()));
        assert_eq!(settings.prefilter_keywords.len(), 6);
    }

    #[test]
    fn engine_preference_parses() {
        assert_eq!(
            "linear".parse::<EnginePreference>().unwrap(),
            EnginePreference::Linear
        );
        assert_eq!(
            "PCRE".parse::<EnginePreference>().unwrap(),
            EnginePreference::Pcre
        );
        assert!("re2ish".parse::<EnginePreference>().is_err());
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        let parts: Vec<_> = split_csv(" a, b ,,c ").collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
    }
}
