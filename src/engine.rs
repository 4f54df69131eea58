//! Budgeted regex evaluation with engine selection and caching.
//!
//! Two engines back the evaluator: the linear-time NFA engine (`regex`,
//! preferred) and a PCRE-style backtracker (`fancy-regex`) that covers
//! look-around and back-references the linear engine rejects. The
//! configured [`EnginePreference`] decides which compiles a pattern first;
//! on incompatibility the pattern falls back to the other engine, so every
//! rule gets the strongest guarantee its pattern allows.
//!
//! Budget enforcement: linear-time execution ignores the wall clock,
//! since linearity is the guarantee. Backtracking execution is bounded twice: a
//! backtrack step limit aborts runaway patterns mid-flight, and a wall-clock
//! check fails the call with [`RegexError::Timeout`] when it exceeds the
//! configured budget. Timeouts are counted per pattern for observability.
//!
//! Compiled patterns are cached by `(pattern, case_insensitive)` and the
//! cache is monotonic during a snapshot's lifetime: it is cleared on rule
//! reload, never selectively evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{EnginePreference, Settings};

/// Backtrack step ceiling for the PCRE-style engine. Exceeding it aborts
/// the call and is reported as a timeout.
const BACKTRACK_LIMIT: usize = 1_000_000;

// ── RegexError ─────────────────────────────────────────────────────────

/// Errors raised by the evaluator.
#[derive(Debug, Error)]
pub enum RegexError {
    /// The pattern compiled under no available engine.
    #[error("pattern failed to compile: {message}")]
    Compile {
        /// Compiler diagnostic from the last engine tried.
        message: String,
    },

    /// Backtracking execution exceeded the wall-clock budget or the
    /// backtrack step limit.
    #[error("regex execution exceeded {budget_ms}ms budget")]
    Timeout {
        /// Budget that was exceeded.
        budget_ms: u64,
    },

    /// The engine reported a runtime failure other than a limit.
    #[error("regex execution failed: {message}")]
    Execution {
        /// Engine diagnostic.
        message: String,
    },
}

// ── Compiled patterns ──────────────────────────────────────────────────

/// A pattern compiled under whichever engine accepted it.
#[derive(Debug)]
pub enum CompiledPattern {
    /// Linear-time NFA; no budget needed.
    Linear(regex::Regex),
    /// PCRE-style backtracker, budgeted per call.
    Backtracking(fancy_regex::Regex),
}

impl CompiledPattern {
    /// Which engine accepted the pattern (for logs and stats).
    #[must_use]
    pub fn engine_name(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Backtracking(_) => "backtracking",
        }
    }
}

/// A single match with its byte span and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSpan {
    /// Byte offset of the match start.
    pub start: usize,
    /// Byte offset one past the match end.
    pub end: usize,
    /// The matched text. Callers must redact before surfacing it.
    pub text: String,
}

// ── RegexEvaluator ─────────────────────────────────────────────────────

type CacheKey = (String, bool);

/// Compile-and-execute service shared by the loader and the scanner.
#[derive(Debug)]
pub struct RegexEvaluator {
    preference: EnginePreference,
    timeout_ms: u64,
    cache: Mutex<HashMap<CacheKey, Arc<CompiledPattern>>>,
    timeout_counts: Mutex<HashMap<String, u64>>,
}

impl RegexEvaluator {
    /// Create an evaluator with an explicit engine preference and budget.
    #[must_use]
    pub fn new(preference: EnginePreference, timeout_ms: u64) -> Self {
        Self {
            preference,
            timeout_ms,
            cache: Mutex::new(HashMap::new()),
            timeout_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Create an evaluator from runtime settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.regex_engine, settings.regex_timeout_ms)
    }

    /// Compile a pattern (case-sensitive), consulting the cache.
    ///
    /// # Errors
    ///
    /// Returns [`RegexError::Compile`] when no engine accepts the pattern.
    pub fn compile(&self, pattern: &str) -> Result<Arc<CompiledPattern>, RegexError> {
        self.compile_with(pattern, false)
    }

    /// Compile a pattern with an explicit case-insensitivity flag.
    ///
    /// # Errors
    ///
    /// Returns [`RegexError::Compile`] when no engine accepts the pattern.
    pub fn compile_with(
        &self,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<Arc<CompiledPattern>, RegexError> {
        let key = (pattern.to_string(), case_insensitive);
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let compiled = Arc::new(self.compile_uncached(pattern, case_insensitive)?);
        self.cache.lock().insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn compile_uncached(
        &self,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<CompiledPattern, RegexError> {
        let linear = || {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map(CompiledPattern::Linear)
        };
        let backtracking = || {
            let decorated = if case_insensitive {
                format!("(?i){pattern}")
            } else {
                pattern.to_string()
            };
            fancy_regex::RegexBuilder::new(&decorated)
                .backtrack_limit(BACKTRACK_LIMIT)
                .build()
                .map(CompiledPattern::Backtracking)
        };

        match self.preference {
            EnginePreference::Linear => linear().or_else(|linear_err| {
                backtracking().map_err(|bt_err| {
                    tracing::debug!(
                        pattern,
                        linear = %linear_err,
                        backtracking = %bt_err,
                        "pattern rejected by both engines",
                    );
                    RegexError::Compile {
                        message: bt_err.to_string(),
                    }
                })
            }),
            EnginePreference::Pcre => backtracking().or_else(|bt_err| {
                linear().map_err(|_| RegexError::Compile {
                    message: bt_err.to_string(),
                })
            }),
        }
    }

    /// Find the first match of `pattern` in `text` under the default budget.
    ///
    /// # Errors
    ///
    /// [`RegexError::Compile`] for an uncompilable pattern,
    /// [`RegexError::Timeout`] when a backtracking search blows its budget.
    pub fn search(&self, pattern: &str, text: &str) -> Result<Option<MatchSpan>, RegexError> {
        self.search_with_budget(pattern, text, None)
    }

    /// Find the first match with an explicit budget override.
    ///
    /// # Errors
    ///
    /// See [`RegexEvaluator::search`].
    pub fn search_with_budget(
        &self,
        pattern: &str,
        text: &str,
        budget_ms: Option<u64>,
    ) -> Result<Option<MatchSpan>, RegexError> {
        let compiled = self.compile(pattern)?;
        let budget = budget_ms.unwrap_or(self.timeout_ms);

        match compiled.as_ref() {
            CompiledPattern::Linear(re) => Ok(re.find(text).map(|m| MatchSpan {
                start: m.start(),
                end: m.end(),
                text: m.as_str().to_string(),
            })),
            CompiledPattern::Backtracking(re) => {
                let started = Instant::now();
                let outcome = re.find(text);
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match outcome {
                    Ok(found) if elapsed_ms <= budget => Ok(found.map(|m| MatchSpan {
                        start: m.start(),
                        end: m.end(),
                        text: m.as_str().to_string(),
                    })),
                    Ok(_) => Err(self.record_timeout(pattern, budget)),
                    Err(fancy_regex::Error::RuntimeError(_)) => {
                        Err(self.record_timeout(pattern, budget))
                    }
                    Err(other) => Err(RegexError::Execution {
                        message: other.to_string(),
                    }),
                }
            }
        }
    }

    /// Collect every non-overlapping match of `pattern` in `text`.
    ///
    /// # Errors
    ///
    /// See [`RegexEvaluator::search`].
    pub fn find_all(&self, pattern: &str, text: &str) -> Result<Vec<MatchSpan>, RegexError> {
        let compiled = self.compile(pattern)?;
        let budget = self.timeout_ms;

        match compiled.as_ref() {
            CompiledPattern::Linear(re) => Ok(re
                .find_iter(text)
                .map(|m| MatchSpan {
                    start: m.start(),
                    end: m.end(),
                    text: m.as_str().to_string(),
                })
                .collect()),
            CompiledPattern::Backtracking(re) => {
                let started = Instant::now();
                let mut spans = Vec::new();
                for found in re.find_iter(text) {
                    let m = match found {
                        Ok(m) => m,
                        Err(fancy_regex::Error::RuntimeError(_)) => {
                            return Err(self.record_timeout(pattern, budget));
                        }
                        Err(other) => {
                            return Err(RegexError::Execution {
                                message: other.to_string(),
                            });
                        }
                    };
                    spans.push(MatchSpan {
                        start: m.start(),
                        end: m.end(),
                        text: m.as_str().to_string(),
                    });
                    if u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX) > budget {
                        return Err(self.record_timeout(pattern, budget));
                    }
                }
                Ok(spans)
            }
        }
    }

    fn record_timeout(&self, pattern: &str, budget_ms: u64) -> RegexError {
        *self
            .timeout_counts
            .lock()
            .entry(pattern.to_string())
            .or_insert(0) += 1;
        tracing::warn!(pattern, budget_ms, "regex execution exceeded budget");
        RegexError::Timeout { budget_ms }
    }

    /// Timeouts recorded for a pattern since the last cache clear.
    #[must_use]
    pub fn timeout_count(&self, pattern: &str) -> u64 {
        self.timeout_counts.lock().get(pattern).copied().unwrap_or(0)
    }

    /// Total timeouts across all patterns.
    #[must_use]
    pub fn total_timeouts(&self) -> u64 {
        self.timeout_counts.lock().values().sum()
    }

    /// Drop all compiled patterns and timeout counters. Called on reload so
    /// the cache is bounded to one snapshot's lifetime.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        self.timeout_counts.lock().clear();
        tracing::info!("regex pattern cache cleared");
    }

    /// Number of cached compiled patterns.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> RegexEvaluator {
        RegexEvaluator::new(EnginePreference::Linear, 100)
    }

    #[test]
    fn plain_pattern_compiles_linear() {
        let eval = evaluator();
        let compiled = eval.compile(r"(?i)ignore\s+previous").unwrap();
        assert_eq!(compiled.engine_name(), "linear");
    }

    #[test]
    fn lookahead_falls_back_to_backtracking() {
        let eval = evaluator();
        // Look-ahead is rejected by the linear engine.
        let compiled = eval.compile(r"foo(?=bar)").unwrap();
        assert_eq!(compiled.engine_name(), "backtracking");
    }

    #[test]
    fn invalid_pattern_fails_both_engines() {
        let eval = evaluator();
        assert!(matches!(
            eval.compile(r"([unclosed"),
            Err(RegexError::Compile { .. })
        ));
    }

    #[test]
    fn pcre_preference_compiles_backtracking_first() {
        let eval = RegexEvaluator::new(EnginePreference::Pcre, 100);
        let compiled = eval.compile(r"simple").unwrap();
        assert_eq!(compiled.engine_name(), "backtracking");
    }

    #[test]
    fn search_finds_span() {
        let eval = evaluator();
        let found = eval.search(r"wor\w+", "hello world").unwrap().unwrap();
        assert_eq!(found.start, 6);
        assert_eq!(found.end, 11);
        assert_eq!(found.text, "world");
    }

    #[test]
    fn search_miss_returns_none() {
        let eval = evaluator();
        assert!(eval.search(r"absent", "hello world").unwrap().is_none());
    }

    #[test]
    fn search_with_backtracking_engine() {
        let eval = evaluator();
        let found = eval.search(r"foo(?=bar)", "xx foobar").unwrap().unwrap();
        assert_eq!(found.text, "foo");
    }

    #[test]
    fn find_all_collects_every_match() {
        let eval = evaluator();
        let spans = eval.find_all(r"\d+", "a1 b22 c333").unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[2].text, "333");
    }

    #[test]
    fn cache_hits_and_clears() {
        let eval = evaluator();
        eval.compile("abc").unwrap();
        eval.compile("abc").unwrap();
        eval.compile_with("abc", true).unwrap();
        assert_eq!(eval.cache_size(), 2);
        eval.clear_cache();
        assert_eq!(eval.cache_size(), 0);
    }

    #[test]
    fn case_insensitive_flag_respected() {
        let eval = evaluator();
        let compiled = eval.compile_with("hello", true).unwrap();
        match compiled.as_ref() {
            CompiledPattern::Linear(re) => assert!(re.is_match("HELLO")),
            CompiledPattern::Backtracking(_) => panic!("expected linear engine"),
        }
    }

    #[test]
    fn timeout_counter_starts_at_zero() {
        let eval = evaluator();
        assert_eq!(eval.timeout_count("anything"), 0);
        assert_eq!(eval.total_timeouts(), 0);
    }

    // Catastrophic backtracking aborts via the step limit and reports as a
    // timeout instead of hanging the scan.
    #[test]
    fn redos_pattern_times_out() {
        let eval = RegexEvaluator::new(EnginePreference::Pcre, 50);
        let pattern = r"(a+)+$";
        let text = format!("{}b", "a".repeat(40));
        match eval.search(pattern, &text) {
            Err(RegexError::Timeout { .. }) => {
                assert!(eval.timeout_count(pattern) >= 1);
            }
            Ok(None) => {
                // Finished under budget on a fast machine; still linear in
                // the step limit, so either outcome is acceptable.
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
