//! Per-request scan orchestration.
//!
//! One scan walks a fixed pipeline with explicit short-circuit points:
//!
//! 1. Hybrid prefilter on the raw user text; a miss exits `CLEAN`.
//! 2. Normalize the user text.
//! 3. Code detection; a confident hit exits `CLEAN_CODE`.
//! 4. Legacy keyword prefilter; a miss exits `CLEAN`.
//! 5. Normalize all external chunks on the bounded worker pool.
//! 6. Scan the user text against all active rules.
//! 7. Scan each chunk concurrently; chunk order decides the first match.
//! 8. Scan the concatenation of user text and chunks to catch payloads
//!    split across sources.
//! 9. In ensemble mode, pool every match from 6–8 and decide by mean
//!    confidence instead of stopping early.
//!
//! The whole pipeline runs under the `chunk_processing_timeout_ms`
//! deadline. Any internal failure is contained per request and mapped by
//! the fail policy: `REVIEW_REQUIRED` when failing closed (the default),
//! `ERROR` when failing open.
//!
//! A scan pins one [`RuleSnapshot`] for its entire duration. Reloads
//! concurrent with a scan are safe: the scan finishes against the version
//! it started with and reports that version.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::audit::AuditTokenizer;
use crate::config::Settings;
use crate::dataset::{DatasetError, DatasetLoader};
use crate::detect::CodeDetector;
use crate::engine::{RegexError, RegexEvaluator};
use crate::model::{MatchSource, PreparedInput, RuleMatch, ScanResult, ScanStatus};
use crate::normalize::Normalizer;
use crate::registry::{RuleRegistry, RuleSnapshot};

/// Engine version stamped into every result.
pub const SCANNER_VERSION: &str = "1.0.0";

/// Redact matched text down to a digest.
///
/// This is the only form in which matched content ever leaves the scanner.
#[must_use]
pub fn redacted_preview(matched: &str) -> String {
    let digest = Sha256::digest(matched.as_bytes());
    let head: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("[REDACTED:match:sha256={head}]")
}

// ── Errors & dispositions ──────────────────────────────────────────────

/// Internal scan failures. Never escape [`Scanner::scan`]; they are folded
/// into the result by the fail policy.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A worker task panicked or was cancelled.
    #[error("worker pool failure: {0}")]
    Worker(String),
}

/// How a scan concluded, for boundary status mapping and the circuit
/// breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDisposition {
    /// The pipeline ran to a verdict.
    Completed,
    /// An internal error was contained and mapped by the fail policy.
    Failed,
    /// The end-to-end deadline expired.
    TimedOut,
}

/// A scan result plus how it concluded.
#[derive(Debug)]
pub struct ScanOutcome {
    /// The wire-shaped result.
    pub result: ScanResult,
    /// Conclusion kind.
    pub disposition: ScanDisposition,
}

// ── Reload report ──────────────────────────────────────────────────────

/// Wire shape returned by `POST /datasets/reload`.
#[derive(Debug, serde::Serialize)]
pub struct ReloadReport {
    /// `"success"` or `"error"`.
    pub status: String,
    /// New snapshot version on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_set_version: Option<String>,
    /// Active rule count on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rules: Option<usize>,
    /// Wall-clock reload duration on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload_time_ms: Option<f64>,
    /// Failure description on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReloadReport {
    /// Whether the reload succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

// ── Scanner ────────────────────────────────────────────────────────────

/// Multi-source scanner. Cheap to share as `Arc<Scanner>`; all mutable
/// state lives in the registry and the evaluator cache.
pub struct Scanner {
    settings: Arc<Settings>,
    engine: Arc<RegexEvaluator>,
    registry: Arc<RuleRegistry>,
    loader: DatasetLoader,
    normalizer: Arc<Normalizer>,
    detector: CodeDetector,
    tokenizer: AuditTokenizer,
    workers: Arc<Semaphore>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("rules", &self.registry.rule_count())
            .field("version", &self.registry.version())
            .finish()
    }
}

impl Scanner {
    /// Wire up a scanner from settings. No datasets are loaded yet; call
    /// [`Scanner::load_datasets`] before serving traffic.
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        let workers = settings.scan_workers.max(1);
        Self {
            engine: Arc::new(RegexEvaluator::from_settings(&settings)),
            registry: Arc::new(RuleRegistry::new()),
            loader: DatasetLoader::from_settings(&settings),
            normalizer: Arc::new(Normalizer::from_settings(&settings)),
            detector: CodeDetector::from_settings(&settings),
            tokenizer: AuditTokenizer::new(settings.dataset_hmac_secret.as_bytes()),
            workers: Arc::new(Semaphore::new(workers)),
            settings,
        }
    }

    /// The registry backing this scanner (shared with the service layer
    /// for probes and statistics).
    #[must_use]
    pub fn registry(&self) -> Arc<RuleRegistry> {
        Arc::clone(&self.registry)
    }

    /// Load all bundles from disk and publish a fresh snapshot.
    ///
    /// The pattern cache is cleared first so it stays bounded to one
    /// snapshot's lifetime. On failure the previous snapshot remains
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] when any bundle fails under fail-closed.
    pub fn load_datasets(&self) -> Result<(), DatasetError> {
        self.engine.clear_cache();
        let datasets = self.loader.load_all(&self.engine)?;
        let snapshot = self.registry.load_datasets(datasets);
        tracing::info!(
            rules = snapshot.rule_count(),
            datasets = snapshot.dataset_count(),
            version = %snapshot.version(),
            "scanner initialized",
        );
        Ok(())
    }

    /// Hot-reload datasets and report the outcome in wire shape.
    #[must_use]
    pub fn reload_datasets(&self) -> ReloadReport {
        let started = Instant::now();
        match self.load_datasets() {
            Ok(()) => ReloadReport {
                status: "success".to_string(),
                rule_set_version: Some(self.registry.version()),
                total_rules: Some(self.registry.rule_count()),
                reload_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                error: None,
            },
            Err(err) => {
                tracing::error!(error = %err, "dataset reload failed");
                ReloadReport {
                    status: "error".to_string(),
                    rule_set_version: None,
                    total_rules: None,
                    reload_time_ms: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Scan one request end to end. Never panics or errors outward; the
    /// fail policy decides what an internal failure looks like.
    pub async fn scan(&self, input: &PreparedInput) -> ScanOutcome {
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let deadline = Duration::from_millis(self.settings.chunk_processing_timeout_ms);

        match tokio::time::timeout(deadline, self.scan_inner(input, &snapshot, started)).await {
            Ok(Ok(result)) => ScanOutcome {
                result,
                disposition: ScanDisposition::Completed,
            },
            Ok(Err(err)) => {
                tracing::error!(error = %err, "scanner error");
                ScanOutcome {
                    result: self.failure_result(&snapshot, started, &err.to_string()),
                    disposition: ScanDisposition::Failed,
                }
            }
            Err(_) => {
                tracing::error!(
                    budget_ms = self.settings.chunk_processing_timeout_ms,
                    "scan deadline exceeded",
                );
                ScanOutcome {
                    result: self.failure_result(&snapshot, started, "scan deadline exceeded"),
                    disposition: ScanDisposition::TimedOut,
                }
            }
        }
    }

    async fn scan_inner(
        &self,
        input: &PreparedInput,
        snapshot: &Arc<RuleSnapshot>,
        started: Instant,
    ) -> Result<ScanResult, ScanError> {
        // 1. Hybrid prefilter over the raw request. Chunks are part of the
        // request: a payload hidden in retrieval context must not let the
        // user text short-circuit the scan.
        if self.settings.prefilter_enabled && snapshot.prefilter().is_enabled() {
            let prefilter_started = Instant::now();
            let (mut should_scan, keyword) = snapshot.prefilter().might_match(&input.user_input);
            if !should_scan && !input.external_chunks.is_empty() {
                let joined = input.external_chunks.join(" ");
                should_scan = snapshot.prefilter().might_match(&joined).0;
            }
            let prefilter_ms = prefilter_started.elapsed().as_secs_f64() * 1000.0;
            if !should_scan {
                tracing::debug!(prefilter_ms, "prefilter rejected input");
                return Ok(self.result(
                    snapshot,
                    started,
                    ScanStatus::Clean,
                    None,
                    Some(format!("passed prefilter check ({prefilter_ms:.2}ms)")),
                ));
            }
            tracing::debug!(?keyword, prefilter_ms, "prefilter keyword hit");
        }

        // 2. Normalize the user text.
        let normalized_user = self.normalizer.normalize(&input.user_input);

        // 3. Code detection on the normalized text.
        let verdict = self.detector.detect(&normalized_user);
        if verdict.is_code {
            return Ok(self.result(
                snapshot,
                started,
                ScanStatus::CleanCode,
                None,
                Some(format!(
                    "code detected ({}, confidence={:.2})",
                    verdict.reason, verdict.confidence,
                )),
            ));
        }

        // 4. Legacy keyword prefilter over user text and chunks.
        if self.settings.prefilter_enabled
            && !self.settings.prefilter_keywords.is_empty()
            && !self.legacy_prefilter_hit(&normalized_user, &input.external_chunks)
        {
            return Ok(self.result(
                snapshot,
                started,
                ScanStatus::Clean,
                None,
                Some("passed legacy prefilter check".to_string()),
            ));
        }

        // Ensemble overrides stop-on-first: collect everything, then decide.
        let ensemble = self.settings.ensemble_scoring;
        let stop_early = self.settings.stop_on_first_match && !ensemble;

        // 5. Normalize external chunks on the worker pool, order preserved.
        let normalized_chunks = self.normalize_chunks(&input.external_chunks).await?;

        // 6. Scan the user text.
        let user_match = self
            .scan_text(snapshot, normalized_user.clone(), MatchSource::UserInput)
            .await?;
        if stop_early && let Some(found) = &user_match {
            return Ok(self.result_from_match(snapshot, started, found));
        }

        // 7. Scan chunks concurrently; chunk index decides the first match.
        let chunk_matches = self
            .scan_chunks(snapshot, &normalized_chunks, stop_early)
            .await?;
        if stop_early && let Some(found) = chunk_matches.first() {
            return Ok(self.result_from_match(snapshot, started, found));
        }

        // 8. Scan the combined text to catch split payloads.
        let combined = std::iter::once(normalized_user.as_str())
            .chain(normalized_chunks.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let combined_match = self
            .scan_text(snapshot, combined, MatchSource::Combined)
            .await?;
        if stop_early && let Some(found) = &combined_match {
            return Ok(self.result_from_match(snapshot, started, found));
        }

        // 9. Ensemble decision over everything collected.
        if ensemble {
            let matches: Vec<RuleMatch> = user_match
                .into_iter()
                .chain(chunk_matches)
                .chain(combined_match)
                .collect();
            if !matches.is_empty() {
                return Ok(self.ensemble_result(snapshot, started, &matches));
            }
        }

        // 10. Nothing fired.
        Ok(self.result(snapshot, started, ScanStatus::Clean, None, None))
    }

    fn legacy_prefilter_hit(&self, normalized_user: &str, raw_chunks: &[String]) -> bool {
        let lowered = normalized_user.to_lowercase();
        if self
            .settings
            .prefilter_keywords
            .iter()
            .any(|kw| lowered.contains(kw.as_str()))
        {
            return true;
        }
        raw_chunks.iter().any(|chunk| {
            let chunk = chunk.to_lowercase();
            self.settings
                .prefilter_keywords
                .iter()
                .any(|kw| chunk.contains(kw.as_str()))
        })
    }

    /// Normalize chunks concurrently on the bounded pool, preserving order.
    async fn normalize_chunks(&self, chunks: &[String]) -> Result<Vec<String>, ScanError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut join_set = JoinSet::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| ScanError::Worker(e.to_string()))?;
            let normalizer = Arc::clone(&self.normalizer);
            let chunk = chunk.clone();
            join_set.spawn(async move {
                let outcome =
                    tokio::task::spawn_blocking(move || normalizer.normalize(&chunk)).await;
                drop(permit);
                (idx, outcome)
            });
        }

        let mut normalized = vec![String::new(); chunks.len()];
        while let Some(joined) = join_set.join_next().await {
            let (idx, outcome) = joined.map_err(|e| ScanError::Worker(e.to_string()))?;
            normalized[idx] = outcome.map_err(|e| ScanError::Worker(e.to_string()))?;
        }
        Ok(normalized)
    }

    /// Scan one text against every active rule on the blocking pool.
    async fn scan_text(
        &self,
        snapshot: &Arc<RuleSnapshot>,
        text: String,
        source: MatchSource,
    ) -> Result<Option<RuleMatch>, ScanError> {
        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        let snapshot = Arc::clone(snapshot);
        tokio::task::spawn_blocking(move || {
            scan_text_sync(&engine, &registry, &snapshot, &text, source)
        })
        .await
        .map_err(|e| ScanError::Worker(e.to_string()))
    }

    /// Scan all chunks concurrently. Results come back ordered by chunk
    /// index; under stop-on-first only the first match is returned.
    async fn scan_chunks(
        &self,
        snapshot: &Arc<RuleSnapshot>,
        chunks: &[String],
        stop_early: bool,
    ) -> Result<Vec<RuleMatch>, ScanError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut join_set = JoinSet::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| ScanError::Worker(e.to_string()))?;
            let engine = Arc::clone(&self.engine);
            let registry = Arc::clone(&self.registry);
            let snapshot = Arc::clone(snapshot);
            let chunk = chunk.clone();
            join_set.spawn(async move {
                let outcome = tokio::task::spawn_blocking(move || {
                    scan_text_sync(&engine, &registry, &snapshot, &chunk, MatchSource::Chunk(idx))
                })
                .await;
                drop(permit);
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<RuleMatch>> = vec![None; chunks.len()];
        while let Some(joined) = join_set.join_next().await {
            let (idx, outcome) = joined.map_err(|e| ScanError::Worker(e.to_string()))?;
            slots[idx] = outcome.map_err(|e| ScanError::Worker(e.to_string()))?;
        }

        let mut matches: Vec<RuleMatch> = slots.into_iter().flatten().collect();
        if stop_early {
            matches.truncate(1);
        }
        Ok(matches)
    }

    // ── Result construction ────────────────────────────────────────────

    fn result(
        &self,
        snapshot: &RuleSnapshot,
        started: Instant,
        status: ScanStatus,
        matched: Option<&RuleMatch>,
        note: Option<String>,
    ) -> ScanResult {
        ScanResult {
            status,
            audit_token: self.tokenizer.issue(snapshot.version()),
            rule_id: matched.map(|m| m.rule_id.clone()),
            dataset: matched.map(|m| m.dataset.clone()),
            severity: matched.map(|m| m.severity),
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            rule_set_version: snapshot.version().to_string(),
            scanner_version: SCANNER_VERSION.to_string(),
            note,
            ml_suspicion_score: None,
        }
    }

    fn result_from_match(
        &self,
        snapshot: &RuleSnapshot,
        started: Instant,
        found: &RuleMatch,
    ) -> ScanResult {
        let status = if found.severity.rejects() {
            ScanStatus::Rejected
        } else {
            ScanStatus::Warn
        };
        metrics::counter!(
            "layer0_rules_matched_total",
            "dataset" => found.dataset.clone(),
            "severity" => found.severity.to_string(),
        )
        .increment(1);
        self.result(
            snapshot,
            started,
            status,
            Some(found),
            Some(format!("matched in {}", found.source)),
        )
    }

    fn ensemble_result(
        &self,
        snapshot: &RuleSnapshot,
        started: Instant,
        matches: &[RuleMatch],
    ) -> ScanResult {
        #[allow(clippy::cast_precision_loss)]
        let score = matches.iter().map(|m| m.confidence).sum::<f64>() / matches.len() as f64;

        let status = if score >= self.settings.ensemble_threshold_reject {
            ScanStatus::Rejected
        } else if score >= self.settings.ensemble_threshold_warn {
            ScanStatus::Warn
        } else {
            ScanStatus::Clean
        };

        let top = matches
            .iter()
            .fold(&matches[0], |best, candidate| {
                if candidate.confidence > best.confidence {
                    candidate
                } else {
                    best
                }
            });

        self.result(
            snapshot,
            started,
            status,
            Some(top),
            Some(format!(
                "ensemble score: {score:.2} ({} matches)",
                matches.len(),
            )),
        )
    }

    fn failure_result(
        &self,
        snapshot: &RuleSnapshot,
        started: Instant,
        message: &str,
    ) -> ScanResult {
        let short: String = message.chars().take(100).collect();
        if self.settings.fail_open {
            self.result(
                snapshot,
                started,
                ScanStatus::Error,
                None,
                Some(format!("scanner error (fail-open): {short}")),
            )
        } else {
            self.result(
                snapshot,
                started,
                ScanStatus::ReviewRequired,
                None,
                Some(format!("scanner error (fail-closed): {short}")),
            )
        }
    }
}

/// Walk the severity-ordered rules, returning the first hit. Regex
/// timeouts skip the offending rule for this request only.
fn scan_text_sync(
    engine: &RegexEvaluator,
    registry: &RuleRegistry,
    snapshot: &RuleSnapshot,
    text: &str,
    source: MatchSource,
) -> Option<RuleMatch> {
    for rule in snapshot.active_rules() {
        let rule_started = Instant::now();
        match engine.search(&rule.pattern, text) {
            Ok(Some(found)) => {
                let elapsed_ms = rule_started.elapsed().as_secs_f64() * 1000.0;
                registry.record_match(&rule.id, elapsed_ms);
                return Some(RuleMatch {
                    rule_id: rule.id.clone(),
                    dataset: snapshot.dataset_of(&rule.id).to_string(),
                    severity: rule.severity,
                    matched_preview: redacted_preview(&found.text),
                    confidence: rule.impact_score,
                    source,
                });
            }
            Ok(None) => {}
            Err(RegexError::Timeout { .. }) => {
                metrics::counter!("layer0_regex_timeouts_total").increment(1);
                tracing::warn!(rule = %rule.id, "regex timeout, skipping rule");
            }
            Err(err) => {
                tracing::error!(rule = %rule.id, error = %err, "rule evaluation failed");
            }
        }
    }
    None
}

// ── Tests ──────────────────────────────────────────────────────────────
