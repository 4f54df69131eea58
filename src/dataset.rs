//! Rule-bundle parsing, validation, and authentication.
//!
//! A bundle is one YAML file with a `metadata` section and a `rules` list
//! (see `datasets/prompt-injection.yaml` for the shipped example). The
//! loader tolerates a minimal "import" metadata shape (missing fields are
//! auto-filled and a synthetic `dataset_build_id` is computed) and a
//! shortened rule schema with defaults for `state`, `enabled`,
//! `impact_score`, `tags`, `name`, and the sample lists.
//!
//! Authentication: when `metadata.hmac_signature` is present, the loader
//! recomputes HMAC-SHA256 over the canonical serialization of the bundle
//! (keys sorted lexicographically, signature field elided) and refuses the
//! bundle on mismatch under fail-closed. A bundle *without* a signature is
//! accepted with a warning in both modes so that bootstrapping is possible;
//! operators who require signatures should monitor for that warning.

use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use validator::Validate;

use crate::config::Settings;
use crate::engine::RegexEvaluator;
use crate::model::{Dataset, DatasetMetadata, Rule, RuleState, Severity};

type HmacSha256 = Hmac<Sha256>;

// ── DatasetError ───────────────────────────────────────────────────────

/// Errors raised while loading rule bundles.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The bundle file could not be read.
    #[error("failed to read bundle at {}: {source}", path.display())]
    Io {
        /// Bundle path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The bundle is not valid YAML.
    #[error("failed to parse bundle at {}: {source}", path.display())]
    Parse {
        /// Bundle path.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_yaml::Error,
    },

    /// Structural or authentication failure. Under fail-closed this aborts
    /// the whole reload and the previous snapshot is preserved.
    #[error("dataset integrity error: {message}")]
    Integrity {
        /// What failed.
        message: String,
    },
}

impl DatasetError {
    fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

// ── Tolerant raw shapes ────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct RawBundle {
    metadata: RawMetadata,
    rules: Vec<RawRule>,
}

#[derive(serde::Deserialize)]
struct RawMetadata {
    name: String,
    version: String,
    source: String,
    last_updated: Option<String>,
    total_rules: Option<usize>,
    dataset_build_id: Option<String>,
    hmac_signature: Option<String>,
}

impl RawMetadata {
    fn resolve(self) -> DatasetMetadata {
        let build_id = self
            .dataset_build_id
            .unwrap_or_else(|| format!("{}-{}", self.name, self.version));
        DatasetMetadata {
            name: self.name,
            version: self.version,
            source: self.source,
            last_updated: self.last_updated.unwrap_or_else(|| "unknown".to_string()),
            total_rules: self.total_rules.unwrap_or(0),
            dataset_build_id: build_id,
            hmac_signature: self.hmac_signature,
        }
    }
}

#[derive(serde::Deserialize)]
struct RawRule {
    id: String,
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    pattern: String,
    severity: Severity,
    category: Option<String>,
    state: Option<RuleState>,
    enabled: Option<bool>,
    impact_score: Option<f64>,
    tags: Option<Vec<String>>,
    positive_tests: Option<Vec<String>>,
    negative_tests: Option<Vec<String>>,
}

impl RawRule {
    fn resolve(self) -> Rule {
        let impact = self.impact_score.unwrap_or(match self.severity {
            Severity::Critical => 1.0,
            _ => 0.8,
        });
        let tags = self
            .tags
            .or_else(|| self.category.clone().map(|c| vec![c]))
            .unwrap_or_default();
        Rule {
            name: self.name.unwrap_or_else(|| format!("Rule {}", self.id)),
            id: self.id,
            description: self.description.unwrap_or_default(),
            pattern: self.pattern,
            severity: self.severity,
            state: self.state.unwrap_or(RuleState::Active),
            enabled: self.enabled.unwrap_or(true),
            impact_score: impact,
            tags,
            positive_tests: self.positive_tests.unwrap_or_default(),
            negative_tests: self.negative_tests.unwrap_or_default(),
        }
    }
}

// ── Canonical form & signatures ────────────────────────────────────────

/// Canonical byte form used for signing: the document converted to JSON
/// with `metadata.hmac_signature` removed. `serde_json` maps are ordered,
/// so every object serializes with lexicographically sorted keys and the
/// canonical form is stable across round-trips.
///
/// # Errors
///
/// Returns [`DatasetError::Integrity`] when the document cannot be
/// represented as JSON (non-string mapping keys).
pub fn canonical_signable(doc: &serde_yaml::Value) -> Result<String, DatasetError> {
    let mut json = serde_json::to_value(doc)
        .map_err(|e| DatasetError::integrity(format!("bundle is not canonicalizable: {e}")))?;
    if let Some(metadata) = json.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata.remove("hmac_signature");
    }
    serde_json::to_string(&json)
        .map_err(|e| DatasetError::integrity(format!("bundle is not canonicalizable: {e}")))
}

/// Compute the hex HMAC-SHA256 signature for a bundle document.
///
/// Exposed so operators (and tests) can sign bundles with the same
/// canonicalization the verifier uses.
///
/// # Errors
///
/// Returns [`DatasetError::Integrity`] when canonicalization fails.
pub fn compute_signature(doc: &serde_yaml::Value, secret: &[u8]) -> Result<String, DatasetError> {
    let canonical = canonical_signable(doc)?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| DatasetError::integrity(format!("invalid HMAC key: {e}")))?;
    mac.update(canonical.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ── DatasetLoader ──────────────────────────────────────────────────────

/// Loads and validates every `*.yaml` bundle in the dataset directory.
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    dataset_path: PathBuf,
    secret: Vec<u8>,
    fail_open: bool,
}

impl DatasetLoader {
    /// Build a loader from runtime settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dataset_path: PathBuf::from(&settings.dataset_path),
            secret: settings.dataset_hmac_secret.as_bytes().to_vec(),
            fail_open: settings.fail_open,
        }
    }

    /// Build a loader with explicit parameters (test hook).
    #[must_use]
    pub fn new(dataset_path: impl Into<PathBuf>, secret: &[u8], fail_open: bool) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            secret: secret.to_vec(),
            fail_open,
        }
    }

    /// Load every bundle in the dataset directory, in filename order.
    ///
    /// A missing directory is a warning and yields no datasets. Under
    /// fail-open, individual broken bundles are skipped with an error log;
    /// under fail-closed any broken bundle aborts the whole load so a
    /// reload never publishes a partial snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] for the first broken bundle when
    /// `fail_open` is `false`.
    pub fn load_all(&self, engine: &RegexEvaluator) -> Result<Vec<Dataset>, DatasetError> {
        if !self.dataset_path.exists() {
            tracing::warn!(path = %self.dataset_path.display(), "dataset path does not exist");
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dataset_path)
            .map_err(|source| DatasetError::Io {
                path: self.dataset_path.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        paths.sort();

        let mut datasets = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_bundle(&path, engine) {
                Ok(dataset) => datasets.push(dataset),
                Err(err) if self.fail_open => {
                    tracing::error!(path = %path.display(), error = %err, "skipping broken bundle (fail-open)");
                }
                Err(err) => {
                    return Err(DatasetError::integrity(format!(
                        "failed to load bundle '{}': {err}",
                        path.display(),
                    )));
                }
            }
        }
        Ok(datasets)
    }

    /// Load and validate a single bundle file.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] on unreadable files, malformed YAML,
    /// missing sections, invalid rules, or (fail-closed) a bad signature.
    pub fn load_bundle(&self, path: &Path, engine: &RegexEvaluator) -> Result<Dataset, DatasetError> {
        tracing::info!(path = %path.display(), "loading dataset bundle");

        let raw_text = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&raw_text).map_err(|source| DatasetError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if doc.as_mapping().is_none() {
            return Err(DatasetError::integrity("bundle must be a YAML mapping"));
        }
        if doc.get("metadata").is_none() {
            return Err(DatasetError::integrity("bundle missing 'metadata' section"));
        }
        if doc.get("rules").is_none() {
            return Err(DatasetError::integrity("bundle missing 'rules' section"));
        }

        let raw: RawBundle = serde_yaml::from_value(doc.clone()).map_err(|e| {
            DatasetError::integrity(format!("bundle has invalid structure: {e}"))
        })?;

        let mut metadata = raw.metadata.resolve();
        self.verify_signature(&doc, &metadata)?;

        let mut rules = Vec::with_capacity(raw.rules.len());
        for (idx, raw_rule) in raw.rules.into_iter().enumerate() {
            let rule = raw_rule.resolve();
            rule.validate().map_err(|e| {
                DatasetError::integrity(format!("invalid rule at index {idx}: {e}"))
            })?;
            rules.push(rule);
        }

        self.validate_rules(&mut rules, engine);
        reconcile_rule_count(&mut metadata, rules.len());

        tracing::info!(
            dataset = %metadata.name,
            version = %metadata.version,
            rules = rules.len(),
            "bundle loaded",
        );

        Ok(Dataset { metadata, rules })
    }

    fn verify_signature(
        &self,
        doc: &serde_yaml::Value,
        metadata: &DatasetMetadata,
    ) -> Result<(), DatasetError> {
        let Some(signature) = metadata.hmac_signature.as_deref() else {
            tracing::warn!(
                dataset = %metadata.name,
                "bundle has no HMAC signature; accepting for bootstrap",
            );
            return Ok(());
        };

        let canonical = canonical_signable(doc)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| DatasetError::integrity(format!("invalid HMAC key: {e}")))?;
        mac.update(canonical.as_bytes());

        let verified = hex_decode(signature)
            .is_some_and(|expected| mac.verify_slice(&expected).is_ok());
        if verified {
            tracing::info!(dataset = %metadata.name, "HMAC verification passed");
            return Ok(());
        }

        if self.fail_open {
            tracing::warn!(
                dataset = %metadata.name,
                "HMAC verification failed; accepting under fail-open",
            );
            Ok(())
        } else {
            Err(DatasetError::integrity(format!(
                "HMAC verification failed for dataset '{}'",
                metadata.name,
            )))
        }
    }

    /// Compile every rule's pattern and execute its samples. A pattern that
    /// compiles under no engine disables its rule for this load; sample
    /// discrepancies are logged and never gate loading.
    fn validate_rules(&self, rules: &mut [Rule], engine: &RegexEvaluator) {
        let mut disabled = 0usize;
        for rule in rules.iter_mut() {
            if let Err(err) = engine.compile(&rule.pattern) {
                tracing::warn!(rule = %rule.id, error = %err, "invalid pattern, disabling rule");
                rule.enabled = false;
                disabled += 1;
                continue;
            }

            for sample in &rule.positive_tests {
                match engine.search(&rule.pattern, sample) {
                    Ok(Some(_)) => {}
                    Ok(None) => tracing::warn!(
                        rule = %rule.id,
                        "positive sample failed to match",
                    ),
                    Err(err) => tracing::error!(
                        rule = %rule.id,
                        error = %err,
                        "positive sample errored",
                    ),
                }
            }
            for sample in &rule.negative_tests {
                match engine.search(&rule.pattern, sample) {
                    Ok(None) => {}
                    Ok(Some(_)) => tracing::warn!(
                        rule = %rule.id,
                        "negative sample matched (false positive)",
                    ),
                    Err(err) => tracing::error!(
                        rule = %rule.id,
                        error = %err,
                        "negative sample errored",
                    ),
                }
            }
        }
        if disabled > 0 {
            tracing::warn!(count = disabled, "disabled rules with invalid patterns");
        }
    }
}

fn reconcile_rule_count(metadata: &mut DatasetMetadata, actual: usize) {
    if metadata.total_rules == 0 {
        metadata.total_rules = actual;
    } else if metadata.total_rules != actual {
        tracing::warn!(
            dataset = %metadata.name,
            declared = metadata.total_rules,
            actual,
            "rule count mismatch, auto-correcting",
        );
        metadata.total_rules = actual;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
