//! Atomic rule-set snapshots and match statistics.
//!
//! The registry owns the published [`RuleSnapshot`]: the flattened set of
//! active+enabled rules, a version string derived from the contributing
//! datasets, and the prefilter built for exactly that rule set. Publication
//! is an atomic pointer swap: readers take one `Arc` and keep it for the
//! whole scan, so a reload never blocks in-flight readers and a scan begun
//! against version V reports V for its entire duration.
//!
//! Match statistics (per-rule counts and a bounded ring of execution
//! times) are best-effort, process-local, and survive reloads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{Dataset, DatasetMetadata, Rule};
use crate::prefilter::{HybridPrefilter, PrefilterStats};

/// Ring size for per-rule execution times.
const EXECUTION_RING: usize = 1000;

/// How many rules the statistics view lists.
const TOP_RULES: usize = 10;

// ── RuleSnapshot ───────────────────────────────────────────────────────

/// Immutable view of the active rule set, published atomically.
pub struct RuleSnapshot {
    rules: Vec<Arc<Rule>>,
    dataset_by_rule: HashMap<String, String>,
    dataset_meta: Vec<DatasetMetadata>,
    version: String,
    loaded_at: SystemTime,
    prefilter: HybridPrefilter,
}

impl std::fmt::Debug for RuleSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSnapshot")
            .field("version", &self.version)
            .field("rules", &self.rules.len())
            .field("datasets", &self.dataset_meta.len())
            .finish()
    }
}

impl RuleSnapshot {
    /// The snapshot a fresh registry starts with: no rules, version `0.0.0`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            dataset_by_rule: HashMap::new(),
            dataset_meta: Vec::new(),
            version: "0.0.0".to_string(),
            loaded_at: UNIX_EPOCH,
            prefilter: HybridPrefilter::disabled(),
        }
    }

    fn build(datasets: Vec<Dataset>) -> Self {
        let mut rules: Vec<Arc<Rule>> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut dataset_by_rule: HashMap<String, String> = HashMap::new();
        let mut dataset_meta = Vec::with_capacity(datasets.len());

        for dataset in datasets {
            for rule in &dataset.rules {
                if !rule.is_scannable() {
                    continue;
                }
                dataset_by_rule.insert(rule.id.clone(), dataset.metadata.name.clone());
                let shared = Arc::new(rule.clone());
                match position.get(&rule.id) {
                    // A later dataset redefining an id replaces the rule in
                    // place, keeping the original ordering slot.
                    Some(&idx) => rules[idx] = shared,
                    None => {
                        position.insert(rule.id.clone(), rules.len());
                        rules.push(shared);
                    }
                }
            }
            dataset_meta.push(dataset.metadata);
        }

        // Critical first; ties keep insertion order.
        rules.sort_by_key(|r| r.severity.rank());

        let version = derive_version(&dataset_meta);
        let prefilter = HybridPrefilter::build_from_rules(rules.iter().map(Arc::as_ref));

        Self {
            rules,
            dataset_by_rule,
            dataset_meta,
            version,
            loaded_at: SystemTime::now(),
            prefilter,
        }
    }

    /// Active rules sorted by severity (critical → low, ties by insertion).
    #[must_use]
    pub fn active_rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Look up a rule by id.
    #[must_use]
    pub fn rule(&self, rule_id: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    /// Which dataset a rule came from.
    #[must_use]
    pub fn dataset_of(&self, rule_id: &str) -> &str {
        self.dataset_by_rule
            .get(rule_id)
            .map_or("unknown", String::as_str)
    }

    /// Version string of this snapshot (`ruleset-{8 hex}` or `0.0.0`).
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The prefilter built for this snapshot's rules.
    #[must_use]
    pub fn prefilter(&self) -> &HybridPrefilter {
        &self.prefilter
    }

    /// Number of active rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Number of contributing datasets.
    #[must_use]
    pub fn dataset_count(&self) -> usize {
        self.dataset_meta.len()
    }

    /// When this snapshot was published.
    #[must_use]
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }
}

/// `ruleset-{short-hash}`: first 8 hex chars of SHA-256 over the sorted
/// `{name}:{version}` multiset.
fn derive_version(datasets: &[DatasetMetadata]) -> String {
    if datasets.is_empty() {
        return "0.0.0".to_string();
    }
    let mut parts: Vec<String> = datasets
        .iter()
        .map(|m| format!("{}:{}", m.name, m.version))
        .collect();
    parts.sort();

    let digest = Sha256::digest(parts.join("|").as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("ruleset-{short}")
}

// ── Statistics ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MatchStats {
    match_counts: HashMap<String, u64>,
    execution_times: HashMap<String, VecDeque<f64>>,
}

/// Serializable statistics view for `/stats`.
#[derive(Debug, Serialize)]
pub struct RegistryStats {
    /// Current snapshot version.
    pub version: String,
    /// Snapshot publication time, seconds since the epoch.
    pub load_timestamp: f64,
    /// Contributing datasets in the current snapshot.
    pub total_datasets: usize,
    /// Active rules in the current snapshot.
    pub total_rules: usize,
    /// Matches recorded since process start.
    pub total_matches: u64,
    /// Most-matched rules, descending.
    pub top_matched_rules: Vec<TopRule>,
    /// Mean execution time per rule over the bounded ring.
    pub avg_execution_times: HashMap<String, f64>,
    /// Prefilter state for the current snapshot.
    pub prefilter: PrefilterStats,
}

/// One entry in the top-matched list.
#[derive(Debug, Serialize)]
pub struct TopRule {
    /// Rule identifier.
    pub rule_id: String,
    /// Match count.
    pub count: u64,
}

// ── RuleRegistry ───────────────────────────────────────────────────────

/// Owns the published snapshot and the match statistics.
pub struct RuleRegistry {
    snapshot: ArcSwap<RuleSnapshot>,
    stats: Mutex<MatchStats>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRegistry {
    /// A registry holding the empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot::empty()),
            stats: Mutex::new(MatchStats::default()),
        }
    }

    /// Build a snapshot from validated datasets and publish it atomically.
    ///
    /// Readers holding the previous snapshot are unaffected; the next call
    /// to [`RuleRegistry::snapshot`] observes the new one.
    pub fn load_datasets(&self, datasets: Vec<Dataset>) -> Arc<RuleSnapshot> {
        let next = Arc::new(RuleSnapshot::build(datasets));
        self.snapshot.store(Arc::clone(&next));
        tracing::info!(
            rules = next.rule_count(),
            datasets = next.dataset_count(),
            version = %next.version(),
            "rule snapshot published",
        );
        next
    }

    /// Take a reference to the current snapshot. Cheap; hold it for the
    /// duration of one scan.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.load_full()
    }

    /// Current snapshot version.
    #[must_use]
    pub fn version(&self) -> String {
        self.snapshot.load().version().to_string()
    }

    /// Active rule count in the current snapshot.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.snapshot.load().rule_count()
    }

    /// Dataset count in the current snapshot.
    #[must_use]
    pub fn dataset_count(&self) -> usize {
        self.snapshot.load().dataset_count()
    }

    /// Record a rule match with its execution time, bounded per rule.
    pub fn record_match(&self, rule_id: &str, execution_time_ms: f64) {
        let mut stats = self.stats.lock();
        *stats.match_counts.entry(rule_id.to_string()).or_insert(0) += 1;
        let ring = stats
            .execution_times
            .entry(rule_id.to_string())
            .or_default();
        ring.push_back(execution_time_ms);
        while ring.len() > EXECUTION_RING {
            ring.pop_front();
        }
    }

    /// Statistics snapshot for `/stats`.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot.load();
        let stats = self.stats.lock();

        let total_matches = stats.match_counts.values().sum();

        let mut top: Vec<TopRule> = stats
            .match_counts
            .iter()
            .map(|(rule_id, count)| TopRule {
                rule_id: rule_id.clone(),
                count: *count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.rule_id.cmp(&b.rule_id)));
        top.truncate(TOP_RULES);

        #[allow(clippy::cast_precision_loss)]
        let avg_execution_times = stats
            .execution_times
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(rule_id, ring)| {
                let mean = ring.iter().sum::<f64>() / ring.len() as f64;
                (rule_id.clone(), mean)
            })
            .collect();

        RegistryStats {
            version: snapshot.version().to_string(),
            load_timestamp: snapshot
                .loaded_at()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            total_datasets: snapshot.dataset_count(),
            total_rules: snapshot.rule_count(),
            total_matches,
            top_matched_rules: top,
            avg_execution_times,
            prefilter: snapshot.prefilter().stats(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleState, Severity};

    fn rule(id: &str, severity: Severity, state: RuleState, enabled: bool) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            pattern: format!("(?i){id}"),
            severity,
            state,
            enabled,
            impact_score: 0.9,
            tags: vec![],
            positive_tests: vec![],
            negative_tests: vec![],
        }
    }

    fn dataset(name: &str, version: &str, rules: Vec<Rule>) -> Dataset {
        Dataset {
            metadata: DatasetMetadata {
                name: name.to_string(),
                version: version.to_string(),
                source: "test".to_string(),
                last_updated: "unknown".to_string(),
                total_rules: rules.len(),
                dataset_build_id: format!("{name}-{version}"),
                hmac_signature: None,
            },
            rules,
        }
    }

    #[test]
    fn empty_registry_has_sentinel_version() {
        let registry = RuleRegistry::new();
        assert_eq!(registry.version(), "0.0.0");
        assert_eq!(registry.rule_count(), 0);
    }

    #[test]
    fn only_active_enabled_rules_load() {
        let registry = RuleRegistry::new();
        registry.load_datasets(vec![dataset(
            "d1",
            "1",
            vec![
                rule("live", Severity::High, RuleState::Active, true),
                rule("off", Severity::High, RuleState::Active, false),
                rule("draft", Severity::High, RuleState::Draft, true),
                rule("gone", Severity::High, RuleState::Quarantined, true),
            ],
        )]);
        assert_eq!(registry.rule_count(), 1);
        assert_eq!(registry.snapshot().active_rules()[0].id, "live");
    }

    #[test]
    fn rules_sorted_by_severity_stable() {
        let registry = RuleRegistry::new();
        registry.load_datasets(vec![dataset(
            "d1",
            "1",
            vec![
                rule("low-a", Severity::Low, RuleState::Active, true),
                rule("crit-a", Severity::Critical, RuleState::Active, true),
                rule("med-a", Severity::Medium, RuleState::Active, true),
                rule("crit-b", Severity::Critical, RuleState::Active, true),
                rule("high-a", Severity::High, RuleState::Active, true),
            ],
        )]);
        let snapshot = registry.snapshot();
        let order: Vec<&str> = snapshot.active_rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["crit-a", "crit-b", "high-a", "med-a", "low-a"]);
    }

    #[test]
    fn version_is_deterministic_and_order_independent() {
        let a = dataset("alpha", "1", vec![rule("r1", Severity::High, RuleState::Active, true)]);
        let b = dataset("beta", "2", vec![rule("r2", Severity::Low, RuleState::Active, true)]);

        let r1 = RuleRegistry::new();
        let v1 = r1.load_datasets(vec![a.clone(), b.clone()]).version().to_string();
        let r2 = RuleRegistry::new();
        let v2 = r2.load_datasets(vec![b, a]).version().to_string();

        assert_eq!(v1, v2);
        assert!(v1.starts_with("ruleset-"));
        assert_eq!(v1.len(), "ruleset-".len() + 8);
    }

    #[test]
    fn version_changes_with_dataset_version() {
        let registry = RuleRegistry::new();
        let v1 = registry
            .load_datasets(vec![dataset("d", "1", vec![])])
            .version()
            .to_string();
        let v2 = registry
            .load_datasets(vec![dataset("d", "2", vec![])])
            .version()
            .to_string();
        assert_ne!(v1, v2);
    }

    #[test]
    fn snapshot_survives_reload() {
        let registry = RuleRegistry::new();
        registry.load_datasets(vec![dataset(
            "d1",
            "1",
            vec![rule("r1", Severity::High, RuleState::Active, true)],
        )]);
        let pinned = registry.snapshot();
        let pinned_version = pinned.version().to_string();

        registry.load_datasets(vec![dataset(
            "d1",
            "2",
            vec![rule("r2", Severity::High, RuleState::Active, true)],
        )]);

        // The pinned snapshot still sees the old world.
        assert_eq!(pinned.version(), pinned_version);
        assert_eq!(pinned.active_rules()[0].id, "r1");
        // The registry sees the new one.
        assert_eq!(registry.snapshot().active_rules()[0].id, "r2");
    }

    #[test]
    fn duplicate_rule_id_replaced_in_place() {
        let registry = RuleRegistry::new();
        let mut replacement = rule("shared", Severity::High, RuleState::Active, true);
        replacement.impact_score = 0.5;
        registry.load_datasets(vec![
            dataset("d1", "1", vec![rule("shared", Severity::High, RuleState::Active, true)]),
            dataset("d2", "1", vec![replacement]),
        ]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.rule_count(), 1);
        assert!((snapshot.active_rules()[0].impact_score - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.dataset_of("shared"), "d2");
    }

    #[test]
    fn match_stats_accumulate_and_bound() {
        let registry = RuleRegistry::new();
        registry.load_datasets(vec![dataset(
            "d1",
            "1",
            vec![rule("r1", Severity::High, RuleState::Active, true)],
        )]);

        for i in 0..1100 {
            registry.record_match("r1", f64::from(i));
        }
        let stats = registry.stats();
        assert_eq!(stats.total_matches, 1100);
        assert_eq!(stats.top_matched_rules[0].rule_id, "r1");
        // Ring keeps the most recent 1000 samples: 100..1099, mean 599.5.
        let avg = stats.avg_execution_times["r1"];
        assert!((avg - 599.5).abs() < 1e-9, "avg = {avg}");
    }

    #[test]
    fn dataset_of_unknown_rule() {
        let snapshot = RuleSnapshot::empty();
        assert_eq!(snapshot.dataset_of("nope"), "unknown");
    }
}
