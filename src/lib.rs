//! ```text
//! PreparedInput ──► ScanService ──► Scanner
//!                                     │
//!                                     ├─► HybridPrefilter (Bloom + Aho-Corasick)
//!                                     ├─► Normalizer (ten-stage cleaner)
//!                                     ├─► CodeDetector (fenced blocks, heuristics)
//!                                     ├─► RegexEvaluator × RuleSnapshot
//!                                     │     over {user, chunk_i, combined}
//!                                     └─► AuditTokenizer ──► ScanResult
//!
//! DatasetLoader ──► RuleRegistry ──► RuleSnapshot (atomic swap, hot-reload)
//! ```
//!
//! # layer0
//!
//! **Rule-driven inspection engine that screens LLM input before it reaches
//! the model.**
//!
//! `layer0` sits in front of a language model and decides, per request,
//! whether to pass, flag, or reject the input. The engine combines a
//! high-speed approximate prefilter, a multi-stage Unicode/text normalizer,
//! a deterministic code detector that bypasses scanning for legitimate
//! source, and a budgeted regex evaluator running hot-reloadable rule
//! bundles. The same scan fans out across the primary user text, every
//! external (retrieval/file) chunk, and their concatenation, so payloads
//! split across sources are still caught.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use layer0::prelude::*;
//!
//! let settings = Settings::from_env()?;
//! let scanner = Scanner::new(settings.clone());
//! scanner.load_datasets()?;
//!
//! let input = PreparedInput::new("what is the capital of France?", vec![]);
//! let outcome = scanner.scan(&input).await;
//! assert_eq!(outcome.result.status, ScanStatus::Clean);
//! ```
//!
//! ## Modules
//!
//! - [`config`] – Environment-sourced settings (`L0_*`) with secure defaults
//! - [`model`] – Wire contracts and internal types (`PreparedInput`, `Rule`, `ScanResult`)
//! - [`engine`] – Budgeted regex evaluation with engine selection and caching
//! - [`normalize`] – Ten-stage deterministic text normalization
//! - [`detect`] – Heuristic source-code detection
//! - [`dataset`] – Rule-bundle parsing, validation, and HMAC authentication
//! - [`registry`] – Atomic rule-set snapshots and match statistics
//! - [`prefilter`] – Bloom + Aho-Corasick approximate literal prefilter
//! - [`scanner`] – Per-request orchestration across all scan scopes
//! - [`audit`] – Opaque HMAC-anchored scan identifiers
//! - [`service`] – HTTP boundary: rate limits, circuit breaker, probes, metrics

#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod dataset;
pub mod detect;
pub mod engine;
pub mod model;
pub mod normalize;
pub mod prefilter;
pub mod registry;
pub mod scanner;
pub mod service;

/// Re-exports for convenient access to core types.
pub mod prelude {
    pub use crate::config::{ConfigError, EnginePreference, Settings};
    pub use crate::dataset::{DatasetError, DatasetLoader};
    pub use crate::engine::{RegexError, RegexEvaluator};
    pub use crate::model::{
        Dataset, DatasetMetadata, PreparedInput, Rule, RuleMatch, RuleState, ScanResult,
        ScanStatus, Severity,
    };
    pub use crate::normalize::Normalizer;
    pub use crate::registry::RuleRegistry;
    pub use crate::scanner::Scanner;
    pub use crate::service::ServerContext;
}
