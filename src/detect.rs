//! Heuristic source-code detection.
//!
//! Legitimate code pasted into a prompt trips injection rules constantly
//! (`system`, `override`, `instructions` are ordinary identifiers), so the
//! scanner bypasses rule matching when input is confidently code. A fenced
//! code block is treated as deterministic proof; otherwise three weighted
//! features decide: indentation shape, code-punctuation density, and
//! programming-keyword frequency across six common languages.

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::config::Settings;

/// Triple-backtick fence with optional language tag. Tolerates collapsed
/// whitespace: the detector runs on normalized text where newlines may have
/// become spaces.
static FENCED_BLOCK: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```[A-Za-z0-9_+-]*\s.*?```").unwrap());

static WORD: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\w+").unwrap());

/// Punctuation characteristic of source code.
const CODE_PUNCT: &str = "{}[]();:,.<>!@#$%^&*-+=|\\/?";

/// Keywords for six common languages, merged into one lookup set.
static LANGUAGE_KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    let python = [
        "def", "class", "import", "from", "return", "if", "else", "elif", "for", "while", "try",
        "except", "finally", "with", "as", "lambda", "yield", "async", "await", "raise", "assert",
        "pass", "break", "continue",
    ];
    let javascript = [
        "function", "const", "let", "var", "switch", "case", "catch", "extends", "export",
    ];
    let java = [
        "public", "private", "protected", "interface", "implements", "static", "final", "void",
        "throw",
    ];
    let sql = [
        "select", "where", "insert", "update", "delete", "create", "drop", "alter", "table",
        "join", "inner", "outer", "left", "right", "group", "order", "by", "having", "limit",
        "offset",
    ];
    let go = [
        "func", "package", "type", "struct", "range", "defer", "go", "chan",
    ];
    let rust = [
        "fn", "mut", "enum", "impl", "trait", "use", "mod", "pub", "match", "loop",
    ];

    python
        .into_iter()
        .chain(javascript)
        .chain(java)
        .chain(sql)
        .chain(go)
        .chain(rust)
        .collect()
});

// ── CodeVerdict ────────────────────────────────────────────────────────

/// Outcome of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeVerdict {
    /// Combined score met the configured threshold.
    pub is_code: bool,
    /// Combined score in `[0, 1]`.
    pub confidence: f64,
    /// Names the dominant feature, or `fenced_code_block`.
    pub reason: String,
}

// ── CodeDetector ───────────────────────────────────────────────────────

/// Deterministic code detector combining three weighted features:
/// `0.4·indent + 0.3·punct + 0.3·keywords`.
#[derive(Debug, Clone)]
pub struct CodeDetector {
    enabled: bool,
    confidence_threshold: f64,
}

impl Default for CodeDetector {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
        }
    }
}

impl CodeDetector {
    /// Build a detector with the default threshold (0.7).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a detector from runtime settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.code_detection_enabled,
            confidence_threshold: settings.code_confidence_threshold,
        }
    }

    /// Classify `text`.
    ///
    /// Short-circuits to `(true, 1.0, "fenced_code_block")` on any
    /// triple-backtick-delimited block.
    #[must_use]
    pub fn detect(&self, text: &str) -> CodeVerdict {
        if !self.enabled {
            return CodeVerdict {
                is_code: false,
                confidence: 0.0,
                reason: "code_detection_disabled".to_string(),
            };
        }

        if FENCED_BLOCK.is_match(text) {
            return CodeVerdict {
                is_code: true,
                confidence: 1.0,
                reason: "fenced_code_block".to_string(),
            };
        }

        let indent = indentation_score(text);
        let punct = punctuation_score(text);
        let keywords = keyword_score(text);

        let confidence = 0.4 * indent + 0.3 * punct + 0.3 * keywords;
        let is_code = confidence >= self.confidence_threshold;

        CodeVerdict {
            is_code,
            confidence,
            reason: dominant_feature(indent, punct, keywords),
        }
    }
}

// ── Feature scores ─────────────────────────────────────────────────────

/// Fraction of non-blank lines starting with four spaces or a tab, mapped
/// piecewise.
fn indentation_score(text: &str) -> f64 {
    let mut indented = 0usize;
    let mut non_blank = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        non_blank += 1;
        if line.starts_with("    ") || line.starts_with('\t') {
            indented += 1;
        }
    }
    if non_blank == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = indented as f64 / non_blank as f64;
    piecewise(ratio, 0.5, 0.3, 0.1)
}

/// Ratio of code punctuation to non-whitespace characters, mapped piecewise.
fn punctuation_score(text: &str) -> f64 {
    let mut punct = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        if c == ' ' || c == '\n' {
            continue;
        }
        total += 1;
        if CODE_PUNCT.contains(c) {
            punct += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = punct as f64 / total as f64;
    piecewise(ratio, 0.3, 0.2, 0.1)
}

/// Fraction of tokens that are programming keywords, mapped piecewise.
fn keyword_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let mut hits = 0usize;
    let mut words = 0usize;
    for m in WORD.find_iter(&lowered) {
        words += 1;
        if LANGUAGE_KEYWORDS.contains(m.as_str()) {
            hits += 1;
        }
    }
    if words == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = hits as f64 / words as f64;
    piecewise(ratio, 0.2, 0.1, 0.05)
}

fn piecewise(ratio: f64, full: f64, strong: f64, weak: f64) -> f64 {
    if ratio >= full {
        1.0
    } else if ratio >= strong {
        0.7
    } else if ratio >= weak {
        0.4
    } else {
        0.0
    }
}

fn dominant_feature(indent: f64, punct: f64, keywords: f64) -> String {
    let (name, _) = [
        ("indentation", indent),
        ("token_ratio", punct),
        ("keywords", keywords),
    ]
    .into_iter()
    .fold(("indentation", f64::MIN), |best, candidate| {
        if candidate.1 > best.1 { candidate } else { best }
    });
    format!("code_detected_{name}")
}

// ── Tests ──────────────────────────────────────────────────────────────
