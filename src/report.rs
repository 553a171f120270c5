//! Report data model
//!
//! The report structure is always well-formed: every string field is present
//! and `principal_findings` is non-empty, even on the degraded path where the
//! content is a truncated echo of raw backend output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much to trust the report content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Produced by a structured parse of the backend response.
    High,
    /// Produced by the parser's last-resort recovery strategy.
    Degraded,
}

impl Confidence {
    pub fn label(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Degraded => "degraded",
        }
    }
}

/// A generated analytical report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub executive_summary: String,
    pub principal_findings: Vec<String>,
    /// Named analytic sections, e.g. "pca_analysis", "heatmap_analysis".
    /// Multi-paragraph bodies keep their paragraph breaks.
    #[serde(default)]
    pub analytic_sections: BTreeMap<String, String>,
    pub confidence: Confidence,
}

impl Report {
    /// Required-field check applied to every parse-strategy candidate.
    pub fn is_structurally_valid(&self) -> bool {
        !self.executive_summary.trim().is_empty()
            && !self.principal_findings.is_empty()
            && self.principal_findings.iter().any(|f| !f.trim().is_empty())
    }

    /// Whether any finding carries quantitative content (used by the ranker's
    /// quality heuristics via the performance log).
    pub fn has_quantitative_content(&self) -> bool {
        self.principal_findings
            .iter()
            .chain(std::iter::once(&self.executive_summary))
            .any(|text| text.chars().any(|c| c.is_ascii_digit()))
    }

    /// Total character count of user-visible content.
    pub fn content_chars(&self) -> usize {
        self.executive_summary.chars().count()
            + self
                .principal_findings
                .iter()
                .map(|f| f.chars().count())
                .sum::<usize>()
            + self
                .analytic_sections
                .values()
                .map(|s| s.chars().count())
                .sum::<usize>()
    }
}

/// Provenance of the winning generation attempt, persisted with the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub token_count: u32,
    /// 1-based position in the fallback chain.
    pub attempt_number: u32,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Pre-computed statistical summaries supplied by the external aggregator.
///
/// Opaque to this crate: never mutated, only serialized into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub data: serde_json::Value,
}

impl AnalysisPayload {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data }
    }
}
