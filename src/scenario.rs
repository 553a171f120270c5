//! Scenario identification
//!
//! A scenario is one (subject, sources, language, options) combination. The
//! key is a SHA-256 digest over a normalized encoding, so source-set order
//! never affects the key and repeated requests hit the same cache entry.

use crate::error::ReportError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Opaque 256-bit scenario digest, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioKey(String);

impl ScenarioKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScenarioKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request parameters that identify a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioParams {
    /// Canonical, language-independent subject identifier supplied upstream.
    pub subject: String,
    /// Data-source identifiers; treated as a set.
    pub sources: Vec<String>,
    /// Output language code for the report.
    pub language: String,
    /// Report-variant options (depth, audience, etc.).
    pub options: BTreeMap<String, String>,
}

/// Derive the stable scenario key for a request.
///
/// Subject is trimmed and case-folded, sources are deduplicated and sorted
/// lexicographically, options are iterated in sorted order. Field values are
/// length-prefixed before hashing so adjacent fields cannot collide by
/// concatenation.
pub fn build_key(params: &ScenarioParams) -> Result<ScenarioKey, ReportError> {
    let subject = params.subject.trim().to_lowercase();
    if subject.is_empty() {
        return Err(ReportError::InvalidScenario("subject is empty".into()));
    }

    let mut sources: Vec<String> = params
        .sources
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    sources.sort();
    sources.dedup();
    if sources.is_empty() {
        return Err(ReportError::InvalidScenario("no data sources given".into()));
    }

    let mut hasher = Sha256::new();
    feed(&mut hasher, &subject);
    for source in &sources {
        feed(&mut hasher, source);
    }
    feed(&mut hasher, params.language.trim());
    for (name, value) in &params.options {
        feed(&mut hasher, name);
        feed(&mut hasher, value);
    }

    Ok(ScenarioKey(hex::encode(hasher.finalize())))
}

fn feed(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}
