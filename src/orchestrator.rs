//! Provider fallback orchestration
//!
//! Tries an ordered list of (provider, model) pairs strictly in sequence,
//! never in parallel, so cost is bounded and fallback behavior is
//! deterministic and auditable. Each attempt gets a bounded timeout; the
//! whole call gets a total budget. Transport failures and structurally
//! unparseable responses both fall through to the next pair; they are
//! recorded with distinct error kinds for diagnostics.

use crate::backend::CompletionBackend;
use crate::error::{BackendError, ExhaustReason};
use crate::parse;
use crate::report::{Confidence, GenerationMetadata, Report};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One configured fallback-chain entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderModelPair {
    pub provider: String,
    pub model: String,
}

impl std::fmt::Display for ProviderModelPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// What happened on one attempt; one performance-log row per record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub token_count: u32,
    pub success: bool,
    /// Failure classification: transport kinds from [`BackendError::kind`],
    /// or `parse_degraded` when only the last-resort parse applied.
    pub error_kind: Option<String>,
    /// The response parsed only via the degraded fallback strategy.
    #[serde(default)]
    pub degraded: bool,
    /// Raw response length, for the ranker's minimum-length heuristic.
    #[serde(default)]
    pub response_chars: usize,
    /// Findings carried quantitative content.
    #[serde(default)]
    pub quantitative: bool,
    pub timestamp: DateTime<Utc>,
}

/// A winning generation plus the full attempt trail.
#[derive(Debug)]
pub struct GenerationSuccess {
    pub report: Report,
    pub metadata: GenerationMetadata,
    pub attempts: Vec<AttemptRecord>,
}

/// Every pair failed, or the budget ran out first.
#[derive(Debug)]
pub struct Exhausted {
    pub reason: ExhaustReason,
    pub attempts: Vec<AttemptRecord>,
}

pub struct ProviderOrchestrator {
    backends: HashMap<String, Arc<dyn CompletionBackend>>,
    per_attempt_timeout: Duration,
    total_budget: Duration,
}

impl ProviderOrchestrator {
    pub fn new(
        backends: Vec<Arc<dyn CompletionBackend>>,
        per_attempt_timeout: Duration,
        total_budget: Duration,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|b| (b.provider_name().to_string(), b))
            .collect();
        Self {
            backends,
            per_attempt_timeout,
            total_budget,
        }
    }

    /// Run the fallback chain for one prompt.
    ///
    /// Returns the first structurally parsed report. A response that only
    /// the degraded-fallback strategy could salvage is kept as a last-resort
    /// candidate: it is returned (confidence = degraded) only if no later
    /// pair produces a structured report before the chain or budget is
    /// exhausted.
    pub async fn generate(
        &self,
        prompt: &str,
        chain: &[ProviderModelPair],
    ) -> Result<GenerationSuccess, Exhausted> {
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut degraded_candidate: Option<(Report, GenerationMetadata)> = None;

        for (index, pair) in chain.iter().enumerate() {
            let elapsed = started.elapsed();
            if elapsed >= self.total_budget {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.total_budget.as_millis() as u64,
                    "generation budget exhausted with pairs untried"
                );
                return self.exhaust(ExhaustReason::BudgetExceeded, attempts, degraded_candidate);
            }
            let attempt_timeout = self.per_attempt_timeout.min(self.total_budget - elapsed);

            let attempt_started = Instant::now();
            let outcome = self.attempt(pair, prompt, attempt_timeout).await;
            let latency_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok((text, token_count)) => {
                    let report = parse::parse(&text);
                    let structured = report.confidence == Confidence::High;
                    attempts.push(AttemptRecord {
                        provider: pair.provider.clone(),
                        model: pair.model.clone(),
                        latency_ms,
                        token_count,
                        success: structured,
                        error_kind: (!structured).then(|| "parse_degraded".to_string()),
                        degraded: !structured,
                        response_chars: text.chars().count(),
                        quantitative: report.has_quantitative_content(),
                        timestamp: Utc::now(),
                    });

                    let metadata = GenerationMetadata {
                        provider: pair.provider.clone(),
                        model: pair.model.clone(),
                        latency_ms,
                        token_count,
                        attempt_number: (index + 1) as u32,
                        success: true,
                        created_at: Utc::now(),
                    };

                    if structured {
                        info!(provider = %pair.provider, model = %pair.model, latency_ms, "report generated");
                        return Ok(GenerationSuccess {
                            report,
                            metadata,
                            attempts,
                        });
                    }

                    // Malformed response: treated like a transport failure for
                    // fallback purposes, but logged distinctly.
                    warn!(
                        provider = %pair.provider,
                        model = %pair.model,
                        "response only parseable via degraded fallback, trying next pair"
                    );
                    if degraded_candidate.is_none() {
                        degraded_candidate = Some((report, metadata));
                    }
                }
                Err(err) => {
                    debug!(
                        provider = %pair.provider,
                        model = %pair.model,
                        error = %err,
                        transient = err.is_transient(),
                        "attempt failed, trying next pair"
                    );
                    attempts.push(AttemptRecord {
                        provider: pair.provider.clone(),
                        model: pair.model.clone(),
                        latency_ms,
                        token_count: 0,
                        success: false,
                        error_kind: Some(err.kind().to_string()),
                        degraded: false,
                        response_chars: 0,
                        quantitative: false,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        self.exhaust(ExhaustReason::AllProvidersFailed, attempts, degraded_candidate)
    }

    async fn attempt(
        &self,
        pair: &ProviderModelPair,
        prompt: &str,
        timeout: Duration,
    ) -> Result<(String, u32), BackendError> {
        let backend = self
            .backends
            .get(&pair.provider)
            .ok_or_else(|| BackendError::Other(format!("unknown provider '{}'", pair.provider)))?;

        match tokio::time::timeout(timeout, backend.complete(&pair.model, prompt)).await {
            Ok(Ok(completion)) => Ok((completion.text, completion.token_count)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BackendError::Timeout(timeout.as_millis() as u64)),
        }
    }

    fn exhaust(
        &self,
        reason: ExhaustReason,
        attempts: Vec<AttemptRecord>,
        degraded_candidate: Option<(Report, GenerationMetadata)>,
    ) -> Result<GenerationSuccess, Exhausted> {
        if let Some((report, metadata)) = degraded_candidate {
            warn!(
                provider = %metadata.provider,
                model = %metadata.model,
                "no structured report from any pair, returning degraded candidate"
            );
            return Ok(GenerationSuccess {
                report,
                metadata,
                attempts,
            });
        }
        Err(Exhausted { reason, attempts })
    }
}
