//! Report service façade
//!
//! The one entry point callers use: cache-first lookup, single-flight
//! generation, bounded waiting on a flight owned by someone else. All cache
//! persistence failures fail open: a generated report is always returned to
//! the caller even when it could not be stored.
//!
//! Cache operations run on the blocking thread pool. They are fast in the
//! common case, but the cross-process lock can make a contended caller wait,
//! and that wait must not park an async worker. The in-flight lease is held
//! through an RAII guard, so a caller whose future is dropped mid-generation
//! releases the entry instead of leaving it stuck until the grace period.

use crate::cache::{CacheState, LeaseGuard, LeaseOutcome, ReportCache};
use crate::error::ReportError;
use crate::orchestrator::{AttemptRecord, ProviderModelPair, ProviderOrchestrator};
use crate::prompt;
use crate::report::{AnalysisPayload, GenerationMetadata, Report};
use crate::scenario::{self, ScenarioKey, ScenarioParams};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller gets back.
#[derive(Debug)]
pub enum Outcome {
    Ready {
        report: Report,
        metadata: GenerationMetadata,
    },
    /// Another session owns the generation and it did not finish within the
    /// wait window. The caller should retry later; the result will be cached.
    StillGenerating,
}

pub struct ReportService {
    cache: ReportCache,
    orchestrator: ProviderOrchestrator,
    chain: Vec<ProviderModelPair>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ReportService {
    pub fn new(
        cache: ReportCache,
        orchestrator: ProviderOrchestrator,
        chain: Vec<ProviderModelPair>,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            orchestrator,
            chain,
            poll_interval,
            wait_timeout,
        }
    }

    /// Wire up the whole stack from configuration: one HTTP backend per
    /// configured provider, the flattened fallback chain, and the cache in
    /// its configured directory.
    pub fn from_config(config: &crate::config::ReportConfig) -> Self {
        let backends: Vec<std::sync::Arc<dyn crate::backend::CompletionBackend>> = config
            .providers
            .iter()
            .map(|p| {
                std::sync::Arc::new(crate::backend::HttpBackend::new(
                    &p.name,
                    &p.base_url,
                    p.api_key_env.as_deref(),
                )) as std::sync::Arc<dyn crate::backend::CompletionBackend>
            })
            .collect();
        let cache = ReportCache::new(
            &config.cache_dir(),
            config.cache_ttl(),
            config.inflight_grace(),
        );
        let orchestrator =
            ProviderOrchestrator::new(backends, config.attempt_timeout(), config.total_budget());
        Self::new(
            cache,
            orchestrator,
            config.chain(),
            config.poll_interval(),
            config.wait_timeout(),
        )
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    /// Return the cached report for this scenario, or generate it.
    ///
    /// `force_refresh` busts the cache entry first. When another session
    /// already owns the generation, waits up to the configured window for it
    /// to complete before reporting [`Outcome::StillGenerating`].
    pub async fn get_or_generate(
        &self,
        params: &ScenarioParams,
        payload: &AnalysisPayload,
        force_refresh: bool,
    ) -> Result<Outcome, ReportError> {
        let key = scenario::build_key(params)?;

        if force_refresh {
            let k = key.clone();
            if let Err(err) = self.run_cache(move |c| c.force_refresh(&k)).await {
                warn!(error = %err, "cache refresh failed, generating anyway");
            }
        } else {
            let k = key.clone();
            match self.run_cache(move |c| c.lookup(&k)).await {
                Ok(CacheState::Ready(report, metadata)) => {
                    debug!(key = %key, "cache hit");
                    return Ok(Outcome::Ready { report, metadata });
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "cache lookup failed, regenerating"),
            }
        }

        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            let k = key.clone();
            match self.run_cache(move |c| c.begin_generation(&k)).await {
                Ok(LeaseOutcome::Acquired(lease)) => {
                    let guard = self.cache.guard(lease);
                    return self.generate_owned(params, payload, guard).await;
                }
                Ok(LeaseOutcome::AlreadyReady(report, metadata)) => {
                    return Ok(Outcome::Ready { report, metadata });
                }
                Ok(LeaseOutcome::AlreadyInFlight) => {
                    match self.wait_for_flight(&key, deadline).await {
                        FlightWait::Ready(report, metadata) => {
                            return Ok(Outcome::Ready { report, metadata });
                        }
                        FlightWait::TimedOut => return Ok(Outcome::StillGenerating),
                        // Owner aborted; loop and try to take the lease.
                        FlightWait::Vacated => continue,
                    }
                }
                Err(err) => {
                    // The store is unusable; generate without it rather than
                    // failing the caller's request.
                    warn!(error = %err, "cache unavailable, generating uncached");
                    return self.generate_uncached(params, payload).await;
                }
            }
        }
    }

    async fn generate_owned(
        &self,
        params: &ScenarioParams,
        payload: &AnalysisPayload,
        guard: LeaseGuard,
    ) -> Result<Outcome, ReportError> {
        let prompt = prompt::build_report_prompt(params, payload);

        match self.orchestrator.generate(&prompt, &self.chain).await {
            Ok(success) => {
                self.record_attempts(success.attempts).await;
                let report = success.report;
                let metadata = success.metadata;
                let (r, m) = (report.clone(), metadata.clone());
                match tokio::task::spawn_blocking(move || guard.complete(&r, &m)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "report generated but could not be cached");
                    }
                    Err(err) => warn!(error = %err, "cache completion task failed"),
                }
                info!(
                    provider = %metadata.provider,
                    model = %metadata.model,
                    "report ready"
                );
                Ok(Outcome::Ready { report, metadata })
            }
            Err(exhausted) => {
                self.record_attempts(exhausted.attempts).await;
                match tokio::task::spawn_blocking(move || guard.abort()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "failed to clear in-flight entry after exhaustion");
                    }
                    Err(err) => warn!(error = %err, "cache abort task failed"),
                }
                Err(ReportError::GenerationFailed {
                    reason: exhausted.reason,
                })
            }
        }
    }

    async fn generate_uncached(
        &self,
        params: &ScenarioParams,
        payload: &AnalysisPayload,
    ) -> Result<Outcome, ReportError> {
        let prompt = prompt::build_report_prompt(params, payload);
        match self.orchestrator.generate(&prompt, &self.chain).await {
            Ok(success) => {
                self.record_attempts(success.attempts).await;
                Ok(Outcome::Ready {
                    report: success.report,
                    metadata: success.metadata,
                })
            }
            Err(exhausted) => {
                self.record_attempts(exhausted.attempts).await;
                Err(ReportError::GenerationFailed {
                    reason: exhausted.reason,
                })
            }
        }
    }

    async fn wait_for_flight(&self, key: &ScenarioKey, deadline: tokio::time::Instant) -> FlightWait {
        loop {
            if tokio::time::Instant::now() >= deadline {
                debug!(key = %key, "gave up waiting on another session's generation");
                return FlightWait::TimedOut;
            }
            tokio::time::sleep(self.poll_interval).await;
            let k = key.clone();
            match self.run_cache(move |c| c.lookup(&k)).await {
                Ok(CacheState::Ready(report, metadata)) => {
                    return FlightWait::Ready(report, metadata);
                }
                Ok(CacheState::InFlight) => {}
                Ok(CacheState::Absent) => return FlightWait::Vacated,
                Err(err) => {
                    warn!(error = %err, "cache poll failed while waiting");
                    return FlightWait::TimedOut;
                }
            }
        }
    }

    async fn record_attempts(&self, attempts: Vec<AttemptRecord>) {
        if attempts.is_empty() {
            return;
        }
        let appended = self
            .run_cache(move |c| {
                for record in &attempts {
                    c.record_attempt(record)?;
                }
                Ok(())
            })
            .await;
        if let Err(err) = appended {
            warn!(error = %err, "failed to append performance-log rows");
        }
    }

    /// Run a cache operation on the blocking pool so lock contention never
    /// parks an async worker thread.
    async fn run_cache<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReportCache) -> anyhow::Result<T> + Send + 'static,
    {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || op(&cache)).await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("cache task failed: {}", err)),
        }
    }
}

enum FlightWait {
    Ready(Report, GenerationMetadata),
    TimedOut,
    Vacated,
}
