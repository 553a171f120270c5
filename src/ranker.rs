//! Offline provider/model ranking
//!
//! Scores every (provider, model) pair seen in the performance log and
//! produces an advisory ordering for the fallback chain. Quality dominates:
//! a fast pair that returns junk never outranks a slower pair that returns
//! structured, quantitative reports. Runs entirely on logged rows; it never
//! issues provider calls.

use crate::orchestrator::{AttemptRecord, ProviderModelPair};
use std::collections::HashMap;

const QUALITY_WEIGHT: f64 = 0.6;
const SPEED_WEIGHT: f64 = 0.4;

/// Successful responses shorter than this read as thin content and drag the
/// length component down proportionally.
const SUBSTANTIVE_CHARS: f64 = 600.0;

/// One ranked fallback-chain candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPair {
    pub pair: ProviderModelPair,
    /// Combined score in [0, 1]; 0 for pairs with no successes.
    pub score: f64,
    pub quality: f64,
    pub speed: f64,
    pub attempts: usize,
    pub successes: usize,
}

#[derive(Default)]
struct PairStats {
    attempts: usize,
    successes: usize,
    quantitative: usize,
    success_latency_ms: u64,
    success_chars: usize,
}

impl PairStats {
    fn mean_latency_ms(&self) -> Option<f64> {
        (self.successes > 0).then(|| self.success_latency_ms as f64 / self.successes as f64)
    }

    fn quality(&self) -> f64 {
        if self.successes == 0 {
            return 0.0;
        }
        let validity_rate = self.successes as f64 / self.attempts as f64;
        let quantitative_rate = self.quantitative as f64 / self.successes as f64;
        let mean_chars = self.success_chars as f64 / self.successes as f64;
        let length_score = (mean_chars / SUBSTANTIVE_CHARS).min(1.0);
        0.5 * validity_rate + 0.3 * quantitative_rate + 0.2 * length_score
    }
}

/// Rank all pairs present in the log, best first. Pairs with zero successful
/// attempts score 0 and sort last.
pub fn rank(log: &[AttemptRecord]) -> Vec<RankedPair> {
    let mut stats: HashMap<ProviderModelPair, PairStats> = HashMap::new();
    for record in log {
        let entry = stats
            .entry(ProviderModelPair {
                provider: record.provider.clone(),
                model: record.model.clone(),
            })
            .or_default();
        entry.attempts += 1;
        if record.success {
            entry.successes += 1;
            entry.success_latency_ms += record.latency_ms;
            entry.success_chars += record.response_chars;
            if record.quantitative {
                entry.quantitative += 1;
            }
        }
    }

    // Speed normalizes against the fastest pair that has any successes.
    let fastest_ms = stats
        .values()
        .filter_map(PairStats::mean_latency_ms)
        .fold(f64::INFINITY, f64::min);

    let mut ranked: Vec<RankedPair> = stats
        .into_iter()
        .map(|(pair, s)| {
            let quality = s.quality();
            let speed = match s.mean_latency_ms() {
                Some(mean) if mean > 0.0 => (fastest_ms / mean).min(1.0),
                Some(_) => 1.0,
                None => 0.0,
            };
            let score = if s.successes == 0 {
                0.0
            } else {
                QUALITY_WEIGHT * quality + SPEED_WEIGHT * speed
            };
            RankedPair {
                pair,
                score,
                quality,
                speed,
                attempts: s.attempts,
                successes: s.successes,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.successes.cmp(&a.successes))
            .then_with(|| a.pair.provider.cmp(&b.pair.provider))
            .then_with(|| a.pair.model.cmp(&b.pair.model))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(
        provider: &str,
        model: &str,
        success: bool,
        latency_ms: u64,
        chars: usize,
        quantitative: bool,
    ) -> AttemptRecord {
        AttemptRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            latency_ms,
            token_count: 100,
            success,
            error_kind: (!success).then(|| "server_error".to_string()),
            degraded: false,
            response_chars: chars,
            quantitative,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_log_yields_empty_ranking() {
        assert!(rank(&[]).is_empty());
    }

    #[test]
    fn reliable_pair_outranks_flaky_pair() {
        let log = vec![
            record("a", "m", true, 1000, 800, true),
            record("a", "m", true, 1000, 800, true),
            record("b", "m", true, 1000, 800, true),
            record("b", "m", false, 1000, 0, false),
            record("b", "m", false, 1000, 0, false),
        ];
        let ranked = rank(&log);
        assert_eq!(ranked[0].pair.provider, "a");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn zero_success_pair_scores_zero_and_sorts_last() {
        let log = vec![
            record("dead", "m", false, 100, 0, false),
            record("dead", "m", false, 100, 0, false),
            record("alive", "m", true, 5000, 800, true),
        ];
        let ranked = rank(&log);
        assert_eq!(ranked.last().unwrap().pair.provider, "dead");
        assert_eq!(ranked.last().unwrap().score, 0.0);
        assert!(ranked[0].score > 0.0);
    }

    #[test]
    fn quality_dominates_speed() {
        // "fast" is 10x quicker but returns thin, non-quantitative content
        // half the time; "thorough" always returns substantive numbers.
        let log = vec![
            record("fast", "m", true, 200, 150, false),
            record("fast", "m", false, 200, 0, false),
            record("thorough", "m", true, 2000, 1200, true),
            record("thorough", "m", true, 2000, 1200, true),
        ];
        let ranked = rank(&log);
        assert_eq!(ranked[0].pair.provider, "thorough");
    }

    #[test]
    fn speed_breaks_quality_ties() {
        let log = vec![
            record("quick", "m", true, 500, 800, true),
            record("slow", "m", true, 2000, 800, true),
        ];
        let ranked = rank(&log);
        assert_eq!(ranked[0].pair.provider, "quick");
        assert!((ranked[0].speed - 1.0).abs() < f64::EPSILON);
        assert!(ranked[1].speed < 1.0);
    }

    #[test]
    fn models_under_one_provider_rank_independently() {
        let log = vec![
            record("p", "good", true, 1000, 900, true),
            record("p", "bad", false, 1000, 0, false),
        ];
        let ranked = rank(&log);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].pair.model, "good");
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let log = vec![
            record("p", "m", true, 1, 10_000, true),
            record("q", "m", true, 9999, 5, false),
        ];
        for r in rank(&log) {
            assert!(r.score >= 0.0 && r.score <= 1.0);
            assert!(r.quality >= 0.0 && r.quality <= 1.0);
            assert!(r.speed >= 0.0 && r.speed <= 1.0);
        }
    }
}
