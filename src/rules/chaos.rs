//! Chaos engine
//!
//! Probabilistically injects faults into matched requests: latency,
//! timeouts, connection resets, synthetic error statuses, dropped requests
//! and response corruption. A matching rule fires only when a uniform draw
//! lands at or below its probability; non-firing rules let lower-priority
//! rules take their own draw.

use crate::models::{ChaosKind, ChaosRule, HttpRequest};
use crate::rules::PatternGate;
use rand::Rng;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Injected failures surfaced to the host call path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChaosFailure {
    #[error("request timed out (injected)")]
    Timeout,
    #[error("connection reset (injected)")]
    ConnectionReset,
    #[error("request dropped (injected)")]
    Dropped,
}

/// Request-phase evaluation outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ChaosResult {
    None,
    Delay(u64),
    Timeout,
    ConnectionReset,
    ErrorResponse(u16),
    Drop,
}

/// Response-phase evaluation outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ChaosResponseResult {
    None,
    CorruptedData(Vec<u8>),
}

struct CompiledChaos {
    rule: ChaosRule,
    url: PatternGate,
}

pub struct ChaosEngine {
    rules: RwLock<Arc<Vec<CompiledChaos>>>,
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn update_rules(&self, mut list: Vec<ChaosRule>) {
        list.sort_by_key(|r| std::cmp::Reverse(r.priority));
        let compiled = list
            .into_iter()
            .map(|rule| CompiledChaos {
                url: PatternGate::compile(rule.url_pattern.as_deref()),
                rule,
            })
            .collect();
        *self.rules.write().expect("chaos rules lock poisoned") = Arc::new(compiled);
    }

    pub fn add_rule(&self, rule: ChaosRule) {
        let mut list = self.rules_vec();
        list.push(rule);
        self.update_rules(list);
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut list = self.rules_vec();
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if removed {
            self.update_rules(list);
        }
        removed
    }

    pub fn clear_rules(&self) {
        self.update_rules(Vec::new());
    }

    pub fn rules_vec(&self) -> Vec<ChaosRule> {
        self.snapshot().iter().map(|c| c.rule.clone()).collect()
    }

    fn snapshot(&self) -> Arc<Vec<CompiledChaos>> {
        Arc::clone(&self.rules.read().expect("chaos rules lock poisoned"))
    }

    fn condition_matches(compiled: &CompiledChaos, req: &HttpRequest) -> bool {
        if !compiled.rule.enabled {
            return false;
        }
        if let Some(method) = compiled.rule.method {
            if method != req.method {
                return false;
            }
        }
        compiled.url.admits(&req.url)
    }

    /// Request-phase faults. `corruptResponse` rules are skipped here and
    /// evaluated by [`ChaosEngine::evaluate_response`].
    pub fn evaluate(&self, req: &HttpRequest) -> ChaosResult {
        let snapshot = self.snapshot();
        let mut rng = rand::thread_rng();
        for compiled in snapshot.iter() {
            if matches!(compiled.rule.chaos, ChaosKind::CorruptResponse) {
                continue;
            }
            if !Self::condition_matches(compiled, req) {
                continue;
            }
            if rng.gen::<f64>() > compiled.rule.probability {
                continue;
            }
            tracing::debug!(rule = %compiled.rule.id, url = %req.url, "chaos rule fired");
            return match &compiled.rule.chaos {
                ChaosKind::Latency { min_ms, max_ms } => {
                    let (lo, hi) = if min_ms <= max_ms {
                        (*min_ms, *max_ms)
                    } else {
                        (*max_ms, *min_ms)
                    };
                    ChaosResult::Delay(rng.gen_range(lo..=hi))
                }
                ChaosKind::Timeout => ChaosResult::Timeout,
                ChaosKind::ConnectionReset => ChaosResult::ConnectionReset,
                ChaosKind::RandomError { codes } => {
                    let status = if codes.is_empty() {
                        500
                    } else {
                        codes[rng.gen_range(0..codes.len())]
                    };
                    ChaosResult::ErrorResponse(status)
                }
                // Degrades to a coarse delay; per-byte throttling is not
                // reachable from this layer.
                ChaosKind::SlowNetwork { .. } => ChaosResult::Delay(rng.gen_range(1000..=5000)),
                ChaosKind::DropRequest => ChaosResult::Drop,
                ChaosKind::CorruptResponse => unreachable!("filtered above"),
            };
        }
        ChaosResult::None
    }

    /// Response-phase faults: only `corruptResponse`, flipping ≈1% of body
    /// bytes (at least one).
    pub fn evaluate_response(&self, req: &HttpRequest, body: &[u8]) -> ChaosResponseResult {
        if body.is_empty() {
            return ChaosResponseResult::None;
        }
        let snapshot = self.snapshot();
        let mut rng = rand::thread_rng();
        for compiled in snapshot.iter() {
            if !matches!(compiled.rule.chaos, ChaosKind::CorruptResponse) {
                continue;
            }
            if !Self::condition_matches(compiled, req) {
                continue;
            }
            if rng.gen::<f64>() > compiled.rule.probability {
                continue;
            }
            tracing::debug!(rule = %compiled.rule.id, url = %req.url, "corrupting response body");
            return ChaosResponseResult::CorruptedData(corrupt_bytes(body, &mut rng));
        }
        ChaosResponseResult::None
    }
}

fn corrupt_bytes(body: &[u8], rng: &mut impl Rng) -> Vec<u8> {
    let mut out = body.to_vec();
    let flips = (out.len() / 100).max(1).min(out.len());
    let indices = rand::seq::index::sample(rng, out.len(), flips);
    for idx in indices {
        out[idx] ^= rng.gen_range(1..=255u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HttpMethod;
    use std::collections::HashMap;

    fn rule(id: &str, chaos: ChaosKind, probability: f64, priority: i32) -> ChaosRule {
        ChaosRule {
            id: id.to_string(),
            name: id.to_string(),
            url_pattern: None,
            method: None,
            probability,
            chaos,
            priority,
            enabled: true,
        }
    }

    fn request(url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, url, HashMap::new())
    }

    #[test]
    fn certain_drop_fires() {
        let engine = ChaosEngine::new();
        let mut drop_rule = rule("drop", ChaosKind::DropRequest, 1.0, 10);
        drop_rule.url_pattern = Some("*analytics*".to_string());
        engine.update_rules(vec![drop_rule]);

        assert_eq!(
            engine.evaluate(&request("https://api.example.com/analytics/x")),
            ChaosResult::Drop
        );
        assert_eq!(
            engine.evaluate(&request("https://api.example.com/orders")),
            ChaosResult::None
        );
    }

    #[test]
    fn zero_probability_never_fires() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![rule("never", ChaosKind::Timeout, 0.0, 0)]);
        for _ in 0..50 {
            assert_eq!(engine.evaluate(&request("https://x/")), ChaosResult::None);
        }
    }

    #[test]
    fn latency_delay_stays_in_bounds() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![rule(
            "lat",
            ChaosKind::Latency {
                min_ms: 100,
                max_ms: 200,
            },
            1.0,
            0,
        )]);
        for _ in 0..20 {
            match engine.evaluate(&request("https://x/")) {
                ChaosResult::Delay(ms) => assert!((100..=200).contains(&ms)),
                other => panic!("expected delay, got {other:?}"),
            }
        }
    }

    #[test]
    fn slow_network_degrades_to_coarse_delay() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![rule(
            "slow",
            ChaosKind::SlowNetwork { bytes_per_sec: 512 },
            1.0,
            0,
        )]);
        match engine.evaluate(&request("https://x/")) {
            ChaosResult::Delay(ms) => assert!((1000..=5000).contains(&ms)),
            other => panic!("expected delay, got {other:?}"),
        }
    }

    #[test]
    fn random_error_picks_from_codes() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![rule(
            "err",
            ChaosKind::RandomError {
                codes: vec![502, 503],
            },
            1.0,
            0,
        )]);
        for _ in 0..20 {
            match engine.evaluate(&request("https://x/")) {
                ChaosResult::ErrorResponse(code) => assert!(code == 502 || code == 503),
                other => panic!("expected error response, got {other:?}"),
            }
        }

        engine.update_rules(vec![rule(
            "err",
            ChaosKind::RandomError { codes: vec![] },
            1.0,
            0,
        )]);
        assert_eq!(
            engine.evaluate(&request("https://x/")),
            ChaosResult::ErrorResponse(500)
        );
    }

    #[test]
    fn higher_priority_rule_takes_the_first_draw() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![
            rule("low", ChaosKind::Timeout, 1.0, 1),
            rule("high", ChaosKind::DropRequest, 1.0, 10),
        ]);
        assert_eq!(engine.evaluate(&request("https://x/")), ChaosResult::Drop);
    }

    #[test]
    fn corrupt_response_is_response_phase_only() {
        let engine = ChaosEngine::new();
        engine.update_rules(vec![rule("corrupt", ChaosKind::CorruptResponse, 1.0, 0)]);

        let req = request("https://x/");
        assert_eq!(engine.evaluate(&req), ChaosResult::None);

        let body = vec![0u8; 1000];
        match engine.evaluate_response(&req, &body) {
            ChaosResponseResult::CorruptedData(corrupted) => {
                assert_eq!(corrupted.len(), body.len());
                let flipped = corrupted
                    .iter()
                    .zip(body.iter())
                    .filter(|(a, b)| a != b)
                    .count();
                assert!(flipped >= 1, "at least one byte must change");
                assert!(flipped <= 10, "roughly one percent changes, saw {flipped}");
            }
            ChaosResponseResult::None => panic!("expected corruption"),
        }

        // Nothing to corrupt in an empty body.
        assert_eq!(
            engine.evaluate_response(&req, &[]),
            ChaosResponseResult::None
        );

        // Single byte bodies still flip that byte.
        match engine.evaluate_response(&req, &[7u8]) {
            ChaosResponseResult::CorruptedData(corrupted) => assert_ne!(corrupted[0], 7),
            ChaosResponseResult::None => panic!("expected corruption"),
        }
    }
}
