//! Breakpoint engine
//!
//! A matching rule suspends the request, emits a hit toward the hub and
//! parks a oneshot continuation keyed by `request_id`. The hub resolves it
//! with a resume command; otherwise the timeout resolves it as `Resume`.
//! Exactly one side wins, and cancellation of the suspended request drops
//! the pending entry.

use crate::models::{BreakpointRule, HttpRequest, HttpResponse, RequestSnapshot, ResponseSnapshot};
use crate::rules::PatternGate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_BREAKPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a suspended request continues
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointAction {
    Resume,
    Modify {
        request: Option<RequestSnapshot>,
        response: Option<ResponseSnapshot>,
    },
    Abort,
    MockResponse(ResponseSnapshot),
}

/// Which side of the exchange a hit suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitPhase {
    Request,
    Response,
}

/// Notification sent to the hub when a breakpoint fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHit {
    pub breakpoint_id: String,
    pub request_id: String,
    pub phase: HitPhase,
    pub timestamp: DateTime<Utc>,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
}

struct CompiledBreakpoint {
    rule: BreakpointRule,
    url: PatternGate,
}

pub struct BreakpointEngine {
    rules: RwLock<Arc<Vec<CompiledBreakpoint>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<BreakpointAction>>>,
    hits: mpsc::UnboundedSender<BreakpointHit>,
    timeout: Duration,
}

impl BreakpointEngine {
    pub fn new(hits: mpsc::UnboundedSender<BreakpointHit>, timeout: Duration) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            pending: Mutex::new(HashMap::new()),
            hits,
            timeout,
        }
    }

    pub fn update_rules(&self, mut list: Vec<BreakpointRule>) {
        list.sort_by_key(|r| std::cmp::Reverse(r.priority));
        let compiled = list
            .into_iter()
            .map(|rule| CompiledBreakpoint {
                url: PatternGate::compile(rule.url_pattern.as_deref()),
                rule,
            })
            .collect();
        *self.rules.write().expect("breakpoint rules lock poisoned") = Arc::new(compiled);
    }

    pub fn add_rule(&self, rule: BreakpointRule) {
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

    pub fn rules_vec(&self) -> Vec<BreakpointRule> {
        self.snapshot().iter().map(|c| c.rule.clone()).collect()
    }

    fn snapshot(&self) -> Arc<Vec<CompiledBreakpoint>> {
        Arc::clone(&self.rules.read().expect("breakpoint rules lock poisoned"))
    }

    fn matching_rule(&self, req: &HttpRequest, request_phase: bool) -> Option<String> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .find(|c| {
                if !c.rule.enabled {
                    return false;
                }
                let phase_ok = if request_phase {
                    c.rule.phase.covers_request()
                } else {
                    c.rule.phase.covers_response()
                };
                if !phase_ok {
                    return false;
                }
                if let Some(method) = c.rule.method {
                    if method != req.method {
                        return false;
                    }
                }
                c.url.admits(&req.url)
            })
            .map(|c| c.rule.id.clone())
    }

    pub fn has_request_breakpoint(&self, req: &HttpRequest) -> bool {
        self.matching_rule(req, true).is_some()
    }

    pub fn has_response_breakpoint(&self, req: &HttpRequest) -> bool {
        self.matching_rule(req, false).is_some()
    }

    /// Suspend on a request-phase hit; resolves to `Resume` when no rule
    /// matches or the hub stays silent past the timeout.
    pub async fn check_request_breakpoint(&self, req: &HttpRequest) -> BreakpointAction {
        let Some(rule_id) = self.matching_rule(req, true) else {
            return BreakpointAction::Resume;
        };
        let hit = BreakpointHit {
            breakpoint_id: rule_id,
            request_id: req.id.clone(),
            phase: HitPhase::Request,
            timestamp: Utc::now(),
            request: RequestSnapshot::of(req),
            response: None,
        };
        self.wait_for_decision(req.id.clone(), hit).await
    }

    /// Suspend on a response-phase hit.
    pub async fn check_response_breakpoint(
        &self,
        req: &HttpRequest,
        resp: &HttpResponse,
    ) -> BreakpointAction {
        let Some(rule_id) = self.matching_rule(req, false) else {
            return BreakpointAction::Resume;
        };
        let hit = BreakpointHit {
            breakpoint_id: rule_id,
            request_id: req.id.clone(),
            phase: HitPhase::Response,
            timestamp: Utc::now(),
            request: RequestSnapshot::of(req),
            response: Some(ResponseSnapshot::of(resp)),
        };
        self.wait_for_decision(req.id.clone(), hit).await
    }

    async fn wait_for_decision(&self, request_id: String, hit: BreakpointHit) -> BreakpointAction {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            // One continuation per request_id; a stale entry is superseded.
            pending.insert(request_id.clone(), tx);
        }
        let _ = self.hits.send(hit);

        // If the caller is cancelled mid-wait, the guard clears the entry.
        let guard = PendingGuard {
            engine: self,
            request_id: &request_id,
        };

        let sleep = tokio::time::sleep(self.timeout);
        tokio::pin!(sleep);
        let action = tokio::select! {
            result = &mut rx => result.unwrap_or(BreakpointAction::Resume),
            _ = &mut sleep => {
                let timed_out = {
                    let mut pending = self.pending.lock().expect("pending lock poisoned");
                    pending.remove(&request_id).is_some()
                };
                if timed_out {
                    tracing::debug!(%request_id, "breakpoint timed out; resuming");
                    BreakpointAction::Resume
                } else {
                    // A resolution raced the timeout and already owns the
                    // channel; take its value.
                    rx.await.unwrap_or(BreakpointAction::Resume)
                }
            }
        };
        drop(guard);
        action
    }

    /// Resolve the pending continuation for `request_id`.
    pub fn resolve(&self, request_id: &str, action: BreakpointAction) -> anyhow::Result<()> {
        let sender = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(request_id)
        };
        match sender {
            Some(tx) => tx
                .send(action)
                .map_err(|_| anyhow::anyhow!("breakpoint consumer dropped for {request_id}")),
            None => Err(anyhow::anyhow!("no pending breakpoint for {request_id}")),
        }
    }

    /// Drop the pending continuation, if any.
    pub fn cancel(&self, request_id: &str) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}

struct PendingGuard<'a> {
    engine: &'a BreakpointEngine,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.engine.cancel(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BreakpointPhase, HttpMethod};
    use std::collections::HashMap;

    fn engine(timeout: Duration) -> (Arc<BreakpointEngine>, mpsc::UnboundedReceiver<BreakpointHit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(BreakpointEngine::new(tx, timeout)), rx)
    }

    fn rule(id: &str, phase: BreakpointPhase) -> BreakpointRule {
        BreakpointRule {
            id: id.to_string(),
            name: id.to_string(),
            url_pattern: None,
            method: None,
            phase,
            priority: 0,
            enabled: true,
        }
    }

    fn request(url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, url, HashMap::new())
    }

    #[tokio::test]
    async fn no_matching_rule_resumes_immediately() {
        let (engine, mut hits) = engine(Duration::from_secs(30));
        let action = engine.check_request_breakpoint(&request("https://x/")).await;
        assert_eq!(action, BreakpointAction::Resume);
        assert!(hits.try_recv().is_err());
    }

    #[tokio::test]
    async fn hub_resolution_wins() {
        let (engine, mut hits) = engine(Duration::from_secs(30));
        let mut checkout = rule("b1", BreakpointPhase::Request);
        checkout.url_pattern = Some("/checkout".to_string());
        checkout.method = Some(HttpMethod::Post);
        engine.update_rules(vec![checkout]);

        let req = request("https://shop.example.com/checkout");
        let resolver = Arc::clone(&engine);
        let req_id = req.id.clone();
        let waiter = tokio::spawn(async move {
            let eng = resolver;
            eng.check_request_breakpoint(&req).await
        });

        let hit = hits.recv().await.expect("hit emitted");
        assert_eq!(hit.breakpoint_id, "b1");
        assert_eq!(hit.request_id, req_id);
        assert_eq!(hit.phase, HitPhase::Request);

        engine
            .resolve(&req_id, BreakpointAction::Abort)
            .expect("resolved");
        assert_eq!(waiter.await.expect("join"), BreakpointAction::Abort);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_to_resume() {
        let (engine, mut hits) = engine(DEFAULT_BREAKPOINT_TIMEOUT);
        engine.update_rules(vec![rule("b1", BreakpointPhase::Request)]);

        let req = request("https://shop.example.com/checkout");
        let action = engine.check_request_breakpoint(&req).await;
        assert_eq!(action, BreakpointAction::Resume);
        assert!(hits.recv().await.is_some());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_without_pending_is_an_error() {
        let (engine, _hits) = engine(Duration::from_secs(30));
        assert!(engine.resolve("nope", BreakpointAction::Resume).is_err());
    }

    #[tokio::test]
    async fn cancelled_waiter_clears_the_pending_entry() {
        let (engine, mut hits) = engine(Duration::from_secs(30));
        engine.update_rules(vec![rule("b1", BreakpointPhase::Request)]);

        let req = request("https://shop.example.com/checkout");
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.check_request_breakpoint(&req).await })
        };
        hits.recv().await.expect("hit emitted");
        assert_eq!(engine.pending_count(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_phase_rules_gate_response_checks() {
        let (engine, mut hits) = engine(Duration::from_secs(30));
        engine.update_rules(vec![rule("resp", BreakpointPhase::Response)]);

        let req = request("https://api.example.com/data");
        assert!(engine.has_response_breakpoint(&req));
        // Request phase is not covered by a response-only rule.
        assert_eq!(
            engine.check_request_breakpoint(&req).await,
            BreakpointAction::Resume
        );
        assert!(hits.try_recv().is_err());

        let resp = HttpResponse::new(200, HashMap::new(), None);
        let resolver = Arc::clone(&engine);
        let req_id = req.id.clone();
        let waiter = tokio::spawn(async move {
            resolver.check_response_breakpoint(&req, &resp).await
        });
        let hit = hits.recv().await.expect("hit emitted");
        assert_eq!(hit.phase, HitPhase::Response);
        assert!(hit.response.is_some());

        let replacement = ResponseSnapshot {
            status: 503,
            headers: HashMap::new(),
            body: None,
        };
        engine
            .resolve(&req_id, BreakpointAction::MockResponse(replacement.clone()))
            .expect("resolved");
        assert_eq!(
            waiter.await.expect("join"),
            BreakpointAction::MockResponse(replacement)
        );
    }
}
