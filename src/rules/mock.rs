//! Mock rule engine
//!
//! Walks rules in priority order. Request-target rules apply header and
//! body overrides cumulatively; the first matching response-target rule
//! yields a full mock response and ends the walk. WebSocket targets swap
//! frame payloads.

use crate::models::{HttpRequest, HttpResponse, MockCondition, MockRule, MockTarget};
use crate::rules::PatternGate;
use std::sync::{Arc, RwLock};

struct CompiledMock {
    rule: MockRule,
    url: PatternGate,
}

/// Outcome of running a request through the mock rules
#[derive(Debug, Clone)]
pub struct MockDecision {
    /// The request with any overrides applied
    pub request: HttpRequest,
    /// Full mock response when a response-target rule matched
    pub response: Option<HttpResponse>,
    pub matched_rule_id: Option<String>,
    pub delay_ms: Option<u64>,
}

pub struct MockRuleEngine {
    rules: RwLock<Arc<Vec<CompiledMock>>>,
}

impl Default for MockRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuleEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the whole list; re-sorted by descending priority, ties in
    /// input order.
    pub fn update_rules(&self, mut list: Vec<MockRule>) {
        list.sort_by_key(|r| std::cmp::Reverse(r.priority));
        let compiled = list
            .into_iter()
            .map(|rule| CompiledMock {
                url: PatternGate::compile(rule.condition.url_pattern.as_deref()),
                rule,
            })
            .collect();
        *self.rules.write().expect("mock rules lock poisoned") = Arc::new(compiled);
    }

    pub fn add_rule(&self, rule: MockRule) {
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

    pub fn rules_vec(&self) -> Vec<MockRule> {
        self.snapshot().iter().map(|c| c.rule.clone()).collect()
    }

    fn snapshot(&self) -> Arc<Vec<CompiledMock>> {
        Arc::clone(&self.rules.read().expect("mock rules lock poisoned"))
    }

    /// Apply request overrides and look for a mock response.
    pub fn process_http_request(&self, req: &HttpRequest) -> MockDecision {
        let snapshot = self.snapshot();
        let mut request = req.clone();
        let mut first_override: Option<String> = None;
        let mut response = None;
        let mut matched_response: Option<String> = None;
        let mut delay_ms = None;

        for compiled in snapshot.iter() {
            if !compiled.rule.enabled {
                continue;
            }
            match compiled.rule.target {
                MockTarget::HttpRequest => {
                    if !http_condition_matches(compiled, &request) {
                        continue;
                    }
                    let action = &compiled.rule.action;
                    for (k, v) in &action.request_headers {
                        request.headers.insert(k.clone(), v.clone());
                    }
                    if let Some(body) = &action.request_body {
                        request.body = Some(body.clone());
                    }
                    first_override.get_or_insert_with(|| compiled.rule.id.clone());
                    if delay_ms.is_none() {
                        delay_ms = action.delay_ms;
                    }
                }
                MockTarget::HttpResponse => {
                    if !http_condition_matches(compiled, &request) {
                        continue;
                    }
                    let action = &compiled.rule.action;
                    response = Some(HttpResponse::new(
                        action.mock_status_code.unwrap_or(200),
                        action.mock_headers.clone(),
                        action.mock_body.clone(),
                    ));
                    matched_response = Some(compiled.rule.id.clone());
                    if delay_ms.is_none() {
                        delay_ms = action.delay_ms;
                    }
                    break;
                }
                MockTarget::WsOutgoing | MockTarget::WsIncoming => continue,
            }
        }

        MockDecision {
            request,
            response,
            matched_rule_id: matched_response.or(first_override),
            delay_ms,
        }
    }

    /// First replacement payload for an app→server frame.
    pub fn process_ws_outgoing_frame(&self, payload: &[u8], url: &str) -> Option<(Vec<u8>, String)> {
        self.process_ws_frame(MockTarget::WsOutgoing, payload, url)
    }

    /// First replacement payload for a server→app frame.
    pub fn process_ws_incoming_frame(&self, payload: &[u8], url: &str) -> Option<(Vec<u8>, String)> {
        self.process_ws_frame(MockTarget::WsIncoming, payload, url)
    }

    fn process_ws_frame(
        &self,
        target: MockTarget,
        payload: &[u8],
        url: &str,
    ) -> Option<(Vec<u8>, String)> {
        let snapshot = self.snapshot();
        for compiled in snapshot.iter() {
            if !compiled.rule.enabled || compiled.rule.target != target {
                continue;
            }
            if !compiled.url.admits(url) {
                continue;
            }
            if let Some(needle) = &compiled.rule.condition.payload_contains {
                if !String::from_utf8_lossy(payload).contains(needle.as_str()) {
                    continue;
                }
            }
            if let Some(replacement) = &compiled.rule.action.ws_payload {
                return Some((replacement.clone(), compiled.rule.id.clone()));
            }
        }
        None
    }
}

fn http_condition_matches(compiled: &CompiledMock, req: &HttpRequest) -> bool {
    let cond: &MockCondition = &compiled.rule.condition;
    if !compiled.url.admits(&req.url) {
        return false;
    }
    if let Some(method) = cond.method {
        if method != req.method {
            return false;
        }
    }
    // Status conditions can only be checked against a live response; before
    // the network they cannot hold.
    if cond.status_code.is_some() {
        return false;
    }
    for (name, needle) in &cond.headers_contain {
        match req.header(name) {
            Some(value) if value.contains(needle.as_str()) => {}
            _ => return false,
        }
    }
    if let Some(needle) = &cond.body_contains {
        let body = req.body.as_deref().unwrap_or_default();
        if !String::from_utf8_lossy(body).contains(needle.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HttpMethod, MockAction};
    use std::collections::HashMap;

    fn rule(id: &str, target: MockTarget, priority: i32) -> MockRule {
        MockRule {
            id: id.to_string(),
            name: id.to_string(),
            target,
            condition: MockCondition::default(),
            action: MockAction::default(),
            priority,
            enabled: true,
        }
    }

    fn request(url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, url, HashMap::new())
    }

    #[test]
    fn first_response_rule_in_priority_order_wins() {
        let engine = MockRuleEngine::new();
        let mut low = rule("low", MockTarget::HttpResponse, 1);
        low.action.mock_status_code = Some(500);
        let mut high = rule("high", MockTarget::HttpResponse, 10);
        high.action.mock_status_code = Some(418);
        engine.update_rules(vec![low, high]);

        let decision = engine.process_http_request(&request("https://api.example.com/v1/ping"));
        let response = decision.response.expect("mocked");
        assert_eq!(response.status, 418);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("high"));
    }

    #[test]
    fn request_overrides_accumulate_before_response_mock() {
        let engine = MockRuleEngine::new();
        let mut headers = rule("headers", MockTarget::HttpRequest, 20);
        headers
            .action
            .request_headers
            .insert("X-Debug".to_string(), "1".to_string());
        let mut body = rule("body", MockTarget::HttpRequest, 15);
        body.action.request_body = Some(b"patched".to_vec());
        let mut mock = rule("mock", MockTarget::HttpResponse, 10);
        mock.action.mock_status_code = Some(204);
        engine.update_rules(vec![mock, body, headers]);

        let decision = engine.process_http_request(&request("https://api.example.com/x"));
        assert_eq!(decision.request.header("x-debug"), Some("1"));
        assert_eq!(decision.request.body.as_deref(), Some(&b"patched"[..]));
        assert_eq!(decision.response.expect("mocked").status, 204);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("mock"));
    }

    #[test]
    fn url_pattern_gates_the_rule() {
        let engine = MockRuleEngine::new();
        let mut mock = rule("ping", MockTarget::HttpResponse, 10);
        mock.condition.url_pattern = Some("*/v1/ping".to_string());
        mock.action.mock_status_code = Some(418);
        engine.update_rules(vec![mock]);

        let hit = engine.process_http_request(&request("https://api.example.com/v1/ping"));
        assert!(hit.response.is_some());
        let miss = engine.process_http_request(&request("https://api.example.com/v1/pong"));
        assert!(miss.response.is_none());
        assert!(miss.matched_rule_id.is_none());
    }

    #[test]
    fn condition_checks_method_headers_and_body() {
        let engine = MockRuleEngine::new();
        let mut mock = rule("strict", MockTarget::HttpResponse, 10);
        mock.condition.method = Some(HttpMethod::Post);
        mock.condition
            .headers_contain
            .insert("Content-Type".to_string(), "json".to_string());
        mock.condition.body_contains = Some("qty".to_string());
        mock.action.mock_status_code = Some(200);
        engine.update_rules(vec![mock]);

        let mut req = HttpRequest::new(
            HttpMethod::Post,
            "https://shop.example.com/checkout",
            HashMap::from([("content-type".to_string(), "application/json".to_string())]),
        );
        req.body = Some(b"{\"qty\":1}".to_vec());
        assert!(engine.process_http_request(&req).response.is_some());

        req.body = Some(b"{}".to_vec());
        assert!(engine.process_http_request(&req).response.is_none());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = MockRuleEngine::new();
        let mut mock = rule("off", MockTarget::HttpResponse, 10);
        mock.enabled = false;
        mock.action.mock_status_code = Some(418);
        engine.update_rules(vec![mock]);
        assert!(engine
            .process_http_request(&request("https://x.example.com/"))
            .response
            .is_none());
    }

    #[test]
    fn updates_replace_and_resort_the_list() {
        let engine = MockRuleEngine::new();
        engine.update_rules(vec![
            rule("a", MockTarget::HttpRequest, 1),
            rule("b", MockTarget::HttpRequest, 5),
            rule("c", MockTarget::HttpRequest, 5),
        ]);
        let ids: Vec<String> = engine.rules_vec().into_iter().map(|r| r.id).collect();
        // Descending priority; equal priorities keep input order.
        assert_eq!(ids, vec!["b", "c", "a"]);

        assert!(engine.remove_rule("b"));
        assert!(!engine.remove_rule("b"));
        assert_eq!(engine.rules_vec().len(), 2);

        engine.clear_rules();
        assert!(engine.rules_vec().is_empty());
    }

    #[test]
    fn ws_frames_take_first_replacement_payload() {
        let engine = MockRuleEngine::new();
        let mut out = rule("out", MockTarget::WsOutgoing, 10);
        out.condition.payload_contains = Some("hello".to_string());
        out.action.ws_payload = Some(b"replaced".to_vec());
        let mut inc = rule("in", MockTarget::WsIncoming, 10);
        inc.action.ws_payload = Some(b"inbound".to_vec());
        engine.update_rules(vec![out, inc]);

        let swapped = engine
            .process_ws_outgoing_frame(b"hello world", "wss://chat.example.com/socket")
            .expect("replacement");
        assert_eq!(swapped.0, b"replaced");
        assert_eq!(swapped.1, "out");

        assert!(engine
            .process_ws_outgoing_frame(b"goodbye", "wss://chat.example.com/socket")
            .is_none());

        let inbound = engine
            .process_ws_incoming_frame(b"anything", "wss://chat.example.com/socket")
            .expect("replacement");
        assert_eq!(inbound.0, b"inbound");
    }
}
