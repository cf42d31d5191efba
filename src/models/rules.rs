//! Hot-swappable traffic rules
//!
//! Mock, breakpoint and chaos rules share the same shape: a match condition,
//! an action, a priority and an enabled flag. The hub replaces whole rule
//! lists at runtime; the engines keep them sorted by descending priority.

use crate::models::b64;
use crate::models::HttpMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a mock rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MockTarget {
    HttpRequest,
    HttpResponse,
    WsOutgoing,
    WsIncoming,
}

/// Match condition for mock rules.
///
/// `url_pattern` is a regex when bracketed by `^`/`$`, a `*`-glob when it
/// contains `*`, and a substring otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockCondition {
    pub url_pattern: Option<String>,
    pub method: Option<HttpMethod>,
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers_contain: HashMap<String, String>,
    pub body_contains: Option<String>,
    /// Substring match against WebSocket frame payloads
    pub payload_contains: Option<String>,
}

/// What a matched mock rule does
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockAction {
    /// Header overrides merged into the outgoing request
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Request body replacement
    #[serde(default, with = "b64::optional")]
    pub request_body: Option<Vec<u8>>,
    /// Full mock response; set `mock_status_code` to activate
    pub mock_status_code: Option<u16>,
    #[serde(default)]
    pub mock_headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub mock_body: Option<Vec<u8>>,
    /// Replacement payload for WebSocket frame targets
    #[serde(default, with = "b64::optional")]
    pub ws_payload: Option<Vec<u8>>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRule {
    pub id: String,
    pub name: String,
    pub target: MockTarget,
    #[serde(default)]
    pub condition: MockCondition,
    #[serde(default)]
    pub action: MockAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

/// Which side of the exchange a breakpoint suspends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointPhase {
    Request,
    Response,
    Both,
}

impl BreakpointPhase {
    pub fn covers_request(&self) -> bool {
        matches!(self, BreakpointPhase::Request | BreakpointPhase::Both)
    }

    pub fn covers_response(&self) -> bool {
        matches!(self, BreakpointPhase::Response | BreakpointPhase::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointRule {
    pub id: String,
    pub name: String,
    pub url_pattern: Option<String>,
    pub method: Option<HttpMethod>,
    pub phase: BreakpointPhase,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

/// Fault kinds a chaos rule can inject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChaosKind {
    Latency { min_ms: u64, max_ms: u64 },
    Timeout,
    ConnectionReset,
    RandomError { codes: Vec<u16> },
    CorruptResponse,
    SlowNetwork { bytes_per_sec: u64 },
    DropRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosRule {
    pub id: String,
    pub name: String,
    pub url_pattern: Option<String>,
    pub method: Option<HttpMethod>,
    /// Firing probability in [0, 1]
    pub probability: f64,
    pub chaos: ChaosKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}
