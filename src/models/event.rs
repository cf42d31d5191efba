//! Captured event model
//!
//! Every observation the probe makes — an HTTP exchange, a WebSocket
//! session or frame, an application log line — becomes a [`DebugEvent`].
//! Events are immutable once enqueued on the bus.

use crate::models::b64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
}

impl HttpMethod {
    /// Convert from string (lossy, defaults to GET)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            _ => HttpMethod::Get,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured outgoing HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Request identifier; also keys pending breakpoints
    pub id: String,
    pub method: HttpMethod,
    /// Full URL including scheme, host and path
    pub url: String,
    /// Headers with original key casing preserved
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub body: Option<Vec<u8>>,
    /// Milliseconds since epoch at capture time
    pub started_at: i64,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            url: url.to_string(),
            headers,
            body: None,
            started_at: Utc::now().timestamp_millis(),
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The response half of a captured HTTP exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub body: Option<Vec<u8>>,
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HashMap<String, String>, body: Option<Vec<u8>>) -> Self {
        Self {
            status,
            status_message: None,
            headers,
            body,
            duration_ms: 0,
        }
    }
}

/// Direction of a WebSocket frame relative to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    Send,
    Receive,
}

/// WebSocket frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsOpcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
    Continuation,
}

impl WsOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsOpcode::Text => "TEXT",
            WsOpcode::Binary => "BINARY",
            WsOpcode::Ping => "PING",
            WsOpcode::Pong => "PONG",
            WsOpcode::Close => "CLOSE",
            WsOpcode::Continuation => "CONTINUATION",
        }
    }
}

/// A WebSocket session tracked from open to close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSession {
    pub id: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub subprotocols: Vec<String>,
    pub disconnect_time: Option<i64>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
}

impl WsSession {
    pub fn new(url: &str, request_headers: HashMap<String, String>, subprotocols: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            request_headers,
            subprotocols,
            disconnect_time: None,
            close_code: None,
            close_reason: None,
        }
    }
}

/// A single captured WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    pub session_id: String,
    pub direction: WsDirection,
    pub opcode: WsOpcode,
    #[serde(with = "b64::required")]
    pub payload: Vec<u8>,
    pub is_mocked: bool,
    pub mock_rule_id: Option<String>,
}

/// WebSocket observation kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WsEvent {
    SessionCreated(WsSession),
    SessionClosed(WsSession),
    Frame(WsFrame),
}

/// Application log severities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
}

/// A captured application log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: String,
    pub source: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub subsystem: Option<String>,
    pub category: Option<String>,
    /// Opaque thread identification string from the host
    pub thread: String,
    pub file: String,
    pub function: String,
    pub line: u32,
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub trace_id: Option<String>,
}

/// Aggregate statistics. Reserved; nothing emits this yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsEvent {
    #[serde(default)]
    pub counters: HashMap<String, u64>,
}

/// A recorded HTTP exchange: request, optional response, outcome markers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEvent {
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    #[serde(default)]
    pub mocked: bool,
    pub matched_rule_id: Option<String>,
    /// Failure reason when the request never completed ("dropped", "aborted", ...)
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Http(HttpEvent),
    WebSocket(WsEvent),
    Log(LogEvent),
    Stats(StatsEvent),
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Http(_) => "http",
            EventKind::WebSocket(_) => "webSocket",
            EventKind::Log(_) => "log",
            EventKind::Stats(_) => "stats",
        }
    }
}

/// Envelope for everything the probe captures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DebugEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn http(event: HttpEvent) -> Self {
        Self::new(EventKind::Http(event))
    }

    pub fn web_socket(event: WsEvent) -> Self {
        Self::new(EventKind::WebSocket(event))
    }

    pub fn log(event: LogEvent) -> Self {
        Self::new(EventKind::Log(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_lossy() {
        assert_eq!(HttpMethod::from_str_lossy("post"), HttpMethod::Post);
        assert_eq!(HttpMethod::from_str_lossy("bogus"), HttpMethod::Get);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let req = HttpRequest::new(HttpMethod::Get, "https://example.com/", headers);
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn event_envelope_round_trips() {
        let event = DebugEvent::http(HttpEvent {
            request: HttpRequest::new(HttpMethod::Get, "https://example.com/v1/ping", HashMap::new()),
            response: Some(HttpResponse::new(200, HashMap::new(), Some(b"pong".to_vec()))),
            mocked: false,
            matched_rule_id: None,
            failure: None,
        });
        let json = serde_json::to_string(&event).expect("encode");
        assert!(json.contains("\"type\":\"http\""));
        let back: DebugEvent = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, event);
    }

    #[test]
    fn log_level_orders_by_severity() {
        assert!(LogLevel::Error > LogLevel::Warning);
        assert!(LogLevel::Verbose < LogLevel::Debug);
    }
}
