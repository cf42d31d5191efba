//! Hub wire protocol
//!
//! Framed JSON over the WebSocket: every frame is
//! `{ "type": <tag>, "payload": <value> }`, with the payload omitted for
//! `heartbeat`. Dates are ISO-8601; body bytes are base64.

use crate::models::{
    b64, BreakpointRule, ChaosRule, DebugEvent, MockRule, RequestSnapshot, ResponseSnapshot,
};
use crate::rules::BreakpointHit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Host device identity sent at registration. Collection is the host's
/// concern; the probe treats it as opaque data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub os_version: String,
    pub app_id: String,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySpec {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResume {
    pub breakpoint_id: String,
    pub request_id: String,
    /// `continue` | `resume` | `abort` | `modify` | `mockResponse`;
    /// anything else resumes.
    pub action: String,
    pub modified_request: Option<RequestSnapshot>,
    pub modified_response: Option<ResponseSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DbCommandKind {
    ListDatabases,
    ListTables,
    DescribeTable,
    FetchTablePage,
    ExecuteQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCommand {
    pub request_id: String,
    pub kind: DbCommandKind,
    pub db_id: Option<String>,
    pub table: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub order_by: Option<String>,
    pub ascending: Option<bool>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbResponse {
    pub request_id: String,
    pub success: bool,
    /// JSON payload for the matching command kind
    pub payload: Option<serde_json::Value>,
    pub error: Option<crate::inspector::DbInspectorError>,
}

/// Everything that crosses the hub channel, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BridgeMessage {
    Register {
        device_info: DeviceInfo,
        token: String,
    },
    Heartbeat,
    Events(Vec<DebugEvent>),
    BreakpointHit(BreakpointHit),
    Registered {
        session_id: String,
    },
    ToggleCapture {
        network: bool,
        log: bool,
    },
    UpdateMockRules(Vec<MockRule>),
    RequestExport(ExportRequest),
    ReplayRequest(ReplaySpec),
    UpdateBreakpointRules(Vec<BreakpointRule>),
    BreakpointResume(BreakpointResume),
    UpdateChaosRules(Vec<ChaosRule>),
    DbCommand(DbCommand),
    DbResponse(DbResponse),
    Error {
        code: i32,
        message: String,
    },
}

impl BridgeMessage {
    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
