//! Traffic interception pipeline
//!
//! Every captured HTTP request runs the same ordered protocol: chaos,
//! request breakpoint, mocks, the real network call, response breakpoint,
//! response corruption, then the final event record. The network call is
//! behind the [`HttpTransport`] trait so platform instrumentation stays
//! outside this crate.

use crate::bus::EventBus;
use crate::config::CaptureScope;
use crate::models::{
    DebugEvent, HttpEvent, HttpRequest, HttpResponse, WsDirection, WsEvent, WsFrame, WsOpcode,
    WsSession,
};
use crate::rules::{
    BreakpointAction, BreakpointEngine, ChaosEngine, ChaosFailure, ChaosResponseResult,
    ChaosResult, MockRuleEngine,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Largest request/response body slice kept on a recorded event
pub const MAX_BODY_CAPTURE_BYTES: usize = 512 * 1024;
/// Largest WebSocket payload slice kept on a recorded frame
pub const MAX_WS_CAPTURE_BYTES: usize = 256 * 1024;

/// The seam to the host HTTP stack: performs the real network call.
pub trait HttpTransport: Send + Sync {
    fn execute(
        &self,
        req: &HttpRequest,
    ) -> impl Future<Output = anyhow::Result<HttpResponse>> + Send;
}

/// Per-request state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Captured,
    ChaosDropped,
    ChaosFailed,
    Delaying,
    PendingRequestBreak,
    Mocking,
    InFlight,
    PendingResponseBreak,
    ChaosCorrupted,
    Reported,
}

impl RequestPhase {
    fn rank(self) -> u8 {
        match self {
            RequestPhase::Captured => 0,
            RequestPhase::ChaosDropped | RequestPhase::ChaosFailed | RequestPhase::Delaying => 1,
            RequestPhase::PendingRequestBreak => 2,
            RequestPhase::Mocking => 3,
            RequestPhase::InFlight => 4,
            RequestPhase::PendingResponseBreak => 5,
            RequestPhase::ChaosCorrupted => 6,
            RequestPhase::Reported => 7,
        }
    }
}

/// Why a request never produced a normal response
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFailure {
    Chaos(ChaosFailure),
    Aborted,
    Transport(String),
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestFailure::Chaos(ChaosFailure::Dropped) => f.write_str("dropped"),
            RequestFailure::Chaos(ChaosFailure::Timeout) => f.write_str("timeout"),
            RequestFailure::Chaos(ChaosFailure::ConnectionReset) => f.write_str("connection reset"),
            RequestFailure::Aborted => f.write_str("aborted"),
            RequestFailure::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

/// What the host call path receives back
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// The request as it finally left the pipeline
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    pub failure: Option<RequestFailure>,
    pub mocked: bool,
    pub matched_rule_id: Option<String>,
    pub phase: RequestPhase,
}

pub struct Pipeline {
    bus: Arc<EventBus>,
    mocks: Arc<MockRuleEngine>,
    breakpoints: Arc<BreakpointEngine>,
    chaos: Arc<ChaosEngine>,
    network_capture: Arc<AtomicBool>,
    scope: CaptureScope,
}

impl Pipeline {
    pub fn new(
        bus: Arc<EventBus>,
        mocks: Arc<MockRuleEngine>,
        breakpoints: Arc<BreakpointEngine>,
        chaos: Arc<ChaosEngine>,
        network_capture: Arc<AtomicBool>,
        scope: CaptureScope,
    ) -> Self {
        Self {
            bus,
            mocks,
            breakpoints,
            chaos,
            network_capture,
            scope,
        }
    }

    fn http_capture_on(&self) -> bool {
        self.network_capture.load(Ordering::Relaxed) && self.scope.includes_http()
    }

    fn ws_capture_on(&self) -> bool {
        self.network_capture.load(Ordering::Relaxed) && self.scope.includes_websocket()
    }

    /// Run one captured request through the full protocol.
    pub async fn run_http<T: HttpTransport>(
        &self,
        req: HttpRequest,
        transport: &T,
    ) -> PipelineOutcome {
        let started = Instant::now();
        let mut phase = RequestPhase::Captured;
        let mut req = req;

        // Step 1: record the captured request before anything touches it.
        if self.http_capture_on() {
            self.bus.enqueue(DebugEvent::http(HttpEvent {
                request: truncate_request(&req),
                response: None,
                mocked: false,
                matched_rule_id: None,
                failure: None,
            }));
        }

        // Step 2: chaos, request phase.
        match self.chaos.evaluate(&req) {
            ChaosResult::Drop => {
                advance(&mut phase, RequestPhase::ChaosDropped);
                let failure = RequestFailure::Chaos(ChaosFailure::Dropped);
                self.record_final(&req, None, false, None, Some(&failure));
                return PipelineOutcome {
                    request: req,
                    response: None,
                    failure: Some(failure),
                    mocked: false,
                    matched_rule_id: None,
                    phase,
                };
            }
            ChaosResult::Timeout => {
                advance(&mut phase, RequestPhase::ChaosFailed);
                let failure = RequestFailure::Chaos(ChaosFailure::Timeout);
                self.record_final(&req, None, false, None, Some(&failure));
                return PipelineOutcome {
                    request: req,
                    response: None,
                    failure: Some(failure),
                    mocked: false,
                    matched_rule_id: None,
                    phase,
                };
            }
            ChaosResult::ConnectionReset => {
                advance(&mut phase, RequestPhase::ChaosFailed);
                let failure = RequestFailure::Chaos(ChaosFailure::ConnectionReset);
                self.record_final(&req, None, false, None, Some(&failure));
                return PipelineOutcome {
                    request: req,
                    response: None,
                    failure: Some(failure),
                    mocked: false,
                    matched_rule_id: None,
                    phase,
                };
            }
            ChaosResult::ErrorResponse(status) => {
                advance(&mut phase, RequestPhase::ChaosFailed);
                let mut response = HttpResponse::new(status, Default::default(), None);
                response.status_message = Some("injected error".to_string());
                response.duration_ms = elapsed_ms(started);
                self.record_final(&req, Some(&response), false, None, None);
                advance(&mut phase, RequestPhase::Reported);
                return PipelineOutcome {
                    request: req,
                    response: Some(response),
                    failure: None,
                    mocked: false,
                    matched_rule_id: None,
                    phase,
                };
            }
            ChaosResult::Delay(ms) => {
                advance(&mut phase, RequestPhase::Delaying);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            ChaosResult::None => {}
        }

        // Step 3: request breakpoint.
        let mut mocked = false;
        let mut matched_rule_id: Option<String> = None;
        let mut response: Option<HttpResponse> = None;
        if self.breakpoints.has_request_breakpoint(&req) {
            advance(&mut phase, RequestPhase::PendingRequestBreak);
            match self.breakpoints.check_request_breakpoint(&req).await {
                BreakpointAction::Resume => {}
                BreakpointAction::Modify { request, .. } => {
                    if let Some(snapshot) = request {
                        snapshot.apply_to(&mut req);
                    }
                }
                BreakpointAction::Abort => {
                    let failure = RequestFailure::Aborted;
                    self.record_final(&req, None, false, None, Some(&failure));
                    advance(&mut phase, RequestPhase::Reported);
                    return PipelineOutcome {
                        request: req,
                        response: None,
                        failure: Some(failure),
                        mocked: false,
                        matched_rule_id: None,
                        phase,
                    };
                }
                BreakpointAction::MockResponse(snapshot) => {
                    mocked = true;
                    response = Some(snapshot.into_response());
                }
            }
        }

        // Step 4: mock rules (skipped when the breakpoint already mocked).
        if response.is_none() {
            let decision = self.mocks.process_http_request(&req);
            req = decision.request;
            if let Some(delay_ms) = decision.delay_ms {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if let Some(mock) = decision.response {
                advance(&mut phase, RequestPhase::Mocking);
                mocked = true;
                matched_rule_id = decision.matched_rule_id;
                response = Some(mock);
            } else {
                matched_rule_id = decision.matched_rule_id;
            }
        }

        // Step 5: the real network call.
        let mut response = match response {
            Some(resp) => resp,
            None => {
                advance(&mut phase, RequestPhase::InFlight);
                match transport.execute(&req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        let failure = RequestFailure::Transport(e.to_string());
                        self.record_final(&req, None, mocked, matched_rule_id.as_deref(), Some(&failure));
                        advance(&mut phase, RequestPhase::Reported);
                        return PipelineOutcome {
                            request: req,
                            response: None,
                            failure: Some(failure),
                            mocked,
                            matched_rule_id,
                            phase,
                        };
                    }
                }
            }
        };

        // Step 6: response breakpoint.
        if self.breakpoints.has_response_breakpoint(&req) {
            advance(&mut phase, RequestPhase::PendingResponseBreak);
            match self.breakpoints.check_response_breakpoint(&req, &response).await {
                BreakpointAction::Resume => {}
                BreakpointAction::Modify { response: snap, .. } => {
                    if let Some(snapshot) = snap {
                        response = snapshot.into_response();
                    }
                }
                BreakpointAction::Abort => {
                    response = HttpResponse::new(0, Default::default(), None);
                    response.status_message = Some("aborted at breakpoint".to_string());
                }
                BreakpointAction::MockResponse(snapshot) => {
                    mocked = true;
                    response = snapshot.into_response();
                }
            }
        }

        // Step 7: response corruption.
        if let Some(body) = response.body.clone() {
            if let ChaosResponseResult::CorruptedData(corrupted) =
                self.chaos.evaluate_response(&req, &body)
            {
                advance(&mut phase, RequestPhase::ChaosCorrupted);
                response.body = Some(corrupted);
            }
        }

        // Step 8: the final record.
        if response.duration_ms == 0 {
            response.duration_ms = elapsed_ms(started);
        }
        self.record_final(&req, Some(&response), mocked, matched_rule_id.as_deref(), None);
        advance(&mut phase, RequestPhase::Reported);
        PipelineOutcome {
            request: req,
            response: Some(response),
            failure: None,
            mocked,
            matched_rule_id,
            phase,
        }
    }

    fn record_final(
        &self,
        req: &HttpRequest,
        response: Option<&HttpResponse>,
        mocked: bool,
        matched_rule_id: Option<&str>,
        failure: Option<&RequestFailure>,
    ) {
        if !self.http_capture_on() {
            return;
        }
        self.bus.enqueue(DebugEvent::http(HttpEvent {
            request: truncate_request(req),
            response: response.map(truncate_response),
            mocked,
            matched_rule_id: matched_rule_id.map(str::to_string),
            failure: failure.map(|f| f.to_string()),
        }));
    }

    /// Record a WebSocket session open.
    pub fn record_ws_session_created(&self, session: &WsSession) {
        if self.ws_capture_on() {
            self.bus
                .enqueue(DebugEvent::web_socket(WsEvent::SessionCreated(session.clone())));
        }
    }

    /// Record a WebSocket session close.
    pub fn record_ws_session_closed(&self, session: &WsSession) {
        if self.ws_capture_on() {
            self.bus
                .enqueue(DebugEvent::web_socket(WsEvent::SessionClosed(session.clone())));
        }
    }

    /// Run an app→server frame through the mock rules; returns the payload
    /// to actually send.
    pub fn process_ws_outgoing_frame(
        &self,
        session: &WsSession,
        opcode: WsOpcode,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        self.process_ws_frame(session, WsDirection::Send, opcode, payload)
    }

    /// Run a server→app frame through the mock rules; returns the payload
    /// to actually deliver.
    pub fn process_ws_incoming_frame(
        &self,
        session: &WsSession,
        opcode: WsOpcode,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        self.process_ws_frame(session, WsDirection::Receive, opcode, payload)
    }

    fn process_ws_frame(
        &self,
        session: &WsSession,
        direction: WsDirection,
        opcode: WsOpcode,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        let replacement = match direction {
            WsDirection::Send => self.mocks.process_ws_outgoing_frame(&payload, &session.url),
            WsDirection::Receive => self.mocks.process_ws_incoming_frame(&payload, &session.url),
        };
        let (out, is_mocked, mock_rule_id) = match replacement {
            Some((replaced, rule_id)) => (replaced, true, Some(rule_id)),
            None => (payload, false, None),
        };
        if self.ws_capture_on() {
            let mut captured = out.clone();
            captured.truncate(MAX_WS_CAPTURE_BYTES);
            self.bus.enqueue(DebugEvent::web_socket(WsEvent::Frame(WsFrame {
                session_id: session.id.clone(),
                direction,
                opcode,
                payload: captured,
                is_mocked,
                mock_rule_id,
            })));
        }
        out
    }
}

fn advance(phase: &mut RequestPhase, next: RequestPhase) {
    debug_assert!(
        next.rank() >= phase.rank(),
        "pipeline stepped backwards: {phase:?} -> {next:?}"
    );
    *phase = next;
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn truncate_request(req: &HttpRequest) -> HttpRequest {
    let mut out = req.clone();
    if let Some(body) = &mut out.body {
        body.truncate(MAX_BODY_CAPTURE_BYTES);
    }
    out
}

fn truncate_response(resp: &HttpResponse) -> HttpResponse {
    let mut out = resp.clone();
    if let Some(body) = &mut out.body {
        body.truncate(MAX_BODY_CAPTURE_BYTES);
    }
    out
}
