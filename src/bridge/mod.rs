//! Bridge client
//!
//! Long-lived duplex channel to the debug hub: register, heartbeat,
//! batched event upload, command dispatch, exponential-backoff reconnect
//! and post-reconnect recovery of the spill queue. One work task owns all
//! connection state; host-facing notices flow through a single channel.

mod protocol;
mod socket;

pub use protocol::{
    BreakpointResume, BridgeMessage, DbCommand, DbCommandKind, DbResponse, DeviceInfo,
    ExportRequest, ReplaySpec,
};
pub use socket::{BridgeSocket, SocketConnector, WsConnector};

use crate::bus::EventBus;
use crate::config::BridgeConfig;
use crate::inspector::DbInspector;
use crate::probe::RecentEvents;
use crate::replay;
use crate::rules::{BreakpointAction, BreakpointEngine, BreakpointHit, ChaosEngine, MockRuleEngine};
use crate::spill::SpillQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// Transport faults on the hub channel
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("malformed frame: {0}")]
    Decode(String),
}

/// Which rule list a hub command replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Mock,
    Breakpoint,
    Chaos,
}

/// Host-facing callbacks, delivered on a single channel
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeNotice {
    StateChanged(ConnectionState),
    TransportError(BridgeError),
    HubError { code: i32, message: String },
    CaptureToggled { network: bool, log: bool },
    RulesUpdated { kind: RuleKind, count: usize },
}

/// Everything the bridge reaches into when dispatching hub commands.
pub struct BridgeHooks {
    pub bus: Arc<EventBus>,
    pub spill: Option<SpillQueue>,
    pub mocks: Arc<MockRuleEngine>,
    pub breakpoints: Arc<BreakpointEngine>,
    pub chaos: Arc<ChaosEngine>,
    pub inspector: Arc<DbInspector>,
    pub network_capture: Arc<AtomicBool>,
    pub log_capture: Arc<AtomicBool>,
    pub recent: Arc<RecentEvents>,
    pub device_info: DeviceInfo,
}

enum Command {
    Disconnect,
    Reconnect,
}

/// Exponential reconnect backoff: `r, 2r, 4r, ...` clamped at the maximum,
/// reset on successful registration.
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let factor = 1u64 << self.attempts.min(16);
        let delay = self.base.saturating_mul(factor as u32).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }
}

enum SessionEnd {
    /// Peer closed cleanly or the stream ended
    Closed,
    Transport(BridgeError),
    Manual,
    RetryNow,
}

pub struct BridgeClient {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl BridgeClient {
    /// Spawn the bridge work task. Returns the handle and the notice
    /// channel the host consumes from a single place.
    pub fn start(
        hub_url: String,
        token: String,
        config: BridgeConfig,
        hooks: BridgeHooks,
        connector: Box<dyn SocketConnector>,
        hit_rx: mpsc::UnboundedReceiver<BreakpointHit>,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeNotice>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // Breakpoint hits become frames on the shared outbound lane.
        let hit_forwarder = outbound_tx.clone();
        tokio::spawn(async move {
            let mut hit_rx = hit_rx;
            while let Some(hit) = hit_rx.recv().await {
                if hit_forwarder.send(BridgeMessage::BreakpointHit(hit)).is_err() {
                    break;
                }
            }
        });

        let backoff = Backoff::new(config.reconnect_interval, config.max_reconnect_interval);
        let task = BridgeTask {
            hub_url,
            token,
            config,
            hooks,
            connector,
            command_rx,
            outbound_rx,
            outbound_tx,
            state_tx,
            notice_tx,
            backoff,
            registered: false,
            is_flushing: false,
        };
        tokio::spawn(task.run());

        (
            Self {
                command_tx,
                state_rx,
            },
            notice_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop uplink and suppress reconnection until [`BridgeClient::reconnect`].
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    pub fn reconnect(&self) {
        let _ = self.command_tx.send(Command::Reconnect);
    }
}

struct BridgeTask {
    hub_url: String,
    token: String,
    config: BridgeConfig,
    hooks: BridgeHooks,
    connector: Box<dyn SocketConnector>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    outbound_rx: mpsc::UnboundedReceiver<BridgeMessage>,
    outbound_tx: mpsc::UnboundedSender<BridgeMessage>,
    state_tx: watch::Sender<ConnectionState>,
    notice_tx: mpsc::UnboundedSender<BridgeNotice>,
    backoff: Backoff,
    registered: bool,
    is_flushing: bool,
}

impl BridgeTask {
    async fn run(mut self) {
        let mut manual = false;
        loop {
            while manual {
                match self.command_rx.recv().await {
                    Some(Command::Reconnect) => {
                        manual = false;
                        self.backoff.reset();
                    }
                    Some(Command::Disconnect) => {}
                    None => return,
                }
            }

            if self.config.max_reconnect_attempts > 0
                && self.backoff.attempts() >= self.config.max_reconnect_attempts
            {
                tracing::warn!(
                    attempts = self.backoff.attempts(),
                    "reconnect attempts exhausted; going idle"
                );
                self.notify(BridgeNotice::TransportError(BridgeError::Connect(
                    "reconnect attempts exhausted".to_string(),
                )));
                manual = true;
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            let mut socket = match self.connector.connect(&self.hub_url, &self.token).await {
                Ok(socket) => socket,
                Err(e) => {
                    let error = BridgeError::Connect(format!("{e:#}"));
                    tracing::warn!("{error}");
                    self.notify(BridgeNotice::TransportError(error));
                    self.set_state(ConnectionState::Disconnected);
                    let delay = self.backoff.next_delay();
                    if self.wait_for_retry(delay).await {
                        manual = true;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Connected);
            let register = BridgeMessage::Register {
                device_info: self.hooks.device_info.clone(),
                token: self.token.clone(),
            };
            let end = match self.send_frame(socket.as_mut(), &register).await {
                Err(e) => SessionEnd::Transport(e),
                Ok(()) => self.run_session(socket.as_mut()).await,
            };
            socket.close().await;
            self.registered = false;
            self.set_state(ConnectionState::Disconnected);

            match end {
                SessionEnd::Manual => {
                    manual = true;
                }
                SessionEnd::RetryNow => {
                    self.backoff.reset();
                }
                SessionEnd::Closed => {
                    // Expected disconnect; reconnect quietly.
                    tracing::debug!("hub closed the connection");
                    let delay = self.backoff.next_delay();
                    if self.wait_for_retry(delay).await {
                        manual = true;
                    }
                }
                SessionEnd::Transport(e) => {
                    tracing::warn!("hub session failed: {e}");
                    self.notify(BridgeNotice::TransportError(e));
                    let delay = self.backoff.next_delay();
                    if self.wait_for_retry(delay).await {
                        manual = true;
                    }
                }
            }
        }
    }

    /// Sleep out the backoff delay while keeping the flush timer spilling
    /// captured events to disk. Returns true when a manual disconnect
    /// arrived mid-wait.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut flush = tokio::time::interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                _ = flush.tick() => self.flush_to_spill(),
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Disconnect) | None => return true,
                    Some(Command::Reconnect) => return false,
                },
            }
        }
    }

    async fn run_session(&mut self, socket: &mut dyn BridgeSocket) -> SessionEnd {
        enum Step {
            Frame(Option<anyhow::Result<String>>),
            Heartbeat,
            Flush,
            Recovery,
            Outbound(Option<BridgeMessage>),
            Command(Option<Command>),
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();
        let mut flush = tokio::time::interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let spill_pending = self
                .hooks
                .spill
                .as_ref()
                .map(|s| s.queue_count() > 0)
                .unwrap_or(false);

            let step = tokio::select! {
                frame = socket.next_frame() => Step::Frame(frame),
                _ = heartbeat.tick(), if self.registered => Step::Heartbeat,
                _ = flush.tick() => Step::Flush,
                _ = recovery.tick(), if self.registered && spill_pending => Step::Recovery,
                out = self.outbound_rx.recv() => Step::Outbound(out),
                cmd = self.command_rx.recv() => Step::Command(cmd),
            };

            match step {
                Step::Frame(None) => return SessionEnd::Closed,
                Step::Frame(Some(Err(e))) => {
                    return SessionEnd::Transport(BridgeError::Receive(e.to_string()));
                }
                Step::Frame(Some(Ok(text))) => match BridgeMessage::decode(&text) {
                    Err(e) => {
                        // Decode faults never tear the session down.
                        let error = BridgeError::Decode(e.to_string());
                        tracing::debug!("dropping undecodable hub frame: {error}");
                    }
                    Ok(message) => self.dispatch(message),
                },
                Step::Heartbeat => {
                    if let Err(e) = self.send_frame(socket, &BridgeMessage::Heartbeat).await {
                        return SessionEnd::Transport(e);
                    }
                }
                Step::Flush => {
                    if let Err(e) = self.flush_events(socket).await {
                        return SessionEnd::Transport(e);
                    }
                }
                Step::Recovery => {
                    if let Err(e) = self.recover_batch(socket).await {
                        return SessionEnd::Transport(e);
                    }
                }
                Step::Outbound(None) => return SessionEnd::Closed,
                Step::Outbound(Some(message)) => {
                    if self.registered {
                        if let Err(e) = self.send_frame(socket, &message).await {
                            return SessionEnd::Transport(e);
                        }
                    } else {
                        tracing::debug!("dropping outbound frame before registration");
                    }
                }
                Step::Command(Some(Command::Disconnect)) | Step::Command(None) => {
                    return SessionEnd::Manual;
                }
                Step::Command(Some(Command::Reconnect)) => return SessionEnd::RetryNow,
            }
        }
    }

    /// Route one decoded hub command.
    fn dispatch(&mut self, message: BridgeMessage) {
        match message {
            BridgeMessage::Registered { session_id } => {
                tracing::info!(%session_id, "registered with hub");
                self.registered = true;
                self.backoff.reset();
                self.set_state(ConnectionState::Registered);
            }
            BridgeMessage::ToggleCapture { network, log } => {
                self.hooks.network_capture.store(network, Ordering::Relaxed);
                self.hooks.log_capture.store(log, Ordering::Relaxed);
                self.notify(BridgeNotice::CaptureToggled { network, log });
            }
            BridgeMessage::UpdateMockRules(rules) => {
                let count = rules.len();
                self.hooks.mocks.update_rules(rules);
                self.notify(BridgeNotice::RulesUpdated {
                    kind: RuleKind::Mock,
                    count,
                });
            }
            BridgeMessage::UpdateBreakpointRules(rules) => {
                let count = rules.len();
                self.hooks.breakpoints.update_rules(rules);
                self.notify(BridgeNotice::RulesUpdated {
                    kind: RuleKind::Breakpoint,
                    count,
                });
            }
            BridgeMessage::UpdateChaosRules(rules) => {
                let count = rules.len();
                self.hooks.chaos.update_rules(rules);
                self.notify(BridgeNotice::RulesUpdated {
                    kind: RuleKind::Chaos,
                    count,
                });
            }
            BridgeMessage::BreakpointResume(resume) => {
                let action = translate_resume_action(&resume);
                if let Err(e) = self.hooks.breakpoints.resolve(&resume.request_id, action) {
                    tracing::debug!("breakpoint resume had no taker: {e}");
                }
            }
            BridgeMessage::ReplayRequest(spec) => {
                tokio::spawn(async move {
                    if let Err(e) = replay::execute(spec).await {
                        tracing::warn!("replay failed: {e:#}");
                    }
                });
            }
            BridgeMessage::DbCommand(command) => {
                let inspector = Arc::clone(&self.hooks.inspector);
                let outbound = self.outbound_tx.clone();
                tokio::spawn(async move {
                    let response = inspector.execute(command).await;
                    let _ = outbound.send(BridgeMessage::DbResponse(response));
                });
            }
            BridgeMessage::RequestExport(export) => {
                let events = self.hooks.recent.export(&export);
                tracing::debug!(count = events.len(), "exporting recent events");
                let _ = self.outbound_tx.send(BridgeMessage::Events(events));
            }
            BridgeMessage::Error { code, message } => {
                tracing::warn!(code, %message, "hub reported an error");
                self.notify(BridgeNotice::HubError { code, message });
            }
            // Uplink-only tags arriving inbound are ignored.
            BridgeMessage::Register { .. }
            | BridgeMessage::Heartbeat
            | BridgeMessage::Events(_)
            | BridgeMessage::BreakpointHit(_)
            | BridgeMessage::DbResponse(_) => {
                tracing::debug!("ignoring unexpected inbound frame");
            }
        }
    }

    /// Peek-send-remove while registered; drain to the spill queue while
    /// not. At most one flush in flight.
    async fn flush_events(&mut self, socket: &mut dyn BridgeSocket) -> Result<(), BridgeError> {
        if self.is_flushing {
            return Ok(());
        }
        self.is_flushing = true;
        let result = self.flush_events_inner(socket).await;
        self.is_flushing = false;
        result
    }

    async fn flush_events_inner(
        &mut self,
        socket: &mut dyn BridgeSocket,
    ) -> Result<(), BridgeError> {
        if self.registered {
            let batch = self.hooks.bus.peek(self.config.batch_size);
            if batch.is_empty() {
                return Ok(());
            }
            let count = batch.len();
            self.send_frame(socket, &BridgeMessage::Events(batch)).await?;
            self.hooks.bus.remove_first(count);
        } else {
            self.flush_to_spill();
        }
        Ok(())
    }

    fn flush_to_spill(&self) {
        if let Some(spill) = &self.hooks.spill {
            let drained = self.hooks.bus.dequeue_all();
            if !drained.is_empty() {
                tracing::debug!(count = drained.len(), "spilling events to disk");
                spill.enqueue(drained);
            }
        }
    }

    /// Drain one persisted batch into the uplink.
    async fn recover_batch(&mut self, socket: &mut dyn BridgeSocket) -> Result<(), BridgeError> {
        let Some(spill) = self.hooks.spill.clone() else {
            return Ok(());
        };
        let batch = match spill.dequeue_batch(self.config.recovery_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("spill recovery read failed: {e:#}");
                return Ok(());
            }
        };
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = batch.len(), "recovering spilled events");
        self.send_frame(socket, &BridgeMessage::Events(batch)).await
    }

    async fn send_frame(
        &mut self,
        socket: &mut dyn BridgeSocket,
        message: &BridgeMessage,
    ) -> Result<(), BridgeError> {
        let text = message
            .encode()
            .map_err(|e| BridgeError::Send(e.to_string()))?;
        socket
            .send_text(text)
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let current = *self.state_tx.borrow();
            current != state
        };
        if changed {
            let _ = self.state_tx.send(state);
            self.notify(BridgeNotice::StateChanged(state));
        }
    }

    fn notify(&self, notice: BridgeNotice) {
        let _ = self.notice_tx.send(notice);
    }
}

/// Translate a hub resume command into a breakpoint action. Unknown
/// actions resume.
fn translate_resume_action(resume: &BreakpointResume) -> BreakpointAction {
    match resume.action.as_str() {
        "continue" | "resume" => BreakpointAction::Resume,
        "abort" => BreakpointAction::Abort,
        "modify" => BreakpointAction::Modify {
            request: resume.modified_request.clone(),
            response: resume.modified_response.clone(),
        },
        "mockResponse" => match resume.modified_response.clone() {
            Some(snapshot) => BreakpointAction::MockResponse(snapshot),
            None => BreakpointAction::Resume,
        },
        other => {
            tracing::debug!(action = other, "unknown resume action; resuming");
            BreakpointAction::Resume
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequestSnapshot, ResponseSnapshot};
    use crate::models::HttpMethod;
    use std::collections::HashMap;

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(30));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn bridge_error_names_the_failed_step() {
        assert_eq!(
            BridgeError::Connect("refused".to_string()).to_string(),
            "connect failed: refused"
        );
        assert_eq!(
            BridgeError::Send("pipe closed".to_string()).to_string(),
            "send failed: pipe closed"
        );
        assert_eq!(
            BridgeError::Receive("reset".to_string()).to_string(),
            "receive failed: reset"
        );
        assert_eq!(
            BridgeError::Decode("bad json".to_string()).to_string(),
            "malformed frame: bad json"
        );
    }

    #[test]
    fn resume_action_translation() {
        let base = BreakpointResume {
            breakpoint_id: "b".to_string(),
            request_id: "r".to_string(),
            action: String::new(),
            modified_request: None,
            modified_response: None,
        };

        for action in ["continue", "resume", "someday-new"] {
            let resume = BreakpointResume {
                action: action.to_string(),
                ..base.clone()
            };
            assert_eq!(translate_resume_action(&resume), BreakpointAction::Resume);
        }

        let abort = BreakpointResume {
            action: "abort".to_string(),
            ..base.clone()
        };
        assert_eq!(translate_resume_action(&abort), BreakpointAction::Abort);

        let snapshot = RequestSnapshot {
            method: HttpMethod::Post,
            url: "https://x/".to_string(),
            headers: HashMap::new(),
            body: Some(b"new".to_vec()),
        };
        let modify = BreakpointResume {
            action: "modify".to_string(),
            modified_request: Some(snapshot.clone()),
            ..base.clone()
        };
        assert_eq!(
            translate_resume_action(&modify),
            BreakpointAction::Modify {
                request: Some(snapshot),
                response: None
            }
        );

        let mock = BreakpointResume {
            action: "mockResponse".to_string(),
            modified_response: Some(ResponseSnapshot {
                status: 418,
                headers: HashMap::new(),
                body: None,
            }),
            ..base.clone()
        };
        match translate_resume_action(&mock) {
            BreakpointAction::MockResponse(snap) => assert_eq!(snap.status, 418),
            other => panic!("expected mock response, got {other:?}"),
        }

        // mockResponse without a snapshot falls back to resume.
        let empty_mock = BreakpointResume {
            action: "mockResponse".to_string(),
            ..base
        };
        assert_eq!(translate_resume_action(&empty_mock), BreakpointAction::Resume);
    }
}
