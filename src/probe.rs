//! Probe lifecycle controller
//!
//! Wires the bus, spill queue, rule engines, pipeline, inspector and
//! bridge together as plain owned services. The host constructs one
//! [`Probe`], starts it, feeds captured traffic into its pipeline and
//! consumes bridge notices from the returned channel.

use crate::bridge::{
    BridgeClient, BridgeHooks, BridgeNotice, ConnectionState, DeviceInfo, ExportRequest,
    SocketConnector, WsConnector,
};
use crate::bus::{DropPolicy, EventBus};
use crate::config::ProbeConfig;
use crate::inspector::{DbInspector, RegisteredDb};
use crate::models::{DebugEvent, LogEvent};
use crate::pipeline::Pipeline;
use crate::rules::{
    BreakpointEngine, BreakpointHit, ChaosEngine, MockRuleEngine, DEFAULT_BREAKPOINT_TIMEOUT,
};
use crate::spill::{SpillConfig, SpillQueue};
use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How many recently captured events stay queryable for `requestExport`.
const RECENT_EVENTS_CAP: usize = 1_000;

/// Bounded ring of recently captured events, fed from the bus side channel.
pub struct RecentEvents {
    ring: Mutex<VecDeque<DebugEvent>>,
    cap: usize,
}

impl RecentEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap: cap.max(1),
        }
    }

    pub fn push(&self, event: DebugEvent) {
        let mut ring = self.ring.lock().expect("recent ring poisoned");
        if ring.len() >= self.cap {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Events inside the export window, filtered by kind label. An empty
    /// type list means everything.
    pub fn export(&self, request: &ExportRequest) -> Vec<DebugEvent> {
        let from = request.time_from.timestamp_millis();
        let to = request.time_to.timestamp_millis();
        let ring = self.ring.lock().expect("recent ring poisoned");
        ring.iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .filter(|e| {
                request.types.is_empty()
                    || request.types.iter().any(|t| t == e.kind.label())
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("recent ring poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Probe {
    config: ProbeConfig,
    bus: Arc<EventBus>,
    mocks: Arc<MockRuleEngine>,
    breakpoints: Arc<BreakpointEngine>,
    chaos: Arc<ChaosEngine>,
    inspector: Arc<DbInspector>,
    pipeline: Arc<Pipeline>,
    recent: Arc<RecentEvents>,
    network_capture: Arc<AtomicBool>,
    log_capture: Arc<AtomicBool>,
    device_info: DeviceInfo,
    // Consumed on start
    hit_rx: Option<mpsc::UnboundedReceiver<BreakpointHit>>,
    connector: Option<Box<dyn SocketConnector>>,
    bridge: Option<BridgeClient>,
    spill: Option<SpillQueue>,
}

impl Probe {
    /// Build a probe with the production WebSocket connector.
    pub fn new(config: ProbeConfig, device_info: DeviceInfo) -> Self {
        Self::with_connector(config, device_info, Box::new(WsConnector))
    }

    /// Build a probe with a custom hub connector (tests use a loopback).
    pub fn with_connector(
        config: ProbeConfig,
        device_info: DeviceInfo,
        connector: Box<dyn SocketConnector>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.max_buffer_size, DropPolicy::DropOldest));
        let (hit_tx, hit_rx) = mpsc::unbounded_channel();
        let mocks = Arc::new(MockRuleEngine::new());
        let breakpoints = Arc::new(BreakpointEngine::new(hit_tx, DEFAULT_BREAKPOINT_TIMEOUT));
        let chaos = Arc::new(ChaosEngine::new());
        let network_capture = Arc::new(AtomicBool::new(config.enable_network_capture));
        let log_capture = Arc::new(AtomicBool::new(config.enable_log_capture));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&bus),
            Arc::clone(&mocks),
            Arc::clone(&breakpoints),
            Arc::clone(&chaos),
            Arc::clone(&network_capture),
            config.network_capture_scope,
        ));

        let recent = Arc::new(RecentEvents::new(RECENT_EVENTS_CAP));
        {
            let recent = Arc::clone(&recent);
            bus.subscribe(move |event| recent.push(event.clone()));
        }

        Self {
            config,
            bus,
            mocks,
            breakpoints,
            chaos,
            inspector: Arc::new(DbInspector::new()),
            pipeline,
            recent,
            network_capture,
            log_capture,
            device_info,
            hit_rx: Some(hit_rx),
            connector: Some(connector),
            bridge: None,
            spill: None,
        }
    }

    /// Open the spill queue and spawn the bridge. Returns the notice
    /// channel the host consumes.
    pub fn start(&mut self) -> anyhow::Result<mpsc::UnboundedReceiver<BridgeNotice>> {
        let hit_rx = self
            .hit_rx
            .take()
            .ok_or_else(|| anyhow!("probe already started"))?;
        let connector = self
            .connector
            .take()
            .ok_or_else(|| anyhow!("probe already started"))?;

        let spill = if self.config.enable_persistence {
            let queue = SpillQueue::open(
                &self.config.storage_path.join("spill"),
                SpillConfig {
                    max_queue_size: self.config.max_persistence_queue_size,
                    max_retention: self.config.persistence_retention(),
                },
            )?;
            Some(queue)
        } else {
            None
        };
        self.spill = spill.clone();

        let hooks = BridgeHooks {
            bus: Arc::clone(&self.bus),
            spill,
            mocks: Arc::clone(&self.mocks),
            breakpoints: Arc::clone(&self.breakpoints),
            chaos: Arc::clone(&self.chaos),
            inspector: Arc::clone(&self.inspector),
            network_capture: Arc::clone(&self.network_capture),
            log_capture: Arc::clone(&self.log_capture),
            recent: Arc::clone(&self.recent),
            device_info: self.device_info.clone(),
        };

        let (bridge, notices) = BridgeClient::start(
            self.config.hub_url.clone(),
            self.config.token.clone(),
            self.config.bridge.clone(),
            hooks,
            connector,
            hit_rx,
        );
        self.bridge = Some(bridge);
        tracing::info!(hub = %self.config.hub_url, "probe started");
        Ok(notices)
    }

    /// Stop uplink; capture keeps feeding the bus (and spill via flush on
    /// the next start).
    pub fn stop(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.disconnect();
        }
    }

    pub fn reconnect(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.reconnect();
        }
    }

    pub fn bridge_state(&self) -> ConnectionState {
        self.bridge
            .as_ref()
            .map(|b| b.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// The interception pipeline host instrumentation drives.
    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Offer a SQLite database for hub inspection.
    pub fn register_database(&self, db: RegisteredDb) {
        self.inspector.register_database(db);
    }

    /// Entry point for the host log adapter.
    pub fn capture_log(&self, event: LogEvent) {
        if self.log_capture.load(Ordering::Relaxed) {
            self.bus.enqueue(DebugEvent::log(event));
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn spill_count(&self) -> usize {
        self.spill.as_ref().map(|s| s.queue_count()).unwrap_or(0)
    }
}
