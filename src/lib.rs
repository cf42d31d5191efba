//! # Probelink
//!
//! On-device debug probe: captures HTTP/WebSocket traffic and application
//! logs, streams them to a remote debug hub over a persistent WebSocket,
//! and applies hub-driven mock, breakpoint and fault-injection policies to
//! outgoing traffic. A secondary command surface lets the hub inspect
//! registered SQLite databases read-only.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Host application                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     Probelink (this crate)                   │
//! │  ┌──────────┐  ┌─────────┐  ┌─────────┐  ┌───────────────┐   │
//! │  │ Pipeline │──│  Rules  │  │  Event  │──│ Bridge client │   │
//! │  │  (HTTP/  │  │ (mock/  │  │   bus   │  │  (hub duplex  │   │
//! │  │   WS)    │  │ break/  │  │ + spill │  │   channel)    │   │
//! │  │          │  │ chaos)  │  │  queue  │  │               │   │
//! │  └──────────┘  └─────────┘  └─────────┘  └───────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host owns a [`probe::Probe`], feeds captured requests into its
//! pipeline and log events into `capture_log`. Everything else — batching,
//! reconnection, rule updates, breakpoint suspension, disk spill and
//! recovery — happens inside the probe's background tasks.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod inspector;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod replay;
pub mod rules;
pub mod spill;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
