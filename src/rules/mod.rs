//! Rule engines
//!
//! Three priority-ordered match/action evaluators share the URL pattern
//! classifier: mocks rewrite traffic, breakpoints suspend it, chaos breaks
//! it. Writers replace whole lists; readers iterate an immutable snapshot.

mod breakpoint;
mod chaos;
mod mock;
mod pattern;

pub use breakpoint::{
    BreakpointAction, BreakpointEngine, BreakpointHit, HitPhase, DEFAULT_BREAKPOINT_TIMEOUT,
};
pub use chaos::{ChaosEngine, ChaosFailure, ChaosResponseResult, ChaosResult};
pub use mock::{MockDecision, MockRuleEngine};
pub use pattern::{PatternGate, UrlPattern};
