//! Session lifecycle and the caller-visible operation surface.
//!
//! - [`manager`]: at most one active debug session, an adapter registry, and
//!   the per-file breakpoint bookkeeping with merge semantics.
//! - [`ops`]: the thin operation surface an external controller calls
//!   (start/stop, breakpoints, control flow, inspection, phase transitions).
//! - [`phase`]: the six-phase workflow state machine gating which operations
//!   are legal at each point of an interactive session.

pub mod manager;
pub mod ops;
pub mod phase;

pub use manager::{DebugSession, SessionManager, StoppedState};
pub use ops::{Orchestrator, SessionStarted};
pub use phase::{is_tool_allowed, Phase, PhaseError, PhaseRegistry, PhaseState};
