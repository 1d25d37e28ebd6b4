//! Shared vocabulary of the fathom debug orchestrator.
//!
//! `fathom-dap` and `fathom-cdp` each drive one debug-capable runtime over its
//! native wire protocol; this crate holds everything both sides agree on: the
//! launch configuration, the records crossing the caller boundary
//! (breakpoints, stack frames, variables, stop results), the error taxonomy,
//! the [`DebugAdapter`] contract, and the loopback port utilities used when
//! spawning debuggees.

pub mod adapter;
pub mod config;
pub mod error;
pub mod net;
pub mod process;

use serde::{Deserialize, Serialize};

pub use adapter::{await_stop, DebugAdapter, STOP_TIMEOUT};
pub use config::{AdapterFamily, LaunchConfig};
pub use error::{DebugError, DebugResult};

/// One requested source breakpoint, 1-based lines and columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    /// When set, hitting the breakpoint logs the message instead of pausing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

impl SourceBreakpoint {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }
}

/// A breakpoint as the session registry remembers it: the request fields plus
/// what the adapter reported back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
    pub verified: bool,
    /// Adapter-assigned identifier: numeric for DAP adapters, an opaque
    /// string for CDP ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Per-breakpoint outcome of an adapter `set_breakpoints` call, parallel to
/// the requested list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakpointResult {
    pub verified: bool,
    /// Line the adapter actually bound, which may differ from the request.
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Where the debuggee came to rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Outcome of every operation that lets the debuggee run: the next pause, or
/// the end of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResult {
    /// Short token such as "entry", "breakpoint", "step", "exception",
    /// "terminated".
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// Mutually exclusive with a meaningful location.
    #[serde(default)]
    pub terminated: bool,
}

impl StopResult {
    pub fn entry() -> Self {
        Self {
            reason: "entry".to_string(),
            ..Self::default()
        }
    }

    pub fn terminated() -> Self {
        Self {
            reason: "terminated".to_string(),
            terminated: true,
            ..Self::default()
        }
    }
}

/// One level of the debuggee's call stack. The `id` is an adapter-internal
/// handle usable as `frame_id` in later variable/evaluate requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FrameSource>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A named value in some scope, rendered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the value is expandable. A hint only; no recursive
    /// expansion is performed.
    #[serde(default)]
    pub variables_reference: i64,
}

/// Result of evaluating an expression in the debuggee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub result: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}
