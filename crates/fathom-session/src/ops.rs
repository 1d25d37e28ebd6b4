//! The caller-visible operation surface.
//!
//! Every operation returns a `Serialize` record; [`render_json`] gives the
//! transport-agnostic string form. Gated workflows consult
//! [`is_tool_allowed`](crate::phase::is_tool_allowed) before dispatching;
//! `transition_phase` itself is legal in every phase.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use fathom_core::{
    BreakpointInfo, DebugResult, EvaluateResult, LaunchConfig, SourceBreakpoint, StackFrame,
    StopResult, Variable,
};

use crate::manager::SessionManager;
use crate::phase::{Phase, PhaseRegistry, PhaseState};

/// Result of `start_debug_session`: the new session and its entry pause.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStarted {
    pub session_id: String,
    pub stopped: StopResult,
}

/// Render any operation result for display.
pub fn render_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

/// Binds the session manager and the phase registry behind the operation
/// names an external controller uses.
#[derive(Default)]
pub struct Orchestrator {
    manager: SessionManager,
    phases: PhaseRegistry,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn phases(&self) -> &PhaseRegistry {
        &self.phases
    }

    /// Launch the configured program and wait for its entry-point pause.
    pub async fn start_debug_session(&self, config: LaunchConfig) -> DebugResult<SessionStarted> {
        let session = self.manager.create(config).await?;
        let stopped = session.wait_for_initial_pause().await?;
        Ok(SessionStarted {
            session_id: session.id().to_string(),
            stopped,
        })
    }

    /// Tear down the active session, if any. Idempotent; also clears the
    /// session's phase state, since the registry has no GC of its own.
    pub async fn stop_debug_session(&self) {
        if let Some(session_id) = self.manager.stop_all().await {
            self.phases.clear(&session_id);
        }
    }

    pub async fn set_breakpoints(
        &self,
        file: &Path,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> DebugResult<Vec<BreakpointInfo>> {
        let session = self.manager.require_active().await?;
        session.set_breakpoints(file, breakpoints).await
    }

    pub async fn remove_breakpoints(
        &self,
        file: &Path,
        lines: Option<&[u32]>,
    ) -> DebugResult<()> {
        let session = self.manager.require_active().await?;
        session.remove_breakpoints(file, lines).await
    }

    /// Every breakpoint the session knows, keyed by file path.
    pub async fn list_breakpoints(&self) -> DebugResult<BTreeMap<String, Vec<BreakpointInfo>>> {
        let session = self.manager.require_active().await?;
        Ok(session
            .list_breakpoints()
            .await
            .into_iter()
            .map(|(file, list)| (file.display().to_string(), list))
            .collect())
    }

    pub async fn continue_execution(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.manager.require_active().await?.resume(thread_id).await
    }

    pub async fn step_over(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.manager
            .require_active()
            .await?
            .step_over(thread_id)
            .await
    }

    pub async fn step_into(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.manager
            .require_active()
            .await?
            .step_in(thread_id)
            .await
    }

    pub async fn step_out(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.manager
            .require_active()
            .await?
            .step_out(thread_id)
            .await
    }

    pub async fn get_call_stack(&self, thread_id: Option<i64>) -> DebugResult<Vec<StackFrame>> {
        self.manager
            .require_active()
            .await?
            .call_stack(thread_id)
            .await
    }

    pub async fn get_variables(
        &self,
        frame_id: Option<i64>,
        scope: Option<&str>,
        max_depth: Option<u32>,
    ) -> DebugResult<Vec<Variable>> {
        self.manager
            .require_active()
            .await?
            .variables(frame_id, scope, max_depth.unwrap_or(1))
            .await
    }

    pub async fn evaluate_expression(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> DebugResult<EvaluateResult> {
        self.manager
            .require_active()
            .await?
            .evaluate(expression, frame_id)
            .await
    }

    /// Advance the active session's workflow phase.
    pub async fn transition_phase(
        &self,
        to: Phase,
        reason: Option<&str>,
    ) -> DebugResult<PhaseState> {
        let session = self.manager.require_active().await?;
        if let Some(reason) = reason {
            tracing::debug!(session = session.id(), to = %to, "phase transition: {reason}");
        }
        Ok(self.phases.transition(session.id(), to)?)
    }
}
