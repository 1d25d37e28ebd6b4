//! Single-active-session lifecycle and per-file breakpoint bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, Mutex};

use fathom_core::{
    BreakpointInfo, BreakpointResult, DebugAdapter, DebugError, DebugResult, EvaluateResult,
    LaunchConfig, SourceBreakpoint, StackFrame, StopResult, Variable,
};

pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn DebugAdapter> + Send + Sync>;

/// Most recent pause of the debuggee, tracked while it lasts. `None` while
/// the debuggee is running or gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedState {
    pub thread_id: Option<i64>,
    pub reason: String,
}

/// One live debuggee behind one adapter, plus the breakpoint registry.
pub struct DebugSession {
    id: String,
    adapter_type: String,
    adapter: Arc<dyn DebugAdapter>,
    breakpoints: Mutex<HashMap<PathBuf, Vec<BreakpointInfo>>>,
    stopped: StdMutex<Option<StoppedState>>,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("adapter_type", &self.adapter_type)
            .field("stopped", &self.stopped.lock().expect("poisoned"))
            .finish()
    }
}

impl DebugSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    pub fn stopped(&self) -> Option<StoppedState> {
        self.stopped.lock().expect("poisoned").clone()
    }

    fn clear_stopped(&self) {
        *self.stopped.lock().expect("poisoned") = None;
    }

    pub async fn wait_for_initial_pause(&self) -> DebugResult<StopResult> {
        self.adapter.wait_for_initial_pause().await
    }

    /// Merge the requested breakpoints into the file's stored list (same
    /// line replaces, new lines append), push the merged list to the
    /// adapter, and store what it reported.
    pub async fn set_breakpoints(
        &self,
        file: &Path,
        requests: Vec<SourceBreakpoint>,
    ) -> DebugResult<Vec<BreakpointInfo>> {
        let mut registry = self.breakpoints.lock().await;

        let mut merged: Vec<SourceBreakpoint> = registry
            .get(file)
            .map(|stored| stored.iter().map(request_of).collect())
            .unwrap_or_default();
        for request in requests {
            match merged.iter_mut().find(|slot| slot.line == request.line) {
                Some(slot) => *slot = request,
                None => merged.push(request),
            }
        }

        let results = self.adapter.set_breakpoints(file, &merged).await?;
        let stored = build_infos(&merged, &results);
        registry.insert(file.to_path_buf(), stored.clone());
        Ok(stored)
    }

    /// Drop the given lines (or every breakpoint when `lines` is `None`) and
    /// re-send the remainder to the adapter. A file left without breakpoints
    /// disappears from the registry.
    pub async fn remove_breakpoints(
        &self,
        file: &Path,
        lines: Option<&[u32]>,
    ) -> DebugResult<()> {
        let mut registry = self.breakpoints.lock().await;

        let remaining: Vec<SourceBreakpoint> = match lines {
            None => Vec::new(),
            Some(lines) => registry
                .get(file)
                .map(|stored| {
                    stored
                        .iter()
                        .filter(|info| !lines.contains(&info.line))
                        .map(request_of)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let results = self.adapter.set_breakpoints(file, &remaining).await?;
        if remaining.is_empty() {
            registry.remove(file);
        } else {
            registry.insert(file.to_path_buf(), build_infos(&remaining, &results));
        }
        Ok(())
    }

    pub async fn list_breakpoints(&self) -> HashMap<PathBuf, Vec<BreakpointInfo>> {
        self.breakpoints.lock().await.clone()
    }

    pub async fn resume(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.clear_stopped();
        self.adapter.resume(thread_id).await
    }

    pub async fn step_over(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.clear_stopped();
        self.adapter.step_over(thread_id).await
    }

    pub async fn step_in(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.clear_stopped();
        self.adapter.step_in(thread_id).await
    }

    pub async fn step_out(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.clear_stopped();
        self.adapter.step_out(thread_id).await
    }

    pub async fn call_stack(&self, thread_id: Option<i64>) -> DebugResult<Vec<StackFrame>> {
        self.adapter.call_stack(thread_id).await
    }

    pub async fn variables(
        &self,
        frame_id: Option<i64>,
        scope: Option<&str>,
        max_depth: u32,
    ) -> DebugResult<Vec<Variable>> {
        self.adapter.variables(frame_id, scope, max_depth).await
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> DebugResult<EvaluateResult> {
        self.adapter.evaluate(expression, frame_id).await
    }
}

fn request_of(info: &BreakpointInfo) -> SourceBreakpoint {
    SourceBreakpoint {
        line: info.line,
        column: info.column,
        condition: info.condition.clone(),
        hit_condition: info.hit_condition.clone(),
        log_message: info.log_message.clone(),
    }
}

fn build_infos(requests: &[SourceBreakpoint], results: &[BreakpointResult]) -> Vec<BreakpointInfo> {
    requests
        .iter()
        .enumerate()
        .map(|(index, request)| {
            let result = results.get(index);
            BreakpointInfo {
                // The adapter may have corrected the line; the corrected one
                // is what later merges key on.
                line: result.map(|result| result.line).unwrap_or(request.line),
                column: request.column,
                condition: request.condition.clone(),
                hit_condition: request.hit_condition.clone(),
                log_message: request.log_message.clone(),
                verified: result.map(|result| result.verified).unwrap_or(false),
                id: result.and_then(|result| result.id.clone()),
            }
        })
        .collect()
}

/// Owns the single active session and the adapter registry.
pub struct SessionManager {
    active: Mutex<Option<Arc<DebugSession>>>,
    counter: AtomicU64,
    registry: Mutex<HashMap<String, AdapterFactory>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// A manager with the built-in adapters registered.
    pub fn new() -> Self {
        let mut registry: HashMap<String, AdapterFactory> = HashMap::new();
        registry.insert(
            "python".to_string(),
            Arc::new(|| Arc::new(fathom_dap::PythonAdapter::new()) as Arc<dyn DebugAdapter>),
        );
        registry.insert(
            "node".to_string(),
            Arc::new(|| Arc::new(fathom_cdp::NodeAdapter::new()) as Arc<dyn DebugAdapter>),
        );
        Self {
            active: Mutex::new(None),
            counter: AtomicU64::new(0),
            registry: Mutex::new(registry),
        }
    }

    /// Register (or replace) an adapter factory under a type selector.
    pub async fn register(&self, adapter_type: impl Into<String>, factory: AdapterFactory) {
        self.registry
            .lock()
            .await
            .insert(adapter_type.into(), factory);
    }

    /// Create a new session, terminating any prior one first.
    pub async fn create(&self, config: LaunchConfig) -> DebugResult<Arc<DebugSession>> {
        self.stop_all().await;

        config.validate()?;
        let adapter_type = config.resolve_adapter_type()?;
        let factory = self
            .registry
            .lock()
            .await
            .get(&adapter_type)
            .cloned()
            .ok_or_else(|| {
                DebugError::Configuration(format!("Unknown adapter type: {adapter_type}"))
            })?;

        let adapter = factory();
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(DebugSession {
            id: format!("session-{number}"),
            adapter_type,
            adapter,
            breakpoints: Mutex::new(HashMap::new()),
            stopped: StdMutex::new(None),
        });

        // The stop listener goes in before the debuggee can run at all.
        spawn_stop_listener(&session);

        if let Err(err) = session.adapter.start(&config).await {
            session.adapter.disconnect().await;
            return Err(err);
        }

        tracing::info!(session = session.id.as_str(), adapter = session.adapter_type.as_str(), "debug session started");
        *self.active.lock().await = Some(session.clone());
        Ok(session)
    }

    pub async fn active(&self) -> Option<Arc<DebugSession>> {
        self.active.lock().await.clone()
    }

    pub async fn require_active(&self) -> DebugResult<Arc<DebugSession>> {
        self.active.lock().await.clone().ok_or_else(|| {
            DebugError::State(
                "No active debug session; start one with start_debug_session".to_string(),
            )
        })
    }

    /// Disconnect and drop the active session, swallowing adapter errors.
    /// Returns the terminated session's id, if there was one.
    pub async fn stop_all(&self) -> Option<String> {
        let session = self.active.lock().await.take()?;
        session.adapter.disconnect().await;
        tracing::info!(session = session.id.as_str(), "debug session stopped");
        Some(session.id.clone())
    }
}

fn spawn_stop_listener(session: &Arc<DebugSession>) {
    let mut stops = session.adapter.subscribe_stops();
    let weak = Arc::downgrade(session);
    tokio::spawn(async move {
        loop {
            match stops.recv().await {
                Ok(stop) => {
                    let Some(session) = weak.upgrade() else { break };
                    let mut stopped = session.stopped.lock().expect("poisoned");
                    *stopped = if stop.terminated {
                        None
                    } else {
                        Some(StoppedState {
                            thread_id: stop.thread_id,
                            reason: stop.reason,
                        })
                    };
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
