//! Debug adapter for Node programs, driven through the runtime's native
//! inspector over CDP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use fathom_core::net::find_free_port;
use fathom_core::process::{forward_output, monitor_exit};
use fathom_core::{
    await_stop, BreakpointResult, DebugAdapter, DebugError, DebugResult, EvaluateResult,
    FrameSource, LaunchConfig, SourceBreakpoint, SourceLocation, StackFrame, StopResult, Variable,
    STOP_TIMEOUT,
};

use crate::client::{CdpClient, CdpEvent};
use crate::transport::{discover_ws_url, DISCOVERY_TIMEOUT};
use crate::value;

/// Launches a program under `node --inspect-brk` and speaks CDP to it.
///
/// The inspector is single-threaded, so `thread_id` parameters are accepted
/// and ignored throughout.
pub struct NodeAdapter {
    client: Mutex<Option<CdpClient>>,
    stops: broadcast::Sender<StopResult>,
    /// Cancelled when the debuggee or its transport is gone.
    gone: CancellationToken,
    /// Cancelled by `disconnect` to make the child monitor kill the process.
    kill: CancellationToken,
    shared: Arc<Shared>,
    /// Inspector breakpoint ids currently installed, per file.
    breakpoints: Mutex<HashMap<PathBuf, Vec<String>>>,
    /// Armed entry-point pause; consumed by `wait_for_initial_pause`.
    initial: Mutex<Option<broadcast::Receiver<StopResult>>>,
}

/// State the event pump writes and the operations read.
#[derive(Default)]
struct Shared {
    /// scriptId -> absolute file path, from `Debugger.scriptParsed`.
    scripts: StdMutex<HashMap<String, String>>,
    /// Reverse of `scripts`.
    file_to_script: StdMutex<HashMap<String, String>>,
    /// Call frames of the current pause; empty while running.
    paused_frames: StdMutex<Vec<Value>>,
    entry_seen: AtomicBool,
}

impl Default for NodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeAdapter {
    pub fn new() -> Self {
        let (stops, _) = broadcast::channel(64);
        Self {
            client: Mutex::new(None),
            stops,
            gone: CancellationToken::new(),
            kill: CancellationToken::new(),
            shared: Arc::new(Shared::default()),
            breakpoints: Mutex::new(HashMap::new()),
            initial: Mutex::new(None),
        }
    }

    /// Drive an inspector socket that is already open: install the event
    /// pump, arm the entry pause if `start` has not already done so, and
    /// enable the debugger and runtime domains (the latter triggers the
    /// entry-point pause under `--inspect-brk`).
    pub async fn start_with_client(&self, client: CdpClient) -> DebugResult<()> {
        let transport = client.shutdown_token();
        let gone = self.gone.clone();
        tokio::spawn(async move {
            transport.cancelled().await;
            gone.cancel();
        });

        spawn_event_pump(&client, self.stops.clone(), self.shared.clone());

        {
            let mut initial = self.initial.lock().await;
            if initial.is_none() {
                *initial = Some(self.stops.subscribe());
            }
        }
        *self.client.lock().await = Some(client.clone());

        client.send("Debugger.enable", json!({})).await?;
        client.send("Runtime.enable", json!({})).await?;
        Ok(())
    }

    async fn client(&self) -> DebugResult<CdpClient> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| DebugError::State("debug adapter is not connected".to_string()))
    }

    async fn control(&self, method: &str) -> DebugResult<StopResult> {
        let client = self.client().await?;
        // Subscribe before the resume command hits the wire; the next pause
        // can arrive before the response does.
        let stops = self.stops.subscribe();
        client.send(method, json!({})).await?;
        await_stop(stops, &self.gone, STOP_TIMEOUT).await
    }

    fn paused_frames(&self) -> Vec<Value> {
        self.shared.paused_frames.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl DebugAdapter for NodeAdapter {
    async fn start(&self, config: &LaunchConfig) -> DebugResult<()> {
        config.validate()?;
        let Some(program) = &config.program else {
            return Err(DebugError::Configuration(
                "the node adapter requires a program path".to_string(),
            ));
        };
        let runtime = config
            .runtime_executable
            .clone()
            .unwrap_or_else(|| "node".to_string());
        let port = find_free_port()?;

        // Armed before the spawn: the inspector pauses at entry as soon as a
        // client enables the runtime domain.
        *self.initial.lock().await = Some(self.stops.subscribe());

        let mut command = Command::new(&runtime);
        command
            .args(&config.runtime_args)
            .arg(format!("--inspect-brk=127.0.0.1:{port}"))
            .arg(program)
            .args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        command
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| DebugError::Transport(format!("failed to spawn {runtime}: {err}")))?;
        forward_output(&mut child);
        monitor_exit(child, self.stops.clone(), self.gone.clone(), self.kill.clone());

        let ws_url = discover_ws_url(port, DISCOVERY_TIMEOUT).await?;
        let client = CdpClient::connect(&ws_url).await?;
        self.start_with_client(client).await
    }

    async fn wait_for_initial_pause(&self) -> DebugResult<StopResult> {
        let armed = self.initial.lock().await.take();
        match armed {
            Some(stops) => await_stop(stops, &self.gone, STOP_TIMEOUT).await,
            None => Ok(StopResult::entry()),
        }
    }

    async fn set_breakpoints(
        &self,
        file: &Path,
        breakpoints: &[SourceBreakpoint],
    ) -> DebugResult<Vec<BreakpointResult>> {
        let client = self.client().await?;
        let mut recorded = self.breakpoints.lock().await;

        let parsed = self
            .shared
            .file_to_script
            .lock()
            .expect("poisoned")
            .contains_key(&file.display().to_string());
        if !parsed {
            tracing::debug!(file = %file.display(), "script not parsed yet; breakpoints bind by URL when it loads");
        }

        // CDP has no per-file replace primitive; clear what we installed
        // last time, then set the new list.
        for id in recorded.remove(file).unwrap_or_default() {
            let _ = client
                .send("Debugger.removeBreakpoint", json!({ "breakpointId": id }))
                .await;
        }

        let mut installed = Vec::new();
        let mut results = Vec::with_capacity(breakpoints.len());
        for request in breakpoints {
            match client
                .send("Debugger.setBreakpointByUrl", breakpoint_params(file, request))
                .await
            {
                Ok(body) => {
                    let id = body
                        .get("breakpointId")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(id) = &id {
                        installed.push(id.clone());
                    }
                    let locations = body
                        .get("locations")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    results.push(BreakpointResult {
                        verified: !locations.is_empty(),
                        line: locations
                            .first()
                            .and_then(|location| location.get("lineNumber"))
                            .and_then(Value::as_u64)
                            .map(|line| line as u32 + 1)
                            .unwrap_or(request.line),
                        id,
                        message: None,
                    });
                }
                Err(err) => results.push(BreakpointResult {
                    verified: false,
                    line: request.line,
                    id: None,
                    message: Some(err.to_string()),
                }),
            }
        }

        recorded.insert(file.to_path_buf(), installed);
        Ok(results)
    }

    async fn resume(&self, _thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("Debugger.resume").await
    }

    async fn step_over(&self, _thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("Debugger.stepOver").await
    }

    async fn step_in(&self, _thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("Debugger.stepInto").await
    }

    async fn step_out(&self, _thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("Debugger.stepOut").await
    }

    async fn call_stack(&self, _thread_id: Option<i64>) -> DebugResult<Vec<StackFrame>> {
        let frames = self.paused_frames();
        if frames.is_empty() {
            return Err(DebugError::State(
                "debuggee is not paused; no call stack is available".to_string(),
            ));
        }

        Ok(frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                let location = frame_location(frame, &self.shared);
                StackFrame {
                    id: index as i64,
                    name: frame_name(frame),
                    source: location.as_ref().and_then(|location| {
                        location.file.clone().map(|path| FrameSource {
                            name: Path::new(&path)
                                .file_name()
                                .and_then(|name| name.to_str())
                                .map(str::to_string),
                            path: Some(path),
                        })
                    }),
                    line: location.as_ref().map(|location| location.line).unwrap_or(0),
                    column: location
                        .as_ref()
                        .map(|location| location.column)
                        .unwrap_or(0),
                }
            })
            .collect())
    }

    async fn variables(
        &self,
        frame_id: Option<i64>,
        scope: Option<&str>,
        max_depth: u32,
    ) -> DebugResult<Vec<Variable>> {
        let client = self.client().await?;
        let frames = self.paused_frames();
        let index = frame_id.unwrap_or(0).max(0) as usize;
        let Some(frame) = frames.get(index) else {
            return Err(DebugError::State(
                "no stack frame is available; is the debuggee paused?".to_string(),
            ));
        };

        let wanted = scope.map(str::to_ascii_lowercase);
        let mut variables = Vec::new();
        for entry in frame
            .get("scopeChain")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let scope_type = entry
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let scope_name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
            let matches = match &wanted {
                Some(wanted) => {
                    scope_type.to_ascii_lowercase().contains(wanted.as_str())
                        || scope_name.to_ascii_lowercase().contains(wanted.as_str())
                }
                None => scope_type == "local" || scope_type == "closure",
            };
            if !matches {
                continue;
            }
            let Some(object_id) = entry.pointer("/object/objectId").and_then(Value::as_str)
            else {
                continue;
            };

            let body = client
                .send(
                    "Runtime.getProperties",
                    json!({
                        "objectId": object_id,
                        "ownProperties": true,
                        "generatePreview": true,
                    }),
                )
                .await?;
            for property in body
                .get("result")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let name = property
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if name == "__proto__" {
                    continue;
                }
                let Some(remote) = property.get("value") else {
                    continue;
                };
                variables.push(Variable {
                    name: name.to_string(),
                    value: value::render(remote),
                    type_name: remote
                        .get("type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    variables_reference: if value::is_expandable(remote) && max_depth > 0 {
                        1
                    } else {
                        0
                    },
                });
            }
        }
        Ok(variables)
    }

    async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> DebugResult<EvaluateResult> {
        let client = self.client().await?;
        let frames = self.paused_frames();
        let frame = match frame_id {
            Some(index) => frames.get(index.max(0) as usize),
            None => frames.first(),
        };

        let body = match frame.and_then(|f| f.get("callFrameId")).and_then(Value::as_str) {
            Some(call_frame_id) => {
                client
                    .send(
                        "Debugger.evaluateOnCallFrame",
                        json!({
                            "callFrameId": call_frame_id,
                            "expression": expression,
                            "generatePreview": true,
                        }),
                    )
                    .await?
            }
            None => {
                client
                    .send(
                        "Runtime.evaluate",
                        json!({ "expression": expression, "generatePreview": true }),
                    )
                    .await?
            }
        };

        if let Some(details) = body.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("evaluation failed");
            return Err(DebugError::Protocol(text.to_string()));
        }

        let remote = body.get("result").cloned().unwrap_or(Value::Null);
        Ok(EvaluateResult {
            result: value::render(&remote),
            type_name: remote
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string),
            variables_reference: if value::is_expandable(&remote) { 1 } else { 0 },
        })
    }

    async fn disconnect(&self) {
        // The inspector needs no protocol-level goodbye; dropping the socket
        // is enough.
        if let Some(client) = self.client.lock().await.take() {
            client.shutdown();
        }
        self.kill.cancel();
        self.gone.cancel();
    }

    fn subscribe_stops(&self) -> broadcast::Receiver<StopResult> {
        self.stops.subscribe()
    }
}

fn breakpoint_params(file: &Path, breakpoint: &SourceBreakpoint) -> Value {
    let mut params = Map::new();
    params.insert(
        "lineNumber".to_string(),
        json!(breakpoint.line.saturating_sub(1)),
    );
    params.insert(
        "url".to_string(),
        json!(format!("file://{}", file.display())),
    );
    if let Some(column) = breakpoint.column {
        params.insert("columnNumber".to_string(), json!(column.saturating_sub(1)));
    }
    if let Some(condition) = effective_condition(breakpoint) {
        params.insert("condition".to_string(), json!(condition));
    }
    Value::Object(params)
}

/// A logpoint has no CDP primitive; it becomes a condition that logs and
/// never pauses.
fn effective_condition(breakpoint: &SourceBreakpoint) -> Option<String> {
    match (&breakpoint.condition, &breakpoint.log_message) {
        (condition, None) => condition.clone(),
        (None, Some(message)) => Some(logpoint_condition(message)),
        (Some(condition), Some(message)) => {
            Some(format!("({condition}) && {}", logpoint_condition(message)))
        }
    }
}

fn logpoint_condition(message: &str) -> String {
    // "{expr}" interpolates into the template literal; the rest is verbatim.
    let template = message.replace('\\', "\\\\").replace('`', "\\`").replace('{', "${");
    format!("(console.log(`{template}`), false)")
}

fn spawn_event_pump(client: &CdpClient, stops: broadcast::Sender<StopResult>, shared: Arc<Shared>) {
    // Subscribe before handing off to the task so nothing emitted while the
    // domains come up can be missed.
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            let CdpEvent { method, params } = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match method.as_str() {
                "Debugger.scriptParsed" => {
                    let id = params.get("scriptId").and_then(Value::as_str);
                    let url = params.get("url").and_then(Value::as_str);
                    if let (Some(id), Some(url)) = (id, url) {
                        if let Some(path) = url.strip_prefix("file://") {
                            shared
                                .scripts
                                .lock()
                                .expect("poisoned")
                                .insert(id.to_string(), path.to_string());
                            shared
                                .file_to_script
                                .lock()
                                .expect("poisoned")
                                .insert(path.to_string(), id.to_string());
                        }
                    }
                }
                "Debugger.paused" => {
                    let frames = params
                        .get("callFrames")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    *shared.paused_frames.lock().expect("poisoned") = frames.clone();

                    let reason = classify_pause(&params, &shared);
                    let location = frames.first().and_then(|frame| frame_location(frame, &shared));
                    let _ = stops.send(StopResult {
                        reason,
                        thread_id: None,
                        location,
                        terminated: false,
                    });
                }
                "Debugger.resumed" => {
                    shared.paused_frames.lock().expect("poisoned").clear();
                }
                _ => {}
            }
        }
    });
}

fn classify_pause(params: &Value, shared: &Shared) -> String {
    let first = !shared.entry_seen.swap(true, Ordering::SeqCst);
    let hit_breakpoint = params
        .get("hitBreakpoints")
        .and_then(Value::as_array)
        .map(|hits| !hits.is_empty())
        .unwrap_or(false);
    if hit_breakpoint {
        return "breakpoint".to_string();
    }

    match params.get("reason").and_then(Value::as_str).unwrap_or("other") {
        "exception" | "promiseRejection" => "exception".to_string(),
        _ if first => "entry".to_string(),
        _ => "step".to_string(),
    }
}

fn frame_location(frame: &Value, shared: &Shared) -> Option<SourceLocation> {
    let location = frame.get("location")?;
    let script_id = location.get("scriptId").and_then(Value::as_str)?;
    let file = shared
        .scripts
        .lock()
        .expect("poisoned")
        .get(script_id)
        .cloned();
    Some(SourceLocation {
        file,
        line: location
            .get("lineNumber")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
            + 1,
        column: location
            .get("columnNumber")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
            + 1,
        name: {
            let name = frame_name(frame);
            (!name.is_empty()).then_some(name)
        },
    })
}

fn frame_name(frame: &Value) -> String {
    frame
        .get("functionName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn logpoints_become_non_pausing_conditions() {
        assert_eq!(
            logpoint_condition("i = {i}"),
            "(console.log(`i = ${i}`), false)"
        );
    }

    #[test]
    fn logpoint_combines_with_a_condition() {
        let breakpoint = SourceBreakpoint {
            line: 4,
            condition: Some("i > 5".to_string()),
            log_message: Some("hit {i}".to_string()),
            ..SourceBreakpoint::default()
        };
        assert_eq!(
            effective_condition(&breakpoint).unwrap(),
            "(i > 5) && (console.log(`hit ${i}`), false)"
        );
    }

    #[test]
    fn breakpoint_params_translate_to_zero_based() {
        let breakpoint = SourceBreakpoint {
            line: 10,
            column: Some(3),
            ..SourceBreakpoint::default()
        };
        let params = breakpoint_params(Path::new("/tmp/app.js"), &breakpoint);
        assert_eq!(params["lineNumber"], 9);
        assert_eq!(params["columnNumber"], 2);
        assert_eq!(params["url"], "file:///tmp/app.js");
        assert!(params.get("condition").is_none());
    }
}
