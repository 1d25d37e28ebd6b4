//! Debug adapter for Python programs, driven through `debugpy`'s DAP server.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use fathom_core::net::{find_free_port, wait_for_port, PORT_WAIT_TIMEOUT};
use fathom_core::process::{forward_output, monitor_exit};
use fathom_core::{
    await_stop, BreakpointResult, DebugAdapter, DebugError, DebugResult, EvaluateResult,
    FrameSource, LaunchConfig, SourceBreakpoint, SourceLocation, StackFrame, StopResult, Variable,
    STOP_TIMEOUT,
};

use crate::client::{DapClient, DapEvent};

const DEBUGPY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const STACK_LEVELS: u32 = 50;

/// Launches a program under `python -m debugpy` and speaks DAP to it.
pub struct PythonAdapter {
    client: Mutex<Option<DapClient>>,
    stops: broadcast::Sender<StopResult>,
    /// Cancelled when the debuggee or its transport is gone.
    gone: CancellationToken,
    /// Cancelled by `disconnect` to make the child monitor kill the process.
    kill: CancellationToken,
    /// Thread id of the most recent stopped event; 0 when none seen yet.
    /// Shared with the event pump task.
    last_thread: Arc<AtomicI64>,
    /// Frame ids returned by the most recent stack request, first = top.
    frames: Mutex<Vec<i64>>,
    /// Armed entry-point pause; consumed by `wait_for_initial_pause`.
    initial: Mutex<Option<broadcast::Receiver<StopResult>>>,
}

impl Default for PythonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PythonAdapter {
    pub fn new() -> Self {
        let (stops, _) = broadcast::channel(64);
        Self {
            client: Mutex::new(None),
            stops,
            gone: CancellationToken::new(),
            kill: CancellationToken::new(),
            last_thread: Arc::new(AtomicI64::new(0)),
            frames: Mutex::new(Vec::new()),
            initial: Mutex::new(None),
        }
    }

    /// Drive a DAP server that is already listening: install the event pump,
    /// arm the entry pause, and perform the
    /// initialize/launch/configurationDone handshake. `start` ends up here
    /// after spawning debugpy; tests and attach-style callers enter directly.
    pub async fn start_with_client(
        &self,
        config: &LaunchConfig,
        client: DapClient,
    ) -> DebugResult<()> {
        let transport = client.shutdown_token();
        let gone = self.gone.clone();
        tokio::spawn(async move {
            transport.cancelled().await;
            gone.cancel();
        });

        spawn_event_pump(client.clone(), self.stops.clone(), self.last_thread.clone());

        // Entry pause is armed before any handshake traffic so the first
        // stopped event cannot slip past.
        *self.initial.lock().await = Some(self.stops.subscribe());
        *self.client.lock().await = Some(client.clone());

        client
            .send_request(
                "initialize",
                json!({
                    "clientID": "fathom",
                    "adapterID": "debugpy",
                    "linesStartAt1": true,
                    "columnsStartAt1": true,
                    "pathFormat": "path",
                }),
            )
            .await?;
        client
            .send_request("launch", launch_arguments(config))
            .await?;
        client.send_request("configurationDone", json!({})).await?;
        Ok(())
    }

    async fn client(&self) -> DebugResult<DapClient> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| DebugError::State("debug adapter is not connected".to_string()))
    }

    fn recorded_thread(&self) -> Option<i64> {
        match self.last_thread.load(Ordering::SeqCst) {
            0 => None,
            thread => Some(thread),
        }
    }

    async fn control(&self, command: &str, thread_id: Option<i64>) -> DebugResult<StopResult> {
        let client = self.client().await?;
        let thread = thread_id.or_else(|| self.recorded_thread()).unwrap_or(1);

        // Subscribe before the resume command hits the wire; the next pause
        // can arrive before the response does.
        let stops = self.stops.subscribe();
        client
            .send_request(command, json!({ "threadId": thread }))
            .await?;
        await_stop(stops, &self.gone, STOP_TIMEOUT).await
    }

    async fn default_frame(&self) -> DebugResult<i64> {
        if let Some(frame) = self.frames.lock().await.first().copied() {
            return Ok(frame);
        }
        // No cached stack yet; fetch one so frame defaulting works right
        // after a pause.
        let frames = self.call_stack(None).await?;
        frames.first().map(|frame| frame.id).ok_or_else(|| {
            DebugError::State("no stack frame is available; is the debuggee paused?".to_string())
        })
    }
}

#[async_trait]
impl DebugAdapter for PythonAdapter {
    async fn start(&self, config: &LaunchConfig) -> DebugResult<()> {
        config.validate()?;
        let python = config
            .python_path
            .clone()
            .unwrap_or_else(|| "python3".to_string());
        ensure_debugpy(&python).await?;

        let port = find_free_port()?;
        let mut command = Command::new(&python);
        command
            .arg("-m")
            .arg("debugpy")
            .arg("--listen")
            .arg(format!("127.0.0.1:{port}"))
            .arg("--wait-for-client")
            .arg("--");
        if let Some(module) = &config.module {
            command.arg("-m").arg(module);
        } else if let Some(program) = &config.program {
            command.arg(program);
        }
        command.args(&config.args);
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
            .map_err(|err| DebugError::Transport(format!("failed to spawn {python}: {err}")))?;
        forward_output(&mut child);
        monitor_exit(child, self.stops.clone(), self.gone.clone(), self.kill.clone());

        wait_for_port(port, PORT_WAIT_TIMEOUT).await?;
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|err| {
                DebugError::Transport(format!("failed to connect to debugpy on port {port}: {err}"))
            })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        self.start_with_client(config, DapClient::new(reader, writer))
            .await
    }

    async fn wait_for_initial_pause(&self) -> DebugResult<StopResult> {
        let armed = self.initial.lock().await.take();
        match armed {
            Some(stops) => await_stop(stops, &self.gone, STOP_TIMEOUT).await,
            // Already consumed: the debuggee paused at entry long ago.
            None => Ok(StopResult::entry()),
        }
    }

    async fn set_breakpoints(
        &self,
        file: &Path,
        breakpoints: &[SourceBreakpoint],
    ) -> DebugResult<Vec<BreakpointResult>> {
        let client = self.client().await?;

        let requested: Vec<Value> = breakpoints.iter().map(breakpoint_request).collect();
        let body = client
            .send_request(
                "setBreakpoints",
                json!({
                    "source": {
                        "path": file.display().to_string(),
                        "name": file.file_name().and_then(|name| name.to_str()),
                    },
                    "breakpoints": requested,
                }),
            )
            .await?;

        let reported = body
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(breakpoints
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let entry = reported.get(index);
                BreakpointResult {
                    verified: entry
                        .and_then(|e| e.get("verified"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    line: entry
                        .and_then(|e| e.get("line"))
                        .and_then(Value::as_u64)
                        .map(|line| line as u32)
                        .unwrap_or(request.line),
                    id: entry
                        .and_then(|e| e.get("id"))
                        .and_then(Value::as_i64)
                        .map(|id| id.to_string()),
                    message: entry
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            })
            .collect())
    }

    async fn resume(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("continue", thread_id).await
    }

    async fn step_over(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("next", thread_id).await
    }

    async fn step_in(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("stepIn", thread_id).await
    }

    async fn step_out(&self, thread_id: Option<i64>) -> DebugResult<StopResult> {
        self.control("stepOut", thread_id).await
    }

    async fn call_stack(&self, thread_id: Option<i64>) -> DebugResult<Vec<StackFrame>> {
        let client = self.client().await?;
        let thread = thread_id.or_else(|| self.recorded_thread()).unwrap_or(1);

        let body = client
            .send_request(
                "stackTrace",
                json!({ "threadId": thread, "startFrame": 0, "levels": STACK_LEVELS }),
            )
            .await?;

        let frames: Vec<StackFrame> = body
            .get("stackFrames")
            .and_then(Value::as_array)
            .map(|frames| frames.iter().map(parse_frame).collect())
            .unwrap_or_default();

        *self.frames.lock().await = frames.iter().map(|frame| frame.id).collect();
        Ok(frames)
    }

    async fn variables(
        &self,
        frame_id: Option<i64>,
        scope: Option<&str>,
        _max_depth: u32,
    ) -> DebugResult<Vec<Variable>> {
        let client = self.client().await?;
        let frame = match frame_id {
            Some(frame) => frame,
            None => self.default_frame().await?,
        };

        let scopes = client
            .send_request("scopes", json!({ "frameId": frame }))
            .await?;
        let wanted = scope.map(str::to_ascii_lowercase);

        let mut variables = Vec::new();
        for entry in scopes
            .get("scopes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_lowercase();
            let matches = match &wanted {
                Some(wanted) => name.contains(wanted.as_str()),
                None => name.contains("local"),
            };
            if !matches {
                continue;
            }
            let Some(reference) = entry
                .get("variablesReference")
                .and_then(Value::as_i64)
                .filter(|&reference| reference != 0)
            else {
                continue;
            };

            let body = client
                .send_request("variables", json!({ "variablesReference": reference }))
                .await?;
            for variable in body
                .get("variables")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                variables.push(Variable {
                    name: string_field(variable, "name"),
                    value: string_field(variable, "value"),
                    type_name: variable
                        .get("type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    variables_reference: variable
                        .get("variablesReference")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
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

        let mut arguments = Map::new();
        arguments.insert("expression".to_string(), json!(expression));
        arguments.insert("context".to_string(), json!("repl"));
        let frame = match frame_id {
            Some(frame) => Some(frame),
            None => self.frames.lock().await.first().copied(),
        };
        if let Some(frame) = frame {
            arguments.insert("frameId".to_string(), json!(frame));
        }

        let body = client
            .send_request("evaluate", Value::Object(arguments))
            .await?;
        Ok(EvaluateResult {
            result: string_field(&body, "result"),
            type_name: body.get("type").and_then(Value::as_str).map(str::to_string),
            variables_reference: body
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }

    async fn disconnect(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            let goodbye =
                client.send_request("disconnect", json!({ "terminateDebuggee": true }));
            match tokio::time::timeout(DISCONNECT_TIMEOUT, goodbye).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::debug!("disconnect request failed: {err}"),
                Err(_) => tracing::debug!("disconnect request timed out"),
            }
            client.shutdown();
        }
        self.kill.cancel();
        self.gone.cancel();
    }

    fn subscribe_stops(&self) -> broadcast::Receiver<StopResult> {
        self.stops.subscribe()
    }
}

fn launch_arguments(config: &LaunchConfig) -> Value {
    let mut arguments = Map::new();
    arguments.insert("stopOnEntry".to_string(), json!(true));
    arguments.insert("justMyCode".to_string(), json!(true));
    arguments.insert("args".to_string(), json!(config.args));
    if let Some(program) = &config.program {
        arguments.insert("program".to_string(), json!(program.display().to_string()));
    }
    if let Some(module) = &config.module {
        arguments.insert("module".to_string(), json!(module));
    }
    if let Some(cwd) = &config.cwd {
        arguments.insert("cwd".to_string(), json!(cwd.display().to_string()));
    }
    Value::Object(arguments)
}

fn breakpoint_request(breakpoint: &SourceBreakpoint) -> Value {
    let mut request = Map::new();
    request.insert("line".to_string(), json!(breakpoint.line));
    if let Some(column) = breakpoint.column {
        request.insert("column".to_string(), json!(column));
    }
    if let Some(condition) = &breakpoint.condition {
        request.insert("condition".to_string(), json!(condition));
    }
    if let Some(hit_condition) = &breakpoint.hit_condition {
        request.insert("hitCondition".to_string(), json!(hit_condition));
    }
    if let Some(log_message) = &breakpoint.log_message {
        request.insert("logMessage".to_string(), json!(log_message));
    }
    Value::Object(request)
}

fn parse_frame(frame: &Value) -> StackFrame {
    StackFrame {
        id: frame.get("id").and_then(Value::as_i64).unwrap_or(0),
        name: string_field(frame, "name"),
        source: frame.get("source").map(|source| FrameSource {
            path: source
                .get("path")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: source
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        line: frame.get("line").and_then(Value::as_u64).unwrap_or(0) as u32,
        column: frame.get("column").and_then(Value::as_u64).unwrap_or(0) as u32,
    }
}

fn string_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Translates raw DAP events into stop results. A stopped event records the
/// thread id and is enriched with the top stack frame before fan-out.
fn spawn_event_pump(
    client: DapClient,
    stops: broadcast::Sender<StopResult>,
    last_thread: Arc<AtomicI64>,
) {
    // Subscribe before handing off to the task so nothing emitted during the
    // handshake can be missed.
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            let DapEvent { event, body } = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event.as_str() {
                "stopped" => {
                    let reason = body
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("pause")
                        .to_string();
                    let thread_id = body.get("threadId").and_then(Value::as_i64);
                    if let Some(thread) = thread_id {
                        last_thread.store(thread, Ordering::SeqCst);
                    }
                    let location = top_frame_location(&client, thread_id).await;
                    let _ = stops.send(StopResult {
                        reason,
                        thread_id,
                        location,
                        terminated: false,
                    });
                }
                "terminated" | "exited" => {
                    let _ = stops.send(StopResult::terminated());
                }
                _ => {}
            }
        }
    });
}

async fn top_frame_location(client: &DapClient, thread_id: Option<i64>) -> Option<SourceLocation> {
    let thread = thread_id?;
    let body = client
        .send_request(
            "stackTrace",
            json!({ "threadId": thread, "startFrame": 0, "levels": 1 }),
        )
        .await
        .ok()?;
    let frame = body.get("stackFrames")?.as_array()?.first()?;
    Some(SourceLocation {
        file: frame
            .pointer("/source/path")
            .and_then(Value::as_str)
            .map(str::to_string),
        line: frame.get("line").and_then(Value::as_u64).unwrap_or(0) as u32,
        column: frame.get("column").and_then(Value::as_u64).unwrap_or(1) as u32,
        name: frame.get("name").and_then(Value::as_str).map(str::to_string),
    })
}

async fn ensure_debugpy(python: &str) -> DebugResult<()> {
    let mut probe = Command::new(python);
    probe
        .args(["-c", "import debugpy"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(DEBUGPY_PROBE_TIMEOUT, probe.status()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(_)) | Err(_) => Err(DebugError::Prerequisite(format!(
            "debugpy is not available for {python}; install it with `{python} -m pip install debugpy`"
        ))),
        Ok(Err(err)) => Err(DebugError::Prerequisite(format!(
            "failed to run {python}: {err}"
        ))),
    }
}

