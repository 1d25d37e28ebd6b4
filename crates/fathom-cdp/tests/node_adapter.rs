//! Drives `NodeAdapter` end-to-end against a scripted in-process inspector:
//! an HTTP discovery endpoint plus a WebSocket session.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use fathom_cdp::transport::discover_ws_url;
use fathom_cdp::{CdpClient, NodeAdapter};
use fathom_core::{DebugAdapter, SourceBreakpoint};

type ServerWs = WebSocketStream<TcpStream>;

fn frame(line: u64) -> Value {
    json!({
        "callFrameId": "cf0",
        "functionName": "",
        "location": {"scriptId": "42", "lineNumber": line, "columnNumber": 0},
        "url": "file:///tmp/app.js",
        "scopeChain": [
            {"type": "local", "object": {"objectId": "locals"}},
            {"type": "global", "object": {"objectId": "globals"}},
        ],
    })
}

async fn reply(ws: &mut ServerWs, id: i64, result: Value) {
    let message = json!({"id": id, "result": result}).to_string();
    ws.send(Message::Text(message)).await.unwrap();
}

async fn event(ws: &mut ServerWs, method: &str, params: Value) {
    let message = json!({"method": method, "params": params}).to_string();
    ws.send(Message::Text(message)).await.unwrap();
}

async fn spawn_inspector_ws() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_session(accept_async(stream).await.unwrap()).await;
    });
    format!("ws://{addr}/devtools/page/1")
}

async fn serve_session(mut ws: ServerWs) {
    let mut resume_count = 0u32;
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        let id = request["id"].as_i64().unwrap();
        let method = request["method"].as_str().unwrap();

        match method {
            "Debugger.enable" => reply(&mut ws, id, json!({"debuggerId": "dbg-1"})).await,
            "Runtime.enable" => {
                reply(&mut ws, id, json!({})).await;
                event(
                    &mut ws,
                    "Debugger.scriptParsed",
                    json!({"scriptId": "42", "url": "file:///tmp/app.js"}),
                )
                .await;
                event(
                    &mut ws,
                    "Debugger.paused",
                    json!({"reason": "other", "callFrames": [frame(0)]}),
                )
                .await;
            }
            "Debugger.setBreakpointByUrl" => {
                let line = request["params"]["lineNumber"].as_u64().unwrap();
                let locations = if line >= 98 {
                    // Nothing executable down there.
                    json!([])
                } else {
                    json!([{"scriptId": "42", "lineNumber": line, "columnNumber": 0}])
                };
                reply(
                    &mut ws,
                    id,
                    json!({"breakpointId": format!("bp:{line}"), "locations": locations}),
                )
                .await;
            }
            "Debugger.removeBreakpoint" => reply(&mut ws, id, json!({})).await,
            "Debugger.resume" => {
                resume_count += 1;
                if resume_count == 1 {
                    event(&mut ws, "Debugger.resumed", json!({})).await;
                    // The pause goes out before the resume response; a late
                    // subscriber would lose it.
                    event(
                        &mut ws,
                        "Debugger.paused",
                        json!({
                            "reason": "other",
                            "hitBreakpoints": ["bp:1"],
                            "callFrames": [frame(1)],
                        }),
                    )
                    .await;
                    reply(&mut ws, id, json!({})).await;
                } else {
                    reply(&mut ws, id, json!({})).await;
                    event(&mut ws, "Debugger.resumed", json!({})).await;
                    break;
                }
            }
            "Debugger.stepOver" => {
                event(&mut ws, "Debugger.resumed", json!({})).await;
                event(
                    &mut ws,
                    "Debugger.paused",
                    json!({"reason": "other", "callFrames": [frame(2)]}),
                )
                .await;
                reply(&mut ws, id, json!({})).await;
            }
            "Runtime.getProperties" => {
                let object_id = request["params"]["objectId"].as_str().unwrap();
                let result = if object_id == "locals" {
                    json!([
                        {"name": "x", "value": {"type": "number", "value": 1, "description": "1"}},
                        {"name": "arr", "value": {
                            "type": "object", "subtype": "array", "objectId": "arr-1",
                            "description": "Array(2)",
                        }},
                        {"name": "__proto__", "value": {"type": "object", "objectId": "proto-1"}},
                    ])
                } else {
                    json!([
                        {"name": "g", "value": {"type": "number", "value": 7, "description": "7"}},
                    ])
                };
                reply(&mut ws, id, json!({"result": result})).await;
            }
            "Debugger.evaluateOnCallFrame" => {
                reply(
                    &mut ws,
                    id,
                    json!({"result": {"type": "number", "value": 3, "description": "3"}}),
                )
                .await;
            }
            _ => reply(&mut ws, id, json!({})).await,
        }
    }
}

async fn spawn_discovery(ws_url: String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = json!([{
                "title": "app.js",
                "url": "file:///tmp/app.js",
                "webSocketDebuggerUrl": ws_url,
            }])
            .to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json; charset=UTF-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let mut head = [0u8; 2048];
            let _ = stream.read(&mut head).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    port
}

#[tokio::test]
async fn runs_a_full_breakpoint_session() {
    let ws_url = spawn_inspector_ws().await;
    let discovery_port = spawn_discovery(ws_url).await;

    let discovered = discover_ws_url(discovery_port, Duration::from_secs(5))
        .await
        .unwrap();
    let client = CdpClient::connect(&discovered).await.unwrap();

    let adapter = NodeAdapter::new();
    adapter.start_with_client(client).await.unwrap();

    let entry = adapter.wait_for_initial_pause().await.unwrap();
    assert_eq!(entry.reason, "entry");
    let location = entry.location.expect("entry pause carries a location");
    assert_eq!(location.line, 1);
    assert_eq!(location.file.as_deref(), Some("/tmp/app.js"));

    let results = adapter
        .set_breakpoints(
            std::path::Path::new("/tmp/app.js"),
            &[SourceBreakpoint::at_line(2)],
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].verified);
    assert_eq!(results[0].line, 2);
    assert_eq!(results[0].id.as_deref(), Some("bp:1"));

    let stop = adapter.resume(None).await.unwrap();
    assert_eq!(stop.reason, "breakpoint");
    assert_eq!(stop.location.as_ref().map(|l| l.line), Some(2));
    assert!(!stop.terminated);

    let stack = adapter.call_stack(None).await.unwrap();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].line, 2);
    assert_eq!(
        stack[0].source.as_ref().and_then(|s| s.path.as_deref()),
        Some("/tmp/app.js")
    );

    // Default scope filter: locals and closures, never globals; the
    // prototype entry is dropped.
    let variables = adapter.variables(None, None, 1).await.unwrap();
    let names: Vec<&str> = variables.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["x", "arr"]);
    assert_eq!(variables[0].value, "1");
    assert_eq!(variables[0].variables_reference, 0);
    assert_eq!(variables[1].value, "Array(2)");
    assert_eq!(variables[1].variables_reference, 1);

    // max_depth 0 turns off the expandability hint.
    let shallow = adapter.variables(None, None, 0).await.unwrap();
    assert_eq!(shallow[1].variables_reference, 0);

    // An explicit scope reaches the globals.
    let globals = adapter.variables(None, Some("global"), 1).await.unwrap();
    assert_eq!(globals.len(), 1);
    assert_eq!(globals[0].name, "g");

    let evaluated = adapter.evaluate("x + 2", None).await.unwrap();
    assert_eq!(evaluated.result, "3");

    let step = adapter.step_over(None).await.unwrap();
    assert_eq!(step.reason, "step");
    assert_eq!(step.location.as_ref().map(|l| l.line), Some(3));

    // A line with no executable code comes back unverified, at the
    // requested line.
    let unresolved = adapter
        .set_breakpoints(
            std::path::Path::new("/tmp/app.js"),
            &[SourceBreakpoint::at_line(99)],
        )
        .await
        .unwrap();
    assert!(!unresolved[0].verified);
    assert_eq!(unresolved[0].line, 99);

    // The inspector goes away after acknowledging the final resume.
    let last = adapter.resume(None).await.unwrap();
    assert!(last.terminated);

    adapter.disconnect().await;
    adapter.disconnect().await;
}

#[tokio::test]
async fn discovery_times_out_without_an_inspector() {
    let port = fathom_core::net::find_free_port().unwrap();
    let err = discover_ws_url(port, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}
