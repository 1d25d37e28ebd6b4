//! Correlator behavior of `DapClient`, driven over in-process duplex streams.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use fathom_dap::codec::{encode, FrameDecoder};
use fathom_dap::DapClient;

fn wire_pair() -> (DapClient, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    (
        DapClient::new(client_read, client_write),
        server_read,
        server_write,
    )
}

async fn read_message(reader: &mut ReadHalf<DuplexStream>, decoder: &mut FrameDecoder) -> Value {
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "transport closed while waiting for a message");
        let mut messages = decoder.feed(&chunk[..n]);
        if let Some(message) = messages.pop() {
            assert!(messages.is_empty(), "expected one message per read");
            return message;
        }
    }
}

async fn write_message(writer: &mut WriteHalf<DuplexStream>, message: &Value) {
    writer.write_all(&encode(message)).await.unwrap();
    writer.flush().await.unwrap();
}

#[tokio::test]
async fn resolves_response_body_on_success() {
    let (client, mut server_read, mut server_write) = wire_pair();
    let mut decoder = FrameDecoder::new();

    let request_task = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("threads", json!({})).await }
    });

    let request = read_message(&mut server_read, &mut decoder).await;
    assert_eq!(request["type"], "request");
    assert_eq!(request["command"], "threads");

    write_message(
        &mut server_write,
        &json!({
            "seq": 1,
            "type": "response",
            "request_seq": request["seq"],
            "success": true,
            "command": "threads",
            "body": {"threads": [{"id": 1, "name": "MainThread"}]},
        }),
    )
    .await;

    let body = request_task.await.unwrap().unwrap();
    assert_eq!(body["threads"][0]["name"], "MainThread");
}

#[tokio::test]
async fn correlates_out_of_order_responses() {
    let (client, mut server_read, mut server_write) = wire_pair();
    let mut decoder = FrameDecoder::new();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("stackTrace", json!({"threadId": 1})).await }
    });
    let first_request = read_message(&mut server_read, &mut decoder).await;

    let second = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("scopes", json!({"frameId": 9})).await }
    });
    let second_request = read_message(&mut server_read, &mut decoder).await;

    // Answer in reverse order; each response must still reach its caller.
    write_message(
        &mut server_write,
        &json!({
            "seq": 1, "type": "response", "request_seq": second_request["seq"],
            "success": true, "command": "scopes", "body": {"which": "scopes"},
        }),
    )
    .await;
    write_message(
        &mut server_write,
        &json!({
            "seq": 2, "type": "response", "request_seq": first_request["seq"],
            "success": true, "command": "stackTrace", "body": {"which": "stackTrace"},
        }),
    )
    .await;

    assert_eq!(first.await.unwrap().unwrap()["which"], "stackTrace");
    assert_eq!(second.await.unwrap().unwrap()["which"], "scopes");
}

#[tokio::test]
async fn failure_response_surfaces_the_adapter_message() {
    let (client, mut server_read, mut server_write) = wire_pair();
    let mut decoder = FrameDecoder::new();

    let request_task = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("evaluate", json!({"expression": "x"})).await }
    });
    let request = read_message(&mut server_read, &mut decoder).await;

    write_message(
        &mut server_write,
        &json!({
            "seq": 1, "type": "response", "request_seq": request["seq"],
            "success": false, "command": "evaluate", "message": "name 'x' is not defined",
        }),
    )
    .await;

    let err = request_task.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "name 'x' is not defined");
}

#[tokio::test]
async fn failure_response_without_message_is_synthesized() {
    let (client, mut server_read, mut server_write) = wire_pair();
    let mut decoder = FrameDecoder::new();

    let request_task = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("pause", json!({})).await }
    });
    let request = read_message(&mut server_read, &mut decoder).await;

    write_message(
        &mut server_write,
        &json!({
            "seq": 1, "type": "response", "request_seq": request["seq"],
            "success": false, "command": "pause",
        }),
    )
    .await;

    let err = request_task.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Request failed: pause");
}

#[tokio::test]
async fn transport_close_fails_pending_requests() {
    let (client, mut server_read, server_write) = wire_pair();
    let mut decoder = FrameDecoder::new();

    let request_task = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("threads", json!({})).await }
    });
    let _request = read_message(&mut server_read, &mut decoder).await;

    drop(server_write);
    drop(server_read);

    let err = request_task.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Connection closed");
}

#[tokio::test]
async fn events_fan_out_to_every_subscriber() {
    let (client, _server_read, mut server_write) = wire_pair();

    let mut first = client.subscribe_events();
    let mut second = client.subscribe_events();

    write_message(
        &mut server_write,
        &json!({
            "seq": 1, "type": "event", "event": "stopped",
            "body": {"reason": "breakpoint", "threadId": 4},
        }),
    )
    .await;

    let event = first.recv().await.unwrap();
    assert_eq!(event.event, "stopped");
    assert_eq!(event.body["threadId"], 4);

    let event = second.recv().await.unwrap();
    assert_eq!(event.event, "stopped");
    assert_eq!(event.body["reason"], "breakpoint");
}
