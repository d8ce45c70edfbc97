//! End-to-end tests for the relay.
//!
//! The host side is always an in-memory pipe pair speaking native messaging
//! frames. The MCP server is either an in-process fake attached through pipes
//! or, on Unix, a small shell script spawned as a real child process.
//!
//! # Running
//!
//! ```bash
//! cargo test --test relay_integration -- --nocapture
//! ```

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use mcp_native_host::bridge::Bridge;
use mcp_native_host::config::BridgeConfig;
use mcp_native_host::error::RelayError;
use mcp_native_host::ipc::{
    read_envelope, write_envelope, EventQueue, SubprocessChannel, MAX_INBOUND_SIZE,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const PIPE_SIZE: usize = 64 * 1024;

fn test_config() -> BridgeConfig {
    BridgeConfig {
        ready_delay: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(1),
        ..BridgeConfig::default()
    }
}

/// Browser end of the native messaging pipes.
struct Host {
    input: DuplexStream,
    output: DuplexStream,
}

impl Host {
    async fn send(&mut self, message: Value) {
        write_envelope(&mut self.input, message.to_string().as_bytes(), MAX_INBOUND_SIZE)
            .await
            .expect("Failed to write host frame");
    }

    async fn recv(&mut self) -> Value {
        let body = timeout(TEST_TIMEOUT, read_envelope(&mut self.output, MAX_INBOUND_SIZE))
            .await
            .expect("Timed out waiting for host frame")
            .expect("Host frame read failed")
            .expect("Relay closed host output");
        serde_json::from_slice(&body).expect("Host frame is not JSON")
    }
}

/// In-process MCP server speaking JSON lines.
struct FakeServer {
    input: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        let line = timeout(TEST_TIMEOUT, self.input.next_line())
            .await
            .expect("Timed out waiting for server input")
            .expect("Server input read failed")
            .expect("Relay closed server stdin");
        serde_json::from_str(&line).expect("Server input is not JSON")
    }

    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.output
            .write_all(line.as_bytes())
            .await
            .expect("Failed to write server output");
    }

    /// Complete the MCP handshake the relay starts with.
    async fn accept_initialize(&mut self) {
        let init = self.recv().await;
        assert_eq!(init["method"], json!("initialize"));
        self.send(json!({
            "jsonrpc": "2.0",
            "id": init["id"],
            "result": {"protocolVersion": "2024-11-05", "serverInfo": {"name": "fake"}},
        }))
        .await;
        let note = self.recv().await;
        assert_eq!(note["method"], json!("notifications/initialized"));
    }
}

type Relay = JoinHandle<Result<(), RelayError>>;

fn start(config: BridgeConfig) -> (Host, FakeServer, Relay) {
    start_with_server_pipes(config, PIPE_SIZE)
}

fn start_with_server_pipes(config: BridgeConfig, server_pipe: usize) -> (Host, FakeServer, Relay) {
    let (host_input, relay_in) = duplex(PIPE_SIZE);
    let (relay_out, host_output) = duplex(PIPE_SIZE);
    let (relay_stdin, server_input) = duplex(server_pipe);
    let (server_output, relay_stdout) = duplex(server_pipe);

    let events = EventQueue::new();
    let channel = SubprocessChannel::from_pipes(relay_stdin, relay_stdout, events.sender());
    let relay =
        tokio::spawn(Bridge::from_config(config).run(relay_in, relay_out, channel, events));

    (
        Host {
            input: host_input,
            output: host_output,
        },
        FakeServer {
            input: BufReader::new(server_input).lines(),
            output: server_output,
        },
        relay,
    )
}

#[tokio::test]
async fn test_ping_is_answered_locally() {
    let (mut host, _server, _relay) = start(test_config());

    host.send(json!({"id": "42", "action": "ping"})).await;
    let reply = host.recv().await;

    assert_eq!(reply["id"], json!("42"));
    assert_eq!(reply["response"]["status"], json!("pong"));
    assert_eq!(reply["response"]["mcp_connected"], json!(true));
    assert!(reply["response"]["timestamp"].as_f64().unwrap() > 1.0e9);
}

#[tokio::test]
async fn test_unknown_action_never_reaches_server() {
    let (mut host, mut server, _relay) = start(test_config());
    server.accept_initialize().await;

    host.send(json!({"id": "7", "action": "bogusAction"})).await;
    assert_eq!(
        host.recv().await,
        json!({"id": "7", "error": "Unknown action: bogusAction"})
    );

    // The next thing the server sees is the follow-up action, not the bogus one.
    host.send(json!({"id": "8", "action": "getEmails"})).await;
    let call = server.recv().await;
    assert_eq!(call["params"]["name"], json!("getEmails"));
}

#[tokio::test]
async fn test_action_round_trip_keeps_caller_id() {
    let (mut host, mut server, _relay) = start(test_config());
    server.accept_initialize().await;

    host.send(json!({
        "id": "c1",
        "action": "getEmailContent",
        "params": {"emailId": "18c2f"},
    }))
    .await;
    host.send(json!({"id": "c2", "action": "sendEmail", "params": {"to": "a@b.c"}}))
        .await;

    let first = server.recv().await;
    let second = server.recv().await;
    assert_eq!(first["method"], json!("tools/call"));
    assert_eq!(
        first["params"],
        json!({"name": "getEmailContent", "arguments": {"emailId": "18c2f"}})
    );
    assert_ne!(first["id"], second["id"]);

    // Answer out of order.
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": second["id"],
            "error": {"code": -32000, "message": "Gmail tab not found"},
        }))
        .await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": first["id"],
            "result": {"content": [{"type": "text", "text": "Hello"}]},
        }))
        .await;

    assert_eq!(
        host.recv().await,
        json!({"id": "c2", "error": "Gmail tab not found"})
    );
    assert_eq!(
        host.recv().await,
        json!({"id": "c1", "response": {"content": [{"type": "text", "text": "Hello"}]}})
    );
}

#[tokio::test]
async fn test_duplicate_server_reply_is_dropped() {
    let (mut host, mut server, _relay) = start(test_config());
    server.accept_initialize().await;

    host.send(json!({"id": 5, "action": "getEmails"})).await;
    let call = server.recv().await;
    let answer = json!({"jsonrpc": "2.0", "id": call["id"], "result": {"emails": []}});
    server.send(answer.clone()).await;
    server.send(answer).await;

    assert_eq!(host.recv().await, json!({"id": 5, "response": {"emails": []}}));
    host.send(json!({"id": "p", "action": "ping"})).await;
    assert_eq!(host.recv().await["id"], json!("p"));
}

#[tokio::test]
async fn test_host_reply_resolves_pending_request() {
    let (mut host, mut server, _relay) = start(test_config());
    server.accept_initialize().await;

    host.send(json!({"id": "r1", "action": "composeReply"})).await;
    let call = server.recv().await;

    host.send(json!({"id": "r1", "response": {"draft": "ok"}})).await;
    assert_eq!(host.recv().await, json!({"id": "r1", "response": {"draft": "ok"}}));

    // The entry is consumed, so the server's late answer goes nowhere.
    server
        .send(json!({"jsonrpc": "2.0", "id": call["id"], "result": {}}))
        .await;
    host.send(json!({"id": "p", "action": "ping"})).await;
    assert_eq!(host.recv().await["response"]["status"], json!("pong"));
}

#[tokio::test]
async fn test_truncated_envelope_ends_relay() {
    let (mut host, mut server, relay) = start(test_config());
    server.accept_initialize().await;

    host.input.write_all(&100u32.to_ne_bytes()).await.unwrap();
    host.input.write_all(&[b' '; 10]).await.unwrap();
    drop(host.input);

    let result = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
    assert!(result.is_ok());

    // Shutdown closes the server's stdin.
    let eof = timeout(TEST_TIMEOUT, server.input.next_line())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eof, None);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let config = BridgeConfig {
        pending_timeout: Some(Duration::from_secs(1)),
        sweep_interval: Duration::from_millis(50),
        ..test_config()
    };
    let (mut host, mut server, _relay) = start(config);
    server.accept_initialize().await;

    host.send(json!({"id": "slow", "action": "getEmails"})).await;
    let _call = server.recv().await;

    assert_eq!(
        host.recv().await,
        json!({"id": "slow", "error": "Request timed out after 1s"})
    );
}

#[tokio::test]
async fn test_server_exit_fails_pending_and_new_actions() {
    let (mut host, mut server, _relay) = start(test_config());
    server.accept_initialize().await;

    host.send(json!({"id": "a", "action": "getEmails"})).await;
    let _call = server.recv().await;
    drop(server.output);

    let failed = host.recv().await;
    assert_eq!(failed["id"], json!("a"));
    assert_eq!(failed["error"], json!("MCP server unavailable: server exited"));

    host.send(json!({"id": "b", "action": "getEmails"})).await;
    let refused = host.recv().await;
    assert_eq!(refused["id"], json!("b"));
    assert!(refused["error"].as_str().unwrap().contains("unavailable"));

    host.send(json!({"id": "c", "action": "ping"})).await;
    let pong = host.recv().await;
    assert_eq!(pong["response"]["mcp_connected"], json!(false));
}

#[tokio::test]
async fn test_burst_of_actions_does_not_stall() {
    const BURST: usize = 400;

    // Small server pipes so the server's stdout and stdin both fill up while
    // host actions keep arriving.
    let (host, mut server, _relay) = start_with_server_pipes(test_config(), 4 * 1024);
    let Host { mut input, mut output } = host;

    // Tool calls may overtake the handshake, so answer whatever arrives.
    let server_task = tokio::spawn(async move {
        let padding = "x".repeat(300);
        while let Ok(Some(line)) = server.input.next_line().await {
            let message: Value = serde_json::from_str(&line).unwrap();
            if message["id"].is_null() {
                continue;
            }
            let result = if message["method"] == json!("initialize") {
                json!({"protocolVersion": "2024-11-05", "serverInfo": {"name": "fake"}})
            } else {
                json!({"content": [{"type": "text", "text": padding}]})
            };
            server
                .send(json!({"jsonrpc": "2.0", "id": message["id"], "result": result}))
                .await;
        }
    });

    let sender = tokio::spawn(async move {
        for i in 0..BURST {
            let frame = json!({"id": i, "action": "getEmails"}).to_string();
            write_envelope(&mut input, frame.as_bytes(), MAX_INBOUND_SIZE)
                .await
                .unwrap();
        }
        input
    });

    let mut seen = vec![false; BURST];
    let collected = timeout(Duration::from_secs(20), async {
        for _ in 0..BURST {
            let body = read_envelope(&mut output, MAX_INBOUND_SIZE)
                .await
                .unwrap()
                .expect("Relay closed host output");
            let reply: Value = serde_json::from_slice(&body).unwrap();
            assert!(reply["response"].is_object(), "unexpected reply: {reply}");
            seen[reply["id"].as_u64().unwrap() as usize] = true;
        }
    })
    .await;

    assert!(collected.is_ok(), "relay stalled during the burst");
    assert!(seen.iter().all(|s| *s));
    let _input = sender.await.unwrap();
    server_task.abort();
}

#[tokio::test]
async fn test_non_object_frames_are_skipped() {
    let (mut host, _server, _relay) = start(test_config());

    write_envelope(&mut host.input, b"[1,2,3]", MAX_INBOUND_SIZE)
        .await
        .unwrap();
    host.send(json!({"response": "no id"})).await;
    host.send(json!({"id": 1, "action": "ping"})).await;

    assert_eq!(host.recv().await["id"], json!(1));
}

// =============================================================================
// Real subprocess
// =============================================================================

#[cfg(unix)]
mod subprocess {
    use super::*;
    use pretty_assertions::assert_eq;
    use mcp_native_host::ipc::SpawnConfig;
    use std::path::PathBuf;

    /// Mock MCP server: answers `initialize` and echoes each tool call.
    const MOCK_SERVER: &str = r#"#!/bin/sh
# Mock MCP server speaking newline-delimited JSON-RPC
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
    [ -z "$id" ] && continue
    case "$line" in
        *'"method":"initialize"'*)
            printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"mock"}}}\n' "$id"
            ;;
        *'"method":"tools/call"'*)
            name=$(printf '%s' "$line" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s done"}]}}\n' "$id" "$name"
            ;;
    esac
done
"#;

    fn write_mock_script() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mock_mcp_server_{}_{}.sh",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&path, MOCK_SERVER).expect("Failed to write mock script");
        path
    }

    #[tokio::test]
    async fn test_relay_through_spawned_server() {
        let script = write_mock_script();
        let config = BridgeConfig {
            server: SpawnConfig {
                command: "sh".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
                working_directory: None,
            },
            ..test_config()
        };

        let (host_input, host_in) = duplex(PIPE_SIZE);
        let (host_out, host_output) = duplex(PIPE_SIZE);
        let events = EventQueue::new();
        let channel = SubprocessChannel::spawn(&config.server, events.sender())
            .expect("Failed to spawn mock server");
        let relay =
            tokio::spawn(Bridge::from_config(config).run(host_in, host_out, channel, events));

        let mut client = Host {
            input: host_input,
            output: host_output,
        };
        client
            .send(json!({"id": "x1", "action": "getEmails", "params": {"limit": 5}}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({
                "id": "x1",
                "response": {"content": [{"type": "text", "text": "getEmails done"}]},
            })
        );

        drop(client);
        let result = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        assert!(result.is_ok());
        let _ = std::fs::remove_file(&script);
    }

    #[tokio::test]
    async fn test_missing_server_program_is_fatal() {
        let config = BridgeConfig {
            server: SpawnConfig {
                command: "/nonexistent/mcp-server-binary".to_string(),
                args: vec![],
                working_directory: None,
            },
            ..test_config()
        };
        let err = Bridge::from_config(config).run_stdio().await.unwrap_err();
        assert!(matches!(err, RelayError::Spawn { .. }));
    }
}
