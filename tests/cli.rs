use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{fs, process::Command};
use tempfile::TempDir;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Minimal filter matching for the stub relay: enough of NIP-01 to serve the
/// queries the bridge issues (ids, authors, kinds, #e).
fn matches(filter: &Value, ev: &Value) -> bool {
    if let Some(ids) = filter.get("ids").and_then(|v| v.as_array()) {
        if !ids.iter().any(|i| i == &ev["id"]) {
            return false;
        }
    }
    if let Some(authors) = filter.get("authors").and_then(|v| v.as_array()) {
        if !authors.iter().any(|a| a == &ev["pubkey"]) {
            return false;
        }
    }
    if let Some(kinds) = filter.get("kinds").and_then(|v| v.as_array()) {
        if !kinds.iter().any(|k| k == &ev["kind"]) {
            return false;
        }
    }
    if let Some(refs) = filter.get("#e").and_then(|v| v.as_array()) {
        let tagged = ev["tags"].as_array().map(|tags| {
            tags.iter().any(|tag| {
                tag.get(0).and_then(|t| t.as_str()) == Some("e")
                    && refs.iter().any(|r| Some(r) == tag.get(1))
            })
        });
        if tagged != Some(true) {
            return false;
        }
    }
    true
}

/// Relay stub answering every REQ from a fixed event set, one connection at a
/// time, until aborted.
async fn spawn_stub_relay(events: Vec<Value>) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let events = events.clone();
            tokio::spawn(async move {
                let mut ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(txt) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&txt) else {
                        continue;
                    };
                    if frame.get(0).and_then(|v| v.as_str()) != Some("REQ") {
                        continue;
                    }
                    let sub = frame[1].clone();
                    let filter = frame[2].clone();
                    for ev in events.iter().filter(|ev| matches(&filter, ev)) {
                        let _ = ws
                            .send(Message::Text(json!(["EVENT", sub, ev]).to_string()))
                            .await;
                    }
                    let _ = ws
                        .send(Message::Text(json!(["EOSE", sub]).to_string()))
                        .await;
                }
            });
        }
    });
    (format!("ws://{addr}"), handle)
}

fn write_env(dir: &TempDir, relays: &str) -> String {
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!("RELAYS={relays}\nCOLLECT_WINDOW_SECS=2\nLOOKUP_TIMEOUT_SECS=2\n"),
    )
    .unwrap();
    env_path.to_str().unwrap().to_string()
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("nostr-mcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init", "serve", "thread"] {
        assert!(text.contains(cmd));
    }
}

#[test]
fn init_cli_writes_default_env() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join(".env");
    Command::cargo_bin("nostr-mcp")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "init"])
        .assert()
        .success();
    let data = fs::read_to_string(&env_path).unwrap();
    assert!(data.contains("RELAYS="));
    assert!(data.contains("RESOLVE_DEPTH=2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_cli_renders_conversation_from_relay() {
    let root_id = "1".repeat(64);
    let reply_id = "2".repeat(64);
    let pk = "3".repeat(64);
    let root = json!({
        "id": root_id.clone(),
        "pubkey": pk.clone(),
        "kind": 1,
        "created_at": 1700000000u64,
        "tags": [],
        "content": "hello from the root",
        "sig": "",
    });
    let reply = json!({
        "id": reply_id.clone(),
        "pubkey": pk.clone(),
        "kind": 1,
        "created_at": 1700000100u64,
        "tags": [["e", root_id.clone(), "", "reply"]],
        "content": "a fine reply",
        "sig": "",
    });
    let (relay_url, relay) = spawn_stub_relay(vec![root, reply]).await;
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &relay_url);

    let output = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("nostr-mcp")
            .unwrap()
            .args(["--env", &env_path, "thread", &reply_id])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    relay.abort();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("hello from the root"));
    assert!(stdout.contains("a fine reply"));
    assert!(stdout.contains("- path length: 2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_cli_fails_cleanly_when_event_missing() {
    let (relay_url, relay) = spawn_stub_relay(vec![]).await;
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &relay_url);
    let missing = "9".repeat(64);

    let output = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("nostr-mcp")
            .unwrap()
            .args(["--env", &env_path, "thread", &missing])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    relay.abort();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("not found"));
}
