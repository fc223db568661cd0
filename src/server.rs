//! Protocol surfaces: MCP over stdio and the HTTP sidecar.
//!
//! The MCP loop is newline-delimited JSON-RPC 2.0 on stdin/stdout. Tool-call
//! failures become `isError` tool results carrying the structured error
//! payload; nothing escapes as a panic. Resource subscriptions surface as
//! `notifications/resources/updated` notices pushed between responses.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::subscribe::ResourceUpdate;
use crate::tools::{Bridge, DEFAULT_THREAD_DEPTH, DEFAULT_TRACK_LIMIT};

/// Protocol revision answered to `initialize`.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// How often the supervisor checks for dead live queries.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(15);

/// Run the MCP server over stdio until stdin closes, alongside the
/// reconnection supervisor and optional HTTP sidecar.
pub async fn serve(bridge: Arc<Bridge>, bind_http: Option<String>) -> Result<()> {
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let (update_tx, mut update_rx) = mpsc::channel::<ResourceUpdate>(64);

    // Push a resources/updated notice for every event a subscription yields.
    let notifier_out = stdout.clone();
    let notifier = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            let notice = json!({
                "jsonrpc": "2.0",
                "method": "notifications/resources/updated",
                "params": { "uri": update.uri },
            });
            write_line(&notifier_out, &notice).await;
        }
    });

    // Reopen live queries whose transport died.
    let supervisor_bridge = bridge.clone();
    let supervisor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
        loop {
            ticker.tick().await;
            if supervisor_bridge.engine.any_dead().await {
                let replaced = supervisor_bridge.engine.handle_reconnection().await;
                info!(replaced, "reopened dead live queries");
            }
        }
    });

    if let Some(bind) = bind_http {
        let addr: SocketAddr = bind.parse()?;
        let http_bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(addr, http_bridge, std::future::pending()).await {
                warn!(error = %e, "http sidecar exited");
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_message(&bridge, &update_tx, &line).await {
            write_line(&stdout, &response).await;
        }
    }

    notifier.abort();
    supervisor.abort();
    bridge.engine.stop_all().await;
    Ok(())
}

async fn write_line(stdout: &Arc<Mutex<tokio::io::Stdout>>, value: &Value) {
    let mut out = stdout.lock().await;
    let _ = out.write_all(value.to_string().as_bytes()).await;
    let _ = out.write_all(b"\n").await;
    let _ = out.flush().await;
}

/// Handle one inbound JSON-RPC message; `None` for notifications and
/// unparseable input.
pub async fn handle_message(
    bridge: &Bridge,
    updates: &mpsc::Sender<ResourceUpdate>,
    line: &str,
) -> Option<Value> {
    let msg: Value = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable frame");
            return None;
        }
    };
    let method = msg.get("method").and_then(|m| m.as_str())?.to_string();
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    // Requests carry an id; bare notifications are consumed silently.
    let id = match id {
        Some(id) => id,
        None => return None,
    };

    let result = dispatch(bridge, updates, &method, &params).await;
    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(RpcError::Method) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("unknown method {method}") },
        }),
        Err(RpcError::Op(e)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": e.to_string(), "data": e.to_payload() },
        }),
    })
}

enum RpcError {
    Method,
    Op(BridgeError),
}

impl From<BridgeError> for RpcError {
    fn from(e: BridgeError) -> Self {
        RpcError::Op(e)
    }
}

async fn dispatch(
    bridge: &Bridge,
    updates: &mpsc::Sender<ResourceUpdate>,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {},
                "resources": { "subscribe": true },
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            Ok(call_tool(bridge, name, &args).await)
        }
        "resources/list" => {
            let uris: Vec<Value> = bridge
                .list_subscriptions()
                .await
                .into_iter()
                .map(|s| {
                    json!({
                        "uri": format!("nostr://mentions/{}", s.identity),
                        "name": format!("mentions of {}", s.identity),
                        "mimeType": "application/x-ndjson",
                    })
                })
                .collect();
            Ok(json!({ "resources": uris }))
        }
        "resources/read" => {
            let uri = require_str(params, "uri")?;
            let text = bridge.read_resource(&uri).await?;
            Ok(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/x-ndjson",
                    "text": text,
                }],
            }))
        }
        "resources/subscribe" => {
            let uri = require_str(params, "uri")?;
            let filter = bridge.resource_filter(&uri).await?;
            bridge
                .engine
                .subscribe_resource(&uri, filter, updates.clone())
                .await?;
            Ok(json!({}))
        }
        "resources/unsubscribe" => {
            let uri = require_str(params, "uri")?;
            bridge.engine.unsubscribe_resource(&uri).await;
            Ok(json!({}))
        }
        _ => Err(RpcError::Method),
    }
}

fn require_str(params: &Value, key: &str) -> Result<String, RpcError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| RpcError::Op(BridgeError::InvalidInput(format!("missing {key}"))))
}

/// Run one tool; failures become `isError` results, never protocol errors.
async fn call_tool(bridge: &Bridge, name: &str, args: &Value) -> Value {
    let outcome = run_tool(bridge, name, args).await;
    match outcome {
        Ok(text) => json!({
            "content": [{ "type": "text", "text": text }],
        }),
        Err(e) => json!({
            "content": [{ "type": "text", "text": e.to_payload().to_string() }],
            "isError": true,
        }),
    }
}

async fn run_tool(bridge: &Bridge, name: &str, args: &Value) -> Result<String, BridgeError> {
    let str_arg = |key: &str| -> Result<String, BridgeError> {
        args.get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| BridgeError::InvalidInput(format!("missing argument {key:?}")))
    };
    let num_arg = |key: &str| args.get(key).and_then(|v| v.as_u64());

    match name {
        "get_conversation" => bridge.get_conversation(&str_arg("pointer")?).await,
        "track_conversations" => {
            let query = str_arg("query").unwrap_or_default();
            let limit = num_arg("limit").unwrap_or(DEFAULT_TRACK_LIMIT as u64) as usize;
            let depth = num_arg("thread_depth").unwrap_or(DEFAULT_THREAD_DEPTH as u64) as usize;
            let out = bridge
                .track_conversations(&query, limit, num_arg("since"), num_arg("until"), depth)
                .await?;
            Ok(out.to_string())
        }
        "start_monitoring" => {
            let key = bridge.start_monitoring(&str_arg("identity")?).await?;
            Ok(json!({ "monitoring": key }).to_string())
        }
        "stop_monitoring" => {
            let stopped = bridge.stop_monitoring(&str_arg("identity")?).await?;
            Ok(json!({ "stopped": stopped }).to_string())
        }
        "get_notifications" => {
            let out = bridge
                .get_notifications(
                    &str_arg("identity")?,
                    num_arg("limit").map(|n| n as usize),
                    num_arg("since"),
                )
                .await?;
            Ok(out.to_string())
        }
        "list_subscriptions" => {
            let subs = bridge.list_subscriptions().await;
            Ok(json!(subs).to_string())
        }
        other => Err(BridgeError::InvalidInput(format!("unknown tool {other:?}"))),
    }
}

fn tool_descriptors() -> Vec<Value> {
    let string_prop = |desc: &str| json!({ "type": "string", "description": desc });
    let int_prop = |desc: &str| json!({ "type": "integer", "description": desc });
    vec![
        json!({
            "name": "get_conversation",
            "description": "Reconstruct the full conversation thread containing an event and render it as markdown.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "pointer": string_prop("Event id as hex, note, nevent, or naddr"),
                },
                "required": ["pointer"],
            },
        }),
        json!({
            "name": "track_conversations",
            "description": "Search recent conversations; #tokens filter topics, other words match content.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": string_prop("Search query"),
                    "limit": int_prop("Maximum conversations (default 20)"),
                    "since": int_prop("Inclusive lower created_at bound"),
                    "until": int_prop("Inclusive upper created_at bound"),
                    "thread_depth": int_prop("Reply tree depth (default 2)"),
                },
                "required": ["query"],
            },
        }),
        json!({
            "name": "start_monitoring",
            "description": "Start collecting notifications for events referencing an identity.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "identity": string_prop("Identity as hex, npub, nprofile, or NIP-05 handle"),
                },
                "required": ["identity"],
            },
        }),
        json!({
            "name": "stop_monitoring",
            "description": "Stop collecting notifications for an identity.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "identity": string_prop("Identity as hex, npub, nprofile, or NIP-05 handle"),
                },
                "required": ["identity"],
            },
        }),
        json!({
            "name": "get_notifications",
            "description": "Fetch stored notifications for a monitored identity, newest first.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "identity": string_prop("Monitored identity"),
                    "limit": int_prop("Maximum notifications"),
                    "since": int_prop("Inclusive lower created_at bound"),
                },
                "required": ["identity"],
            },
        }),
        json!({
            "name": "list_subscriptions",
            "description": "List active notification subscriptions.",
            "inputSchema": { "type": "object", "properties": {} },
        }),
    ]
}

/// State shared by the HTTP sidecar handlers.
#[derive(Clone)]
struct HttpState {
    bridge: Arc<Bridge>,
}

/// Query parameters for the `/feed` endpoint.
#[derive(Deserialize)]
struct FeedParams {
    id: String,
    #[serde(default = "default_feed_type")]
    r#type: String,
}

fn default_feed_type() -> String {
    "feed".into()
}

/// Start the HTTP sidecar exposing `/healthz` and `/feed`.
pub async fn serve_http(
    addr: SocketAddr,
    bridge: Arc<Bridge>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(bridge);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/feed", get(feed))
        .with_state(HttpState { bridge })
}

/// Health check endpoint.
async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// NDJSON feed mirror of the resource reads.
async fn feed(
    State(state): State<HttpState>,
    AxumQuery(params): AxumQuery<FeedParams>,
) -> impl IntoResponse {
    let uri = format!("nostr://{}/{}", params.r#type, params.id);
    match state.bridge.read_resource(&uri).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.to_payload())).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Tag, KIND_NOTE};
    use crate::resolver::ResolveOptions;
    use crate::source::testing::MemorySource;

    fn hexid(seed: u8) -> String {
        hex::encode([seed; 32])
    }

    fn note_ev(id: &str, pubkey: &str, created: u64, content: &str, tags: Vec<Tag>) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind: KIND_NOTE,
            created_at: created,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    fn bridge_with(events: Vec<Event>) -> (Arc<MemorySource>, Bridge) {
        let source = Arc::new(MemorySource::new(events));
        let bridge = Bridge::new(
            source.clone(),
            100,
            ResolveOptions {
                max_depth: 2,
                lookup_timeout: Duration::from_millis(200),
            },
        );
        (source, bridge)
    }

    async fn request(bridge: &Bridge, tx: &mpsc::Sender<ResourceUpdate>, msg: Value) -> Value {
        handle_message(bridge, tx, &msg.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn initialize_advertises_capabilities() {
        let (_s, bridge) = bridge_with(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let resp = request(
            &bridge,
            &tx,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        )
        .await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "nostr-mcp");
        assert_eq!(resp["result"]["capabilities"]["resources"]["subscribe"], true);
    }

    #[tokio::test]
    async fn tools_list_names_every_operation() {
        let (_s, bridge) = bridge_with(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let resp = request(
            &bridge,
            &tx,
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await;
        let names: Vec<&str> = resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "get_conversation",
            "track_conversations",
            "start_monitoring",
            "stop_monitoring",
            "get_notifications",
            "list_subscriptions",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn tool_call_renders_conversation() {
        let (root_id, pk) = (hexid(1), hexid(2));
        let (_s, bridge) = bridge_with(vec![note_ev(&root_id, &pk, 10, "hello", vec![])]);
        let (tx, _rx) = mpsc::channel(8);
        let resp = request(
            &bridge,
            &tx,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": { "name": "get_conversation", "arguments": { "pointer": root_id } },
            }),
        )
        .await;
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("hello"));
        assert!(resp["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn tool_failure_is_an_is_error_result() {
        let (_s, bridge) = bridge_with(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let resp = request(
            &bridge,
            &tx,
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "get_conversation", "arguments": { "pointer": hexid(9) } },
            }),
        )
        .await;
        assert_eq!(resp["result"]["isError"], true);
        assert!(resp["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("not_found"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let (_s, bridge) = bridge_with(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let resp = request(
            &bridge,
            &tx,
            json!({ "jsonrpc": "2.0", "id": 5, "method": "wat/doing" }),
        )
        .await;
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_and_garbage_produce_no_reply() {
        let (_s, bridge) = bridge_with(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        assert!(handle_message(
            &bridge,
            &tx,
            &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string(),
        )
        .await
        .is_none());
        assert!(handle_message(&bridge, &tx, "not json at all").await.is_none());
    }

    #[tokio::test]
    async fn resource_read_returns_ndjson_contents() {
        let pk = hexid(3);
        let (_s, bridge) = bridge_with(vec![note_ev(&hexid(4), &pk, 10, "post", vec![])]);
        let (tx, _rx) = mpsc::channel(8);
        let uri = format!("nostr://feed/{pk}");
        let resp = request(
            &bridge,
            &tx,
            json!({
                "jsonrpc": "2.0", "id": 6, "method": "resources/read",
                "params": { "uri": uri },
            }),
        )
        .await;
        let contents = &resp["result"]["contents"][0];
        assert_eq!(contents["mimeType"], "application/x-ndjson");
        assert!(contents["text"].as_str().unwrap().contains("post"));
    }

    #[tokio::test]
    async fn subscribe_pushes_updates_through_channel() {
        let pk = hexid(5);
        let (source, bridge) = bridge_with(vec![]);
        let (tx, mut rx) = mpsc::channel(8);
        let uri = format!("nostr://mentions/{pk}");
        let resp = request(
            &bridge,
            &tx,
            json!({
                "jsonrpc": "2.0", "id": 7, "method": "resources/subscribe",
                "params": { "uri": uri },
            }),
        )
        .await;
        assert!(resp.get("error").is_none());
        source
            .inject(note_ev(&hexid(6), &hexid(7), 10, "ping", vec![Tag::identity(pk)]))
            .await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.uri, uri);
        assert_eq!(update.event.content, "ping");
    }

    #[tokio::test]
    async fn http_healthz_and_feed() {
        let pk = hexid(8);
        let (_s, bridge) = bridge_with(vec![note_ev(&hexid(9), &pk, 10, "feed item", vec![])]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(bridge));
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        let health: Value = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        let feed = reqwest::get(format!("http://{addr}/feed?id={pk}"))
            .await
            .unwrap();
        assert_eq!(feed.status(), 200);
        assert!(feed.text().await.unwrap().contains("feed item"));
        let bad = reqwest::get(format!("http://{addr}/feed?id=notakey"))
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
        server.abort();
    }
}
