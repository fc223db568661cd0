//! Relay-backed event source: one-shot queries and live subscriptions.
//!
//! The rest of the crate consumes relays only through the [`EventSource`]
//! trait; [`RelayPool`] is the production implementation speaking NIP-01 over
//! WebSockets, optionally through a SOCKS5 proxy. Live queries are delivered
//! as a cancellable channel-backed handle consumed by a dedicated task per
//! subscription; relay I/O never invokes handler code directly.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use secp256k1::{schnorr::Signature, Message as SecpMessage, Secp256k1, XOnlyPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::codec::EventPointer;
use crate::event::{Event, Filter};

/// Options for opening a live query.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveQueryOptions {
    /// Close the query once the historical backlog has been delivered
    /// (relay EOSE). Monitoring subscriptions leave this off so the query
    /// stays open indefinitely.
    pub close_on_catchup: bool,
}

/// Handle to a standing filtered subscription.
///
/// Events arrive on an internal channel fed by one pump task per relay.
/// Dropping the handle without [`LiveQuery::close`] aborts delivery but does
/// not wait for the pumps; `close` is the synchronous-stop path and guarantees
/// no event is delivered after it returns.
pub struct LiveQuery {
    /// Subscription identifier shared with the relays.
    pub id: String,
    rx: mpsc::Receiver<Event>,
    cancel: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
}

impl LiveQuery {
    /// Receive the next event, or `None` once every pump has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Whether all underlying relay connections have terminated.
    pub fn is_dead(&self) -> bool {
        self.pumps.iter().all(|p| p.is_finished())
    }

    /// Cancel the subscription and wait for every pump to acknowledge.
    pub async fn close(self) {
        let _ = self.cancel.send(true);
        for pump in self.pumps {
            let _ = pump.await;
        }
    }
}

/// Network abstraction over a shared event pool.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// One-shot filtered query, merged across relays and de-duplicated by
    /// event id, newest first.
    async fn query_once(&self, filter: &Filter) -> Result<Vec<Event>>;

    /// Fetch a single event by pointer, following relay hints when present.
    async fn fetch_event(&self, pointer: &EventPointer) -> Result<Option<Event>>;

    /// Open a standing filtered subscription.
    async fn open_live_query(
        &self,
        filter: &Filter,
        opts: LiveQueryOptions,
    ) -> Result<LiveQuery>;
}

/// Pool of upstream relays shared by every operation.
#[derive(Clone)]
pub struct RelayPool {
    relays: Vec<String>,
    tor_socks: Option<String>,
    verify_sig: bool,
    collect_window: Duration,
}

impl RelayPool {
    /// Create a pool over the given relay URLs.
    pub fn new(
        relays: Vec<String>,
        tor_socks: Option<String>,
        verify_sig: bool,
        collect_window: Duration,
    ) -> Self {
        Self {
            relays,
            tor_socks,
            verify_sig,
            collect_window,
        }
    }

    /// Collect events from one relay until EOSE or the collection window
    /// elapses; partial results are acceptable.
    async fn collect_from_relay(&self, relay: &str, filter: &Filter) -> Result<Vec<Event>> {
        let sub = sub_id();
        let req = json!(["REQ", sub, filter.to_value()]);
        let mut ws = connect_ws(relay, self.tor_socks.as_deref()).await?;
        ws.send(Message::Text(req.to_string())).await?;
        let mut events = vec![];
        let deadline = tokio::time::Instant::now() + self.collect_window;
        loop {
            let msg = match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(msg)) => msg?,
                // Stream ended or window elapsed: return what arrived.
                Ok(None) | Err(_) => break,
            };
            match msg {
                Message::Text(txt) => match parse_relay_frame(&txt, &sub) {
                    Some(RelayFrame::Event(ev)) => {
                        // Relays are expected to apply the filter; re-check
                        // locally so a sloppy one cannot pollute results.
                        if filter.matches(&ev) && self.check_event(&ev) {
                            events.push(ev);
                        }
                    }
                    Some(RelayFrame::Eose) => break,
                    None => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.send(Message::Text(json!(["CLOSE", sub]).to_string())).await;
        Ok(events)
    }

    /// Query an explicit relay list (pool relays plus any pointer hints).
    async fn query_relays(&self, relays: &[String], filter: &Filter) -> Result<Vec<Event>> {
        if relays.is_empty() {
            return Err(anyhow!("no relays configured"));
        }
        let mut merged: Vec<Event> = vec![];
        let mut seen = std::collections::HashSet::new();
        let mut failures = 0usize;
        let results = futures_util::future::join_all(
            relays.iter().map(|r| self.collect_from_relay(r, filter)),
        )
        .await;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(events) => {
                    for ev in events {
                        if seen.insert(ev.id.clone()) {
                            merged.push(ev);
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %relay, error = %e, "relay query failed");
                    failures += 1;
                }
            }
        }
        if failures == relays.len() {
            return Err(anyhow!("all {} relays failed", relays.len()));
        }
        merged.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    fn check_event(&self, ev: &Event) -> bool {
        if !self.verify_sig {
            return true;
        }
        match verify_event(ev) {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %ev.id, error = %e, "dropping event failing verification");
                false
            }
        }
    }
}

#[async_trait]
impl EventSource for RelayPool {
    async fn query_once(&self, filter: &Filter) -> Result<Vec<Event>> {
        self.query_relays(&self.relays, filter).await
    }

    async fn fetch_event(&self, pointer: &EventPointer) -> Result<Option<Event>> {
        let (filter, hints) = match pointer {
            EventPointer::Id { id, relays } => {
                (Filter::ids(vec![id.clone()]).limit(1), relays.clone())
            }
            EventPointer::Address {
                kind,
                pubkey,
                identifier,
                relays,
            } => {
                let filter = Filter {
                    authors: Some(vec![pubkey.clone()]),
                    kinds: Some(vec![*kind]),
                    identifier: Some(identifier.clone()),
                    limit: Some(1),
                    ..Default::default()
                };
                (filter, relays.clone())
            }
        };
        let mut relays = self.relays.clone();
        for hint in hints {
            if !relays.contains(&hint) {
                relays.push(hint);
            }
        }
        let events = self.query_relays(&relays, &filter).await?;
        Ok(events.into_iter().next())
    }

    async fn open_live_query(
        &self,
        filter: &Filter,
        opts: LiveQueryOptions,
    ) -> Result<LiveQuery> {
        if self.relays.is_empty() {
            return Err(anyhow!("no relays configured"));
        }
        let sub = sub_id();
        let (tx, rx) = mpsc::channel(256);
        let (cancel, _) = watch::channel(false);
        let mut pumps = vec![];
        for relay in &self.relays {
            let relay = relay.clone();
            let filter = filter.clone();
            let tx = tx.clone();
            let mut cancelled = cancel.subscribe();
            let sub = sub.clone();
            let pool = self.clone();
            pumps.push(tokio::spawn(async move {
                if let Err(e) = pump_relay(&pool, &relay, &filter, &sub, opts, tx, &mut cancelled).await
                {
                    debug!(relay = %relay, error = %e, "live query pump ended");
                }
            }));
        }
        Ok(LiveQuery {
            id: sub,
            rx,
            cancel,
            pumps,
        })
    }
}

/// Read one relay connection into the live-query channel until cancelled,
/// caught up (when requested), or disconnected.
async fn pump_relay(
    pool: &RelayPool,
    relay: &str,
    filter: &Filter,
    sub: &str,
    opts: LiveQueryOptions,
    tx: mpsc::Sender<Event>,
    cancelled: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut ws = connect_ws(relay, pool.tor_socks.as_deref()).await?;
    let req = json!(["REQ", sub, filter.to_value()]);
    ws.send(Message::Text(req.to_string())).await?;
    loop {
        tokio::select! {
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    let _ = ws.send(Message::Text(json!(["CLOSE", sub]).to_string())).await;
                    return Ok(());
                }
            }
            msg = ws.next() => {
                let msg = match msg {
                    Some(m) => m?,
                    None => return Ok(()),
                };
                match msg {
                    Message::Text(txt) => match parse_relay_frame(&txt, sub) {
                        Some(RelayFrame::Event(ev)) => {
                            if !filter.matches(&ev) {
                                continue;
                            }
                            if pool.check_event(&ev) && tx.send(ev).await.is_err() {
                                // Consumer went away; stop reading.
                                return Ok(());
                            }
                        }
                        Some(RelayFrame::Eose) if opts.close_on_catchup => {
                            let _ = ws
                                .send(Message::Text(json!(["CLOSE", sub]).to_string()))
                                .await;
                            return Ok(());
                        }
                        _ => {}
                    },
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Relay-to-client frames this crate cares about.
enum RelayFrame {
    Event(Event),
    Eose,
}

/// Parse an inbound relay frame addressed to `sub`.
fn parse_relay_frame(txt: &str, sub: &str) -> Option<RelayFrame> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            if arr.get(1).and_then(|v| v.as_str()) != Some(sub) {
                return None;
            }
            serde_json::from_value::<Event>(arr[2].clone())
                .ok()
                .map(RelayFrame::Event)
        }
        Some("EOSE") if arr.get(1).and_then(|v| v.as_str()) == Some(sub) => {
            Some(RelayFrame::Eose)
        }
        _ => None,
    }
}

/// Random subscription identifier shared with relays.
fn sub_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Recompute the Nostr event hash from its fields.
pub(crate) fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub(crate) fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = SecpMessage::from_digest_slice(&hash).context("event hash")?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
