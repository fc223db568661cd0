//! Public bridge operations consumed by the MCP server, the HTTP sidecar,
//! and the CLI.
//!
//! Every operation returns a typed result or a [`BridgeError`]; the protocol
//! layers convert errors into structured payloads at the boundary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::codec::{self, encode_note};
use crate::error::{BridgeError, OpResult};
use crate::event::{Event, Filter, KIND_NOTE};
use crate::profile::format_timestamp;
use crate::resolver::{resolve_content, ResolveOptions};
use crate::source::EventSource;
use crate::subscribe::{SubscriptionEngine, SubscriptionSnapshot};
use crate::thread::{self, build_reply_tree, get_thread, ReplyNode};

/// Default conversation count for `track_conversations`.
pub const DEFAULT_TRACK_LIMIT: usize = 20;
/// Default reply-tree depth.
pub const DEFAULT_THREAD_DEPTH: usize = 2;
/// Events returned by a resource read.
const FEED_LIMIT: usize = 50;

/// The bridge's operation surface; owns the subscription engine and shares
/// the event source with it.
pub struct Bridge {
    source: Arc<dyn EventSource>,
    /// Live subscription state; exclusively owned here.
    pub engine: SubscriptionEngine,
    resolve_opts: ResolveOptions,
    lookup_timeout: Duration,
}

impl Bridge {
    /// Assemble the bridge over an event source.
    pub fn new(
        source: Arc<dyn EventSource>,
        notify_capacity: usize,
        resolve_opts: ResolveOptions,
    ) -> Self {
        let engine = SubscriptionEngine::new(
            source.clone(),
            notify_capacity,
            resolve_opts.lookup_timeout,
        );
        Self {
            source,
            engine,
            resolve_opts,
            lookup_timeout: resolve_opts.lookup_timeout,
        }
    }

    /// Reconstruct and render the conversation containing the pointed-at
    /// event as a markdown document.
    pub async fn get_conversation(&self, pointer: &str) -> OpResult<String> {
        let pointer = codec::parse_event_pointer(pointer)?;
        let thread = get_thread(self.source.as_ref(), &pointer, self.lookup_timeout).await?;
        let mut resolved = Vec::with_capacity(thread.path.len());
        for ev in &thread.path {
            resolved
                .push(resolve_content(self.source.as_ref(), &ev.content, self.resolve_opts).await);
        }
        Ok(render_conversation(&thread, &resolved))
    }

    /// Search recent conversations by topic and free text.
    ///
    /// `#`-prefixed tokens filter on topic tags; remaining tokens must all
    /// appear in the content, case-insensitively. Matches collapse onto their
    /// thread roots, each carrying a depth-bounded reply tree.
    pub async fn track_conversations(
        &self,
        query: &str,
        limit: usize,
        since: Option<u64>,
        until: Option<u64>,
        thread_depth: usize,
    ) -> OpResult<Value> {
        let limit = if limit == 0 { DEFAULT_TRACK_LIMIT } else { limit };
        let (topics, words) = split_query(query);
        let mut filter = Filter {
            kinds: Some(vec![KIND_NOTE]),
            since,
            until,
            // Over-fetch so free-text filtering still fills the page.
            limit: Some(limit.max(DEFAULT_TRACK_LIMIT) * 5),
            ..Default::default()
        };
        if !topics.is_empty() {
            filter.topics = Some(topics);
        }
        let matched: Vec<Event> = self
            .source
            .query_once(&filter)
            .await?
            .into_iter()
            .filter(|ev| {
                let content = ev.content.to_lowercase();
                words.iter().all(|w| content.contains(w))
            })
            .collect();

        // Collapse matches onto distinct thread roots, newest match first.
        let mut root_ids: Vec<String> = vec![];
        for ev in &matched {
            let root = thread::root_id(ev);
            if !root_ids.contains(&root) {
                root_ids.push(root);
            }
        }

        let mut conversations = vec![];
        for root_id in root_ids.into_iter().take(limit) {
            let root = match self
                .source
                .fetch_event(&codec::EventPointer::Id {
                    id: root_id.clone(),
                    relays: vec![],
                })
                .await?
            {
                Some(root) => root,
                // A match whose root no relay carries is dropped silently.
                None => continue,
            };
            let candidates = self
                .source
                .query_once(&Filter::referencing_event(root_id.clone()))
                .await?;
            let replies = build_reply_tree(&root_id, &candidates, thread_depth);
            let reply_count = count_nodes(&replies);
            let latest = candidates.iter().map(|e| e.created_at).max();
            conversations.push(json!({
                "root": root,
                "replies": replies_json(&replies),
                "metadata": {
                    "reply_count": reply_count,
                    "latest_activity": latest,
                },
            }));
        }
        Ok(Value::Array(conversations))
    }

    /// Begin monitoring an identity; accepts hex, npub, nprofile, or a
    /// NIP-05 handle. Returns the resolved hex key.
    pub async fn start_monitoring(&self, identity: &str) -> OpResult<String> {
        let key = self.resolve_identity(identity).await?;
        self.engine.add_subscription(&key).await?;
        Ok(key)
    }

    /// Stop monitoring; `Ok(false)` when nothing was active.
    pub async fn stop_monitoring(&self, identity: &str) -> OpResult<bool> {
        let key = self.resolve_identity(identity).await?;
        Ok(self.engine.remove_subscription(&key).await)
    }

    /// Stored notifications for a monitored identity, newest first.
    pub async fn get_notifications(
        &self,
        identity: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> OpResult<Value> {
        let key = self.resolve_identity(identity).await?;
        let notifications = self.engine.notifications(&key, since, limit).await?;
        Ok(json!(notifications))
    }

    /// Snapshot of active monitors.
    pub async fn list_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.engine.active_subscriptions().await
    }

    /// One-shot read of a resource URI as newline-delimited JSON, one record
    /// per event, stripped of `id`/`sig`.
    pub async fn read_resource(&self, uri: &str) -> OpResult<String> {
        let filter = self.resource_filter(uri).await?.limit(FEED_LIMIT);
        let events = self.source.query_once(&filter).await?;
        let mut out = String::new();
        for ev in events {
            out.push_str(&feed_record(&ev).to_string());
            out.push('\n');
        }
        Ok(out)
    }

    /// Filter behind a resource URI. `nostr://feed/<id>` is an author's
    /// notes; `nostr://mentions/<id>` is everything referencing the key.
    pub async fn resource_filter(&self, uri: &str) -> OpResult<Filter> {
        let rest = uri
            .strip_prefix("nostr://")
            .ok_or_else(|| BridgeError::InvalidInput(format!("unsupported uri {uri:?}")))?;
        let (kind, id) = rest
            .split_once('/')
            .ok_or_else(|| BridgeError::InvalidInput(format!("unsupported uri {uri:?}")))?;
        let key = self.resolve_identity(id).await?;
        match kind {
            "feed" => Ok(Filter::authors(vec![key]).kinds(vec![KIND_NOTE])),
            "mentions" => Ok(Filter::referencing_identity(key)),
            other => Err(BridgeError::InvalidInput(format!(
                "unknown resource type {other:?}"
            ))),
        }
    }

    /// Resolve any accepted identity form to a hex key; handles with a
    /// domain part go through NIP-05.
    async fn resolve_identity(&self, identity: &str) -> OpResult<String> {
        match codec::parse_identity(identity) {
            Ok(key) => Ok(key),
            Err(parse_err) => {
                if identity.contains('.') {
                    codec::resolve_handle(identity).await
                } else {
                    Err(parse_err)
                }
            }
        }
    }
}

/// Split a query into lowercase topic tokens (`#`-prefixed) and free-text
/// tokens.
fn split_query(query: &str) -> (Vec<String>, Vec<String>) {
    let mut topics = vec![];
    let mut words = vec![];
    for token in query.split_whitespace() {
        if let Some(topic) = token.strip_prefix('#') {
            if !topic.is_empty() {
                topics.push(topic.to_lowercase());
            }
        } else {
            words.push(token.to_lowercase());
        }
    }
    (topics, words)
}

fn count_nodes(nodes: &[ReplyNode]) -> usize {
    nodes
        .iter()
        .map(|n| 1 + count_nodes(&n.children))
        .sum()
}

fn replies_json(nodes: &[ReplyNode]) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|n| {
                json!({
                    "event": n.event,
                    "replies": replies_json(&n.children),
                })
            })
            .collect(),
    )
}

/// Feed-view record: the event minus `id`/`sig`, which list views
/// deliberately strip.
pub fn feed_record(ev: &Event) -> Value {
    json!({
        "created_at": ev.created_at,
        "content": ev.content,
        "kind": ev.kind,
        "pubkey": ev.pubkey,
        "tags": ev.tags,
    })
}

/// Render a reconstructed thread as markdown, indented per depth, with a
/// trailing metadata block.
fn render_conversation(thread: &thread::Thread, resolved: &[String]) -> String {
    let mut out = String::from("# Conversation\n\n");
    for (depth, (ev, content)) in thread.path.iter().zip(resolved).enumerate() {
        let indent = "  ".repeat(depth);
        let fallback = codec::short_identity(&ev.pubkey);
        let name = thread.participants.get(&ev.pubkey).unwrap_or(&fallback);
        out.push_str(&format!(
            "{indent}**@{name}** · {}\n",
            format_timestamp(ev.created_at)
        ));
        for line in content.lines() {
            out.push_str(&format!("{indent}{line}\n"));
        }
        out.push('\n');
    }
    let target = thread.path.last().map(|e| e.id.clone()).unwrap_or_default();
    out.push_str("---\n");
    out.push_str(&format!("- root: {}\n", display_id(&thread.root_id)));
    out.push_str(&format!("- target: {}\n", display_id(&target)));
    out.push_str(&format!("- path length: {}\n", thread.path.len()));
    out.push_str(&format!("- participants: {}\n", thread.participants.len()));
    out
}

fn display_id(id: &str) -> String {
    encode_note(id).unwrap_or_else(|_| id.to_string())
}
