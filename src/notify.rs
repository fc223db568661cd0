//! Notification derivation and the bounded in-memory notification store.

use std::collections::{HashMap, VecDeque};

use crate::event::{Event, Tag, KIND_NOTIFICATION};

/// Hard cutoff for content previews embedded in summaries.
const PREVIEW_LEN: usize = 120;

/// How much of the watched identity key is baked into the idempotency key.
const WATCHER_PREFIX_LEN: usize = 16;

/// Readable noun for a source kind, used in notification summaries.
pub fn kind_noun(kind: u32) -> String {
    match kind {
        0 => "profile update".into(),
        1 => "note".into(),
        6 => "repost".into(),
        7 => "reaction".into(),
        30023 => "article".into(),
        other => format!("kind {other} event"),
    }
}

/// Deterministic discriminator for `(source event, watched identity)`.
///
/// Reprocessing the same source event for the same watcher always lands on
/// the same store key, making ingestion idempotent.
pub fn discriminator_for(source_id: &str, watched: &str) -> String {
    let prefix = &watched[..WATCHER_PREFIX_LEN.min(watched.len())];
    format!("{source_id}:{prefix}")
}

/// Derive a notification record from a source event for a watched identity.
///
/// `author_name` is the already-resolved display name of the source author
/// (callers resolve it through the usual fallback chain and may cache it).
/// `created_at` is the processing wall-clock time, not the source timestamp.
pub fn build(source: &Event, watched: &str, author_name: &str) -> Event {
    let noun = kind_noun(source.kind);
    // Self-mention is a content heuristic: a p tag pointing back at the
    // event's own author reads as "mentioned you" rather than "created".
    let verb = if source.mentions_own_author() {
        format!("mentioned you in a {noun}")
    } else {
        format!("created a {noun}")
    };
    let preview = preview(&source.content);
    let content = if preview.is_empty() {
        format!("{author_name} {verb}")
    } else {
        format!("{author_name} {verb}: {preview}")
    };
    Event {
        id: String::new(),
        pubkey: watched.to_string(),
        kind: KIND_NOTIFICATION,
        created_at: now_unix(),
        tags: vec![
            Tag::event(source.id.clone()),
            Tag::identity(source.pubkey.clone()),
            Tag::kind_ref(source.kind),
            Tag::discriminator(discriminator_for(&source.id, watched)),
        ],
        content,
        sig: String::new(),
    }
}

/// Current Unix time in seconds.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn preview(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= PREVIEW_LEN {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(PREVIEW_LEN).collect();
    format!("{cut}…")
}

/// Bounded, insertion-ordered notification store.
///
/// Upserts are keyed by the discriminator tag; insertion order is tracked
/// separately for eviction. A re-store of an existing key updates the value
/// but keeps its original position, so the oldest-inserted key is always the
/// first evicted. FIFO on purpose, not an LRU.
pub struct NotificationStore {
    capacity: usize,
    entries: HashMap<String, Event>,
    order: VecDeque<String>,
}

impl NotificationStore {
    /// Create a store holding at most `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Upsert a notification; evicts the oldest-inserted entries when full.
    pub fn store(&mut self, notification: Event) {
        let key = notification
            .discriminator()
            .unwrap_or_else(|| format!("{}:{}", notification.created_at, notification.pubkey));
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, notification);
        self.prune();
    }

    /// Evict oldest-inserted keys until within capacity.
    fn prune(&mut self) {
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Matching notifications, newest-first by `created_at`; bounds inclusive.
    pub fn retrieve(
        &self,
        since: Option<u64>,
        until: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let mut out: Vec<Event> = self
            .entries
            .values()
            .filter(|n| since.map_or(true, |s| n.created_at >= s))
            .filter(|n| until.map_or(true, |u| n.created_at <= u))
            .cloned()
            .collect();
        out.sort_by_key(|n| std::cmp::Reverse(n.created_at));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// Number of stored notifications.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Full unsorted dump.
    pub fn export(&self) -> Vec<Event> {
        self.entries.values().cloned().collect()
    }
}
