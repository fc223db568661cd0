//! Nostr event model, typed tags, and subscription filters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind number for profile metadata events.
pub const KIND_PROFILE: u32 = 0;
/// Kind number for standard text notes.
pub const KIND_NOTE: u32 = 1;
/// Kind number for reposts.
pub const KIND_REPOST: u32 = 6;
/// Kind number for reactions.
pub const KIND_REACTION: u32 = 7;
/// Kind number for derived notification records, in the parameterized
/// replaceable range so the `d` tag acts as the upsert key.
pub const KIND_NOTIFICATION: u32 = 30078;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `e` – links to another event ID, optionally with a `root`/`reply` marker
///   in the fourth position
/// - `p` – references another author's public key
/// - `t` – free-form topic or hashtag
/// - `d` – unique identifier for replaceable events
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build an `e` tag without a marker.
    pub fn event(id: impl Into<String>) -> Self {
        Tag(vec!["e".into(), id.into()])
    }

    /// Build an `e` tag carrying a `root`/`reply` marker.
    pub fn event_marked(id: impl Into<String>, marker: &str) -> Self {
        Tag(vec!["e".into(), id.into(), String::new(), marker.into()])
    }

    /// Build a `p` tag.
    pub fn identity(key: impl Into<String>) -> Self {
        Tag(vec!["p".into(), key.into()])
    }

    /// Build a `t` tag.
    pub fn topic(label: impl Into<String>) -> Self {
        Tag(vec!["t".into(), label.into()])
    }

    /// Build a `d` tag.
    pub fn discriminator(value: impl Into<String>) -> Self {
        Tag(vec!["d".into(), value.into()])
    }

    /// Build a `k` tag carrying a numeric kind as text.
    pub fn kind_ref(kind: u32) -> Self {
        Tag(vec!["k".into(), kind.to_string()])
    }

    /// Parse the raw string array into a typed entry.
    ///
    /// Returns `None` for unknown types and for tags missing their value
    /// element; such tags are preserved on the event but carry no meaning for
    /// thread walking or classification.
    pub fn parse(&self) -> Option<TagEntry> {
        let fields = &self.0;
        match (fields.first().map(String::as_str), fields.get(1)) {
            (Some("e"), Some(id)) => {
                let role = match fields.get(3).map(String::as_str) {
                    Some("root") => Some(EventRole::Root),
                    Some("reply") => Some(EventRole::Reply),
                    _ => None,
                };
                Some(TagEntry::EventRef { id: id.clone(), role })
            }
            (Some("p"), Some(key)) => Some(TagEntry::IdentityRef { key: key.clone() }),
            (Some("t"), Some(label)) => Some(TagEntry::Topic { label: label.clone() }),
            (Some("d"), Some(value)) => Some(TagEntry::Discriminator { value: value.clone() }),
            (Some("k"), Some(kind)) => Some(TagEntry::KindRef { kind: kind.clone() }),
            _ => None,
        }
    }
}

/// Semantic role carried by a marked `e` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    /// Points at the thread root.
    Root,
    /// Points at the direct parent.
    Reply,
}

/// Typed view of a tag, parsed once so downstream logic never indexes into
/// raw string arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum TagEntry {
    /// `e` tag: reference to another event, optionally marked.
    EventRef { id: String, role: Option<EventRole> },
    /// `p` tag: reference to an identity key.
    IdentityRef { key: String },
    /// `t` tag: topic label.
    Topic { label: String },
    /// `d` tag: replaceable-event discriminator.
    Discriminator { value: String },
    /// `k` tag: numeric kind reference carried as text.
    KindRef { kind: String },
}

/// Core Nostr event received from relays and served through the bridge.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "8f3c…",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["e", "bb22", "", "root"], ["p", "9d41…"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
///
/// Identity and integrity live in `id`/`sig`; this crate treats both as
/// opaque validated strings and relies on `id` being content-addressed for
/// de-duplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30078`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `e` (event reference) or `p` (identity).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// All `e` tag references in tag order, `(id, role)` per entry.
    pub fn event_refs(&self) -> Vec<(String, Option<EventRole>)> {
        self.tags
            .iter()
            .filter_map(Tag::parse)
            .filter_map(|entry| match entry {
                TagEntry::EventRef { id, role } => Some((id, role)),
                _ => None,
            })
            .collect()
    }

    /// All `p` tag keys in tag order.
    pub fn identity_refs(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(Tag::parse)
            .filter_map(|entry| match entry {
                TagEntry::IdentityRef { key } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// All `t` tag labels in tag order.
    pub fn topics(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(Tag::parse)
            .filter_map(|entry| match entry {
                TagEntry::Topic { label } => Some(label),
                _ => None,
            })
            .collect()
    }

    /// The first `d` tag value, if any.
    pub fn discriminator(&self) -> Option<String> {
        self.tags
            .iter()
            .filter_map(Tag::parse)
            .find_map(|entry| match entry {
                TagEntry::Discriminator { value } => Some(value),
                _ => None,
            })
    }

    /// Whether the event carries a `p` tag pointing back at its own author.
    pub fn mentions_own_author(&self) -> bool {
        self.identity_refs().iter().any(|key| key == &self.pubkey)
    }
}

/// Filter accepted by one-shot queries and live subscriptions.
///
/// Serializes to the NIP-01 filter object sent inside `REQ` frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event IDs.
    pub ids: Option<Vec<String>>,
    /// Author public keys.
    pub authors: Option<Vec<String>>,
    /// Kind numbers.
    pub kinds: Option<Vec<u32>>,
    /// Referenced event IDs (`#e`).
    pub event_refs: Option<Vec<String>>,
    /// Referenced identity keys (`#p`).
    pub identity_refs: Option<Vec<String>>,
    /// Topic labels (`#t`).
    pub topics: Option<Vec<String>>,
    /// Replaceable-event discriminator (`#d`).
    pub identifier: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum result count requested from each relay.
    pub limit: Option<usize>,
}

impl Filter {
    /// Filter matching exactly the given event IDs.
    pub fn ids(ids: Vec<String>) -> Self {
        Filter {
            ids: Some(ids),
            ..Default::default()
        }
    }

    /// Filter matching events by the given authors.
    pub fn authors(keys: Vec<String>) -> Self {
        Filter {
            authors: Some(keys),
            ..Default::default()
        }
    }

    /// Filter matching events that reference the given event ID via `e` tags.
    pub fn referencing_event(id: impl Into<String>) -> Self {
        Filter {
            event_refs: Some(vec![id.into()]),
            ..Default::default()
        }
    }

    /// Filter matching events that reference the given identity via `p` tags.
    pub fn referencing_identity(key: impl Into<String>) -> Self {
        Filter {
            identity_refs: Some(vec![key.into()]),
            ..Default::default()
        }
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Set the per-relay result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the inclusive lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the inclusive upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Render the NIP-01 filter JSON object.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), json!(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert("kinds".into(), json!(kinds));
        }
        if let Some(refs) = &self.event_refs {
            map.insert("#e".into(), json!(refs));
        }
        if let Some(refs) = &self.identity_refs {
            map.insert("#p".into(), json!(refs));
        }
        if let Some(topics) = &self.topics {
            map.insert("#t".into(), json!(topics));
        }
        if let Some(d) = &self.identifier {
            map.insert("#d".into(), json!([d]));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), json!(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), json!(limit));
        }
        Value::Object(map)
    }

    /// Whether the event matches this filter.
    ///
    /// Used by in-memory sources and live-query consumers; relays apply the
    /// same semantics server-side.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(refs) = &self.event_refs {
            let tagged = ev.event_refs();
            if !refs.iter().any(|r| tagged.iter().any(|(id, _)| id == r)) {
                return false;
            }
        }
        if let Some(refs) = &self.identity_refs {
            let tagged = ev.identity_refs();
            if !refs.iter().any(|r| tagged.contains(r)) {
                return false;
            }
        }
        if let Some(topics) = &self.topics {
            let tagged = ev.topics();
            if !topics.iter().any(|t| tagged.contains(t)) {
                return false;
            }
        }
        if let Some(d) = &self.identifier {
            if ev.discriminator().as_ref() != Some(d) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        true
    }
}
