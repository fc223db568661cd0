//! Profile metadata lookup and display naming.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::short_identity;
use crate::event::{Event, Filter, KIND_PROFILE};
use crate::source::EventSource;

/// Fields of interest from a kind-0 profile event's JSON content.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileMeta {
    /// Handle-style name.
    pub name: Option<String>,
    /// Preferred display name.
    pub display_name: Option<String>,
    /// Domain-verified NIP-05 handle.
    pub nip05: Option<String>,
}

impl ProfileMeta {
    /// Parse the content of a profile event; malformed JSON yields an empty
    /// profile rather than an error.
    pub fn from_event(ev: &Event) -> Self {
        serde_json::from_str(&ev.content).unwrap_or_default()
    }
}

/// Display name with the standard fallback order: explicit display name,
/// handle, then truncated npub.
pub fn display_name(pubkey: &str, meta: Option<&ProfileMeta>) -> String {
    if let Some(meta) = meta {
        if let Some(name) = non_empty(&meta.display_name) {
            return name;
        }
        if let Some(name) = non_empty(&meta.name) {
            return name;
        }
    }
    short_identity(pubkey)
}

fn non_empty(field: &Option<String>) -> Option<String> {
    field
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Fetch one identity's profile, bounded by `timeout`; `None` on miss or
/// timeout, since profile lookups never fail a caller.
pub async fn fetch_profile(
    source: &dyn EventSource,
    pubkey: &str,
    timeout: Duration,
) -> Option<ProfileMeta> {
    let filter = Filter::authors(vec![pubkey.to_string()])
        .kinds(vec![KIND_PROFILE])
        .limit(1);
    let events = tokio::time::timeout(timeout, source.query_once(&filter))
        .await
        .ok()?
        .ok()?;
    events.first().map(ProfileMeta::from_event)
}

/// Batch-fetch profiles for all `pubkeys` in one query, keeping the newest
/// profile per author. Absent authors simply have no entry.
pub async fn fetch_profiles(
    source: &dyn EventSource,
    pubkeys: &[String],
    timeout: Duration,
) -> HashMap<String, ProfileMeta> {
    let mut out = HashMap::new();
    if pubkeys.is_empty() {
        return out;
    }
    let filter = Filter::authors(pubkeys.to_vec()).kinds(vec![KIND_PROFILE]);
    let events = match tokio::time::timeout(timeout, source.query_once(&filter)).await {
        Ok(Ok(events)) => events,
        _ => return out,
    };
    // query_once returns newest-first, so the first profile per author wins.
    for ev in events {
        out.entry(ev.pubkey.clone())
            .or_insert_with(|| ProfileMeta::from_event(&ev));
    }
    out
}

/// Render a Unix timestamp as a short UTC string.
pub fn format_timestamp(ts: u64) -> String {
    match chrono::DateTime::from_timestamp(ts as i64, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => ts.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::source::testing::MemorySource;

    fn profile_event(pubkey: &str, content: &str, created: u64) -> Event {
        Event {
            id: format!("prof-{pubkey}-{created}"),
            pubkey: pubkey.into(),
            kind: KIND_PROFILE,
            created_at: created,
            tags: vec![Tag::discriminator("")],
            content: content.into(),
            sig: String::new(),
        }
    }

    #[test]
    fn fallback_order() {
        let pk = "c".repeat(64);
        let full = ProfileMeta {
            name: Some("alice".into()),
            display_name: Some("Alice A".into()),
            nip05: None,
        };
        assert_eq!(display_name(&pk, Some(&full)), "Alice A");
        let handle_only = ProfileMeta {
            name: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(display_name(&pk, Some(&handle_only)), "alice");
        let empty = ProfileMeta {
            display_name: Some("  ".into()),
            ..Default::default()
        };
        assert!(display_name(&pk, Some(&empty)).starts_with("npub1"));
        assert!(display_name(&pk, None).starts_with("npub1"));
    }

    #[test]
    fn malformed_profile_content_is_empty() {
        let ev = profile_event("p1", "not json", 1);
        let meta = ProfileMeta::from_event(&ev);
        assert!(meta.name.is_none());
        assert!(meta.display_name.is_none());
    }

    #[tokio::test]
    async fn batch_fetch_keeps_newest_per_author() {
        let source = MemorySource::new(vec![
            profile_event("p1", r#"{"name":"old"}"#, 1),
            profile_event("p1", r#"{"name":"new"}"#, 2),
            profile_event("p2", r#"{"name":"bob"}"#, 1),
        ]);
        let profiles = fetch_profiles(
            &source,
            &["p1".into(), "p2".into(), "p3".into()],
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(profiles["p1"].name.as_deref(), Some("new"));
        assert_eq!(profiles["p2"].name.as_deref(), Some("bob"));
        assert!(!profiles.contains_key("p3"));
    }

    #[tokio::test]
    async fn slow_profile_lookup_times_out_to_none() {
        let mut source = MemorySource::new(vec![profile_event("p1", r#"{"name":"x"}"#, 1)]);
        source.delay = Some(Duration::from_millis(200));
        let got = fetch_profile(&source, "p1", Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[test]
    fn timestamps_render_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00 UTC");
    }
}
