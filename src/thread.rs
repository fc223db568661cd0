//! Conversation-thread reconstruction from tag-addressed events.
//!
//! Given any event, finds the thread root, rebuilds the root-to-target
//! ancestor chain, and can assemble a depth-bounded reply tree over the
//! thread's candidate set. Both NIP-10 tag conventions are honored: marked
//! `root`/`reply` tags take precedence, and unmarked tags fall back to the
//! deprecated positional rule (first `e` tag is the root, last is the direct
//! parent). The positional rule is a heuristic inherited from the protocol's
//! history and is preserved exactly, including its known ambiguity for three
//! or more unmarked tags.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::codec::EventPointer;
use crate::error::BridgeError;
use crate::event::{Event, EventRole, Filter};
use crate::profile::{display_name, fetch_profiles};
use crate::source::EventSource;

/// A reconstructed conversation path.
#[derive(Debug, Clone)]
pub struct Thread {
    /// Ordered chain, root first, target last. A broken parent link yields
    /// the longest resolvable suffix of ancestors instead of an error.
    pub path: Vec<Event>,
    /// Display names for every author appearing in `path`, keyed by pubkey.
    /// Authors without a resolvable profile get an identifier-derived name.
    pub participants: HashMap<String, String>,
    /// Root event id the walk was anchored to.
    pub root_id: String,
}

/// One node of a reply tree.
#[derive(Debug, Clone)]
pub struct ReplyNode {
    pub event: Event,
    pub children: Vec<ReplyNode>,
}

/// Thread root id for an event: itself when it has no `e` tags, the marked
/// `root` tag when present, else the first `e` tag (legacy positional form).
pub fn root_id(ev: &Event) -> String {
    let refs = ev.event_refs();
    if refs.is_empty() {
        return ev.id.clone();
    }
    refs.iter()
        .find(|(_, role)| *role == Some(EventRole::Root))
        .map(|(id, _)| id.clone())
        .unwrap_or_else(|| refs[0].0.clone())
}

/// Direct parent id for an event: the marked `reply` tag when present, the
/// sole `e` tag when there is exactly one, else the last `e` tag (legacy
/// positional form). `None` means the event is a chain terminus.
pub fn parent_id(ev: &Event) -> Option<String> {
    let refs = ev.event_refs();
    refs.iter()
        .find(|(_, role)| *role == Some(EventRole::Reply))
        .map(|(id, _)| id.clone())
        .or_else(|| refs.last().map(|(id, _)| id.clone()))
}

/// Reconstruct the conversation containing the pointed-at event.
///
/// `NotFound` when the target or its root cannot be fetched; every other
/// partial-data situation degrades to a shorter chain or fallback names.
pub async fn get_thread(
    source: &dyn EventSource,
    pointer: &EventPointer,
    lookup_timeout: Duration,
) -> Result<Thread, BridgeError> {
    let target = source
        .fetch_event(pointer)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("event {pointer:?}")))?;

    let root_id = root_id(&target);
    let root = if root_id == target.id {
        target.clone()
    } else {
        source
            .fetch_event(&EventPointer::Id {
                id: root_id.clone(),
                relays: vec![],
            })
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("thread root {root_id}")))?
    };

    // One broad query pulls the whole candidate set for the thread.
    let candidates = source
        .query_once(&Filter::referencing_event(root_id.clone()))
        .await?;
    let mut lookup: HashMap<String, Event> = HashMap::new();
    lookup.insert(root.id.clone(), root.clone());
    for ev in candidates {
        lookup.entry(ev.id.clone()).or_insert(ev);
    }

    let path = walk_to_root(&target, &root_id, &lookup);

    let mut authors: Vec<String> = vec![];
    for ev in &path {
        if !authors.contains(&ev.pubkey) {
            authors.push(ev.pubkey.clone());
        }
    }
    let profiles = fetch_profiles(source, &authors, lookup_timeout).await;
    let participants = authors
        .into_iter()
        .map(|pk| {
            let name = display_name(&pk, profiles.get(&pk));
            (pk, name)
        })
        .collect();

    Ok(Thread {
        path,
        participants,
        root_id,
    })
}

/// Walk backward from the target, prepending each visited event so the
/// result reads root-first. Stops at the root, at an event with no parent, or
/// at a parent missing from the candidate set (broken chain).
fn walk_to_root(target: &Event, root_id: &str, lookup: &HashMap<String, Event>) -> Vec<Event> {
    let mut path = vec![target.clone()];
    let mut visited: HashSet<String> = HashSet::from([target.id.clone()]);
    let mut current = target.clone();
    while current.id != root_id {
        let Some(parent) = parent_id(&current) else {
            break;
        };
        if !visited.insert(parent.clone()) {
            // Cyclic tags; refuse to loop.
            break;
        }
        let Some(parent_ev) = lookup.get(&parent) else {
            break;
        };
        path.insert(0, parent_ev.clone());
        current = parent_ev.clone();
    }
    path
}

/// Assemble a depth-bounded reply tree under `root_id` from the candidate
/// set of events referencing the root.
pub fn build_reply_tree(root_id: &str, candidates: &[Event], max_depth: usize) -> Vec<ReplyNode> {
    let mut children_of: HashMap<String, Vec<Event>> = HashMap::new();
    for ev in candidates {
        if ev.id == root_id {
            continue;
        }
        if let Some(parent) = parent_id(ev) {
            children_of.entry(parent).or_default().push(ev.clone());
        }
    }
    for list in children_of.values_mut() {
        list.sort_by_key(|e| e.created_at);
    }
    collect_children(root_id, &children_of, max_depth, &mut HashSet::new())
}

fn collect_children(
    id: &str,
    children_of: &HashMap<String, Vec<Event>>,
    depth_left: usize,
    seen: &mut HashSet<String>,
) -> Vec<ReplyNode> {
    if depth_left == 0 {
        return vec![];
    }
    let Some(children) = children_of.get(id) else {
        return vec![];
    };
    let mut nodes = Vec::new();
    for ev in children {
        if seen.insert(ev.id.clone()) {
            let node_children = collect_children(&ev.id, children_of, depth_left - 1, seen);
            nodes.push(ReplyNode {
                event: ev.clone(),
                children: node_children,
            });
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Tag, KIND_NOTE};
    use crate::source::testing::MemorySource;

    fn note(id: &str, pubkey: &str, created: u64, tags: Vec<Tag>) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind: KIND_NOTE,
            created_at: created,
            tags,
            content: format!("content of {id}"),
            sig: String::new(),
        }
    }

    fn id_pointer(id: &str) -> EventPointer {
        EventPointer::Id {
            id: id.into(),
            relays: vec![],
        }
    }

    fn timeout() -> Duration {
        Duration::from_millis(500)
    }

    #[tokio::test]
    async fn event_without_e_tags_is_its_own_root() {
        let root = note("rr00", "p1", 1, vec![]);
        let source = MemorySource::new(vec![root.clone()]);
        let thread = get_thread(&source, &id_pointer("rr00"), timeout())
            .await
            .unwrap();
        assert_eq!(thread.path.len(), 1);
        assert_eq!(thread.path[0].id, "rr00");
        assert_eq!(thread.root_id, "rr00");
        assert_eq!(thread.participants.len(), 1);
    }

    #[tokio::test]
    async fn simple_marked_thread() {
        let root = note("rr00", "p1", 1, vec![]);
        let a = note("aa11", "p2", 2, vec![Tag::event_marked("rr00", "reply")]);
        let b = note("bb22", "p3", 3, vec![Tag::event_marked("rr00", "reply")]);
        let source = MemorySource::new(vec![root, a, b]);
        let ta = get_thread(&source, &id_pointer("aa11"), timeout())
            .await
            .unwrap();
        assert_eq!(
            ta.path.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["rr00", "aa11"]
        );
        let tb = get_thread(&source, &id_pointer("bb22"), timeout())
            .await
            .unwrap();
        assert_eq!(
            tb.path.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["rr00", "bb22"]
        );
    }

    #[tokio::test]
    async fn legacy_positional_chain() {
        // R (no tags); A tags [R]; B tags [R, A] unmarked. Parent of B is the
        // last tag (A), parent of A its single tag (R).
        let root = note("rr00", "p1", 1, vec![]);
        let a = note("aa11", "p2", 2, vec![Tag::event("rr00")]);
        let b = note(
            "bb22",
            "p3",
            3,
            vec![Tag::event("rr00"), Tag::event("aa11")],
        );
        let source = MemorySource::new(vec![root, a, b]);
        let thread = get_thread(&source, &id_pointer("bb22"), timeout())
            .await
            .unwrap();
        assert_eq!(
            thread.path.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["rr00", "aa11", "bb22"]
        );
        assert_eq!(thread.root_id, "rr00");
    }

    #[tokio::test]
    async fn positional_first_tag_is_root() {
        let ev = note(
            "cc33",
            "p1",
            4,
            vec![Tag::event("rr00"), Tag::event("bb22")],
        );
        assert_eq!(root_id(&ev), "rr00");
        assert_eq!(parent_id(&ev).as_deref(), Some("bb22"));
    }

    #[tokio::test]
    async fn marked_root_wins_over_position() {
        let ev = note(
            "cc33",
            "p1",
            4,
            vec![Tag::event("zz99"), Tag::event_marked("rr00", "root")],
        );
        assert_eq!(root_id(&ev), "rr00");
    }

    #[tokio::test]
    async fn broken_chain_returns_longest_prefix() {
        let root = note("rr00", "p1", 1, vec![]);
        // B's parent dd44 was never seen by any queried relay.
        let b = note(
            "bb22",
            "p2",
            3,
            vec![Tag::event_marked("rr00", "root"), Tag::event_marked("dd44", "reply")],
        );
        let source = MemorySource::new(vec![root, b]);
        let thread = get_thread(&source, &id_pointer("bb22"), timeout())
            .await
            .unwrap();
        assert_eq!(
            thread.path.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["bb22"]
        );
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let source = MemorySource::new(vec![]);
        let err = get_thread(&source, &id_pointer("zz99"), timeout())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let orphan = note("aa11", "p1", 2, vec![Tag::event_marked("rr00", "root")]);
        let source = MemorySource::new(vec![orphan]);
        let err = get_thread(&source, &id_pointer("aa11"), timeout())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn cyclic_tags_terminate() {
        let a = note("aa11", "p1", 1, vec![Tag::event_marked("bb22", "reply")]);
        let b = note("bb22", "p2", 2, vec![Tag::event_marked("aa11", "reply")]);
        let source = MemorySource::new(vec![a, b]);
        let thread = get_thread(&source, &id_pointer("aa11"), timeout())
            .await
            .unwrap();
        // Walk visits bb22 then refuses to revisit aa11.
        assert_eq!(thread.path.len(), 2);
    }

    #[tokio::test]
    async fn participants_fall_back_to_short_npub() {
        let pk = "e".repeat(64);
        let root = note("rr00", &pk, 1, vec![]);
        let source = MemorySource::new(vec![root]);
        let thread = get_thread(&source, &id_pointer("rr00"), timeout())
            .await
            .unwrap();
        assert!(thread.participants[&pk].starts_with("npub1"));
    }

    #[test]
    fn reply_tree_is_depth_bounded_and_sorted() {
        let a = note("aa11", "p1", 2, vec![Tag::event("rr00")]);
        let b = note("bb22", "p2", 1, vec![Tag::event("rr00")]);
        let c = note(
            "cc33",
            "p3",
            3,
            vec![Tag::event("rr00"), Tag::event("aa11")],
        );
        let d = note(
            "dd44",
            "p4",
            4,
            vec![Tag::event("rr00"), Tag::event("cc33")],
        );
        let candidates = vec![a, b, c, d];
        let tree = build_reply_tree("rr00", &candidates, 2);
        // Top level sorted by time: bb22 before aa11.
        assert_eq!(tree[0].event.id, "bb22");
        assert_eq!(tree[1].event.id, "aa11");
        // cc33 nests under aa11; dd44 is beyond depth 2.
        assert_eq!(tree[1].children[0].event.id, "cc33");
        assert!(tree[1].children[0].children.is_empty());
    }
}
