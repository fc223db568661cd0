//! Pure classification of inbound events by kind and tag structure.

use serde::Serialize;

use crate::event::{Event, EventRole, KIND_NOTE, KIND_REACTION, KIND_REPOST};

/// Category assigned to a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mention,
    Reply,
    Reaction,
    Repost,
    Other,
}

/// Delivery priority assigned alongside the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Structural facts about an event plus its derived category.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_reply: bool,
    pub is_reaction: bool,
    pub is_mention: bool,
    pub is_repost: bool,
    /// Marked `root` tag id, when present.
    pub thread_root: Option<String>,
    /// Marked `reply` tag id, else the last `e` tag id under the legacy
    /// positional convention.
    pub reply_to: Option<String>,
    pub category: Category,
    pub priority: Priority,
}

/// Classify an event from `(kind, tags)` alone.
///
/// Category precedence is deliberate: an event that is simultaneously a reply
/// and carries a mention surfaces as a high-priority mention rather than being
/// buried as a generic reply.
pub fn classify(ev: &Event) -> Classification {
    let event_refs = ev.event_refs();
    let is_reaction = ev.kind == KIND_REACTION;
    let is_repost = ev.kind == KIND_REPOST;
    let is_mention = !ev.identity_refs().is_empty();
    let is_reply = ev.kind == KIND_NOTE && !event_refs.is_empty();

    let thread_root = event_refs
        .iter()
        .find(|(_, role)| *role == Some(EventRole::Root))
        .map(|(id, _)| id.clone());
    let reply_to = event_refs
        .iter()
        .find(|(_, role)| *role == Some(EventRole::Reply))
        .map(|(id, _)| id.clone())
        .or_else(|| event_refs.last().map(|(id, _)| id.clone()));

    let (category, priority) = if is_mention && ev.kind == KIND_NOTE {
        (Category::Mention, Priority::High)
    } else if is_reply {
        (Category::Reply, Priority::High)
    } else if is_reaction {
        (Category::Reaction, Priority::Medium)
    } else if is_repost {
        (Category::Repost, Priority::Medium)
    } else {
        (Category::Other, Priority::Low)
    };

    Classification {
        is_reply,
        is_reaction,
        is_mention,
        is_repost,
        thread_root,
        reply_to,
        category,
        priority,
    }
}
