//! Recursive rewriting of inline `nostr:` references inside event content.
//!
//! Identity pointers become `@name` mentions; event pointers become embedded
//! quote blocks whose content is itself resolved one level deeper, up to a
//! hard depth ceiling that guarantees termination on reference cycles. Every
//! network lookup is individually timeout-bounded; failures degrade to the
//! verbatim marker plus a diagnostic note, never to an error.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::codec::{self, Decoded};
use crate::event::Event;
use crate::profile::{self, display_name, format_timestamp, ProfileMeta};
use crate::source::EventSource;

/// Tuning for a resolution pass.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Depth at which embedded content is returned unrewritten.
    pub max_depth: usize,
    /// Bound applied to each individual profile/event lookup.
    pub lookup_timeout: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            lookup_timeout: Duration::from_secs(10),
        }
    }
}

/// Explicit memoization state threaded through one resolution call tree.
///
/// Passed as a parameter rather than captured ambiently so recursion depth
/// and caching stay visible at every call site.
#[derive(Default)]
pub struct ResolveCtx {
    /// Resolved display names keyed by pubkey.
    names: HashMap<String, String>,
    /// Soft errors accumulated across the whole call tree.
    errors: Vec<String>,
}

/// Resolve all inline references in `text`.
///
/// Pure with respect to the input modulo network state; malformed or
/// unresolvable markers are left verbatim. If any soft error occurred, a
/// delimited diagnostic block is appended at the outermost level only.
pub async fn resolve_content(
    source: &dyn EventSource,
    text: &str,
    opts: ResolveOptions,
) -> String {
    let mut ctx = ResolveCtx::default();
    let resolved = resolve_at(source, text.to_string(), 0, opts, &mut ctx).await;
    if ctx.errors.is_empty() {
        return resolved;
    }
    let mut out = resolved;
    out.push_str("\n\n--- resolution notes ---\n");
    for err in &ctx.errors {
        out.push_str(&format!("- {err}\n"));
    }
    out
}

/// Resolve one level; boxed because the future recurses through embeds.
fn resolve_at<'a>(
    source: &'a dyn EventSource,
    text: String,
    depth: usize,
    opts: ResolveOptions,
    ctx: &'a mut ResolveCtx,
) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
    Box::pin(async move {
        if depth >= opts.max_depth {
            return text;
        }
        let mut out = text.clone();
        for marker in scan_markers(&text) {
            let token = &marker["nostr:".len()..];
            let replacement = match codec::decode(token) {
                Ok(Decoded::Pubkey(pubkey)) | Ok(Decoded::Profile { pubkey, .. }) => {
                    resolve_identity(source, &pubkey, opts, ctx).await
                }
                Ok(_) => resolve_embed(source, &marker, token, depth, opts, ctx).await,
                Err(_) => {
                    ctx.errors.push(format!("unparseable reference {marker}"));
                    None
                }
            };
            if let Some(replacement) = replacement {
                out = out.replace(&marker, &replacement);
            }
        }
        out
    })
}

/// Resolve an identity marker to `@name`, memoizing per pubkey.
async fn resolve_identity(
    source: &dyn EventSource,
    pubkey: &str,
    opts: ResolveOptions,
    ctx: &mut ResolveCtx,
) -> Option<String> {
    let name = author_name(source, pubkey, opts, ctx).await;
    Some(format!("@{name}"))
}

/// Resolve an event marker into an embedded quote block, or record a soft
/// error and leave the marker untouched.
async fn resolve_embed(
    source: &dyn EventSource,
    marker: &str,
    token: &str,
    depth: usize,
    opts: ResolveOptions,
    ctx: &mut ResolveCtx,
) -> Option<String> {
    let pointer = codec::parse_event_pointer(token).ok()?;
    let fetched = tokio::time::timeout(opts.lookup_timeout, source.fetch_event(&pointer)).await;
    let event = match fetched {
        Ok(Ok(Some(ev))) => ev,
        Ok(Ok(None)) => {
            ctx.errors.push(format!("referenced event not found: {marker}"));
            return None;
        }
        Ok(Err(e)) => {
            ctx.errors.push(format!("lookup failed for {marker}: {e}"));
            return None;
        }
        Err(_) => {
            ctx.errors.push(format!("timed out fetching {marker}"));
            return None;
        }
    };
    let name = author_name(source, &event.pubkey, opts, ctx).await;
    let inner = resolve_at(source, event.content.clone(), depth + 1, opts, ctx).await;
    Some(render_embed(&name, &event, &inner))
}

/// Resolve and memoize an author's display name; lookup failures fall back to
/// the truncated npub without recording an error.
async fn author_name(
    source: &dyn EventSource,
    pubkey: &str,
    opts: ResolveOptions,
    ctx: &mut ResolveCtx,
) -> String {
    if let Some(name) = ctx.names.get(pubkey) {
        return name.clone();
    }
    let meta: Option<ProfileMeta> =
        profile::fetch_profile(source, pubkey, opts.lookup_timeout).await;
    let name = display_name(pubkey, meta.as_ref());
    ctx.names.insert(pubkey.to_string(), name.clone());
    name
}

fn render_embed(name: &str, event: &Event, inner: &str) -> String {
    let mut block = format!("┌ @{name} · {}\n", format_timestamp(event.created_at));
    for line in inner.lines() {
        block.push_str(&format!("│ {line}\n"));
    }
    block.push('└');
    block
}

/// Distinct `nostr:` markers in order of first appearance.
fn scan_markers(text: &str) -> Vec<String> {
    let mut markers = vec![];
    let mut rest = text;
    while let Some(pos) = rest.find("nostr:") {
        let tail = &rest[pos + "nostr:".len()..];
        let token: String = tail
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        rest = &tail[token.len()..];
        if token.len() < 8 {
            continue;
        }
        let marker = format!("nostr:{token}");
        if !markers.contains(&marker) {
            markers.push(marker);
        }
    }
    markers
}
