//! NIP-19 identifier codec and NIP-05 handle resolution.
//!
//! Translates between raw hex identifiers and the human-shareable bech32
//! forms (`npub`, `nprofile`, `note`, `nevent`, `naddr`). The composite forms
//! carry TLV payloads: type 0 is the 32-byte special field (or the `d`
//! identifier for `naddr`), type 1 a relay hint, type 2 the author key, and
//! type 3 a big-endian u32 kind.

use anyhow::Context;
use bech32::{Bech32, Hrp};
use serde_json::Value;

use crate::error::BridgeError;

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// A decoded NIP-19 entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// `npub`: bare public key.
    Pubkey(String),
    /// `nprofile`: public key plus relay hints.
    Profile { pubkey: String, relays: Vec<String> },
    /// `note`: bare event ID.
    EventId(String),
    /// `nevent`: event ID plus optional relay/author/kind hints.
    Event {
        id: String,
        relays: Vec<String>,
        author: Option<String>,
        kind: Option<u32>,
    },
    /// `naddr`: replaceable-event coordinate.
    Address {
        identifier: String,
        pubkey: String,
        kind: u32,
        relays: Vec<String>,
    },
}

/// Pointer to a concrete event, resolved from any accepted textual form.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPointer {
    /// Addressed by content hash.
    Id { id: String, relays: Vec<String> },
    /// Addressed by replaceable coordinate `(kind, pubkey, d)`.
    Address {
        kind: u32,
        pubkey: String,
        identifier: String,
        relays: Vec<String>,
    },
}

/// Whether `s` looks like a raw 32-byte hex identifier.
pub fn is_hex_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Encode a hex public key as `npub`.
pub fn encode_npub(pubkey: &str) -> Result<String, BridgeError> {
    encode_simple("npub", pubkey)
}

/// Encode a hex event ID as `note`.
pub fn encode_note(id: &str) -> Result<String, BridgeError> {
    encode_simple("note", id)
}

/// Encode an event ID with relay hints as `nevent`.
pub fn encode_nevent(id: &str, relays: &[String]) -> Result<String, BridgeError> {
    let mut payload = tlv(TLV_SPECIAL, &hex_bytes(id)?);
    for relay in relays {
        payload.extend(tlv(TLV_RELAY, relay.as_bytes()));
    }
    encode_payload("nevent", &payload)
}

fn encode_simple(hrp: &str, hex: &str) -> Result<String, BridgeError> {
    encode_payload(hrp, &hex_bytes(hex)?)
}

fn encode_payload(hrp: &str, payload: &[u8]) -> Result<String, BridgeError> {
    let hrp = Hrp::parse(hrp)
        .map_err(|e| BridgeError::InvalidInput(format!("bad prefix: {e}")))?;
    bech32::encode::<Bech32>(hrp, payload)
        .map_err(|e| BridgeError::InvalidInput(format!("bech32 encode: {e}")))
}

fn hex_bytes(hex: &str) -> Result<Vec<u8>, BridgeError> {
    if !is_hex_id(hex) {
        return Err(BridgeError::InvalidInput(format!(
            "expected 64-char hex identifier, got {hex:?}"
        )));
    }
    hex::decode(hex).map_err(|e| BridgeError::InvalidInput(format!("hex: {e}")))
}

fn tlv(kind: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![kind, value.len() as u8];
    out.extend_from_slice(value);
    out
}

/// Parsed TLV fields shared by the composite forms.
#[derive(Default)]
struct TlvFields {
    special: Option<Vec<u8>>,
    relays: Vec<String>,
    author: Option<String>,
    kind: Option<u32>,
}

fn parse_tlv(data: &[u8]) -> Result<TlvFields, BridgeError> {
    let mut fields = TlvFields::default();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(BridgeError::InvalidInput("truncated TLV".into()));
        }
        let (kind, len) = (rest[0], rest[1] as usize);
        rest = &rest[2..];
        if rest.len() < len {
            return Err(BridgeError::InvalidInput("truncated TLV value".into()));
        }
        let value = &rest[..len];
        rest = &rest[len..];
        match kind {
            TLV_SPECIAL => {
                if fields.special.is_none() {
                    fields.special = Some(value.to_vec());
                }
            }
            TLV_RELAY => {
                fields
                    .relays
                    .push(String::from_utf8_lossy(value).into_owned());
            }
            TLV_AUTHOR => fields.author = Some(hex::encode(value)),
            TLV_KIND => {
                if value.len() == 4 {
                    fields.kind =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
            }
            // Unknown TLV types are skipped, per NIP-19.
            _ => {}
        }
    }
    Ok(fields)
}

/// Decode any supported NIP-19 string.
pub fn decode(text: &str) -> Result<Decoded, BridgeError> {
    let (hrp, data) = bech32::decode(text)
        .map_err(|e| BridgeError::InvalidInput(format!("bech32 decode {text:?}: {e}")))?;
    match hrp.as_str() {
        "npub" => Ok(Decoded::Pubkey(expect_32(&data)?)),
        "note" => Ok(Decoded::EventId(expect_32(&data)?)),
        "nprofile" => {
            let fields = parse_tlv(&data)?;
            let special = fields
                .special
                .ok_or_else(|| BridgeError::InvalidInput("nprofile missing key".into()))?;
            Ok(Decoded::Profile {
                pubkey: expect_32(&special)?,
                relays: fields.relays,
            })
        }
        "nevent" => {
            let fields = parse_tlv(&data)?;
            let special = fields
                .special
                .ok_or_else(|| BridgeError::InvalidInput("nevent missing id".into()))?;
            Ok(Decoded::Event {
                id: expect_32(&special)?,
                relays: fields.relays,
                author: fields.author,
                kind: fields.kind,
            })
        }
        "naddr" => {
            let fields = parse_tlv(&data)?;
            let identifier = fields
                .special
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .ok_or_else(|| BridgeError::InvalidInput("naddr missing identifier".into()))?;
            let pubkey = fields
                .author
                .ok_or_else(|| BridgeError::InvalidInput("naddr missing author".into()))?;
            let kind = fields
                .kind
                .ok_or_else(|| BridgeError::InvalidInput("naddr missing kind".into()))?;
            Ok(Decoded::Address {
                identifier,
                pubkey,
                kind,
                relays: fields.relays,
            })
        }
        other => Err(BridgeError::InvalidInput(format!(
            "unsupported identifier prefix {other:?}"
        ))),
    }
}

fn expect_32(data: &[u8]) -> Result<String, BridgeError> {
    if data.len() != 32 {
        return Err(BridgeError::InvalidInput(format!(
            "expected 32-byte payload, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

/// Parse a textual event pointer: raw hex, `note`, `nevent`, or `naddr`.
pub fn parse_event_pointer(text: &str) -> Result<EventPointer, BridgeError> {
    let text = text.trim().strip_prefix("nostr:").unwrap_or(text.trim());
    if is_hex_id(text) {
        return Ok(EventPointer::Id {
            id: text.to_lowercase(),
            relays: vec![],
        });
    }
    match decode(text)? {
        Decoded::EventId(id) => Ok(EventPointer::Id { id, relays: vec![] }),
        Decoded::Event { id, relays, .. } => Ok(EventPointer::Id { id, relays }),
        Decoded::Address {
            identifier,
            pubkey,
            kind,
            relays,
        } => Ok(EventPointer::Address {
            kind,
            pubkey,
            identifier,
            relays,
        }),
        Decoded::Pubkey(_) | Decoded::Profile { .. } => Err(BridgeError::InvalidInput(format!(
            "{text:?} names an identity, not an event"
        ))),
    }
}

/// Parse a textual identity: raw hex, `npub`, or `nprofile`.
pub fn parse_identity(text: &str) -> Result<String, BridgeError> {
    let text = text.trim().strip_prefix("nostr:").unwrap_or(text.trim());
    if is_hex_id(text) {
        return Ok(text.to_lowercase());
    }
    match decode(text)? {
        Decoded::Pubkey(key) => Ok(key),
        Decoded::Profile { pubkey, .. } => Ok(pubkey),
        _ => Err(BridgeError::InvalidInput(format!(
            "{text:?} names an event, not an identity"
        ))),
    }
}

/// Truncated npub used as the last-resort display name for an identity.
pub fn short_identity(pubkey: &str) -> String {
    match encode_npub(pubkey) {
        Ok(npub) => format!("{}…", &npub[..12.min(npub.len())]),
        Err(_) => format!("{}…", &pubkey[..8.min(pubkey.len())]),
    }
}

/// Resolve a NIP-05 handle (`name@domain`, or bare `domain` for `_`) against
/// its domain's well-known document.
pub async fn resolve_handle(handle: &str) -> Result<String, BridgeError> {
    let (name, domain) = handle.split_once('@').unwrap_or(("_", handle));
    if domain.is_empty() || name.is_empty() {
        return Err(BridgeError::InvalidInput(format!("bad handle {handle:?}")));
    }
    resolve_handle_at(&format!("https://{domain}"), name).await
}

/// Handle resolution against an explicit base URL; split out so tests can
/// point it at a local server.
pub async fn resolve_handle_at(base: &str, name: &str) -> Result<String, BridgeError> {
    let url = format!("{base}/.well-known/nostr.json?name={name}");
    let body: Value = reqwest::get(&url)
        .await
        .with_context(|| format!("fetching {url}"))?
        .json()
        .await
        .context("parsing nostr.json")?;
    body.get("names")
        .and_then(|names| names.get(name))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| BridgeError::NotFound(format!("handle {name} not present")))
}
