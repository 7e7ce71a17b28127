//! Profile metadata (kind 0) parsing.

use nostr::{Event, Kind, PublicKey, ToBech32};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How much of a malformed content payload to echo in parse errors.
const ERROR_SNIPPET_LEN: usize = 99;

/// A user's profile, parsed from the content of their kind 0 event.
///
/// `pubkey` is always set; every other field may be empty, and `event`
/// is absent when no metadata event was found anywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(skip)]
    pub pubkey: String,
    #[serde(skip)]
    pub event: Option<Event>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub about: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub website: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub picture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nip05: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lud16: String,
}

impl ProfileMetadata {
    /// An empty profile for a user we know nothing about.
    pub fn with_pubkey(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            ..Default::default()
        }
    }

    /// The user's public key in bech32 form; falls back to hex when the
    /// stored key is malformed.
    pub fn npub(&self) -> String {
        PublicKey::from_hex(&self.pubkey)
            .ok()
            .and_then(|pk| pk.to_bech32().ok())
            .unwrap_or_else(|| self.pubkey.clone())
    }

    /// Best display string: name, then display name, then an abbreviated
    /// npub.
    pub fn short_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        let npub = self.npub();
        if npub.len() >= 63 {
            format!("{}…{}", &npub[..7], &npub[58..])
        } else {
            npub
        }
    }
}

/// Parse a kind 0 event's content into a [`ProfileMetadata`].
pub fn parse_metadata(event: &Event) -> Result<ProfileMetadata> {
    if event.kind != Kind::Metadata {
        return Err(Error::WrongKind {
            id: event.id.to_hex(),
            actual: event.kind.as_u16(),
            expected: 0,
        });
    }

    match serde_json::from_str::<ProfileMetadata>(&event.content) {
        Ok(mut meta) => {
            meta.pubkey = event.pubkey.to_hex();
            meta.event = Some(event.clone());
            Ok(meta)
        }
        Err(e) => {
            let snippet: String = event.content.chars().take(ERROR_SNIPPET_LEN).collect();
            Err(Error::MalformedMetadata {
                id: event.id.to_hex(),
                snippet,
                reason: e.to_string(),
            })
        }
    }
}
