//! Relay URL normalization and validation.
//!
//! Relay URLs are compared by exact string, so every URL that enters the
//! SDK (from relay-list events, kind 3 content, bunker links, or caller
//! configuration) is normalized first to prevent duplicates caused by
//! trailing slashes, case differences, or an explicit default port.
//!
//! # Normalization Rules
//!
//! - Validate websocket scheme (wss:// or ws://)
//! - Lowercase the scheme and host
//! - Drop default ports, preserve explicit non-default ones
//! - Remove trailing slashes

use nostr::RelayUrl;

use crate::{Error, Result};

/// Normalize a relay URL.
///
/// # Examples
///
/// ```
/// use owlery_core::url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").unwrap(),
///     "wss://relay.example.com"
/// );
/// assert!(normalize_relay_url("https://relay.example.com").is_err());
/// ```
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let url = url.trim();

    // Quick check for websocket scheme before handing off to the parser
    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return Err(Error::InvalidRelayUrl {
            url: url.to_string(),
            reason: "URL must start with wss:// or ws://".to_string(),
        });
    }

    let parsed = RelayUrl::parse(url).map_err(|e| Error::InvalidRelayUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    if normalized.is_empty() {
        return Err(Error::InvalidRelayUrl {
            url: url.to_string(),
            reason: "empty host".to_string(),
        });
    }

    Ok(normalized)
}

/// Check whether a string is a usable relay URL.
pub fn is_valid_relay_url(url: &str) -> bool {
    normalize_relay_url(url).is_ok()
}
