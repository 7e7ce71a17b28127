//! Parsers for relay declarations and follow lists.
//!
//! Users declare where they publish in two places: the relay list event
//! (kind 10002, one `r` tag per relay with an optional read/write marker)
//! and, historically, a JSON relay map in the content of their contact
//! list (kind 3). Both are parsed into [`UserRelay`] records; follow
//! lists themselves come from the contact list's `p` tags.

use std::collections::HashMap;

use nostr::{Event, PublicKey};
use serde::Deserialize;

use crate::url::normalize_relay_url;

/// One relay a user has declared, with the direction they use it for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRelay {
    /// Normalized websocket URL.
    pub url: String,
    /// The user reads mentions of themselves here.
    pub inbox: bool,
    /// The user publishes their own events here.
    pub outbox: bool,
}

/// A user's parsed relay list together with the event it came from.
///
/// The event is kept so staleness checks can look at its `created_at`.
#[derive(Debug, Clone, Default)]
pub struct RelayList {
    pub event: Option<Event>,
    pub relays: Vec<UserRelay>,
}

/// A user's parsed follow list together with the event it came from.
#[derive(Debug, Clone, Default)]
pub struct FollowList {
    pub event: Option<Event>,
    pub profiles: Vec<PublicKey>,
}

/// Parse relay declarations from a relay list event's `r` tags.
///
/// A tag with no marker declares both directions; `read` and `write`
/// markers restrict it. Invalid relay URLs are skipped.
pub fn parse_relay_list(event: &Event) -> Vec<UserRelay> {
    let mut result = Vec::with_capacity(event.tags.len());
    for tag in event.tags.iter() {
        let tag = tag.as_slice();
        if tag.len() < 2 || tag[0] != "r" || tag[1].is_empty() {
            continue;
        }
        let Ok(url) = normalize_relay_url(&tag[1]) else {
            continue;
        };

        let mut relay = UserRelay {
            url,
            inbox: false,
            outbox: false,
        };
        match tag.get(2).map(String::as_str) {
            None | Some("") => {
                relay.inbox = true;
                relay.outbox = true;
            }
            Some("write") => relay.outbox = true,
            Some("read") => relay.inbox = true,
            Some(_) => continue,
        }
        result.push(relay);
    }
    result
}

#[derive(Debug, Default, Deserialize)]
struct ContactRelayItem {
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
}

/// Parse the legacy relay map from a contact list event's content.
///
/// The content is a JSON object of `url -> {read, write}`. Unparseable
/// content and invalid URLs yield an empty or shorter list, never
/// placeholder entries.
pub fn parse_contact_relays(event: &Event) -> Vec<UserRelay> {
    let items: HashMap<String, ContactRelayItem> =
        serde_json::from_str(&event.content).unwrap_or_default();

    let mut result = Vec::with_capacity(items.len());
    for (url, item) in items {
        let Ok(url) = normalize_relay_url(&url) else {
            continue;
        };
        result.push(UserRelay {
            url,
            inbox: item.read,
            outbox: item.write,
        });
    }
    result
}

/// Parse followed profiles from a contact list event's `p` tags.
///
/// Malformed keys are skipped; duplicates are kept in first-seen order
/// only once.
pub fn parse_follow_list(event: &Event) -> Vec<PublicKey> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::with_capacity(event.tags.len());
    for tag in event.tags.iter() {
        let tag = tag.as_slice();
        if tag.len() < 2 || tag[0] != "p" {
            continue;
        }
        if let Ok(pk) = PublicKey::from_hex(&tag[1]) {
            if seen.insert(pk) {
                result.push(pk);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag};

    fn relay_list_event(tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    fn contact_list_event(content: &str, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::ContactList, content)
            .tags(tags)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[test]
    fn test_parse_relay_list_markers() {
        let event = relay_list_event(vec![
            Tag::parse(["r", "wss://both.example.com"]).unwrap(),
            Tag::parse(["r", "wss://write.example.com", "write"]).unwrap(),
            Tag::parse(["r", "wss://read.example.com", "read"]).unwrap(),
        ]);

        let relays = parse_relay_list(&event);
        assert_eq!(relays.len(), 3);
        assert_eq!(
            relays[0],
            UserRelay {
                url: "wss://both.example.com".to_string(),
                inbox: true,
                outbox: true
            }
        );
        assert!(relays[1].outbox && !relays[1].inbox);
        assert!(relays[2].inbox && !relays[2].outbox);
    }

    #[test]
    fn test_parse_relay_list_skips_invalid_urls() {
        let event = relay_list_event(vec![
            Tag::parse(["r", "https://not-a-relay.example.com"]).unwrap(),
            Tag::parse(["r", "wss://good.example.com"]).unwrap(),
        ]);

        let relays = parse_relay_list(&event);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].url, "wss://good.example.com");
    }

    #[test]
    fn test_parse_relay_list_normalizes() {
        let event = relay_list_event(vec![
            Tag::parse(["r", "wss://Relay.Example.COM/"]).unwrap(),
        ]);

        let relays = parse_relay_list(&event);
        assert_eq!(relays[0].url, "wss://relay.example.com");
    }

    #[test]
    fn test_parse_relay_list_ignores_unrelated_tags() {
        let event = relay_list_event(vec![
            Tag::parse(["e", "0000000000000000000000000000000000000000000000000000000000000001"])
                .unwrap(),
            Tag::parse(["r", "wss://good.example.com"]).unwrap(),
        ]);

        assert_eq!(parse_relay_list(&event).len(), 1);
    }

    #[test]
    fn test_parse_contact_relays() {
        let content = r#"{
            "wss://one.example.com": {"read": true, "write": true},
            "wss://two.example.com": {"write": true},
            "not-a-url": {"read": true}
        }"#;
        let event = contact_list_event(content, vec![]);

        let mut relays = parse_contact_relays(&event);
        relays.sort_by(|a, b| a.url.cmp(&b.url));

        // only the valid relays come back, no placeholder entries
        assert_eq!(relays.len(), 2);
        assert!(relays.iter().all(|r| !r.url.is_empty()));
        assert_eq!(relays[0].url, "wss://one.example.com");
        assert!(relays[0].inbox && relays[0].outbox);
        assert!(relays[1].outbox && !relays[1].inbox);
    }

    #[test]
    fn test_parse_contact_relays_garbage_content() {
        let event = contact_list_event("definitely not json", vec![]);
        assert!(parse_contact_relays(&event).is_empty());
    }

    #[test]
    fn test_parse_follow_list() {
        let a = Keys::generate().public_key();
        let b = Keys::generate().public_key();
        let event = contact_list_event(
            "",
            vec![
                Tag::parse(["p", &a.to_hex()]).unwrap(),
                Tag::parse(["p", &b.to_hex()]).unwrap(),
                Tag::parse(["p", &a.to_hex()]).unwrap(),
                Tag::parse(["p", "short"]).unwrap(),
            ],
        );

        let profiles = parse_follow_list(&event);
        assert_eq!(profiles, vec![a, b]);
    }
}
