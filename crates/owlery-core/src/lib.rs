//! Core types for the Owlery outbox SDK.
//!
//! This crate holds the non-suspending plane of the SDK:
//!
//! - [`hints`] - the relay hint scoring engine that ranks, per user, the
//!   relays that user has been observed publishing to
//! - [`cache`] - a bounded TTL cache used for parsed relay lists, follow
//!   lists, and profile metadata
//! - [`throttle`] - a process-wide attempt registry that keeps failed
//!   lookups from being retried in a hot loop
//! - parsers for the replaceable events the SDK cares about: profile
//!   metadata (kind 0) and relay declarations (kinds 10002 and 3)
//!
//! Nothing here performs I/O. Everything that needs the current time goes
//! through the [`clock::Clock`] trait so tests can pin it.

pub mod cache;
pub mod clock;
mod error;
pub mod hints;
mod lists;
mod profile;
pub mod throttle;
pub mod url;

pub use error::{Error, Result};
pub use lists::{
    FollowList, RelayList, UserRelay, parse_contact_relays, parse_follow_list, parse_relay_list,
};
pub use profile::{ProfileMetadata, parse_metadata};
