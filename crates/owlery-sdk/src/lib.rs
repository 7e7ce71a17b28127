//! Owlery: a client SDK for the outbox model.
//!
//! In a federated event-publishing network there is no global index;
//! every user writes to their own handful of relays, and a reader has to
//! discover which ones those are before it can read anything. This crate
//! is the discovery and routing plane for such clients:
//!
//! - a hint engine ranks, per user, the relays they have been observed
//!   publishing to (see [`owlery_core::hints`])
//! - batch loaders coalesce concurrent replaceable-event lookups into a
//!   few multi-author subscriptions
//! - an outbox planner expands a multi-author query into one sub-filter
//!   per relay, asking each relay only about the authors it is the best
//!   known home for
//! - the [`System`] facade wires these together with TTL caches, an
//!   optional persistent store, and a signer, behind high-level fetches
//!   for profiles, relay lists, follow lists, and user events
//!
//! ```no_run
//! use owlery_sdk::System;
//!
//! # async fn example() {
//! let system = System::builder().build();
//! let profile = system
//!     .fetch_profile_metadata("aa4fc8665f5696e33db7e1a572e3b0f5b3d615837b0f362dcb1c8068b098c7b4")
//!     .await;
//! println!("{}", profile.short_name());
//! # }
//! ```

mod error;
mod loader;
mod outbox;
pub mod pool;
pub mod signer;
mod store;
mod system;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use pool::{NostrPool, RelayPool, Subscription, SubscriptionMode};
pub use signer::{
    BunkerSigner, BunkerUri, EncryptedKeySigner, EventSigner, KeySigner, SignerOptions,
    build_signer,
};
pub use store::{EventStore, NullStore};
pub use system::{REPLACEABLE_SEED_KINDS, System, SystemBuilder};

// Re-export the parsing plane so embedders need only one dependency.
pub use owlery_core::cache::{MokaTtlCache, TtlCache};
pub use owlery_core::hints::{HintPurpose, HintsDatabase, MemoryHintsDb};
pub use owlery_core::throttle::AttemptRegistry;
pub use owlery_core::{
    FollowList, ProfileMetadata, RelayList, UserRelay, parse_contact_relays, parse_follow_list,
    parse_metadata, parse_relay_list,
};
