//! Relay hint tracking.
//!
//! Every time the SDK sees evidence that a user publishes to a relay (a
//! declared relay list, a relay hint inside a tag, an event actually
//! fetched from somewhere) it records a hint: who, where, why, and when.
//! The hint database turns that stream of observations into a per-user
//! ranking of relays, which is what outbox routing runs on.
//!
//! The default database is the in-memory [`MemoryHintsDb`]; alternative
//! backends implement [`HintsDatabase`].

mod memory;

pub use memory::MemoryHintsDb;

use nostr::Timestamp;

/// Number of hint purposes. Each relay entry carries one timestamp slot
/// per purpose.
pub const PURPOSE_COUNT: usize = 8;

/// The reason a relay became associated with a user.
///
/// Each purpose carries a base weight reflecting how strong that kind of
/// evidence is. A relay the user explicitly declared in their relay list
/// is worth far more than a relay that merely appeared in a tag hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintPurpose {
    /// An event by the user was actually fetched from this relay.
    EventFetched,
    /// The relay appeared in an event pointer (nevent) for the user.
    EventPointer,
    /// The relay appeared in a profile pointer (nprofile) for the user.
    ProfilePointer,
    /// The relay appeared as a hint inside a tag referencing the user.
    TagHint,
    /// The relay is listed in the user's NIP-05 well-known document.
    Nip05Document,
    /// The user declared the relay as a write relay in their relay list.
    RelayListDeclared,
    /// The relay appeared in the user's contact-list relay map.
    ContactListDeclared,
    /// We tried fetching from this relay for the user.
    FetchAttempt,
}

impl HintPurpose {
    /// All purposes, in slot order.
    pub const ALL: [HintPurpose; PURPOSE_COUNT] = [
        HintPurpose::EventFetched,
        HintPurpose::EventPointer,
        HintPurpose::ProfilePointer,
        HintPurpose::TagHint,
        HintPurpose::Nip05Document,
        HintPurpose::RelayListDeclared,
        HintPurpose::ContactListDeclared,
        HintPurpose::FetchAttempt,
    ];

    /// Timestamp slot index for this purpose.
    pub const fn index(self) -> usize {
        match self {
            HintPurpose::EventFetched => 0,
            HintPurpose::EventPointer => 1,
            HintPurpose::ProfilePointer => 2,
            HintPurpose::TagHint => 3,
            HintPurpose::Nip05Document => 4,
            HintPurpose::RelayListDeclared => 5,
            HintPurpose::ContactListDeclared => 6,
            HintPurpose::FetchAttempt => 7,
        }
    }

    /// How much evidence of this kind is worth.
    pub const fn base_points(self) -> i64 {
        match self {
            HintPurpose::EventFetched => 20,
            HintPurpose::EventPointer => 3,
            HintPurpose::ProfilePointer => 10,
            HintPurpose::TagHint => 5,
            HintPurpose::Nip05Document => 35,
            HintPurpose::RelayListDeclared => 40,
            HintPurpose::ContactListDeclared => 15,
            HintPurpose::FetchAttempt => 1,
        }
    }

    /// Purpose for a given slot index, if in range.
    pub fn from_index(index: usize) -> Option<HintPurpose> {
        Self::ALL.get(index).copied()
    }
}

/// A store of relay hints, ranked per user.
///
/// Implementations must serialize writes per user: a `top_n` running
/// concurrently with a `save` sees either the pre-state or the
/// post-state, never a half-applied reordering.
pub trait HintsDatabase: Send + Sync {
    /// Record that `pubkey` was seen using `relay_url` for `purpose` at
    /// `ts`. Saves with a timestamp at or below the stored one for the
    /// same triple are no-ops.
    fn save(&self, pubkey: &str, relay_url: &str, purpose: HintPurpose, ts: Timestamp);

    /// Up to `n` relay URLs for `pubkey`, best first. Empty when the user
    /// has never been observed.
    fn top_n(&self, pubkey: &str, n: usize) -> Vec<String>;

    /// Dump every user's relay scores through `tracing`, for diagnostics.
    fn print_scores(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_indices_are_dense() {
        for (i, purpose) in HintPurpose::ALL.iter().enumerate() {
            assert_eq!(purpose.index(), i);
            assert_eq!(HintPurpose::from_index(i), Some(*purpose));
        }
        assert_eq!(HintPurpose::from_index(PURPOSE_COUNT), None);
    }

    #[test]
    fn test_base_points_are_positive() {
        for purpose in HintPurpose::ALL {
            assert!(purpose.base_points() > 0);
        }
    }

    #[test]
    fn test_declared_relay_list_outweighs_incidental_hints() {
        assert!(
            HintPurpose::RelayListDeclared.base_points() > HintPurpose::TagHint.base_points()
        );
        assert!(
            HintPurpose::RelayListDeclared.base_points() > HintPurpose::EventPointer.base_points()
        );
    }
}
