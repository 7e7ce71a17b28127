//! Error types for the Owlery SDK.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the SDK.
///
/// Variants carry owned strings rather than source errors because a
/// single batch result may be handed to many coalesced callers, so the
/// whole enum has to be cloneable.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A lookup was attempted with a key that is not 64 hex characters.
    #[error("won't query relays with a shortened key (kind {kind})")]
    ShortenedKey {
        /// The kind the lookup was for.
        kind: u16,
    },

    /// A lookup for the same key failed recently; try again later.
    #[error("last attempt failed, waiting more to try again")]
    TriedRecently,

    /// No event was found in any queried relay before the deadline.
    #[error("couldn't find a kind {kind} event anywhere {relays:?}")]
    NotFound {
        /// The kind the lookup was for.
        kind: u16,
        /// The relays that were asked.
        relays: Vec<String>,
    },

    /// The caller handed us something unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Wrong password, rejected bunker handshake, or similar.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The relay pool refused or failed an operation.
    #[error("relay pool: {0}")]
    Pool(String),

    /// The persistent event store failed.
    #[error("event store: {0}")]
    Store(String),

    /// A signer could not produce a key or a signature.
    #[error("signer: {0}")]
    Signer(String),

    /// An HTTP fetch (NIP-05 resolution) failed.
    #[error("http: {0}")]
    Http(String),

    /// The surrounding operation was canceled or timed out.
    #[error("operation canceled")]
    Canceled,

    /// An error from the parsing plane.
    #[error(transparent)]
    Core(#[from] owlery_core::Error),
}

impl Error {
    pub(crate) fn pool(e: impl std::fmt::Display) -> Self {
        Self::Pool(e.to_string())
    }

    pub(crate) fn signer(e: impl std::fmt::Display) -> Self {
        Self::Signer(e.to_string())
    }
}
