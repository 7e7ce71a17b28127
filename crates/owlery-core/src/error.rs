//! Error types for the Owlery core crate.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing events and relay URLs.
///
/// Every variant carries owned strings so results that embed an error can
/// be cloned to multiple waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A relay URL failed validation or normalization.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl {
        /// The URL as given by the caller.
        url: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// An event had a different kind than the parser expected.
    #[error("event {id} is kind {actual}, not {expected}")]
    WrongKind {
        /// Hex id of the offending event.
        id: String,
        /// The kind the event actually carries.
        actual: u16,
        /// The kind the parser was asked to handle.
        expected: u16,
    },

    /// A kind 0 content payload was not valid profile JSON.
    #[error("failed to parse metadata ({snippet}) from event {id}: {reason}")]
    MalformedMetadata {
        /// Hex id of the offending event.
        id: String,
        /// Leading slice of the content, for log context.
        snippet: String,
        /// The underlying JSON error, stringified.
        reason: String,
    },

    /// A public key was not 64 hex characters.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_relay_url_display() {
        let err = Error::InvalidRelayUrl {
            url: "http://nope".to_string(),
            reason: "scheme must be ws or wss".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("http://nope"));
        assert!(msg.contains("scheme must be ws or wss"));
    }

    #[test]
    fn test_wrong_kind_display() {
        let err = Error::WrongKind {
            id: "abc123".to_string(),
            actual: 1,
            expected: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("kind 1"));
        assert!(msg.contains("not 0"));
    }

    #[test]
    fn test_malformed_metadata_display() {
        let err = Error::MalformedMetadata {
            id: "def456".to_string(),
            snippet: "{broken".to_string(),
            reason: "EOF while parsing".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("{broken"));
        assert!(msg.contains("def456"));
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = Error::InvalidPublicKey("abcd".to_string());
        assert_eq!(err.clone(), err);
    }
}
