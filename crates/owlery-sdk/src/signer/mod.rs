//! Event signing.
//!
//! A [`System`](crate::System) can sign with three kinds of credentials,
//! all behind the [`EventSigner`] trait:
//!
//! - a plain secret key, given as 64 hex characters or bech32 `nsec`
//! - a passphrase-encrypted secret key (bech32 `ncryptsec`), decrypted
//!   with a password supplied up front or through a callback at sign time
//! - a remote signer ("bunker") reached over the relay pool, given as a
//!   `bunker://` token or a NIP-05-style identifier
//!
//! [`build_signer`] classifies the input string and constructs the right
//! variant.

mod bunker;

pub use bunker::{BunkerSigner, BunkerUri};

use std::sync::Arc;

use async_trait::async_trait;
use nostr::nips::nip19::FromBech32;
use nostr::nips::nip49::EncryptedSecretKey;
use nostr::{Event, Keys, PublicKey, UnsignedEvent};
use parking_lot::Mutex;

use crate::pool::RelayPool;
use crate::{Error, Result};

/// Something that can tell us who the user is and sign events on their
/// behalf.
#[async_trait]
pub trait EventSigner: Send + Sync {
    /// The user's public key.
    async fn public_key(&self) -> Result<PublicKey>;

    /// Sign `unsigned`, producing the finished event.
    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// Options for [`build_signer`].
#[derive(Clone, Default)]
pub struct SignerOptions {
    /// Ephemeral client key for the bunker connection; generated when
    /// absent.
    pub bunker_client_secret_key: Option<String>,
    /// Called with the authorization URL when the remote signer asks the
    /// user to approve the connection.
    pub bunker_auth_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
    /// Password for an `ncryptsec` input, decrypted eagerly.
    pub password: Option<String>,
    /// Password callback for an `ncryptsec` input; when set, decryption
    /// is deferred to each signing operation.
    pub password_handler: Option<Arc<dyn Fn() -> String + Send + Sync>>,
}

/// Classify `input` and build the matching signer.
///
/// Recognized forms, tried in order: `ncryptsec…`, a `bunker://` token or
/// NIP-05 identifier, bech32 `nsec…`, bare 64-hex secret key. Anything
/// else is an invalid-input error.
pub async fn build_signer(
    pool: Arc<dyn RelayPool>,
    input: &str,
    options: SignerOptions,
) -> Result<Arc<dyn EventSigner>> {
    if input.starts_with("ncryptsec") {
        let encrypted = EncryptedSecretKey::from_bech32(input)
            .map_err(|e| Error::InvalidInput(format!("unparseable encrypted key: {e}")))?;

        if let Some(handler) = options.password_handler {
            return Ok(Arc::new(EncryptedKeySigner::new(encrypted, handler)));
        }

        let password = options.password.unwrap_or_default();
        let secret = encrypted.to_secret_key(&password).map_err(|e| {
            if password.is_empty() {
                Error::Authentication(format!("failed to decrypt with blank password: {e}"))
            } else {
                Error::Authentication(format!("failed to decrypt with given password: {e}"))
            }
        })?;
        return Ok(Arc::new(KeySigner::new(Keys::new(secret))));
    }

    if BunkerUri::is_valid(input) || bunker::is_valid_nip05_identifier(input) {
        let signer = BunkerSigner::connect(pool, input, options).await?;
        return Ok(Arc::new(signer));
    }

    // Keys::parse accepts both nsec bech32 and bare hex
    if let Ok(keys) = Keys::parse(input) {
        return Ok(Arc::new(KeySigner::new(keys)));
    }

    Err(Error::InvalidInput(format!("unsupported signer input '{input}'")))
}

/// Signs directly with an in-memory secret key.
pub struct KeySigner {
    keys: Keys,
}

impl KeySigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl EventSigner for KeySigner {
    async fn public_key(&self) -> Result<PublicKey> {
        Ok(self.keys.public_key())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned.sign_with_keys(&self.keys).map_err(Error::signer)
    }
}

/// Holds a passphrase-encrypted secret key and asks for the password on
/// every operation.
///
/// Only the public key is cached after a successful decrypt; the secret
/// itself is rederived each time.
pub struct EncryptedKeySigner {
    encrypted: EncryptedSecretKey,
    password_handler: Arc<dyn Fn() -> String + Send + Sync>,
    cached_public_key: Mutex<Option<PublicKey>>,
}

impl EncryptedKeySigner {
    pub fn new(
        encrypted: EncryptedSecretKey,
        password_handler: Arc<dyn Fn() -> String + Send + Sync>,
    ) -> Self {
        Self {
            encrypted,
            password_handler,
            cached_public_key: Mutex::new(None),
        }
    }

    fn decrypt(&self) -> Result<Keys> {
        let password = (self.password_handler)();
        let encrypted = self.encrypted.clone();
        let secret = encrypted
            .to_secret_key(&password)
            .map_err(|e| Error::Authentication(format!("invalid password: {e}")))?;
        Ok(Keys::new(secret))
    }
}

#[async_trait]
impl EventSigner for EncryptedKeySigner {
    async fn public_key(&self) -> Result<PublicKey> {
        if let Some(pk) = *self.cached_public_key.lock() {
            return Ok(pk);
        }
        let keys = self.decrypt()?;
        let pk = keys.public_key();
        *self.cached_public_key.lock() = Some(pk);
        Ok(pk)
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let keys = self.decrypt()?;
        *self.cached_public_key.lock() = Some(keys.public_key());
        unsigned.sign_with_keys(&keys).map_err(Error::signer)
    }
}
