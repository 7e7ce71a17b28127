//! Remote signing over the relay network (NIP-46).
//!
//! A bunker holds the user's key on another machine. We talk to it with
//! kind 24133 events: each request is a small JSON-RPC payload encrypted
//! to the bunker's key, published to the relays named in the connection
//! token; responses come back the same way, addressed to our ephemeral
//! client key.
//!
//! Connection tokens are either `bunker://<remote-pubkey>?relay=…&secret=…`
//! or a NIP-05-style identifier whose well-known document names the
//! remote signer key and its relays.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr::nips::nip44::{self, Version};
use nostr::{
    Event, EventBuilder, Filter, JsonUtil, Keys, Kind, PublicKey, Tag, UnsignedEvent,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::pool::{RelayPool, Subscription, SubscriptionMode};
use crate::signer::{EventSigner, SignerOptions};
use crate::{Error, Result};

/// Deadline for one remote signer round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered responses per RPC call.
const RESPONSE_CHANNEL_SIZE: usize = 8;

/// A parsed `bunker://` connection token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    /// The remote signer's own public key (not the user's).
    pub remote_signer: PublicKey,
    /// Relays the remote signer listens on.
    pub relays: Vec<String>,
    /// Shared secret to present in the connect handshake.
    pub secret: Option<String>,
}

impl BunkerUri {
    /// Parse a `bunker://<hex-pubkey>?relay=…&relay=…&secret=…` token.
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix("bunker://")
            .ok_or_else(|| Error::InvalidInput("not a bunker:// token".to_string()))?;
        let (host, query) = rest.split_once('?').unwrap_or((rest, ""));

        let remote_signer = PublicKey::from_hex(host)
            .map_err(|e| Error::InvalidInput(format!("bad remote signer key: {e}")))?;

        let mut relays = Vec::new();
        let mut secret = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "relay" => {
                    if let Ok(url) = owlery_core::url::normalize_relay_url(&percent_decode(value)) {
                        relays.push(url);
                    }
                }
                "secret" => secret = Some(percent_decode(value)),
                _ => {}
            }
        }

        Ok(Self {
            remote_signer,
            relays,
            secret,
        })
    }

    /// Whether `input` parses as a bunker token.
    pub fn is_valid(input: &str) -> bool {
        input.starts_with("bunker://") && Self::parse(input).is_ok()
    }
}

/// Minimal percent decoding for query parameter values. Bunker tokens
/// only ever carry ASCII URLs and secrets.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `input` looks like a `name@domain` (or bare `domain`)
/// identifier resolvable through a well-known document.
pub(crate) fn is_valid_nip05_identifier(input: &str) -> bool {
    let (name, domain) = match input.split_once('@') {
        Some((name, domain)) => (name, domain),
        None => ("_", input),
    };
    if name.is_empty() || domain.is_empty() || !domain.contains('.') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Default, Deserialize)]
struct WellKnownDocument {
    #[serde(default)]
    names: HashMap<String, String>,
    #[serde(default)]
    nip46: HashMap<String, Vec<String>>,
}

/// Resolve a NIP-05-style identifier to a bunker connection token using
/// the `nip46` relay map of the domain's well-known document.
async fn resolve_nip05_bunker(input: &str) -> Result<BunkerUri> {
    let (name, domain) = match input.split_once('@') {
        Some((name, domain)) => (name, domain),
        None => ("_", input),
    };

    let url = format!("https://{domain}/.well-known/nostr.json?name={name}");
    let response = reqwest::get(&url)
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    let doc: WellKnownDocument = response.json().await.map_err(|e| Error::Http(e.to_string()))?;

    let pk_hex = doc
        .names
        .get(name)
        .ok_or_else(|| Error::InvalidInput(format!("'{name}' is not known at {domain}")))?;
    let remote_signer = PublicKey::from_hex(pk_hex)
        .map_err(|e| Error::InvalidInput(format!("bad key in well-known document: {e}")))?;

    let relays = doc
        .nip46
        .get(pk_hex)
        .map(|urls| {
            urls.iter()
                .filter_map(|u| owlery_core::url::normalize_relay_url(u).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(BunkerUri {
        remote_signer,
        relays,
        secret: None,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    id: String,
    method: String,
    params: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcResponse {
    id: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Signs by asking a remote signer over the relay pool.
pub struct BunkerSigner {
    pool: Arc<dyn RelayPool>,
    client_keys: Keys,
    remote_signer: PublicKey,
    relays: Vec<String>,
    auth_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
    user_public_key: Mutex<Option<PublicKey>>,
    next_request_id: AtomicU64,
}

impl BunkerSigner {
    /// Resolve `input`, perform the connect handshake, and return a
    /// ready signer.
    pub async fn connect(
        pool: Arc<dyn RelayPool>,
        input: &str,
        options: SignerOptions,
    ) -> Result<Self> {
        let uri = if input.starts_with("bunker://") {
            BunkerUri::parse(input)?
        } else {
            resolve_nip05_bunker(input).await?
        };
        if uri.relays.is_empty() {
            return Err(Error::InvalidInput(
                "bunker token names no relays".to_string(),
            ));
        }

        let client_keys = match &options.bunker_client_secret_key {
            Some(sk) => Keys::parse(sk)
                .map_err(|e| Error::InvalidInput(format!("bad bunker client key: {e}")))?,
            None => Keys::generate(),
        };

        let signer = Self {
            pool,
            client_keys,
            remote_signer: uri.remote_signer,
            relays: uri.relays,
            auth_handler: options.bunker_auth_handler,
            user_public_key: Mutex::new(None),
            next_request_id: AtomicU64::new(0),
        };

        let ack = signer
            .rpc(
                "connect",
                vec![
                    uri.remote_signer.to_hex(),
                    uri.secret.unwrap_or_default(),
                ],
            )
            .await?;
        if ack != "ack" {
            tracing::debug!("bunker connect answered {:?} instead of ack", ack);
        }

        Ok(signer)
    }

    /// One encrypted request/response round trip.
    async fn rpc(&self, method: &str, params: Vec<String>) -> Result<String> {
        let id = format!(
            "owlery-{}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed)
        );
        let request = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let plaintext = serde_json::to_string(&request).map_err(Error::signer)?;
        let ciphertext = nip44::encrypt(
            self.client_keys.secret_key(),
            &self.remote_signer,
            plaintext,
            Version::V2,
        )
        .map_err(Error::signer)?;

        let event = EventBuilder::new(Kind::NostrConnect, ciphertext)
            .tag(Tag::public_key(self.remote_signer))
            .sign_with_keys(&self.client_keys)
            .map_err(Error::signer)?;

        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .author(self.remote_signer)
            .pubkey(self.client_keys.public_key());

        // Listen before publishing so a fast answer can't slip past us.
        let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_CHANNEL_SIZE);
        for url in &self.relays {
            if let Err(e) = self.pool.ensure_relay(url).await {
                tracing::debug!("bunker relay {} unavailable: {}", url, e);
                continue;
            }
            match self
                .pool
                .subscribe(url, filter.clone(), RPC_TIMEOUT, SubscriptionMode::Live)
                .await
            {
                Ok(sub) => self.spawn_response_listener(sub, tx.clone()),
                Err(e) => {
                    tracing::debug!("bunker subscription on {} failed: {}", url, e);
                    continue;
                }
            }
            if let Err(e) = self.pool.publish(url, event.clone()).await {
                tracing::debug!("publishing bunker request to {} failed: {}", url, e);
            }
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;
        loop {
            let response = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    return Err(Error::Signer(
                        "no usable relay subscription for the remote signer".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(Error::Signer(format!(
                        "remote signer did not answer '{method}' in time"
                    )));
                }
            };

            if response.id != id {
                continue;
            }
            if response.result.as_deref() == Some("auth_url") {
                let auth_url = response.error.unwrap_or_default();
                match &self.auth_handler {
                    Some(handler) => handler(auth_url),
                    None => tracing::warn!("auth_url received but not handled: {}", auth_url),
                }
                continue;
            }
            if let Some(error) = response.error.filter(|e| !e.is_empty()) {
                return Err(Error::Authentication(error));
            }
            return Ok(response.result.unwrap_or_default());
        }
    }

    fn spawn_response_listener(&self, mut sub: Subscription, tx: mpsc::Sender<RpcResponse>) {
        let secret_key = self.client_keys.secret_key().clone();
        let remote_signer = self.remote_signer;
        tokio::spawn(async move {
            // this is a live subscription, so the EOSE signal is
            // irrelevant; read until the pool closes the stream
            while let Some(event) = sub.events.recv().await {
                let plaintext = match nip44::decrypt(&secret_key, &remote_signer, &event.content) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        tracing::debug!("undecryptable bunker payload: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<RpcResponse>(&plaintext) {
                    Ok(response) => {
                        if tx.send(response).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!("unparseable bunker response: {}", e),
                }
            }
        });
    }
}

#[async_trait]
impl EventSigner for BunkerSigner {
    async fn public_key(&self) -> Result<PublicKey> {
        if let Some(pk) = *self.user_public_key.lock() {
            return Ok(pk);
        }
        let result = self.rpc("get_public_key", Vec::new()).await?;
        let pk = PublicKey::from_hex(result.trim())
            .map_err(|e| Error::Signer(format!("remote signer returned a bad key: {e}")))?;
        *self.user_public_key.lock() = Some(pk);
        Ok(pk)
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let result = self.rpc("sign_event", vec![unsigned.as_json()]).await?;
        Event::from_json(&result)
            .map_err(|e| Error::Signer(format!("remote signer returned a bad event: {e}")))
    }
}
