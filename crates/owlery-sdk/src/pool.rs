//! Relay connection pool abstraction.
//!
//! Everything that touches the network goes through [`RelayPool`]:
//! ensure a connection exists, open a filtered subscription, publish an
//! event. The default implementation, [`NostrPool`], adapts a
//! `nostr-sdk` [`Client`] and demultiplexes its notification stream into
//! one channel pair per subscription. Tests substitute scripted pools.

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Buffered events per live subscription.
const SUBSCRIPTION_CHANNEL_SIZE: usize = 64;

/// One relay subscription: a stream of matching events plus a signal
/// that the relay finished replaying stored events.
pub struct Subscription {
    /// Matching events as the relay delivers them.
    pub events: mpsc::Receiver<Event>,
    /// Fires when the relay's end-of-stored-events sentinel arrives.
    pub eose: oneshot::Receiver<()>,
}

/// Whether a subscription should outlive the stored-events replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    /// Close at EOSE; only stored events are wanted.
    #[default]
    StoredOnly,
    /// Stay open past EOSE until the deadline; live events are wanted
    /// (remote signer traffic).
    Live,
}

/// A pool of relay connections.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Make sure a connection to `url` exists (or is being established)
    /// and return the normalized URL the pool knows it by.
    async fn ensure_relay(&self, url: &str) -> Result<String>;

    /// Subscribe to `filter` on a single relay. The subscription lives
    /// until `timeout`, or until EOSE in [`SubscriptionMode::StoredOnly`]
    /// mode.
    async fn subscribe(
        &self,
        url: &str,
        filter: Filter,
        timeout: Duration,
        mode: SubscriptionMode,
    ) -> Result<Subscription>;

    /// Publish `event` to a single relay.
    async fn publish(&self, url: &str, event: Event) -> Result<()>;
}

/// The default [`RelayPool`], backed by a `nostr-sdk` [`Client`].
pub struct NostrPool {
    client: Client,
}

impl NostrPool {
    /// A pool with a fresh client.
    ///
    /// The client gets an ephemeral keypair so relays that require
    /// NIP-42 authentication can be satisfied; that key never signs
    /// user events.
    pub fn new() -> Self {
        let keys = Keys::generate();
        let client = Client::builder().signer(keys).build();
        client.automatic_authentication(true);
        Self { client }
    }

    /// Wrap an existing client (shared connections, custom options).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for NostrPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayPool for NostrPool {
    async fn ensure_relay(&self, url: &str) -> Result<String> {
        let relay_url = RelayUrl::parse(url).map_err(Error::pool)?;

        self.client
            .add_relay(relay_url.clone())
            .await
            .map_err(Error::pool)?;
        self.client
            .connect_relay(relay_url.clone())
            .await
            .map_err(Error::pool)?;

        let mut normalized = relay_url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(normalized)
    }

    async fn subscribe(
        &self,
        url: &str,
        filter: Filter,
        timeout: Duration,
        mode: SubscriptionMode,
    ) -> Result<Subscription> {
        let relay_url = RelayUrl::parse(url).map_err(Error::pool)?;

        // Close the relay-side subscription on our behalf; the forwarding
        // task below enforces the same deadline on our side.
        let exit_policy = match mode {
            SubscriptionMode::StoredOnly => ReqExitPolicy::ExitOnEOSE,
            SubscriptionMode::Live => ReqExitPolicy::WaitDurationAfterEOSE(timeout),
        };
        let auto_close = SubscribeAutoCloseOptions::default()
            .exit_policy(exit_policy)
            .timeout(Some(timeout));

        let output = self
            .client
            .subscribe_to(vec![relay_url.clone()], filter, Some(auto_close))
            .await
            .map_err(Error::pool)?;
        let sub_id = output.val;

        metrics::counter!("pool_subscribes_total").increment(1);

        let mut notifications = self.client.notifications();
        let (event_tx, event_rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        let (eose_tx, eose_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut eose_tx = Some(eose_tx);
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notification =
                    match tokio::time::timeout_at(deadline, notifications.recv()).await {
                        Ok(Ok(notification)) => notification,
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                            tracing::warn!(
                                "notification receiver lagged, skipped {} messages",
                                skipped
                            );
                            continue;
                        }
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                        Err(_) => break,
                    };

                match notification {
                    RelayPoolNotification::Event {
                        relay_url: from,
                        subscription_id,
                        event,
                    } => {
                        if subscription_id == sub_id
                            && from == relay_url
                            && event_tx.send(*event).await.is_err()
                        {
                            // receiver gone, stop forwarding
                            break;
                        }
                    }
                    RelayPoolNotification::Message { message, .. } => {
                        if let RelayMessage::EndOfStoredEvents(sid) = message {
                            if sid.as_ref() == &sub_id {
                                if let Some(tx) = eose_tx.take() {
                                    let _ = tx.send(());
                                }
                                if mode == SubscriptionMode::StoredOnly {
                                    break;
                                }
                            }
                        }
                    }
                    RelayPoolNotification::Shutdown => break,
                }
            }
        });

        Ok(Subscription {
            events: event_rx,
            eose: eose_rx,
        })
    }

    async fn publish(&self, url: &str, event: Event) -> Result<()> {
        let relay_url = RelayUrl::parse(url).map_err(Error::pool)?;
        self.client
            .send_event_to(vec![relay_url], &event)
            .await
            .map_err(Error::pool)?;
        Ok(())
    }
}
