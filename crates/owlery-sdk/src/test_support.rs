//! Test doubles shared by the loader, planner, signer, and facade tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, EventBuilder, Filter, Keys, Kind, Timestamp};
use owlery_core::cache::{MokaTtlCache, TtlCache};
use owlery_core::clock::testing::ManualClock;
use owlery_core::hints::{HintsDatabase, MemoryHintsDb};
use owlery_core::throttle::AttemptRegistry;
use owlery_core::{FollowList, ProfileMetadata, RelayList};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::pool::{RelayPool, Subscription, SubscriptionMode};
use crate::store::EventStore;
use crate::system::{System, SystemBuilder};
use crate::{Error, Result};

/// The pinned "now" every harness clock starts at.
pub(crate) const TEST_NOW: u64 = 1_700_200_000;

/// Build a signed replaceable event with a chosen timestamp.
pub(crate) fn replaceable_event(keys: &Keys, kind: Kind, content: &str, created_at: u64) -> Event {
    EventBuilder::new(kind, content)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// A scripted relay pool: events are stocked per relay URL and every
/// subscription replays the matching ones followed by EOSE.
pub(crate) struct MockPool {
    events_by_relay: Mutex<HashMap<String, Vec<Event>>>,
    subscribe_log: Mutex<Vec<(String, Filter)>>,
    publish_log: Mutex<Vec<(String, Event)>>,
    unreachable: Mutex<Vec<String>>,
}

impl MockPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            events_by_relay: Mutex::new(HashMap::new()),
            subscribe_log: Mutex::new(Vec::new()),
            publish_log: Mutex::new(Vec::new()),
            unreachable: Mutex::new(Vec::new()),
        })
    }

    /// Make `event` available on `relay`.
    pub(crate) fn stock(&self, relay: &str, event: Event) {
        self.events_by_relay
            .lock()
            .entry(relay.to_string())
            .or_default()
            .push(event);
    }

    /// Make `ensure_relay` fail for `relay`.
    pub(crate) fn fail_ensure(&self, relay: &str) {
        self.unreachable.lock().push(relay.to_string());
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribe_log.lock().len()
    }

    pub(crate) fn subscribe_count_for_kind(&self, kind: Kind) -> usize {
        self.subscribe_log
            .lock()
            .iter()
            .filter(|(_, filter)| {
                filter
                    .kinds
                    .as_ref()
                    .is_some_and(|kinds| kinds.contains(&kind))
            })
            .count()
    }

    pub(crate) fn last_subscribed_limit(&self) -> Option<usize> {
        self.subscribe_log.lock().last().and_then(|(_, filter)| filter.limit)
    }

    #[allow(dead_code)]
    pub(crate) fn published(&self) -> Vec<(String, Event)> {
        self.publish_log.lock().clone()
    }

    fn matches(filter: &Filter, event: &Event) -> bool {
        if let Some(kinds) = &filter.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &filter.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl RelayPool for MockPool {
    async fn ensure_relay(&self, url: &str) -> Result<String> {
        if self.unreachable.lock().iter().any(|u| u == url) {
            return Err(Error::Pool(format!("{url} unreachable")));
        }
        Ok(owlery_core::url::normalize_relay_url(url).unwrap_or_else(|_| url.to_string()))
    }

    async fn subscribe(
        &self,
        url: &str,
        filter: Filter,
        _timeout: Duration,
        _mode: SubscriptionMode,
    ) -> Result<Subscription> {
        self.subscribe_log.lock().push((url.to_string(), filter.clone()));

        let stocked = self
            .events_by_relay
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        let (eose_tx, eose_rx) = oneshot::channel();
        for event in stocked {
            if Self::matches(&filter, &event) {
                let _ = tx.try_send(event);
            }
        }
        let _ = eose_tx.send(());
        drop(tx);

        Ok(Subscription {
            events: rx,
            eose: eose_rx,
        })
    }

    async fn publish(&self, url: &str, event: Event) -> Result<()> {
        self.publish_log.lock().push((url.to_string(), event));
        Ok(())
    }
}

/// An in-memory [`EventStore`].
#[derive(Default)]
pub(crate) struct MemStore {
    events: Mutex<Vec<Event>>,
}

impl MemStore {
    pub(crate) fn put(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventStore for MemStore {
    async fn query_sync(&self, filter: Filter) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| MockPool::matches(&filter, event))
            .cloned()
            .collect())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.put(event);
        Ok(())
    }
}

/// A fully assembled system over scripted collaborators with a pinned
/// clock.
pub(crate) struct TestHarness {
    pub(crate) pool: Arc<MockPool>,
    pub(crate) store: Arc<MemStore>,
    pub(crate) clock: Arc<ManualClock>,
    hints: Arc<dyn HintsDatabase>,
    attempts: Arc<AttemptRegistry>,
    relay_list_cache: Arc<dyn TtlCache<RelayList>>,
    follow_list_cache: Arc<dyn TtlCache<FollowList>>,
    metadata_cache: Arc<dyn TtlCache<ProfileMetadata>>,
    pub(crate) relay_list_seed: String,
    pub(crate) extra_relay_list_seed: String,
    pub(crate) follow_seed: String,
    pub(crate) metadata_seed: String,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(ManualClock::at(TEST_NOW));
        Self {
            pool: MockPool::new(),
            store: Arc::new(MemStore::default()),
            hints: Arc::new(MemoryHintsDb::with_clock(clock.clone())),
            attempts: Arc::new(AttemptRegistry::new(
                Duration::from_secs(3600),
                clock.clone(),
            )),
            relay_list_cache: Arc::new(MokaTtlCache::default()),
            follow_list_cache: Arc::new(MokaTtlCache::default()),
            metadata_cache: Arc::new(MokaTtlCache::default()),
            clock,
            relay_list_seed: "wss://rl1.example.com".to_string(),
            extra_relay_list_seed: "wss://rl2.example.com".to_string(),
            follow_seed: "wss://follow.example.com".to_string(),
            metadata_seed: "wss://meta.example.com".to_string(),
        }
    }

    pub(crate) fn system(&self) -> System {
        self.system_with(|builder| builder)
    }

    /// Build a system over this harness's collaborators, with extra
    /// builder tweaks.
    pub(crate) fn system_with(
        &self,
        configure: impl FnOnce(SystemBuilder) -> SystemBuilder,
    ) -> System {
        let builder = System::builder()
            .pool(self.pool.clone())
            .store(self.store.clone())
            .hints(self.hints.clone())
            .attempts(self.attempts.clone())
            .relay_list_cache(self.relay_list_cache.clone())
            .follow_list_cache(self.follow_list_cache.clone())
            .metadata_cache(self.metadata_cache.clone())
            .relay_list_relays(vec![
                self.relay_list_seed.clone(),
                self.extra_relay_list_seed.clone(),
            ])
            .follow_list_relays(vec![self.follow_seed.clone()])
            .metadata_relays(vec![self.metadata_seed.clone()]);
        configure(builder).build()
    }

    pub(crate) fn hints(&self) -> &Arc<dyn HintsDatabase> {
        &self.hints
    }

    /// Prime the relay list cache with a fresh entry so outbox
    /// resolution skips the network and reads hints directly.
    pub(crate) fn seed_fresh_relay_list(&self, pubkey: &str) {
        let event = EventBuilder::new(Kind::RelayList, "")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let list = RelayList {
            event: Some(event),
            relays: Vec::new(),
        };
        self.relay_list_cache
            .set_with_ttl(pubkey, list, Duration::from_secs(3600));
    }
}
