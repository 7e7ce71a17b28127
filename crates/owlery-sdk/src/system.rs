//! The system facade.
//!
//! A [`System`] wires the hint engine, the TTL caches, the per-kind
//! batch loaders, and the external collaborators (relay pool, event
//! store, signer) into one handle with high-level fetches. It is cheap
//! to clone and meant to live as a process-wide singleton.
//!
//! Reads go through a consistent hierarchy: TTL cache first, then the
//! persistent store, then batched relay queries. Whatever comes back
//! from the network feeds the hint engine before it is cached, so relay
//! rankings improve as a side effect of ordinary fetches.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use nostr::nips::nip19::{Nip19Event, Nip19Profile};
use nostr::{Event, Filter, Kind, PublicKey, Timestamp};
use owlery_core::cache::{MokaTtlCache, TtlCache};
use owlery_core::hints::{HintPurpose, HintsDatabase, MemoryHintsDb};
use owlery_core::throttle::AttemptRegistry;
use owlery_core::{
    FollowList, ProfileMetadata, RelayList, parse_contact_relays, parse_follow_list,
    parse_metadata, parse_relay_list,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::loader::{BATCH_CAPACITY, BATCH_WAIT, BatchFn, BatchLoader, RELAY_QUERY_TIMEOUT};
use crate::pool::{NostrPool, RelayPool, SubscriptionMode};
use crate::signer::{EventSigner, SignerOptions, build_signer};
use crate::store::{EventStore, NullStore};
use crate::{Error, Result};

pub(crate) const METADATA_KIND: u16 = 0;
pub(crate) const CONTACT_LIST_KIND: u16 = 3;
pub(crate) const RELAY_LIST_KIND: u16 = 10002;

/// Replaceable kinds that get a batch loader: profile metadata, the
/// contact list, and the single-per-user lists.
pub const REPLACEABLE_SEED_KINDS: [u16; 12] = [
    0, 3, 10000, 10001, 10002, 10003, 10004, 10005, 10006, 10007, 10015, 10030,
];

/// How long parsed lists and profiles stay cached.
const LIST_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 6);

/// Buffered events while aggregating a multi-relay user query.
const USER_EVENTS_CHANNEL_SIZE: usize = 256;

pub(crate) struct SystemInner {
    hints: Arc<dyn HintsDatabase>,
    pool: Arc<dyn RelayPool>,
    store: Arc<dyn EventStore>,
    attempts: Arc<AttemptRegistry>,
    relay_list_cache: Arc<dyn TtlCache<RelayList>>,
    follow_list_cache: Arc<dyn TtlCache<FollowList>>,
    metadata_cache: Arc<dyn TtlCache<ProfileMetadata>>,
    relay_list_relays: Vec<String>,
    follow_list_relays: Vec<String>,
    metadata_relays: Vec<String>,
    fallback_relays: Vec<String>,
    multiply_limit_by_authors: bool,
    signer: RwLock<Option<Arc<dyn EventSigner>>>,
    loaders: OnceLock<HashMap<u16, BatchLoader>>,
}

/// The SDK entry point. See the [module docs](self).
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

/// Configures and builds a [`System`].
///
/// ```no_run
/// use owlery_sdk::System;
///
/// let system = System::builder()
///     .relay_list_relays(vec!["wss://purplepag.es".to_string()])
///     .build();
/// ```
pub struct SystemBuilder {
    hints: Option<Arc<dyn HintsDatabase>>,
    pool: Option<Arc<dyn RelayPool>>,
    store: Option<Arc<dyn EventStore>>,
    attempts: Option<Arc<AttemptRegistry>>,
    relay_list_cache: Option<Arc<dyn TtlCache<RelayList>>>,
    follow_list_cache: Option<Arc<dyn TtlCache<FollowList>>>,
    metadata_cache: Option<Arc<dyn TtlCache<ProfileMetadata>>>,
    relay_list_relays: Vec<String>,
    follow_list_relays: Vec<String>,
    metadata_relays: Vec<String>,
    fallback_relays: Vec<String>,
    multiply_limit_by_authors: bool,
}

fn default_bootstrap_relays() -> Vec<String> {
    ["wss://purplepag.es", "wss://user.kindpag.es", "wss://relay.nos.social"]
        .map(String::from)
        .to_vec()
}

fn default_fallback_relays() -> Vec<String> {
    [
        "wss://relay.primal.net",
        "wss://relay.damus.io",
        "wss://nostr.wine",
        "wss://nostr.mom",
        "wss://offchain.pub",
        "wss://nos.lol",
        "wss://mostr.pub",
        "wss://relay.nostr.band",
        "wss://nostr21.com",
    ]
    .map(String::from)
    .to_vec()
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self {
            hints: None,
            pool: None,
            store: None,
            attempts: None,
            relay_list_cache: None,
            follow_list_cache: None,
            metadata_cache: None,
            relay_list_relays: default_bootstrap_relays(),
            follow_list_relays: default_bootstrap_relays(),
            metadata_relays: default_bootstrap_relays(),
            fallback_relays: default_fallback_relays(),
            multiply_limit_by_authors: false,
        }
    }
}

impl SystemBuilder {
    /// Seed relays asked for relay list events.
    pub fn relay_list_relays(mut self, relays: Vec<String>) -> Self {
        self.relay_list_relays = relays;
        self
    }

    /// Seed relays asked for contact list events.
    pub fn follow_list_relays(mut self, relays: Vec<String>) -> Self {
        self.follow_list_relays = relays;
        self
    }

    /// Seed relays asked for profile metadata events.
    pub fn metadata_relays(mut self, relays: Vec<String>) -> Self {
        self.metadata_relays = relays;
        self
    }

    /// Last-resort relays for callers whose outbox resolution came up
    /// empty. The system itself never queries these.
    pub fn fallback_relays(mut self, relays: Vec<String>) -> Self {
        self.fallback_relays = relays;
        self
    }

    /// Replace the relay connection pool.
    pub fn pool(mut self, pool: Arc<dyn RelayPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Attach a persistent event store.
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the hint database.
    pub fn hints(mut self, hints: Arc<dyn HintsDatabase>) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Replace the attempt registry (tests inject a pinned clock here).
    pub fn attempts(mut self, attempts: Arc<AttemptRegistry>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Replace the relay list cache.
    pub fn relay_list_cache(mut self, cache: Arc<dyn TtlCache<RelayList>>) -> Self {
        self.relay_list_cache = Some(cache);
        self
    }

    /// Replace the follow list cache.
    pub fn follow_list_cache(mut self, cache: Arc<dyn TtlCache<FollowList>>) -> Self {
        self.follow_list_cache = Some(cache);
        self
    }

    /// Replace the profile metadata cache.
    pub fn metadata_cache(mut self, cache: Arc<dyn TtlCache<ProfileMetadata>>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    /// Let [`System::fetch_user_events`] multiply each relay filter's
    /// `limit` by the number of authors routed to that relay, as a
    /// best-effort way of getting up to `limit` events per author out
    /// of relays that apply limits per filter. Off by default; when on,
    /// treat limits as advisory.
    pub fn multiply_limit_by_authors(mut self, enabled: bool) -> Self {
        self.multiply_limit_by_authors = enabled;
        self
    }

    pub fn build(self) -> System {
        let inner = Arc::new(SystemInner {
            hints: self.hints.unwrap_or_else(|| Arc::new(MemoryHintsDb::new())),
            pool: self.pool.unwrap_or_else(|| Arc::new(NostrPool::new())),
            store: self.store.unwrap_or_else(|| Arc::new(NullStore)),
            attempts: self
                .attempts
                .unwrap_or_else(|| Arc::new(AttemptRegistry::once_an_hour())),
            relay_list_cache: self
                .relay_list_cache
                .unwrap_or_else(|| Arc::new(MokaTtlCache::default())),
            follow_list_cache: self
                .follow_list_cache
                .unwrap_or_else(|| Arc::new(MokaTtlCache::default())),
            metadata_cache: self
                .metadata_cache
                .unwrap_or_else(|| Arc::new(MokaTtlCache::default())),
            relay_list_relays: self.relay_list_relays,
            follow_list_relays: self.follow_list_relays,
            metadata_relays: self.metadata_relays,
            fallback_relays: self.fallback_relays,
            multiply_limit_by_authors: self.multiply_limit_by_authors,
            signer: RwLock::new(None),
            loaders: OnceLock::new(),
        });

        // the loaders call back into the system; give them a weak handle
        // so a dropped system shuts its dispatchers down
        let mut loaders = HashMap::with_capacity(REPLACEABLE_SEED_KINDS.len());
        for kind in REPLACEABLE_SEED_KINDS {
            let weak = Arc::downgrade(&inner);
            let batch_fn: BatchFn = Arc::new(move |pubkeys: Vec<String>| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            System { inner }
                                .batch_load_replaceable_events(kind, pubkeys)
                                .await
                        }
                        None => pubkeys.iter().map(|_| Err(Error::Canceled)).collect(),
                    }
                }
                .boxed()
            });
            loaders.insert(kind, BatchLoader::new(kind, BATCH_WAIT, BATCH_CAPACITY, batch_fn));
        }
        let _ = inner.loaders.set(loaders);

        System { inner }
    }
}

impl System {
    pub fn builder() -> SystemBuilder {
        SystemBuilder::default()
    }

    /// The hint database rankings are read from and fed into.
    pub fn hints(&self) -> &Arc<dyn HintsDatabase> {
        &self.inner.hints
    }

    /// The relay connection pool.
    pub fn pool(&self) -> &Arc<dyn RelayPool> {
        &self.inner.pool
    }

    /// Last-resort relays configured for this system. The system never
    /// queries these itself; callers use them when outbox resolution
    /// yields nothing.
    pub fn fallback_relays(&self) -> &[String] {
        &self.inner.fallback_relays
    }

    pub(crate) fn attempts(&self) -> &AttemptRegistry {
        &self.inner.attempts
    }

    pub(crate) fn relay_list_cache(&self) -> &Arc<dyn TtlCache<RelayList>> {
        &self.inner.relay_list_cache
    }

    pub(crate) fn relay_list_relays(&self) -> &[String] {
        &self.inner.relay_list_relays
    }

    pub(crate) fn follow_list_relays(&self) -> &[String] {
        &self.inner.follow_list_relays
    }

    pub(crate) fn metadata_relays(&self) -> &[String] {
        &self.inner.metadata_relays
    }

    /// Fetch the newest replaceable event of `kind` for `pubkey`,
    /// batched with concurrent lookups of the same kind.
    pub async fn load_replaceable(&self, kind: u16, pubkey: &str) -> Result<Event> {
        let loaders = self.inner.loaders.get().expect("loaders are set at build");
        let loader = loaders.get(&kind).ok_or_else(|| {
            Error::InvalidInput(format!("kind {kind} has no replaceable loader"))
        })?;
        loader.load(pubkey).await
    }

    /// Configure the signer from an input string (hex or nsec secret
    /// key, ncryptsec encrypted key, bunker token, or NIP-05-style
    /// identifier).
    pub async fn init_signer(&self, input: &str, options: SignerOptions) -> Result<()> {
        let signer = build_signer(self.inner.pool.clone(), input, options).await?;
        *self.inner.signer.write() = Some(signer);
        Ok(())
    }

    /// The configured signer, if any.
    pub fn signer(&self) -> Option<Arc<dyn EventSigner>> {
        self.inner.signer.read().clone()
    }

    /// A user's profile, from cache, store, or their outbox relays.
    /// Missing profiles come back as an empty [`ProfileMetadata`]; in a
    /// federated network that is an ordinary outcome, not an error.
    pub async fn fetch_profile_metadata(&self, pubkey: &str) -> ProfileMetadata {
        self.fetch_profile_metadata_inner(pubkey).await.0
    }

    /// Like [`fetch_profile_metadata`](Self::fetch_profile_metadata),
    /// but also republishes a freshly fetched remote event into the
    /// persistent store.
    pub async fn fetch_or_store_profile_metadata(&self, pubkey: &str) -> ProfileMetadata {
        let (meta, from_internal) = self.fetch_profile_metadata_inner(pubkey).await;
        if !from_internal {
            if let Some(event) = &meta.event {
                if let Err(e) = self.inner.store.publish(event.clone()).await {
                    tracing::debug!("failed to store profile for {}: {}", pubkey, e);
                }
            }
        }
        meta
    }

    /// Returns the profile plus whether it came from cache or store
    /// rather than the network.
    async fn fetch_profile_metadata_inner(&self, pubkey: &str) -> (ProfileMetadata, bool) {
        if let Some(meta) = self.inner.metadata_cache.get(pubkey) {
            return (meta, true);
        }

        if let Some(event) = self.query_store_newest(METADATA_KIND, pubkey).await {
            if let Ok(meta) = parse_metadata(&event) {
                self.inner
                    .metadata_cache
                    .set_with_ttl(pubkey, meta.clone(), LIST_CACHE_TTL);
                return (meta, true);
            }
        }

        match self.load_replaceable(METADATA_KIND, pubkey).await {
            Ok(event) => match parse_metadata(&event) {
                Ok(meta) => {
                    self.inner
                        .metadata_cache
                        .set_with_ttl(pubkey, meta.clone(), LIST_CACHE_TTL);
                    (meta, false)
                }
                Err(e) => {
                    tracing::debug!("unparseable profile for {}: {}", pubkey, e);
                    (ProfileMetadata::with_pubkey(pubkey), false)
                }
            },
            Err(e) => {
                tracing::debug!("no profile for {}: {}", pubkey, e);
                (ProfileMetadata::with_pubkey(pubkey), false)
            }
        }
    }

    /// A user's declared relay list (kind 10002), read through the
    /// cache hierarchy. Fetching a fresh list feeds the hint engine
    /// with one observation per declared write relay.
    pub async fn fetch_relay_list(&self, pubkey: &str) -> RelayList {
        if let Some(list) = self.inner.relay_list_cache.get(pubkey) {
            return list;
        }

        if let Some(event) = self.query_store_newest(RELAY_LIST_KIND, pubkey).await {
            return self.remember_relay_list(pubkey, event);
        }

        match self.load_replaceable(RELAY_LIST_KIND, pubkey).await {
            Ok(event) => self.remember_relay_list(pubkey, event),
            Err(e) => {
                tracing::debug!("no relay list for {}: {}", pubkey, e);
                RelayList::default()
            }
        }
    }

    /// A user's follow list (kind 3 `p` tags), read through the cache
    /// hierarchy. The contact list's legacy relay map feeds the hint
    /// engine.
    pub async fn fetch_follow_list(&self, pubkey: &str) -> FollowList {
        if let Some(list) = self.inner.follow_list_cache.get(pubkey) {
            return list;
        }

        if let Some(event) = self.query_store_newest(CONTACT_LIST_KIND, pubkey).await {
            return self.remember_follow_list(pubkey, event);
        }

        match self.load_replaceable(CONTACT_LIST_KIND, pubkey).await {
            Ok(event) => self.remember_follow_list(pubkey, event),
            Err(e) => {
                tracing::debug!("no follow list for {}: {}", pubkey, e);
                FollowList::default()
            }
        }
    }

    /// Every relay the user has declared, merging the relay list event
    /// with the legacy relay map in their contact list.
    pub async fn fetch_relays(&self, pubkey: &str) -> Vec<owlery_core::UserRelay> {
        let (relay_list, follow_list) =
            tokio::join!(self.fetch_relay_list(pubkey), self.fetch_follow_list(pubkey));

        let mut relays = relay_list.relays;
        if let Some(event) = &follow_list.event {
            for relay in parse_contact_relays(event) {
                if !relays.iter().any(|existing| existing.url == relay.url) {
                    relays.push(relay);
                }
            }
        }
        relays
    }

    /// The subset of [`fetch_relays`](Self::fetch_relays) the user
    /// writes to. For hint-ranked ordering use
    /// [`fetch_outbox_relays`](Self::fetch_outbox_relays) instead.
    pub async fn fetch_write_relays(&self, pubkey: &str) -> Vec<String> {
        self.fetch_relays(pubkey)
            .await
            .into_iter()
            .filter(|relay| relay.outbox)
            .map(|relay| relay.url)
            .collect()
    }

    /// Fetch events for many authors from each author's outbox relays,
    /// grouping queries per relay. Returns events grouped by author.
    ///
    /// When the builder enabled
    /// [`multiply_limit_by_authors`](SystemBuilder::multiply_limit_by_authors),
    /// each relay filter's `limit` is scaled by its author count.
    pub async fn fetch_user_events(&self, filter: Filter) -> Result<HashMap<String, Vec<Event>>> {
        let plan = self.expand_queries_by_author_and_relays(filter).await?;

        let (tx, mut rx) = mpsc::channel::<Event>(USER_EVENTS_CHANNEL_SIZE);
        for (relay_url, mut relay_filter) in plan {
            if self.inner.multiply_limit_by_authors {
                let author_count = relay_filter
                    .authors
                    .as_ref()
                    .map(|authors| authors.len().max(1))
                    .unwrap_or(1);
                relay_filter.limit = relay_filter.limit.map(|limit| limit * author_count);
            }

            let pool = self.inner.pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut sub = match pool
                    .subscribe(
                        &relay_url,
                        relay_filter,
                        RELAY_QUERY_TIMEOUT,
                        SubscriptionMode::StoredOnly,
                    )
                    .await
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        tracing::debug!("user events query to {} failed: {}", relay_url, e);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        biased;
                        maybe = sub.events.recv() => match maybe {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        },
                        _ = &mut sub.eose => return,
                    }
                }
            });
        }
        drop(tx);

        let mut results: HashMap<String, Vec<Event>> = HashMap::new();
        while let Some(event) = rx.recv().await {
            results.entry(event.pubkey.to_hex()).or_default().push(event);
        }
        Ok(results)
    }

    /// Record the relay hints an event carries: where it was seen, and
    /// the per-user relay hints inside its `p` tags.
    ///
    /// Cheap and synchronous; callers streaming events through their own
    /// subscriptions can feed every event through here.
    pub fn track_event_hints(&self, event: &Event, source_relay: Option<&str>) {
        if let Some(relay) = source_relay {
            if let Ok(url) = owlery_core::url::normalize_relay_url(relay) {
                self.inner.hints.save(
                    &event.pubkey.to_hex(),
                    &url,
                    HintPurpose::EventFetched,
                    event.created_at,
                );
            }
        }

        for tag in event.tags.iter() {
            let tag = tag.as_slice();
            if tag.len() < 3 || tag[0] != "p" {
                continue;
            }
            let Ok(pubkey) = PublicKey::from_hex(&tag[1]) else {
                continue;
            };
            let Ok(url) = owlery_core::url::normalize_relay_url(&tag[2]) else {
                continue;
            };
            self.inner
                .hints
                .save(&pubkey.to_hex(), &url, HintPurpose::TagHint, event.created_at);
        }
    }

    /// Record the relay hints carried by an `nprofile` pointer.
    pub fn track_profile_pointer(&self, profile: &Nip19Profile) {
        let pubkey = profile.public_key.to_hex();
        for relay in &profile.relays {
            if let Ok(url) = owlery_core::url::normalize_relay_url(&relay.to_string()) {
                self.inner
                    .hints
                    .save(&pubkey, &url, HintPurpose::ProfilePointer, Timestamp::now());
            }
        }
    }

    /// Record the relay hints carried by an `nevent` pointer, when it
    /// names its author.
    pub fn track_event_pointer(&self, pointer: &Nip19Event) {
        let Some(author) = pointer.author else {
            return;
        };
        let pubkey = author.to_hex();
        for relay in &pointer.relays {
            if let Ok(url) = owlery_core::url::normalize_relay_url(&relay.to_string()) {
                self.inner
                    .hints
                    .save(&pubkey, &url, HintPurpose::EventPointer, Timestamp::now());
            }
        }
    }

    /// Newest stored event of `kind` authored by `pubkey`, if the store
    /// has one.
    async fn query_store_newest(&self, kind: u16, pubkey: &str) -> Option<Event> {
        let author = PublicKey::from_hex(pubkey).ok()?;
        let filter = Filter::new().kind(Kind::from(kind)).author(author);
        match self.inner.store.query_sync(filter).await {
            Ok(events) => events.into_iter().max_by_key(|event| event.created_at),
            Err(e) => {
                tracing::debug!("store query failed for {}: {}", pubkey, e);
                None
            }
        }
    }

    fn remember_relay_list(&self, pubkey: &str, event: Event) -> RelayList {
        let relays = parse_relay_list(&event);
        for relay in &relays {
            if relay.outbox {
                self.inner.hints.save(
                    pubkey,
                    &relay.url,
                    HintPurpose::RelayListDeclared,
                    event.created_at,
                );
            }
        }
        let list = RelayList {
            event: Some(event),
            relays,
        };
        self.inner
            .relay_list_cache
            .set_with_ttl(pubkey, list.clone(), LIST_CACHE_TTL);
        list
    }

    fn remember_follow_list(&self, pubkey: &str, event: Event) -> FollowList {
        for relay in parse_contact_relays(&event) {
            if relay.outbox {
                self.inner.hints.save(
                    pubkey,
                    &relay.url,
                    HintPurpose::ContactListDeclared,
                    event.created_at,
                );
            }
        }
        let list = FollowList {
            profiles: parse_follow_list(&event),
            event: Some(event),
        };
        self.inner
            .follow_list_cache
            .set_with_ttl(pubkey, list.clone(), LIST_CACHE_TTL);
        list
    }
}
