//! Batched replaceable-event loading.
//!
//! Reading one profile means asking several relays for one tiny event;
//! reading a timeline means doing that for hundreds of users at once.
//! The loader coalesces concurrent single-key lookups of the same kind
//! into a handful of multi-author subscriptions: requests queue for a
//! short window (or until the batch is full), then one combined filter
//! per relay goes out and each caller gets its own slot of the result.
//!
//! Because these are replaceable events, a relay returns at most one
//! event per author, so a subscription can end as soon as it has
//! delivered as many events as it was asked authors, without waiting
//! for EOSE.
//!
//! There is no memoization across batches; every fresh `load` schedules
//! fresh work. The attempt registry is what keeps missing users from
//! being retried in a loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use nostr::{Event, Filter, Kind, PublicKey};
use owlery_core::hints::HintPurpose;
use tokio::sync::{mpsc, oneshot};

use crate::pool::{RelayPool, SubscriptionMode};
use crate::system::{CONTACT_LIST_KIND, METADATA_KIND, RELAY_LIST_KIND, System};
use crate::{Error, Result};

/// How long a batch keeps accumulating keys before flushing.
pub(crate) const BATCH_WAIT: Duration = Duration::from_millis(400);

/// Maximum keys per batch; reaching it flushes immediately.
pub(crate) const BATCH_CAPACITY: usize = 400;

/// Hard deadline for a single relay subscription.
pub(crate) const RELAY_QUERY_TIMEOUT: Duration = Duration::from_secs(4);

/// Buffered events on the batch fan-in channel.
const BATCH_CHANNEL_SIZE: usize = 64;

/// Outbox relays consulted per author on a lookup.
const RELAYS_PER_AUTHOR: usize = 3;

pub(crate) type BatchFn =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Vec<Result<Event>>> + Send + Sync>;

struct LoadRequest {
    pubkey: String,
    reply: oneshot::Sender<Result<Event>>,
}

/// A per-kind batching coalescer.
///
/// The dispatcher task is started lazily on the first `load` so the
/// owning system can be built outside a runtime.
pub(crate) struct BatchLoader {
    kind: u16,
    wait: Duration,
    capacity: usize,
    batch_fn: BatchFn,
    sender: OnceLock<mpsc::UnboundedSender<LoadRequest>>,
}

impl BatchLoader {
    pub(crate) fn new(kind: u16, wait: Duration, capacity: usize, batch_fn: BatchFn) -> Self {
        Self {
            kind,
            wait,
            capacity,
            batch_fn,
            sender: OnceLock::new(),
        }
    }

    /// Fetch the newest replaceable event of this loader's kind for
    /// `pubkey`, batched with whatever else is being asked right now.
    pub(crate) async fn load(&self, pubkey: &str) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        let request = LoadRequest {
            pubkey: pubkey.to_string(),
            reply,
        };
        if self.sender().send(request).is_err() {
            return Err(Error::Canceled);
        }
        rx.await.unwrap_or(Err(Error::Canceled))
    }

    fn sender(&self) -> &mpsc::UnboundedSender<LoadRequest> {
        self.sender.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let kind = self.kind;
            let wait = self.wait;
            let capacity = self.capacity;
            let batch_fn = self.batch_fn.clone();
            tokio::spawn(dispatch(rx, kind, wait, capacity, batch_fn));
            tx
        })
    }
}

/// Accumulate requests into batches and hand them to the batch function.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<LoadRequest>,
    kind: u16,
    wait: Duration,
    capacity: usize,
    batch_fn: BatchFn,
) {
    while let Some(first) = rx.recv().await {
        let mut requests = vec![first];
        let window = tokio::time::sleep(wait);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                request = rx.recv() => match request {
                    Some(request) => {
                        requests.push(request);
                        if requests.len() >= capacity {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // collapse duplicate keys: every caller of the same key gets a
        // clone of the same slot
        let mut keys: Vec<String> = Vec::with_capacity(requests.len());
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(requests.len());
        let mut repliers: Vec<Vec<oneshot::Sender<Result<Event>>>> = Vec::new();
        for request in requests {
            match positions.get(&request.pubkey) {
                Some(&i) => repliers[i].push(request.reply),
                None => {
                    positions.insert(request.pubkey.clone(), keys.len());
                    keys.push(request.pubkey);
                    repliers.push(vec![request.reply]);
                }
            }
        }

        metrics::counter!("loader_batches_total").increment(1);
        metrics::counter!("loader_batched_keys_total").increment(keys.len() as u64);
        tracing::debug!("flushing batch of {} kind {} lookups", keys.len(), kind);

        // run the batch in its own task so the next one can accumulate
        // while this one is on the wire
        let batch_fn = batch_fn.clone();
        tokio::spawn(async move {
            let results = batch_fn(keys).await;
            debug_assert_eq!(results.len(), repliers.len());
            for (result, waiters) in results.into_iter().zip(repliers) {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
        });
    }
}

impl System {
    /// Execute one batch: route every key to its relays, fan out one
    /// combined subscription per relay, and keep the newest event per
    /// key.
    pub(crate) async fn batch_load_replaceable_events(
        &self,
        kind: u16,
        pubkeys: Vec<String>,
    ) -> Vec<Result<Event>> {
        let mut results: Vec<Result<Event>> = Vec::with_capacity(pubkeys.len());
        let mut key_positions: HashMap<String, usize> = HashMap::with_capacity(pubkeys.len());
        let mut authors_by_relay: HashMap<String, Vec<PublicKey>> = HashMap::new();

        for (i, pubkey) in pubkeys.iter().enumerate() {
            if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
                results.push(Err(Error::ShortenedKey { kind }));
                continue;
            }
            let author = match PublicKey::from_hex(pubkey) {
                Ok(author) => author,
                Err(e) => {
                    results.push(Err(Error::InvalidInput(format!("bad key {pubkey}: {e}"))));
                    continue;
                }
            };

            // remember failed lookups so a user with no event anywhere
            // doesn't get requeried on every render
            if !self.attempts().should_attempt(&format!("repl:{kind}{pubkey}")) {
                results.push(Err(Error::TriedRecently));
                continue;
            }

            let relays = self.relays_to_query(pubkey, kind).await;

            // overwritten as soon as any relay produces an event
            results.push(Err(Error::NotFound {
                kind,
                relays: relays.clone(),
            }));
            key_positions.insert(pubkey.clone(), i);

            for relay in relays {
                authors_by_relay.entry(relay).or_default().push(author);
            }
        }

        if authors_by_relay.is_empty() {
            return results;
        }

        let (tx, mut rx) = mpsc::channel::<(String, Event)>(BATCH_CHANNEL_SIZE);
        for (url, authors) in authors_by_relay {
            let filter = Filter::new()
                .kind(Kind::from(kind))
                .authors(authors.iter().copied());
            let expected = authors.len();
            let pool = self.pool().clone();
            let tx = tx.clone();
            tokio::spawn(query_relay(pool, url, filter, expected, tx));
        }
        drop(tx);

        while let Some((relay_url, event)) = rx.recv().await {
            let author = event.pubkey.to_hex();
            let Some(&position) = key_positions.get(&author) else {
                // relays must only answer for requested authors
                tracing::debug!("{} sent an event for unrequested author {}", relay_url, author);
                continue;
            };
            let fresher = match &results[position] {
                Ok(current) => current.created_at < event.created_at,
                Err(_) => true,
            };
            if fresher {
                self.hints()
                    .save(&author, &relay_url, HintPurpose::EventFetched, event.created_at);
                results[position] = Ok(event);
            }
        }

        results
    }

    /// Relays to ask about `pubkey` for a lookup of `kind`: the user's
    /// best outbox relays plus the configured seeds for the bootstrap
    /// kinds. The relay list and contact list kinds skip outbox
    /// resolution entirely, since resolving an outbox is what fetches
    /// them in the first place.
    async fn relays_to_query(&self, pubkey: &str, kind: u16) -> Vec<String> {
        let mut relays: Vec<String> = Vec::with_capacity(8);
        if kind != RELAY_LIST_KIND && kind != CONTACT_LIST_KIND {
            relays = self.fetch_outbox_relays(pubkey, RELAYS_PER_AUTHOR).await;
        }

        match kind {
            METADATA_KIND => relays.extend(self.metadata_relays().iter().cloned()),
            CONTACT_LIST_KIND => relays.extend(self.follow_list_relays().iter().cloned()),
            RELAY_LIST_KIND => relays.extend(self.relay_list_relays().iter().cloned()),
            _ => {}
        }

        let mut seen = HashSet::new();
        relays.retain(|url| seen.insert(url.clone()));
        relays
    }
}

/// Subscribe to one relay and forward everything it delivers, stopping
/// at EOSE, at `expected` events, or at the deadline.
async fn query_relay(
    pool: Arc<dyn RelayPool>,
    url: String,
    filter: Filter,
    expected: usize,
    tx: mpsc::Sender<(String, Event)>,
) {
    let outcome = tokio::time::timeout(RELAY_QUERY_TIMEOUT, async {
        if let Err(e) = pool.ensure_relay(&url).await {
            tracing::debug!("skipping relay {}: {}", url, e);
            return;
        }
        let mut sub = match pool
            .subscribe(&url, filter, RELAY_QUERY_TIMEOUT, SubscriptionMode::StoredOnly)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                tracing::debug!("subscribe to {} failed: {}", url, e);
                return;
            }
        };

        let mut received = 0usize;
        loop {
            tokio::select! {
                biased;
                maybe = sub.events.recv() => match maybe {
                    Some(event) => {
                        metrics::counter!("loader_events_received_total").increment(1);
                        if tx.send((url.clone(), event)).await.is_err() {
                            // batch canceled
                            return;
                        }
                        received += 1;
                        if received >= expected {
                            return;
                        }
                    }
                    None => return,
                },
                _ = &mut sub.eose => return,
            }
        }
    })
    .await;

    if outcome.is_err() {
        tracing::debug!("query to {} timed out", url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TEST_NOW, TestHarness, replaceable_event};
    use nostr::Keys;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_coalesce_into_one_batch() {
        let h = TestHarness::new();
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();
        let event = replaceable_event(&keys, Kind::Metadata, r#"{"name":"a"}"#, TEST_NOW - 60);
        h.pool.stock(&h.metadata_seed, event.clone());

        let sys = h.system();
        let (a, b) = tokio::join!(
            sys.load_replaceable(METADATA_KIND, &hex),
            sys.load_replaceable(METADATA_KIND, &hex),
        );

        assert_eq!(a.unwrap().id, event.id);
        assert_eq!(b.unwrap().id, event.id);
        // one outbound subscription for the metadata kind, not two
        assert_eq!(h.pool.subscribe_count_for_kind(Kind::Metadata), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retry_does_no_network_work() {
        let h = TestHarness::new();
        let hex = Keys::generate().public_key().to_hex();
        let sys = h.system();

        let first = sys.load_replaceable(RELAY_LIST_KIND, &hex).await;
        assert!(matches!(first, Err(Error::NotFound { .. })));
        let subscribes_after_first = h.pool.subscribe_count();

        // well past the batch window, well inside the hour
        h.clock.advance(60);
        let second = sys.load_replaceable(RELAY_LIST_KIND, &hex).await;
        assert!(matches!(second, Err(Error::TriedRecently)));
        assert_eq!(h.pool.subscribe_count(), subscribes_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortened_key_is_rejected_without_network_work() {
        let h = TestHarness::new();
        let sys = h.system();

        let result = sys.load_replaceable(METADATA_KIND, "abcdef12").await;
        assert!(matches!(result, Err(Error::ShortenedKey { kind: 0 })));
        assert_eq!(h.pool.subscribe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshest_event_wins_across_relays() {
        let h = TestHarness::new();
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();

        // two relays hold different revisions of the same relay list
        h.pool.stock(
            &h.relay_list_seed,
            replaceable_event(&keys, Kind::RelayList, "", TEST_NOW - 600),
        );
        let newer = replaceable_event(&keys, Kind::RelayList, "", TEST_NOW - 60);
        h.pool.stock(&h.extra_relay_list_seed, newer.clone());

        let sys = h.system();
        let result = sys.load_replaceable(RELAY_LIST_KIND, &hex).await.unwrap();
        assert_eq!(result.id, newer.id);
        assert_eq!(result.created_at.as_u64(), TEST_NOW - 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_names_the_queried_relays() {
        let h = TestHarness::new();
        let hex = Keys::generate().public_key().to_hex();
        let sys = h.system();

        match sys.load_replaceable(RELAY_LIST_KIND, &hex).await {
            Err(Error::NotFound { kind, relays }) => {
                assert_eq!(kind, RELAY_LIST_KIND);
                assert!(relays.contains(&h.relay_list_seed));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetched_events_feed_the_hint_store() {
        let h = TestHarness::new();
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();
        h.pool.stock(
            &h.relay_list_seed,
            replaceable_event(&keys, Kind::RelayList, "", TEST_NOW - 60),
        );

        let sys = h.system();
        sys.load_replaceable(RELAY_LIST_KIND, &hex).await.unwrap();

        let top = sys.hints().top_n(&hex, 5);
        assert_eq!(top, vec![h.relay_list_seed.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_kind_has_no_loader() {
        let h = TestHarness::new();
        let hex = Keys::generate().public_key().to_hex();
        let result = h.system().load_replaceable(1, &hex).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
