//! Outbox routing.
//!
//! A query with many authors should not go to every relay. The planner
//! resolves each author's best outbox relays and inverts the result:
//! every relay is asked only about the authors it is the best known
//! home for.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nostr::{Filter, PublicKey, Timestamp};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::system::System;
use crate::{Error, Result};

/// Outbox relays resolved per author when expanding a query.
const RELAYS_PER_AUTHOR: usize = 3;

/// Concurrent author resolutions while expanding a query.
const MAX_CONCURRENT_RESOLUTIONS: usize = 16;

/// A cached relay list older than this triggers a refetch.
const RELAY_LIST_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

impl System {
    /// The best `n` outbox relays for `pubkey` according to the hint
    /// engine.
    ///
    /// The user's declared relay list is refetched first when the cached
    /// copy is missing or more than a week old; fetching it feeds the
    /// hint engine, so the ranking already reflects the declaration by
    /// the time it is read.
    pub async fn fetch_outbox_relays(&self, pubkey: &str, n: usize) -> Vec<String> {
        let needs_refresh = match self.relay_list_cache().get(pubkey) {
            None => true,
            Some(list) => match &list.event {
                Some(event) => {
                    event.created_at.as_u64() + RELAY_LIST_MAX_AGE.as_secs()
                        < Timestamp::now().as_u64()
                }
                None => false,
            },
        };
        if needs_refresh {
            // a user with no relay list anywhere is fine, the hint
            // engine may still know them from other observations
            self.fetch_relay_list(pubkey).await;
        }

        self.hints().top_n(pubkey, n)
    }

    /// Expand a multi-author filter into one sub-filter per relay, where
    /// each relay is asked only about the authors routed to it.
    ///
    /// Authors with no known outbox relays are dropped from the plan;
    /// callers that need full coverage layer a fallback relay set on
    /// top. Fails when the filter carries no authors at all.
    pub async fn expand_queries_by_author_and_relays(
        &self,
        filter: Filter,
    ) -> Result<HashMap<String, Filter>> {
        let authors: Vec<PublicKey> = filter
            .authors
            .clone()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if authors.is_empty() {
            return Err(Error::InvalidInput("no authors in filter".to_string()));
        }

        metrics::counter!("planner_expansions_total").increment(1);

        let relays_for_author: Arc<Mutex<HashMap<PublicKey, Vec<String>>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(authors.len())));
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_RESOLUTIONS));

        let mut tasks = JoinSet::new();
        for author in authors {
            let sys = self.clone();
            let relays_for_author = relays_for_author.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let candidates = sys
                    .fetch_outbox_relays(&author.to_hex(), RELAYS_PER_AUTHOR)
                    .await;
                let mut kept = 0;
                for url in candidates {
                    match sys.pool().ensure_relay(&url).await {
                        Ok(normalized) => {
                            relays_for_author
                                .lock()
                                .entry(author)
                                .or_default()
                                .push(normalized);
                            kept += 1;
                            if kept == RELAYS_PER_AUTHOR {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("outbox relay {} unusable for {}: {}", url, author, e);
                        }
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        let relays_for_author = std::mem::take(&mut *relays_for_author.lock());
        let mut filter_for_relay: HashMap<String, Filter> =
            HashMap::with_capacity(relays_for_author.len());
        for (author, relays) in relays_for_author {
            for relay in relays {
                let entry = filter_for_relay.entry(relay).or_insert_with(|| {
                    let mut relay_filter = filter.clone();
                    relay_filter.authors = Some(BTreeSet::new());
                    relay_filter
                });
                if let Some(authors) = entry.authors.as_mut() {
                    authors.insert(author);
                }
            }
        }

        Ok(filter_for_relay)
    }
}
