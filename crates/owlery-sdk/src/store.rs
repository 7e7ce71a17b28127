//! Persistent event store bridge.
//!
//! The SDK itself keeps nothing on disk. Embedders that have a local
//! event database plug it in through [`EventStore`]; the facade then
//! checks it before going to the network and can republish freshly
//! fetched events into it. When nothing is configured, [`NullStore`]
//! makes every query come back empty.

use async_trait::async_trait;
use nostr::{Event, Filter};

use crate::Result;

/// A queryable, appendable event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All stored events matching `filter`.
    async fn query_sync(&self, filter: Filter) -> Result<Vec<Event>>;

    /// Persist one event.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// The no-op store used when the embedder configures none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl EventStore for NullStore {
    async fn query_sync(&self, _filter: Filter) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    #[tokio::test]
    async fn test_null_store_is_empty_and_accepts_publishes() {
        let store = NullStore;
        let event = EventBuilder::new(Kind::TextNote, "hi")
            .sign_with_keys(&Keys::generate())
            .unwrap();

        store.publish(event).await.unwrap();
        let results = store.query_sync(Filter::new()).await.unwrap();
        assert!(results.is_empty());
    }
}
