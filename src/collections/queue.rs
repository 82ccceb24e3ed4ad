//! List-backed FIFO queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CollectionError;
use crate::codec::Codec;
use crate::codec::JsonCodec;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::CollectionStore;
use crate::store::keys;

/// A shared FIFO queue stored as one list in the backing store.
pub struct SharedQueue<S: CollectionStore + ?Sized, C: Codec = JsonCodec> {
    store: Arc<S>,
    key: String,
    codec: C,
}

impl<S: CollectionStore + ?Sized> SharedQueue<S> {
    /// Create a queue handle for `name` with the JSON codec.
    pub fn new(store: Arc<S>, name: &str) -> Self {
        Self::with_codec(store, name, JsonCodec)
    }
}

impl<S: CollectionStore + ?Sized, C: Codec> SharedQueue<S, C> {
    /// Create a queue handle for `name` with a custom codec.
    pub fn with_codec(store: Arc<S>, name: &str, codec: C) -> Self {
        let key = keys::queue_key(DEFAULT_NAMESPACE, name);
        Self { store, key, codec }
    }

    /// Enqueue at the tail.
    pub async fn push<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), CollectionError> {
        let bytes = self.codec.encode(value)?;
        self.store.list_push_back(&self.key, bytes).await?;
        Ok(())
    }

    /// Dequeue from the head, if any.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>, CollectionError> {
        self.decode_opt(self.store.list_pop_front(&self.key).await?)
    }

    /// Dequeue from the head, waiting up to `timeout` for an element.
    pub async fn pop_wait<T: DeserializeOwned>(&self, timeout: Duration) -> Result<Option<T>, CollectionError> {
        self.decode_opt(self.store.list_pop_front_timeout(&self.key, timeout).await?)
    }

    /// The head element without removing it.
    pub async fn peek<T: DeserializeOwned>(&self) -> Result<Option<T>, CollectionError> {
        self.decode_opt(self.store.list_get(&self.key, 0).await?)
    }

    /// Number of queued elements.
    pub async fn len(&self) -> Result<u64, CollectionError> {
        Ok(self.store.list_len(&self.key).await?)
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.len().await? == 0)
    }

    /// Remove every queued element.
    pub async fn clear(&self) -> Result<(), CollectionError> {
        Ok(self.store.remove_key(&self.key).await?)
    }

    fn decode_opt<T: DeserializeOwned>(&self, bytes: Option<Vec<u8>>) -> Result<Option<T>, CollectionError> {
        match bytes {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeterministicStore;

    #[tokio::test]
    async fn fifo_order() {
        let store = DeterministicStore::new();
        let queue = SharedQueue::new(store, "jobs");

        queue.push("first").await.unwrap();
        queue.push("second").await.unwrap();

        assert_eq!(queue.peek::<String>().await.unwrap(), Some("first".to_string()));
        assert_eq!(queue.pop::<String>().await.unwrap(), Some("first".to_string()));
        assert_eq!(queue.pop::<String>().await.unwrap(), Some("second".to_string()));
        assert_eq!(queue.pop::<String>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_wait_blocks_until_push() {
        let store = DeterministicStore::new();
        let queue = Arc::new(SharedQueue::new(store, "jobs"));

        let consumer = Arc::clone(&queue);
        let pending =
            tokio::spawn(async move { consumer.pop_wait::<String>(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("late").await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Some("late".to_string()));
    }

    #[tokio::test]
    async fn pop_wait_times_out_empty() {
        let store = DeterministicStore::new();
        let queue = SharedQueue::new(store, "jobs");

        let got = queue.pop_wait::<String>(Duration::from_millis(40)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn len_and_clear() {
        let store = DeterministicStore::new();
        let queue = SharedQueue::new(store, "jobs");

        assert!(queue.is_empty().await.unwrap());
        queue.push(&1u32).await.unwrap();
        queue.push(&2u32).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        queue.clear().await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }
}
