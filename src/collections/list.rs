//! List-backed shared sequence.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CollectionError;
use crate::codec::Codec;
use crate::codec::JsonCodec;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::CollectionStore;
use crate::store::keys;

/// A shared ordered sequence stored as one list in the backing store.
///
/// Indexes follow the store's list convention: negative values count from
/// the tail, and ranges are inclusive.
pub struct SharedList<S: CollectionStore + ?Sized, C: Codec = JsonCodec> {
    store: Arc<S>,
    key: String,
    codec: C,
}

impl<S: CollectionStore + ?Sized> SharedList<S> {
    /// Create a list handle for `name` with the JSON codec.
    pub fn new(store: Arc<S>, name: &str) -> Self {
        Self::with_codec(store, name, JsonCodec)
    }
}

impl<S: CollectionStore + ?Sized, C: Codec> SharedList<S, C> {
    /// Create a list handle for `name` with a custom codec.
    pub fn with_codec(store: Arc<S>, name: &str, codec: C) -> Self {
        let key = keys::list_key(DEFAULT_NAMESPACE, name);
        Self { store, key, codec }
    }

    /// Append to the tail. Returns the new length.
    pub async fn push<T: Serialize + ?Sized>(&self, value: &T) -> Result<u64, CollectionError> {
        let bytes = self.codec.encode(value)?;
        Ok(self.store.list_push_back(&self.key, bytes).await?)
    }

    /// Pop from the tail.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>, CollectionError> {
        self.decode_opt(self.store.list_pop_back(&self.key).await?)
    }

    /// Element at `index`.
    pub async fn get<T: DeserializeOwned>(&self, index: i64) -> Result<Option<T>, CollectionError> {
        self.decode_opt(self.store.list_get(&self.key, index).await?)
    }

    /// Overwrite the element at `index`. Returns false when out of range.
    pub async fn set<T: Serialize + ?Sized>(&self, index: i64, value: &T) -> Result<bool, CollectionError> {
        let bytes = self.codec.encode(value)?;
        Ok(self.store.list_set(&self.key, index, bytes).await?)
    }

    /// Current length.
    pub async fn len(&self) -> Result<u64, CollectionError> {
        Ok(self.store.list_len(&self.key).await?)
    }

    /// Whether the list is empty.
    pub async fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.len().await? == 0)
    }

    /// Elements from `start` through `stop` inclusive.
    pub async fn range<T: DeserializeOwned>(&self, start: i64, stop: i64) -> Result<Vec<T>, CollectionError> {
        let raw = self.store.list_range(&self.key, start, stop).await?;
        let mut values = Vec::with_capacity(raw.len());
        for bytes in raw {
            values.push(self.codec.decode(&bytes)?);
        }
        Ok(values)
    }

    /// Remove up to `count` occurrences of `value` from the head (0 = all).
    ///
    /// Returns the number removed.
    pub async fn remove<T: Serialize + ?Sized>(&self, value: &T, count: u64) -> Result<u64, CollectionError> {
        let bytes = self.codec.encode(value)?;
        Ok(self.store.list_remove(&self.key, &bytes, count).await?)
    }

    /// Remove every element.
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
    async fn push_get_pop() {
        let store = DeterministicStore::new();
        let list = SharedList::new(store, "events");

        assert_eq!(list.push("a").await.unwrap(), 1);
        assert_eq!(list.push("b").await.unwrap(), 2);

        assert_eq!(list.get::<String>(0).await.unwrap(), Some("a".to_string()));
        assert_eq!(list.get::<String>(-1).await.unwrap(), Some("b".to_string()));
        assert_eq!(list.get::<String>(5).await.unwrap(), None);

        assert_eq!(list.pop::<String>().await.unwrap(), Some("b".to_string()));
        assert_eq!(list.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_in_and_out_of_range() {
        let store = DeterministicStore::new();
        let list = SharedList::new(store, "events");

        list.push("a").await.unwrap();
        assert!(list.set(0, "z").await.unwrap());
        assert_eq!(list.get::<String>(0).await.unwrap(), Some("z".to_string()));

        assert!(!list.set(3, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn range_is_inclusive_and_tail_relative() {
        let store = DeterministicStore::new();
        let list = SharedList::new(store, "events");

        for value in ["a", "b", "c", "d"] {
            list.push(value).await.unwrap();
        }

        let all: Vec<String> = list.range(0, -1).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c", "d"]);

        let middle: Vec<String> = list.range(1, 2).await.unwrap();
        assert_eq!(middle, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn remove_counts_from_the_head() {
        let store = DeterministicStore::new();
        let list = SharedList::new(store, "events");

        for value in ["x", "y", "x", "x"] {
            list.push(value).await.unwrap();
        }

        assert_eq!(list.remove("x", 2).await.unwrap(), 2);
        let rest: Vec<String> = list.range(0, -1).await.unwrap();
        assert_eq!(rest, vec!["y", "x"]);

        list.clear().await.unwrap();
        assert!(list.is_empty().await.unwrap());
    }
}
