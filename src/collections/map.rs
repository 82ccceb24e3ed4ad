//! Hash-backed shared map.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CollectionError;
use crate::codec::Codec;
use crate::codec::JsonCodec;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::CollectionStore;
use crate::store::keys;

/// A shared map stored as one hash in the backing store.
///
/// Every operation proxies a single native hash command.
pub struct SharedMap<S: CollectionStore + ?Sized, C: Codec = JsonCodec> {
    store: Arc<S>,
    key: String,
    codec: C,
}

impl<S: CollectionStore + ?Sized> SharedMap<S> {
    /// Create a map handle for `name` with the JSON codec.
    pub fn new(store: Arc<S>, name: &str) -> Self {
        Self::with_codec(store, name, JsonCodec)
    }
}

impl<S: CollectionStore + ?Sized, C: Codec> SharedMap<S, C> {
    /// Create a map handle for `name` with a custom codec.
    pub fn with_codec(store: Arc<S>, name: &str, codec: C) -> Self {
        let key = keys::map_key(DEFAULT_NAMESPACE, name);
        Self { store, key, codec }
    }

    /// Set `field` to `value`.
    pub async fn insert<T: Serialize + ?Sized>(&self, field: &str, value: &T) -> Result<(), CollectionError> {
        let bytes = self.codec.encode(value)?;
        Ok(self.store.hash_set(&self.key, field, bytes).await?)
    }

    /// Get the value at `field`.
    pub async fn get<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, CollectionError> {
        match self.store.hash_get(&self.key, field).await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set `field` to `default` iff absent, then return the stored value.
    pub async fn get_or_insert<T>(&self, field: &str, default: &T) -> Result<T, CollectionError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let bytes = self.codec.encode(default)?;
        if self.store.hash_set_if_absent(&self.key, field, bytes).await? {
            return Ok(default.clone());
        }
        match self.store.hash_get(&self.key, field).await? {
            Some(bytes) => Ok(self.codec.decode(&bytes)?),
            // The field was removed between the two commands; the default
            // answer is still truthful to what the caller asked for.
            None => Ok(default.clone()),
        }
    }

    /// Remove `field`. Returns true when it existed.
    pub async fn remove(&self, field: &str) -> Result<bool, CollectionError> {
        Ok(self.store.hash_del(&self.key, field).await?)
    }

    /// Whether `field` is present.
    pub async fn contains(&self, field: &str) -> Result<bool, CollectionError> {
        Ok(self.store.hash_get(&self.key, field).await?.is_some())
    }

    /// Number of fields.
    pub async fn len(&self) -> Result<u64, CollectionError> {
        Ok(self.store.hash_len(&self.key).await?)
    }

    /// Whether the map has no fields.
    pub async fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.len().await? == 0)
    }

    /// All field names.
    pub async fn keys(&self) -> Result<Vec<String>, CollectionError> {
        Ok(self.store.hash_keys(&self.key).await?)
    }

    /// All field/value pairs.
    pub async fn entries<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>, CollectionError> {
        let raw = self.store.hash_get_all(&self.key).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for (field, bytes) in raw {
            entries.push((field, self.codec.decode(&bytes)?));
        }
        Ok(entries)
    }

    /// Remove every field.
    pub async fn clear(&self) -> Result<(), CollectionError> {
        Ok(self.store.remove_key(&self.key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeterministicStore;

    #[tokio::test]
    async fn insert_get_remove() {
        let store = DeterministicStore::new();
        let map = SharedMap::new(store, "settings");

        map.insert("retries", &3u32).await.unwrap();
        assert_eq!(map.get::<u32>("retries").await.unwrap(), Some(3));
        assert!(map.contains("retries").await.unwrap());

        assert!(map.remove("retries").await.unwrap());
        assert_eq!(map.get::<u32>("retries").await.unwrap(), None);
        assert!(!map.remove("retries").await.unwrap());
    }

    #[tokio::test]
    async fn get_or_insert_keeps_the_first_value() {
        let store = DeterministicStore::new();
        let map = SharedMap::new(store, "settings");

        assert_eq!(map.get_or_insert("mode", &"fast".to_string()).await.unwrap(), "fast");
        assert_eq!(map.get_or_insert("mode", &"slow".to_string()).await.unwrap(), "fast");
    }

    #[tokio::test]
    async fn entries_and_clear() {
        let store = DeterministicStore::new();
        let map = SharedMap::new(store, "settings");

        map.insert("a", &1u32).await.unwrap();
        map.insert("b", &2u32).await.unwrap();

        assert_eq!(map.len().await.unwrap(), 2);
        let mut keys = map.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        let entries: Vec<(String, u32)> = map.entries().await.unwrap();
        assert_eq!(entries.len(), 2);

        map.clear().await.unwrap();
        assert!(map.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn maps_with_different_names_are_disjoint() {
        let store = DeterministicStore::new();
        let first = SharedMap::new(Arc::clone(&store), "a");
        let second = SharedMap::new(store, "b");

        first.insert("k", &1u32).await.unwrap();
        assert_eq!(second.get::<u32>("k").await.unwrap(), None);
    }
}
