//! In-process deterministic store backend.
//!
//! Mirrors the behavior of the networked backends without any I/O: one
//! mutex guards all state, so every operation is trivially atomic, and
//! expiry is enforced lazily on access. Used by every unit and property
//! test, and usable as a single-process stand-in for the real store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::Notify;

use super::AdjustBounds;
use super::AdjustOutcome;
use super::AtomicStore;
use super::CollectionStore;
use super::RefillPolicy;
use super::StoreError;
use super::TakeOutcome;
use super::error::WrongTypeSnafu;

/// What a key currently holds.
enum Value {
    /// A fenced ownership record (lease).
    Owned(String),
    /// A bounded counter.
    Counter(i64),
    /// A token bucket.
    Bucket { tokens: f64, last_refill: Instant },
    /// A hash of field/value pairs.
    Hash(BTreeMap<String, Vec<u8>>),
    /// An ordered list.
    List(VecDeque<Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    watchers: HashMap<String, Arc<Notify>>,
}

impl Inner {
    /// Access a key, reclaiming it first if its TTL has lapsed.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(Entry::is_expired) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn notify(&self, key: &str) {
        if let Some(notify) = self.watchers.get(key) {
            notify.notify_waiters();
        }
    }

    fn watcher(&mut self, key: &str) -> Arc<Notify> {
        self.watchers.entry(key.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, Vec<u8>>, StoreError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Hash(BTreeMap::new()), expires_at: None });
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => WrongTypeSnafu { key }.fail(),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<Vec<u8>>, StoreError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::List(VecDeque::new()), expires_at: None });
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => WrongTypeSnafu { key }.fail(),
        }
    }

    /// Drop a collection entry once it is empty so absent and empty agree.
    fn prune(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

/// A deterministic in-memory store.
///
/// Thread-safe and supporting every [`AtomicStore`] and [`CollectionStore`]
/// operation with predictable behavior. Change notification is exact
/// (`tokio::sync::Notify` per watched key) rather than polled.
pub struct DeterministicStore {
    inner: Mutex<Inner>,
}

impl Default for DeterministicStore {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl DeterministicStore {
    /// Create a new store wrapped in `Arc`, ready to share across tasks.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AtomicStore for DeterministicStore {
    async fn acquire_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(key.to_string(), Entry {
            value: Value::Owned(owner.to_string()),
            expires_at: Some(Instant::now() + ttl),
        });
        inner.notify(key);
        Ok(true)
    }

    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let owned = match inner.live(key) {
            None => return Ok(false),
            Some(entry) => match &entry.value {
                Value::Owned(current) => current == owner,
                _ => return WrongTypeSnafu { key }.fail(),
            },
        };
        if owned {
            inner.entries.remove(key);
            inner.notify(key);
        }
        Ok(owned)
    }

    async fn refresh_ttl(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(false),
            Some(entry) => match &entry.value {
                Value::Owned(current) if current == owner => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                }
                Value::Owned(_) => Ok(false),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn atomic_adjust(&self, key: &str, delta: i64, bounds: AdjustBounds) -> Result<AdjustOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = match inner.live(key) {
            None => 0,
            Some(entry) => match entry.value {
                Value::Counter(value) => value,
                _ => return WrongTypeSnafu { key }.fail(),
            },
        };
        let next = current.saturating_add(delta);
        if next < bounds.min || next > bounds.max {
            return Ok(AdjustOutcome::Rejected { current });
        }
        if next == 0 {
            inner.entries.remove(key);
        } else {
            inner.entries.insert(key.to_string(), Entry {
                value: Value::Counter(next),
                expires_at: bounds.ttl.map(|ttl| Instant::now() + ttl),
            });
        }
        inner.notify(key);
        Ok(AdjustOutcome::Applied(next))
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(0),
            Some(entry) => match entry.value {
                Value::Counter(value) => Ok(value),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn bucket_take(&self, key: &str, refill: &RefillPolicy) -> Result<TakeOutcome, StoreError> {
        if refill.rate == 0 {
            return Ok(TakeOutcome::Throttled { retry_after: refill.period });
        }

        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let capacity = refill.rate as f64;
        let per_second = refill.rate as f64 / refill.period.as_secs_f64();

        let tokens = match inner.live(key) {
            None => capacity,
            Some(entry) => match entry.value {
                Value::Bucket { tokens, last_refill } => {
                    let replenished = now.duration_since(last_refill).as_secs_f64() * per_second;
                    (tokens + replenished).min(capacity)
                }
                _ => return WrongTypeSnafu { key }.fail(),
            },
        };

        if tokens < 1.0 {
            // Rejected without mutating; the stored state keeps accruing.
            let retry_after = refill.period.mul_f64((1.0 - tokens) / refill.rate as f64);
            return Ok(TakeOutcome::Throttled { retry_after });
        }

        let remaining = tokens - 1.0;
        inner.entries.insert(key.to_string(), Entry {
            value: Value::Bucket { tokens: remaining, last_refill: now },
            expires_at: None,
        });
        Ok(TakeOutcome::Admitted { remaining: remaining as u32 })
    }

    async fn wait_for_change(&self, key: &str, timeout: Duration) -> Result<bool, StoreError> {
        let notify = {
            let mut inner = self.inner.lock().await;
            inner.watcher(key)
        };
        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl CollectionStore for DeterministicStore {
    async fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        inner.notify(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.hash_mut(key)?.insert(field.to_string(), value);
        inner.notify(key);
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let hash = inner.hash_mut(key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value);
        inner.notify(key);
        Ok(true)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.get(field).cloned()),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.hash_mut(key)?.remove(field).is_some();
        inner.prune(key);
        if removed {
            inner.notify(key);
        }
        Ok(removed)
    }

    async fn hash_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.len() as u64),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.keys().cloned().collect()),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.iter().map(|(field, value)| (field.clone(), value.clone())).collect()),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn list_push_back(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let list = inner.list_mut(key)?;
        list.push_back(value);
        let len = list.len() as u64;
        inner.notify(key);
        Ok(len)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        let popped = inner.list_mut(key)?.pop_front();
        inner.prune(key);
        if popped.is_some() {
            inner.notify(key);
        }
        Ok(popped)
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        let popped = inner.list_mut(key)?.pop_back();
        inner.prune(key);
        if popped.is_some() {
            inner.notify(key);
        }
        Ok(popped)
    }

    async fn list_get(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(normalize_index(index, list.len()).and_then(|i| list.get(i).cloned())),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn list_set(&self, key: &str, index: i64, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let updated = match inner.live(key) {
            None => false,
            Some(entry) => match &mut entry.value {
                Value::List(list) => match normalize_index(index, list.len()) {
                    Some(i) => {
                        list[i] = value;
                        true
                    }
                    None => false,
                },
                _ => return WrongTypeSnafu { key }.fail(),
            },
        };
        if updated {
            inner.notify(key);
        }
        Ok(updated)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(list.len() as u64),
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::List(list) => {
                    let len = list.len() as i64;
                    let start = if start < 0 { start + len } else { start }.max(0);
                    let stop = if stop < 0 { stop + len } else { stop }.min(len - 1);
                    if len == 0 || start > stop {
                        return Ok(Vec::new());
                    }
                    Ok(list.iter().skip(start as usize).take((stop - start + 1) as usize).cloned().collect())
                }
                _ => WrongTypeSnafu { key }.fail(),
            },
        }
    }

    async fn list_remove(&self, key: &str, value: &[u8], count: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let list = inner.list_mut(key)?;
        let mut removed = 0u64;
        let mut kept = VecDeque::with_capacity(list.len());
        for item in list.drain(..) {
            if item == value && (count == 0 || removed < count) {
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        *list = kept;
        inner.prune(key);
        if removed > 0 {
            inner.notify(key);
        }
        Ok(removed)
    }

    async fn list_pop_front_timeout(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.list_pop_front(key).await? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let notify = {
                let mut inner = self.inner.lock().await;
                inner.watcher(key)
            };
            // Bound each wait so a push racing past the registration above
            // is picked up by the next iteration rather than lost.
            let wait = (deadline - now).min(Duration::from_millis(crate::constants::WAIT_POLL_INTERVAL_MS));
            let _ = tokio::time::timeout(wait, notify.notified()).await;
        }
    }
}

/// Resolve a possibly-negative index against `len`. Out of range is `None`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store = DeterministicStore::new();
        assert!(store.acquire_if_absent("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.acquire_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());

        assert!(!store.release_if_owner("k", "b").await.unwrap());
        assert!(store.release_if_owner("k", "a").await.unwrap());
        assert!(store.acquire_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let store = DeterministicStore::new();
        assert!(store.acquire_if_absent("k", "a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Owner lapsed; its fenced release reports that.
        assert!(store.acquire_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!store.release_if_owner("k", "a").await.unwrap());
        assert!(store.release_if_owner("k", "b").await.unwrap());
    }

    #[tokio::test]
    async fn refresh_ttl_requires_ownership() {
        let store = DeterministicStore::new();
        store.acquire_if_absent("k", "a", Duration::from_secs(10)).await.unwrap();
        assert!(store.refresh_ttl("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.refresh_ttl("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn adjust_enforces_bounds_atomically() {
        let store = DeterministicStore::new();
        let bounds = AdjustBounds::new(0, 2);

        assert_eq!(store.atomic_adjust("c", 1, bounds).await.unwrap(), AdjustOutcome::Applied(1));
        assert_eq!(store.atomic_adjust("c", 1, bounds).await.unwrap(), AdjustOutcome::Applied(2));
        assert_eq!(store.atomic_adjust("c", 1, bounds).await.unwrap(), AdjustOutcome::Rejected { current: 2 });
        assert_eq!(store.read_counter("c").await.unwrap(), 2);

        assert_eq!(store.atomic_adjust("c", -2, bounds).await.unwrap(), AdjustOutcome::Applied(0));
        assert_eq!(store.atomic_adjust("c", -1, bounds).await.unwrap(), AdjustOutcome::Rejected { current: 0 });
    }

    #[tokio::test]
    async fn counter_ttl_reclaims_idle_counters() {
        let store = DeterministicStore::new();
        let bounds = AdjustBounds::new(0, 10).with_ttl(Duration::from_millis(20));
        store.atomic_adjust("c", 3, bounds).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.read_counter("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bucket_rejects_without_mutating() {
        let store = DeterministicStore::new();
        let refill = RefillPolicy { rate: 2, period: Duration::from_secs(60) };

        assert!(matches!(store.bucket_take("b", &refill).await.unwrap(), TakeOutcome::Admitted { remaining: 1 }));
        assert!(matches!(store.bucket_take("b", &refill).await.unwrap(), TakeOutcome::Admitted { remaining: 0 }));
        match store.bucket_take("b", &refill).await.unwrap() {
            TakeOutcome::Throttled { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected throttle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_change_wakes_on_write() {
        let store = DeterministicStore::new();
        let waiter = Arc::clone(&store);
        let task = tokio::spawn(async move { waiter.wait_for_change("k", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.acquire_if_absent("k", "a", Duration::from_secs(10)).await.unwrap();

        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_for_change_times_out() {
        let store = DeterministicStore::new();
        assert!(!store.wait_for_change("k", Duration::from_millis(30)).await.unwrap());
    }

    #[tokio::test]
    async fn list_ops_round_trip() {
        let store = DeterministicStore::new();
        store.list_push_back("l", b"a".to_vec()).await.unwrap();
        store.list_push_back("l", b"b".to_vec()).await.unwrap();
        store.list_push_back("l", b"a".to_vec()).await.unwrap();

        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(store.list_get("l", -1).await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.list_range("l", 0, -1).await.unwrap().len(), 3);

        assert_eq!(store.list_remove("l", b"a", 1).await.unwrap(), 1);
        assert_eq!(store.list_pop_front("l").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.list_pop_front("l").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.list_pop_front("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let store = DeterministicStore::new();
        let consumer = Arc::clone(&store);
        let task =
            tokio::spawn(async move { consumer.list_pop_front_timeout("q", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.list_push_back("q", b"job".to_vec()).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Some(b"job".to_vec()));
    }

    #[tokio::test]
    async fn counter_key_rejects_lease_ops() {
        let store = DeterministicStore::new();
        store.atomic_adjust("c", 1, AdjustBounds::new(0, 10)).await.unwrap();
        let err = store.release_if_owner("c", "a").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
    }
}
