//! Key derivation for store-held state.
//!
//! Every primitive namespaces its keys as `{namespace}:{primitive-type}:{name}`
//! so different primitive kinds sharing a name never collide.

/// Key for an exclusive lock lease.
pub fn lock_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:lock:{name}")
}

/// Key for a reader/writer lock's reader counter.
pub fn rwlock_readers_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:rwlock:{name}:readers")
}

/// Key for a reader/writer lock's writer lease.
pub fn rwlock_writer_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:rwlock:{name}:writer")
}

/// Key for a reader/writer lock's write-intent counter.
pub fn rwlock_intent_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:rwlock:{name}:intent")
}

/// Key for a semaphore's holder counter.
pub fn semaphore_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:semaphore:{name}")
}

/// Key for a rate limiter's token bucket.
pub fn limiter_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:limiter:{name}")
}

/// Key for a shared map.
pub fn map_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:map:{name}")
}

/// Key for a shared list.
pub fn list_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:list:{name}")
}

/// Key for a shared queue.
pub fn queue_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:queue:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_kinds_do_not_collide() {
        let lock = lock_key("app", "jobs");
        let sem = semaphore_key("app", "jobs");
        let limiter = limiter_key("app", "jobs");
        assert_ne!(lock, sem);
        assert_ne!(sem, limiter);
    }

    #[test]
    fn rwlock_keys_share_a_prefix() {
        assert_eq!(rwlock_readers_key("app", "cfg"), "app:rwlock:cfg:readers");
        assert_eq!(rwlock_writer_key("app", "cfg"), "app:rwlock:cfg:writer");
        assert_eq!(rwlock_intent_key("app", "cfg"), "app:rwlock:cfg:intent");
    }
}
