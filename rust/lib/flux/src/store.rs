use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::trie::Trie;
use crate::value::{StateValue, SubscriptionId};

/// Change callback. `None` means the path was removed.
pub type ChangeHandler = Arc<dyn Fn(&str, Option<&StateValue>) + Send + Sync>;

/// Path-addressed store of published view snapshots.
///
/// Controllers publish what they render (`feed/posts`,
/// `chat/{user_id}/messages`, ...) and the UI layer subscribes with trie
/// patterns. Handlers run synchronously on the publishing thread, after
/// the value lock is released.
pub struct StateStore {
    values: RwLock<BTreeMap<String, StateValue>>,
    handlers: Trie<HandlerEntry>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct HandlerEntry {
    id: SubscriptionId,
    handler: ChangeHandler,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(BTreeMap::new()),
            handlers: Trie::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish `value` at `path` and notify matching subscribers.
    pub fn set<T: Any + Send + Sync>(&self, path: &str, value: T) {
        self.set_value(path, StateValue::new(value));
    }

    pub fn set_value(&self, path: &str, value: StateValue) {
        self.write().insert(path.to_string(), value.clone());
        self.notify(path, Some(&value));
    }

    pub fn get(&self, path: &str) -> Option<StateValue> {
        self.read().get(path).cloned()
    }

    /// Read and clone a typed snapshot.
    pub fn get_as<T: Any + Clone>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|v| v.get::<T>())
    }

    /// Remove `path`, notifying subscribers if it existed.
    pub fn remove(&self, path: &str) -> Option<StateValue> {
        let old = self.write().remove(path);
        if old.is_some() {
            self.notify(path, None);
        }
        old
    }

    /// Remove `prefix` itself and everything below it. Returns the number
    /// of removed paths.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let child_prefix = format!("{}/", prefix);
        let removed: Vec<String> = {
            let mut values = self.write();
            let keys: Vec<String> = values
                .keys()
                .filter(|k| k.as_str() == prefix || k.starts_with(&child_prefix))
                .cloned()
                .collect();
            for key in &keys {
                values.remove(key);
            }
            keys
        };
        for path in &removed {
            self.notify(path, None);
        }
        removed.len()
    }

    /// Drop every published value (sign-out).
    pub fn clear(&self) -> usize {
        let removed: Vec<String> = {
            let mut values = self.write();
            let keys = values.keys().cloned().collect();
            values.clear();
            keys
        };
        for path in &removed {
            self.notify(path, None);
        }
        removed.len()
    }

    /// Children of `prefix` (not `prefix` itself), ordered by path.
    pub fn scan(&self, prefix: &str) -> Vec<(String, StateValue)> {
        let scan_prefix = format!("{}/", prefix);
        self.read()
            .range(scan_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&scan_prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.read().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Subscribe to changes on paths matching `pattern`.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&StateValue>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(
            pattern,
            HandlerEntry {
                id,
                handler: Arc::new(handler),
            },
        );
        id
    }

    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> bool {
        self.handlers.remove(pattern, |entry| entry.id == id)
    }

    fn notify(&self, path: &str, value: Option<&StateValue>) {
        let entries = self.handlers.match_topic(path);
        trace!(path, subscribers = entries.len(), "state changed");
        for entry in entries {
            (entry.handler)(path, value);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StateValue>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StateValue>> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A group of subscriptions released together when dropped.
///
/// A view layer holds one per screen so that leaving the screen stops
/// its callbacks.
pub struct SubscriptionScope {
    store: Arc<StateStore>,
    entries: Vec<(String, SubscriptionId)>,
}

impl SubscriptionScope {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            entries: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&StateValue>) + Send + Sync + 'static,
    {
        let id = self.store.subscribe(pattern, handler);
        self.entries.push((pattern.to_string(), id));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for SubscriptionScope {
    fn drop(&mut self) {
        for (pattern, id) in self.entries.drain(..) {
            self.store.unsubscribe(&pattern, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    // ========================================================================
    // Basic get/set
    // ========================================================================

    #[test]
    fn set_and_get_as() {
        let store = StateStore::new();
        store.set("feed/page", 2u32);
        assert_eq!(store.get_as::<u32>("feed/page"), Some(2));
        assert_eq!(store.get_as::<String>("feed/page"), None);
        assert!(store.get("feed/missing").is_none());
    }

    #[test]
    fn set_overwrites() {
        let store = StateStore::new();
        store.set("app/page", "feed".to_string());
        store.set("app/page", "shorts".to_string());
        assert_eq!(store.get_as::<String>("app/page").as_deref(), Some("shorts"));
        assert_eq!(store.len(), 1);
    }

    // ========================================================================
    // Remove / clear
    // ========================================================================

    #[test]
    fn remove_notifies_with_none() {
        let store = StateStore::new();
        let removed = Arc::new(Mutex::new(Vec::<String>::new()));
        let r = removed.clone();
        store.subscribe("#", move |path, value| {
            if value.is_none() {
                r.lock().unwrap().push(path.to_string());
            }
        });

        store.set("feed/posts", 1u32);
        assert!(store.remove("feed/posts").is_some());
        assert!(store.remove("feed/posts").is_none());
        assert_eq!(*removed.lock().unwrap(), vec!["feed/posts".to_string()]);
    }

    #[test]
    fn remove_prefix_drops_subtree_only() {
        let store = StateStore::new();
        store.set("chat/u1", 0u32);
        store.set("chat/u1/messages", 1u32);
        store.set("chat/u12/messages", 2u32);
        store.set("feed/posts", 3u32);

        assert_eq!(store.remove_prefix("chat/u1"), 2);
        assert!(store.contains("chat/u12/messages"));
        assert!(store.contains("feed/posts"));
    }

    #[test]
    fn clear_notifies_every_path() {
        let store = StateStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        store.set("auth/session", 1u32);
        store.set("feed/posts", 2u32);
        store.subscribe("#", move |_, value| {
            assert!(value.is_none());
            c.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    // ========================================================================
    // Scan
    // ========================================================================

    #[test]
    fn scan_children_in_order() {
        let store = StateStore::new();
        store.set("profile", 0u32);
        store.set("profile/b", 2u32);
        store.set("profile/a", 1u32);
        store.set("profiles/x", 9u32);

        let paths: Vec<String> = store.scan("profile").into_iter().map(|(k, _)| k).collect();
        assert_eq!(paths, vec!["profile/a".to_string(), "profile/b".to_string()]);
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    #[test]
    fn pattern_subscription_receives_value() {
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::<(String, u32)>::new()));
        let s = seen.clone();
        store.subscribe("chat/+/messages", move |path, value| {
            let n = value.and_then(|v| v.get::<u32>()).unwrap_or(0);
            s.lock().unwrap().push((path.to_string(), n));
        });

        store.set("chat/u1/messages", 3u32);
        store.set("chat/u1/typing", 1u32);

        assert_eq!(*seen.lock().unwrap(), vec![("chat/u1/messages".to_string(), 3)]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = StateStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = store.subscribe("feed/posts", move |_, _| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        store.set("feed/posts", 1u32);
        assert!(store.unsubscribe("feed/posts", id));
        store.set("feed/posts", 2u32);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn handler_may_read_store() {
        let store = Arc::new(StateStore::new());
        let inner = store.clone();
        let observed = Arc::new(Mutex::new(None::<u32>));
        let o = observed.clone();
        store.subscribe("feed/count", move |_, _| {
            *o.lock().unwrap() = inner.get_as::<u32>("feed/count");
        });

        store.set("feed/count", 5u32);
        assert_eq!(*observed.lock().unwrap(), Some(5));
    }

    #[test]
    fn scope_releases_on_drop() {
        let store = Arc::new(StateStore::new());
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut scope = SubscriptionScope::new(store.clone());
            let c = count.clone();
            scope.subscribe("profile/#", move |_, _| {
                c.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(scope.len(), 1);
            store.set("profile/u1", 1u32);
        }
        store.set("profile/u1", 2u32);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    fn _assert_store_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StateStore>();
    }
}
