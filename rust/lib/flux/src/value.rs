use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A type-erased, reference-counted snapshot published to the store.
///
/// Clone is an atomic increment; readers never copy the snapshot.
#[derive(Clone)]
pub struct StateValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl StateValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow as `T`, or `None` if another type is stored.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Clone out as `T`.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }

    /// Whether two values share the same allocation.
    pub fn ptr_eq(&self, other: &StateValue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateValue")
            .field("type", &self.type_name)
            .finish()
    }
}

/// Handle returned by `StateStore::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Feed {
        post_ids: Vec<String>,
    }

    #[test]
    fn downcast_matches_stored_type_only() {
        let v = StateValue::new(3u32);
        assert_eq!(v.downcast_ref::<u32>(), Some(&3));
        assert_eq!(v.downcast_ref::<u64>(), None);
        assert!(v.is::<u32>());
    }

    #[test]
    fn get_clones_struct() {
        let v = StateValue::new(Feed {
            post_ids: vec!["p1".into()],
        });
        let feed: Feed = v.get().unwrap();
        assert_eq!(feed.post_ids, vec!["p1".to_string()]);
    }

    #[test]
    fn clone_shares_allocation() {
        let a = StateValue::new(vec![0u8; 1024]);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&StateValue::new(vec![0u8; 1024])));
    }

    #[test]
    fn debug_shows_type_name() {
        let v = StateValue::new(Feed { post_ids: vec![] });
        assert!(format!("{:?}", v).contains("Feed"));
    }
}
