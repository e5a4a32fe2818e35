//! Read-only object caches backed by reflector stores
//!
//! The reconcile loop and the periodic workers never list from the API
//! server; they read from these caches, which are kept current by the watch
//! feeds in `main`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::runtime::reflector::{Lookup, ObjectRef, Store};

/// Cache of cluster-scoped objects, keyed by name
pub trait ObjectCache<K>: Send + Sync {
    /// Look up an object by name
    fn get(&self, name: &str) -> Option<Arc<K>>;

    /// Snapshot of all cached objects
    fn list(&self) -> Vec<Arc<K>>;

    /// Whether the initial list has completed
    fn has_synced(&self) -> bool;
}

/// `ObjectCache` over a kube reflector store
pub struct StoreCache<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> StoreCache<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Wrap a reflector store; flips to synced once the store's initial
    /// list is ready.
    pub fn new(store: Store<K>) -> Self {
        let synced = Arc::new(AtomicBool::new(false));
        {
            let store = store.clone();
            let synced = Arc::clone(&synced);
            tokio::spawn(async move {
                if store.wait_until_ready().await.is_ok() {
                    synced.store(true, Ordering::Release);
                } else {
                    tracing::error!("reflector writer dropped before initial sync");
                }
            });
        }
        Self { store, synced }
    }
}

impl<K> ObjectCache<K> for StoreCache<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name))
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
