use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use trafficredirect_controller_core::Nic;

/// An update to the NIC cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NicEvent {
    /// A NIC was created or changed.
    Applied(Nic),

    /// A NIC no longer exists.
    Deleted(String),

    /// The complete set of NICs, as observed by a full resync.
    Restarted(Vec<Nic>),
}

/// An in-memory snapshot of the platform's NICs, indexed by id.
///
/// Lookups only become authoritative once the cache has observed its first
/// full resync; see [`NicCache::synced`].
#[derive(Clone, Debug)]
pub struct NicCache {
    nics: Arc<RwLock<HashMap<String, Nic>>>,
    synced: Arc<watch::Sender<bool>>,
}

// === impl NicEvent ===

impl NicEvent {
    /// Describes where the event came from, for metrics.
    pub fn is_resync(&self) -> bool {
        matches!(self, Self::Restarted(_))
    }
}

// === impl NicCache ===

impl Default for NicCache {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            nics: Default::default(),
            synced: Arc::new(synced),
        }
    }
}

impl NicCache {
    pub fn get(&self, id: &str) -> Option<Nic> {
        self.nics.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Completes once the cache has observed a full resync.
    pub async fn synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender is owned by the cache, so this only fails if the cache
        // is dropped, which can't happen while it's borrowed.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Applies an event, returning the ids of all NICs that may have changed.
    ///
    /// A restart replaces the snapshot wholesale, so NICs that were missed by
    /// the change feed are dropped and their ids are returned as well.
    pub fn apply(&self, event: NicEvent) -> Vec<String> {
        match event {
            NicEvent::Applied(nic) => {
                let id = nic.id.clone();
                self.nics.write().insert(id.clone(), nic);
                vec![id]
            }

            NicEvent::Deleted(id) => {
                self.nics.write().remove(&id);
                vec![id]
            }

            NicEvent::Restarted(nics) => {
                let nics = nics
                    .into_iter()
                    .map(|nic| (nic.id.clone(), nic))
                    .collect::<HashMap<_, _>>();
                let mut ids = nics.keys().cloned().collect::<HashSet<_>>();

                let prior = std::mem::replace(&mut *self.nics.write(), nics);
                ids.extend(prior.into_keys());

                self.synced.send_replace(true);
                ids.into_iter().collect()
            }
        }
    }
}
