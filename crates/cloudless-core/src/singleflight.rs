//! At most one in-flight request per key.
//!
//! Concurrent callers for the same key await one shared future and all get a
//! clone of its output. The entry is removed as soon as that future
//! completes, so the next call after completion starts a fresh request.

use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// Request de-duplication table.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    inflight: DashMap<K, Shared<BoxFuture<'static, V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `make()` for `key`, or join the call already running for it.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::trace!("joining in-flight request");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let fut = make().boxed().shared();
                entry.insert(fut.clone());
                fut
            }
        };

        let output = shared.clone().await;
        self.inflight
            .remove_if(&key, |_, running| running.ptr_eq(&shared));
        output
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V: Clone> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}
