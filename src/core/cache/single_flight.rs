//! At-most-one concurrent computation per key
//!
//! The in-flight table only holds weak references. The computation itself is
//! owned by its waiters through `Shared`, so when the last waiter goes away
//! the computation is dropped with it.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

use crate::errors::EngineError;

type Flight<V, E> = BoxFuture<'static, Result<V, E>>;

/// How a caller obtained its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Found in the backing cache
    Cached,
    /// Started the computation
    Leader,
    /// Joined a computation started by another caller
    Follower,
}

/// Coalesces concurrent computations of the same key.
///
/// Every waiter receives a clone of the same result, errors included.
pub struct SingleFlight<K, V, E = EngineError>
where
    K: Eq + Hash,
{
    inflight: Arc<DashMap<K, (u64, WeakShared<Flight<V, E>>)>>,
    next_id: AtomicU64,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Return the cached value, join an in-flight computation, or start one.
    ///
    /// `cached` is consulted while the key's slot is locked, so a computation
    /// that finished (and published its value) just before this call is never
    /// repeated. `start` must publish its value to the cache before resolving.
    pub async fn run<C, S>(&self, key: &K, cached: C, start: S) -> (Result<V, E>, FlightRole)
    where
        C: FnOnce() -> Option<V>,
        S: FnOnce() -> Flight<V, E>,
    {
        let (flight, role) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().1.upgrade() {
                Some(flight) => (flight, FlightRole::Follower),
                None => {
                    // Every waiter of the previous computation went away
                    if let Some(value) = cached() {
                        occupied.remove();
                        return (Ok(value), FlightRole::Cached);
                    }
                    let (id, flight) = self.launch(key.clone(), start);
                    if let Some(weak) = flight.downgrade() {
                        occupied.insert((id, weak));
                    }
                    (flight, FlightRole::Leader)
                }
            },
            Entry::Vacant(vacant) => {
                if let Some(value) = cached() {
                    return (Ok(value), FlightRole::Cached);
                }
                let (id, flight) = self.launch(key.clone(), start);
                if let Some(weak) = flight.downgrade() {
                    vacant.insert((id, weak));
                }
                (flight, FlightRole::Leader)
            }
        };

        (flight.await, role)
    }

    fn launch<S>(&self, key: K, start: S) -> (u64, Shared<Flight<V, E>>)
    where
        S: FnOnce() -> Flight<V, E>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inflight = self.inflight.clone();
        let computation = start();

        let flight: Flight<V, E> = async move {
            let result = computation.await;
            inflight.remove_if(&key, |_, (entry_id, _)| *entry_id == id);
            result
        }
        .boxed();

        (id, flight.shared())
    }

    /// Number of keys with a live computation
    pub fn in_flight(&self) -> usize {
        self.inflight
            .iter()
            .filter(|entry| entry.value().1.upgrade().is_some())
            .count()
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
