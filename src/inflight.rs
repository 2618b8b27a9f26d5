//! Coalescing of concurrent manifest fetches for the same key.
//!
//! The first request for a key becomes the leader and holds a
//! [`FlightGuard`]; later requests become followers and wait until the guard
//! is dropped. The leader fills the cache before dropping the guard, so a
//! follower that wakes up, or a request arriving afterwards, reads the fresh
//! entry instead of fetching again.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone, Debug, Default)]
pub struct InFlight {
    pending: Arc<DashMap<String, broadcast::Sender<()>>>,
}

pub enum Flight {
    /// First request for this key; responsible for fetching.
    Leader(FlightGuard),
    /// Another request is already fetching; wait on [`Follower::wait`].
    Follower(Follower),
}

/// Removes the key on drop, waking every follower. Runs on success, error,
/// panic and cancellation alike.
pub struct FlightGuard {
    key: String,
    pending: Arc<DashMap<String, broadcast::Sender<()>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

pub struct Follower {
    rx: broadcast::Receiver<()>,
}

impl Follower {
    /// Resolves once the leader has finished.
    pub async fn wait(mut self) {
        // Nothing is ever sent; the channel closes when the leader's sender
        // is dropped with the map entry.
        let _ = self.rx.recv().await;
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> Flight {
        match self.pending.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(1);
                vacant.insert(tx);
                Flight::Leader(FlightGuard {
                    key: key.to_string(),
                    pending: Arc::clone(&self.pending),
                })
            }
            Entry::Occupied(occupied) => Flight::Follower(Follower {
                rx: occupied.get().subscribe(),
            }),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_join_leads_second_follows() {
        let inflight = InFlight::new();
        let first = inflight.join("k");
        let second = inflight.join("k");

        assert!(matches!(first, Flight::Leader(_)));
        assert!(matches!(second, Flight::Follower(_)));
        assert_eq!(inflight.in_flight_count(), 1);
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        let inflight = InFlight::new();
        let _a = inflight.join("a");
        assert!(matches!(inflight.join("b"), Flight::Leader(_)));
    }

    #[test]
    fn dropping_guard_clears_key() {
        let inflight = InFlight::new();
        let leader = inflight.join("k");
        drop(leader);

        assert_eq!(inflight.in_flight_count(), 0);
        assert!(matches!(inflight.join("k"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn follower_wakes_when_leader_finishes() {
        let inflight = InFlight::new();
        let Flight::Leader(guard) = inflight.join("k") else {
            panic!("expected leader");
        };
        let Flight::Follower(follower) = inflight.join("k") else {
            panic!("expected follower");
        };

        let waiter = tokio::spawn(follower.wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("follower should wake")
            .unwrap();
    }
}
