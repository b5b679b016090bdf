//! Request coalescing: concurrent misses on one key share a single computation.
//!
//! The first caller for a key becomes the leader and runs the computation;
//! later callers wait on a watch channel for its result. A follower that waits
//! past its deadline, or whose leader is dropped before finishing, computes on
//! its own instead of failing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::entry::CacheKey;

type Slot<T, E> = Option<Result<T, E>>;

/// How a caller obtained its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Ran the computation.
    Leader,
    /// Received the leader's result.
    Follower,
    /// Gave up waiting and computed independently.
    Fallback,
}

pub struct SingleFlight<T, E> {
    inflight: Mutex<HashMap<CacheKey, (u64, watch::Receiver<Slot<T, E>>)>>,
    next_id: AtomicU64,
}

/// Removes the leader's registration however the leader exits.
struct FlightGuard<'a, T, E> {
    flights: &'a SingleFlight<T, E>,
    key: CacheKey,
    id: u64,
}

impl<T, E> Drop for FlightGuard<'_, T, E> {
    fn drop(&mut self) {
        let mut inflight = self.flights.inflight.lock();
        if inflight.get(&self.key).map(|(id, _)| *id) == Some(self.id) {
            inflight.remove(&self.key);
        }
    }
}

impl<T, E> Default for SingleFlight<T, E> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a computation in progress.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `compute` for `key` unless another caller already is, in which case
    /// wait up to `wait` for that caller's result.
    pub async fn run<F, Fut>(&self, key: &CacheKey, wait: Duration, compute: F) -> (Result<T, E>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let joined = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, rx)) => Ok(rx.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), (id, rx));
                    Err((id, tx))
                }
            }
        };

        match joined {
            Err((id, tx)) => {
                let _guard = FlightGuard {
                    flights: self,
                    key: key.clone(),
                    id,
                };
                let result = compute().await;
                // No receivers left is fine.
                let _ = tx.send(Some(result.clone()));
                (result, Role::Leader)
            }
            Ok(mut rx) => {
                let waited = tokio::time::timeout(wait, async {
                    match rx.wait_for(|slot| slot.is_some()).await {
                        Ok(slot) => (*slot).clone(),
                        Err(_) => None,
                    }
                })
                .await;

                match waited {
                    Ok(Some(result)) => (result, Role::Follower),
                    Ok(None) => {
                        debug!(key = %key, "Coalesced leader abandoned, computing locally");
                        (compute().await, Role::Fallback)
                    }
                    Err(_) => {
                        warn!(key = %key, wait_ms = wait.as_millis() as u64, "Coalesced wait timed out, computing locally");
                        (compute().await, Role::Fallback)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn key() -> CacheKey {
        CacheKey::for_request("m", "same prompt")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let flights: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run(&key(), Duration::from_secs(5), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("value".to_string())
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (result, role) = handle.await.unwrap();
            assert_eq!(result.unwrap(), "value");
            if role == Role::Leader {
                leaders += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_leader_error_is_shared() {
        let flights: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(&key(), Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<String, _>("upstream down".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (result, role) = flights
            .run(&key(), Duration::from_secs(5), || async { Ok("unused".to_string()) })
            .await;
        assert_eq!(role, Role::Follower);
        assert_eq!(result.unwrap_err(), "upstream down");
        assert!(leader.await.unwrap().0.is_err());
    }

    #[tokio::test]
    async fn test_follower_falls_back_after_timeout() {
        let flights: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let slow = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(&key(), Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok::<_, String>("slow".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (result, role) = flights
            .run(&key(), Duration::from_millis(30), || async { Ok("fast".to_string()) })
            .await;
        assert_eq!(role, Role::Fallback);
        assert_eq!(result.unwrap(), "fast");
        slow.abort();
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_followers() {
        let flights: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(&key(), Duration::from_secs(5), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, String>("never".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(&key(), Duration::from_secs(5), || async { Ok("mine".to_string()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let (result, role) = follower.await.unwrap();
        assert_eq!(role, Role::Fallback);
        assert_eq!(result.unwrap(), "mine");
        assert_eq!(flights.in_flight(), 0);
    }
}
