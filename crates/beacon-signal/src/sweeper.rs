//! Periodic eviction of peers that stopped talking

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::registry::Registry;

/// Capability to terminate a peer's connection.
///
/// Returns true if the peer was still registered and has now been closed.
pub trait PeerCloser: Send + Sync {
    fn close_peer(&self, peer_id: &str) -> bool;
}

/// Evicts peers whose last inbound message is older than `idle_timeout`
pub struct IdleSweeper {
    registry: Arc<Registry>,
    closer: Arc<dyn PeerCloser>,
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(
        registry: Arc<Registry>,
        closer: Arc<dyn PeerCloser>,
        idle_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            closer,
            idle_timeout,
            interval,
        }
    }

    /// Run one sweep now
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    /// Run one sweep as if the clock read `now`. Returns the evicted ids.
    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let Some(threshold) = now.checked_sub(self.idle_timeout) else {
            return Vec::new();
        };

        self.registry
            .list_idle_before(threshold)
            .into_iter()
            .filter(|peer_id| {
                // A heartbeat may have landed since the listing
                let still_idle = self
                    .registry
                    .get(peer_id)
                    .is_some_and(|p| p.last_seen < threshold);
                still_idle && self.closer.close_peer(peer_id)
            })
            .inspect(|peer_id| info!("Peer {} evicted (idle timeout)", peer_id))
            .collect()
    }

    /// Sweep every `interval` until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = self.sweep();
                if !evicted.is_empty() {
                    info!(
                        "Idle sweep evicted {} peers, {} remain",
                        evicted.len(),
                        self.registry.len()
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerHandle, PeerMailbox};
    use parking_lot::Mutex;

    /// Removes peers directly and records what it was asked to close
    struct RecordingCloser {
        registry: Arc<Registry>,
        closed: Mutex<Vec<String>>,
    }

    impl PeerCloser for RecordingCloser {
        fn close_peer(&self, peer_id: &str) -> bool {
            self.closed.lock().push(peer_id.to_owned());
            self.registry.remove(peer_id).is_some()
        }
    }

    fn setup(timeout: Duration) -> (Arc<Registry>, Arc<RecordingCloser>, IdleSweeper) {
        let registry = Arc::new(Registry::new());
        let closer = Arc::new(RecordingCloser {
            registry: registry.clone(),
            closed: Mutex::new(Vec::new()),
        });
        let sweeper = IdleSweeper::new(
            registry.clone(),
            closer.clone(),
            timeout,
            Duration::from_secs(1),
        );
        (registry, closer, sweeper)
    }

    fn add(registry: &Registry) -> (String, PeerMailbox) {
        let (handle, mailbox) = PeerHandle::channel(4);
        let id = registry
            .register(handle, "127.0.0.1:9000".parse().unwrap(), None)
            .unwrap();
        (id, mailbox)
    }

    #[test]
    fn test_stale_peer_evicted_fresh_peer_kept() {
        let (registry, closer, sweeper) = setup(Duration::from_secs(60));
        let (stale, _a) = add(&registry);
        let (fresh, _b) = add(&registry);

        let base = Instant::now();
        registry.touch_at(&stale, base);
        registry.touch_at(&fresh, base + Duration::from_secs(50));

        let evicted = sweeper.sweep_at(base + Duration::from_secs(61));
        assert_eq!(evicted, vec![stale.clone()]);
        assert!(!registry.contains(&stale));
        assert!(registry.contains(&fresh));
        assert_eq!(*closer.closed.lock(), vec![stale]);
    }

    #[test]
    fn test_nothing_evicted_within_timeout() {
        let (registry, closer, sweeper) = setup(Duration::from_secs(60));
        let (_a, _ma) = add(&registry);
        let (_b, _mb) = add(&registry);

        assert!(sweeper.sweep().is_empty());
        assert!(sweeper.sweep_at(Instant::now() + Duration::from_secs(30)).is_empty());
        assert_eq!(registry.len(), 2);
        assert!(closer.closed.lock().is_empty());
    }

    #[test]
    fn test_peer_gone_before_close_tolerated() {
        struct AlreadyGone;
        impl PeerCloser for AlreadyGone {
            fn close_peer(&self, _peer_id: &str) -> bool {
                false
            }
        }

        let registry = Arc::new(Registry::new());
        let (_a, _ma) = add(&registry);
        let sweeper = IdleSweeper::new(
            registry.clone(),
            Arc::new(AlreadyGone),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let evicted = sweeper.sweep_at(Instant::now() + Duration::from_secs(5));
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_evicts() {
        let (registry, closer, _) = setup(Duration::ZERO);
        let (stale, _ma) = add(&registry);

        let sweeper = IdleSweeper::new(
            registry.clone(),
            closer.clone(),
            Duration::ZERO,
            Duration::from_millis(20),
        );
        let task = sweeper.spawn();

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.contains(&stale) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer was not evicted");

        task.abort();
        assert_eq!(*closer.closed.lock(), vec![stale]);
    }
}
