//! Stats hub.
//!
//! Decouples stats producers from consumers across four independent
//! categories: series-network, metadata-network, serializer, parallelism.
//! Producers push snapshots synchronously; every currently registered
//! callback for the category sees each snapshot exactly once.
//!
//! Each registry is a `RwLock` over a map keyed by a monotonically
//! increasing integer, so unregistration is O(1) and never disturbs other
//! subscribers' keys. Sends take the read lock — concurrent producers do not
//! serialize against each other — while registration and release take the
//! write lock. A panicking callback is caught and logged; the remaining
//! callbacks still run.
//!
//! The hub is a cheap cloneable handle meant to be created by application
//! startup code and passed to producers and consumers explicitly.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;

use crate::stats::{NetworkStats, ParallelismStats, SerializerStats};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_key: AtomicU64,
    subscribers: RwLock<HashMap<u64, Callback<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_key: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    fn insert(&self, callback: Callback<T>) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        write_lock(&self.subscribers).insert(key, callback);
        key
    }

    fn remove(&self, key: u64) {
        write_lock(&self.subscribers).remove(&key);
    }

    fn send(&self, category: &'static str, value: &T) {
        let subscribers = read_lock(&self.subscribers);
        for callback in subscribers.values() {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!("{category} stats subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct HubShared {
    series_network: Registry<NetworkStats>,
    metadata_network: Registry<NetworkStats>,
    serializer: Registry<SerializerStats>,
    parallelism: Registry<ParallelismStats>,
}

#[derive(Clone, Default)]
pub struct StatsHub {
    shared: Arc<HubShared>,
}

impl StatsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_series_network(
        &self,
        callback: impl Fn(&NetworkStats) + Send + Sync + 'static,
    ) -> Release {
        let key = self.shared.series_network.insert(Box::new(callback));
        let shared = Arc::clone(&self.shared);
        Release::new(move || shared.series_network.remove(key))
    }

    pub fn register_metadata_network(
        &self,
        callback: impl Fn(&NetworkStats) + Send + Sync + 'static,
    ) -> Release {
        let key = self.shared.metadata_network.insert(Box::new(callback));
        let shared = Arc::clone(&self.shared);
        Release::new(move || shared.metadata_network.remove(key))
    }

    pub fn register_serializer(
        &self,
        callback: impl Fn(&SerializerStats) + Send + Sync + 'static,
    ) -> Release {
        let key = self.shared.serializer.insert(Box::new(callback));
        let shared = Arc::clone(&self.shared);
        Release::new(move || shared.serializer.remove(key))
    }

    pub fn register_parallelism(
        &self,
        callback: impl Fn(&ParallelismStats) + Send + Sync + 'static,
    ) -> Release {
        let key = self.shared.parallelism.insert(Box::new(callback));
        let shared = Arc::clone(&self.shared);
        Release::new(move || shared.parallelism.remove(key))
    }

    pub fn send_series_network_stats(&self, stats: &NetworkStats) {
        self.shared.series_network.send("series network", stats);
    }

    pub fn send_metadata_network_stats(&self, stats: &NetworkStats) {
        self.shared.metadata_network.send("metadata network", stats);
    }

    pub fn send_serializer_stats(&self, stats: &SerializerStats) {
        self.shared.serializer.send("serializer", stats);
    }

    pub fn send_parallelism_stats(&self, stats: &ParallelismStats) {
        self.shared.parallelism.send("parallelism", stats);
    }
}

/// Removes one subscription when invoked.
///
/// Safe to call any number of times; every call after the first is a no-op.
/// Dropping a `Release` without calling it leaves the subscription active.
pub struct Release {
    released: AtomicBool,
    unregister: Box<dyn Fn() + Send + Sync>,
}

impl Release {
    fn new(unregister: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            released: AtomicBool::new(false),
            unregister: Box::new(unregister),
        }
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            (self.unregister)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SignalStats;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn every_registered_callback_sees_each_snapshot_once() {
        let hub = StatsHub::new();
        let counters: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let releases: Vec<Release> = counters
            .iter()
            .map(|c| {
                let c = Arc::clone(c);
                hub.register_series_network(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        hub.send_series_network_stats(&NetworkStats::default());
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        drop(releases);
    }

    #[test]
    fn releasing_one_subscription_leaves_the_others() {
        let hub = StatsHub::new();
        let kept = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let kept_cb = Arc::clone(&kept);
        let _keep = hub.register_serializer(move |_| {
            kept_cb.fetch_add(1, Ordering::SeqCst);
        });
        let removed_cb = Arc::clone(&removed);
        let release = hub.register_serializer(move |_| {
            removed_cb.fetch_add(1, Ordering::SeqCst);
        });

        hub.send_serializer_stats(&SerializerStats::default());
        release.release();
        hub.send_serializer_stats(&SerializerStats::default());

        assert_eq!(kept.load(Ordering::SeqCst), 2);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let hub = StatsHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        let release = hub.register_parallelism(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        release.release();
        release.release();
        release.release();
        hub.send_parallelism_stats(&ParallelismStats::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn categories_are_independent() {
        let hub = StatsHub::new();
        let series = Arc::new(AtomicUsize::new(0));
        let metadata = Arc::new(AtomicUsize::new(0));

        let series_cb = Arc::clone(&series);
        let _a = hub.register_series_network(move |_| {
            series_cb.fetch_add(1, Ordering::SeqCst);
        });
        let metadata_cb = Arc::clone(&metadata);
        let _b = hub.register_metadata_network(move |_| {
            metadata_cb.fetch_add(1, Ordering::SeqCst);
        });

        hub.send_series_network_stats(&NetworkStats::default());
        assert_eq!(series.load(Ordering::SeqCst), 1);
        assert_eq!(metadata.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_rest() {
        let hub = StatsHub::new();
        let _bad = hub.register_series_network(|_| panic!("subscriber bug"));
        let good = Arc::new(AtomicUsize::new(0));
        let good_cb = Arc::clone(&good);
        let _good = hub.register_series_network(move |_| {
            good_cb.fetch_add(1, Ordering::SeqCst);
        });

        hub.send_series_network_stats(&NetworkStats::default());
        hub.send_series_network_stats(&NetworkStats::default());
        assert_eq!(good.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_senders_and_registrations_are_safe() {
        let hub = StatsHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _base = hub.register_series_network(move |stats: &NetworkStats| {
            seen_cb.lock().unwrap().push(stats.series.sent);
        });

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let hub = hub.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let stats = NetworkStats {
                        series: SignalStats {
                            sent: t * 1_000 + i,
                            ..SignalStats::default()
                        },
                        ..NetworkStats::default()
                    };
                    hub.send_series_network_stats(&stats);
                    // Churn registrations while sends are in flight.
                    let release = hub.register_series_network(|_| {});
                    release.release();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("sender thread");
        }
        assert_eq!(seen.lock().unwrap().len(), 200);
    }
}
