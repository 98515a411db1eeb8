//! Heartbeat TTL tracking.
//!
//! Heartbeats are enqueued onto a bounded queue drained by a fixed worker
//! pool. Each worker upserts the instance's entry and pushes a fresh deadline
//! onto an expiry min-heap. A reaper task polls the heap on a tick and hands
//! every entry whose deadline passed without a newer refresh to the
//! [`EvictionReconciler`], each on its own task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use lodestone_core::{DEFAULT_TTL_SECS, DomainProject, RegistryError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics as m;
use crate::reconciler::{EvictionReconciler, Reconciled};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Worker pool size, 0 means available parallelism.
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long `add_task` may wait on a full queue.
    pub enqueue_timeout: Duration,
    pub default_ttl_secs: i64,
    /// Reaper polling period.
    pub reap_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 10_000,
            enqueue_timeout: Duration::from_secs(10),
            default_ttl_secs: DEFAULT_TTL_SECS,
            reap_interval: Duration::from_secs(1),
        }
    }
}

impl LivenessConfig {
    /// The configured fallback ttl, or the built-in one when that is not positive.
    pub fn default_ttl(&self) -> i64 {
        if self.default_ttl_secs > 0 {
            self.default_ttl_secs
        } else {
            DEFAULT_TTL_SECS
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// An instance believed alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub domain_project: DomainProject,
    pub service_id: String,
    pub instance_id: String,
    pub ttl_secs: i64,
    pub last_refresh: Instant,
}

impl LivenessRecord {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.unsigned_abs())
    }
}

struct Entry {
    record: LivenessRecord,
    deadline: Instant,
    generation: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    expiries: BinaryHeap<Reverse<(Instant, u64, String)>>,
    next_generation: u64,
}

impl State {
    fn schedule(&mut self, record: LivenessRecord, deadline: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.expiries
            .push(Reverse((deadline, generation, record.instance_id.clone())));
        self.entries.insert(
            record.instance_id.clone(),
            Entry {
                record,
                deadline,
                generation,
            },
        );
    }
}

pub struct LivenessCache {
    config: LivenessConfig,
    tx: mpsc::Sender<LivenessRecord>,
    rx: Mutex<Option<mpsc::Receiver<LivenessRecord>>>,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl LivenessCache {
    pub fn new(config: LivenessConfig, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(State::default()),
            shutdown,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Enqueues a heartbeat. Fails with `HeartbeatTimeout` if the queue stays
    /// full past the configured deadline; never retries.
    pub async fn add_task(
        &self,
        domain_project: DomainProject,
        service_id: &str,
        instance_id: &str,
        ttl_secs: i64,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }

        let ttl_secs = if ttl_secs <= 0 {
            self.config.default_ttl()
        } else {
            ttl_secs
        };
        let record = LivenessRecord {
            domain_project,
            service_id: service_id.to_string(),
            instance_id: instance_id.to_string(),
            ttl_secs,
            last_refresh: Instant::now(),
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RegistryError::ShuttingDown),
            sent = self.tx.send_timeout(record, self.config.enqueue_timeout) => match sent {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(record)) => {
                    warn!(
                        "heartbeat queue is full, instance {}/{} rejected",
                        record.service_id, record.instance_id
                    );
                    m::heartbeat_rejected();
                    Err(RegistryError::HeartbeatTimeout)
                }
                Err(SendTimeoutError::Closed(_)) => Err(RegistryError::ShuttingDown),
            },
        }
    }

    /// Forgets an instance without touching the store.
    pub fn remove_cache_instance(&self, instance_id: &str) -> bool {
        self.state.lock().entries.remove(instance_id).is_some()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.state.lock().entries.contains_key(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<LivenessRecord> {
        self.state
            .lock()
            .entries
            .get(instance_id)
            .map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upserts the entry and resets its expiry to the record's ttl.
    fn refresh(&self, record: LivenessRecord) {
        let deadline = Instant::now() + record.ttl();
        debug!(
            "refresh instance {}/{}, ttl {}s",
            record.service_id, record.instance_id, record.ttl_secs
        );
        self.state.lock().schedule(record, deadline);
    }

    /// Re-tracks a record the reconciler found still live, unless a newer
    /// heartbeat already did.
    pub fn rearm(&self, record: LivenessRecord, remaining: Duration) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(&record.instance_id) {
            return false;
        }
        state.schedule(record, Instant::now() + remaining);
        true
    }

    /// Pops every entry whose deadline is at or before `now` and that was not
    /// refreshed since it was scheduled.
    fn take_expired(&self, now: Instant) -> Vec<LivenessRecord> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _, _))) = state.expiries.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, generation, instance_id))) = state.expiries.pop() else {
                break;
            };
            let current = state
                .entries
                .get(&instance_id)
                .is_some_and(|e| e.generation == generation && e.deadline <= now);
            if current {
                if let Some(entry) = state.entries.remove(&instance_id) {
                    expired.push(entry.record);
                }
            }
        }
        expired
    }

    /// Spawns the worker pool and the reaper onto `tracker`.
    pub fn start(self: &Arc<Self>, reconciler: Arc<EvictionReconciler>, tracker: &TaskTracker) {
        let Some(rx) = self.rx.lock().take() else {
            warn!("liveness cache already started");
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = self.config.worker_count();
        info!(
            "starting {} heartbeat workers (queue capacity {})",
            workers, self.config.queue_capacity
        );
        for worker in 0..workers {
            let cache = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tracker.spawn(async move { cache.run_worker(worker, rx).await });
        }

        let cache = Arc::clone(self);
        let spawner = tracker.clone();
        tracker.spawn(async move { cache.run_reaper(reconciler, spawner).await });
    }

    async fn run_worker(
        &self,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LivenessRecord>>>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                next = async { rx.lock().await.recv().await } => next,
            };
            match next {
                Some(record) => self.refresh(record),
                None => break,
            }
        }
        debug!("heartbeat worker {} exit", worker);
    }

    async fn run_reaper(self: Arc<Self>, reconciler: Arc<EvictionReconciler>, spawner: TaskTracker) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for record in self.take_expired(Instant::now()) {
                let cache = Arc::clone(&self);
                let reconciler = Arc::clone(&reconciler);
                spawner.spawn(async move { cache.evict(&reconciler, record).await });
            }
        }
        debug!("liveness reaper exit");
    }

    async fn evict(&self, reconciler: &EvictionReconciler, record: LivenessRecord) {
        match reconciler.reconcile(&record).await {
            Ok(Reconciled::Evicted) => {
                info!(
                    "evicted stale instance {}/{} of {}",
                    record.service_id, record.instance_id, record.domain_project
                );
            }
            Ok(Reconciled::Alive { remaining }) => {
                if self.rearm(record.clone(), remaining) {
                    debug!(
                        "instance {}/{} still alive, rearmed for {:?}",
                        record.service_id, record.instance_id, remaining
                    );
                }
            }
            Ok(Reconciled::Gone) => {
                debug!(
                    "instance {}/{} already removed from store",
                    record.service_id, record.instance_id
                );
            }
            Err(e) => {
                error!(
                    "failed to clean instance {}/{}: {}",
                    record.service_id, record.instance_id, e
                );
                // checked again at the next expiry, not retried now
                let ttl = record.ttl();
                self.rearm(record, ttl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStore, instance_with_ttl};
    use lodestone_core::RegistryStore;
    use lodestone_core::time::SystemClock;

    fn config(capacity: usize, timeout: Duration) -> LivenessConfig {
        LivenessConfig {
            workers: 2,
            queue_capacity: capacity,
            enqueue_timeout: timeout,
            default_ttl_secs: 30,
            reap_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_add_task_times_out_when_queue_full() {
        // never started: no worker drains the queue
        let cache = LivenessCache::new(
            config(2, Duration::from_millis(100)),
            CancellationToken::new(),
        );
        let dp = DomainProject::default();
        cache.add_task(dp.clone(), "svc", "i1", 5).await.unwrap();
        cache.add_task(dp.clone(), "svc", "i2", 5).await.unwrap();

        let started = std::time::Instant::now();
        let err = cache.add_task(dp, "svc", "i3", 5).await.unwrap_err();
        assert_eq!(err, RegistryError::HeartbeatTimeout);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_add_task_after_shutdown() {
        let token = CancellationToken::new();
        let cache = LivenessCache::new(config(4, Duration::from_millis(50)), token.clone());
        token.cancel();
        let err = cache
            .add_task(DomainProject::default(), "svc", "i1", 5)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_workers_upsert_entries_and_normalize_ttl() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(EvictionReconciler::new(
            store,
            Arc::new(SystemClock),
            Duration::from_secs(1),
        ));
        let cache = Arc::new(LivenessCache::new(
            config(16, Duration::from_millis(100)),
            token.clone(),
        ));
        cache.start(reconciler, &tracker);

        cache
            .add_task(DomainProject::default(), "svc", "i1", 0)
            .await
            .unwrap();
        cache
            .add_task(DomainProject::default(), "svc", "i2", 7)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("i1").map(|r| r.ttl_secs), Some(30));
        assert_eq!(cache.get("i2").map(|r| r.ttl_secs), Some(7));

        assert!(cache.remove_cache_instance("i1"));
        assert!(!cache.contains("i1"));
        assert!(!cache.remove_cache_instance("i1"));

        token.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_positive_default_ttl_falls_back() {
        let mut config = config(4, Duration::from_millis(50));
        config.default_ttl_secs = 0;
        assert_eq!(config.default_ttl(), DEFAULT_TTL_SECS);
        config.default_ttl_secs = -5;
        assert_eq!(config.default_ttl(), DEFAULT_TTL_SECS);

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let reconciler = Arc::new(EvictionReconciler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            Duration::from_secs(1),
        ));
        let cache = Arc::new(LivenessCache::new(config, token.clone()));
        cache.start(reconciler, &tracker);
        cache
            .add_task(DomainProject::default(), "svc", "i1", 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("i1").map(|r| r.ttl_secs), Some(DEFAULT_TTL_SECS));

        token.cancel();
    }

    #[test]
    fn test_take_expired_skips_refreshed_entries() {
        let cache = LivenessCache::new(LivenessConfig::default(), CancellationToken::new());
        let record = LivenessRecord {
            domain_project: DomainProject::default(),
            service_id: "svc".into(),
            instance_id: "i1".into(),
            ttl_secs: 1,
            last_refresh: Instant::now(),
        };
        let now = Instant::now();
        {
            let mut state = cache.state.lock();
            state.schedule(record.clone(), now);
            // a newer heartbeat pushes the deadline out
            state.schedule(record, now + Duration::from_secs(60));
        }
        assert!(cache.take_expired(now).is_empty());
        assert!(cache.contains("i1"));
        assert_eq!(cache.take_expired(now + Duration::from_secs(61)).len(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_instance_is_evicted() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let store = Arc::new(MemoryStore::new());
        let inst = instance_with_ttl("svc", 1, lodestone_core::time::now());
        store.add_instance(&inst).unwrap();

        let reconciler = Arc::new(EvictionReconciler::new(
            store.clone(),
            Arc::new(SystemClock),
            Duration::from_secs(1),
        ));
        let cache = Arc::new(LivenessCache::new(
            config(16, Duration::from_millis(100)),
            token.clone(),
        ));
        cache.start(reconciler, &tracker);
        cache
            .add_task(inst.domain_project.clone(), &inst.service_id, &inst.instance_id, 1)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(store.get_instance(&inst.key()).unwrap_err().is_not_found());
        assert!(!cache.contains(&inst.instance_id));

        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refreshed_record_survives_timer() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let store = Arc::new(MemoryStore::new());
        let inst = instance_with_ttl("svc", 1, lodestone_core::time::now());
        store.add_instance(&inst).unwrap();

        let reconciler = Arc::new(EvictionReconciler::new(
            store.clone(),
            Arc::new(SystemClock),
            Duration::from_secs(1),
        ));
        let cache = Arc::new(LivenessCache::new(
            config(16, Duration::from_millis(100)),
            token.clone(),
        ));
        cache.start(reconciler, &tracker);
        cache
            .add_task(inst.domain_project.clone(), &inst.service_id, &inst.instance_id, 1)
            .await
            .unwrap();

        // the persisted refresh moves forward behind the cache's back
        tokio::time::sleep(Duration::from_millis(600)).await;
        store
            .refresh_instance(&inst.key(), lodestone_core::time::now())
            .unwrap();

        // timer fires around 1s; the store says the record is 0.4s old
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(store.get_instance(&inst.key()).is_ok());
        assert!(cache.contains(&inst.instance_id), "record should be rearmed");

        token.cancel();
    }
}
