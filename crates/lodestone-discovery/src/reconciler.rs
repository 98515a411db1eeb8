//! Verifies an expired liveness entry against the persisted record before
//! deleting it, so a heartbeat that raced the timer keeps the instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use lodestone_core::time::Clock;
use lodestone_core::{InstanceKey, RegistryError, RegistryStore, Result, StoreTransaction};
use tracing::{debug, error, warn};

use crate::liveness::LivenessRecord;
use crate::metrics as m;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Evicted,
    /// The persisted refresh is still inside its TTL window.
    Alive { remaining: Duration },
    /// Nothing left to delete.
    Gone,
}

/// Decides whether a running eviction may still commit. The caller abandons
/// it on timeout; the blocking body claims it right before committing.
/// Whichever side comes first wins.
#[derive(Debug, Default)]
pub struct CommitGate(AtomicU8);

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::SeqCst) == ABANDONED
    }

    /// False once the caller gave up.
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// False when the commit is already under way.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct EvictionReconciler {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl EvictionReconciler {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Runs read-verify-delete-commit off the async workers, bounded by the
    /// reconciler's own timeout. A timed-out eviction never commits.
    pub async fn reconcile(&self, record: &LivenessRecord) -> Result<Reconciled> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let key = InstanceKey::new(
            record.domain_project.clone(),
            record.service_id.clone(),
            record.instance_id.clone(),
        );
        let gate = Arc::new(CommitGate::new());
        let job_gate = Arc::clone(&gate);

        let mut job = tokio::task::spawn_blocking(move || {
            clean_instance(store.as_ref(), clock.as_ref(), &key, &job_gate)
        });
        let joined = match tokio::time::timeout(self.timeout, &mut job).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => {
                warn!(
                    "eviction of {}/{} exceeded {:?}",
                    record.service_id, record.instance_id, self.timeout
                );
                return Err(RegistryError::EvictionTimeout);
            }
            // already committing, report what actually happened
            Err(_) => job.await,
        };
        joined.map_err(|e| RegistryError::Internal(e.to_string()))?
    }
}

fn alive(instance: &lodestone_core::ServiceInstance, now: u64) -> Reconciled {
    Reconciled::Alive {
        remaining: Duration::from_millis(instance.remaining_ttl_millis(now)),
    }
}

/// Synchronous body of an eviction. Aborts without deleting once `gate` has
/// been abandoned.
pub fn clean_instance(
    store: &dyn RegistryStore,
    clock: &dyn Clock,
    key: &InstanceKey,
    gate: &CommitGate,
) -> Result<Reconciled> {
    let instance = match store.get_instance(key) {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => return Ok(Reconciled::Gone),
        Err(e) => {
            error!("failed to query instance {}: {}", key.instance_id, e);
            return Err(e);
        }
    };
    let now = clock.now_millis();
    if instance.is_live_at(now) {
        return Ok(alive(&instance, now));
    }
    if gate.is_abandoned() {
        return Err(RegistryError::EvictionTimeout);
    }

    let mut txn = store.begin()?;
    let verified = match txn.get_instance(key) {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => {
            txn.abort()?;
            return Ok(Reconciled::Gone);
        }
        Err(e) => return abort_with(txn, e),
    };
    let now = clock.now_millis();
    if verified.is_live_at(now) {
        txn.abort()?;
        return Ok(alive(&verified, now));
    }

    if gate.is_abandoned() {
        return abort_with(txn, RegistryError::EvictionTimeout);
    }
    if let Err(e) = txn.delete_instance(key) {
        error!("failed to remove instance {} in store: {}", key.instance_id, e);
        return abort_with(txn, e);
    }
    if !gate.claim() {
        debug!("eviction of {} abandoned before commit", key.instance_id);
        return abort_with(txn, RegistryError::EvictionTimeout);
    }
    txn.commit()?;
    m::instance_evicted();
    Ok(Reconciled::Evicted)
}

fn abort_with(txn: Box<dyn StoreTransaction + '_>, err: RegistryError) -> Result<Reconciled> {
    txn.abort()?;
    Err(err)
}
