use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lodestone_core::time::SystemClock;
use lodestone_core::{
    Action, ChangeEvent, DomainProject, EventPayload, InstanceChangedEvent, QuotaKind,
    QuotaManager, RegistryStore, ServiceInstance,
};
use lodestone_db::SqliteStore;
use lodestone_discovery::{
    ConsumerResolver, DependencyEventHandler, EventDispatcher, EventHandler, EvictionReconciler,
    IndexCache, InstanceEventHandler, LivenessCache, NotificationFanout, NotifyCenter,
    RuleEventHandler, ServiceEventHandler, SyncQueue,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;

/// No quota backend: every request is granted.
struct UnlimitedQuota;

impl QuotaManager for UnlimitedQuota {
    fn release_instance_quota(&self, domain_project: &DomainProject) {
        tracing::debug!("released one instance quota of {}", domain_project);
    }

    fn apply_quota(
        &self,
        _kind: QuotaKind,
        _domain_project: &DomainProject,
        _service_id: &str,
        _count: i64,
    ) -> lodestone_core::Result<()> {
        Ok(())
    }
}

/// Every long-lived component of the process, created once at startup.
pub struct Registry {
    pub store: Arc<SqliteStore>,
    pub liveness: Arc<LivenessCache>,
    pub notify: Arc<NotifyCenter>,
    quota: Arc<dyn QuotaManager>,
    sync: Arc<SyncQueue>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Registry {
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.db)
                .with_context(|| format!("failed to open database {}", config.db))?,
        );
        Self::with_store(store, Arc::new(UnlimitedQuota), config).await
    }

    pub async fn with_store(
        store: Arc<SqliteStore>,
        quota: Arc<dyn QuotaManager>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let index = Arc::new(IndexCache::new());
        let notify = Arc::new(NotifyCenter::new(config.notify()));
        let sync = if config.sync_enabled {
            let (queue, rx) = SyncQueue::new(config.sync_queue_capacity);
            tracker.spawn(drain_sync_queue(rx, shutdown.clone()));
            Arc::new(queue)
        } else {
            Arc::new(SyncQueue::disabled())
        };

        let store_dyn: Arc<dyn RegistryStore> = store.clone();
        let consumers = Arc::new(ConsumerResolver::new(store_dyn.clone(), index.clone()));
        let fanout = Arc::new(NotificationFanout::new(notify.clone(), sync.clone()));
        let handlers: Vec<Arc<dyn EventHandler>> = vec![
            Arc::new(ServiceEventHandler),
            Arc::new(InstanceEventHandler::new(
                store_dyn.clone(),
                quota.clone(),
                consumers.clone(),
                fanout.clone(),
            )),
            Arc::new(RuleEventHandler::new(store_dyn.clone(), consumers, fanout)),
            Arc::new(DependencyEventHandler::new(index)),
        ];
        let dispatcher = Arc::new(EventDispatcher::start(handlers, shutdown.clone(), &tracker));

        replay_snapshot(store.as_ref(), &dispatcher)?;
        store.set_listener(dispatcher);

        let reconciler = Arc::new(EvictionReconciler::new(
            store_dyn,
            Arc::new(SystemClock),
            config.eviction_timeout(),
        ));
        let liveness = Arc::new(LivenessCache::new(config.liveness(), shutdown.clone()));
        liveness.start(reconciler, &tracker);

        let registry = Self {
            store,
            liveness,
            notify,
            quota,
            sync,
            shutdown,
            tracker,
        };
        registry.seed_liveness().await?;
        Ok(registry)
    }

    /// Tracks every persisted instance so leftovers of a previous run get reconciled.
    async fn seed_liveness(&self) -> anyhow::Result<()> {
        let instances = self.store.get_all_instances()?;
        let total = instances.len();
        for instance in instances {
            if let Err(e) = self
                .liveness
                .add_task(
                    instance.domain_project.clone(),
                    &instance.service_id,
                    &instance.instance_id,
                    instance.health_check.effective_ttl_secs(),
                )
                .await
            {
                tracing::warn!("failed to track instance {}: {}", instance.instance_id, e);
            }
        }
        tracing::info!("seeded liveness cache with {} instances", total);
        Ok(())
    }

    /// Charges `count` units of `kind` to a non-default tenant.
    pub fn apply_quota(
        &self,
        kind: QuotaKind,
        domain_project: &DomainProject,
        service_id: &str,
        count: i64,
    ) -> lodestone_core::Result<()> {
        if domain_project.is_default() {
            return Ok(());
        }
        self.quota.apply_quota(kind, domain_project, service_id, count)
    }

    /// Persists a new instance and starts tracking its heartbeats. The quota
    /// unit taken here is given back by the instance Delete handler.
    pub async fn register_instance(&self, instance: &ServiceInstance) -> lodestone_core::Result<()> {
        let dp = &instance.domain_project;
        self.apply_quota(QuotaKind::Instance, dp, &instance.service_id, 1)?;
        if let Err(e) = self.store.add_instance(instance) {
            if !dp.is_default() {
                self.quota.release_instance_quota(dp);
            }
            return Err(e);
        }
        self.liveness
            .add_task(
                dp.clone(),
                &instance.service_id,
                &instance.instance_id,
                instance.health_check.effective_ttl_secs(),
            )
            .await
    }

    /// Stops intake, then waits up to `grace` for workers, reapers and
    /// in-flight evictions. Returns whether everything stopped in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.notify.close();
        self.sync.close();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "{} background tasks still running after {:?}",
                self.tracker.len(),
                grace
            );
            return false;
        }
        tracing::info!("background tasks stopped");
        true
    }
}

/// Pushes the current store content through the handlers as `Init` events.
fn replay_snapshot(store: &SqliteStore, dispatcher: &EventDispatcher) -> anyhow::Result<()> {
    let revision = store.revision()?;
    let init = |payload| dispatcher.dispatch(ChangeEvent::new(Action::Init, revision, payload));

    let services = store.get_all_services()?;
    let instances = store.get_all_instances()?;
    let dependencies = store.get_all_dependencies()?;
    tracing::info!(
        "replaying {} services, {} instances, {} dependencies at revision {}",
        services.len(),
        instances.len(),
        dependencies.len(),
        revision
    );
    for service in services {
        for rule in store.get_rules(&service.service_id)? {
            init(EventPayload::Rule(rule));
        }
        init(EventPayload::Service(service));
    }
    for instance in instances {
        init(EventPayload::Instance(instance));
    }
    for dependency in dependencies {
        init(EventPayload::Dependency(dependency));
    }
    Ok(())
}

/// Stand-in peer for cluster sync: the events are only logged.
async fn drain_sync_queue(mut rx: mpsc::Receiver<InstanceChangedEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => tracing::debug!(
                    "sync [{}] {}",
                    event.action,
                    event.instance_key()
                ),
                None => break,
            },
        }
    }
}
