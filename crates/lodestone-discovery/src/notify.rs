//! Watch fan-out to local subscribers and the cluster-sync peer.
//!
//! Every push is bounded-queue-with-drop: a slow or full subscriber loses the
//! message and the others still receive theirs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lodestone_core::{
    Action, DomainProject, InstanceChangedEvent, PushError, Service, ServiceInstance, ServiceKey,
    SubscriberRegistry, SyncNotifier, WatchInstanceResponse, WatchSubscriber,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics as m;

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Per-subscriber delivery queue.
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { queue_capacity: 32 }
    }
}

/// A local watcher backed by a bounded channel.
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::Sender<WatchInstanceResponse>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WatchInstanceResponse>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4().to_string(),
                tx,
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl WatchSubscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    fn push(&self, response: WatchInstanceResponse) -> Result<(), PushError> {
        self.tx.try_send(response).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

type SubscriberKey = (DomainProject, String);

/// In-process subscriber registry keyed by (domainProject, consumerID).
pub struct NotifyCenter {
    config: NotifyConfig,
    subscribers: RwLock<HashMap<SubscriberKey, Vec<Arc<ChannelSubscriber>>>>,
    closed: AtomicBool,
}

impl NotifyCenter {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(
        &self,
        domain_project: DomainProject,
        consumer_id: impl Into<String>,
    ) -> (String, mpsc::Receiver<WatchInstanceResponse>) {
        let consumer_id = consumer_id.into();
        let (subscriber, rx) = ChannelSubscriber::new(self.config.queue_capacity);
        let id = subscriber.id.clone();
        info!("new watcher {} for consumer {}/{}", id, domain_project, consumer_id);
        self.subscribers
            .write()
            .entry((domain_project, consumer_id))
            .or_default()
            .push(Arc::new(subscriber));
        (id, rx)
    }

    pub fn unsubscribe(&self, domain_project: &DomainProject, consumer_id: &str, subscriber_id: &str) {
        let key = (domain_project.clone(), consumer_id.to_string());
        let mut subscribers = self.subscribers.write();
        if let Some(list) = subscribers.get_mut(&key) {
            list.retain(|s| s.id != subscriber_id);
            if list.is_empty() {
                subscribers.remove(&key);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().clear();
    }
}

impl SubscriberRegistry for NotifyCenter {
    fn resolve(&self, domain_project: &DomainProject, consumer_id: &str) -> Vec<Arc<dyn WatchSubscriber>> {
        let key = (domain_project.clone(), consumer_id.to_string());
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&key) else {
            return Vec::new();
        };
        list.retain(|s| !s.is_closed());
        let resolved: Vec<Arc<dyn WatchSubscriber>> = list
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn WatchSubscriber>)
            .collect();
        if list.is_empty() {
            subscribers.remove(&key);
        }
        resolved
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Bounded queue towards the cluster-sync peer.
pub struct SyncQueue {
    tx: mpsc::Sender<InstanceChangedEvent>,
    closed: AtomicBool,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InstanceChangedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// A queue nobody drains.
    pub fn disabled() -> Self {
        let (queue, _) = Self::new(1);
        queue.close();
        queue
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl SyncNotifier for SyncQueue {
    fn add_event(&self, event: InstanceChangedEvent) {
        let key = event.instance_key();
        match self.tx.try_send(event) {
            Ok(()) => debug!("queued instance change event for {}", key),
            Err(TrySendError::Full(_)) => {
                warn!("sync queue is full, drop instance change event for {}", key);
                m::sync_dropped();
            }
            Err(TrySendError::Closed(_)) => debug!("sync queue closed, drop {}", key),
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

pub struct NotificationFanout {
    subscribers: Arc<dyn SubscriberRegistry>,
    syncer: Arc<dyn SyncNotifier>,
}

impl NotificationFanout {
    pub fn new(subscribers: Arc<dyn SubscriberRegistry>, syncer: Arc<dyn SyncNotifier>) -> Self {
        Self {
            subscribers,
            syncer,
        }
    }

    pub fn closed(&self) -> bool {
        self.subscribers.closed()
    }

    /// Pushes a watch response to every subscriber of each consumer id.
    /// Returns the number of successful pushes.
    pub fn publish_instance_event(
        &self,
        action: Action,
        instance: &ServiceInstance,
        domain_project: &DomainProject,
        provider_key: &ServiceKey,
        subscriber_ids: &[String],
    ) -> usize {
        if subscriber_ids.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for consumer_id in subscriber_ids {
            for subscriber in self.subscribers.resolve(domain_project, consumer_id) {
                let response = WatchInstanceResponse {
                    action,
                    key: provider_key.clone(),
                    instance: instance.clone(),
                };
                match subscriber.push(response) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        error!(
                            "publish [{}] instance {} event to watcher {} of consumer {} failed: {}",
                            action,
                            instance.instance_id,
                            subscriber.id(),
                            consumer_id,
                            e
                        );
                        m::notify_dropped();
                    }
                }
            }
        }
        delivered
    }

    /// Best-effort hand-off to the sync peer; skipped while it reports closed.
    pub fn notify_syncer(&self, action: Action, service: &Service, instance: &ServiceInstance) {
        if self.syncer.closed() {
            return;
        }
        debug!(
            "instanceId : {} and serviceId : {} in sync notify",
            instance.instance_id, instance.service_id
        );
        self.syncer.add_event(InstanceChangedEvent {
            action,
            service: service.clone(),
            instance: instance.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingSync, instance_with_ttl};
    use std::sync::atomic::AtomicUsize;

    struct CountingRegistry {
        resolved: AtomicUsize,
    }

    impl SubscriberRegistry for CountingRegistry {
        fn resolve(&self, _: &DomainProject, _: &str) -> Vec<Arc<dyn WatchSubscriber>> {
            self.resolved.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn provider() -> Service {
        Service::new(DomainProject::default(), "shop", "cart", "1.0.0").with_id("provider")
    }

    #[test]
    fn test_no_subscribers_is_noop() {
        let registry = Arc::new(CountingRegistry {
            resolved: AtomicUsize::new(0),
        });
        let fanout = NotificationFanout::new(registry.clone(), Arc::new(RecordingSync::default()));
        let inst = instance_with_ttl("provider", 30, 0);

        let delivered = fanout.publish_instance_event(
            Action::Create,
            &inst,
            &DomainProject::default(),
            &provider().key(),
            &[],
        );
        assert_eq!(delivered, 0);
        assert_eq!(registry.resolved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let center = Arc::new(NotifyCenter::new(NotifyConfig { queue_capacity: 1 }));
        let dp = DomainProject::default();
        let (_, mut rx_a) = center.subscribe(dp.clone(), "a");
        let (_, mut rx_b) = center.subscribe(dp.clone(), "b");
        let (_, mut rx_c) = center.subscribe(dp.clone(), "c");

        let fanout = NotificationFanout::new(center.clone(), Arc::new(RecordingSync::default()));
        let inst = instance_with_ttl("provider", 30, 0);
        let key = provider().key();

        // fill b's queue
        fanout.publish_instance_event(Action::Create, &inst, &dp, &key, &["b".to_string()]);

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let delivered = fanout.publish_instance_event(Action::Delete, &inst, &dp, &key, &ids);
        assert_eq!(delivered, 2);

        assert_eq!(rx_a.try_recv().unwrap().action, Action::Delete);
        assert_eq!(rx_c.try_recv().unwrap().action, Action::Delete);
        assert_eq!(rx_b.try_recv().unwrap().action, Action::Create);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let center = NotifyCenter::new(NotifyConfig::default());
        let dp = DomainProject::default();
        let (_, rx) = center.subscribe(dp.clone(), "a");
        let (_, _rx_keep) = center.subscribe(dp.clone(), "a");
        assert_eq!(center.subscriber_count(), 2);

        drop(rx);
        assert_eq!(center.resolve(&dp, "a").len(), 1);
        assert_eq!(center.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_and_close() {
        let center = NotifyCenter::new(NotifyConfig::default());
        let dp = DomainProject::new("acme", "shop");
        let (id, _rx) = center.subscribe(dp.clone(), "a");
        center.unsubscribe(&dp, "a", &id);
        assert!(center.resolve(&dp, "a").is_empty());

        let (_, _rx2) = center.subscribe(dp.clone(), "a");
        assert!(!SubscriberRegistry::closed(&center));
        center.close();
        assert!(SubscriberRegistry::closed(&center));
        assert_eq!(center.subscriber_count(), 0);
    }

    #[test]
    fn test_syncer_skipped_when_closed() {
        let sync = Arc::new(RecordingSync::default());
        let fanout = NotificationFanout::new(
            Arc::new(NotifyCenter::new(NotifyConfig::default())),
            sync.clone(),
        );
        let inst = instance_with_ttl("provider", 30, 0);

        fanout.notify_syncer(Action::Create, &provider(), &inst);
        assert_eq!(sync.events().len(), 1);

        sync.set_closed(true);
        fanout.notify_syncer(Action::Delete, &provider(), &inst);
        assert_eq!(sync.events().len(), 1);
    }

    #[test]
    fn test_sync_queue_drops_when_full() {
        let (queue, mut rx) = SyncQueue::new(1);
        let inst = instance_with_ttl("provider", 30, 0);
        let event = InstanceChangedEvent {
            action: Action::Create,
            service: provider(),
            instance: inst,
        };
        queue.add_event(event.clone());
        queue.add_event(event.clone());
        assert_eq!(rx.try_recv().unwrap(), event);
        assert!(rx.try_recv().is_err());

        assert!(!queue.closed());
        queue.close();
        assert!(queue.closed());
        assert!(SyncQueue::disabled().closed());
    }
}
