use std::sync::Arc;

use crate::errors::Result;
use crate::event::{ChangeEvent, InstanceChangedEvent, WatchInstanceResponse};
use crate::instance::{InstanceKey, ServiceInstance};
use crate::rule::{Dependency, Rule};
use crate::service::Service;
use crate::tenant::DomainProject;

/// Persistent store contract. Implementations provide their own per-key atomicity.
pub trait RegistryStore: Send + Sync {
    fn add_service(&self, service: &Service) -> Result<()>;
    fn get_service(&self, service_id: &str) -> Result<Service>;
    fn get_all_services(&self) -> Result<Vec<Service>>;

    fn add_instance(&self, instance: &ServiceInstance) -> Result<()>;
    fn get_instance(&self, key: &InstanceKey) -> Result<ServiceInstance>;
    fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>>;
    fn get_all_instances(&self) -> Result<Vec<ServiceInstance>>;
    /// Stamps the persisted refresh time; `InstanceNotFound` if absent.
    fn refresh_instance(&self, key: &InstanceKey, refresh_time: u64) -> Result<ServiceInstance>;
    /// Idempotent: an absent instance yields `Ok(false)`.
    fn delete_instance(&self, key: &InstanceKey) -> Result<bool>;

    /// Adds rules, skipping duplicates of (service, attribute, pattern); returns new rule ids.
    fn add_rules(&self, rules: &[Rule]) -> Result<Vec<String>>;
    fn get_rules(&self, service_id: &str) -> Result<Vec<Rule>>;

    fn add_dependency(&self, dependency: &Dependency) -> Result<()>;
    fn get_all_dependencies(&self) -> Result<Vec<Dependency>>;

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;
}

/// A store transaction. Dropping it without `commit` rolls back.
pub trait StoreTransaction {
    fn get_instance(&mut self, key: &InstanceKey) -> Result<ServiceInstance>;
    fn delete_instance(&mut self, key: &InstanceKey) -> Result<bool>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>) -> Result<()>;
}

/// Watch collaborator: receives one event per committed store mutation.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: ChangeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Service,
    Instance,
    Rule,
}

/// Quota accounting. Only tenants other than the default one are charged.
pub trait QuotaManager: Send + Sync {
    fn release_instance_quota(&self, domain_project: &DomainProject);
    fn apply_quota(
        &self,
        kind: QuotaKind,
        domain_project: &DomainProject,
        service_id: &str,
        count: i64,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("subscriber queue is full")]
    Full,
    #[error("subscriber is closed")]
    Closed,
}

/// Delivery handle of one local watcher.
pub trait WatchSubscriber: Send + Sync {
    fn id(&self) -> &str;
    /// Never blocks: a full queue is an error, not a wait.
    fn push(&self, response: WatchInstanceResponse) -> std::result::Result<(), PushError>;
}

pub trait SubscriberRegistry: Send + Sync {
    fn resolve(&self, domain_project: &DomainProject, consumer_id: &str) -> Vec<Arc<dyn WatchSubscriber>>;

    fn closed(&self) -> bool {
        false
    }
}

/// Cluster-sync peer.
pub trait SyncNotifier: Send + Sync {
    fn add_event(&self, event: InstanceChangedEvent);
    fn closed(&self) -> bool;
}
