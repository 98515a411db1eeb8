pub mod service;
pub mod instance;
pub mod health;
pub mod rule;
pub mod event;
pub mod tenant;
pub mod registry;
pub mod errors;
pub mod time;

pub use service::{Framework, Service, ServiceKey};
pub use instance::{InstanceKey, InstanceStatus, ServiceInstance};
pub use health::{CheckMode, HealthCheck, DEFAULT_TTL_SECS};
pub use rule::{Dependency, Rule, RuleType};
pub use event::{Action, ChangeEvent, EntityKind, EventPayload, InstanceChangedEvent, WatchInstanceResponse};
pub use tenant::DomainProject;
pub use registry::{
    ChangeListener, PushError, QuotaKind, QuotaManager, RegistryStore, StoreTransaction,
    SubscriberRegistry, SyncNotifier, WatchSubscriber,
};
pub use errors::{RegistryError, Result};
