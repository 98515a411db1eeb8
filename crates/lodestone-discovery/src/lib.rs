pub mod consumers;
pub mod dispatcher;
pub mod handlers;
pub mod index_cache;
pub mod liveness;
pub mod metrics;
pub mod notify;
pub mod reconciler;
pub mod rules;

#[cfg(test)]
mod test_utils;

pub use consumers::ConsumerResolver;
pub use dispatcher::{EventDispatcher, EventHandler};
pub use handlers::{DependencyEventHandler, InstanceEventHandler, RuleEventHandler, ServiceEventHandler};
pub use index_cache::IndexCache;
pub use liveness::{LivenessCache, LivenessConfig, LivenessRecord};
pub use notify::{ChannelSubscriber, NotificationFanout, NotifyCenter, NotifyConfig, SyncQueue};
pub use reconciler::{CommitGate, EvictionReconciler, Reconciled};
pub use rules::RuleEngine;
