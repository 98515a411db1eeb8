//! Per-kind reactions to store changes: gauges, quota, index bookkeeping and
//! watcher notification.

use std::sync::Arc;

use lodestone_core::{
    Action, ChangeEvent, EntityKind, EventPayload, QuotaManager, RegistryStore, Rule, Service,
    ServiceInstance,
};
use tracing::{debug, error, info, warn};

use crate::consumers::ConsumerResolver;
use crate::dispatcher::EventHandler;
use crate::index_cache::IndexCache;
use crate::metrics as m;
use crate::notify::NotificationFanout;

pub struct ServiceEventHandler;

impl EventHandler for ServiceEventHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Service
    }

    fn on_event(&self, event: &ChangeEvent) {
        let EventPayload::Service(service) = &event.payload else {
            return;
        };
        let (framework, framework_version) = service.framework_labels();
        let domain = &service.domain_project.domain;
        match event.action {
            Action::Init => {
                m::report_services(domain, &framework, &framework_version, 1.0);
                return;
            }
            Action::Create => m::report_services(domain, &framework, &framework_version, 1.0),
            Action::Delete => m::report_services(domain, &framework, &framework_version, -1.0),
            Action::Update => {}
        }
        info!(
            "caught [{}] service[{}][{}/{}/{}/{}] event",
            event.action,
            service.service_id,
            service.environment,
            service.app_id,
            service.service_name,
            service.version
        );
    }
}

pub struct InstanceEventHandler {
    store: Arc<dyn RegistryStore>,
    quota: Arc<dyn QuotaManager>,
    consumers: Arc<ConsumerResolver>,
    fanout: Arc<NotificationFanout>,
}

impl InstanceEventHandler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        quota: Arc<dyn QuotaManager>,
        consumers: Arc<ConsumerResolver>,
        fanout: Arc<NotificationFanout>,
    ) -> Self {
        Self {
            store,
            quota,
            consumers,
            fanout,
        }
    }

    fn provider(&self, action: Action, instance: &ServiceInstance) -> Option<Service> {
        match self.store.get_service(&instance.service_id) {
            Ok(service) => Some(service),
            Err(e) if e.is_not_found() => {
                warn!(
                    "caught [{}] instance[{}/{}] event, endpoints {:?}, provider not found",
                    action, instance.service_id, instance.instance_id, instance.endpoints
                );
                None
            }
            Err(e) => {
                error!("query provider {} failed: {}", instance.service_id, e);
                None
            }
        }
    }
}

impl EventHandler for InstanceEventHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Instance
    }

    fn on_event(&self, event: &ChangeEvent) {
        let EventPayload::Instance(instance) = &event.payload else {
            return;
        };
        let dp = &instance.domain_project;
        match event.action {
            Action::Init => {
                m::report_instances(&dp.domain, 1.0);
                return;
            }
            Action::Create => m::report_instances(&dp.domain, 1.0),
            Action::Delete => {
                m::report_instances(&dp.domain, -1.0);
                if !dp.is_default() {
                    self.quota.release_instance_quota(dp);
                }
            }
            Action::Update => {}
        }

        let Some(provider) = self.provider(event.action, instance) else {
            return;
        };
        self.fanout.notify_syncer(event.action, &provider, instance);

        if self.fanout.closed() {
            warn!(
                "caught [{}] instance[{}/{}] event, but notify service is closed",
                event.action, instance.service_id, instance.instance_id
            );
            return;
        }
        let consumer_ids = match self.consumers.allowed_consumers(&provider.service_id) {
            Ok(ids) => ids,
            Err(e) => {
                let key = provider.key();
                error!(
                    "get service[{}][{}/{}/{}/{}]'s consumerIDs failed: {}",
                    provider.service_id, key.environment, key.app_id, key.service_name, key.version, e
                );
                return;
            }
        };
        let delivered = self.fanout.publish_instance_event(
            event.action,
            instance,
            dp,
            &provider.key(),
            &consumer_ids,
        );
        debug!(
            "published [{}] instance {} to {} watchers",
            event.action, instance.instance_id, delivered
        );
    }
}

/// Re-announces a provider's instances after its rule set changes.
pub struct RuleEventHandler {
    store: Arc<dyn RegistryStore>,
    consumers: Arc<ConsumerResolver>,
    fanout: Arc<NotificationFanout>,
}

impl RuleEventHandler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        consumers: Arc<ConsumerResolver>,
        fanout: Arc<NotificationFanout>,
    ) -> Self {
        Self {
            store,
            consumers,
            fanout,
        }
    }

    fn republish(&self, rule: &Rule) -> lodestone_core::Result<()> {
        let provider = self.store.get_service(&rule.service_id)?;
        let rules = self.store.get_rules(&provider.service_id)?;
        let (allow, deny) = self.consumers.partition(&provider.service_id, &rules)?;
        let instances = self.store.get_instances(&provider.service_id)?;
        if instances.is_empty() {
            debug!("provider {} has no instances to republish", provider.service_id);
            return Ok(());
        }

        let key = provider.key();
        for instance in &instances {
            self.fanout.publish_instance_event(
                Action::Update,
                instance,
                &rule.domain_project,
                &key,
                &allow,
            );
            self.fanout.publish_instance_event(
                Action::Delete,
                instance,
                &rule.domain_project,
                &key,
                &deny,
            );
        }
        Ok(())
    }
}

impl EventHandler for RuleEventHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Rule
    }

    fn on_event(&self, event: &ChangeEvent) {
        let EventPayload::Rule(rule) = &event.payload else {
            return;
        };
        if event.action == Action::Init {
            return;
        }
        if self.fanout.closed() {
            warn!(
                "caught service {} rule {} [{}] event, but notify service is closed",
                rule.service_id, rule.rule_id, event.action
            );
            return;
        }
        info!(
            "caught service {} rule {} [{}] event",
            rule.service_id, rule.rule_id, event.action
        );
        if let Err(e) = self.republish(rule) {
            error!(
                "republish instances of provider {} failed: {}",
                rule.service_id, e
            );
        }
    }
}

/// Keeps the provider -> consumer index in step with declared dependencies.
pub struct DependencyEventHandler {
    index: Arc<IndexCache>,
}

impl DependencyEventHandler {
    pub fn new(index: Arc<IndexCache>) -> Self {
        Self { index }
    }
}

impl EventHandler for DependencyEventHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Dependency
    }

    fn on_event(&self, event: &ChangeEvent) {
        let EventPayload::Dependency(dep) = &event.payload else {
            return;
        };
        match event.action {
            Action::Init | Action::Create => self.index.put(&dep.provider_id, &dep.consumer_id),
            Action::Delete => {
                if !self.index.delete(&dep.provider_id, &dep.consumer_id) {
                    debug!(
                        "dependency {} -> {} was not indexed",
                        dep.consumer_id, dep.provider_id
                    );
                }
            }
            Action::Update => {}
        }
    }
}
