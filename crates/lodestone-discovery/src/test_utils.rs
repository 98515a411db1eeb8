use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use lodestone_core::rule::ensure_single_rule_type;
use lodestone_core::{
    Action, ChangeEvent, ChangeListener, Dependency, DomainProject, EventPayload, HealthCheck,
    InstanceChangedEvent, InstanceKey, QuotaKind, QuotaManager, RegistryError, RegistryStore,
    Result, Rule, Service, ServiceInstance, StoreTransaction, SyncNotifier,
};
use parking_lot::{Mutex, MutexGuard, RwLock};

pub fn instance_with_ttl(service_id: &str, interval_secs: i32, refresh_time: u64) -> ServiceInstance {
    let mut inst = ServiceInstance::new(
        DomainProject::default(),
        service_id,
        "test-host",
        vec!["rest://127.0.0.1:8080".to_string()],
        refresh_time,
    );
    inst.health_check = HealthCheck::heartbeat(interval_secs, 0);
    inst
}

pub fn service(id: &str, app_id: &str, name: &str) -> Service {
    Service::new(DomainProject::default(), app_id, name, "1.0.0").with_id(id)
}

#[derive(Default)]
struct State {
    services: HashMap<String, Service>,
    instances: HashMap<InstanceKey, ServiceInstance>,
    rules: Vec<Rule>,
    dependencies: Vec<Dependency>,
}

/// In-memory store with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    revision: AtomicI64,
    fail_deletes: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    fn emit(&self, action: Action, payload: EventPayload) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_change(ChangeEvent::new(action, revision, payload));
        }
    }

    fn check_delete(&self) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RegistryError::Persistence("injected delete failure".into()));
        }
        Ok(())
    }
}

impl RegistryStore for MemoryStore {
    fn add_service(&self, service: &Service) -> Result<()> {
        self.state
            .lock()
            .services
            .insert(service.service_id.clone(), service.clone());
        self.emit(Action::Create, EventPayload::Service(service.clone()));
        Ok(())
    }

    fn get_service(&self, service_id: &str) -> Result<Service> {
        self.state
            .lock()
            .services
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))
    }

    fn get_all_services(&self) -> Result<Vec<Service>> {
        Ok(self.state.lock().services.values().cloned().collect())
    }

    fn add_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let existed = self
            .state
            .lock()
            .instances
            .insert(instance.key(), instance.clone())
            .is_some();
        let action = if existed { Action::Update } else { Action::Create };
        self.emit(action, EventPayload::Instance(instance.clone()));
        Ok(())
    }

    fn get_instance(&self, key: &InstanceKey) -> Result<ServiceInstance> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.state
            .lock()
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::InstanceNotFound(key.instance_id.clone()))
    }

    fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .filter(|i| i.service_id == service_id)
            .cloned()
            .collect())
    }

    fn get_all_instances(&self) -> Result<Vec<ServiceInstance>> {
        Ok(self.state.lock().instances.values().cloned().collect())
    }

    fn refresh_instance(&self, key: &InstanceKey, refresh_time: u64) -> Result<ServiceInstance> {
        let mut state = self.state.lock();
        let inst = state
            .instances
            .get_mut(key)
            .ok_or_else(|| RegistryError::InstanceNotFound(key.instance_id.clone()))?;
        inst.refresh_time = refresh_time;
        Ok(inst.clone())
    }

    fn delete_instance(&self, key: &InstanceKey) -> Result<bool> {
        self.check_delete()?;
        let removed = self.state.lock().instances.remove(key);
        match removed {
            Some(inst) => {
                self.emit(Action::Delete, EventPayload::Instance(inst));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn add_rules(&self, rules: &[Rule]) -> Result<Vec<String>> {
        let mut added = Vec::new();
        {
            let mut state = self.state.lock();
            for rule in rules {
                ensure_single_rule_type(
                    state
                        .rules
                        .iter()
                        .filter(|r| r.service_id == rule.service_id)
                        .chain(std::iter::once(rule)),
                )?;
                let duplicate = state.rules.iter().any(|r| {
                    r.service_id == rule.service_id
                        && r.attribute == rule.attribute
                        && r.pattern == rule.pattern
                });
                if !duplicate {
                    state.rules.push(rule.clone());
                    added.push(rule.clone());
                }
            }
        }
        let ids = added.iter().map(|r| r.rule_id.clone()).collect();
        for rule in added {
            self.emit(Action::Create, EventPayload::Rule(rule));
        }
        Ok(ids)
    }

    fn get_rules(&self, service_id: &str) -> Result<Vec<Rule>> {
        Ok(self
            .state
            .lock()
            .rules
            .iter()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect())
    }

    fn add_dependency(&self, dependency: &Dependency) -> Result<()> {
        self.state.lock().dependencies.push(dependency.clone());
        self.emit(Action::Create, EventPayload::Dependency(dependency.clone()));
        Ok(())
    }

    fn get_all_dependencies(&self) -> Result<Vec<Dependency>> {
        Ok(self.state.lock().dependencies.clone())
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryTxn {
            store: self,
            state: Some(self.state.lock()),
            deleted: Vec::new(),
        }))
    }
}

/// Holds the store lock for its whole lifetime; deletes apply on commit.
struct MemoryTxn<'a> {
    store: &'a MemoryStore,
    state: Option<MutexGuard<'a, State>>,
    deleted: Vec<InstanceKey>,
}

impl MemoryTxn<'_> {
    fn state(&mut self) -> Result<&mut State> {
        self.state
            .as_deref_mut()
            .ok_or_else(|| RegistryError::Internal("transaction finished".into()))
    }
}

impl StoreTransaction for MemoryTxn<'_> {
    fn get_instance(&mut self, key: &InstanceKey) -> Result<ServiceInstance> {
        if self.deleted.contains(key) {
            return Err(RegistryError::InstanceNotFound(key.instance_id.clone()));
        }
        self.state()?
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::InstanceNotFound(key.instance_id.clone()))
    }

    fn delete_instance(&mut self, key: &InstanceKey) -> Result<bool> {
        self.store.check_delete()?;
        let present = self.state()?.instances.contains_key(key) && !self.deleted.contains(key);
        if present {
            self.deleted.push(key.clone());
        }
        Ok(present)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let mut removed = Vec::new();
        if let Some(mut state) = self.state.take() {
            for key in &self.deleted {
                if let Some(inst) = state.instances.remove(key) {
                    removed.push(inst);
                }
            }
        }
        for inst in removed {
            self.store.emit(Action::Delete, EventPayload::Instance(inst));
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.state.take();
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingQuota {
    released: Mutex<Vec<DomainProject>>,
}

impl RecordingQuota {
    pub fn released(&self) -> Vec<DomainProject> {
        self.released.lock().clone()
    }
}

impl QuotaManager for RecordingQuota {
    fn release_instance_quota(&self, domain_project: &DomainProject) {
        self.released.lock().push(domain_project.clone());
    }

    fn apply_quota(&self, _: QuotaKind, _: &DomainProject, _: &str, _: i64) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSync {
    events: Mutex<Vec<InstanceChangedEvent>>,
    closed: AtomicBool,
}

impl RecordingSync {
    pub fn events(&self) -> Vec<InstanceChangedEvent> {
        self.events.lock().clone()
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }
}

impl SyncNotifier for RecordingSync {
    fn add_event(&self, event: InstanceChangedEvent) {
        self.events.lock().push(event);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
