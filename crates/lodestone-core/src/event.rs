use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::instance::ServiceInstance;
use crate::rule::{Dependency, Rule};
use crate::service::{Service, ServiceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Bulk snapshot load at startup.
    Init,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "INIT",
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Service,
    Instance,
    Rule,
    Dependency,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Service => "service",
            EntityKind::Instance => "instance",
            EntityKind::Rule => "rule",
            EntityKind::Dependency => "dependency",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Service(Service),
    Instance(ServiceInstance),
    Rule(Rule),
    Dependency(Dependency),
}

impl EventPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            EventPayload::Service(_) => EntityKind::Service,
            EventPayload::Instance(_) => EntityKind::Instance,
            EventPayload::Rule(_) => EntityKind::Rule,
            EventPayload::Dependency(_) => EntityKind::Dependency,
        }
    }
}

/// One store mutation, as seen by the watch collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: Action,
    pub revision: i64,
    pub payload: EventPayload,
}

impl ChangeEvent {
    pub fn new(action: Action, revision: i64, payload: EventPayload) -> Self {
        Self {
            action,
            revision,
            payload,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

/// Message pushed to a watching consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WatchInstanceResponse {
    pub action: Action,
    pub key: ServiceKey,
    pub instance: ServiceInstance,
}

/// Denormalized instance change handed to the cluster-sync peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceChangedEvent {
    pub action: Action,
    pub service: Service,
    pub instance: ServiceInstance,
}

impl InstanceChangedEvent {
    pub fn instance_key(&self) -> String {
        format!(
            "/instances/{}/{}/{}/{}",
            self.instance.domain_project.domain,
            self.instance.domain_project.project,
            self.instance.service_id,
            self.instance.instance_id
        )
    }
}
