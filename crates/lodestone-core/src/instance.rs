use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::health::HealthCheck;
use crate::tenant::DomainProject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
}

/// Store coordinates of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub domain_project: DomainProject,
    pub service_id: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(
        domain_project: DomainProject,
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_project,
            service_id: service_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_id: String,
    pub domain_project: DomainProject,
    pub host_name: String,
    pub endpoints: Vec<String>,
    pub status: InstanceStatus,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Persisted refresh time, unix millis.
    pub refresh_time: u64,
}

impl ServiceInstance {
    pub fn new(
        domain_project: DomainProject,
        service_id: impl Into<String>,
        host_name: impl Into<String>,
        endpoints: Vec<String>,
        refresh_time: u64,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            domain_project,
            host_name: host_name.into(),
            endpoints,
            status: InstanceStatus::Up,
            health_check: HealthCheck::default(),
            properties: HashMap::new(),
            refresh_time,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(
            self.domain_project.clone(),
            self.service_id.clone(),
            self.instance_id.clone(),
        )
    }

    /// True while `now` is still inside the health-check TTL window.
    pub fn is_live_at(&self, now_millis: u64) -> bool {
        let ttl_millis = self.health_check.effective_ttl_secs().unsigned_abs() * 1000;
        now_millis.saturating_sub(self.refresh_time) <= ttl_millis
    }

    /// Millis left in the TTL window at `now`, zero once it has elapsed.
    pub fn remaining_ttl_millis(&self, now_millis: u64) -> u64 {
        let ttl_millis = self.health_check.effective_ttl_secs().unsigned_abs() * 1000;
        (self.refresh_time + ttl_millis).saturating_sub(now_millis)
    }
}
