use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::tenant::DomainProject;

pub const UNKNOWN_FRAMEWORK: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Framework {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Service {
    pub service_id: String,
    pub domain_project: DomainProject,
    pub app_id: String,
    pub service_name: String,
    pub version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub framework: Option<Framework>,
    /// Consumer tags, addressed by `tag_<name>` rule attributes.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Service {
    pub fn new(
        domain_project: DomainProject,
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service_id: Uuid::new_v4().to_string(),
            domain_project,
            app_id: app_id.into(),
            service_name: service_name.into(),
            version: version.into(),
            environment: String::new(),
            alias: String::new(),
            level: String::new(),
            description: String::new(),
            framework: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Framework name and version for gauges, `UNKNOWN` when unset.
    pub fn framework_labels(&self) -> (String, String) {
        match &self.framework {
            Some(fw) if !fw.name.is_empty() => {
                let version = if fw.version.is_empty() {
                    UNKNOWN_FRAMEWORK.to_string()
                } else {
                    fw.version.clone()
                };
                (fw.name.clone(), version)
            }
            _ => (UNKNOWN_FRAMEWORK.to_string(), UNKNOWN_FRAMEWORK.to_string()),
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            tenant: self.domain_project.to_string(),
            environment: self.environment.clone(),
            app_id: self.app_id.clone(),
            service_name: self.service_name.clone(),
            alias: self.alias.clone(),
            version: self.version.clone(),
        }
    }
}

/// Provider identity carried in watch responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServiceKey {
    pub tenant: String,
    pub environment: String,
    pub app_id: String,
    pub service_name: String,
    pub alias: String,
    pub version: String,
}
