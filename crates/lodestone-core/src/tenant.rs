use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_DOMAIN: &str = "default";
pub const DEFAULT_PROJECT: &str = "default";

/// Tenancy scope applied to every stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct DomainProject {
    pub domain: String,
    pub project: String,
}

impl DomainProject {
    pub fn new(domain: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            project: project.into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.domain == DEFAULT_DOMAIN && self.project == DEFAULT_PROJECT
    }
}

impl Default for DomainProject {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN, DEFAULT_PROJECT)
    }
}

impl fmt::Display for DomainProject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.project)
    }
}
