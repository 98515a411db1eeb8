use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::RegistryError;
use crate::tenant::DomainProject;

/// Attribute prefix that addresses a consumer tag instead of a service field.
pub const TAG_PREFIX: &str = "tag_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    White,
    Black,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::White => "WHITE",
            RuleType::Black => "BLACK",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility rule owned by a provider service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Rule {
    pub rule_id: String,
    pub service_id: String,
    pub domain_project: DomainProject,
    pub rule_type: RuleType,
    pub attribute: String,
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl Rule {
    pub fn new(
        domain_project: DomainProject,
        service_id: impl Into<String>,
        rule_type: RuleType,
        attribute: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            domain_project,
            rule_type,
            attribute: attribute.into(),
            pattern: pattern.into(),
            description: String::new(),
            timestamp: 0,
        }
    }

    /// Tag name when the attribute addresses a consumer tag.
    pub fn tag_name(&self) -> Option<&str> {
        self.attribute.strip_prefix(TAG_PREFIX)
    }
}

/// Rejects a rule set mixing WHITE and BLACK for one service.
pub fn ensure_single_rule_type<'a, I>(rules: I) -> Result<Option<RuleType>, RegistryError>
where
    I: IntoIterator<Item = &'a Rule>,
{
    let mut kind: Option<RuleType> = None;
    for rule in rules {
        match kind {
            None => kind = Some(rule.rule_type),
            Some(k) if k != rule.rule_type => return Err(RegistryError::MixedRuleType),
            Some(_) => {}
        }
    }
    Ok(kind)
}

/// A consumer's declared dependency on a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Dependency {
    pub domain_project: DomainProject,
    pub provider_id: String,
    pub consumer_id: String,
}
