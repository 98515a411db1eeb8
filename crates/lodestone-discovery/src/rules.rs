//! Whitelist / blacklist evaluation of a provider's rules against a consumer.

use std::collections::HashMap;

use lodestone_core::{RegistryError, Result, Rule, RuleType, Service};
use regex::Regex;
use tracing::{debug, error, info, warn};

type Accessor = fn(&Service) -> &str;

fn service_id(s: &Service) -> &str {
    &s.service_id
}
fn app_id(s: &Service) -> &str {
    &s.app_id
}
fn service_name(s: &Service) -> &str {
    &s.service_name
}
fn version(s: &Service) -> &str {
    &s.version
}
fn environment(s: &Service) -> &str {
    &s.environment
}
fn alias(s: &Service) -> &str {
    &s.alias
}
fn level(s: &Service) -> &str {
    &s.level
}
fn description(s: &Service) -> &str {
    &s.description
}

/// Rule attributes that name a consumer field.
const ACCESSORS: &[(&str, Accessor)] = &[
    ("ServiceId", service_id),
    ("AppId", app_id),
    ("ServiceName", service_name),
    ("Version", version),
    ("Environment", environment),
    ("Alias", alias),
    ("Level", level),
    ("Description", description),
];

/// A rule with its pattern compiled once. An invalid pattern never matches.
struct CompiledRule<'a> {
    rule: &'a Rule,
    regex: Option<Regex>,
}

impl<'a> CompiledRule<'a> {
    fn new(rule: &'a Rule) -> Self {
        let regex = match Regex::new(&rule.pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("invalid rule pattern {}: {}", rule.pattern, e);
                None
            }
        };
        Self { rule, regex }
    }

    fn is_match(&self, value: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(value))
    }
}

fn compile(rules: &[Rule]) -> Vec<CompiledRule<'_>> {
    rules.iter().map(CompiledRule::new).collect()
}

pub struct RuleEngine {
    accessors: HashMap<&'static str, Accessor>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            accessors: ACCESSORS.iter().copied().collect(),
        }
    }

    /// `Ok` when `consumer` may see the provider owning `rules`,
    /// `PermissionDenied` when it may not, `Internal` on a rule naming an
    /// unknown field.
    pub fn match_rules(&self, rules: &[Rule], consumer: &Service) -> Result<()> {
        self.match_compiled(&compile(rules), consumer)
    }

    fn match_compiled(&self, rules: &[CompiledRule<'_>], consumer: &Service) -> Result<()> {
        let Some(first) = rules.first() else {
            return Ok(());
        };
        match first.rule.rule_type {
            RuleType::White => self.white_list(rules, consumer),
            RuleType::Black => self.black_list(rules, consumer),
        }
    }

    fn white_list(&self, rules: &[CompiledRule<'_>], consumer: &Service) -> Result<()> {
        for compiled in rules {
            let rule = compiled.rule;
            let value = self.resolve(rule, consumer)?;
            if value.is_empty() {
                continue;
            }
            if compiled.is_match(value) {
                info!(
                    "consumer[{}][{}/{}/{}] match white list, rule.Pattern is {}, value is {}",
                    consumer.service_id,
                    consumer.app_id,
                    consumer.service_name,
                    consumer.version,
                    rule.pattern,
                    value
                );
                return Ok(());
            }
        }
        Err(RegistryError::PermissionDenied("not found in white list".into()))
    }

    fn black_list(&self, rules: &[CompiledRule<'_>], consumer: &Service) -> Result<()> {
        for compiled in rules {
            let rule = compiled.rule;
            let value = self.resolve(rule, consumer)?;
            if value.is_empty() {
                continue;
            }
            if compiled.is_match(value) {
                warn!(
                    "no permission to access, consumer[{}][{}/{}/{}] match black list, rule.Pattern is {}, value is {}",
                    consumer.service_id,
                    consumer.app_id,
                    consumer.service_name,
                    consumer.version,
                    rule.pattern,
                    value
                );
                return Err(RegistryError::PermissionDenied("found in black list".into()));
            }
        }
        Ok(())
    }

    fn resolve<'a>(&self, rule: &Rule, consumer: &'a Service) -> Result<&'a str> {
        if let Some(tag) = rule.tag_name() {
            let value = consumer.tags.get(tag).map(String::as_str).unwrap_or_default();
            if value.is_empty() {
                debug!("can not find service[{}] tag[{}]", consumer.service_id, tag);
            }
            return Ok(value);
        }
        match self.accessors.get(rule.attribute.as_str()) {
            Some(get) => Ok(get(consumer)),
            None => {
                error!(
                    "can not find service[{}] field[{}], ruleID is {}",
                    consumer.service_id, rule.attribute, rule.rule_id
                );
                Err(RegistryError::Internal(format!(
                    "can not find field '{}'",
                    rule.attribute
                )))
            }
        }
    }

    /// Whether one consumer passes. A consumer that no longer exists is denied.
    fn filter_compiled<F>(
        &self,
        rules: &[CompiledRule<'_>],
        consumer_id: &str,
        lookup: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&str) -> Result<Service>,
    {
        let consumer = match lookup(consumer_id) {
            Ok(consumer) => consumer,
            Err(e) if e.is_not_found() => {
                debug!("consumer {} not found, deny", consumer_id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        match self.match_compiled(rules, &consumer) {
            Ok(()) => Ok(true),
            Err(e) if e.is_permission_denied() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Partitions `consumer_ids` into (allow, deny). Every id lands in exactly
    /// one side. Deny comes back in reverse encounter order. Patterns are
    /// compiled once for the whole batch.
    pub fn filter_all<F>(
        &self,
        consumer_ids: &[String],
        rules: &[Rule],
        mut lookup: F,
    ) -> Result<(Vec<String>, Vec<String>)>
    where
        F: FnMut(&str) -> Result<Service>,
    {
        if consumer_ids.is_empty() || rules.is_empty() {
            return Ok((consumer_ids.to_vec(), Vec::new()));
        }

        let compiled = compile(rules);
        let mut allow = Vec::with_capacity(consumer_ids.len());
        let mut deny = Vec::new();
        for consumer_id in consumer_ids {
            if self.filter_compiled(&compiled, consumer_id, &mut lookup)? {
                allow.push(consumer_id.clone());
            } else {
                deny.push(consumer_id.clone());
            }
        }
        deny.reverse();
        Ok((allow, deny))
    }
}
