use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{config::AuthorizationConfig, key_mapper::PathSegments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Remove,
    Exists,
    List,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Remove => "remove",
            Operation::Exists => "exists",
            Operation::List => "list",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Permit,
    Deny { reason: Option<String> },
}

/// Decision point consulted before any byte store I/O.
///
/// `key` is `None` for operations that address the whole store (listing
/// without a prefix).
pub trait Authorizer: Send + Sync {
    fn authorize(&self, operation: Operation, key: Option<&PathSegments>) -> AccessDecision;
}

pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _operation: Operation, _key: Option<&PathSegments>) -> AccessDecision {
        AccessDecision::Permit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRule {
    /// Operations the rule applies to. Empty means all of them.
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Mapped key prefix, compared segment by segment. Empty matches every key.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub reason: Option<String>,
}

struct CompiledRule {
    operations: Vec<Operation>,
    prefix: Vec<String>,
    reason: Option<String>,
}

impl CompiledRule {
    fn matches(&self, operation: Operation, key: Option<&PathSegments>) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&operation) {
            return false;
        }
        match key {
            Some(key) => key.segments().starts_with(&self.prefix),
            None => self.prefix.is_empty(),
        }
    }
}

/// Denies with the reason of the first rule matching both the operation and
/// the key prefix; permits when no rule matches.
pub struct RuleAuthorizer {
    rules: Vec<CompiledRule>,
}

impl RuleAuthorizer {
    pub fn new(config: &AuthorizationConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| CompiledRule {
                operations: rule.operations.clone(),
                prefix: rule
                    .prefix
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                reason: rule.reason.clone(),
            })
            .collect();
        Self { rules }
    }
}

impl Authorizer for RuleAuthorizer {
    fn authorize(&self, operation: Operation, key: Option<&PathSegments>) -> AccessDecision {
        match self.rules.iter().find(|rule| rule.matches(operation, key)) {
            Some(rule) => AccessDecision::Deny {
                reason: rule.reason.clone(),
            },
            None => AccessDecision::Permit,
        }
    }
}
