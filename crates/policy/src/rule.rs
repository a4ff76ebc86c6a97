//! Access rules.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Access policy attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    #[default]
    ReadWrite,
    ReadOnly,
    NoAccess,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::ReadWrite => "read-write",
            Policy::ReadOnly => "read-only",
            Policy::NoAccess => "no-access",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-write" | "readwrite" | "rw" => Ok(Policy::ReadWrite),
            "read-only" | "readonly" | "ro" => Ok(Policy::ReadOnly),
            "no-access" | "noaccess" | "none" => Ok(Policy::NoAccess),
            other => Err(Error::InvalidPolicy(other.to_string())),
        }
    }
}

/// Stable identifier of a rule, assigned when the rule is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A path prefix and the policy applied to everything beneath it.
///
/// Identity is the [`RuleId`], not the contents: two rules with the same
/// prefix and policy are still distinct rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: RuleId,
    pub path_prefix: String,
    pub policy: Policy,
}

impl AccessRule {
    /// Create a rule with a fresh identifier.
    pub fn new(path_prefix: impl Into<String>, policy: Policy) -> Self {
        Self {
            id: RuleId::new(),
            path_prefix: path_prefix.into(),
            policy,
        }
    }

    /// Whether this rule covers `path` (literal prefix match).
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }
}

/// Parses `PATH=POLICY`, e.g. `/secret=no-access`.
impl FromStr for AccessRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, policy) = s
            .rsplit_once('=')
            .ok_or_else(|| Error::InvalidRule(format!("expected PATH=POLICY, got '{s}'")))?;
        if path.is_empty() {
            return Err(Error::InvalidRule(format!("empty path in '{s}'")));
        }
        Ok(Self::new(path, policy.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_policy_names() {
        assert_eq!("read-only".parse::<Policy>().unwrap(), Policy::ReadOnly);
        assert_eq!("NoAccess".parse::<Policy>().unwrap(), Policy::NoAccess);
        assert_eq!("rw".parse::<Policy>().unwrap(), Policy::ReadWrite);
        assert!("everything".parse::<Policy>().is_err());
    }

    #[test]
    fn parse_rule_spec() {
        let rule: AccessRule = "/srv/data=read-only".parse().unwrap();
        assert_eq!(rule.path_prefix, "/srv/data");
        assert_eq!(rule.policy, Policy::ReadOnly);

        assert!("/srv/data".parse::<AccessRule>().is_err());
        assert!("=no-access".parse::<AccessRule>().is_err());
    }

    #[test]
    fn equal_contents_are_distinct_rules() {
        let a = AccessRule::new("/a", Policy::NoAccess);
        let b = AccessRule::new("/a", Policy::NoAccess);
        assert_ne!(a.id, b.id);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn policy_serde_is_kebab_case() {
        let json = serde_json::to_string(&Policy::NoAccess).unwrap();
        assert_eq!(json, "\"no-access\"");
    }
}
