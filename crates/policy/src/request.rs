//! Access requests and decisions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of access an intercepted file operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Read,
    Write,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Read => f.write_str("read"),
            AccessType::Write => f.write_str("write"),
        }
    }
}

/// A single intercepted file operation awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub path: String,
    pub access: AccessType,
}

impl AccessRequest {
    pub fn new(path: impl Into<String>, access: AccessType) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(path, AccessType::Read)
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self::new(path, AccessType::Write)
    }
}

/// Resolved outcome of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}
