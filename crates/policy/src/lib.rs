//! Access rules and decision resolution.
//!
//! Core principle: **the first rule whose path prefix matches wins, and no
//! match means the access is allowed.**

mod error;
mod request;
mod resolver;
mod rule;
mod table;

pub use error::{Error, Result};
pub use request::{AccessRequest, AccessType, Decision};
pub use resolver::resolve;
pub use rule::{AccessRule, Policy, RuleId};
pub use table::{RuleSnapshot, RuleTable};
