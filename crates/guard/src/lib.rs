//! FileGuard: file access mediation for the enforcement agent.
//!
//! This crate ties the rule table to the enforcement agent channel. The
//! presentation layer edits rules and starts or stops monitoring; the agent
//! asks for a decision on every intercepted file operation and gets one
//! resolved against the rules in force at that moment.
//!
//! # Overview
//!
//! - **FileGuard**: owns the [`RuleTable`](policy::RuleTable) and the
//!   connection supervisor, registers itself as the agent's resolution
//!   handler, and answers requests asynchronously.
//! - **GuardObserver**: the capability the caller hands to
//!   [`FileGuard::start`] to hear about `started`, `stopped` and errors.
//!
//! # Example
//!
//! ```no_run
//! use agent::{ChannelConfig, UnixConnector};
//! use guard::{FileGuard, GuardObserver};
//! use policy::{AccessRule, Policy};
//! use std::sync::Arc;
//!
//! # async fn example(observer: Arc<dyn GuardObserver>) {
//! let config = ChannelConfig::default();
//! let guard = FileGuard::new(UnixConnector::new(&config.socket), config);
//!
//! guard.add_rule(AccessRule::new("/Users/me/secret", Policy::NoAccess));
//! guard.start(&observer);
//! // ... observer.on_started() fires once the agent accepts the handler
//! guard.stop();
//! # }
//! ```

mod error;
mod file_guard;
mod observer;

pub use error::{Error, Result};
pub use file_guard::FileGuard;
pub use observer::GuardObserver;
