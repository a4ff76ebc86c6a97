//! Channel to the privileged enforcement agent.
//!
//! The enforcement agent intercepts file operations and asks its registered
//! client how to resolve each one. This crate owns that conversation:
//! newline-delimited JSON-RPC 2.0 over a byte stream (a Unix domain socket in
//! production).
//!
//! - [`ConnectionSupervisor`] opens the channel, reports `Connected` and
//!   `Disconnected` events, and is the only component that touches the
//!   transport.
//! - [`AgentClient`] is what callers hold while connected: it can register
//!   and unregister a [`ResolveHandler`], nothing else.
//! - [`ResolveHandler`] receives every intercepted operation together with a
//!   [`Reply`] continuation used to answer it.
//!
//! # Example
//!
//! ```no_run
//! use agent::{ChannelConfig, ConnectionSupervisor, Reply, ResolveHandler, UnixConnector};
//! use policy::{AccessRequest, Decision};
//! use std::sync::Arc;
//!
//! struct AllowAll;
//!
//! impl ResolveHandler for AllowAll {
//!     fn resolve(&self, _request: AccessRequest, reply: Reply) {
//!         reply.send(Decision::Allow);
//!     }
//! }
//!
//! # async fn example() -> agent::Result<()> {
//! let config = ChannelConfig::default();
//! let connector = UnixConnector::new(&config.socket);
//! let (supervisor, _events) = ConnectionSupervisor::new(connector, config);
//!
//! let client = supervisor.connect().await?;
//! client.register_handler(Arc::new(AllowAll)).await?;
//!
//! client.unregister_handler().await?;
//! supervisor.stop();
//! # Ok(())
//! # }
//! ```

mod config;
mod connector;
mod error;
pub mod protocol;
mod session;
mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    ChannelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SOCKET, DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE,
};
pub use connector::Connector;
#[cfg(unix)]
pub use connector::UnixConnector;
pub use error::{Error, Result};
pub use session::{ChannelSession, DisconnectReason, Reply, ResolveHandler};
pub use supervisor::{AgentClient, ChannelState, ConnectionSupervisor, SupervisorEvent};
