//! # Tether
//!
//! Connection and message routing for a remote agent.
//!
//! A [`Router`] multiplexes envelopes between any number of authenticated
//! local connections, local endpoints, and a single upstream link. Each
//! accepted connection is owned by an [`RpcProxy`] that admits it through a
//! token handshake and tears it down exactly once.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tether_proto as proto;

/// Error types for the Tether library
pub mod error;

/// Connection identity carried in authentication tokens
pub mod context;

/// Route registry and envelope dispatch
pub mod router;

/// Authenticated connection proxy
pub mod proxy;

/// Accepted connection lifecycle
pub mod connection;

/// Local endpoint and command handler contract
pub mod endpoint;

/// Unix socket listener and accept loop
pub mod listener;

/// Framed stdio upstream bridge
pub mod upstream;

/// Process-wide shutdown coordination
pub mod shutdown;

/// Supervised task helpers
pub mod task;

pub use error::TetherError;
pub use context::RpcContext;
pub use router::{AuthResult, Router, RpcEndpoint, UPSTREAM_ROUTE};
pub use proxy::{ProxyWire, RpcProxy};
pub use connection::{ConnectionConfig, ConnectionGuard};
pub use endpoint::{CommandHandler, LocalEndpoint};
pub use shutdown::Shutdown;

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
