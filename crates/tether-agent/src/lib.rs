//! # Tether Agent
//!
//! The connection server that runs on a remote host: it relays local socket
//! clients over its stdio link and serves commands on its own route.

#![warn(missing_docs)]

/// Connection server wiring and run modes
pub mod agent;

/// Command line and validated server configuration
pub mod config;

/// Command handlers for the agent's own route
pub mod handlers;

/// Logging bootstrap
pub mod logging;

/// Periodic status reporting
pub mod status;
