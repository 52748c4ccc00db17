//! Command handlers for the agent's own route

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tether::proto::Envelope;
use tether::{CommandHandler, RpcContext, TetherError};
use tokio::sync::RwLock;
use tracing::debug;

/// Liveness probe
pub const COMMAND_PING: &str = "ping";

/// Per-route command counters
pub const COMMAND_STATS: &str = "stats";

#[derive(Debug, Default, Clone, Copy)]
struct RouteStats {
    commands: u64,
}

/// Handler behind the connection server's local route.
///
/// Answers `ping` and `stats`, and keeps per-route counters that are
/// released when the route is disposed.
pub struct ConnServerHandler {
    started: Instant,
    routes: RwLock<HashMap<String, RouteStats>>,
}

impl Default for ConnServerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnServerHandler {
    /// Create a handler with no tracked routes
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Number of routes with live counters
    pub async fn tracked_routes(&self) -> usize {
        self.routes.read().await.len()
    }
}

#[async_trait]
impl CommandHandler for ConnServerHandler {
    async fn handle(&self, ctx: &RpcContext, request: Envelope) -> tether::Result<Option<Value>> {
        let source = request.source.clone().unwrap_or_default();
        let commands = {
            let mut routes = self.routes.write().await;
            let stats = routes.entry(source.clone()).or_default();
            stats.commands += 1;
            stats.commands
        };

        match request.command.as_deref() {
            Some(COMMAND_PING) => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                Ok(Some(json!({
                    "pong": true,
                    "timestamp": timestamp,
                    "conn": ctx.conn,
                    "uptime_secs": self.started.elapsed().as_secs(),
                })))
            }
            Some(COMMAND_STATS) => Ok(Some(json!({
                "route": source,
                "commands": commands,
            }))),
            Some(other) => Err(TetherError::Handler(format!("unsupported command: {}", other))),
            None => Err(TetherError::Handler("missing command".to_string())),
        }
    }

    async fn dispose(&self, route_id: &str) {
        if self.routes.write().await.remove(route_id).is_some() {
            debug!("Released counters for {}", route_id);
        }
    }
}
