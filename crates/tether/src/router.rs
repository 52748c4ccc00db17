//! Route registry and envelope dispatch

use crate::context::{make_proc_route_id, RpcContext};
use crate::{Result, TetherError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_proto::message::{COMMAND_ROUTE_ANNOUNCE, COMMAND_ROUTE_UNANNOUNCE};
use tether_proto::{Command, Envelope};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Reserved destination naming the upstream link
pub const UPSTREAM_ROUTE: &str = "upstream";

/// A destination the router can deliver envelopes to and pull envelopes from
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    /// Queue an envelope for this endpoint without blocking
    fn send_rpc_message(&self, msg: Envelope) -> Result<()>;

    /// Next envelope produced by this endpoint, `None` once it is closed
    async fn recv_rpc_message(&self) -> Option<Envelope>;
}

/// Outcome of a successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Route id assigned to the authenticated party
    pub route_id: String,
    /// Token the party presents from now on
    pub auth_token: String,
    /// Identity the grant was derived from
    pub context: RpcContext,
}

struct RouteEntry {
    endpoint: Arc<dyn RpcEndpoint>,
    is_local: bool,
    pump: CancellationToken,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<String, RouteEntry>,
    upstream: Option<RouteEntry>,
    /// Announced route id to the registered route it is reachable through
    announced: HashMap<String, String>,
    default_route: Option<String>,
}

impl RouteTable {
    fn resolve<'a>(&'a self, route: Option<&str>, source: &str) -> Option<(&'a str, &'a RouteEntry)> {
        let upstream = || -> Option<(&'a str, &'a RouteEntry)> {
            if source == UPSTREAM_ROUTE {
                None
            } else {
                self.upstream.as_ref().map(|entry| (UPSTREAM_ROUTE, entry))
            }
        };

        match route {
            Some(UPSTREAM_ROUTE) => upstream(),
            Some(route) => self
                .registered(route)
                .or_else(|| self.announced.get(route).and_then(|via| self.registered(via)))
                .or_else(upstream),
            None => self
                .default_route
                .as_deref()
                .and_then(|route| self.registered(route))
                .or_else(upstream),
        }
    }

    fn registered(&self, route: &str) -> Option<(&str, &RouteEntry)> {
        self.routes
            .get_key_value(route)
            .map(|(id, entry)| (id.as_str(), entry))
    }

    fn upstream_endpoint(&self) -> Option<Arc<dyn RpcEndpoint>> {
        self.upstream.as_ref().map(|entry| entry.endpoint.clone())
    }
}

/// Multiplexes envelopes between registered routes and the upstream link.
///
/// Every registered endpoint gets a pump task that feeds its outbound
/// envelopes back into [`Router::route_message`]. Delivery happens while the
/// table is read-locked, so once [`Router::unregister_route`] returns no
/// further envelope can reach the removed endpoint.
pub struct Router {
    table: RwLock<RouteTable>,
    accepted_tokens: RwLock<HashMap<String, RpcContext>>,
    closed: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RouteTable::default()),
            accepted_tokens: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind `route_id` to `endpoint`, replacing any earlier binding.
    ///
    /// Local routes are persistent in-process endpoints; removing one is not
    /// reported upstream.
    pub async fn register_route(
        self: &Arc<Self>,
        route_id: impl Into<String>,
        endpoint: Arc<dyn RpcEndpoint>,
        is_local: bool,
    ) {
        let route_id = route_id.into();
        let pump = CancellationToken::new();

        {
            let mut table = self.table.write().await;
            let entry = RouteEntry {
                endpoint: endpoint.clone(),
                is_local,
                pump: pump.clone(),
            };
            if let Some(previous) = table.routes.insert(route_id.clone(), entry) {
                debug!("Replacing existing binding for route {}", route_id);
                previous.pump.cancel();
            }
        }

        debug!("Registered route {} (local: {})", route_id, is_local);
        self.spawn_pump(route_id, endpoint, pump);
    }

    /// Remove a route binding. Unknown routes are ignored.
    pub async fn unregister_route(&self, route_id: &str) {
        let removed = {
            let mut table = self.table.write().await;
            let removed = table.routes.remove(route_id);
            if removed.is_some() {
                table.announced.retain(|_, via| via != route_id);
            }
            removed.map(|entry| (entry, table.upstream_endpoint()))
        };

        let Some((entry, upstream)) = removed else {
            trace!("Unregister of unknown route {}", route_id);
            return;
        };

        entry.pump.cancel();
        debug!("Unregistered route {}", route_id);

        if !entry.is_local {
            if let Some(upstream) = upstream {
                let unannounce = Envelope::command(Command::RouteUnannounce).with_source(route_id);
                if let Err(e) = upstream.send_rpc_message(unannounce) {
                    debug!("Could not unannounce {} upstream: {}", route_id, e);
                }
            }
        }
    }

    /// Retract a route that was announced but never registered.
    ///
    /// Revokes the token minted for it and tells upstream the route is gone.
    pub async fn withdraw_route(&self, route_id: &str, auth_token: Option<&str>) {
        if let Some(token) = auth_token {
            self.revoke_token(token).await;
        }

        let upstream = {
            let mut table = self.table.write().await;
            table
                .announced
                .retain(|announced, via| announced != route_id && via != route_id);
            table.upstream_endpoint()
        };

        debug!("Withdrew unbound route {}", route_id);
        if let Some(upstream) = upstream {
            let unannounce = Envelope::command(Command::RouteUnannounce).with_source(route_id);
            if let Err(e) = upstream.send_rpc_message(unannounce) {
                debug!("Could not unannounce {} upstream: {}", route_id, e);
            }
        }
    }

    /// Bind the upstream link, replacing any earlier one
    pub async fn set_upstream_client(self: &Arc<Self>, upstream: Arc<dyn RpcEndpoint>) {
        let pump = CancellationToken::new();

        {
            let mut table = self.table.write().await;
            let entry = RouteEntry {
                endpoint: upstream.clone(),
                is_local: false,
                pump: pump.clone(),
            };
            if let Some(previous) = table.upstream.replace(entry) {
                previous.pump.cancel();
            }
        }

        info!("Upstream link bound");
        self.spawn_pump(UPSTREAM_ROUTE.to_string(), upstream, pump);
    }

    /// Unbind the upstream link
    pub async fn clear_upstream_client(&self) {
        let previous = self.table.write().await.upstream.take();
        if let Some(previous) = previous {
            previous.pump.cancel();
            info!("Upstream link cleared");
        }
    }

    /// Route used for envelopes that name no destination
    pub async fn set_default_route(&self, route_id: impl Into<String>) {
        self.table.write().await.default_route = Some(route_id.into());
    }

    /// Decode a JSON envelope and route it as if it came from `source`
    pub async fn inject_message(&self, raw: &[u8], source: &str) -> Result<()> {
        let msg = Envelope::from_json(raw)?;
        self.route_message(msg, source).await
    }

    /// Deliver an envelope to the destination it resolves to.
    ///
    /// Route announcements are consumed here and propagated upstream. Other
    /// envelopes go to their explicit destination, a route announced through
    /// a registered connection, or the upstream link, in that order. An
    /// envelope never goes back upstream if it came from there. Envelopes
    /// without a source are stamped with `source` so replies find their way
    /// back.
    pub async fn route_message(&self, mut msg: Envelope, source: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(TetherError::Routing("router is shut down".to_string()));
        }
        if msg.source.is_none() {
            msg.source = Some(source.to_string());
        }

        match msg.command.as_deref() {
            Some(COMMAND_ROUTE_ANNOUNCE) => return self.handle_announce(msg, source).await,
            Some(COMMAND_ROUTE_UNANNOUNCE) => return self.handle_unannounce(msg, source).await,
            _ => {}
        }

        let table = self.table.read().await;
        let (dest, entry) = table.resolve(msg.route.as_deref(), source).ok_or_else(|| {
            TetherError::Routing(format!(
                "no route for {} from {}",
                msg.route.as_deref().unwrap_or("<default>"),
                source
            ))
        })?;

        trace!("Routing {:?} from {} to {}", msg.command, source, dest);
        entry
            .endpoint
            .send_rpc_message(msg)
            .map_err(|e| TetherError::Routing(format!("route {} is closed: {}", dest, e)))
    }

    async fn handle_announce(&self, msg: Envelope, source: &str) -> Result<()> {
        if source == UPSTREAM_ROUTE {
            trace!("Ignoring route announcement from upstream");
            return Ok(());
        }

        let announced = msg.source.clone().unwrap_or_else(|| source.to_string());
        let upstream = {
            let mut table = self.table.write().await;
            if announced != source {
                table.announced.insert(announced.clone(), source.to_string());
            }
            table.upstream_endpoint()
        };

        debug!("Route {} announced via {}", announced, source);
        match upstream {
            Some(upstream) => upstream.send_rpc_message(msg),
            None => Ok(()),
        }
    }

    async fn handle_unannounce(&self, msg: Envelope, source: &str) -> Result<()> {
        if source == UPSTREAM_ROUTE {
            trace!("Ignoring route unannouncement from upstream");
            return Ok(());
        }

        let announced = msg.source.clone().unwrap_or_else(|| source.to_string());
        let upstream = {
            let mut table = self.table.write().await;
            if table.announced.get(&announced).map(String::as_str) == Some(source) {
                table.announced.remove(&announced);
            }
            table.upstream_endpoint()
        };

        debug!("Route {} unannounced via {}", announced, source);
        match upstream {
            Some(upstream) => upstream.send_rpc_message(msg),
            None => Ok(()),
        }
    }

    /// Accept the agent's own token and record it for client authentication
    pub async fn handle_proxy_auth(&self, token: &str) -> Result<AuthResult> {
        let context = RpcContext::from_token(token)?;
        let route_id = context.route_id()?;
        let auth_token = Uuid::new_v4().to_string();

        {
            let mut accepted = self.accepted_tokens.write().await;
            accepted.insert(token.to_string(), context.clone());
            accepted.insert(auth_token.clone(), context.clone());
        }

        info!("Accepted proxy token for route {}", route_id);
        Ok(AuthResult {
            route_id,
            auth_token,
            context,
        })
    }

    /// Admit a client presenting a previously accepted token.
    ///
    /// Each admission gets a fresh `proc:` route and its own auth token.
    pub async fn authenticate_client(&self, token: &str) -> Result<AuthResult> {
        if token.is_empty() {
            return Err(TetherError::Auth("empty token".to_string()));
        }

        let context = self
            .accepted_tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| TetherError::Auth("token not accepted".to_string()))?;

        let route_id = make_proc_route_id();
        let auth_token = Uuid::new_v4().to_string();
        self.accepted_tokens
            .write()
            .await
            .insert(auth_token.clone(), context.clone());

        debug!("Authenticated client as {}", route_id);
        Ok(AuthResult {
            route_id,
            auth_token,
            context,
        })
    }

    /// Forget a token minted for a client
    pub async fn revoke_token(&self, token: &str) {
        self.accepted_tokens.write().await.remove(token);
    }

    /// Whether `token` would be accepted by [`Router::authenticate_client`]
    pub async fn is_token_accepted(&self, token: &str) -> bool {
        self.accepted_tokens.read().await.contains_key(token)
    }

    /// Number of registered routes
    pub async fn route_count(&self) -> usize {
        self.table.read().await.routes.len()
    }

    /// Whether `route_id` is registered
    pub async fn has_route(&self, route_id: &str) -> bool {
        self.table.read().await.routes.contains_key(route_id)
    }

    /// Registered route an announced id is reachable through
    pub async fn announced_via(&self, route_id: &str) -> Option<String> {
        self.table.read().await.announced.get(route_id).cloned()
    }

    /// Whether an upstream link is bound
    pub async fn upstream_bound(&self) -> bool {
        self.table.read().await.upstream.is_some()
    }

    /// Stop routing and cancel every pump
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let table = self.table.read().await;
        for entry in table.routes.values().chain(table.upstream.iter()) {
            entry.pump.cancel();
        }
        info!("Router shut down with {} routes", table.routes.len());
    }

    /// Whether [`Router::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn spawn_pump(self: &Arc<Self>, source: String, endpoint: Arc<dyn RpcEndpoint>, pump: CancellationToken) {
        let router: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = pump.cancelled() => break,
                    msg = endpoint.recv_rpc_message() => msg,
                };

                let Some(msg) = msg else { break };
                let Some(router) = router.upgrade() else { break };

                if let Err(e) = router.route_message(msg, &source).await {
                    debug!("Dropped envelope from {}: {}", source, e);
                }
            }
            trace!("Pump for {} stopped", source);
        });
    }
}
