//! Authenticated connection proxy

use crate::router::{AuthResult, Router, RpcEndpoint};
use crate::{Result, TetherError};
use async_trait::async_trait;
use std::time::Duration;
use tether_proto::{AuthenticateResult, Command, Envelope, ProtocolError};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Transport-side ends of a proxy's queues
pub struct ProxyWire {
    /// Envelopes waiting to be written to the peer
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes decoded from the peer
    pub inbound: mpsc::UnboundedSender<Envelope>,
}

/// Endpoint standing in for one peer connection.
///
/// The transport owns the [`ProxyWire`]; the router sees the proxy through
/// [`RpcEndpoint`]. Envelopes received from the peer are stamped with the
/// auth token issued at admission.
pub struct RpcProxy {
    to_remote: mpsc::UnboundedSender<Envelope>,
    from_remote: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    auth_token: RwLock<Option<String>>,
    route_id: RwLock<Option<String>>,
}

impl RpcProxy {
    /// Create a proxy and the queue ends its transport drives
    pub fn new() -> (Self, ProxyWire) {
        let (to_remote, outbound) = mpsc::unbounded_channel();
        let (inbound, from_remote) = mpsc::unbounded_channel();

        let proxy = Self {
            to_remote,
            from_remote: Mutex::new(from_remote),
            auth_token: RwLock::new(None),
            route_id: RwLock::new(None),
        };

        (proxy, ProxyWire { outbound, inbound })
    }

    /// Token issued to the peer at admission
    pub async fn auth_token(&self) -> Option<String> {
        self.auth_token.read().await.clone()
    }

    /// Set the token stamped on the peer's envelopes
    pub async fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write().await = Some(token.into());
    }

    /// Route the peer was admitted under
    pub async fn route_id(&self) -> Option<String> {
        self.route_id.read().await.clone()
    }

    /// Run the admission handshake for a freshly accepted peer.
    ///
    /// The first envelope must be an `authenticate` command carrying a token
    /// the router accepts, and it must arrive within `grace`. On success the
    /// new route is announced and the peer receives its route id and auth
    /// token. Registering the route is left to the caller.
    pub async fn handle_client_proxy_auth(&self, router: &Router, grace: Duration) -> Result<String> {
        let first = match timeout(grace, self.recv_from_remote()).await {
            Err(_) => {
                return Err(TetherError::Auth(format!("no authentication within {:?}", grace)));
            }
            Ok(None) => {
                return Err(TetherError::Auth("connection closed before authentication".to_string()));
            }
            Ok(Some(msg)) => msg,
        };

        let token = match first.command_data() {
            Ok(Some(Command::Authenticate(token))) => token,
            Ok(Some(other)) => {
                self.reject(&first, "connection is not authenticated");
                return Err(TetherError::Auth(format!("expected authenticate, got {}", other.name())));
            }
            Ok(None) => {
                self.reject(&first, "connection is not authenticated");
                return Err(TetherError::Auth("first envelope carries no command".to_string()));
            }
            Err(e) => {
                self.reject(&first, e.to_string());
                return Err(TetherError::Auth(format!("malformed authenticate command: {}", e)));
            }
        };

        let auth = match router.authenticate_client(&token).await {
            Ok(auth) => auth,
            Err(e) => {
                self.reject(&first, e.to_string());
                return Err(e);
            }
        };

        self.set_auth_token(auth.auth_token.clone()).await;
        *self.route_id.write().await = Some(auth.route_id.clone());

        let announce = Envelope::command(Command::RouteAnnounce)
            .with_source(auth.route_id.clone())
            .with_auth_token(auth.auth_token.clone());
        if let Err(e) = router.route_message(announce, &auth.route_id).await {
            debug!("Announcement of {} not forwarded: {}", auth.route_id, e);
        }

        let result = AuthenticateResult {
            route_id: auth.route_id.clone(),
            auth_token: auth.auth_token.clone(),
        };
        let data = serde_json::to_value(&result).map_err(ProtocolError::from)?;
        self.send_to_remote(Envelope::response(&first, Some(data)))?;

        info!("Admitted client as {}", auth.route_id);
        Ok(auth.route_id)
    }

    /// Authenticate this proxy with the agent's own token
    pub async fn handle_proxy_auth(&self, router: &Router, token: &str) -> Result<AuthResult> {
        let auth = router.handle_proxy_auth(token).await?;
        self.set_auth_token(auth.auth_token.clone()).await;
        *self.route_id.write().await = Some(auth.route_id.clone());
        Ok(auth)
    }

    fn reject(&self, request: &Envelope, message: impl Into<String>) {
        if request.req_id.is_none() {
            return;
        }
        if self.to_remote.send(Envelope::error_response(request, message)).is_err() {
            warn!("Could not deliver authentication failure to peer");
        }
    }

    fn send_to_remote(&self, msg: Envelope) -> Result<()> {
        self.to_remote
            .send(msg)
            .map_err(|_| TetherError::Transport("peer connection closed".to_string()))
    }

    async fn recv_from_remote(&self) -> Option<Envelope> {
        self.from_remote.lock().await.recv().await
    }
}

#[async_trait]
impl RpcEndpoint for RpcProxy {
    fn send_rpc_message(&self, msg: Envelope) -> Result<()> {
        self.send_to_remote(msg)
    }

    async fn recv_rpc_message(&self) -> Option<Envelope> {
        let mut msg = self.recv_from_remote().await?;

        if let Some(token) = self.auth_token().await {
            msg.auth_token = Some(token);
        }
        if msg.source.is_none() {
            msg.source = self.route_id().await;
        }

        Some(msg)
    }
}
