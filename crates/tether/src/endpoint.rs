//! Local endpoint and command handler contract

use crate::context::RpcContext;
use crate::router::RpcEndpoint;
use crate::task::supervise;
use crate::{Result, TetherError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{Command, Envelope};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time to wait for a response to [`LocalEndpoint::send_request`]
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves commands addressed to a [`LocalEndpoint`]
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command. The returned value becomes the response payload
    /// when the request carries a request id.
    async fn handle(&self, ctx: &RpcContext, request: Envelope) -> Result<Option<Value>>;

    /// Release any state held for a route that was torn down
    async fn dispose(&self, route_id: &str) {
        let _ = route_id;
    }
}

type PendingRequests = Arc<RwLock<HashMap<String, oneshot::Sender<Envelope>>>>;

/// In-process route that runs commands through a [`CommandHandler`]
pub struct LocalEndpoint {
    route_id: String,
    context: RpcContext,
    auth_token: RwLock<Option<String>>,
    handler: Arc<dyn CommandHandler>,
    input_tx: mpsc::UnboundedSender<Envelope>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    output_tx: mpsc::UnboundedSender<Envelope>,
    output_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    pending: PendingRequests,
    request_timeout: Duration,
}

impl LocalEndpoint {
    /// Create an endpoint serving `route_id` with `handler`
    pub fn new(route_id: impl Into<String>, context: RpcContext, handler: Arc<dyn CommandHandler>) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        Self {
            route_id: route_id.into(),
            context,
            auth_token: RwLock::new(None),
            handler,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            output_tx,
            output_rx: Mutex::new(output_rx),
            pending: Arc::new(RwLock::new(HashMap::new())),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the response timeout for outgoing requests
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Route this endpoint is registered under
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Identity of this endpoint
    pub fn context(&self) -> &RpcContext {
        &self.context
    }

    /// Set the token stamped on outgoing envelopes
    pub async fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write().await = Some(token.into());
    }

    async fn outgoing(&self, command: Command, route: Option<&str>) -> Envelope {
        let mut msg = Envelope::command(command).with_source(self.route_id.clone());
        msg.route = route.map(str::to_string);
        msg.auth_token = self.auth_token.read().await.clone();
        msg
    }

    /// Send a command without waiting for a response
    pub async fn send_command(&self, command: Command, route: Option<&str>) -> Result<()> {
        let msg = self.outgoing(command, route).await;
        self.output_tx
            .send(msg)
            .map_err(|_| TetherError::Transport("endpoint output closed".to_string()))
    }

    /// Send a command and wait for its response
    pub async fn send_request(&self, command: Command, route: Option<&str>) -> Result<Envelope> {
        let req_id = Uuid::new_v4().to_string();
        let mut msg = self.outgoing(command, route).await;
        msg.req_id = Some(req_id.clone());
        msg.timeout = Some(self.request_timeout.as_millis() as u64);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.write().await.insert(req_id.clone(), response_tx);

        if self.output_tx.send(msg).is_err() {
            self.pending.write().await.remove(&req_id);
            return Err(TetherError::Transport("endpoint output closed".to_string()));
        }

        let response = match timeout(self.request_timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(TetherError::Routing("response channel closed".to_string()));
            }
            Err(_) => {
                self.pending.write().await.remove(&req_id);
                return Err(TetherError::Timeout {
                    duration: self.request_timeout,
                });
            }
        };

        match response.error.clone() {
            Some(error) => Err(TetherError::Handler(error)),
            None => Ok(response),
        }
    }

    /// Announce this endpoint's route upstream
    pub async fn announce(&self) -> Result<()> {
        self.send_command(Command::RouteAnnounce, None).await
    }

    /// Process delivered envelopes until `cancel` fires.
    ///
    /// Commands run concurrently on their own tasks; `dispose` notifications
    /// are handled in arrival order. Only one run loop may be active.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut input = self
            .input_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TetherError::Transport(format!("endpoint {} is already running", self.route_id)))?;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = input.recv() => next,
            };
            let Some(msg) = next else { break };
            self.dispatch(msg).await;
        }

        debug!("Local endpoint {} stopped", self.route_id);
        Ok(())
    }

    async fn dispatch(&self, msg: Envelope) {
        if msg.is_response() {
            self.complete_request(msg).await;
            return;
        }

        match msg.command_data() {
            Ok(Some(Command::Dispose(data))) => {
                let handler = self.handler.clone();
                let result = supervise("dispose handler", async move {
                    handler.dispose(&data.route_id).await;
                    Ok(())
                })
                .await;
                if let Err(e) = result {
                    warn!("Dispose handler failed: {}", e);
                }
            }
            Ok(Some(_)) => self.spawn_handler(msg),
            Ok(None) => debug!("Ignoring envelope without a command"),
            Err(e) => {
                warn!("Rejecting malformed command: {}", e);
                if msg.req_id.is_some() {
                    let mut response = Envelope::error_response(&msg, e.to_string());
                    response.source = Some(self.route_id.clone());
                    let _ = self.output_tx.send(response);
                }
            }
        }
    }

    async fn complete_request(&self, msg: Envelope) {
        let Some(res_id) = msg.res_id.clone() else { return };
        match self.pending.write().await.remove(&res_id) {
            Some(sender) => {
                let _ = sender.send(msg);
            }
            None => debug!("Response for unknown request {}", res_id),
        }
    }

    fn spawn_handler(&self, request: Envelope) {
        let handler = self.handler.clone();
        let context = self.context.clone();
        let output = self.output_tx.clone();
        let route_id = self.route_id.clone();

        tokio::spawn(async move {
            let command = request.command.clone().unwrap_or_default();
            let wants_response = request.req_id.is_some();
            let original = request.clone();

            let result = supervise("command handler", async move {
                handler.handle(&context, request).await
            })
            .await;

            if !wants_response {
                if let Err(e) = result {
                    warn!("Command {} failed: {}", command, e);
                }
                return;
            }

            let mut response = match result {
                Ok(data) => Envelope::response(&original, data),
                Err(e) => Envelope::error_response(&original, e.to_string()),
            };
            response.source = Some(route_id);
            if output.send(response).is_err() {
                debug!("Endpoint closed before responding to {}", command);
            }
        });
    }
}

#[async_trait]
impl RpcEndpoint for LocalEndpoint {
    fn send_rpc_message(&self, msg: Envelope) -> Result<()> {
        self.input_tx
            .send(msg)
            .map_err(|_| TetherError::Routing(format!("endpoint {} stopped", self.route_id)))
    }

    async fn recv_rpc_message(&self) -> Option<Envelope> {
        self.output_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_proto::DisposeData;

    #[derive(Default)]
    struct EchoHandler {
        disposed: RwLock<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, ctx: &RpcContext, request: Envelope) -> Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request.command.as_deref() {
                Some("echo") => Ok(request.data),
                Some("whoami") => Ok(Some(json!(ctx.conn))),
                Some("panic") => panic!("handler bug"),
                _ => Err(TetherError::Handler("unsupported".to_string())),
            }
        }

        async fn dispose(&self, route_id: &str) {
            self.disposed.write().await.push(route_id.to_string());
        }
    }

    fn endpoint(handler: Arc<EchoHandler>) -> Arc<LocalEndpoint> {
        let context = RpcContext {
            conn: Some("devbox".to_string()),
            ..Default::default()
        };
        Arc::new(LocalEndpoint::new("conn:devbox", context, handler).with_request_timeout(Duration::from_millis(200)))
    }

    fn start(endpoint: &Arc<LocalEndpoint>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let ep = endpoint.clone();
        let token = cancel.clone();
        tokio::spawn(async move { ep.run(token).await });
        cancel
    }

    fn request(command: &str, data: Option<Value>) -> Envelope {
        Envelope::command(Command::Other {
            command: command.to_string(),
            data,
        })
        .with_new_req_id()
        .with_source("proc:client")
    }

    async fn next_output(endpoint: &LocalEndpoint) -> Envelope {
        timeout(Duration::from_secs(2), endpoint.recv_rpc_message())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_command_gets_response() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        let req = request("echo", Some(json!({"a": 1})));
        endpoint.send_rpc_message(req.clone()).unwrap();

        let response = next_output(&endpoint).await;
        assert_eq!(response.res_id, req.req_id);
        assert_eq!(response.route.as_deref(), Some("proc:client"));
        assert_eq!(response.source.as_deref(), Some("conn:devbox"));
        assert_eq!(response.data, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_handler_sees_context() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        endpoint.send_rpc_message(request("whoami", None)).unwrap();
        assert_eq!(next_output(&endpoint).await.data, Some(json!("devbox")));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        endpoint.send_rpc_message(request("nope", None)).unwrap();
        let response = next_output(&endpoint).await;
        assert!(response.error.unwrap().contains("unsupported"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let handler = Arc::new(EchoHandler::default());
        let endpoint = endpoint(handler.clone());
        let _cancel = start(&endpoint);

        endpoint.send_rpc_message(request("panic", None)).unwrap();
        assert!(next_output(&endpoint).await.error.is_some());

        endpoint.send_rpc_message(request("echo", Some(json!(2)))).unwrap();
        assert_eq!(next_output(&endpoint).await.data, Some(json!(2)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fire_and_forget_has_no_response() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        let mut msg = request("echo", Some(json!(1)));
        msg.req_id = None;
        endpoint.send_rpc_message(msg).unwrap();

        let nothing = timeout(Duration::from_millis(100), endpoint.recv_rpc_message()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_dispose_reaches_handler() {
        let handler = Arc::new(EchoHandler::default());
        let endpoint = endpoint(handler.clone());
        let _cancel = start(&endpoint);

        endpoint
            .send_rpc_message(Envelope::command(Command::Dispose(DisposeData {
                route_id: "proc:gone".to_string(),
            })))
            .unwrap();
        endpoint.send_rpc_message(request("echo", None)).unwrap();
        next_output(&endpoint).await;

        assert_eq!(*handler.disposed.read().await, vec!["proc:gone".to_string()]);
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        endpoint.set_auth_token("token-1").await;
        let _cancel = start(&endpoint);

        let requester = endpoint.clone();
        let call = tokio::spawn(async move {
            requester
                .send_request(Command::Other { command: "ping".to_string(), data: None }, Some("upstream"))
                .await
        });

        let outgoing = next_output(&endpoint).await;
        assert_eq!(outgoing.route.as_deref(), Some("upstream"));
        assert_eq!(outgoing.source.as_deref(), Some("conn:devbox"));
        assert_eq!(outgoing.auth_token.as_deref(), Some("token-1"));
        assert_eq!(outgoing.timeout, Some(200));

        endpoint
            .send_rpc_message(Envelope::response(&outgoing, Some(json!("pong"))))
            .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.data, Some(json!("pong")));
    }

    #[tokio::test]
    async fn test_request_error_response() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        let requester = endpoint.clone();
        let call = tokio::spawn(async move {
            requester
                .send_request(Command::Other { command: "ping".to_string(), data: None }, None)
                .await
        });

        let outgoing = next_output(&endpoint).await;
        endpoint
            .send_rpc_message(Envelope::error_response(&outgoing, "no such command"))
            .unwrap();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(TetherError::Handler(_))));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let _cancel = start(&endpoint);

        let result = endpoint
            .send_request(Command::Other { command: "ping".to_string(), data: None }, None)
            .await;

        assert!(matches!(result, Err(TetherError::Timeout { .. })));
        assert!(endpoint.pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_single_run_loop() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        let cancel = start(&endpoint);
        while endpoint.input_rx.lock().await.is_some() {
            tokio::task::yield_now().await;
        }

        let second = endpoint.run(CancellationToken::new()).await;
        assert!(matches!(second, Err(TetherError::Transport(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_announce() {
        let endpoint = endpoint(Arc::new(EchoHandler::default()));
        endpoint.announce().await.unwrap();

        let announce = next_output(&endpoint).await;
        assert_eq!(announce.command.as_deref(), Some("routeannounce"));
        assert_eq!(announce.source.as_deref(), Some("conn:devbox"));
    }
}
