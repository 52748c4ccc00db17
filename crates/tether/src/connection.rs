//! Accepted connection lifecycle

use crate::proxy::{ProxyWire, RpcProxy};
use crate::router::Router;
use crate::task::supervise;
use crate::{Result, TetherError};
use std::sync::Arc;
use std::time::Duration;
use tether_proto::codec::MAX_FRAME_SIZE;
use tether_proto::{Command, DisposeData, Envelope, FrameCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed to flush queued envelopes once a connection closes
const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time a new connection has to authenticate
    pub auth_timeout: Duration,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Default)]
struct GuardState {
    closed: bool,
    route_id: Option<String>,
}

/// Owns the teardown of one accepted connection.
///
/// Whichever side notices the connection ending first calls
/// [`ConnectionGuard::close`]; teardown runs exactly once and later calls
/// return `false`.
pub struct ConnectionGuard {
    router: Arc<Router>,
    proxy: Arc<RpcProxy>,
    cancel: CancellationToken,
    state: Mutex<GuardState>,
}

impl ConnectionGuard {
    fn new(router: Arc<Router>, proxy: Arc<RpcProxy>) -> Self {
        Self {
            router,
            proxy,
            cancel: CancellationToken::new(),
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Proxy standing in for this connection
    pub fn proxy(&self) -> &Arc<RpcProxy> {
        &self.proxy
    }

    /// Route the connection is registered under, if admitted and still open
    pub async fn route_id(&self) -> Option<String> {
        self.state.lock().await.route_id.clone()
    }

    /// Whether teardown has run
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    async fn bind_route(&self, route_id: String) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        self.router
            .register_route(route_id.clone(), self.proxy.clone(), false)
            .await;
        state.route_id = Some(route_id);
        true
    }

    /// Undo an admission whose route never got bound.
    ///
    /// Only called once the handshake has finished, so the proxy's route and
    /// token are final.
    async fn withdraw_admission(&self) {
        let Some(route_id) = self.proxy.route_id().await else {
            return;
        };
        let auth_token = self.proxy.auth_token().await;
        self.router.withdraw_route(&route_id, auth_token.as_deref()).await;
    }

    /// Tear the connection down.
    ///
    /// Stops both stream tasks, unregisters the route, announces its disposal
    /// with a `dispose` command, and revokes the connection's auth token.
    pub async fn close(&self) -> bool {
        let route_id = {
            let mut state = self.state.lock().await;
            if state.closed {
                return false;
            }
            state.closed = true;
            state.route_id.take()
        };

        self.cancel.cancel();

        let Some(route_id) = route_id else {
            debug!("Closed unauthenticated connection");
            return true;
        };

        self.router.unregister_route(&route_id).await;

        let auth_token = self.proxy.auth_token().await;
        let mut dispose = Envelope::command(Command::Dispose(DisposeData {
            route_id: route_id.clone(),
        }))
        .with_source(route_id.clone());
        dispose.auth_token = auth_token.clone();

        if let Err(e) = self.router.route_message(dispose, &route_id).await {
            debug!("Dispose for {} not delivered: {}", route_id, e);
        }
        if let Some(token) = auth_token {
            self.router.revoke_token(&token).await;
        }

        info!("Connection {} closed", route_id);
        true
    }
}

/// Serve one accepted stream.
///
/// Starts the read and write tasks, runs the admission handshake, and
/// registers the connection's route once admitted. The returned guard closes
/// on its own when the peer disconnects, a stream task fails, or admission
/// fails.
pub async fn handle_new_conn<S>(stream: S, router: Arc<Router>, config: ConnectionConfig) -> Arc<ConnectionGuard>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (proxy, wire) = RpcProxy::new();
    let proxy = Arc::new(proxy);
    let guard = Arc::new(ConnectionGuard::new(router.clone(), proxy.clone()));

    let ProxyWire { outbound, inbound } = wire;
    let (reader, writer) = tokio::io::split(stream);

    spawn_stream_task(
        "connection writer",
        write_loop(writer, outbound, guard.cancel.clone()),
        guard.clone(),
    );
    spawn_stream_task(
        "connection reader",
        read_loop(reader, inbound, config.max_frame_size, guard.cancel.clone()),
        guard.clone(),
    );

    let admission = {
        let proxy = proxy.clone();
        let router = router.clone();
        let grace = config.auth_timeout;
        supervise("connection auth", async move {
            proxy.handle_client_proxy_auth(&router, grace).await
        })
        .await
    };

    match admission {
        Ok(route_id) => {
            if !guard.bind_route(route_id.clone()).await {
                debug!("Connection {} closed during admission", route_id);
                guard.withdraw_admission().await;
            }
        }
        Err(e) => {
            warn!("Refusing connection: {}", e);
            guard.close().await;
            guard.withdraw_admission().await;
        }
    }

    guard
}

fn spawn_stream_task<F>(name: &'static str, fut: F, guard: Arc<ConnectionGuard>)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match supervise(name, fut).await {
            Ok(()) => debug!("{} finished", name),
            Err(e) => warn!("{} failed: {}", name, e),
        }
        guard.close().await;
    });
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    inbound: mpsc::UnboundedSender<Envelope>,
    max_frame_size: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + Send,
{
    let mut codec = FrameCodec::with_max_frame_size(max_frame_size);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = codec.read_envelope(&mut reader) => next,
        };

        match next {
            Ok(Some(envelope)) => {
                if inbound.send(envelope).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {
                debug!("Peer closed connection");
                return Ok(());
            }
            Err(ProtocolError::Serialization(e)) => {
                warn!("Skipping undecodable frame: {}", e);
            }
            Err(e) => {
                return Err(TetherError::Transport(format!("read failed: {}", e)));
            }
        }
    }
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncWrite + Send,
{
    let codec = FrameCodec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(envelope) = next else { break };

        match codec.write_envelope(&mut writer, &envelope).await {
            Ok(()) => {}
            Err(e) if e.is_io() => {
                return Err(TetherError::Transport(format!("write failed: {}", e)));
            }
            Err(e) => warn!("Dropping unencodable envelope: {}", e),
        }
    }

    // Deliver what was queued before the close, e.g. an auth rejection
    let flush = async {
        while let Ok(envelope) = outbound.try_recv() {
            if codec.write_envelope(&mut writer, &envelope).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };
    if timeout(FLUSH_GRACE, flush).await.is_err() {
        debug!("Gave up flushing closed connection");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use tether_proto::message::{COMMAND_DISPOSE, COMMAND_ROUTE_ANNOUNCE, COMMAND_ROUTE_UNANNOUNCE};
    use tether_proto::AuthenticateResult;
    use tokio::io::{duplex, DuplexStream};

    fn token() -> String {
        let claims = URL_SAFE_NO_PAD.encode(br#"{"ctype":"connserver","conn":"devbox"}"#);
        format!("h.{}.s", claims)
    }

    async fn setup() -> (Arc<Router>, String, Arc<RpcProxy>, ProxyWire) {
        let router = Arc::new(Router::new());
        let token = token();
        router.handle_proxy_auth(&token).await.unwrap();

        let (upstream, wire) = RpcProxy::new();
        let upstream = Arc::new(upstream);
        router.set_upstream_client(upstream.clone()).await;
        (router, token, upstream, wire)
    }

    async fn authenticate(client: &mut DuplexStream, codec: &mut FrameCodec, token: &str) -> AuthenticateResult {
        let request = Envelope::command(Command::Authenticate(token.to_string())).with_new_req_id();
        codec.write_envelope(client, &request).await.unwrap();
        let response = codec.read_envelope(client).await.unwrap().unwrap();
        assert!(response.error.is_none(), "auth failed: {:?}", response.error);
        serde_json::from_value(response.data.unwrap()).unwrap()
    }

    async fn next_command(wire: &mut ProxyWire, command: &str) -> Envelope {
        loop {
            let env = timeout(Duration::from_secs(2), wire.outbound.recv())
                .await
                .expect("timed out")
                .expect("closed");
            if env.command.as_deref() == Some(command) {
                return env;
            }
        }
    }

    #[tokio::test]
    async fn test_admitted_connection_is_registered() {
        let (router, token, _upstream, _wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig::default()));
        let result = authenticate(&mut client, &mut codec, &token).await;
        let guard = serve.await.unwrap();

        assert_eq!(guard.route_id().await, Some(result.route_id.clone()));
        assert!(router.has_route(&result.route_id).await);
    }

    #[tokio::test]
    async fn test_peer_disconnect_tears_down_once() {
        let (router, token, _upstream, mut wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig::default()));
        let result = authenticate(&mut client, &mut codec, &token).await;
        let guard = serve.await.unwrap();

        drop(client);
        timeout(Duration::from_secs(2), guard.closed()).await.unwrap();

        let unannounce = next_command(&mut wire, COMMAND_ROUTE_UNANNOUNCE).await;
        assert_eq!(unannounce.source, Some(result.route_id.clone()));
        let dispose = next_command(&mut wire, COMMAND_DISPOSE).await;
        assert_eq!(
            dispose.data,
            Some(serde_json::json!({"routeid": result.route_id.clone()}))
        );

        assert!(!router.has_route(&result.route_id).await);
        assert!(!router.is_token_accepted(&result.auth_token).await);
        assert!(!guard.close().await);
    }

    #[tokio::test]
    async fn test_concurrent_close_is_idempotent() {
        let (router, token, _upstream, mut wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig::default()));
        authenticate(&mut client, &mut codec, &token).await;
        let guard = serve.await.unwrap();

        let closes = (0..10).map(|_| {
            let guard = guard.clone();
            tokio::spawn(async move { guard.close().await })
        });
        let winners = futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);

        next_command(&mut wire, COMMAND_DISPOSE).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(env) = wire.outbound.try_recv() {
            assert_ne!(env.command.as_deref(), Some(COMMAND_DISPOSE));
        }
    }

    #[tokio::test]
    async fn test_envelopes_flow_both_ways() {
        let (router, token, _upstream, mut wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig::default()));
        let result = authenticate(&mut client, &mut codec, &token).await;
        serve.await.unwrap();

        let outgoing = Envelope::command(Command::Other {
            command: "message".to_string(),
            data: None,
        })
        .with_route("upstream");
        codec.write_envelope(&mut client, &outgoing).await.unwrap();

        let seen = next_command(&mut wire, "message").await;
        assert_eq!(seen.source, Some(result.route_id.clone()));
        assert_eq!(seen.auth_token, Some(result.auth_token.clone()));

        let incoming = Envelope::command(Command::Other {
            command: "reply".to_string(),
            data: None,
        })
        .with_route(result.route_id.clone());
        router.route_message(incoming, "upstream").await.unwrap();

        let delivered = timeout(Duration::from_secs(2), codec.read_envelope(&mut client))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered.command.as_deref(), Some("reply"));
    }

    #[tokio::test]
    async fn test_rejected_connection_gets_error_and_is_closed() {
        let (router, _token, _upstream, _wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig::default()));
        let request = Envelope::command(Command::Authenticate("bogus".to_string())).with_new_req_id();
        codec.write_envelope(&mut client, &request).await.unwrap();

        let response = codec.read_envelope(&mut client).await.unwrap().unwrap();
        assert_eq!(response.res_id, request.req_id);
        assert!(response.error.is_some());

        let guard = serve.await.unwrap();
        assert!(guard.is_closed().await);
        assert!(guard.route_id().await.is_none());
        assert_eq!(router.route_count().await, 0);

        let eof = timeout(Duration::from_secs(2), codec.read_envelope(&mut client)).await.unwrap();
        assert!(matches!(eof, Ok(None)));
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_connection() {
        let (router, _token, _upstream, _wire) = setup().await;
        let (_client, server) = duplex(1024);
        let config = ConnectionConfig {
            auth_timeout: Duration::from_millis(30),
            ..Default::default()
        };

        let guard = handle_new_conn(server, router.clone(), config).await;
        assert!(guard.is_closed().await);
        assert_eq!(router.route_count().await, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (router, token, _upstream, _wire) = setup().await;
        let (mut client, server) = duplex(64 * 1024);
        let mut codec = FrameCodec::new();

        let serve = tokio::spawn(handle_new_conn(server, router.clone(), ConnectionConfig {
            max_frame_size: 256,
            ..Default::default()
        }));
        let result = authenticate(&mut client, &mut codec, &token).await;
        let guard = serve.await.unwrap();

        let huge = Envelope {
            command: Some("message".to_string()),
            data: Some(serde_json::json!("x".repeat(1024))),
            ..Default::default()
        };
        codec.write_envelope(&mut client, &huge).await.unwrap();

        timeout(Duration::from_secs(2), guard.closed()).await.unwrap();
        assert!(!router.has_route(&result.route_id).await);
    }

    #[tokio::test]
    async fn test_close_during_admission_releases_admission() {
        for _ in 0..20 {
            let (router, token, _upstream, mut wire) = setup().await;
            let (mut client, server) = duplex(64 * 1024);
            let codec = FrameCodec::new();

            let request = Envelope::command(Command::Authenticate(token.clone())).with_new_req_id();
            codec.write_envelope(&mut client, &request).await.unwrap();
            drop(client);

            let guard = handle_new_conn(server, router.clone(), ConnectionConfig::default()).await;
            timeout(Duration::from_secs(2), guard.closed()).await.unwrap();

            let announce = next_command(&mut wire, COMMAND_ROUTE_ANNOUNCE).await;
            let route_id = announce.source.clone().unwrap();
            let minted = announce.auth_token.clone().unwrap();

            let unannounce = next_command(&mut wire, COMMAND_ROUTE_UNANNOUNCE).await;
            assert_eq!(unannounce.source.as_deref(), Some(route_id.as_str()));

            timeout(Duration::from_secs(2), async {
                while router.is_token_accepted(&minted).await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            assert!(!router.has_route(&route_id).await);
        }
    }
}
