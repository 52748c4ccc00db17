//! Connection server wiring

use crate::config::{RunMode, ServerConfig};
use crate::handlers::ConnServerHandler;
use crate::status::run_status_loop;
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether::listener::{bind_unix_listener, run_listener};
use tether::shutdown::{EXIT_CONFIG, EXIT_FAILURE};
use tether::upstream::attach_upstream;
use tether::{LocalEndpoint, Router, Shutdown, TetherError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn};

/// Pause between a listener failure and the exit it causes
const LISTENER_FAILURE_DELAY: Duration = Duration::from_millis(500);

/// A running connection server
pub struct ConnServer {
    router: Arc<Router>,
    endpoint: Arc<LocalEndpoint>,
    handler: Arc<ConnServerHandler>,
    shutdown: Shutdown,
}

impl ConnServer {
    /// Bring the server up on the given upstream streams.
    ///
    /// Fails only for errors found before any traffic flows: a rejected agent
    /// token or a socket that cannot be bound.
    pub async fn start<R, W>(config: &ServerConfig, reader: R, writer: W) -> anyhow::Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let router = Arc::new(Router::new());
        let shutdown = Shutdown::new();

        let auth = router
            .handle_proxy_auth(&config.jwt_token)
            .await
            .map_err(|e| TetherError::Config(format!("agent token rejected: {}", e)))?;

        let handler = Arc::new(ConnServerHandler::new());
        let endpoint = Arc::new(LocalEndpoint::new(
            auth.route_id.clone(),
            config.context.clone(),
            handler.clone(),
        ));
        endpoint.set_auth_token(auth.auth_token.clone()).await;

        let listener = match &config.mode {
            RunMode::Router { socket_path } => {
                let listener = bind_unix_listener(socket_path)
                    .with_context(|| format!("listening on {}", socket_path.display()))?;
                Some(listener)
            }
            RunMode::Normal => None,
        };

        router.register_route(auth.route_id.clone(), endpoint.clone(), true).await;
        router.set_default_route(auth.route_id.clone()).await;

        let run_endpoint = endpoint.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = run_endpoint.run(cancel).await {
                error!("Local endpoint stopped: {}", e);
            }
        });

        attach_upstream(&router, reader, writer, shutdown.clone()).await;

        if let Err(e) = endpoint.announce().await {
            warn!("Could not announce {}: {}", auth.route_id, e);
        }

        if let Some(listener) = listener {
            let router = router.clone();
            let connection = config.connection.clone();
            let shutdown = shutdown.clone();
            let accept = run_listener(listener, router, connection, shutdown.clone());
            tokio::spawn(exit_on_listener_failure(accept, shutdown));
        }

        if let Some(interval) = config.status_interval {
            tokio::spawn(run_status_loop(
                endpoint.clone(),
                router.clone(),
                interval,
                shutdown.child_token(),
            ));
        }

        info!("Connection server up as {}", auth.route_id);
        Ok(Self {
            router,
            endpoint,
            handler,
            shutdown,
        })
    }

    /// The server's router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The server's own route endpoint
    pub fn endpoint(&self) -> &Arc<LocalEndpoint> {
        &self.endpoint
    }

    /// The handler behind the server's own route
    pub fn handler(&self) -> &Arc<ConnServerHandler> {
        &self.handler
    }

    /// Handle that stops the server when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until shutdown is triggered and return the process exit code
    pub async fn wait(self) -> i32 {
        let code = self.shutdown.wait().await;
        info!(
            "Shutting down ({}), exit code {}",
            self.shutdown.reason().unwrap_or("unknown"),
            code
        );
        self.router.shutdown().await;
        code
    }
}

/// Drive the accept loop; if it fails, shut down with exit code 1 after a
/// short delay so queued envelopes can still reach upstream.
async fn exit_on_listener_failure<F>(accept: F, shutdown: Shutdown)
where
    F: Future<Output = tether::Result<()>>,
{
    if let Err(e) = accept.await {
        error!("Listener failed: {}", e);
        tokio::time::sleep(LISTENER_FAILURE_DELAY).await;
        shutdown.trigger(EXIT_FAILURE, e.to_string());
    }
}

/// Serve on the process stdio and return the exit code
pub async fn run(config: ServerConfig) -> i32 {
    match ConnServer::start(&config, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(server) => server.wait().await,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<TetherError>() {
        Some(TetherError::Config(_)) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}
