//! Periodic status reporting

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::proto::Command;
use tether::{LocalEndpoint, Router, UPSTREAM_ROUTE};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Command carrying a status report
pub const COMMAND_STATUS: &str = "connstatus";

/// Snapshot sent upstream on every tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Connection name from the agent's token
    pub conn: Option<String>,
    /// Registered routes, the agent's own included
    pub routes: usize,
    /// Whether the upstream link is bound
    pub upstream: bool,
    /// Seconds since the reporter started
    pub uptime_secs: u64,
}

/// Send a [`StatusReport`] upstream every `interval` until `cancel` fires
pub async fn run_status_loop(
    endpoint: Arc<LocalEndpoint>,
    router: Arc<Router>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = StatusReport {
            conn: endpoint.context().conn.clone(),
            routes: router.route_count().await,
            upstream: router.upstream_bound().await,
            uptime_secs: started.elapsed().as_secs(),
        };

        let data = match serde_json::to_value(&report) {
            Ok(data) => data,
            Err(e) => {
                debug!("Could not encode status report: {}", e);
                continue;
            }
        };

        let command = Command::Other {
            command: COMMAND_STATUS.to_string(),
            data: Some(data),
        };
        if let Err(e) = endpoint.send_command(command, Some(UPSTREAM_ROUTE)).await {
            debug!("Status report not sent: {}", e);
        }
    }

    debug!("Status reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tether::proto::Envelope;
    use tether::{CommandHandler, RpcContext, RpcEndpoint};

    struct NoopHandler;

    #[async_trait]
    impl CommandHandler for NoopHandler {
        async fn handle(&self, _ctx: &RpcContext, _request: Envelope) -> tether::Result<Option<Value>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_reports_until_cancelled() {
        let context = RpcContext {
            conn: Some("devbox".to_string()),
            ..Default::default()
        };
        let endpoint = Arc::new(LocalEndpoint::new("conn:devbox", context, Arc::new(NoopHandler)));
        let router = Arc::new(Router::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_status_loop(
            endpoint.clone(),
            router,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let report = tokio::time::timeout(Duration::from_secs(2), endpoint.recv_rpc_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.command.as_deref(), Some(COMMAND_STATUS));
        assert_eq!(report.route.as_deref(), Some(UPSTREAM_ROUTE));
        assert_eq!(report.data.unwrap()["conn"], serde_json::json!("devbox"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
