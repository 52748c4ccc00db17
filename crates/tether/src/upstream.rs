//! Framed stdio upstream bridge

use crate::proxy::{ProxyWire, RpcProxy};
use crate::router::Router;
use crate::shutdown::{Shutdown, EXIT_FAILURE, EXIT_UPSTREAM_CLOSED};
use crate::task::supervise;
use crate::{Result, TetherError};
use bytes::Bytes;
use std::sync::Arc;
use tether_proto::{parse, write_packet, Envelope};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

/// Bind a packet stream as the router's upstream link.
///
/// Envelopes read from `reader` enter the router as coming from upstream and
/// envelopes routed upstream are written to `writer` as packets. Passthrough
/// bytes on the input are discarded. The end of the input triggers
/// `shutdown` with exit code 0; an I/O failure on either side triggers it
/// with exit code 1.
pub async fn attach_upstream<R, W>(router: &Arc<Router>, reader: R, writer: W, shutdown: Shutdown) -> Arc<RpcProxy>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (proxy, wire) = RpcProxy::new();
    let proxy = Arc::new(proxy);
    let ProxyWire { outbound, inbound } = wire;
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();

    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = supervise("upstream reader", async move {
            parse(reader, inbound, raw_tx).await.map_err(TetherError::from)
        })
        .await;

        match result {
            Ok(()) => {
                reader_shutdown.trigger(EXIT_UPSTREAM_CLOSED, "upstream input closed");
            }
            Err(e) => {
                error!("Upstream read failed: {}", e);
                reader_shutdown.trigger(EXIT_FAILURE, "upstream read failed");
            }
        }
    });

    tokio::spawn(discard_passthrough(raw_rx));

    let writer_shutdown = shutdown.clone();
    let cancel = shutdown.child_token();
    tokio::spawn(async move {
        let result = supervise("upstream writer", write_loop(writer, outbound, cancel)).await;
        if let Err(e) = result {
            error!("Upstream write failed: {}", e);
            writer_shutdown.trigger(EXIT_FAILURE, "upstream write failed");
        }
    });

    router.set_upstream_client(proxy.clone()).await;
    info!("Upstream bridge attached");
    proxy
}

async fn discard_passthrough(mut raw_rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = raw_rx.recv().await {
        trace!("Discarding {} passthrough bytes from upstream", bytes.len());
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = outbound.recv() => next,
        };
        let Some(envelope) = next else { return Ok(()) };

        match write_packet(&mut writer, &envelope).await {
            Ok(()) => {}
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => error!("Dropping envelope that cannot be framed: {}", e),
        }
    }
}
