//! TCP listener loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::{ForwardError, ForwardResult, RelayError};
use super::instance::LoopContext;
use super::relay::{run_relay, RelayTotals};

/// Pause after a transient accept error, e.g. running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bind a TCP listen endpoint.
pub(crate) async fn bind_tcp(listen: &str) -> ForwardResult<(TcpListener, SocketAddr)> {
    let bind_failed = |source| ForwardError::BindFailed {
        address: listen.to_string(),
        source,
    };

    let listener = TcpListener::bind(listen).await.map_err(bind_failed)?;
    let local_addr = listener.local_addr().map_err(bind_failed)?;

    debug!(address = %local_addr, "TCP listener bound");
    Ok((listener, local_addr))
}

/// Accept clients until shutdown, spawning one relay per connection.
///
/// Returns after the listener has been dropped.
pub(crate) async fn run_tcp_loop(listener: TcpListener, ctx: LoopContext) {
    let ctx = Arc::new(ctx);
    let mut fatal = None;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((client, peer)) => accept_connection(client, peer, &ctx),
            Err(e) if is_fatal_listener_error(&e) => {
                fatal = Some(e);
                break;
            },
            Err(e) => {
                warn!(instance = %ctx.id, error = %e, "Failed to accept TCP connection");
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {},
                }
            },
        }
    }

    drop(listener);

    match fatal {
        Some(e) => ctx.listener_failed(&e),
        None => debug!(instance = %ctx.id, "TCP listener closed"),
    }
}

fn accept_connection(client: TcpStream, peer: SocketAddr, ctx: &Arc<LoopContext>) {
    let limit = ctx.settings.max_connections;
    if limit > 0 && ctx.stats.active_connections() >= limit as u64 {
        ctx.stats.rejected();
        debug!(
            instance = %ctx.id,
            peer = %peer,
            "{}",
            RelayError::ConnectionLimit { limit }
        );
        return;
    }

    let guard = ctx.stats.open();
    let relays = ctx.relays.clone();
    let ctx = Arc::clone(ctx);

    relays.spawn(async move {
        let _guard = guard;

        match handle_connection(client, peer, &ctx).await {
            Ok(totals) => debug!(
                instance = %ctx.id,
                peer = %peer,
                to_target = totals.to_target,
                to_client = totals.to_client,
                "Connection closed"
            ),
            Err(RelayError::Cancelled) => {
                debug!(instance = %ctx.id, peer = %peer, "Connection closed after drain period");
            },
            Err(e) if e.is_dial_failure() => {
                ctx.stats.dial_failure();
                ctx.connection_failed(&e);
                warn!(instance = %ctx.id, peer = %peer, error = %e, "Dial failed");
            },
            Err(e) => {
                ctx.stats.connection_error();
                ctx.connection_failed(&e);
                debug!(instance = %ctx.id, peer = %peer, error = %e, "Relay error");
            },
        }
    });
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    ctx: &LoopContext,
) -> Result<RelayTotals, RelayError> {
    let upstream = tokio::select! {
        _ = ctx.force.cancelled() => return Err(RelayError::Cancelled),
        dialed = dial(&ctx.target, ctx.settings.connect_timeout) => dialed?,
    };

    debug!(
        instance = %ctx.id,
        peer = %peer,
        target = %ctx.target,
        "Connection established"
    );

    run_relay(
        client,
        upstream,
        ctx.settings.buffer_size,
        &ctx.stats,
        &ctx.force,
    )
    .await
}

async fn dial(target: &str, connect_timeout: Duration) -> Result<TcpStream, RelayError> {
    match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RelayError::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(RelayError::DialTimeout {
            target: target.to_string(),
        }),
    }
}

/// Errors after which the listen socket is unusable.
pub(crate) fn is_fatal_listener_error(error: &io::Error) -> bool {
    use io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound
    )
}
