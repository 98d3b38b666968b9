//! UDP listener loop.
//!
//! Each client source address gets its own connected upstream socket, so
//! replies from the target can be routed back to the right client. Sessions
//! are torn down after `udp_idle_timeout` without traffic, when the upstream
//! socket fails, or when the instance stops.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::error::{ForwardError, ForwardResult, RelayError};
use super::instance::LoopContext;
use super::session::{SessionTable, UdpSession};
use super::stats::ActiveConnectionGuard;
use super::tcp::is_fatal_listener_error;

/// Bind a UDP listen endpoint.
pub(crate) async fn bind_udp(listen: &str) -> ForwardResult<(UdpSocket, SocketAddr)> {
    let bind_failed = |source| ForwardError::BindFailed {
        address: listen.to_string(),
        source,
    };

    let socket = UdpSocket::bind(listen).await.map_err(bind_failed)?;
    let local_addr = socket.local_addr().map_err(bind_failed)?;

    debug!(address = %local_addr, "UDP socket bound");
    Ok((socket, local_addr))
}

/// Read datagrams until shutdown, dispatching them through per-client sessions.
///
/// Never waits on upstream I/O: resolving, connecting and sending happen in
/// each session's own task. Tears every session down and waits for those
/// tasks before returning, so the listen socket is closed once this returns.
pub(crate) async fn run_udp_loop(socket: UdpSocket, ctx: LoopContext) {
    let socket = Arc::new(socket);
    let ctx = Arc::new(ctx);
    let sessions = Arc::new(SessionTable::new(
        ctx.settings.max_udp_sessions,
        ctx.settings.udp_idle_timeout,
        Arc::clone(&ctx.stats),
    ));
    let session_tasks = TaskTracker::new();

    let mut sweep = tokio::time::interval(ctx.settings.udp_sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; ctx.settings.udp_buffer_size];
    let mut fatal = None;

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = sessions.evict_expired().await;
                if evicted > 0 {
                    debug!(instance = %ctx.id, evicted, "Evicted idle UDP sessions");
                }
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    forward_datagram(&buf[..len], peer, &socket, &sessions, &session_tasks, &ctx).await;
                },
                Err(e) if is_fatal_listener_error(&e) => {
                    fatal = Some(e);
                    break;
                },
                // ICMP errors from earlier sends surface here on some platforms.
                Err(e) => debug!(instance = %ctx.id, error = %e, "UDP receive error"),
            },
        }
    }

    sessions.clear().await;
    session_tasks.close();
    session_tasks.wait().await;
    drop(socket);

    match fatal {
        Some(e) => ctx.listener_failed(&e),
        None => debug!(instance = %ctx.id, "UDP listener closed"),
    }
}

async fn forward_datagram(
    data: &[u8],
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    sessions: &Arc<SessionTable>,
    session_tasks: &TaskTracker,
    ctx: &Arc<LoopContext>,
) {
    let session = match sessions.get(&peer).await {
        Some(session) => session,
        None => match open_session(peer, socket, sessions, session_tasks, ctx).await {
            Ok(session) => session,
            Err(e) => {
                ctx.stats.rejected();
                ctx.connection_failed(&e);
                debug!(instance = %ctx.id, peer = %peer, error = %e, "Dropping UDP datagram");
                return;
            },
        },
    };

    if !session.enqueue(data) {
        ctx.stats.connection_error();
        debug!(instance = %ctx.id, peer = %peer, "UDP session queue full, dropping datagram");
    }
}

/// Register a session for `peer` and hand its setup to a task of its own.
async fn open_session(
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    sessions: &Arc<SessionTable>,
    session_tasks: &TaskTracker,
    ctx: &Arc<LoopContext>,
) -> Result<Arc<UdpSession>, RelayError> {
    let (session, queue) = UdpSession::new(peer, ctx.shutdown.child_token());
    let session = Arc::new(session);
    sessions.insert(Arc::clone(&session)).await?;

    session_tasks.spawn(run_session(
        Arc::clone(&session),
        queue,
        Arc::clone(socket),
        Arc::clone(sessions),
        Arc::clone(ctx),
        ctx.stats.open(),
    ));

    Ok(session)
}

/// Resolve the target and connect a fresh upstream socket, trying each
/// resolved address in turn.
pub(crate) async fn connect_upstream(target: &str) -> Result<UdpSocket, RelayError> {
    let dial_failed = |source| RelayError::Dial {
        target: target.to_string(),
        source,
    };

    let mut last_error = None;
    for addr in lookup_host(target).await.map_err(dial_failed)? {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let attempt = async {
            let upstream = UdpSocket::bind(local).await?;
            upstream.connect(addr).await?;
            Ok::<_, io::Error>(upstream)
        };
        match attempt.await {
            Ok(upstream) => return Ok(upstream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(dial_failed(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "target resolved to no addresses")
    })))
}

/// Connect the session upstream, then carry its datagrams both ways until
/// it is cancelled or the upstream socket fails.
async fn run_session(
    session: Arc<UdpSession>,
    queue: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    ctx: Arc<LoopContext>,
    _guard: ActiveConnectionGuard,
) {
    let cancel = session.cancel_token().clone();
    let client = session.client();

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        connected = connect_upstream(&ctx.target) => Some(connected),
    };

    match connected {
        Some(Ok(upstream)) => {
            debug!(instance = %ctx.id, peer = %client, target = %ctx.target, "UDP session opened");
            relay_datagrams(&session, queue, &upstream, &socket, &ctx).await;
        },
        Some(Err(e)) => {
            ctx.stats.dial_failure();
            ctx.connection_failed(&e);
            warn!(instance = %ctx.id, peer = %client, error = %e, "Dial failed");
        },
        None => {},
    }

    sessions.remove_if_same(&session).await;

    let (to_target, to_client) = session.datagrams();
    debug!(
        instance = %ctx.id,
        peer = %client,
        to_target,
        to_client,
        "UDP session closed"
    );
}

async fn relay_datagrams(
    session: &UdpSession,
    mut queue: mpsc::Receiver<Vec<u8>>,
    upstream: &UdpSocket,
    socket: &UdpSocket,
    ctx: &LoopContext,
) {
    let mut buf = vec![0u8; ctx.settings.udp_buffer_size];
    let cancel = session.cancel_token();
    let client = session.client();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outgoing = queue.recv() => {
                let Some(data) = outgoing else { break };
                match upstream.send(&data).await {
                    Ok(sent) => {
                        session.record_to_target();
                        ctx.stats.add_to_target(sent as u64);
                    },
                    Err(e) => {
                        ctx.stats.connection_error();
                        debug!(instance = %ctx.id, peer = %client, error = %e, "Failed to send UDP datagram upstream");
                    },
                }
            },
            received = upstream.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        ctx.stats.connection_error();
                        ctx.connection_failed(&RelayError::Io(e));
                        debug!(instance = %ctx.id, peer = %client, "UDP upstream socket failed");
                        break;
                    },
                };

                if let Err(e) = socket.send_to(&buf[..len], client).await {
                    ctx.stats.connection_error();
                    debug!(instance = %ctx.id, peer = %client, error = %e, "Failed to send UDP reply");
                    break;
                }
                session.record_to_client();
                ctx.stats.add_to_client(len as u64);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::config::{ForwardSettings, ForwardingConfig};
    use crate::forward::instance::{ForwardingInstance, InstanceId};
    use std::time::Duration;

    fn instance(target: &str) -> ForwardingInstance {
        ForwardingInstance::new(
            InstanceId::from_raw(1),
            ForwardingConfig::udp("127.0.0.1:0", target),
            ForwardSettings::default(),
        )
    }

    fn table(ctx: &LoopContext) -> Arc<SessionTable> {
        Arc::new(SessionTable::new(4, Duration::from_secs(60), Arc::clone(&ctx.stats)))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000))
    }

    #[tokio::test]
    async fn test_new_session_does_not_wait_for_upstream_setup() {
        let inst = instance("unresolvable.invalid:53");
        let ctx = Arc::new(inst.loop_context());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sessions = table(&ctx);
        let tasks = TaskTracker::new();

        forward_datagram(b"hello", peer(), &socket, &sessions, &tasks, &ctx).await;

        // Registered with the datagram queued; the session task has not run yet.
        assert_eq!(sessions.len().await, 1);
        assert_eq!(ctx.stats.snapshot().dial_failures, 0);

        // Shutdown abandons the pending lookup.
        ctx.shutdown.cancel();
        tasks.close();
        tokio::time::timeout(Duration::from_secs(1), tasks.wait())
            .await
            .unwrap();
        assert!(sessions.is_empty().await);
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.dial_failures, 0);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_target_fails_only_the_session() {
        let inst = instance("unresolvable.invalid:53");
        let ctx = Arc::new(inst.loop_context());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sessions = table(&ctx);
        let tasks = TaskTracker::new();

        forward_datagram(b"hello", peer(), &socket, &sessions, &tasks, &ctx).await;
        tasks.close();
        tokio::time::timeout(Duration::from_secs(30), tasks.wait())
            .await
            .unwrap();

        assert!(sessions.is_empty().await);
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.dial_failures, 1);
        assert_eq!(snapshot.active_connections, 0);
        assert!(inst.last_error().unwrap().contains("unresolvable.invalid"));
    }

    #[tokio::test]
    async fn test_connect_upstream_to_literal_address() {
        let upstream = connect_upstream("127.0.0.1:9").await.unwrap();
        assert_eq!(
            upstream.peer_addr().unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9))
        );
    }

    #[tokio::test]
    async fn test_connect_upstream_reports_target() {
        let err = connect_upstream("unresolvable.invalid:53").await.unwrap_err();
        assert!(err.is_dial_failure());
        assert!(err.to_string().contains("unresolvable.invalid:53"));
    }

    #[tokio::test]
    async fn test_bind_udp_ephemeral() {
        let (_socket, addr) = bind_udp("127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_udp_in_use() {
        let (_held, addr) = bind_udp("127.0.0.1:0").await.unwrap();
        let err = bind_udp(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, ForwardError::BindFailed { .. }));
    }
}
