//! Bidirectional byte relay between a client and its upstream connection.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::error::RelayError;
use super::stats::ConnectionStats;

/// Bytes moved by one finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    /// Client to target.
    pub to_target: u64,
    /// Target to client.
    pub to_client: u64,
}

#[derive(Clone, Copy)]
enum Direction {
    ToTarget,
    ToClient,
}

/// Relay bytes between `client` and `upstream` until both directions end.
///
/// Each direction runs independently. When one side reaches EOF the write half
/// of the opposite socket is shut down so the peer sees the close. A read or
/// write error aborts both directions. Cancelling `force` closes the relay
/// immediately and yields [`RelayError::Cancelled`].
pub async fn run_relay(
    client: TcpStream,
    upstream: TcpStream,
    buffer_size: usize,
    stats: &ConnectionStats,
    force: &CancellationToken,
) -> Result<RelayTotals, RelayError> {
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let abort = force.child_token();

    let (to_target, to_client) = tokio::join!(
        pump(
            &mut client_read,
            &mut upstream_write,
            buffer_size,
            Direction::ToTarget,
            stats,
            &abort,
        ),
        pump(
            &mut upstream_read,
            &mut client_write,
            buffer_size,
            Direction::ToClient,
            stats,
            &abort,
        ),
    );

    if force.is_cancelled() {
        return Err(RelayError::Cancelled);
    }

    Ok(RelayTotals {
        to_target: to_target?,
        to_client: to_client?,
    })
}

async fn pump(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buffer_size: usize,
    direction: Direction,
    stats: &ConnectionStats,
    abort: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = abort.cancelled() => return Ok(total),
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    abort.cancel();
                    return Err(e);
                },
            },
        };

        if n == 0 {
            // Half-close: let the peer see EOF while the other direction keeps flowing.
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        tokio::select! {
            _ = abort.cancelled() => return Ok(total),
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    abort.cancel();
                    return Err(e);
                }
            },
        }

        total += n as u64;
        match direction {
            Direction::ToTarget => stats.add_to_target(n as u64),
            Direction::ToClient => stats.add_to_client(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_both_directions_and_half_close() {
        // outside <-> [client | relay | upstream] <-> target
        let (mut outside, client) = socket_pair().await;
        let (upstream, mut target) = socket_pair().await;

        let stats = Arc::new(ConnectionStats::new());
        let force = CancellationToken::new();

        let relay_stats = Arc::clone(&stats);
        let relay_force = force.clone();
        let relay = tokio::spawn(async move {
            run_relay(client, upstream, 1024, &relay_stats, &relay_force).await
        });

        outside.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        outside.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client half-closes; target observes EOF but can still answer.
        outside.shutdown().await.unwrap();
        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        target.write_all(b"bye").await.unwrap();
        drop(target);

        let mut tail = Vec::new();
        outside.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"bye");

        let totals = relay.await.unwrap().unwrap();
        assert_eq!(totals.to_target, 4);
        assert_eq!(totals.to_client, 8);
        assert_eq!(stats.snapshot().bytes_to_client, 8);
    }

    #[tokio::test]
    async fn test_relay_force_cancel() {
        let (_outside, client) = socket_pair().await;
        let (upstream, _target) = socket_pair().await;

        let stats = Arc::new(ConnectionStats::new());
        let force = CancellationToken::new();

        let relay_stats = Arc::clone(&stats);
        let relay_force = force.clone();
        let relay = tokio::spawn(async move {
            run_relay(client, upstream, 1024, &relay_stats, &relay_force).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        force.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
